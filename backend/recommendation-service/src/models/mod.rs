use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub type UserId = String;
pub type ItemId = String;

/// Ranked `(item_id, score)` pairs, highest score first
pub type ScoredItems = Vec<(ItemId, f64)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionKind {
    Play,
    Like,
    Collect,
    Share,
}

impl InteractionKind {
    fn bit(self) -> u8 {
        match self {
            InteractionKind::Play => 0b0001,
            InteractionKind::Like => 0b0010,
            InteractionKind::Collect => 0b0100,
            InteractionKind::Share => 0b1000,
        }
    }
}

/// Set of interaction kinds, packed into one byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KindSet(u8);

impl KindSet {
    pub fn insert(&mut self, kind: InteractionKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(&self, kind: InteractionKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

impl FromIterator<InteractionKind> for KindSet {
    fn from_iter<I: IntoIterator<Item = InteractionKind>>(iter: I) -> Self {
        let mut set = KindSet::default();
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

/// One row of the interaction log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRow {
    pub user_id: UserId,
    pub item_id: ItemId,
    #[serde(default)]
    pub play_count: u32,
    #[serde(default)]
    pub kinds: Vec<InteractionKind>,
}

/// One row of the item feature table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub item_id: ItemId,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub popularity: f64,
    #[serde(default)]
    pub features: Vec<f64>,
    #[serde(default)]
    pub tier: Option<PopularityTier>,
}

/// One row of the user feature table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,
    #[serde(default)]
    pub top_categories: Vec<String>,
    #[serde(default = "default_popularity_bias")]
    pub popularity_bias: f64,
}

fn default_popularity_bias() -> f64 {
    0.5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PopularityTier {
    Hit,
    Popular,
    Normal,
}

impl PopularityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PopularityTier::Hit => "hit",
            PopularityTier::Popular => "popular",
            PopularityTier::Normal => "normal",
        }
    }
}

/// Derived per-request view of a user, never stored
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserProfile {
    pub known_interactions: usize,
    pub top_categories: Vec<String>,
    /// 0.0 = niche taste, 1.0 = prefers hits
    pub popularity_bias: Option<f64>,
}

impl UserProfile {
    pub fn has_preferences(&self) -> bool {
        !self.top_categories.is_empty() || self.popularity_bias.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub item_id: ItemId,
    pub score: f64,
    pub is_cold_start: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorKind {
    ItemCf,
    UserCf,
    Content,
    Latent,
}

impl GeneratorKind {
    pub const ALL: [GeneratorKind; 4] = [
        GeneratorKind::ItemCf,
        GeneratorKind::UserCf,
        GeneratorKind::Content,
        GeneratorKind::Latent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GeneratorKind::ItemCf => "item_cf",
            GeneratorKind::UserCf => "user_cf",
            GeneratorKind::Content => "content",
            GeneratorKind::Latent => "latent",
        }
    }
}

impl fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which path `recommend` takes: full hybrid fusion or one forced generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AlgorithmSelector {
    #[default]
    Hybrid,
    Single(GeneratorKind),
}

impl AlgorithmSelector {
    pub fn generator(&self) -> Option<GeneratorKind> {
        match self {
            AlgorithmSelector::Hybrid => None,
            AlgorithmSelector::Single(kind) => Some(*kind),
        }
    }
}

impl FromStr for AlgorithmSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match normalized.as_str() {
            "" | "hybrid" => Ok(AlgorithmSelector::Hybrid),
            "itemcf" => Ok(AlgorithmSelector::Single(GeneratorKind::ItemCf)),
            "usercf" => Ok(AlgorithmSelector::Single(GeneratorKind::UserCf)),
            "content" => Ok(AlgorithmSelector::Single(GeneratorKind::Content)),
            "latent" | "svd" => Ok(AlgorithmSelector::Single(GeneratorKind::Latent)),
            _ => Err(format!("unknown algorithm selector: {}", s)),
        }
    }
}

impl fmt::Display for AlgorithmSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmSelector::Hybrid => f.write_str("hybrid"),
            AlgorithmSelector::Single(kind) => write!(f, "{}", kind),
        }
    }
}

/// `id -> [(neighbor_id, score)]`, each list sorted descending, capped and free
/// of self-references. Immutable once built for an epoch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeighborTable {
    lists: HashMap<String, ScoredItems>,
    k: usize,
}

impl NeighborTable {
    pub fn new(k: usize) -> Self {
        Self {
            lists: HashMap::new(),
            k,
        }
    }

    /// Insert a list for `id`. Self-references are removed, the list is
    /// sorted (ties by id) and truncated to `k`; an empty result is not stored.
    pub fn insert(&mut self, id: impl Into<String>, mut neighbors: ScoredItems) {
        let id = id.into();
        neighbors.retain(|(other, score)| *other != id && score.is_finite());
        crate::utils::sort_scored(&mut neighbors);
        neighbors.truncate(self.k);
        if !neighbors.is_empty() {
            self.lists.insert(id, neighbors);
        }
    }

    pub fn get(&self, id: &str) -> &[(ItemId, f64)] {
        self.lists.get(id).map(|l| l.as_slice()).unwrap_or(&[])
    }

    /// Score of `other` in `id`'s list, if present
    pub fn score(&self, id: &str, other: &str) -> Option<f64> {
        self.get(id)
            .iter()
            .find(|(candidate, _)| candidate == other)
            .map(|(_, score)| *score)
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ScoredItems)> {
        self.lists.iter()
    }
}
