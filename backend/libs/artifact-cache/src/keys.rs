//! Artifact key schema
//!
//! Key format: v{SCHEMA_VERSION}:{epoch_id}:{kind}
//!
//! Every artifact of an epoch lives under that epoch's id, so a new epoch never
//! reads or overwrites an older epoch's entries.

/// Cache schema version - increment when changing the envelope or any cached
/// artifact layout. Entries written under another version are ignored.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub epoch_id: String,
    pub kind: String,
}

impl ArtifactKey {
    pub fn new(epoch_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            epoch_id: epoch_id.into(),
            kind: kind.into(),
        }
    }

    /// Format: v1:{epoch_id}:{kind}
    pub fn storage_key(&self) -> String {
        format!("v{}:{}:{}", SCHEMA_VERSION, self.epoch_id, self.kind)
    }

    /// Pattern covering all artifacts of one epoch
    pub fn epoch_prefix(epoch_id: &str) -> String {
        format!("v{}:{}:", SCHEMA_VERSION, epoch_id)
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.storage_key())
    }
}
