// ============================================
// Background Jobs Module
// ============================================
//
// Contains background job runners for:
// 1. Epoch refresh (snapshot change detection + copy-on-build swap)
//
// Jobs are spawned by the service binary and stop on the shared shutdown
// signal.

pub mod epoch_refresh;

pub use epoch_refresh::{spawn_epoch_refresh, EpochRefreshConfig, EpochRefreshJob, RefreshStats};
