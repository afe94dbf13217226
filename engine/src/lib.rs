//! RMIDB engine: a two-stage recursive model index over an ordered key set.
//!
//! A root linear model routes a key to one of many segment models; each
//! segment predicts the key's rank together with an exact error bound, and
//! a binary search inside that window finds the entry. The models are
//! rebuilt lazily from the backing store after writes and published as
//! immutable snapshots, so readers never block on a rebuild.

pub mod adaptive;
pub mod config;
pub mod error;
pub mod index;
pub mod maintenance;
pub mod metrics;
pub mod persistence;
pub mod rmi_core;
pub mod store;
pub mod telemetry;
pub mod trainer;

/// Search key.
pub type Key = i64;
/// Opaque location of an entry in the backing store.
pub type Position = u64;

pub use adaptive::{AdaptiveIndex, SegmentErrorStats};
pub use config::{AdaptiveConfig, LearnedIndexConfig, LogFormat, LogLevel, LoggingConfig, MaintenanceConfig};
pub use error::{IndexError, Result};
pub use index::{IndexState, IndexStats, LearnedIndex};
pub use maintenance::{spawn_background_refresh, spawn_configured_refresh};
pub use persistence::ModelManifest;
pub use rmi_core::{Hit, IndexSnapshot, LinearModel, RangeIter, RootModel, SearchOutcome};
pub use store::{BackingStore, MemoryStore};
pub use trainer::{PartitionKind, PartitionStrategy, Trainer};
