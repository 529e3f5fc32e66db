//! The deployment-intent resolution and sanitization layer: typed
//! deployment intents (`InstallSpec`, `UpgradeSpec`, ...), the
//! partition/source/state data model they're built from, and the
//! `Sanitize()` rules that turn a partially-populated user spec into a
//! deployment plan with all invariants checked before any destructive
//! action.

pub mod install;
pub mod partition;
pub mod source;
pub mod state;

pub use install::{DiskSpec, Firmware, InstallSpec, IsoSpec, MountSpec, ResetSpec, SnapshotterSpec, UpgradeSpec};
pub use partition::{ElementalPartitions, Partition, PartitionFlag, PartitionRole, PartitionType};
pub use source::{Image, ImageSource, SystemState};
pub use state::{InstallState, PartitionState, Transaction};
