//! Orchestration layer: each user-facing lifecycle action composes the
//! spec/partitioner/snapshot/bootloader components above plus the external
//! collaborators (image fetcher, cloud-init executor, feature installer)
//! into one script, with stage hooks running around a fixed pipeline of
//! steps.

pub mod build_disk;
pub mod build_iso;
pub mod install;
pub mod reset;
pub mod upgrade;

use std::path::{Path, PathBuf};

use color_eyre::Result;

use crate::capability::CloudInitExecutor;

pub(crate) const STATE_YAML_PATH: &str = ".snapshots/state.yaml";
pub(crate) const RECOVERY_YAML_PATH: &str = "state.yaml";

/// Runs a named cloud-init stage through `config`'s executor, logging but
/// not failing the whole action if the stage itself is absent: a missing
/// hook script is a no-op, not an error.
pub(crate) fn stage(cloud_init: &dyn CloudInitExecutor, name: &str, chroot: Option<&Path>) -> Result<()> {
	tracing::info!(stage = name, ?chroot, "running lifecycle stage");
	cloud_init.run_stage(name, chroot)
}

pub(crate) fn state_yaml_path(state_mount: &Path) -> PathBuf {
	state_mount.join(STATE_YAML_PATH)
}

pub(crate) fn recovery_yaml_path(recovery_mount: &Path) -> PathBuf {
	recovery_mount.join(RECOVERY_YAML_PATH)
}

pub use build_disk::build_disk;
pub use build_iso::build_iso;
pub use install::install;
pub use reset::reset;
pub use upgrade::upgrade;
