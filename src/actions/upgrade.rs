//! `Upgrade`: re-runs the snapshotter against an already-mounted running
//! system's State (and optionally Recovery) partition, using the same
//! Start/Close transaction shape [`super::install::install`] uses,
//! simplified since the target is already partitioned and mounted.

use std::path::Path;

use color_eyre::{eyre::eyre, Result};

use crate::{
	bootloader::{Arch, Bootloader},
	config::Config,
	spec::{install::SnapshotterSpec, state::InstallState, UpgradeSpec},
};

/// Runs the Upgrade pipeline: opens a new snapshot transaction on
/// `state_mount`, extracts `spec.system` into it, closes it, and sets it as
/// the default boot entry. If `spec.recovery_upgrade`, also overwrites
/// `recovery_mount` directly (the recovery partition holds a single image,
/// not a versioned snapshot history).
///
/// # Errors
/// Returns whatever error the failing step raises; any failure after the
/// transaction opens and before `Close(success)` triggers `Close(failure)`.
#[tracing::instrument(skip(config, spec))]
pub fn upgrade(
	config: &Config, spec: &mut UpgradeSpec, snapshotter_spec: &SnapshotterSpec, state_mount: &Path,
	recovery_mount: Option<&Path>, grub_default_entry: &str,
) -> Result<()> {
	spec.sanitize()?;
	let caps = &config.capabilities;
	let runner = caps.runner.as_ref();
	let fs = caps.filesystem.as_ref();

	super::stage(caps.cloud_init.as_ref(), "before-upgrade", None)?;

	let snapshotter = crate::snapshot::build(snapshotter_spec, state_mount.to_path_buf(), runner, fs);
	snapshotter.init()?;
	let tx = snapshotter.start()?;
	let tx_slot = tx.slot;
	let tx_path = tx.path.clone();

	let populate: Result<()> = (|| {
		caps.image_extractor.extract(&spec.system, &tx_path)?;
		super::stage(caps.cloud_init.as_ref(), "after-upgrade-chroot", Some(&tx_path))
	})();

	if let Err(original) = populate {
		let _ = snapshotter.close(tx, false);
		return Err(original);
	}
	snapshotter.close(tx, true)?;

	if spec.recovery_upgrade {
		if let Some(recovery_mount) = recovery_mount {
			caps.image_extractor.extract(&spec.recovery_system, recovery_mount)?;
		}
	}

	let arch = Arch::from_tag(&config.arch).ok_or_else(|| eyre!("unsupported target architecture: {}", config.arch))?;
	let bootloader = Bootloader::new(runner, fs, caps.efi_vars.as_ref(), arch, false, false);
	bootloader.set_default_entry(state_mount, &tx_path, grub_default_entry)?;

	let state_yaml = super::state_yaml_path(state_mount);
	let recovery_yaml = super::recovery_yaml_path(recovery_mount.unwrap_or(state_mount));
	let existing = InstallState::load_authoritative(fs, &state_yaml, &recovery_yaml)
		.unwrap_or_else(|_| InstallState::empty(snapshotter_spec.clone()));
	let install_state = spec.build_install_state(existing, snapshotter_spec, tx_slot, None);
	install_state.write_both(fs, &state_yaml, &recovery_yaml)?;

	super::stage(caps.cloud_init.as_ref(), "after-upgrade", None)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{capability::Capabilities, config::Config, spec::source::ImageSource};

	#[test]
	fn upgrade_opens_and_closes_a_new_snapshot() {
		let mut config = Config::defaults();
		config.capabilities = Capabilities::mock();
		config.arch = "x86_64".to_owned();
		let mut spec =
			UpgradeSpec { system: ImageSource::Oci { reference: "os:2".to_owned() }, recovery_upgrade: false, recovery_system: ImageSource::Empty };
		let snap_spec = SnapshotterSpec::default();

		upgrade(&config, &mut spec, &snap_spec, Path::new("/state"), None, "Linux").unwrap();

		let snapshotter = crate::snapshot::build(&snap_spec, "/state".into(), config.capabilities.runner.as_ref(), config.capabilities.filesystem.as_ref());
		assert_eq!(snapshotter.active().unwrap(), Some(1));

		let fs = config.capabilities.filesystem.as_ref();
		let state = InstallState::load_authoritative(
			fs,
			&super::super::state_yaml_path(Path::new("/state")),
			&super::super::recovery_yaml_path(Path::new("/state")),
		)
		.unwrap();
		assert_eq!(state.active_slot(), Some(1));
	}
}
