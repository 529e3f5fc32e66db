//! `Reset`: reinstalls `spec.system` into a fresh snapshot on an
//! already-deployed State partition, without touching the partition table.
//! Uses the same transaction shape as [`super::upgrade::upgrade`],
//! specialized to `ResetSpec`'s single `state_mountpoint` field.

use std::path::Path;

use color_eyre::{eyre::eyre, Result};

use crate::{
	bootloader::{Arch, Bootloader},
	config::Config,
	spec::{install::SnapshotterSpec, state::InstallState, ResetSpec},
};

/// Runs the Reset pipeline against an already-deployed State partition.
///
/// # Errors
/// Returns whatever error the failing step raises; any failure after the
/// transaction opens and before `Close(success)` triggers `Close(failure)`.
#[tracing::instrument(skip(config, spec))]
pub fn reset(config: &Config, spec: &mut ResetSpec, snapshotter_spec: &SnapshotterSpec, grub_default_entry: &str) -> Result<()> {
	spec.sanitize()?;
	let caps = &config.capabilities;
	let runner = caps.runner.as_ref();
	let fs = caps.filesystem.as_ref();

	super::stage(caps.cloud_init.as_ref(), "before-reset", None)?;

	let snapshotter = crate::snapshot::build(snapshotter_spec, spec.state_mountpoint.clone(), runner, fs);
	snapshotter.init()?;
	let tx = snapshotter.start()?;
	let tx_slot = tx.slot;
	let tx_path = tx.path.clone();

	let populate: Result<()> = (|| {
		caps.image_extractor.extract(&spec.system, &tx_path)?;
		super::stage(caps.cloud_init.as_ref(), "after-reset-chroot", Some(&tx_path))
	})();

	if let Err(original) = populate {
		let _ = snapshotter.close(tx, false);
		return Err(original);
	}
	snapshotter.close(tx, true)?;

	let arch = Arch::from_tag(&config.arch).ok_or_else(|| eyre!("unsupported target architecture: {}", config.arch))?;
	let bootloader = Bootloader::new(runner, fs, caps.efi_vars.as_ref(), arch, false, false);
	bootloader.set_default_entry(&spec.state_mountpoint, &tx_path, grub_default_entry)?;

	let state_yaml = super::state_yaml_path(&spec.state_mountpoint);
	let recovery_yaml = super::recovery_yaml_path(&spec.state_mountpoint);
	let existing = InstallState::load_authoritative(fs, &state_yaml, &recovery_yaml)
		.unwrap_or_else(|_| InstallState::empty(snapshotter_spec.clone()));
	let install_state = spec.build_install_state(existing, snapshotter_spec, tx_slot, None);
	install_state.write_both(fs, &state_yaml, &recovery_yaml)?;

	super::stage(caps.cloud_init.as_ref(), "after-reset", None)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{capability::Capabilities, spec::source::ImageSource};

	#[test]
	fn reset_reinstalls_into_a_fresh_snapshot() {
		let mut config = Config::defaults();
		config.capabilities = Capabilities::mock();
		config.arch = "x86_64".to_owned();
		let mut spec = ResetSpec { system: ImageSource::Oci { reference: "os:2".to_owned() }, state_mountpoint: "/state".into() };
		let snap_spec = SnapshotterSpec::default();

		reset(&config, &mut spec, &snap_spec, "Linux").unwrap();

		let snapshotter =
			crate::snapshot::build(&snap_spec, "/state".into(), config.capabilities.runner.as_ref(), config.capabilities.filesystem.as_ref());
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
