//! `Install`: partitions a target disk from scratch, stages the system
//! image into a new snapshot, installs the bootloader, and persists
//! `InstallState`. Composed from [`crate::partitioner`], [`crate::snapshot`],
//! and [`crate::bootloader`].

use std::path::{Path, PathBuf};

use color_eyre::{eyre::eyre, Result};

use crate::{
	bootloader::{grub::GrubCfgContext, Arch, Bootloader},
	capability::Runner,
	config::Config,
	error::ActionError,
	partitioner,
	spec::{partition::ElementalPartitions, InstallSpec, Partition},
};

fn mountpoint_path(root: &Path, part: &Partition) -> Option<PathBuf> {
	part.mountpoint.as_deref().map(|mp| root.join(mp.trim_start_matches('/')))
}

/// Refuses to proceed against a disk that already carries a recognizable
/// partition signature, unless `force` is set.
fn check_not_already_installed(runner: &dyn Runner, disk: &Path, force: bool) -> Result<()> {
	if force {
		return Ok(());
	}
	let disk_str = disk.display().to_string();
	if crate::capability::run_checked(runner, "blkid", &["-p".to_owned(), disk_str]).is_ok() {
		return Err(ActionError::AlreadyInstalled.into());
	}
	Ok(())
}

/// Rebuilds `layout` with each partition's `device` field populated from
/// `provisioned` (matched by name), so [`partitioner::mount_all`] has
/// device nodes to mount.
fn with_devices(layout: &ElementalPartitions, provisioned: &[Partition]) -> ElementalPartitions {
	let find = |name: &str| provisioned.iter().find(|p| p.name == name).cloned();
	ElementalPartitions {
		bios: layout.bios.as_ref().and_then(|p| find(&p.name)),
		efi: layout.efi.as_ref().and_then(|p| find(&p.name)),
		oem: layout.oem.as_ref().and_then(|p| find(&p.name)),
		state: layout.state.as_ref().and_then(|p| find(&p.name)),
		recovery: layout.recovery.as_ref().and_then(|p| find(&p.name)),
		persistent: layout.persistent.as_ref().and_then(|p| find(&p.name)),
		extra: layout.extra.iter().filter_map(|p| find(&p.name)).collect(),
	}
}

/// Runs the full Install pipeline against `spec`, mutating it in place
/// during `Sanitize()`.
///
/// # Errors
/// Returns whatever [`ActionError`] the failing step raises. Any failure
/// after the snapshot transaction opens and before it closes successfully
/// triggers `Close(failure)` and a best-effort reverse-order unmount before
/// the original error is returned.
#[tracing::instrument(skip(config, spec), fields(disk = %spec.target_disk.display()))]
pub fn install(config: &Config, spec: &mut InstallSpec) -> Result<()> {
	spec.sanitize()?;
	let caps = &config.capabilities;
	let runner = caps.runner.as_ref();
	let fs = caps.filesystem.as_ref();

	check_not_already_installed(runner, &spec.target_disk, spec.force)?;

	super::stage(caps.cloud_init.as_ref(), "before-install", None)?;

	let layout = spec.partitions();
	let install_order = layout.install_order();
	let provisioned = partitioner::partition(runner, &spec.target_disk, &install_order, &config.arch)?;
	let mounted_layout = with_devices(&layout, &provisioned);

	let root_dir = config.work_dir.join("install-root");
	partitioner::mount_all(caps.mounter.as_ref(), fs, &root_dir, &mounted_layout)?;

	let state_part = mounted_layout.state.as_ref().ok_or_else(|| eyre!("state partition missing after mount"))?;
	let state_mount = mountpoint_path(&root_dir, state_part).ok_or_else(|| eyre!("state partition has no mountpoint"))?;

	let snapshotter = crate::snapshot::build(&spec.snapshotter, state_mount.clone(), runner, fs);
	snapshotter.init().map_err(|e| {
		let _ = partitioner::unmount_all(caps.mounter.as_ref(), &root_dir, &mounted_layout);
		e
	})?;
	let tx = snapshotter.start()?;
	let tx_slot = tx.slot;
	let tx_path = tx.path.clone();

	let populate: Result<()> = (|| {
		caps.image_extractor.extract(&spec.system, &tx_path)?;
		for feature in &spec.features {
			caps.feature_installer.install(feature, &tx_path)?;
		}
		super::stage(caps.cloud_init.as_ref(), "after-install-chroot", Some(&tx_path))
	})();

	if let Err(original) = populate {
		let _ = snapshotter.close(tx, false);
		if let Err(unmount_err) = partitioner::unmount_all(caps.mounter.as_ref(), &root_dir, &mounted_layout) {
			tracing::error!(%unmount_err, "errors while unmounting during install failure cleanup");
		}
		return Err(original);
	}

	snapshotter.close(tx, true)?;

	let arch = Arch::from_tag(&config.arch).ok_or_else(|| eyre!("unsupported target architecture: {}", config.arch))?;
	let bootloader = Bootloader::new(runner, fs, caps.efi_vars.as_ref(), arch, true, true);
	let efi_mount = mounted_layout
		.efi
		.as_ref()
		.and_then(|p| mountpoint_path(&root_dir, p))
		.unwrap_or_else(|| root_dir.join("boot/efi"));

	let grub_ctx = GrubCfgContext {
		distro: config.default_grub_entry.clone(),
		volid: spec.state.label.clone(),
		..GrubCfgContext::default()
	};
	bootloader.install(&tx_path, &efi_mount, &grub_ctx)?;
	bootloader.set_default_entry(&state_mount, &tx_path, &spec.grub_default_entry)?;

	let install_state = spec.build_install_state(tx_slot, None);
	let recovery_mount = mounted_layout.recovery.as_ref().and_then(|p| mountpoint_path(&root_dir, p));
	install_state.write_both(
		fs,
		&super::state_yaml_path(&state_mount),
		&super::recovery_yaml_path(recovery_mount.as_deref().unwrap_or(&state_mount)),
	)?;

	super::stage(caps.cloud_init.as_ref(), "after-install", None)?;

	partitioner::unmount_all(caps.mounter.as_ref(), &root_dir, &mounted_layout)?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		capability::{
			mock::{FakeRunner, ScriptedResponse},
			Capabilities,
		},
		spec::{install::new_install_spec, source::ImageSource},
	};

	fn config_with_runner(runner: FakeRunner) -> Config {
		let mut config = Config::defaults();
		config.arch = "x86_64".to_owned();
		config.capabilities = Capabilities {
			runner: Box::new(runner),
			filesystem: config.capabilities.filesystem,
			mounter: config.capabilities.mounter,
			efi_vars: config.capabilities.efi_vars,
			image_extractor: config.capabilities.image_extractor,
			cloud_init: config.capabilities.cloud_init,
			feature_installer: config.capabilities.feature_installer,
		};
		config
	}

	#[test]
	fn full_install_pipeline_succeeds_against_mocks() {
		let runner = FakeRunner::default();
		runner.script("blkid", ScriptedResponse { status_success: false, ..Default::default() });
		let config = config_with_runner(runner);
		let mut spec =
			new_install_spec(&config, "/dev/sda".into(), ImageSource::Oci { reference: "os:latest".to_owned() });

		install(&config, &mut spec).unwrap();
	}

	#[test]
	fn already_installed_disk_is_refused_without_force() {
		// blkid left unscripted -> FakeRunner's default success response,
		// simulating a disk that already carries a partition signature.
		let config = config_with_runner(FakeRunner::default());
		let mut spec =
			new_install_spec(&config, "/dev/sda".into(), ImageSource::Oci { reference: "os:latest".to_owned() });

		let err = install(&config, &mut spec).unwrap_err();
		assert!(err.downcast_ref::<ActionError>().is_some_and(|e| matches!(e, ActionError::AlreadyInstalled)));
	}

	#[test]
	fn force_bypasses_the_already_installed_check() {
		let config = config_with_runner(FakeRunner::default());
		let mut spec =
			new_install_spec(&config, "/dev/sda".into(), ImageSource::Oci { reference: "os:latest".to_owned() });
		spec.force = true;

		install(&config, &mut spec).unwrap();
	}
}
