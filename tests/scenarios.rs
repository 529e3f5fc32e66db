//! End-to-end scenario tests covering a blank-disk install, a single
//! upgrade, a multi-upgrade retention sequence, a mid-copy image-fetcher
//! failure, a recovery-seeded reset, and the already-installed refusal —
//! all run entirely against the mock capability set so no real disk or
//! root privileges are needed.

use std::path::Path;

use atomik::{
	actions,
	capability::{mock::FakeRunner, Capabilities},
	config::Config,
	spec::{install::new_install_spec, source::ImageSource, ResetSpec, SnapshotterSpec, UpgradeSpec},
};

fn mock_config() -> Config {
	let mut config = Config::defaults();
	config.arch = "x86_64".to_owned();
	config.capabilities = Capabilities::mock();
	config
}

fn state_mount(config: &Config) -> std::path::PathBuf {
	config.work_dir.join("install-root/run/elemental/state")
}

/// Installing on a blank disk applies the well-known partitions in install
/// order, snapshot slot 1 becomes active, and InstallState is written to
/// both the state and recovery locations with a matching source.
#[test]
fn install_on_a_blank_disk() {
	let config = mock_config();
	let mut spec = new_install_spec(&config, "/dev/sda".into(), ImageSource::Oci { reference: "registry/os:v1".to_owned() });

	actions::install(&config, &mut spec).unwrap();

	let fs = config.capabilities.filesystem.as_ref();
	let runner = config.capabilities.runner.as_ref();
	let state_mount = state_mount(&config);

	let snapshotter = atomik::snapshot::build(&spec.snapshotter, state_mount.clone(), runner, fs);
	assert_eq!(snapshotter.active().unwrap(), Some(1));
	assert_eq!(snapshotter.snapshots().unwrap(), vec![1]);

	let state = atomik::spec::InstallState::load(fs, &state_mount.join(".snapshots/state.yaml")).unwrap();
	assert_eq!(state.active_slot(), Some(1));
	assert_eq!(state.partitions["state"].snapshots[&1].source, "oci://registry/os:v1");
}

/// A single upgrade on top of a fresh install creates slot 2 and moves the
/// active pointer without disturbing slot 1.
#[test]
fn upgrade_creates_a_new_active_slot() {
	let config = mock_config();
	let mut install_spec = new_install_spec(&config, "/dev/sda".into(), ImageSource::Oci { reference: "registry/os:v1".to_owned() });
	actions::install(&config, &mut install_spec).unwrap();

	let state_mount = state_mount(&config);
	let snap_spec = SnapshotterSpec::default();
	let mut upgrade_spec =
		UpgradeSpec { system: ImageSource::Oci { reference: "registry/os:v2".to_owned() }, recovery_upgrade: false, recovery_system: ImageSource::Empty };
	actions::upgrade(&config, &mut upgrade_spec, &snap_spec, &state_mount, None, &config.default_grub_entry).unwrap();

	let runner = config.capabilities.runner.as_ref();
	let fs = config.capabilities.filesystem.as_ref();
	let snapshotter = atomik::snapshot::build(&snap_spec, state_mount.clone(), runner, fs);
	assert_eq!(snapshotter.active().unwrap(), Some(2));
	assert_eq!(snapshotter.snapshots().unwrap(), vec![1, 2]);

	let state = atomik::spec::InstallState::load(fs, &state_mount.join(".snapshots/state.yaml")).unwrap();
	assert_eq!(state.active_slot(), Some(2));
	assert_eq!(state.partitions["state"].snapshots[&2].source, "oci://registry/os:v2");
	assert!(state.partitions["state"].snapshots.contains_key(&1));
}

/// Four consecutive upgrades on top of a one-snapshot install, with
/// retention capped at four, leave exactly the newest four slots and evict
/// slot 1.
#[test]
fn retention_evicts_the_oldest_passive_after_the_limit() {
	let config = mock_config();
	let mut install_spec = new_install_spec(&config, "/dev/sda".into(), ImageSource::Oci { reference: "registry/os:v1".to_owned() });
	actions::install(&config, &mut install_spec).unwrap();

	let state_mount = state_mount(&config);
	let snap_spec = SnapshotterSpec { max_snapshots: 4, ..SnapshotterSpec::default() };
	for version in ["v2", "v3", "v4", "v5"] {
		let mut upgrade_spec = UpgradeSpec {
			system: ImageSource::Oci { reference: format!("registry/os:{version}") },
			recovery_upgrade: false,
			recovery_system: ImageSource::Empty,
		};
		actions::upgrade(&config, &mut upgrade_spec, &snap_spec, &state_mount, None, &config.default_grub_entry).unwrap();
	}

	let runner = config.capabilities.runner.as_ref();
	let fs = config.capabilities.filesystem.as_ref();
	let snapshotter = atomik::snapshot::build(&snap_spec, state_mount, runner, fs);
	assert_eq!(snapshotter.active().unwrap(), Some(5));
	assert_eq!(snapshotter.snapshots().unwrap(), vec![2, 3, 4, 5]);
}

/// A fake `ImageExtractor` that fails for one specific source reference,
/// simulating a mid-copy image-fetcher failure.
#[derive(Debug, Default)]
struct FlakyExtractor {
	fails_on: String,
}

impl atomik::capability::ImageExtractor for FlakyExtractor {
	fn extract(&self, source: &ImageSource, _target: &Path) -> color_eyre::Result<()> {
		if let ImageSource::Oci { reference } = source {
			if reference == &self.fails_on {
				return Err(atomik::error::ActionError::UnpackImage { source: reference.clone(), target: String::new() }.into());
			}
		}
		Ok(())
	}
}

/// An upgrade whose image fetcher fails mid-copy leaves the active
/// snapshot untouched and the new slot absent.
#[test]
fn failed_extract_leaves_the_active_snapshot_untouched() {
	let mut config = mock_config();
	let mut install_spec = new_install_spec(&config, "/dev/sda".into(), ImageSource::Oci { reference: "registry/os:v1".to_owned() });
	actions::install(&config, &mut install_spec).unwrap();

	config.capabilities.image_extractor = Box::new(FlakyExtractor { fails_on: "registry/os:v6".to_owned() });

	let state_mount = state_mount(&config);
	let snap_spec = SnapshotterSpec::default();
	let mut upgrade_spec =
		UpgradeSpec { system: ImageSource::Oci { reference: "registry/os:v6".to_owned() }, recovery_upgrade: false, recovery_system: ImageSource::Empty };
	let err = actions::upgrade(&config, &mut upgrade_spec, &snap_spec, &state_mount, None, &config.default_grub_entry).unwrap_err();

	assert!(err
		.downcast_ref::<atomik::error::ActionError>()
		.is_some_and(|e| matches!(e, atomik::error::ActionError::UnpackImage { .. })));
	assert_eq!(atomik::error::exit_code_for(&err), 66);

	let runner = config.capabilities.runner.as_ref();
	let fs = config.capabilities.filesystem.as_ref();
	let snapshotter = atomik::snapshot::build(&snap_spec, state_mount, runner, fs);
	assert_eq!(snapshotter.active().unwrap(), Some(1));
	assert_eq!(snapshotter.snapshots().unwrap(), vec![1]);
}

/// Reset seeds a fresh snapshot from a recovery-style source on top of an
/// already-installed system; the active pointer moves to the new slot and
/// the previous one is retained (subject to the usual retention limit).
#[test]
fn reset_seeds_a_fresh_snapshot_and_keeps_the_prior_one() {
	let config = mock_config();
	let mut install_spec = new_install_spec(&config, "/dev/sda".into(), ImageSource::Oci { reference: "registry/os:v1".to_owned() });
	actions::install(&config, &mut install_spec).unwrap();

	let state_mount = state_mount(&config);
	let snap_spec = SnapshotterSpec::default();
	let mut reset_spec = ResetSpec { system: ImageSource::File { path: "/oem/recovery.squashfs".into() }, state_mountpoint: state_mount.clone() };
	actions::reset(&config, &mut reset_spec, &snap_spec, &config.default_grub_entry).unwrap();

	let runner = config.capabilities.runner.as_ref();
	let fs = config.capabilities.filesystem.as_ref();
	let snapshotter = atomik::snapshot::build(&snap_spec, state_mount, runner, fs);
	assert_eq!(snapshotter.active().unwrap(), Some(2));
	assert_eq!(snapshotter.snapshots().unwrap(), vec![1, 2]);
}

/// Installing again onto a disk that already carries a recognizable
/// signature is refused with the dedicated exit code before any
/// partitioning is attempted.
#[test]
fn already_installed_disk_is_refused_and_left_untouched() {
	// FakeRunner's default response is `status_success: true`, so an
	// unscripted `blkid -p` probe simulates a disk that already carries a
	// recognizable signature.
	let runner = FakeRunner::default();
	let mut config = Config::defaults();
	config.arch = "x86_64".to_owned();
	config.capabilities = Capabilities { runner: Box::new(runner), ..Capabilities::mock() };
	let mut spec = new_install_spec(&config, "/dev/sda".into(), ImageSource::Oci { reference: "registry/os:v1".to_owned() });

	let err = actions::install(&config, &mut spec).unwrap_err();

	assert!(err
		.downcast_ref::<atomik::error::ActionError>()
		.is_some_and(|e| matches!(e, atomik::error::ActionError::AlreadyInstalled)));
	assert_eq!(atomik::error::exit_code_for(&err), 57);
}
