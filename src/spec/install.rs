//! User-facing deployment specs (`InstallSpec`/`UpgradeSpec`/`ResetSpec`/
//! `DiskSpec`/`IsoSpec`/`MountSpec`) and their `Sanitize()` rules: a struct
//! with `#[serde(default = "...")]` fields resolved against a config,
//! validated and filled in before any destructive step runs.

use serde::{Deserialize, Serialize};

use crate::{
	config::Config,
	error::ActionError,
	spec::{
		partition::{Partition, PartitionFlag, PartitionRole, PartitionType},
		source::ImageSource,
	},
};

/// Firmware mode the target boots under; decides which firmware partition
/// `Sanitize()` must ensure exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Firmware {
	Efi,
	BiosGpt,
	BiosMsdos,
}

impl Default for Firmware {
	fn default() -> Self {
		Self::Efi
	}
}

/// Snapshotter backend selection at the spec-parsing boundary; resolved to
/// a concrete `Box<dyn Snapshotter>` by [`crate::snapshot::build`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotterKind {
	#[default]
	LoopDevice,
	Btrfs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotterSpec {
	pub kind: SnapshotterKind,
	/// Max number of retained snapshots, including the active one.
	pub max_snapshots: u32,
	/// `LoopDevice`-only: size of each snapshot image in MiB.
	pub image_size_mib: u64,
	/// `LoopDevice`-only: `ext4` or `squashfs`.
	pub image_filesystem: String,
}

impl Default for SnapshotterSpec {
	fn default() -> Self {
		Self {
			kind: SnapshotterKind::default(),
			max_snapshots: 4,
			image_size_mib: 8192,
			image_filesystem: "squashfs".to_owned(),
		}
	}
}

const DEFAULT_RECOVERY_LABEL: &str = "COS_RECOVERY";
const DEFAULT_STATE_LABEL: &str = "COS_STATE";
const DEFAULT_OEM_LABEL: &str = "OEM";
const DEFAULT_EFI_LABEL: &str = "EFI";
const MAX_LABEL_LEN: usize = 15;

/// Upper-cases a label and truncates to the 15-char GPT/fat32 label limit,
/// warning if truncation occurred.
fn normalize_label(label: &str) -> String {
	let upper = label.to_uppercase();
	if upper.len() > MAX_LABEL_LEN {
		tracing::warn!(label = upper, max = MAX_LABEL_LEN, "partition label too long, truncating");
		upper.chars().take(MAX_LABEL_LEN).collect()
	} else {
		upper
	}
}

fn default_efi_partition() -> Partition {
	Partition {
		name: "efi".to_owned(),
		role: PartitionRole::Efi,
		label: DEFAULT_EFI_LABEL.to_owned(),
		partition_type: PartitionType::Esp,
		flags: vec![],
		size_mib: 512,
		filesystem: "vfat".to_owned(),
		mountpoint: Some("/boot/efi".to_owned()),
		device: None,
		parent_disk: None,
	}
}

fn default_bios_partition() -> Partition {
	Partition {
		name: "bios".to_owned(),
		role: PartitionRole::Bios,
		label: String::new(),
		partition_type: PartitionType::Guid(
			uuid::Uuid::parse_str("21686148-6449-6e6f-744e-656564454649")
				.expect("bios-boot GUID literal is well-formed"),
		),
		flags: vec![PartitionFlag::NoAuto],
		size_mib: 1,
		filesystem: String::new(),
		mountpoint: None,
		device: None,
		parent_disk: None,
	}
}

fn default_oem_partition() -> Partition {
	Partition {
		name: "oem".to_owned(),
		role: PartitionRole::Oem,
		label: DEFAULT_OEM_LABEL.to_owned(),
		partition_type: PartitionType::LinuxGeneric,
		flags: vec![],
		size_mib: 64,
		filesystem: "ext4".to_owned(),
		mountpoint: Some("/oem".to_owned()),
		device: None,
		parent_disk: None,
	}
}

fn default_state_partition() -> Partition {
	Partition {
		name: "state".to_owned(),
		role: PartitionRole::State,
		label: DEFAULT_STATE_LABEL.to_owned(),
		partition_type: PartitionType::LinuxGeneric,
		flags: vec![],
		size_mib: 8192,
		filesystem: "ext4".to_owned(),
		mountpoint: Some("/run/elemental/state".to_owned()),
		device: None,
		parent_disk: None,
	}
}

fn default_recovery_partition() -> Partition {
	Partition {
		name: "recovery".to_owned(),
		role: PartitionRole::Recovery,
		label: DEFAULT_RECOVERY_LABEL.to_owned(),
		partition_type: PartitionType::LinuxGeneric,
		flags: vec![],
		size_mib: 4096,
		filesystem: "ext4".to_owned(),
		mountpoint: Some("/run/elemental/recovery".to_owned()),
		device: None,
		parent_disk: None,
	}
}

/// An `InstallSpec` in progress: user intent plus defaults, sanitized
/// before any destructive action is taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSpec {
	pub target_disk: std::path::PathBuf,
	pub firmware: Firmware,
	pub system: ImageSource,
	pub recovery_system: ImageSource,
	pub recovery_fs: String,
	pub bios: Option<Partition>,
	pub efi: Option<Partition>,
	pub oem: Partition,
	pub state: Partition,
	pub recovery: Partition,
	pub persistent: Option<Partition>,
	pub extra: Vec<Partition>,
	pub snapshotter: SnapshotterSpec,
	pub grub_default_entry: String,
	/// Named feature bundles to unpack into the new snapshot via
	/// `FeatureInstaller`, e.g. `immutable-rootfs`.
	pub features: Vec<String>,
	pub force: bool,
}

/// Seeds an `InstallSpec` with documented defaults: EFI firmware, the
/// well-known partition set at default sizes/labels, 4-snapshot retention.
#[must_use]
pub fn new_install_spec(config: &Config, target_disk: std::path::PathBuf, system: ImageSource) -> InstallSpec {
	InstallSpec {
		target_disk,
		firmware: Firmware::Efi,
		system,
		recovery_system: ImageSource::Empty,
		recovery_fs: "ext4".to_owned(),
		bios: None,
		efi: Some(default_efi_partition()),
		oem: default_oem_partition(),
		state: default_state_partition(),
		recovery: default_recovery_partition(),
		persistent: None,
		extra: Vec::new(),
		snapshotter: SnapshotterSpec::default(),
		grub_default_entry: config.default_grub_entry.clone(),
		features: Vec::new(),
		force: false,
	}
}

impl InstallSpec {
	/// Validates and mutates the spec in place, applying the documented
	/// install sanitization rules in order. Pure aside from the `&mut self`
	/// mutation — no I/O, no side effects on the target disk.
	///
	/// # Errors
	/// Returns the first violated invariant as an [`ActionError`].
	pub fn sanitize(&mut self) -> color_eyre::Result<()> {
		// 1. Source must not be empty.
		if self.system.is_empty() {
			return Err(ActionError::SourceEmpty.into());
		}

		// 2. State partition must exist (always true here: it's a plain
		// field, not optional) -- still validate it has a mountpoint since a
		// stateless State partition is nonsensical.
		if self.state.mountpoint.is_none() {
			return Err(ActionError::StatePartitionMissing.into());
		}

		// 3. Ensure the correct firmware partition exists for the chosen
		// firmware mode.
		match self.firmware {
			Firmware::Efi => {
				if self.efi.is_none() {
					self.efi = Some(default_efi_partition());
				}
				self.bios = None;
			},
			Firmware::BiosGpt => {
				if self.bios.is_none() {
					self.bios = Some(default_bios_partition());
				}
				self.efi = None;
			},
			Firmware::BiosMsdos => {
				self.efi = None;
				self.bios = None;
				if !self.state.flags.contains(&PartitionFlag::Boot) {
					self.state.flags.push(PartitionFlag::Boot);
				}
			},
		}

		// 4. squashfs recovery has no label.
		if self.recovery_fs == "squashfs" {
			self.recovery.label.clear();
		}

		// 5. At most one extra partition may have size 0; if one does,
		// Persistent.size must be > 0.
		let zero_sized: Vec<&str> =
			self.extra.iter().filter(|p| p.fills_remaining()).map(|p| p.name.as_str()).collect();
		if zero_sized.len() > 1 {
			return Err(ActionError::ExtraPartitionSizeConflict(zero_sized.join(", ")).into());
		}
		if !zero_sized.is_empty() {
			let persistent_ok = self.persistent.as_ref().is_some_and(|p| p.size_mib > 0);
			if !persistent_ok {
				return Err(ActionError::ExtraPartitionSizeConflict(format!(
					"{} fills remaining space but Persistent has no positive size",
					zero_sized.join(", ")
				))
				.into());
			}
		}

		// 6. Upper-case and truncate all labels.
		self.oem.label = normalize_label(&self.oem.label);
		self.state.label = normalize_label(&self.state.label);
		if !self.recovery.label.is_empty() {
			self.recovery.label = normalize_label(&self.recovery.label);
		}
		if let Some(efi) = &mut self.efi {
			efi.label = normalize_label(&efi.label);
		}
		if let Some(persistent) = &mut self.persistent {
			persistent.label = normalize_label(&persistent.label);
		}
		for extra in &mut self.extra {
			extra.label = normalize_label(&extra.label);
		}

		self.partitions().check_no_duplicate_names()?;

		Ok(())
	}

	/// Projects this spec's partitions into the well-known layout type
	/// consumed by the partitioner and bootloader.
	#[must_use]
	pub fn partitions(&self) -> crate::spec::partition::ElementalPartitions {
		crate::spec::partition::ElementalPartitions {
			bios: self.bios.clone(),
			efi: self.efi.clone(),
			oem: Some(self.oem.clone()),
			state: Some(self.state.clone()),
			recovery: Some(self.recovery.clone()),
			persistent: self.persistent.clone(),
			extra: self.extra.clone(),
		}
	}

	/// Projects partition filesystem labels into the map the bootloader
	/// consumes when templating `grub.cfg`.
	#[must_use]
	pub fn grub_labels(&self) -> std::collections::BTreeMap<String, String> {
		self.partitions().all().into_iter().map(|p| (p.name.clone(), p.label.clone())).collect()
	}

	/// `spec.BuildInstallState()`: projects this spec plus the freshly
	/// closed snapshot slot into the persisted `InstallState` record.
	#[must_use]
	pub fn build_install_state(&self, active_slot: u32, digest: Option<String>) -> crate::spec::state::InstallState {
		use std::collections::BTreeMap;

		use crate::spec::{source::SystemState, state::PartitionState};

		let mut partitions = BTreeMap::new();
		partitions.insert("oem".to_owned(), PartitionState { fs_label: self.oem.label.clone(), ..Default::default() });

		let mut snapshots = BTreeMap::new();
		snapshots.insert(
			active_slot,
			SystemState {
				source: self.system.to_uri(),
				label: self.state.label.clone(),
				filesystem: self.snapshotter.image_filesystem.clone(),
				digest: digest.unwrap_or_default(),
				labels: BTreeMap::new(),
			},
		);
		partitions.insert(
			"state".to_owned(),
			PartitionState { fs_label: self.state.label.clone(), snapshots, recovery_image: None, active: Some(active_slot) },
		);

		if !self.recovery_system.is_empty() {
			partitions.insert(
				"recovery".to_owned(),
				PartitionState {
					fs_label: self.recovery.label.clone(),
					snapshots: BTreeMap::new(),
					recovery_image: Some(SystemState {
						source: self.recovery_system.to_uri(),
						label: self.recovery.label.clone(),
						filesystem: self.recovery_fs.clone(),
						digest: String::new(),
						labels: BTreeMap::new(),
					}),
					active: None,
				},
			);
		}

		crate::spec::state::InstallState {
			date: crate::spec::state::now_iso8601(),
			snapshotter: self.snapshotter.clone(),
			partitions,
		}
	}
}

/// Upgrade: re-runs the snapshotter against a running system's existing
/// partition layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeSpec {
	pub system: ImageSource,
	pub recovery_upgrade: bool,
	pub recovery_system: ImageSource,
}

impl UpgradeSpec {
	/// If `recovery_upgrade` is set and no recovery source was given, copy
	/// the system source into it.
	pub fn sanitize(&mut self) -> color_eyre::Result<()> {
		if self.system.is_empty() {
			return Err(ActionError::SourceEmpty.into());
		}
		if self.recovery_upgrade && self.recovery_system.is_empty() {
			self.recovery_system = self.system.clone();
		}
		Ok(())
	}

	/// Merges a freshly-closed snapshot slot into `existing`'s State
	/// partition record (and, if `recovery_upgrade`, its Recovery record),
	/// preserving every other slot and partition entry already present.
	#[must_use]
	pub fn build_install_state(
		&self, existing: crate::spec::state::InstallState, snapshotter: &SnapshotterSpec, active_slot: u32,
		digest: Option<String>,
	) -> crate::spec::state::InstallState {
		use crate::spec::source::SystemState;

		let mut state = existing;
		state.snapshotter = snapshotter.clone();

		let state_part = state.partitions.entry("state".to_owned()).or_default();
		state_part.snapshots.insert(
			active_slot,
			SystemState {
				source: self.system.to_uri(),
				label: state_part.fs_label.clone(),
				filesystem: snapshotter.image_filesystem.clone(),
				digest: digest.unwrap_or_default(),
				labels: std::collections::BTreeMap::new(),
			},
		);
		state_part.active = Some(active_slot);

		if self.recovery_upgrade {
			let recovery_part = state.partitions.entry("recovery".to_owned()).or_default();
			recovery_part.recovery_image = Some(SystemState {
				source: self.recovery_system.to_uri(),
				label: recovery_part.fs_label.clone(),
				filesystem: String::new(),
				digest: String::new(),
				labels: std::collections::BTreeMap::new(),
			});
		}

		state.date = crate::spec::state::now_iso8601();
		state
	}
}

/// Reset: reinstalls `system` into a fresh snapshot on an already-deployed
/// State partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetSpec {
	pub system: ImageSource,
	pub state_mountpoint: std::path::PathBuf,
}

impl ResetSpec {
	pub fn sanitize(&mut self) -> color_eyre::Result<()> {
		if self.system.is_empty() {
			return Err(ActionError::SourceEmpty.into());
		}
		if self.state_mountpoint.as_os_str().is_empty() {
			return Err(ActionError::StatePartitionMissing.into());
		}
		Ok(())
	}

	/// Merges a freshly-closed snapshot slot into `existing`'s State
	/// partition record, preserving every other slot and partition entry
	/// already present.
	#[must_use]
	pub fn build_install_state(
		&self, existing: crate::spec::state::InstallState, snapshotter: &SnapshotterSpec, active_slot: u32,
		digest: Option<String>,
	) -> crate::spec::state::InstallState {
		use crate::spec::source::SystemState;

		let mut state = existing;
		state.snapshotter = snapshotter.clone();

		let state_part = state.partitions.entry("state".to_owned()).or_default();
		state_part.snapshots.insert(
			active_slot,
			SystemState {
				source: self.system.to_uri(),
				label: state_part.fs_label.clone(),
				filesystem: snapshotter.image_filesystem.clone(),
				digest: digest.unwrap_or_default(),
				labels: std::collections::BTreeMap::new(),
			},
		);
		state_part.active = Some(active_slot);

		state.date = crate::spec::state::now_iso8601();
		state
	}
}

/// BuildDisk: produces a raw/qcow2-style disk image file instead of
/// installing onto a real device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSpec {
	pub install: InstallSpec,
	pub output_file: std::path::PathBuf,
	pub disk_size_mib: u64,
}

impl DiskSpec {
	pub fn sanitize(&mut self) -> color_eyre::Result<()> {
		self.install.sanitize()
	}
}

/// BuildISO: produces a bootable ISO9660 image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsoSpec {
	pub system: ImageSource,
	pub output_file: std::path::PathBuf,
	pub volume_id: String,
}

impl IsoSpec {
	pub fn sanitize(&mut self) -> color_eyre::Result<()> {
		if self.system.is_empty() {
			return Err(ActionError::SourceEmpty.into());
		}
		if self.volume_id.len() > 32 {
			self.volume_id.truncate(32);
		}
		Ok(())
	}
}

/// Mount: mounts an already-installed target's partitions at a working
/// root, without running any lifecycle action (used by maintenance tools).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
	pub target_disk: std::path::PathBuf,
	pub root: std::path::PathBuf,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cfg() -> Config {
		Config::defaults()
	}

	#[test]
	fn sanitize_rejects_empty_source() {
		let mut spec = new_install_spec(&cfg(), "/dev/sda".into(), ImageSource::Empty);
		assert!(spec.sanitize().is_err());
	}

	#[test]
	fn sanitize_creates_efi_partition_when_missing() {
		let mut spec = new_install_spec(&cfg(), "/dev/sda".into(), ImageSource::Oci { reference: "x:latest".into() });
		spec.efi = None;
		spec.sanitize().unwrap();
		assert!(spec.efi.is_some());
		assert!(spec.bios.is_none());
	}

	#[test]
	fn sanitize_sets_boot_flag_for_bios_msdos() {
		let mut spec = new_install_spec(&cfg(), "/dev/sda".into(), ImageSource::Oci { reference: "x:latest".into() });
		spec.firmware = Firmware::BiosMsdos;
		spec.sanitize().unwrap();
		assert!(spec.efi.is_none());
		assert!(spec.bios.is_none());
		assert!(spec.state.flags.contains(&PartitionFlag::Boot));
	}

	#[test]
	fn sanitize_clears_squashfs_recovery_label() {
		let mut spec = new_install_spec(&cfg(), "/dev/sda".into(), ImageSource::Oci { reference: "x:latest".into() });
		spec.recovery_fs = "squashfs".to_owned();
		spec.sanitize().unwrap();
		assert!(spec.recovery.label.is_empty());
	}

	#[test]
	fn sanitize_rejects_two_zero_sized_extras() {
		let mut spec = new_install_spec(&cfg(), "/dev/sda".into(), ImageSource::Oci { reference: "x:latest".into() });
		let mut extra1 = default_oem_partition();
		extra1.name = "extra1".to_owned();
		extra1.size_mib = 0;
		let mut extra2 = default_oem_partition();
		extra2.name = "extra2".to_owned();
		extra2.size_mib = 0;
		spec.extra = vec![extra1, extra2];
		assert!(spec.sanitize().is_err());
	}

	#[test]
	fn sanitize_requires_positive_persistent_size_with_zero_sized_extra() {
		let mut spec = new_install_spec(&cfg(), "/dev/sda".into(), ImageSource::Oci { reference: "x:latest".into() });
		let mut extra = default_oem_partition();
		extra.name = "extra".to_owned();
		extra.size_mib = 0;
		spec.extra = vec![extra];
		assert!(spec.sanitize().is_err());

		let mut persistent = default_oem_partition();
		persistent.name = "persistent".to_owned();
		persistent.size_mib = 1024;
		spec.persistent = Some(persistent);
		spec.sanitize().unwrap();
	}

	#[test]
	fn labels_are_uppercased_and_truncated() {
		let mut spec = new_install_spec(&cfg(), "/dev/sda".into(), ImageSource::Oci { reference: "x:latest".into() });
		spec.oem.label = "a-very-long-partition-label-indeed".to_owned();
		spec.sanitize().unwrap();
		assert_eq!(spec.oem.label.len(), MAX_LABEL_LEN);
		assert_eq!(spec.oem.label, spec.oem.label.to_uppercase());
	}

	#[test]
	fn upgrade_copies_system_into_recovery_when_requested() {
		let mut spec = UpgradeSpec {
			system: ImageSource::Oci { reference: "x:latest".into() },
			recovery_upgrade: true,
			recovery_system: ImageSource::Empty,
		};
		spec.sanitize().unwrap();
		assert_eq!(spec.recovery_system, spec.system);
	}
}
