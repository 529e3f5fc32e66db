//! The partitioning and filesystem provisioning layer: `Partition`/
//! `Format`/`Mount`/`Unmount`/`Discover` operating through the
//! `Runner`/`Mounter` capabilities, with `parted`/`sgdisk`-style invocation,
//! GPT type-GUID setting, and start/end-offset bookkeeping for sequential
//! partition creation.

use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, trace};

use crate::{
	capability::{Filesystem, Mounter, Runner},
	cmd,
	error::ActionError,
	spec::partition::{ElementalPartitions, Partition},
};

/// For `/dev/mmcblk0`, `/dev/nvme0n1`, `/dev/loop0`-style device names the
/// partition suffix is `pN`; for `/dev/sda`-style names it's just `N`.
#[must_use]
pub fn partition_device_name(disk: &str, index: usize) -> String {
	let sep = if disk.starts_with("/dev/mmcblk") || disk.starts_with("/dev/nvme") || disk.starts_with("/dev/loop") {
		"p"
	} else {
		""
	};
	format!("{disk}{sep}{index}")
}

/// Best-effort deactivation of mapped devices (LVM, dm-crypt, md, loop)
/// layered on top of `disk`, run before repartitioning. Failure is logged
/// but not fatal -- a genuinely busy disk will re-fail at `partition()`.
pub fn deactivate_all(runner: &dyn Runner, disk: &Path) {
	let disk_display = disk.display().to_string();
	let steps: [(&str, Vec<String>); 3] = [
		("vgchange", vec!["-an".to_owned()]),
		("cryptsetup", vec!["close".to_owned(), disk_display.clone()]),
		("losetup", vec!["-d".to_owned(), disk_display.clone()]),
	];
	for (program, args) in steps {
		if let Err(err) = crate::capability::run_checked(runner, program, &args) {
			trace!(?err, program, "deactivate-all step failed (best effort, continuing)");
		}
	}
}

/// Writes a GPT table to `disk` with `partitions` (already in install
/// order: fixed-size first, the single size-0 partition last), then
/// formats each one. Idempotent only insofar as re-running against an
/// identical layout produces the same device names; it does not detect
/// "already partitioned" (that's `Discover`'s job).
///
/// # Errors
/// Returns [`ActionError::PartitioningDevice`] if `parted`/`sgdisk` fail,
/// or [`ActionError::FormatPartition`] if `mkfs` fails for a partition.
pub fn partition(runner: &dyn Runner, disk: &Path, partitions: &[&Partition], target_arch: &str) -> Result<Vec<Partition>> {
	info!(?disk, "applying partition layout to disk");
	let disk_str = disk.to_string_lossy().to_string();

	cmd!(runner, "parted", "-s", disk_str.clone(), "mklabel", "gpt")
		.map_err(|_| ActionError::PartitioningDevice(disk_str.clone()))?;

	let mut provisioned = Vec::with_capacity(partitions.len());
	let mut last_end_bytes: u64 = 0;
	for (i, part) in partitions.iter().enumerate() {
		let index = i + 1;
		let devname = partition_device_name(&disk_str, index);
		trace!(devname, index, name = %part.name, "creating partition");

		let start = if index == 1 { "1MiB".to_owned() } else { mib_string(last_end_bytes) };
		let end = if part.fills_remaining() {
			"100%".to_owned()
		} else {
			last_end_bytes += part.size().as_u64();
			mib_string(last_end_bytes)
		};

		debug!(start, end, "creating partition");
		cmd!(runner, "parted", "-s", disk_str.clone(), "mkpart", "primary", start, end)
			.map_err(|_| ActionError::PartitioningDevice(disk_str.clone()))?;

		let type_guid = part.partition_type.guid(target_arch)?;
		cmd!(runner, "sgdisk", "-t", format!("{index}:{type_guid}"), disk_str.clone())
			.map_err(|_| ActionError::PartitioningDevice(disk_str.clone()))?;

		for flag in &part.flags {
			if let Some(position) = flag.bit_position() {
				cmd!(runner, "sgdisk", "-A", format!("{index}:set:{position}"), disk_str.clone())
					.map_err(|_| ActionError::PartitioningDevice(disk_str.clone()))?;
			}
		}

		if !part.label.is_empty() {
			cmd!(runner, "parted", "-s", disk_str.clone(), "name", index.to_string(), part.label.clone())
				.map_err(|_| ActionError::PartitioningDevice(disk_str.clone()))?;
		}

		let _ = cmd!(runner, "partprobe");

		let mut provisioned_part = (*part).clone();
		provisioned_part.device = Some(devname.clone());
		provisioned_part.parent_disk = Some(disk_str.clone());
		format_partition(runner, &provisioned_part)?;
		provisioned.push(provisioned_part);
	}

	Ok(provisioned)
}

fn mib_string(bytes: u64) -> String {
	ByteSize::b(bytes).to_string_as(true).replace(' ', "")
}

/// Formats a single already-provisioned partition with the correct `mkfs`
/// tool. `squashfs` partitions are skipped here -- their content is
/// written and a squashfs image built by the snapshotter, not formatted in
/// place.
///
/// # Errors
/// Returns [`ActionError::FormatPartition`] if `mkfs` fails, or an error
/// if the partition has no device node yet.
pub fn format_partition(runner: &dyn Runner, part: &Partition) -> Result<()> {
	if part.filesystem.is_empty() || part.filesystem == "squashfs" {
		return Ok(());
	}
	let devname = part.device.as_deref().ok_or_else(|| eyre!("partition {} has no device node yet", part.name))?;
	debug!(fs = part.filesystem, devname, "formatting partition");
	let result = if part.filesystem == "vfat" {
		cmd!(runner, "mkfs.fat", "-F32", "-n", part.label.clone(), devname.to_owned())
	} else {
		cmd!(runner, format!("mkfs.{}", part.filesystem), "-L", part.label.clone(), devname.to_owned())
	};
	result.map_err(|_| {
		ActionError::FormatPartition { name: part.name.clone(), filesystem: part.filesystem.clone() }.into()
	})
}

/// Mounts a single partition at its configured mountpoint (relative to
/// `root`).
///
/// # Errors
/// Returns [`ActionError::MountPartition`] on failure.
pub fn mount(mounter: &dyn Mounter, fs: &dyn Filesystem, root: &Path, part: &Partition) -> Result<PathBuf> {
	let Some(mountpoint) = &part.mountpoint else {
		return Err(eyre!("partition {} has no mountpoint configured", part.name));
	};
	let devname = part.device.as_deref().ok_or_else(|| eyre!("partition {} has no device node yet", part.name))?;
	let target = root.join(mountpoint.trim_start_matches('/'));
	fs.create_dir_all(&target)?;
	let fstype = if part.filesystem == "vfat" { "vfat" } else { part.filesystem.as_str() };
	mounter.mount(devname, &target, fstype).map_err(|_| {
		ActionError::MountPartition { name: part.name.clone(), mountpoint: target.display().to_string() }.into()
	})?;
	Ok(target)
}

/// Unmounts a single partition previously mounted under `root`.
pub fn unmount(mounter: &dyn Mounter, root: &Path, part: &Partition) -> Result<()> {
	let Some(mountpoint) = &part.mountpoint else { return Ok(()) };
	let target = root.join(mountpoint.trim_start_matches('/'));
	mounter.unmount(&target).map_err(|_| {
		ActionError::UnmountPartition { name: part.name.clone(), mountpoint: target.display().to_string() }.into()
	})
}

/// Mounts every partition in `layout` at `root`, in mount order
/// (shallowest mountpoint first). On failure, unmounts whatever was
/// already mounted, in reverse order, before propagating the original
/// error.
pub fn mount_all(mounter: &dyn Mounter, fs: &dyn Filesystem, root: &Path, layout: &ElementalPartitions) -> Result<()> {
	let mut mounted = Vec::new();
	for part in layout.mount_order() {
		match mount(mounter, fs, root, part) {
			Ok(_) => mounted.push(part),
			Err(err) => {
				for part in mounted.into_iter().rev() {
					let _ = unmount(mounter, root, part);
				}
				return Err(err);
			},
		}
	}
	Ok(())
}

/// Unmounts every currently-mounted partition in `layout` in reverse mount
/// order, aggregating (but not stopping on) individual failures.
pub fn unmount_all(mounter: &dyn Mounter, root: &Path, layout: &ElementalPartitions) -> Result<()> {
	let mut errors = Vec::new();
	for part in layout.unmount_order() {
		if let Err(err) = unmount(mounter, root, part) {
			errors.push(format!("{}: {err}", part.name));
		}
	}
	if errors.is_empty() {
		Ok(())
	} else {
		Err(eyre!("errors while unmounting: {}", errors.join("; ")))
	}
}

/// One partition as read back from an already-partitioned disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPartition {
	/// Full device node path, e.g. `/dev/sda1`.
	pub device: String,
	pub label: String,
	pub filesystem: String,
	pub mountpoint: Option<String>,
}

/// The actual on-disk layout of a disk, as read back by [`discover`] and
/// queryable by filesystem label or device name.
#[derive(Debug, Clone, Default)]
pub struct PartitionList {
	entries: Vec<DiscoveredPartition>,
}

impl PartitionList {
	#[must_use]
	pub fn entries(&self) -> &[DiscoveredPartition] {
		&self.entries
	}

	#[must_use]
	pub fn by_label(&self, label: &str) -> Option<&DiscoveredPartition> {
		self.entries.iter().find(|p| p.label == label)
	}

	#[must_use]
	pub fn by_name(&self, device: &str) -> Option<&DiscoveredPartition> {
		self.entries.iter().find(|p| p.device == device)
	}
}

/// Reads the kernel-exposed device tree for `disk` via `lsblk` and assembles
/// a [`PartitionList`], queryable by label and by device name. Unlike
/// [`partition`], this never writes anything — it is how a caller learns
/// whether a disk is already laid out the way it expects.
///
/// # Errors
/// Returns [`ActionError::PartitioningDevice`] if `lsblk` fails to run or
/// exits non-zero.
pub fn discover(runner: &dyn Runner, disk: &Path) -> Result<PartitionList> {
	let disk_str = disk.to_string_lossy().to_string();
	trace!(?disk, "discovering existing partition layout");
	let out = crate::capability::run_checked(
		runner,
		"lsblk",
		&["-rno".to_owned(), "NAME,LABEL,FSTYPE,MOUNTPOINT".to_owned(), disk_str.clone()],
	)
	.map_err(|_| ActionError::PartitioningDevice(disk_str))?;

	let mut entries = Vec::new();
	for line in out.lines() {
		let mut fields = line.splitn(4, ' ');
		let Some(name) = fields.next().filter(|n| !n.is_empty()) else { continue };
		let label = fields.next().unwrap_or_default().to_owned();
		let filesystem = fields.next().unwrap_or_default().to_owned();
		let mountpoint = fields.next().filter(|m| !m.is_empty()).map(ToOwned::to_owned);
		entries.push(DiscoveredPartition { device: format!("/dev/{name}"), label, filesystem, mountpoint });
	}
	Ok(PartitionList { entries })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::capability::mock::{FakeFilesystem, FakeMounter, FakeRunner, ScriptedResponse};
	use crate::spec::partition::{PartitionRole, PartitionType};

	fn part(name: &str, mountpoint: &str) -> Partition {
		Partition {
			name: name.to_owned(),
			role: PartitionRole::Oem,
			label: name.to_uppercase(),
			partition_type: PartitionType::LinuxGeneric,
			flags: vec![],
			size_mib: 100,
			filesystem: "ext4".to_owned(),
			mountpoint: Some(mountpoint.to_owned()),
			device: Some("/dev/sda1".to_owned()),
			parent_disk: Some("/dev/sda".to_owned()),
		}
	}

	#[test]
	fn partition_device_name_adds_p_for_nvme_and_loop() {
		assert_eq!(partition_device_name("/dev/sda", 1), "/dev/sda1");
		assert_eq!(partition_device_name("/dev/nvme0n1", 2), "/dev/nvme0n1p2");
		assert_eq!(partition_device_name("/dev/loop0", 1), "/dev/loop0p1");
	}

	#[test]
	fn mount_all_unwinds_on_failure() {
		let mounter = FakeMounter::default();
		let fs = FakeFilesystem::default();
		let mut layout = ElementalPartitions::default();
		layout.oem = Some(part("oem", "/oem"));
		mount_all(&mounter, &fs, Path::new("/root"), &layout).unwrap();
		assert_eq!(mounter.mounted().len(), 1);
		unmount_all(&mounter, Path::new("/root"), &layout).unwrap();
		assert!(mounter.mounted().is_empty());
	}

	#[test]
	fn format_partition_skips_squashfs() {
		let runner = FakeRunner::default();
		let mut p = part("recovery", "/run/elemental/recovery");
		p.filesystem = "squashfs".to_owned();
		format_partition(&runner, &p).unwrap();
		assert!(runner.calls().is_empty());
	}

	#[test]
	fn discover_parses_lsblk_output_by_label_and_name() {
		let runner = FakeRunner::default();
		runner.script(
			"lsblk",
			ScriptedResponse {
				stdout: "sda1 EFI vfat /boot/efi\nsda2 COS_STATE ext4 \nsda3  ext4 /oem\n".to_owned(),
				..Default::default()
			},
		);

		let layout = discover(&runner, Path::new("/dev/sda")).unwrap();

		assert_eq!(layout.entries().len(), 3);
		let efi = layout.by_label("EFI").unwrap();
		assert_eq!(efi.device, "/dev/sda1");
		assert_eq!(efi.mountpoint.as_deref(), Some("/boot/efi"));

		let state = layout.by_name("/dev/sda2").unwrap();
		assert_eq!(state.label, "COS_STATE");
		assert!(state.mountpoint.is_none());
	}

	#[test]
	fn discover_fails_when_lsblk_fails() {
		let runner = FakeRunner::default();
		runner.script("lsblk", ScriptedResponse { status_success: false, ..Default::default() });
		assert!(discover(&runner, Path::new("/dev/sda")).is_err());
	}
}
