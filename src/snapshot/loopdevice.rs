//! The `LoopDevice` snapshotter backend: one image file per slot under
//! `<state>/.snapshots/<slot>/snapshot.img`, activated by rewriting an
//! `active` symlink via rename(2). Stages each slot into a directory first,
//! then packs it, in a numbered-slot scheme with retention.

use std::path::{Path, PathBuf};

use color_eyre::{eyre::eyre, Result};

use super::Snapshotter;
use crate::{
	capability::{Filesystem, Runner},
	cmd,
	error::ActionError,
	spec::{install::SnapshotterSpec, source::ImageSource, state::Transaction},
};

const SNAPSHOTS_DIR: &str = ".snapshots";
const IMAGE_FILE: &str = "snapshot.img";
const STAGING_DIR: &str = "rootfs";
const ACTIVE_LINK: &str = "active";
const PASSIVES_DIR: &str = "passives";

pub struct LoopDeviceSnapshotter<'a> {
	state_mount: PathBuf,
	spec: SnapshotterSpec,
	runner: &'a dyn Runner,
	fs: &'a dyn Filesystem,
}

impl<'a> LoopDeviceSnapshotter<'a> {
	#[must_use]
	pub fn new(state_mount: PathBuf, spec: SnapshotterSpec, runner: &'a dyn Runner, fs: &'a dyn Filesystem) -> Self {
		Self { state_mount, spec, runner, fs }
	}

	fn root(&self) -> PathBuf {
		self.state_mount.join(SNAPSHOTS_DIR)
	}

	fn slot_dir(&self, slot: u32) -> PathBuf {
		self.root().join(slot.to_string())
	}

	fn image_path(&self, slot: u32) -> PathBuf {
		self.slot_dir(slot).join(IMAGE_FILE)
	}

	fn active_link(&self) -> PathBuf {
		self.root().join(ACTIVE_LINK)
	}

	fn passives_dir(&self) -> PathBuf {
		self.root().join(PASSIVES_DIR)
	}

	/// Rewrites the `active` symlink to point at `slot`, via a temp-link +
	/// rename so the pointer is never observably missing.
	fn activate(&self, slot: u32) -> Result<()> {
		let tmp = self.root().join(format!("active.tmp.{slot}"));
		if self.fs.exists(&tmp) {
			self.fs.remove_file(&tmp)?;
		}
		self.fs.symlink(Path::new(&slot.to_string()), &tmp)?;
		self.fs.rename(&tmp, &self.active_link())?;
		let passive_link = self.passives_dir().join(slot.to_string());
		if self.fs.exists(&passive_link) {
			self.fs.remove_file(&passive_link)?;
		}
		Ok(())
	}

	fn run_retention(&self) -> Result<()> {
		let Some(active) = self.active()? else { return Ok(()) };
		let all = self.snapshots()?;
		for slot in super::slots_to_evict(&all, active, self.spec.max_snapshots) {
			self.delete_snapshot(slot)?;
		}
		Ok(())
	}
}

impl Snapshotter for LoopDeviceSnapshotter<'_> {
	fn init(&self) -> Result<()> {
		self.fs.create_dir_all(&self.root()).map_err(|_| ActionError::SnapshotterInit)?;
		self.fs.create_dir_all(&self.passives_dir()).map_err(|_| ActionError::SnapshotterInit)?;

		// Crash recovery: a slot directory with no finished image means Start
		// ran but Close never did.
		for entry in self.fs.read_dir(&self.root()).unwrap_or_default() {
			if let Some(slot) = entry.file_name().and_then(|n| n.to_str()).and_then(|s| s.parse::<u32>().ok()) {
				if !self.fs.exists(&self.image_path(slot)) {
					let _ = self.fs.remove_dir_all(&self.slot_dir(slot));
				}
			}
		}

		if self.active()?.is_none() {
			if let Some(max_slot) = self.snapshots()?.into_iter().max() {
				self.activate(max_slot).map_err(|_| ActionError::SnapshotterInit)?;
			}
		}
		Ok(())
	}

	fn start(&self) -> Result<Transaction> {
		let next = self.snapshots()?.into_iter().max().unwrap_or(0) + 1;
		let dir = self.slot_dir(next);
		self.fs.create_dir_all(&dir.join(STAGING_DIR)).map_err(|_| ActionError::SnapshotterStart)?;
		Ok(Transaction { slot: next, path: dir, in_progress: true })
	}

	fn close(&self, tx: Transaction, success: bool) -> Result<()> {
		if !success {
			let _ = self.fs.remove_dir_all(&tx.path);
			return Ok(());
		}

		let image = self.image_path(tx.slot);
		let staging = tx.path.join(STAGING_DIR);
		if self.spec.image_filesystem == "squashfs" {
			cmd!(self.runner, "mksquashfs", staging.display().to_string(), image.display().to_string(), "-noappend")
				.map_err(|_| ActionError::SnapshotterClose(tx.slot))?;
		} else {
			cmd!(self.runner, "truncate", "-s", format!("{}M", self.spec.image_size_mib), image.display().to_string())
				.map_err(|_| ActionError::SnapshotterClose(tx.slot))?;
			cmd!(self.runner, format!("mkfs.{}", self.spec.image_filesystem), image.display().to_string())
				.map_err(|_| ActionError::SnapshotterClose(tx.slot))?;
		}

		let previous_active = self.active()?;
		self.activate(tx.slot).map_err(|_| ActionError::SnapshotterClose(tx.slot))?;
		if let Some(prev) = previous_active {
			if prev != tx.slot {
				let link = self.passives_dir().join(prev.to_string());
				let _ = self.fs.symlink(Path::new("..").join(prev.to_string()).as_path(), &link);
			}
		}
		self.run_retention()?;
		Ok(())
	}

	fn delete_snapshot(&self, slot: u32) -> Result<()> {
		if self.active()? == Some(slot) {
			return Err(ActionError::DeleteActiveSnapshot(slot).into());
		}
		self.fs.remove_dir_all(&self.slot_dir(slot))?;
		let _ = self.fs.remove_file(&self.passives_dir().join(slot.to_string()));
		Ok(())
	}

	fn snapshots(&self) -> Result<Vec<u32>> {
		let mut out: Vec<u32> = self
			.fs
			.read_dir(&self.root())
			.unwrap_or_default()
			.into_iter()
			.filter_map(|p| p.file_name().and_then(|n| n.to_str()).and_then(|s| s.parse::<u32>().ok()))
			.filter(|slot| self.fs.exists(&self.image_path(*slot)))
			.collect();
		out.sort_unstable();
		Ok(out)
	}

	fn active(&self) -> Result<Option<u32>> {
		if !self.fs.exists(&self.active_link()) {
			return Ok(None);
		}
		let target = self.fs.read_link(&self.active_link())?;
		Ok(target.file_name().and_then(|n| n.to_str()).and_then(|s| s.parse::<u32>().ok()))
	}

	fn snapshot_image_to_source(&self, slot: u32) -> Result<ImageSource> {
		if !self.snapshots()?.contains(&slot) {
			return Err(eyre!("no such snapshot: {slot}"));
		}
		Ok(ImageSource::File { path: self.image_path(slot) })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::capability::mock::{FakeFilesystem, FakeRunner};

	fn snapper<'a>(fs: &'a FakeFilesystem, runner: &'a FakeRunner) -> LoopDeviceSnapshotter<'a> {
		LoopDeviceSnapshotter::new(PathBuf::from("/state"), SnapshotterSpec::default(), runner, fs)
	}

	#[test]
	fn start_then_close_activates_the_new_slot() {
		let fs = FakeFilesystem::default();
		let runner = FakeRunner::default();
		let snap = snapper(&fs, &runner);
		snap.init().unwrap();

		let tx = snap.start().unwrap();
		assert_eq!(tx.slot, 1);
		snap.close(tx, true).unwrap();

		assert_eq!(snap.active().unwrap(), Some(1));
		assert_eq!(snap.snapshots().unwrap(), vec![1]);
	}

	#[test]
	fn failed_close_leaves_previous_active_slot_in_place() {
		let fs = FakeFilesystem::default();
		let runner = FakeRunner::default();
		let snap = snapper(&fs, &runner);
		snap.init().unwrap();
		snap.close(snap.start().unwrap(), true).unwrap();

		let tx2 = snap.start().unwrap();
		assert_eq!(tx2.slot, 2);
		snap.close(tx2, false).unwrap();

		assert_eq!(snap.active().unwrap(), Some(1));
		assert_eq!(snap.snapshots().unwrap(), vec![1]);
	}

	#[test]
	fn delete_snapshot_refuses_the_active_slot() {
		let fs = FakeFilesystem::default();
		let runner = FakeRunner::default();
		let snap = snapper(&fs, &runner);
		snap.init().unwrap();
		snap.close(snap.start().unwrap(), true).unwrap();

		assert!(snap.delete_snapshot(1).is_err());
	}

	#[test]
	fn retention_evicts_oldest_passive_beyond_max_snapshots() {
		let fs = FakeFilesystem::default();
		let runner = FakeRunner::default();
		let mut spec = SnapshotterSpec::default();
		spec.max_snapshots = 2;
		let snap = LoopDeviceSnapshotter::new(PathBuf::from("/state"), spec, &runner, &fs);
		snap.init().unwrap();
		for _ in 0..3 {
			let tx = snap.start().unwrap();
			snap.close(tx, true).unwrap();
		}
		assert_eq!(snap.snapshots().unwrap(), vec![2, 3]);
	}
}
