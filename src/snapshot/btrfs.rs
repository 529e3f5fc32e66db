//! The `Btrfs` snapshotter backend: one subvolume per slot under
//! `<state>/.snapshots/<slot>`, activated via `btrfs subvolume set-default`
//! plus a marker file recording which slot is active (subvolume defaults
//! aren't otherwise queryable without a live btrfs mount in tests). Mirrors
//! [`super::loopdevice`]'s staging-then-activate shape, swapping image
//! packing for subvolume commands.

use std::path::PathBuf;

use color_eyre::{eyre::eyre, Result};

use super::Snapshotter;
use crate::{
	capability::{Filesystem, Runner},
	cmd,
	error::ActionError,
	spec::{install::SnapshotterSpec, source::ImageSource, state::Transaction},
};

const SNAPSHOTS_DIR: &str = ".snapshots";
const ACTIVE_MARKER: &str = "active";

pub struct BtrfsSnapshotter<'a> {
	state_mount: PathBuf,
	spec: SnapshotterSpec,
	runner: &'a dyn Runner,
	fs: &'a dyn Filesystem,
}

impl<'a> BtrfsSnapshotter<'a> {
	#[must_use]
	pub fn new(state_mount: PathBuf, spec: SnapshotterSpec, runner: &'a dyn Runner, fs: &'a dyn Filesystem) -> Self {
		Self { state_mount, spec, runner, fs }
	}

	fn root(&self) -> PathBuf {
		self.state_mount.join(SNAPSHOTS_DIR)
	}

	fn slot_path(&self, slot: u32) -> PathBuf {
		self.root().join(slot.to_string())
	}

	fn active_marker(&self) -> PathBuf {
		self.root().join(ACTIVE_MARKER)
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

impl Snapshotter for BtrfsSnapshotter<'_> {
	fn init(&self) -> Result<()> {
		self.fs.create_dir_all(&self.root()).map_err(|_| ActionError::SnapshotterInit)?;
		if self.active()?.is_none() {
			if let Some(max_slot) = self.snapshots()?.into_iter().max() {
				self.fs
					.write_atomic(&self.active_marker(), &max_slot.to_string())
					.map_err(|_| ActionError::SnapshotterInit)?;
			}
		}
		Ok(())
	}

	fn start(&self) -> Result<Transaction> {
		let next = self.snapshots()?.into_iter().max().unwrap_or(0) + 1;
		let path = self.slot_path(next);
		cmd!(self.runner, "btrfs", "subvolume", "create", path.display().to_string())
			.map_err(|_| ActionError::SnapshotterStart)?;
		// `btrfs subvolume create` makes the directory entry on a real host;
		// mirror that so bookkeeping (`snapshots()`) sees it without a live
		// btrfs mount.
		self.fs.create_dir_all(&path).map_err(|_| ActionError::SnapshotterStart)?;
		Ok(Transaction { slot: next, path, in_progress: true })
	}

	fn close(&self, tx: Transaction, success: bool) -> Result<()> {
		if !success {
			let _ = cmd!(self.runner, "btrfs", "subvolume", "delete", tx.path.display().to_string());
			let _ = self.fs.remove_dir_all(&tx.path);
			return Ok(());
		}

		cmd!(self.runner, "btrfs", "subvolume", "set-default", tx.path.display().to_string())
			.map_err(|_| ActionError::SnapshotterClose(tx.slot))?;
		self.fs
			.write_atomic(&self.active_marker(), &tx.slot.to_string())
			.map_err(|_| ActionError::SnapshotterClose(tx.slot))?;
		self.run_retention()?;
		Ok(())
	}

	fn delete_snapshot(&self, slot: u32) -> Result<()> {
		if self.active()? == Some(slot) {
			return Err(ActionError::DeleteActiveSnapshot(slot).into());
		}
		cmd!(self.runner, "btrfs", "subvolume", "delete", self.slot_path(slot).display().to_string())?;
		let _ = self.fs.remove_dir_all(&self.slot_path(slot));
		Ok(())
	}

	fn snapshots(&self) -> Result<Vec<u32>> {
		let mut out: Vec<u32> = self
			.fs
			.read_dir(&self.root())
			.unwrap_or_default()
			.into_iter()
			.filter_map(|p| p.file_name().and_then(|n| n.to_str()).and_then(|s| s.parse::<u32>().ok()))
			.collect();
		out.sort_unstable();
		Ok(out)
	}

	fn active(&self) -> Result<Option<u32>> {
		if !self.fs.exists(&self.active_marker()) {
			return Ok(None);
		}
		let raw = self.fs.read_to_string(&self.active_marker())?;
		Ok(raw.trim().parse::<u32>().ok())
	}

	fn snapshot_image_to_source(&self, slot: u32) -> Result<ImageSource> {
		if !self.snapshots()?.contains(&slot) {
			return Err(eyre!("no such snapshot: {slot}"));
		}
		Ok(ImageSource::Dir { path: self.slot_path(slot) })
	}
}
