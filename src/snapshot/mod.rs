//! The snapshotter — the core atomicity primitive: a one-method-per-step
//! trait with a backend module per storage scheme, maintaining N versioned
//! root trees under a state mountpoint with atomic activation.

pub mod btrfs;
pub mod loopdevice;

use std::path::PathBuf;

use color_eyre::Result;

use crate::{
	capability::{Filesystem, Runner},
	error::ActionError,
	spec::{install::SnapshotterKind, state::Transaction, SnapshotterSpec},
};

/// Implemented by both snapshotter backends. State machine per
/// transaction:
///
/// ```text
///  idle --Start--> preparing --writer populates--> closing --Close(success)--> idle (new active)
///                     |                                  |
///                     |                                  +-Close(failure)--> idle (old active)
///                     +-Init fails--> idle (no change)
/// ```
pub trait Snapshotter {
	/// Idempotent: on first call creates the `.snapshots/` scaffold;
	/// subsequent calls no-op. Also repairs a corrupted active pointer
	/// from the highest-numbered intact snapshot, and garbage-collects any
	/// `<slot>/` working directory left behind by a crash between `Start`
	/// and `Close`.
	///
	/// # Errors
	/// Returns [`ActionError::SnapshotterInit`] on failure.
	fn init(&self) -> Result<()>;

	/// Allocates the next slot number (max existing + 1) and prepares an
	/// empty working directory for it. Per the resolved Open Question, the
	/// working directory always starts empty -- the image fetcher
	/// populates it from scratch, regardless of backend.
	///
	/// # Errors
	/// Returns [`ActionError::SnapshotterStart`] on failure.
	fn start(&self) -> Result<Transaction>;

	/// On success: atomically swaps the active pointer to `tx.slot`, then
	/// runs retention (evicts oldest passives until count <= `max_snaps`,
	/// but never evicts below 1 passive + 1 active). On failure: removes
	/// `tx`'s working directory, leaves the active pointer unchanged.
	///
	/// # Errors
	/// Returns [`ActionError::SnapshotterClose`] on failure.
	fn close(&self, tx: Transaction, success: bool) -> Result<()>;

	/// Removes a snapshot unless it is the active one.
	///
	/// # Errors
	/// Returns [`ActionError::DeleteActiveSnapshot`] if `slot` is active.
	fn delete_snapshot(&self, slot: u32) -> Result<()>;

	/// All snapshot slots, ascending.
	fn snapshots(&self) -> Result<Vec<u32>>;

	/// The currently active slot, if any.
    fn active(&self) -> Result<Option<u32>>;

	/// A source URI for `slot`'s content, usable to seed another
	/// snapshotter (e.g. `RecoverySystem.Source = System.Source`).
	fn snapshot_image_to_source(&self, slot: u32) -> Result<crate::spec::source::ImageSource>;
}

/// Builds the concrete `Snapshotter` named by `spec.kind`, rooted at
/// `state_mount` (the mounted State partition).
#[must_use]
pub fn build<'a>(
	spec: &SnapshotterSpec, state_mount: PathBuf, runner: &'a dyn Runner, fs: &'a dyn Filesystem,
) -> Box<dyn Snapshotter + 'a> {
	match spec.kind {
		SnapshotterKind::LoopDevice => {
			Box::new(loopdevice::LoopDeviceSnapshotter::new(state_mount, spec.clone(), runner, fs))
		},
		SnapshotterKind::Btrfs => Box::new(btrfs::BtrfsSnapshotter::new(state_mount, spec.clone(), runner, fs)),
	}
}

/// Computes which passive (non-active) slots to evict so the total count
/// (including the active one) is at most `max_snaps`, oldest first. Never
/// evicts the active slot, and never reduces the passive count below 1
/// when only one passive exists (the retention policy's documented
/// "allowed to exceed N by one" exception).
#[must_use]
pub fn slots_to_evict(all_slots: &[u32], active: u32, max_snaps: u32) -> Vec<u32> {
	let mut passives: Vec<u32> = all_slots.iter().copied().filter(|s| *s != active).collect();
	passives.sort_unstable();
	let total = passives.len() as u32 + 1;
	if total <= max_snaps {
		return Vec::new();
	}
	let to_remove = (total - max_snaps) as usize;
	if passives.len() <= 1 {
		return Vec::new();
	}
	let max_removable = passives.len() - 1;
	passives.into_iter().take(to_remove.min(max_removable)).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn evicts_oldest_passives_first() {
		let evicted = slots_to_evict(&[1, 2, 3, 4, 5], 5, 3);
		assert_eq!(evicted, vec![1, 2]);
	}

	#[test]
	fn never_evicts_below_one_passive() {
		let evicted = slots_to_evict(&[1, 2], 2, 1);
		assert!(evicted.is_empty());
	}

	#[test]
	fn no_eviction_when_under_the_limit() {
		assert!(slots_to_evict(&[1, 2], 2, 4).is_empty());
	}
}
