//! `InstallState`, the persisted, authoritative install record, and the
//! `Transaction` type used by the snapshotter. Uses an atomic-write,
//! newer-timestamp-wins scheme when reconciling the state and recovery
//! copies.

use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
	capability::Filesystem,
	error::ActionError,
	spec::{install::SnapshotterSpec, source::SystemState},
};

/// State of one well-known partition inside `InstallState`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PartitionState {
	#[serde(rename = "fs-label")]
	pub fs_label: String,
	/// State-partition only: slot number -> installed root.
	#[serde(default)]
	pub snapshots: BTreeMap<u32, SystemState>,
	/// Recovery-partition only.
	#[serde(rename = "recovery-image", default)]
	pub recovery_image: Option<SystemState>,
	/// Which slot is currently active (state partition only).
	#[serde(default)]
	pub active: Option<u32>,
}

/// The persisted, authoritative install record, written as YAML to
/// `/.snapshots/state.yaml` on the state partition and `/state.yaml` on
/// the recovery partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallState {
	/// ISO8601 timestamp; used to pick the authoritative copy when the two
	/// on-disk locations have diverged.
	pub date: String,
	pub snapshotter: SnapshotterSpec,
	#[serde(default)]
	pub partitions: BTreeMap<String, PartitionState>,
}

impl InstallState {
	/// Loads an `InstallState` from `path` via `fs`, tolerating missing
	/// optional fields by relying on serde defaults and applying the
	/// documented fallback labels (`recovery.fs-label = COS_RECOVERY`,
	/// `state.fs-label = COS_STATE`) when a partition entry is present but
	/// its label is empty. Unknown fields are accepted silently by
	/// `serde_yaml`'s default behavior (matching the "permissive loader"
	/// design note).
	pub fn load(fs: &dyn Filesystem, path: &Path) -> color_eyre::Result<Self> {
		let raw = fs
			.read_to_string(path)
			.map_err(|_| ActionError::InstallStateRead(path.display().to_string()))?;
		let mut state: Self = serde_yaml::from_str(&raw)
			.map_err(|_| ActionError::InstallStateRead(path.display().to_string()))?;
		if let Some(recovery) = state.partitions.get_mut("recovery") {
			if recovery.fs_label.is_empty() {
				recovery.fs_label = "COS_RECOVERY".to_owned();
			}
		}
		if let Some(s) = state.partitions.get_mut("state") {
			if s.fs_label.is_empty() {
				s.fs_label = "COS_STATE".to_owned();
			}
		}
		Ok(state)
	}

	/// Writes this state atomically (temp-write, then rename) via `fs`.
	pub fn write(&self, fs: &dyn Filesystem, path: &Path) -> color_eyre::Result<()> {
		let yaml = serde_yaml::to_string(self)
			.map_err(|_| ActionError::InstallStateWrite(path.display().to_string()))?;
		fs.write_atomic(path, &yaml)
			.map_err(|_| ActionError::InstallStateWrite(path.display().to_string()).into())
	}

	/// Writes this state to both the state-partition and recovery-partition
	/// locations. The two writes are *not* globally atomic; on partial
	/// failure the caller should still treat whichever file succeeded as
	/// valid (the load path resolves divergence by newer `date`).
	pub fn write_both(&self, fs: &dyn Filesystem, state_path: &Path, recovery_path: &Path) -> color_eyre::Result<()> {
		self.write(fs, state_path)?;
		self.write(fs, recovery_path)?;
		Ok(())
	}

	/// Loads both copies and returns the one with the newer `date`,
	/// tolerating either being missing/corrupt (falls back to the other).
	pub fn load_authoritative(
		fs: &dyn Filesystem, state_path: &Path, recovery_path: &Path,
	) -> color_eyre::Result<Self> {
		let state = Self::load(fs, state_path).ok();
		let recovery = Self::load(fs, recovery_path).ok();
		match (state, recovery) {
			(Some(s), Some(r)) => Ok(if s.date >= r.date { s } else { r }),
			(Some(s), None) => Ok(s),
			(None, Some(r)) => Ok(r),
			(None, None) => Err(ActionError::InstallStateRead(state_path.display().to_string()).into()),
		}
	}

	/// The currently active slot for the state partition, if recorded.
	#[must_use]
	pub fn active_slot(&self) -> Option<u32> {
		self.partitions.get("state").and_then(|p| p.active)
	}

	/// A blank record with no partitions recorded yet, used when Upgrade
	/// or Reset runs against a target with no prior `InstallState` to merge
	/// into.
	#[must_use]
	pub fn empty(snapshotter: SnapshotterSpec) -> Self {
		Self { date: now_iso8601(), snapshotter, partitions: BTreeMap::new() }
	}
}

/// An in-flight Snapshotter operation. Lifetime: created by `Start`,
/// concluded by `Close`. Only one transaction per snapshotter may exist at
/// a time (enforced by the snapshotter, not this type).
#[derive(Debug, Clone)]
pub struct Transaction {
	pub slot: u32,
	pub path: std::path::PathBuf,
	pub in_progress: bool,
}

/// Formats the current time as a lexically-sortable, RFC3339-shaped UTC
/// timestamp (no external time crate is in the dependency stack, so this
/// lands directly on `SystemTime` and Howard Hinnant's civil-from-days
/// algorithm rather than pulling one in).
#[must_use]
pub fn now_iso8601() -> String {
	let secs = std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map_or(0, |d| d.as_secs());
	let days = secs / 86_400;
	let time_of_day = secs % 86_400;
	let (year, month, day) = civil_from_days(days as i64);
	let (hour, minute, second) = (time_of_day / 3600, (time_of_day / 60) % 60, time_of_day % 60);
	format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}Z")
}

/// <http://howardhinnant.github.io/date_algorithms.html#civil_from_days>,
/// days since the Unix epoch to a proleptic-Gregorian (year, month, day).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
	let z = z + 719_468;
	let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
	let doe = (z - era * 146_097) as u64;
	let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
	let y = yoe as i64 + era * 400;
	let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
	let mp = (5 * doy + 2) / 153;
	let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
	let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
	(if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
mod civil_tests {
	use super::civil_from_days;

	#[test]
	fn epoch_is_1970_01_01() {
		assert_eq!(civil_from_days(0), (1970, 1, 1));
	}

	#[test]
	fn known_date_round_trips() {
		// 2024-01-01 is 19723 days after the epoch.
		assert_eq!(civil_from_days(19_723), (2024, 1, 1));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::capability::mock::FakeFilesystem;

	fn sample() -> InstallState {
		let mut partitions = BTreeMap::new();
		partitions.insert(
			"state".to_owned(),
			PartitionState {
				fs_label: "COS_STATE".to_owned(),
				snapshots: BTreeMap::from([(
					1,
					SystemState {
						source: "oci://x:latest".to_owned(),
						label: "COS_STATE".to_owned(),
						filesystem: "ext4".to_owned(),
						digest: "sha256:deadbeef".to_owned(),
						labels: BTreeMap::new(),
					},
				)]),
				recovery_image: None,
				active: Some(1),
			},
		);
		InstallState { date: "2026-01-01T00:00:00Z".to_owned(), snapshotter: SnapshotterSpec::default(), partitions }
	}

	#[test]
	fn round_trips_through_yaml() {
		let fs = FakeFilesystem::default();
		let state = sample();
		state.write(&fs, Path::new("/state.yaml")).unwrap();
		let loaded = InstallState::load(&fs, Path::new("/state.yaml")).unwrap();
		assert_eq!(loaded.active_slot(), Some(1));
		assert_eq!(loaded.date, state.date);
	}

	#[test]
	fn authoritative_prefers_newer_date() {
		let fs = FakeFilesystem::default();
		let mut older = sample();
		older.date = "2025-01-01T00:00:00Z".to_owned();
		older.write(&fs, Path::new("/recovery.yaml")).unwrap();

		let newer = sample();
		newer.write(&fs, Path::new("/state.yaml")).unwrap();

		let resolved =
			InstallState::load_authoritative(&fs, Path::new("/state.yaml"), Path::new("/recovery.yaml")).unwrap();
		assert_eq!(resolved.date, newer.date);
	}

	#[test]
	fn authoritative_tolerates_one_missing_copy() {
		let fs = FakeFilesystem::default();
		let state = sample();
		state.write(&fs, Path::new("/state.yaml")).unwrap();

		let resolved =
			InstallState::load_authoritative(&fs, Path::new("/state.yaml"), Path::new("/missing.yaml")).unwrap();
		assert_eq!(resolved.date, state.date);
	}

	#[test]
	fn missing_label_falls_back_to_documented_default() {
		let fs = FakeFilesystem::default();
		let mut state = sample();
		state.partitions.get_mut("state").unwrap().fs_label = String::new();
		state.write(&fs, Path::new("/state.yaml")).unwrap();

		let loaded = InstallState::load(&fs, Path::new("/state.yaml")).unwrap();
		assert_eq!(loaded.partitions["state"].fs_label, "COS_STATE");
	}
}
