//! The typed error taxonomy: every fallible operation still returns
//! [`color_eyre::Result`] (an `eyre::Report`) the way the rest of this crate
//! does, but the *cause* of a failure is almost always one of these variants
//! so the binary entrypoint can map it to a stable exit code without
//! re-parsing error strings.

use thiserror::Error;

/// Coarse-grained classification from the error handling design (kinds, not
/// types). Used for logging/telemetry; the exit code is the authoritative,
/// stable signal for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// Spec invariant violated; raised synchronously by `Sanitize`, no state changes.
	Validation,
	/// Target already installed, device busy, missing tool; action refuses untouched.
	Precondition,
	/// Disk full, I/O error, mkfs failure; action cleans up and reports the original cause.
	Environmental,
	/// A spawned command exited non-zero; combined output is attached.
	External,
	/// A post-step invariant check failed.
	Consistency,
}

/// The documented, stable exit-code taxonomy (see spec: "Exit codes").
///
/// Every variant name matches the operation it guards, not the underlying
/// syscall or library error, so a caller scripting around this tool can match
/// on behavior ("AlreadyInstalled") rather than on implementation detail.
#[derive(Debug, Error)]
pub enum ActionError {
	#[error("image source must not be empty")]
	SourceEmpty,

	#[error("state partition is required but was not found in the partition layout")]
	StatePartitionMissing,

	#[error("at most one extra partition may have size 0 (fill-remaining); violated by: {0}")]
	ExtraPartitionSizeConflict(String),

	#[error("partition label invalid: {0}")]
	LabelInvalid(String),

	#[error("target disk already contains a valid InstallState; pass --force to reinstall")]
	AlreadyInstalled,

	#[error("target device is busy: {0}")]
	DeviceBusy(String),

	#[error("required host tool not found on PATH: {0}")]
	MissingHostTool(String),

	#[error("failed to mount the state partition at {0}")]
	MountStatePartition(String),

	#[error("failed to mount partition {name} at {mountpoint}")]
	MountPartition { name: String, mountpoint: String },

	#[error("failed to unmount partition {name} at {mountpoint}")]
	UnmountPartition { name: String, mountpoint: String },

	#[error("failed to write a GPT partition table to {0}")]
	PartitioningDevice(String),

	#[error("failed to format partition {name} as {filesystem}")]
	FormatPartition { name: String, filesystem: String },

	#[error("disk full while populating snapshot working directory")]
	DiskFull,

	#[error("image fetcher failed to unpack {source} into {target}")]
	UnpackImage { source: String, target: String },

	#[error("feature installer failed to unpack feature bundle {0}")]
	FeatureInstall(String),

	#[error("cloud-init stage '{0}' failed")]
	CloudInitStage(String),

	#[error("snapshotter initialization failed")]
	SnapshotterInit,

	#[error("snapshotter failed to start a new transaction")]
	SnapshotterStart,

	#[error("snapshotter failed to close transaction for slot {0}")]
	SnapshotterClose(u32),

	#[error("refusing to delete snapshot {0}: it is the active snapshot")]
	DeleteActiveSnapshot(u32),

	#[error("bootloader installation failed")]
	BootloaderInstall,

	#[error("all 65536 UEFI boot entry slots are in use")]
	EfiEntrySlotsExhausted,

	#[error("grub-editenv invocation failed")]
	GrubEditenv,

	#[error("failed to write InstallState to {0}")]
	InstallStateWrite(String),

	#[error("failed to read InstallState from {0}")]
	InstallStateRead(String),

	#[error("command `{cmd}` exited with {status}")]
	CommandFailed { cmd: String, status: String, output: String },

	#[error("post-step consistency check failed: {0}")]
	ConsistencyCheck(String),
}

impl ActionError {
	#[must_use]
	pub const fn kind(&self) -> ErrorKind {
		match self {
			Self::SourceEmpty
			| Self::StatePartitionMissing
			| Self::ExtraPartitionSizeConflict(_)
			| Self::LabelInvalid(_) => ErrorKind::Validation,

			Self::AlreadyInstalled | Self::DeviceBusy(_) | Self::MissingHostTool(_) => {
				ErrorKind::Precondition
			},

			Self::MountStatePartition(_)
			| Self::MountPartition { .. }
			| Self::UnmountPartition { .. }
			| Self::PartitioningDevice(_)
			| Self::FormatPartition { .. }
			| Self::DiskFull
			| Self::UnpackImage { .. }
			| Self::FeatureInstall(_)
			| Self::CloudInitStage(_)
			| Self::SnapshotterInit
			| Self::SnapshotterStart
			| Self::SnapshotterClose(_)
			| Self::DeleteActiveSnapshot(_)
			| Self::BootloaderInstall
			| Self::EfiEntrySlotsExhausted
			| Self::GrubEditenv
			| Self::InstallStateWrite(_)
			| Self::InstallStateRead(_) => ErrorKind::Environmental,

			Self::CommandFailed { .. } => ErrorKind::External,

			Self::ConsistencyCheck(_) => ErrorKind::Consistency,
		}
	}

	/// The stable, documented exit code for this error. Unknown failures
	/// (anything that isn't an `ActionError`) map to 255 by the caller.
	#[must_use]
	pub const fn exit_code(&self) -> i32 {
		match self {
			Self::SourceEmpty => 10,
			Self::StatePartitionMissing => 11,
			Self::ExtraPartitionSizeConflict(_) => 12,
			Self::LabelInvalid(_) => 13,
			Self::MountStatePartition(_) => 34,
			Self::MountPartition { .. } => 35,
			Self::UnmountPartition { .. } => 36,
			Self::PartitioningDevice(_) => 56,
			Self::AlreadyInstalled => 57,
			Self::DeviceBusy(_) => 58,
			Self::MissingHostTool(_) => 59,
			Self::FormatPartition { .. } => 60,
			Self::DiskFull => 61,
			Self::UnpackImage { .. } => 66,
			Self::FeatureInstall(_) => 67,
			Self::CloudInitStage(_) => 68,
			Self::CommandFailed { .. } => 70,
			Self::SnapshotterInit => 84,
			Self::SnapshotterStart => 85,
			Self::SnapshotterClose(_) => 86,
			Self::DeleteActiveSnapshot(_) => 87,
			Self::BootloaderInstall => 90,
			Self::EfiEntrySlotsExhausted => 91,
			Self::GrubEditenv => 92,
			Self::InstallStateWrite(_) => 95,
			Self::InstallStateRead(_) => 96,
			Self::ConsistencyCheck(_) => 99,
		}
	}
}

/// Exit code used for any failure that did not originate as an [`ActionError`]
/// (an unexpected I/O error, a panic caught upstream, etc).
pub const UNKNOWN_EXIT_CODE: i32 = 255;

/// Walks a [`color_eyre::Report`]'s error chain looking for an [`ActionError`]
/// to pick a stable exit code from. Falls back to [`UNKNOWN_EXIT_CODE`].
#[must_use]
pub fn exit_code_for(report: &color_eyre::Report) -> i32 {
	for cause in report.chain() {
		if let Some(action_err) = cause.downcast_ref::<ActionError>() {
			return action_err.exit_code();
		}
	}
	UNKNOWN_EXIT_CODE
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exit_codes_match_documented_values() {
		assert_eq!(ActionError::MountStatePartition(String::new()).exit_code(), 34);
		assert_eq!(ActionError::PartitioningDevice(String::new()).exit_code(), 56);
		assert_eq!(ActionError::AlreadyInstalled.exit_code(), 57);
		assert_eq!(ActionError::SnapshotterInit.exit_code(), 84);
		assert_eq!(ActionError::SnapshotterStart.exit_code(), 85);
		assert_eq!(ActionError::UnpackImage { source: String::new(), target: String::new() }.exit_code(), 66);
	}

	#[test]
	fn unknown_error_maps_to_255() {
		let report = color_eyre::eyre::eyre!("something unrelated happened");
		assert_eq!(exit_code_for(&report), UNKNOWN_EXIT_CODE);
	}

	#[test]
	fn known_error_is_found_through_context_chain() {
		let report: color_eyre::Report = ActionError::AlreadyInstalled.into();
		let report = report.wrap_err("while installing");
		assert_eq!(exit_code_for(&report), 57);
	}
}
