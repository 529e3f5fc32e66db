//! Narrow capability traits mediating every host interaction (process
//! execution, filesystem, mounts, UEFI variables, image extraction,
//! cloud-init, feature bundles). Each has a real implementation in
//! [`host`] and an in-memory fake in [`mock`], so orchestration-level code
//! (everything in [`crate::actions`]) can be exercised with no root
//! privileges and no real block device.

pub mod host;
pub mod mock;

use std::path::{Path, PathBuf};

use color_eyre::{eyre::eyre, Result, Section, SectionExt};

use crate::error::ActionError;

/// The outcome of a single host command invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
	pub status_success: bool,
	pub status_code: Option<i32>,
	pub stdout: String,
	pub stderr: String,
}

/// Spawns host commands (`parted`, `mkfs.*`, `mksquashfs`, `rsync`,
/// `systemctl`, `grub2-editenv`, `btrfs`, ...). The production implementation
/// shells out via [`std::process::Command`]; the fake records every
/// invocation and returns a scripted [`CommandOutput`].
pub trait Runner: std::fmt::Debug {
	fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runs `program` with `args` through `runner`, returning the trimmed
/// stdout on success or an [`ActionError::CommandFailed`] on non-zero exit.
/// This is the function [`crate::cmd!`] expands into.
pub fn run_checked(runner: &dyn Runner, program: &str, args: &[String]) -> Result<String> {
	let out = runner.run(program, args)?;
	if out.status_success {
		Ok(out.stdout.trim().to_owned())
	} else {
		let cmdline = format!("{program} {}", args.join(" "));
		let status = out.status_code.map_or_else(|| "signal".to_owned(), |c| c.to_string());
		Err(eyre!(ActionError::CommandFailed {
			cmd: cmdline.clone(),
			status,
			output: format!("{}\n{}", out.stdout, out.stderr),
		}))
		.with_section(move || out.stdout.trim().to_owned().header("Stdout:"))
		.with_section(move || out.stderr.trim().to_owned().header("Stderr:"))
	}
}

/// File and directory operations, so snapshot population and `InstallState`
/// persistence are testable without touching a real disk.
pub trait Filesystem: std::fmt::Debug {
	fn read_to_string(&self, path: &Path) -> Result<String>;
	fn write(&self, path: &Path, contents: &str) -> Result<()>;
	fn create_dir_all(&self, path: &Path) -> Result<()>;
	fn copy(&self, from: &Path, to: &Path) -> Result<()>;
	fn rename(&self, from: &Path, to: &Path) -> Result<()>;
	fn symlink(&self, original: &Path, link: &Path) -> Result<()>;
	fn read_link(&self, path: &Path) -> Result<PathBuf>;
	fn remove_file(&self, path: &Path) -> Result<()>;
	fn remove_dir_all(&self, path: &Path) -> Result<()>;
	fn exists(&self, path: &Path) -> bool;
	/// Lists immediate children of a directory (empty if it does not exist).
	fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

	/// Atomic replace: write to `path.tmp`, fsync, then rename over `path`.
	fn write_atomic(&self, path: &Path, contents: &str) -> Result<()> {
		let tmp = path.with_extension("tmp");
		self.write(&tmp, contents)?;
		self.rename(&tmp, path)
	}
}

/// One currently-mounted entry, as tracked for `UnmountAll` ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
	pub device: String,
	pub mountpoint: PathBuf,
}

/// Mounts/unmounts a block device at a path, and lists the current mount
/// table (for reverse-order unmounting).
pub trait Mounter: std::fmt::Debug {
	fn mount(&self, device: &str, mountpoint: &Path, fstype: &str) -> Result<()>;
	fn unmount(&self, mountpoint: &Path) -> Result<()>;
	fn mounted(&self) -> Vec<MountEntry>;
}

/// One raw EFI load option: `Boot0000`..`BootFFFF`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EfiVariable {
	pub name: String,
	pub attributes: u32,
	pub data: Vec<u8>,
}

/// Lists/reads/writes/deletes EFI variables in the `Boot[0-9A-F]{4}`
/// namespace plus `BootOrder`. The real implementation reads and writes
/// `/sys/firmware/efi/efivars/*`; the fake is a `BTreeMap`.
pub trait EfiVarStore: std::fmt::Debug {
	/// All `Boot####` variables currently present, in slot order.
	fn list_boot_entries(&self) -> Result<Vec<EfiVariable>>;
	fn read(&self, name: &str) -> Result<Option<EfiVariable>>;
	fn write(&self, var: EfiVariable) -> Result<()>;
	fn delete(&self, name: &str) -> Result<()>;
}

/// Resolves an `ImageSource` and materializes it into a directory. Contract
/// for the out-of-scope OCI image fetcher.
pub trait ImageExtractor: std::fmt::Debug {
	fn extract(&self, source: &crate::spec::source::ImageSource, target: &Path) -> Result<()>;
}

/// Runs a named cloud-init stage, optionally chrooted. Contract for the
/// out-of-scope "yip" cloud-init executor.
pub trait CloudInitExecutor: std::fmt::Debug {
	fn run_stage(&self, stage: &str, chroot: Option<&Path>) -> Result<()>;
}

/// Unpacks named feature bundles (systemd units, dracut modules, grub
/// templates) into a directory. Contract for the out-of-scope feature
/// installer.
pub trait FeatureInstaller: std::fmt::Debug {
	fn install(&self, feature: &str, target: &Path) -> Result<()>;
}

/// The resolved set of capabilities a [`crate::config::Config`] carries.
/// Bundled together so orchestration code takes one argument instead of
/// five.
pub struct Capabilities {
	pub runner: Box<dyn Runner>,
	pub filesystem: std::sync::Arc<dyn Filesystem>,
	pub mounter: Box<dyn Mounter>,
	pub efi_vars: Box<dyn EfiVarStore>,
	pub image_extractor: Box<dyn ImageExtractor>,
	pub cloud_init: Box<dyn CloudInitExecutor>,
	pub feature_installer: Box<dyn FeatureInstaller>,
}

impl std::fmt::Debug for Capabilities {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Capabilities").finish_non_exhaustive()
	}
}

impl Capabilities {
	/// The real, host-backed capability set.
	#[must_use]
	pub fn host() -> Self {
		Self {
			runner: Box::new(host::HostRunner),
			filesystem: std::sync::Arc::new(host::HostFilesystem),
			mounter: Box::new(host::HostMounter),
			efi_vars: Box::new(host::HostEfiVarStore::default()),
			image_extractor: Box::new(host::HostImageExtractor),
			cloud_init: Box::new(host::HostCloudInitExecutor),
			feature_installer: Box::new(host::HostFeatureInstaller),
		}
	}

	/// The fully in-memory, root-free capability set used by tests.
	#[must_use]
	pub fn mock() -> Self {
		let fs = std::sync::Arc::new(mock::FakeFilesystem::default());
		Self {
			runner: Box::new(mock::FakeRunner::default()),
			filesystem: fs.clone(),
			mounter: Box::new(mock::FakeMounter::default()),
			efi_vars: Box::new(mock::FakeEfiVarStore::default()),
			image_extractor: Box::new(mock::FakeImageExtractor::new(fs)),
			cloud_init: Box::new(mock::FakeCloudInitExecutor::default()),
			feature_installer: Box::new(mock::FakeFeatureInstaller::default()),
		}
	}
}
