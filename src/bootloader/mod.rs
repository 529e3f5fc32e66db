//! The bootloader installer: places EFI binaries and grub.cfg, manages
//! UEFI `BootXXXX` entries, and sets the default grub menu entry. Discovers
//! the shim/grub-EFI/MokManager payload under a root tree via glob patterns
//! and mirrors it into two EFI destinations (the vendor path and the
//! removable-media fallback path).

pub mod efi;
pub mod grub;

use std::path::{Path, PathBuf};

use color_eyre::Result;

use crate::{
	capability::{EfiVarStore, Filesystem, Runner},
	error::ActionError,
};

/// Target firmware architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
	Amd64,
	Arm64,
	Riscv64,
}

impl Arch {
	/// The `boot<arch>.efi` base name firmware looks for on the removable
	/// media path.
	#[must_use]
	pub const fn efi_boot_name(self) -> &'static str {
		match self {
			Self::Amd64 => "bootx64.efi",
			Self::Arm64 => "bootaa64.efi",
			Self::Riscv64 => "bootriscv64.efi",
		}
	}

	/// RISC-V ships no secure-boot shim; every other arch does.
	#[must_use]
	pub const fn has_secure_boot_shim(self) -> bool {
		!matches!(self, Self::Riscv64)
	}

	const fn grub_module_name(self) -> &'static str {
		match self {
			Self::Amd64 => "grubx64.efi",
			Self::Arm64 => "grubaa64.efi",
			Self::Riscv64 => "grubriscv64.efi",
		}
	}

	const fn mok_manager_name(self) -> &'static str {
		match self {
			Self::Amd64 => "mmx64.efi",
			Self::Arm64 => "mmaa64.efi",
			Self::Riscv64 => "mmriscv64.efi",
		}
	}

	/// Maps a `Config::arch`-style tag (`x86_64`, `amd64`, `aarch64`,
	/// `arm64`, `riscv64`) to the firmware architecture it targets.
	#[must_use]
	pub fn from_tag(tag: &str) -> Option<Self> {
		match tag {
			"amd64" | "x86_64" => Some(Self::Amd64),
			"arm64" | "aarch64" => Some(Self::Arm64),
			"riscv64" => Some(Self::Riscv64),
			_ => None,
		}
	}
}

/// Glob patterns (relative to `rootDir`) for the files `InstallEFI` must
/// find, grouped by role. `shim`/`mok_manager` are skipped on architectures
/// without a secure-boot path.
struct DiscoveryPatterns {
	shim: &'static str,
	grub_efi: &'static str,
	mok_manager: &'static str,
}

fn discovery_patterns(arch: Arch) -> DiscoveryPatterns {
	match arch {
		Arch::Amd64 => DiscoveryPatterns {
			shim: "boot/efi/EFI/*/shimx64.efi",
			grub_efi: "boot/efi/EFI/*/grubx64.efi",
			mok_manager: "boot/efi/EFI/*/mmx64.efi",
		},
		Arch::Arm64 => DiscoveryPatterns {
			shim: "boot/efi/EFI/*/shimaa64.efi",
			grub_efi: "boot/efi/EFI/*/grubaa64.efi",
			mok_manager: "boot/efi/EFI/*/mmaa64.efi",
		},
		Arch::Riscv64 => DiscoveryPatterns {
			shim: "",
			grub_efi: "boot/efi/EFI/*/grubriscv64.efi",
			mok_manager: "",
		},
	}
}

/// `EFI/ELEMENTAL/` — the architecture-specific vendor directory every entry
/// this crate creates points at.
pub const VENDOR_DIR: &str = "EFI/ELEMENTAL";
/// `EFI/BOOT/` — the fallback directory firmware falls back to when no
/// `BootXXXX` entry exists (e.g. removable media).
pub const FALLBACK_DIR: &str = "EFI/BOOT";

/// Walks `fs` under `dir`, matching each remaining path component of
/// `pattern` (which may contain `glob::Pattern` wildcards, e.g. `*`) one
/// level at a time. The `Filesystem` capability has no direct filesystem
/// access for the real `glob` crate to walk, so pattern matching happens
/// component-by-component against `read_dir` listings instead.
fn glob_walk(fs: &dyn Filesystem, dir: &Path, components: &[&str]) -> Option<PathBuf> {
	let [first, rest @ ..] = components else { return None };
	let pattern = glob::Pattern::new(first).ok()?;
	let mut entries = fs.read_dir(dir).unwrap_or_default();
	entries.sort();
	for entry in entries {
		let name = entry.file_name().and_then(|n| n.to_str())?;
		if !pattern.matches(name) {
			continue;
		}
		if rest.is_empty() {
			return Some(entry);
		}
		if let Some(found) = glob_walk(fs, &entry, rest) {
			return Some(found);
		}
	}
	None
}

/// Finds the single file matching `pattern` (a glob relative to `root`,
/// e.g. `boot/efi/EFI/*/shimx64.efi`).
///
/// # Errors
/// Returns [`ActionError::BootloaderInstall`] if no file matches.
fn find_one(fs: &dyn Filesystem, root: &Path, pattern: &str) -> Result<PathBuf> {
	let components: Vec<&str> = pattern.split('/').collect();
	glob_walk(fs, root, &components).ok_or_else(|| ActionError::BootloaderInstall.into())
}

/// Composes capabilities needed to place and register bootloader artifacts.
pub struct Bootloader<'a> {
	pub runner: &'a dyn Runner,
	pub fs: &'a dyn Filesystem,
	pub efi_vars: &'a dyn EfiVarStore,
	pub arch: Arch,
	/// Whether `install()` runs `DoEFIEntries` (creating/prepending the
	/// `BootXXXX` entry) at all.
	pub run_efi_entries: bool,
	/// Whether `do_efi_entries()` clears stale same-named entries before
	/// creating the new one. Independent of `run_efi_entries` -- a caller can
	/// ask to create/prepend an entry without first clearing old ones.
	pub clear_boot_entry: bool,
}

impl<'a> Bootloader<'a> {
	#[must_use]
	pub const fn new(
		runner: &'a dyn Runner, fs: &'a dyn Filesystem, efi_vars: &'a dyn EfiVarStore, arch: Arch,
		run_efi_entries: bool, clear_boot_entry: bool,
	) -> Self {
		Self { runner, fs, efi_vars, arch, run_efi_entries, clear_boot_entry }
	}

	/// `Install(rootDir, bootDir)`: `InstallEFI`, then `DoEFIEntries` unless
	/// disabled, then `InstallConfig`.
	///
	/// # Errors
	/// Returns [`ActionError::BootloaderInstall`] on any step's failure.
	#[tracing::instrument(skip(self))]
	pub fn install(&self, root_dir: &Path, efi_dir: &Path, grub_cfg: &grub::GrubCfgContext) -> Result<()> {
		self.install_efi(root_dir, efi_dir)?;
		if self.run_efi_entries {
			self.do_efi_entries(efi_dir)?;
		}
		self.install_config(efi_dir, grub_cfg)
	}

	/// `InstallEFI(rootDir, efiDir)`: discovers shim/grub-EFI/MokManager/grub
	/// modules for [`Self::arch`] and copies each to both the vendor path
	/// (`EFI/ELEMENTAL/`) and the fallback path (`EFI/BOOT/`).
	///
	/// # Errors
	/// Returns [`ActionError::BootloaderInstall`] if a required file is
	/// missing.
	#[tracing::instrument(skip(self))]
	pub fn install_efi(&self, root_dir: &Path, efi_dir: &Path) -> Result<()> {
		let patterns = discovery_patterns(self.arch);
		let vendor = efi_dir.join(VENDOR_DIR);
		let fallback = efi_dir.join(FALLBACK_DIR);
		self.fs.create_dir_all(&vendor).map_err(|_| ActionError::BootloaderInstall)?;
		self.fs.create_dir_all(&fallback).map_err(|_| ActionError::BootloaderInstall)?;

		let grub_efi = find_one(self.fs, root_dir, patterns.grub_efi)?;
		let boot_name = self.arch.efi_boot_name();

		if self.arch.has_secure_boot_shim() {
			let shim = find_one(self.fs, root_dir, patterns.shim)?;
			let mok_manager = find_one(self.fs, root_dir, patterns.mok_manager)?;
			self.place(&shim, &vendor.join(boot_name))?;
			self.place(&shim, &fallback.join(boot_name))?;
			self.place(&grub_efi, &vendor.join(self.arch.grub_module_name()))?;
			self.place(&mok_manager, &vendor.join(self.arch.mok_manager_name()))?;
		} else {
			self.place(&grub_efi, &vendor.join(boot_name))?;
			self.place(&grub_efi, &fallback.join(boot_name))?;
		}
		Ok(())
	}

	fn place(&self, from: &Path, to: &Path) -> Result<()> {
		self.fs.copy(from, to).map_err(|_| ActionError::BootloaderInstall.into())
	}

	/// `DoEFIEntries(shimName, efiDir)`: clears stale entries (if configured)
	/// and creates/reuses the entry for this system's shim, prepending it to
	/// `BootOrder`.
	///
	/// # Errors
	/// Returns [`ActionError::EfiEntrySlotsExhausted`] if no `Boot####` slot
	/// is free.
	#[tracing::instrument(skip(self))]
	pub fn do_efi_entries(&self, efi_dir: &Path) -> Result<()> {
		let _ = efi_dir;
		if self.clear_boot_entry {
			efi::clear_entries_named(self.efi_vars, efi::DEFAULT_ENTRY_DESCRIPTION)?;
		}
		let device_path = format!("\\{}\\{}", VENDOR_DIR.replace('/', "\\"), self.arch.efi_boot_name());
		let option = efi::LoadOption::new(efi::DEFAULT_ENTRY_DESCRIPTION, device_path);
		let slot_name = efi::create_or_reuse_entry(self.efi_vars, &option)?;
		efi::prepend_boot_order(self.efi_vars, &slot_name)
	}

	/// `InstallConfig`: renders and writes `grub.cfg` into `efiDir`.
	///
	/// # Errors
	/// Returns [`ActionError::BootloaderInstall`] if rendering or the write
	/// fails.
	#[tracing::instrument(skip(self, ctx))]
	pub fn install_config(&self, efi_dir: &Path, ctx: &grub::GrubCfgContext) -> Result<()> {
		let rendered = grub::render_grub_cfg(ctx).map_err(|_| ActionError::BootloaderInstall)?;
		let path = efi_dir.join(VENDOR_DIR).join("grub.cfg");
		self.fs.write(&path, &rendered).map_err(|_| ActionError::BootloaderInstall.into())
	}

	/// `SetDefaultEntry(partMount, imgMount, fallback)`: reads
	/// `GRUB_ENTRY_NAME` from `/etc/os-release` inside `img_mount` if
	/// present, else uses `fallback`, and writes it as `default_menu_entry`
	/// to the grub environment file under `part_mount`.
	///
	/// # Errors
	/// Returns [`ActionError::GrubEditenv`] if the editenv invocation fails.
	#[tracing::instrument(skip(self))]
	pub fn set_default_entry(&self, part_mount: &Path, img_mount: &Path, fallback: &str) -> Result<()> {
		let entry = self.read_os_release_entry_name(img_mount).unwrap_or_else(|| fallback.to_owned());
		let envfile = part_mount.join("grub2").join("grubenv");
		grub::set_default_menu_entry(self.runner, &envfile.display().to_string(), &entry)
	}

	fn read_os_release_entry_name(&self, img_mount: &Path) -> Option<String> {
		let contents = self.fs.read_to_string(&img_mount.join("etc/os-release")).ok()?;
		contents.lines().find_map(|line| {
			line.strip_prefix("GRUB_ENTRY_NAME=").map(|v| v.trim_matches('"').to_owned())
		})
	}

	/// `SetPersistentVariables(file, map)`: writes every key/value pair to
	/// the grub environment file at `envfile`.
	///
	/// # Errors
	/// Returns [`ActionError::GrubEditenv`] if any invocation fails.
	pub fn set_persistent_variables(
		&self, envfile: &Path, vars: &std::collections::BTreeMap<String, String>,
	) -> Result<()> {
		grub::set_persistent_variables(self.runner, &envfile.display().to_string(), vars)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::capability::mock::{FakeEfiVarStore, FakeFilesystem, FakeRunner};

	fn seed_efi_tree(fs: &FakeFilesystem, root: &Path) {
		fs.create_dir_all(&root.join("boot/efi/EFI/fedora")).unwrap();
		fs.write(&root.join("boot/efi/EFI/fedora/shimx64.efi"), "shim").unwrap();
		fs.write(&root.join("boot/efi/EFI/fedora/grubx64.efi"), "grub").unwrap();
		fs.write(&root.join("boot/efi/EFI/fedora/mmx64.efi"), "mok").unwrap();
	}

	#[test]
	fn install_efi_places_binaries_in_vendor_and_fallback_dirs() {
		let fs = FakeFilesystem::default();
		let runner = FakeRunner::default();
		let efi_vars = FakeEfiVarStore::default();
		let root = PathBuf::from("/rootfs");
		seed_efi_tree(&fs, &root);

		let loader = Bootloader::new(&runner, &fs, &efi_vars, Arch::Amd64, true, true);
		let efi_dir = PathBuf::from("/efi");
		loader.install_efi(&root, &efi_dir).unwrap();

		assert!(fs.exists(&efi_dir.join(VENDOR_DIR).join("bootx64.efi")));
		assert!(fs.exists(&efi_dir.join(FALLBACK_DIR).join("bootx64.efi")));
		assert!(fs.exists(&efi_dir.join(VENDOR_DIR).join("grubx64.efi")));
		assert!(fs.exists(&efi_dir.join(VENDOR_DIR).join("mmx64.efi")));
	}

	#[test]
	fn do_efi_entries_creates_an_entry_and_prepends_boot_order() {
		let fs = FakeFilesystem::default();
		let runner = FakeRunner::default();
		let efi_vars = FakeEfiVarStore::default();
		let loader = Bootloader::new(&runner, &fs, &efi_vars, Arch::Amd64, true, true);

		loader.do_efi_entries(&PathBuf::from("/efi")).unwrap();

		let entries = efi_vars.list_boot_entries().unwrap();
		assert_eq!(entries.len(), 1);
		let order = efi_vars.read("BootOrder").unwrap().unwrap();
		assert_eq!(order.data.len(), 2);
	}

	#[test]
	fn do_efi_entries_creates_an_entry_without_clearing_stale_ones_when_disabled() {
		let fs = FakeFilesystem::default();
		let runner = FakeRunner::default();
		let efi_vars = FakeEfiVarStore::default();

		let stale = efi::LoadOption::new(efi::DEFAULT_ENTRY_DESCRIPTION, "\\EFI\\stale\\bootx64.efi".to_owned());
		efi_vars
			.write(crate::capability::EfiVariable {
				name: "Boot0000".to_owned(),
				attributes: efi::LOAD_OPTION_ATTRIBUTES,
				data: stale.encode(),
			})
			.unwrap();

		// clear_boot_entry is off, but run_efi_entries (implied by calling
		// do_efi_entries directly) still creates and prepends a new entry.
		let loader = Bootloader::new(&runner, &fs, &efi_vars, Arch::Amd64, true, false);
		loader.do_efi_entries(&PathBuf::from("/efi")).unwrap();

		let entries = efi_vars.list_boot_entries().unwrap();
		assert_eq!(entries.len(), 2, "stale entry must survive when clear_boot_entry is false");
		let order = efi_vars.read("BootOrder").unwrap().unwrap();
		assert_eq!(order.data.len(), 2);
	}

	#[test]
	fn riscv64_skips_the_shim_and_installs_grub_efi_directly() {
		let fs = FakeFilesystem::default();
		let runner = FakeRunner::default();
		let efi_vars = FakeEfiVarStore::default();
		let root = PathBuf::from("/rootfs");
		fs.create_dir_all(&root.join("boot/efi/EFI/fedora")).unwrap();
		fs.write(&root.join("boot/efi/EFI/fedora/grubriscv64.efi"), "grub").unwrap();

		let loader = Bootloader::new(&runner, &fs, &efi_vars, Arch::Riscv64, true, true);
		let efi_dir = PathBuf::from("/efi");
		loader.install_efi(&root, &efi_dir).unwrap();

		assert!(fs.exists(&efi_dir.join(VENDOR_DIR).join("bootriscv64.efi")));
		assert!(fs.exists(&efi_dir.join(FALLBACK_DIR).join("bootriscv64.efi")));
	}

	#[test]
	fn set_default_entry_prefers_os_release_over_fallback() {
		let fs = FakeFilesystem::default();
		let runner = FakeRunner::default();
		let efi_vars = FakeEfiVarStore::default();
		let img_mount = PathBuf::from("/img");
		fs.create_dir_all(&img_mount.join("etc")).unwrap();
		fs.write(&img_mount.join("etc/os-release"), "NAME=\"Atomik\"\nGRUB_ENTRY_NAME=\"Atomik Linux\"\n").unwrap();

		let loader = Bootloader::new(&runner, &fs, &efi_vars, Arch::Amd64, true, true);
		loader.set_default_entry(&PathBuf::from("/boot"), &img_mount, "fallback-name").unwrap();

		let calls = runner.calls();
		let (_, args) = calls.iter().find(|(p, _)| p.contains("editenv")).unwrap();
		assert!(args.iter().any(|a| a == "set" || a.contains("Atomik Linux")));
	}
}
