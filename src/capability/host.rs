//! Real, host-backed implementations of the capability traits. Used in
//! production; never constructed in tests (see [`super::mock`] instead).

use std::{
	fs,
	path::{Path, PathBuf},
	process::Command,
	sync::Mutex,
};

use color_eyre::{eyre::eyre, Result};
use sys_mount::{Mount, UnmountFlags};

use super::{CommandOutput, EfiVariable, MountEntry};
use crate::spec::source::ImageSource;

#[derive(Debug)]
pub struct HostRunner;

impl super::Runner for HostRunner {
	fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
		let out = Command::new(program).args(args).output()?;
		Ok(CommandOutput {
			status_success: out.status.success(),
			status_code: out.status.code(),
			stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
			stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
		})
	}
}

#[derive(Debug)]
pub struct HostFilesystem;

impl super::Filesystem for HostFilesystem {
	fn read_to_string(&self, path: &Path) -> Result<String> {
		Ok(fs::read_to_string(path)?)
	}

	fn write(&self, path: &Path, contents: &str) -> Result<()> {
		Ok(fs::write(path, contents)?)
	}

	fn create_dir_all(&self, path: &Path) -> Result<()> {
		Ok(fs::create_dir_all(path)?)
	}

	fn copy(&self, from: &Path, to: &Path) -> Result<()> {
		fs::copy(from, to)?;
		Ok(())
	}

	fn rename(&self, from: &Path, to: &Path) -> Result<()> {
		Ok(fs::rename(from, to)?)
	}

	fn symlink(&self, original: &Path, link: &Path) -> Result<()> {
		Ok(std::os::unix::fs::symlink(original, link)?)
	}

	fn read_link(&self, path: &Path) -> Result<PathBuf> {
		Ok(fs::read_link(path)?)
	}

	fn remove_file(&self, path: &Path) -> Result<()> {
		Ok(fs::remove_file(path)?)
	}

	fn remove_dir_all(&self, path: &Path) -> Result<()> {
		Ok(fs::remove_dir_all(path)?)
	}

	fn exists(&self, path: &Path) -> bool {
		path.exists()
	}

	fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
		if !path.exists() {
			return Ok(Vec::new());
		}
		fs::read_dir(path)?.map(|e| Ok(e?.path())).collect()
	}
}

#[derive(Debug, Default)]
pub struct HostMounter {
	active: Mutex<Vec<MountEntry>>,
}

impl super::Mounter for HostMounter {
	fn mount(&self, device: &str, mountpoint: &Path, fstype: &str) -> Result<()> {
		fs::create_dir_all(mountpoint)?;
		let _mount = Mount::builder().fstype(fstype).mount(device, mountpoint)?;
		self.active.lock().expect("mount table lock poisoned").push(MountEntry {
			device: device.to_owned(),
			mountpoint: mountpoint.to_owned(),
		});
		Ok(())
	}

	fn unmount(&self, mountpoint: &Path) -> Result<()> {
		sys_mount::unmount(mountpoint, UnmountFlags::empty())?;
		self.active.lock().expect("mount table lock poisoned").retain(|m| m.mountpoint != mountpoint);
		Ok(())
	}

	fn mounted(&self) -> Vec<MountEntry> {
		self.active.lock().expect("mount table lock poisoned").clone()
	}
}

/// Bitflags this crate cares about, matching the values the kernel's
/// efivarfs driver documents for `Boot####`/`BootOrder`.
pub const EFI_VAR_NON_VOLATILE: u32 = 0x0000_0001;
pub const EFI_VAR_BOOTSERVICE_ACCESS: u32 = 0x0000_0002;
pub const EFI_VAR_RUNTIME_ACCESS: u32 = 0x0000_0004;

const EFIVARFS_ROOT: &str = "/sys/firmware/efi/efivars";
/// The well-known GUID for the EFI Global Variable namespace, used as the
/// suffix on every efivarfs file name (`Boot0000-8be4df61-93ca-11d2-aa0d-00e098032b8c`).
const EFI_GLOBAL_GUID: &str = "8be4df61-93ca-11d2-aa0d-00e098032b8c";

#[derive(Debug, Default)]
pub struct HostEfiVarStore {
	root: Option<PathBuf>,
}

impl HostEfiVarStore {
	fn root(&self) -> &Path {
		self.root.as_deref().unwrap_or_else(|| Path::new(EFIVARFS_ROOT))
	}

	fn path_for(&self, name: &str) -> PathBuf {
		self.root().join(format!("{name}-{EFI_GLOBAL_GUID}"))
	}
}

impl super::EfiVarStore for HostEfiVarStore {
	fn list_boot_entries(&self) -> Result<Vec<EfiVariable>> {
		let mut entries = Vec::new();
		if !self.root().exists() {
			return Ok(entries);
		}
		for file in fs::read_dir(self.root())? {
			let file = file?;
			let fname = file.file_name();
			let fname = fname.to_string_lossy();
			let Some(name) = fname.strip_suffix(&format!("-{EFI_GLOBAL_GUID}")) else { continue };
			if !is_boot_entry_name(name) {
				continue;
			}
			if let Some(var) = self.read(name)? {
				entries.push(var);
			}
		}
		entries.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(entries)
	}

	fn read(&self, name: &str) -> Result<Option<EfiVariable>> {
		let path = self.path_for(name);
		if !path.exists() {
			return Ok(None);
		}
		let raw = fs::read(&path)?;
		if raw.len() < 4 {
			return Err(eyre!("efivarfs entry {name} shorter than the 4-byte attribute header"));
		}
		let attributes = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
		Ok(Some(EfiVariable { name: name.to_owned(), attributes, data: raw[4..].to_vec() }))
	}

	fn write(&self, var: EfiVariable) -> Result<()> {
		fs::create_dir_all(self.root())?;
		let path = self.path_for(&var.name);
		let mut raw = Vec::with_capacity(4 + var.data.len());
		raw.extend_from_slice(&var.attributes.to_le_bytes());
		raw.extend_from_slice(&var.data);
		fs::write(path, raw)?;
		Ok(())
	}

	fn delete(&self, name: &str) -> Result<()> {
		let path = self.path_for(name);
		if path.exists() {
			fs::remove_file(path)?;
		}
		Ok(())
	}
}

fn is_boot_entry_name(name: &str) -> bool {
	name.len() == 8
		&& name.starts_with("Boot")
		&& name[4..].chars().all(|c| c.is_ascii_hexdigit() && (c.is_ascii_digit() || c.is_ascii_uppercase()))
}

#[derive(Debug)]
pub struct HostImageExtractor;

impl super::ImageExtractor for HostImageExtractor {
	fn extract(&self, source: &ImageSource, target: &Path) -> Result<()> {
		fs::create_dir_all(target)?;
		match source {
			ImageSource::Empty => Ok(()),
			ImageSource::Dir { path } => copy_tree(path, target),
			ImageSource::File { path } => {
				// A squashfs/tar image: unpack by shelling out to `tar`
				// rather than pulling in an archive-parsing crate.
				let status = Command::new("tar")
					.args(["-xf", &path.to_string_lossy(), "-C"])
					.arg(target)
					.status()?;
				if status.success() {
					Ok(())
				} else {
					Err(eyre!("tar extraction of {} failed", path.display()))
				}
			},
			ImageSource::Oci { reference } => {
				let status = Command::new("skopeo")
					.args(["copy", &format!("docker://{reference}"), &format!("dir:{}", target.display())])
					.status()?;
				if status.success() {
					Ok(())
				} else {
					Err(eyre!("skopeo copy of {reference} failed"))
				}
			},
			ImageSource::Channel { package } => {
				Err(eyre!("channel package sources ({package}) require the external fetcher, not configured"))
			},
		}
	}
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
	for entry in fs::read_dir(src)? {
		let entry = entry?;
		let path = entry.path();
		let dest_path = dest.join(entry.file_name());
		let file_type = entry.file_type()?;
		if file_type.is_dir() {
			fs::create_dir_all(&dest_path)?;
			copy_tree(&path, &dest_path)?;
		} else if file_type.is_symlink() {
			let target = fs::read_link(&path)?;
			std::os::unix::fs::symlink(target, &dest_path)?;
		} else {
			fs::copy(&path, &dest_path)?;
		}
	}
	Ok(())
}

#[derive(Debug)]
pub struct HostCloudInitExecutor;

impl super::CloudInitExecutor for HostCloudInitExecutor {
	fn run_stage(&self, stage: &str, chroot: Option<&Path>) -> Result<()> {
		let mut cmd = Command::new("yip");
		cmd.arg("--stage").arg(stage);
		if let Some(root) = chroot {
			cmd.arg("--chroot").arg(root);
		}
		let status = cmd.status()?;
		if status.success() {
			Ok(())
		} else {
			Err(eyre!("yip stage {stage} failed"))
		}
	}
}

#[derive(Debug)]
pub struct HostFeatureInstaller;

impl super::FeatureInstaller for HostFeatureInstaller {
	fn install(&self, feature: &str, target: &Path) -> Result<()> {
		fs::create_dir_all(target)?;
		let status = Command::new("tar")
			.args(["-xzf", &format!("/usr/share/elemental/features/{feature}.tar.gz"), "-C"])
			.arg(target)
			.status()?;
		if status.success() {
			Ok(())
		} else {
			Err(eyre!("feature installer failed to unpack {feature}"))
		}
	}
}
