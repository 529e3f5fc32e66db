//! In-memory fakes for every capability trait. These back the end-to-end
//! scenario tests (see `tests/scenarios.rs`) and let action-level code run
//! with no root privileges and no real block device.

use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
	sync::{Arc, Mutex},
};

use color_eyre::{eyre::eyre, Result};

use super::{CommandOutput, EfiVariable, Filesystem, MountEntry};
use crate::spec::source::ImageSource;

/// A scripted response for a command pattern: the runner matches the
/// program name and returns this output instead of spawning a process.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
	pub stdout: String,
	pub stderr: String,
	pub status_success: bool,
}

impl Default for ScriptedResponse {
	fn default() -> Self {
		Self { stdout: String::new(), stderr: String::new(), status_success: true }
	}
}

/// Records every command invocation it receives, and returns a scripted
/// response keyed by program name (falling back to success/empty-output).
#[derive(Debug, Default)]
pub struct FakeRunner {
	pub invocations: Mutex<Vec<(String, Vec<String>)>>,
	pub scripts: Mutex<BTreeMap<String, ScriptedResponse>>,
}

impl FakeRunner {
	pub fn script(&self, program: &str, response: ScriptedResponse) {
		self.scripts.lock().expect("scripts lock poisoned").insert(program.to_owned(), response);
	}

	#[must_use]
	pub fn calls(&self) -> Vec<(String, Vec<String>)> {
		self.invocations.lock().expect("invocations lock poisoned").clone()
	}
}

impl super::Runner for FakeRunner {
	fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
		self.invocations
			.lock()
			.expect("invocations lock poisoned")
			.push((program.to_owned(), args.to_vec()));
		let scripted = self.scripts.lock().expect("scripts lock poisoned").get(program).cloned();
		let resp = scripted.unwrap_or_default();
		Ok(CommandOutput {
			status_success: resp.status_success,
			status_code: Some(i32::from(!resp.status_success)),
			stdout: resp.stdout,
			stderr: resp.stderr,
		})
	}
}

#[derive(Debug, Clone)]
enum Node {
	File(String),
	Dir,
	Symlink(PathBuf),
}

/// An in-memory tree standing in for a real disk/filesystem.
#[derive(Debug, Default)]
pub struct FakeFilesystem {
	nodes: Mutex<BTreeMap<PathBuf, Node>>,
}

impl super::Filesystem for FakeFilesystem {
	fn read_to_string(&self, path: &Path) -> Result<String> {
		match self.nodes.lock().expect("fs lock poisoned").get(path) {
			Some(Node::File(contents)) => Ok(contents.clone()),
			_ => Err(eyre!("no such file: {}", path.display())),
		}
	}

	fn write(&self, path: &Path, contents: &str) -> Result<()> {
		self.nodes.lock().expect("fs lock poisoned").insert(path.to_owned(), Node::File(contents.to_owned()));
		Ok(())
	}

	fn create_dir_all(&self, path: &Path) -> Result<()> {
		let mut nodes = self.nodes.lock().expect("fs lock poisoned");
		let mut cur = PathBuf::new();
		for component in path.components() {
			cur.push(component);
			nodes.entry(cur.clone()).or_insert(Node::Dir);
		}
		Ok(())
	}

	fn copy(&self, from: &Path, to: &Path) -> Result<()> {
		let contents = self.read_to_string(from)?;
		self.write(to, &contents)
	}

	fn rename(&self, from: &Path, to: &Path) -> Result<()> {
		let mut nodes = self.nodes.lock().expect("fs lock poisoned");
		let node = nodes.remove(from).ok_or_else(|| eyre!("no such path: {}", from.display()))?;
		nodes.insert(to.to_owned(), node);
		Ok(())
	}

	fn symlink(&self, original: &Path, link: &Path) -> Result<()> {
		self.nodes
			.lock()
			.expect("fs lock poisoned")
			.insert(link.to_owned(), Node::Symlink(original.to_owned()));
		Ok(())
	}

	fn read_link(&self, path: &Path) -> Result<PathBuf> {
		match self.nodes.lock().expect("fs lock poisoned").get(path) {
			Some(Node::Symlink(target)) => Ok(target.clone()),
			_ => Err(eyre!("not a symlink: {}", path.display())),
		}
	}

	fn remove_file(&self, path: &Path) -> Result<()> {
		self.nodes.lock().expect("fs lock poisoned").remove(path);
		Ok(())
	}

	fn remove_dir_all(&self, path: &Path) -> Result<()> {
		self.nodes.lock().expect("fs lock poisoned").retain(|p, _| !p.starts_with(path));
		Ok(())
	}

	fn exists(&self, path: &Path) -> bool {
		self.nodes.lock().expect("fs lock poisoned").contains_key(path)
	}

	fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
		Ok(self
			.nodes
			.lock()
			.expect("fs lock poisoned")
			.keys()
			.filter(|p| p.parent() == Some(path))
			.cloned()
			.collect())
	}
}

#[derive(Debug, Default)]
pub struct FakeMounter {
	active: Mutex<Vec<MountEntry>>,
}

impl super::Mounter for FakeMounter {
	fn mount(&self, device: &str, mountpoint: &Path, _fstype: &str) -> Result<()> {
		self.active
			.lock()
			.expect("mount table lock poisoned")
			.push(MountEntry { device: device.to_owned(), mountpoint: mountpoint.to_owned() });
		Ok(())
	}

	fn unmount(&self, mountpoint: &Path) -> Result<()> {
		self.active.lock().expect("mount table lock poisoned").retain(|m| m.mountpoint != mountpoint);
		Ok(())
	}

	fn mounted(&self) -> Vec<MountEntry> {
		self.active.lock().expect("mount table lock poisoned").clone()
	}
}

#[derive(Debug, Default)]
pub struct FakeEfiVarStore {
	vars: Mutex<BTreeMap<String, EfiVariable>>,
}

impl super::EfiVarStore for FakeEfiVarStore {
	fn list_boot_entries(&self) -> Result<Vec<EfiVariable>> {
		Ok(self
			.vars
			.lock()
			.expect("efi vars lock poisoned")
			.iter()
			.filter(|(name, _)| name.starts_with("Boot") && *name != "BootOrder" && name.len() == 8)
			.map(|(_, v)| v.clone())
			.collect())
	}

	fn read(&self, name: &str) -> Result<Option<EfiVariable>> {
		Ok(self.vars.lock().expect("efi vars lock poisoned").get(name).cloned())
	}

	fn write(&self, var: EfiVariable) -> Result<()> {
		self.vars.lock().expect("efi vars lock poisoned").insert(var.name.clone(), var);
		Ok(())
	}

	fn delete(&self, name: &str) -> Result<()> {
		self.vars.lock().expect("efi vars lock poisoned").remove(name);
		Ok(())
	}
}

/// Stands in for a real OCI/squashfs unpack: materializes the files a real
/// system image would carry (an EFI payload for every architecture's
/// discovery patterns, plus `/etc/os-release`) into the shared fake
/// filesystem, so downstream bootloader discovery and `set_default_entry`
/// have something to find.
#[derive(Debug)]
pub struct FakeImageExtractor {
	fs: Arc<FakeFilesystem>,
	/// Extra file to materialize under the target dir for every `extract`
	/// call, so a test can assert a specific path came into existence.
	pub marker_file: Mutex<Option<(String, String)>>,
}

impl FakeImageExtractor {
	#[must_use]
	pub fn new(fs: Arc<FakeFilesystem>) -> Self {
		Self { fs, marker_file: Mutex::new(None) }
	}
}

impl super::ImageExtractor for FakeImageExtractor {
	fn extract(&self, _source: &ImageSource, target: &Path) -> Result<()> {
		let vendor = target.join("boot/efi/EFI/fedora");
		self.fs.create_dir_all(&vendor)?;
		for name in ["shimx64.efi", "grubx64.efi", "mmx64.efi", "shimaa64.efi", "grubaa64.efi", "mmaa64.efi", "grubriscv64.efi"] {
			self.fs.write(&vendor.join(name), "stub")?;
		}

		let etc = target.join("etc");
		self.fs.create_dir_all(&etc)?;
		self.fs.write(&etc.join("os-release"), "NAME=\"Atomik\"\nGRUB_ENTRY_NAME=\"Atomik Linux\"\n")?;

		if let Some((path, contents)) = self.marker_file.lock().expect("marker lock poisoned").clone() {
			self.fs.write(&target.join(path), &contents)?;
		}
		Ok(())
	}
}

#[derive(Debug, Default)]
pub struct FakeCloudInitExecutor {
	pub stages_run: Mutex<Vec<String>>,
}

impl super::CloudInitExecutor for FakeCloudInitExecutor {
	fn run_stage(&self, stage: &str, _chroot: Option<&Path>) -> Result<()> {
		self.stages_run.lock().expect("stages lock poisoned").push(stage.to_owned());
		Ok(())
	}
}

#[derive(Debug, Default)]
pub struct FakeFeatureInstaller {
	pub installed: Mutex<Vec<String>>,
}

impl super::FeatureInstaller for FakeFeatureInstaller {
	fn install(&self, feature: &str, _target: &Path) -> Result<()> {
		self.installed.lock().expect("installed lock poisoned").push(feature.to_owned());
		Ok(())
	}
}
