//! The process-wide, fully-resolved `Config`, and the CLI surface that
//! builds it: `dotenvy` + `clap::Parser` + `ATOMIK_*`-prefixed environment
//! variables, layered over a YAML config file and built-in defaults.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::capability::Capabilities;

/// Resolved, process-wide configuration, threaded explicitly through every
/// action as a parameter rather than stashed behind a global.
pub struct Config {
	pub arch: String,
	/// Staging directory root for in-progress work (snapshot population,
	/// ISO trees, ...).
	pub work_dir: PathBuf,
	pub log_level: String,
	pub dry_run: bool,
	pub default_grub_entry: String,
	pub capabilities: Capabilities,
}

impl std::fmt::Debug for Config {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Config")
			.field("arch", &self.arch)
			.field("work_dir", &self.work_dir)
			.field("log_level", &self.log_level)
			.field("dry_run", &self.dry_run)
			.field("default_grub_entry", &self.default_grub_entry)
			.finish_non_exhaustive()
	}
}

/// The on-disk, partially-populated YAML config file layer. Every field is
/// optional — unset fields fall through to the built-in default, then to
/// environment variables, then to CLI flags (lowest to highest precedence).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileConfig {
	pub arch: Option<String>,
	pub work_dir: Option<PathBuf>,
	pub log_level: Option<String>,
	pub default_grub_entry: Option<String>,
}

impl FileConfig {
	/// Loads a `FileConfig` from `path`. A missing file is not an error —
	/// it simply yields all-`None`, so the lower layers take over.
	pub fn load(path: &std::path::Path) -> color_eyre::Result<Self> {
		if !path.exists() {
			return Ok(Self::default());
		}
		let raw = std::fs::read_to_string(path)?;
		Ok(serde_yaml::from_str(&raw)?)
	}
}

/// Environment-variable layer, read with the `ATOMIK_` prefix via clap's
/// `env` feature at the CLI layer; this struct documents the var names in
/// one place for the config file/CLI-flag precedence resolution below.
#[derive(Debug, Clone, Default)]
struct EnvConfig {
	arch: Option<String>,
	work_dir: Option<PathBuf>,
	log_level: Option<String>,
	default_grub_entry: Option<String>,
}

impl EnvConfig {
	fn from_process_env() -> Self {
		Self {
			arch: std::env::var("ATOMIK_ARCH").ok(),
			work_dir: std::env::var("ATOMIK_WORK_DIR").ok().map(PathBuf::from),
			log_level: std::env::var("ATOMIK_LOG").ok(),
			default_grub_entry: std::env::var("ATOMIK_GRUB_DEFAULT_ENTRY").ok(),
		}
	}
}

const DEFAULT_WORK_DIR: &str = "atomik-work";
const DEFAULT_GRUB_ENTRY: &str = "Linux";

impl Config {
	/// Built-in defaults, with no capability wiring -- used by tests and by
	/// `sanitize()` unit tests that need a `Config` without spinning up a
	/// real `Capabilities::host()`.
	#[must_use]
	pub fn defaults() -> Self {
		Self {
			arch: std::env::consts::ARCH.to_owned(),
			work_dir: PathBuf::from(DEFAULT_WORK_DIR),
			log_level: "info".to_owned(),
			dry_run: false,
			default_grub_entry: DEFAULT_GRUB_ENTRY.to_owned(),
			capabilities: Capabilities::mock(),
		}
	}

	/// Builds the fully-resolved `Config` by layering CLI flags over
	/// environment variables over the YAML file over built-in defaults, and
	/// wiring up the real, host-backed capability set.
	#[must_use]
	pub fn resolve(cli: &Cli, file: &FileConfig) -> Self {
		let env = EnvConfig::from_process_env();
		let arch = cli
			.arch
			.clone()
			.or_else(|| env.arch.clone())
			.or_else(|| file.arch.clone())
			.unwrap_or_else(|| std::env::consts::ARCH.to_owned());
		let work_dir = cli
			.work_dir
			.clone()
			.or_else(|| env.work_dir.clone())
			.or_else(|| file.work_dir.clone())
			.unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR));
		let log_level = cli
			.log_level
			.clone()
			.or_else(|| env.log_level.clone())
			.or_else(|| file.log_level.clone())
			.unwrap_or_else(|| "info".to_owned());
		let default_grub_entry = cli
			.grub_default_entry
			.clone()
			.or(env.default_grub_entry)
			.or_else(|| file.default_grub_entry.clone())
			.unwrap_or_else(|| DEFAULT_GRUB_ENTRY.to_owned());

		Self { arch, work_dir, log_level, dry_run: cli.dry_run, default_grub_entry, capabilities: Capabilities::host() }
	}
}

/// The lifecycle action invoked on the CLI.
#[derive(Parser, Debug, Clone)]
pub enum Action {
	/// Install onto a target block device.
	Install {
		target_disk: PathBuf,
		#[arg(long)]
		system: String,
		#[arg(long)]
		force: bool,
	},
	/// Upgrade the running system's active snapshot.
	Upgrade {
		#[arg(long)]
		system: String,
		#[arg(long)]
		recovery_upgrade: bool,
	},
	/// Reinstall into a fresh snapshot on an already-deployed State partition.
	Reset {
		#[arg(long)]
		system: String,
		#[arg(long)]
		state_mountpoint: PathBuf,
	},
	/// Build a disk image file instead of installing onto a real device.
	BuildDisk {
		target_disk: PathBuf,
		#[arg(long)]
		system: String,
		#[arg(long)]
		output_file: PathBuf,
		#[arg(long, default_value_t = 8192)]
		disk_size_mib: u64,
	},
	/// Build a bootable ISO9660 image.
	BuildIso {
		#[arg(long)]
		system: String,
		#[arg(long)]
		output_file: PathBuf,
		#[arg(long, default_value = "ATOMIK-LIVEOS")]
		volume_id: String,
	},
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Immutable-OS lifecycle toolkit: install, upgrade, reset, and build images")]
pub struct Cli {
	#[command(subcommand)]
	pub action: Action,

	/// YAML config file location.
	#[arg(short, long, default_value = "/etc/atomik/config.yaml")]
	pub config: PathBuf,

	#[arg(long, env = "ATOMIK_ARCH")]
	pub arch: Option<String>,

	#[arg(long, env = "ATOMIK_WORK_DIR")]
	pub work_dir: Option<PathBuf>,

	#[arg(long, env = "ATOMIK_LOG")]
	pub log_level: Option<String>,

	#[arg(long, env = "ATOMIK_GRUB_DEFAULT_ENTRY")]
	pub grub_default_entry: Option<String>,

	/// Plan the operation and log every step without touching the disk.
	#[arg(long)]
	pub dry_run: bool,
}
