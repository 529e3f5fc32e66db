#![warn(clippy::complexity)]
#![warn(clippy::correctness)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![warn(clippy::perf)]
#![warn(clippy::style)]
#![warn(clippy::suspicious)]
// followings are from clippy::restriction
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::missing_panics_doc)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::format_push_string)]
#![warn(clippy::get_unwrap)]
#![allow(clippy::missing_inline_in_public_items)]
#![allow(clippy::implicit_return)]
#![allow(clippy::blanket_clippy_restriction_lints)]
#![allow(clippy::pattern_type_mismatch)]

use std::process::ExitCode;

use clap::Parser;
use color_eyre::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

use atomik::{
	actions, error,
	config::{Action, Cli, Config, FileConfig},
	spec::{self, install::new_install_spec, source::ImageSource, IsoSpec, ResetSpec, SnapshotterSpec, UpgradeSpec},
};

/// Well-known mountpoints for the running system's own partitions, used by
/// `Upgrade`/`Reset` since those actions act on an already-deployed target
/// rather than a disk they just partitioned themselves.
const RUNNING_STATE_MOUNT: &str = "/run/atomik/state";
const RUNNING_RECOVERY_MOUNT: &str = "/run/atomik/recovery";

fn main() -> ExitCode {
	if let Err(e) = dotenvy::dotenv() {
		if !e.not_found() {
			eprintln!("failed to load .env: {e}");
			return ExitCode::from(error::UNKNOWN_EXIT_CODE.try_into().unwrap_or(255));
		}
	}

	if let Err(e) = color_eyre::install() {
		eprintln!("failed to install color_eyre: {e}");
	}

	let cli = Cli::parse();
	let filter = EnvFilter::try_from_env("ATOMIK_LOG").unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone().unwrap_or_else(|| "info".to_owned())));
	let fmtlyr = fmt::layer().pretty().with_filter(filter);
	let subscriber = Registry::default().with(tracing_error::ErrorLayer::default()).with(fmtlyr);
	if tracing::subscriber::set_global_default(subscriber).is_err() {
		eprintln!("a tracing subscriber is already installed");
	}

	if let Err(e) = sudo::escalate_if_needed() {
		tracing::error!(%e, "failed to escalate privileges");
		return ExitCode::from(error::UNKNOWN_EXIT_CODE.try_into().unwrap_or(255));
	}

	match run(&cli) {
		Ok(()) => ExitCode::SUCCESS,
		Err(report) => {
			tracing::error!("{report:?}");
			let code = error::exit_code_for(&report);
			ExitCode::from(code.try_into().unwrap_or(255))
		},
	}
}

fn run(cli: &Cli) -> Result<()> {
	let file = FileConfig::load(&cli.config)?;
	let config = Config::resolve(cli, &file);
	tracing::trace!(?config, "resolved configuration");

	if config.dry_run {
		tracing::warn!("--dry-run is set but this build does not yet short-circuit host mutations; proceeding");
	}

	match cli.action.clone() {
		Action::Install { target_disk, system, force } => {
			let system = system.parse::<ImageSource>()?;
			let mut spec = new_install_spec(&config, target_disk, system);
			spec.force = force;
			actions::install(&config, &mut spec)
		},
		Action::Upgrade { system, recovery_upgrade } => {
			let system = system.parse::<ImageSource>()?;
			let mut spec = UpgradeSpec { system, recovery_upgrade, recovery_system: ImageSource::Empty };
			let snapshotter_spec = SnapshotterSpec::default();
			actions::upgrade(
				&config,
				&mut spec,
				&snapshotter_spec,
				std::path::Path::new(RUNNING_STATE_MOUNT),
				Some(std::path::Path::new(RUNNING_RECOVERY_MOUNT)),
				&config.default_grub_entry,
			)
		},
		Action::Reset { system, state_mountpoint } => {
			let system = system.parse::<ImageSource>()?;
			let mut spec = ResetSpec { system, state_mountpoint };
			let snapshotter_spec = SnapshotterSpec::default();
			actions::reset(&config, &mut spec, &snapshotter_spec, &config.default_grub_entry)
		},
		Action::BuildDisk { target_disk, system, output_file, disk_size_mib } => {
			let system = system.parse::<ImageSource>()?;
			let install = new_install_spec(&config, target_disk, system);
			let mut spec = spec::DiskSpec { install, output_file, disk_size_mib };
			actions::build_disk(&config, &mut spec)
		},
		Action::BuildIso { system, output_file, volume_id } => {
			let system = system.parse::<ImageSource>()?;
			let mut spec = IsoSpec { system, output_file, volume_id };
			actions::build_iso(&config, &mut spec)
		},
	}
}
