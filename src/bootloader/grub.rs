//! grub.cfg templating and the `grub2-editenv`/`grub-editenv` wrapper: a
//! tera-templated grub.cfg with a prepended generated-file comment, plus
//! shell-outs that drive the grub environment file (`SetDefaultEntry`/
//! `SetPersistentVariables`).

use color_eyre::Result;

use crate::{capability::Runner, cmd};

/// The fields the grub.cfg template needs: `distro`, `volid`, `vmlinuz`,
/// `initramfs`, `cmd`, plus a comment banner.
pub struct GrubCfgContext {
	pub prepend: String,
	pub distro: String,
	pub volid: String,
	pub vmlinuz: String,
	pub initramfs: String,
	pub cmd: String,
}

impl Default for GrubCfgContext {
	fn default() -> Self {
		Self {
			prepend: "# Managed by atomik -- local edits will be overwritten".to_owned(),
			distro: "Linux".to_owned(),
			volid: String::new(),
			vmlinuz: "vmlinuz".to_owned(),
			initramfs: "initramfs.img".to_owned(),
			cmd: String::new(),
		}
	}
}

/// Renders `templates/grub.cfg.tera` against `ctx`.
///
/// # Errors
/// Returns an error if the template fails to render (malformed context
/// values are the only realistic cause; the template itself is fixed).
pub fn render_grub_cfg(ctx: &GrubCfgContext) -> Result<String> {
	let GrubCfgContext { prepend, distro, volid, vmlinuz, initramfs, cmd } = ctx;
	crate::tpl!("grub.cfg.tera" => { prepend, distro, volid, vmlinuz, initramfs, cmd })
}

/// Picks whichever `grub2-editenv`/`grub-editenv` binary is on `PATH`,
/// preferring the `grub2-` prefixed name the way Fedora-family distros ship
/// it.
pub fn editenv_binary(runner: &dyn Runner) -> &'static str {
	if cmd!(runner, "grub2-editenv", "--version").is_ok() { "grub2-editenv" } else { "grub-editenv" }
}

/// Writes `default_menu_entry=<value>` to `envfile` via the detected
/// editenv binary.
///
/// # Errors
/// Returns [`crate::error::ActionError::GrubEditenv`] if the tool invocation
/// fails.
pub fn set_default_menu_entry(runner: &dyn Runner, envfile: &str, value: &str) -> Result<()> {
	set_persistent_variable(runner, envfile, "default_menu_entry", value)
}

/// Writes one key/value pair to the grub environment file.
///
/// # Errors
/// Returns [`crate::error::ActionError::GrubEditenv`] if the tool invocation
/// fails.
pub fn set_persistent_variable(runner: &dyn Runner, envfile: &str, key: &str, value: &str) -> Result<()> {
	let tool = editenv_binary(runner);
	cmd!(runner, tool, envfile.to_owned(), "set", format!("{key}={value}"))
		.map_err(|_| crate::error::ActionError::GrubEditenv)?;
	Ok(())
}

/// Writes every key/value pair in `vars` to `envfile`, in iteration order.
///
/// # Errors
/// Returns [`crate::error::ActionError::GrubEditenv`] if any invocation
/// fails; earlier writes are not rolled back (each is independently atomic
/// at the tool level).
pub fn set_persistent_variables(
	runner: &dyn Runner, envfile: &str, vars: &std::collections::BTreeMap<String, String>,
) -> Result<()> {
	for (key, value) in vars {
		set_persistent_variable(runner, envfile, key, value)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::capability::mock::{FakeRunner, ScriptedResponse};

	#[test]
	fn renders_the_expected_fields_into_grub_cfg() {
		let ctx = GrubCfgContext {
			distro: "Atomik Linux".to_owned(),
			volid: "COS_STATE".to_owned(),
			cmd: "quiet splash".to_owned(),
			..Default::default()
		};
		let rendered = render_grub_cfg(&ctx).unwrap();
		assert!(rendered.contains("Atomik Linux"));
		assert!(rendered.contains("COS_STATE"));
		assert!(rendered.contains("quiet splash"));
	}

	#[test]
	fn falls_back_to_grub_editenv_when_grub2_editenv_is_absent() {
		let runner = FakeRunner::default();
		runner.script("grub2-editenv", ScriptedResponse { status_success: false, ..Default::default() });
		assert_eq!(editenv_binary(&runner), "grub-editenv");
	}

	#[test]
	fn set_persistent_variables_invokes_editenv_per_key() {
		let runner = FakeRunner::default();
		let mut vars = std::collections::BTreeMap::new();
		vars.insert("default_menu_entry".to_owned(), "1".to_owned());
		vars.insert("saved_entry".to_owned(), "1".to_owned());
		set_persistent_variables(&runner, "/boot/grub2/grubenv", &vars).unwrap();
		let calls = runner.calls();
		assert_eq!(calls.iter().filter(|(p, _)| p == "grub2-editenv").count(), 2);
	}
}
