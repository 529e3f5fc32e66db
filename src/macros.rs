//! Shell-out helper macros that dispatch through a
//! [`crate::capability::Runner`] so every invocation is mockable.

/// Runs a host command through a [`crate::capability::Runner`], logging the
/// invocation at `debug` and returning the combined stdout on success.
///
/// ```ignore
/// let out = cmd!(runner, "mkfs.ext4", "-L", &label, &devname)?;
/// ```
///
/// On non-zero exit, returns `Err` with the command, its exit status, and the
/// combined stdout+stderr attached as a [`color_eyre::Section`].
#[macro_export]
macro_rules! cmd {
	($runner:expr, $program:expr $(, $arg:expr)* $(,)?) => {{
		let program: &str = ::std::convert::AsRef::<str>::as_ref(&$program);
		let args: Vec<String> = vec![$(ToString::to_string(&$arg),)*];
		tracing::debug!(program, ?args, "running command");
		$crate::capability::run_checked($runner, program, &args)
	}};
}

/// Renders an embedded Tera template (`tpl!("grub.cfg.tera" => { distro,
/// volid, ... })`), returning the rendered `String` so the caller can hand
/// it to a [`crate::capability::Filesystem`] and stay mockable.
#[macro_export]
macro_rules! tpl {
	($path:literal => { $($key:ident : $val:expr),* $(,)? }) => {{
		let mut ctx = ::tera::Context::new();
		$(ctx.insert(stringify!($key), &$val);)*
		let template = include_str!(concat!("../templates/", $path));
		::tera::Tera::one_off(template, &ctx, false)
			.map_err(|e| color_eyre::eyre::eyre!("template {} failed to render: {e}", $path))
	}};
}
