//! `BuildISO`: produces a bootable ISO9660 image from `spec.system`, with
//! the bootloader staged directly into the ISO tree rather than a real EFI
//! partition. Extracts into a tree directory, stages the bootloader's
//! `EFI/` hierarchy under it, and shells out to `xorrisofs` using the
//! non-hybrid `--efi-boot` form (the appended-GPT hybrid variant is not
//! reliable enough across tooling versions to depend on here).

use color_eyre::{eyre::eyre, Result};

use crate::{
	bootloader::{grub::GrubCfgContext, Arch, Bootloader},
	cmd,
	config::Config,
	spec::IsoSpec,
};

const ISO_TREE: &str = "iso-tree";
const EFI_BOOT_IMAGE: &str = "boot/efiboot.img";

/// Runs the BuildISO pipeline: extracts `spec.system` into a work tree,
/// stages the bootloader into that tree's `EFI/` hierarchy, then shells out
/// to `xorrisofs` to produce `spec.output_file`.
///
/// # Errors
/// Returns whatever error the failing step raises.
#[tracing::instrument(skip(config, spec))]
pub fn build_iso(config: &Config, spec: &mut IsoSpec) -> Result<()> {
	spec.sanitize()?;
	let caps = &config.capabilities;
	let runner = caps.runner.as_ref();
	let fs = caps.filesystem.as_ref();

	super::stage(caps.cloud_init.as_ref(), "before-build-iso", None)?;

	let tree_dir = config.work_dir.join(ISO_TREE);
	caps.image_extractor.extract(&spec.system, &tree_dir)?;

	super::stage(caps.cloud_init.as_ref(), "after-iso-chroot", Some(&tree_dir))?;

	let arch = Arch::from_tag(&config.arch).ok_or_else(|| eyre!("unsupported target architecture: {}", config.arch))?;
	let bootloader = Bootloader::new(runner, fs, caps.efi_vars.as_ref(), arch, false, false);
	let efi_mount = tree_dir.join("boot/efi");
	let grub_ctx = GrubCfgContext { distro: config.default_grub_entry.clone(), volid: spec.volume_id.clone(), ..GrubCfgContext::default() };
	bootloader.install_efi(&tree_dir, &efi_mount)?;
	bootloader.install_config(&efi_mount, &grub_ctx)?;

	let efi_boot_image = tree_dir.join(EFI_BOOT_IMAGE);
	let tree = tree_dir.display().to_string();
	let output = spec.output_file.display().to_string();
	let efi_boot_name = format!("{}/{}", crate::bootloader::VENDOR_DIR, arch.efi_boot_name());

	cmd!(
		runner,
		"xorrisofs",
		"-R",
		"-J",
		"-V",
		spec.volume_id.clone(),
		"--efi-boot",
		efi_boot_name,
		"-no-emul-boot",
		"-efi-boot-part",
		"--efi-boot-image",
		"--protective-msdos-label",
		tree,
		"-o",
		output
	)?;

	if fs.exists(&efi_boot_image) {
		tracing::debug!(path = %efi_boot_image.display(), "efi boot image staged in tree");
	}

	super::stage(caps.cloud_init.as_ref(), "after-build-iso", None)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{capability::Capabilities, spec::source::ImageSource};

	#[test]
	fn build_iso_extracts_stages_the_bootloader_and_shells_out_to_xorrisofs() {
		let mut config = Config::defaults();
		config.arch = "x86_64".to_owned();
		config.capabilities = Capabilities::mock();
		let mut spec =
			IsoSpec { system: ImageSource::Oci { reference: "os:latest".to_owned() }, output_file: "/tmp/atomik.iso".into(), volume_id: "ATOMIK".to_owned() };

		build_iso(&config, &mut spec).unwrap();
	}

	#[test]
	fn sanitize_truncates_an_overlong_volume_id() {
		let mut spec = IsoSpec {
			system: ImageSource::Oci { reference: "os:latest".to_owned() },
			output_file: "/tmp/atomik.iso".into(),
			volume_id: "A".repeat(40),
		};
		spec.sanitize().unwrap();
		assert_eq!(spec.volume_id.len(), 32);
	}
}
