//! `ImageSource`, `Image`, and `SystemState` — the tagged-union source
//! description and the installed-root bookkeeping record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A tagged source for OS content: an empty placeholder, a local directory,
/// a single file (squashfs/tar image), an OCI image reference, or a named
/// channel package. Parsed from a URI whose scheme selects the variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ImageSource {
	Empty,
	Dir { path: std::path::PathBuf },
	File { path: std::path::PathBuf },
	Oci { reference: String },
	Channel { package: String },
}

impl ImageSource {
	#[must_use]
	pub const fn is_empty(&self) -> bool {
		matches!(self, Self::Empty)
	}

	/// Render back to the URI form this was parsed from, for embedding in
	/// `InstallState`/`SystemState`.
	#[must_use]
	pub fn to_uri(&self) -> String {
		match self {
			Self::Empty => String::new(),
			Self::Dir { path } => format!("dir://{}", path.display()),
			Self::File { path } => format!("file://{}", path.display()),
			Self::Oci { reference } => format!("oci://{reference}"),
			Self::Channel { package } => format!("channel://{package}"),
		}
	}
}

impl std::str::FromStr for ImageSource {
	type Err = color_eyre::Report;

	/// Parses `dir://`, `file://`, `docker://`/`oci://`, `channel://`, or an
	/// unqualified reference (defaulted to `oci://<ref>:latest` when no tag
	/// is present).
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.is_empty() {
			return Ok(Self::Empty);
		}
		if let Some(path) = s.strip_prefix("dir://") {
			return Ok(Self::Dir { path: path.into() });
		}
		if let Some(path) = s.strip_prefix("file://") {
			return Ok(Self::File { path: path.into() });
		}
		if let Some(reference) = s.strip_prefix("docker://") {
			return Ok(Self::Oci { reference: reference.to_owned() });
		}
		if let Some(reference) = s.strip_prefix("oci://") {
			return Ok(Self::Oci { reference: reference.to_owned() });
		}
		if let Some(package) = s.strip_prefix("channel://") {
			return Ok(Self::Channel { package: package.to_owned() });
		}
		let reference = if s.contains(':') { s.to_owned() } else { format!("{s}:latest") };
		Ok(Self::Oci { reference })
	}
}

/// A target filesystem artifact to materialize: where it comes from, what
/// it's formatted/labeled as, and (once written) its digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
	pub source: ImageSource,
	pub label: String,
	pub filesystem: String,
	pub size_mib: u64,
	pub mountpoint: Option<String>,
	/// Backing file path, populated for loop-device-mode images.
	pub target_file: Option<std::path::PathBuf>,
	pub digest: Option<String>,
}

/// A concrete installed root: "what is installed in slot N?" Recorded
/// inside `PartitionState.snapshots`/`recovery_image`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemState {
	pub source: String,
	pub label: String,
	pub filesystem: String,
	pub digest: String,
	#[serde(default)]
	pub labels: BTreeMap<String, String>,
}

impl SystemState {
	#[must_use]
	pub fn from_image(image: &Image) -> Self {
		Self {
			source: image.source.to_uri(),
			label: image.label.clone(),
			filesystem: image.filesystem.clone(),
			digest: image.digest.clone().unwrap_or_default(),
			labels: BTreeMap::new(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_explicit_schemes() {
		assert_eq!("dir:///srv/root".parse::<ImageSource>().unwrap(), ImageSource::Dir { path: "/srv/root".into() });
		assert_eq!(
			"oci://registry.example/os:42".parse::<ImageSource>().unwrap(),
			ImageSource::Oci { reference: "registry.example/os:42".to_owned() }
		);
		assert_eq!(
			"docker://registry.example/os:42".parse::<ImageSource>().unwrap(),
			ImageSource::Oci { reference: "registry.example/os:42".to_owned() }
		);
		assert_eq!("".parse::<ImageSource>().unwrap(), ImageSource::Empty);
	}

	#[test]
	fn unqualified_reference_defaults_to_oci_latest() {
		assert_eq!(
			"registry.example/os".parse::<ImageSource>().unwrap(),
			ImageSource::Oci { reference: "registry.example/os:latest".to_owned() }
		);
	}

	#[test]
	fn round_trips_through_uri() {
		let src = ImageSource::Oci { reference: "registry.example/os:42".to_owned() };
		assert_eq!(src.to_uri().parse::<ImageSource>().unwrap(), src);
	}
}
