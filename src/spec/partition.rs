//! GPT partition types, attribute flags, and the well-known partition set
//! an installed system carries (`oem`/`state`/`recovery`/`persistent`/
//! `efi`/`bios`). The GUID table and attribute-flag bit positions are the
//! UAPI Discoverable Partitions Specification values.

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use crate::error::ActionError;

/// GPT partition attribute flags, from the UAPI Discoverable Partitions
/// Specification's partition-attribute-flags table.
#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionFlag {
	/// Disable auto discovery, preventing automatic mounting.
	NoAuto,
	/// Mount read-only.
	ReadOnly,
	/// Automatically grow the filesystem when mounted.
	GrowFs,
	/// A legacy MBR-style "boot" flag, used on BIOS + MSDOS layouts where
	/// the State partition itself must be marked bootable.
	Boot,
	/// An arbitrary GPT attribute bit position, 0-63.
	#[serde(untagged)]
	BitPosition(u8),
}

impl PartitionFlag {
	#[must_use]
	pub const fn bit_position(&self) -> Option<u8> {
		match self {
			Self::NoAuto => Some(63),
			Self::ReadOnly => Some(60),
			Self::GrowFs => Some(59),
			Self::BitPosition(position) => Some(*position),
			Self::Boot => None,
		}
	}
}

/// A subset of GPT partition type GUIDs from the UAPI Discoverable
/// Partitions Specification. Not the filesystem formatted on the
/// partition — the GPT type, consumed by `sgdisk -t`.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
	/// Root partition for the target architecture, resolved at apply time.
	Root,
	RootArm64,
	RootX86_64,
	Esp,
	Xbootldr,
	Swap,
	LinuxGeneric,
	/// An arbitrary GPT partition type GUID.
	#[serde(untagged)]
	Guid(uuid::Uuid),
}

impl PartitionType {
	/// The GPT partition type GUID for this type, resolving [`Self::Root`]
	/// against `target_arch`.
	///
	/// # Errors
	/// Returns an error if `target_arch` is not `x86_64` or `aarch64` and
	/// this is [`Self::Root`] (no other architecture has a defined Root
	/// type GUID here).
	pub fn guid(&self, target_arch: &str) -> color_eyre::Result<uuid::Uuid> {
		let guid = match self {
			Self::Root => {
				return match target_arch {
					"x86_64" => Self::RootX86_64.guid(target_arch),
					"aarch64" => Self::RootArm64.guid(target_arch),
					other => Err(color_eyre::eyre::eyre!(
						"no defined Root partition type GUID for architecture {other}"
					)),
				}
			},
			Self::RootArm64 => "b921b045-1df0-41c3-af44-4c6f280d3fae",
			Self::RootX86_64 => "4f68bce3-e8cd-4db1-96e7-fbcaf984b709",
			Self::Esp => "c12a7328-f81f-11d2-ba4b-00a0c93ec93b",
			Self::Xbootldr => "bc13c2ff-59e6-4262-a352-b275fd6f7172",
			Self::Swap => "0657fd6d-a4ab-43c4-84e5-0933c84b4f4f",
			Self::LinuxGeneric => "0fc63daf-8483-4772-8e79-3d69d8477de4",
			Self::Guid(guid) => return Ok(*guid),
		};
		Ok(uuid::Uuid::parse_str(guid).expect("static GUID literal is well-formed"))
	}
}

/// A stable role for a well-known partition in the elemental layout.
#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionRole {
	Bios,
	Efi,
	Oem,
	State,
	Recovery,
	Persistent,
	/// A user-supplied extra partition, not part of the well-known set.
	Extra,
}

/// One GPT entry: name, label, size, filesystem, flags, mountpoint, and
/// (once provisioned) its device node.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Partition {
	/// Stable identifier: `oem`, `state`, `recovery`, `persistent`, `efi`,
	/// `bios`, or a user-supplied name for extra partitions.
	pub name: String,
	pub role: PartitionRole,
	/// Filesystem label, upper-cased and truncated to 15 chars by `Sanitize`.
	pub label: String,
	#[serde(rename = "type")]
	pub partition_type: PartitionType,
	#[serde(default)]
	pub flags: Vec<PartitionFlag>,
	/// Size in MiB. 0 means "fill remaining"; at most one partition per
	/// disk may have size 0, and it must be placed last.
	pub size_mib: u64,
	/// `ext4|ext2|xfs|vfat|btrfs|squashfs`.
	pub filesystem: String,
	pub mountpoint: Option<String>,
	/// Populated once the disk has actually been partitioned.
	pub device: Option<String>,
	pub parent_disk: Option<String>,
}

impl Partition {
	#[must_use]
	pub fn size(&self) -> ByteSize {
		ByteSize::mib(self.size_mib)
	}

	#[must_use]
	pub const fn fills_remaining(&self) -> bool {
		self.size_mib == 0
	}

	/// Mountpoint depth, used to order mounts shallowest-first. `/` has
	/// depth 0; `/oem/data` has depth 2.
	#[must_use]
	pub fn mount_depth(&self) -> usize {
		self.mountpoint.as_deref().map_or(usize::MAX, |mp| {
			mp.trim_end_matches('/').matches('/').count()
		})
	}
}

/// The well-known partition set for an elemental install: optional
/// firmware partition (BIOS xor EFI), required OEM/State/Recovery,
/// optional Persistent, plus arbitrary extras.
#[derive(Debug, Clone, Default)]
pub struct ElementalPartitions {
	pub bios: Option<Partition>,
	pub efi: Option<Partition>,
	pub oem: Option<Partition>,
	pub state: Option<Partition>,
	pub recovery: Option<Partition>,
	pub persistent: Option<Partition>,
	pub extra: Vec<Partition>,
}

impl ElementalPartitions {
	/// All partitions as a flat list, in the order they were declared
	/// (firmware, oem, state, recovery, persistent, extra).
	#[must_use]
	pub fn all(&self) -> Vec<&Partition> {
		[&self.bios, &self.efi, &self.oem, &self.state, &self.recovery, &self.persistent]
			.into_iter()
			.flatten()
			.chain(self.extra.iter())
			.collect()
	}

	/// Install (partitioning) order: fixed-size partitions in declaration
	/// order, the single size-0 partition (if any) last.
	#[must_use]
	pub fn install_order(&self) -> Vec<&Partition> {
		let mut fixed = Vec::new();
		let mut filling = None;
		for part in self.all() {
			if part.fills_remaining() {
				filling = Some(part);
			} else {
				fixed.push(part);
			}
		}
		if let Some(part) = filling {
			fixed.push(part);
		}
		fixed
	}

	/// Mount order: shallowest mountpoint first (root first, then ascending
	/// slash-count, ties broken alphabetically).
	#[must_use]
	pub fn mount_order(&self) -> Vec<&Partition> {
		let mut mountable: Vec<&Partition> = self.all().into_iter().filter(|p| p.mountpoint.is_some()).collect();
		mountable.sort_by(|a, b| {
			let am = a.mountpoint.as_deref().unwrap_or_default();
			let bm = b.mountpoint.as_deref().unwrap_or_default();
			if am == "/" {
				std::cmp::Ordering::Less
			} else if bm == "/" {
				std::cmp::Ordering::Greater
			} else {
				a.mount_depth().cmp(&b.mount_depth()).then_with(|| am.cmp(bm))
			}
		});
		mountable
	}

	/// Unmount order: reverse of mount order.
	#[must_use]
	pub fn unmount_order(&self) -> Vec<&Partition> {
		let mut order = self.mount_order();
		order.reverse();
		order
	}

	/// Returns an error if two partitions in the set claim the same
	/// well-known name — rejected at `Sanitize()` time per the Design
	/// Notes' "feature conflict resolution" guidance, generalized to
	/// partition-layout conflicts.
	pub fn check_no_duplicate_names(&self) -> color_eyre::Result<()> {
		let mut seen = std::collections::BTreeSet::new();
		for part in self.all() {
			if !seen.insert(&part.name) {
				return Err(ActionError::LabelInvalid(format!(
					"duplicate partition name `{}`",
					part.name
				))
				.into());
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn part(name: &str, role: PartitionRole, mountpoint: Option<&str>, size_mib: u64) -> Partition {
		Partition {
			name: name.to_owned(),
			role,
			label: name.to_uppercase(),
			partition_type: PartitionType::LinuxGeneric,
			flags: vec![],
			size_mib,
			filesystem: "ext4".to_owned(),
			mountpoint: mountpoint.map(ToOwned::to_owned),
			device: None,
			parent_disk: None,
		}
	}

	#[test]
	fn root_guid_resolves_by_arch() {
		assert_eq!(
			PartitionType::Root.guid("x86_64").unwrap(),
			PartitionType::RootX86_64.guid("x86_64").unwrap()
		);
		assert_eq!(
			PartitionType::Root.guid("aarch64").unwrap(),
			PartitionType::RootArm64.guid("aarch64").unwrap()
		);
		assert!(PartitionType::Root.guid("riscv64").is_err());
	}

	#[test]
	fn flag_bit_positions_match_uapi_spec() {
		assert_eq!(PartitionFlag::NoAuto.bit_position(), Some(63));
        assert_eq!(PartitionFlag::ReadOnly.bit_position(), Some(60));
        assert_eq!(PartitionFlag::GrowFs.bit_position(), Some(59));
	}

	#[test]
	fn install_order_places_fill_remaining_last() {
		let layout = ElementalPartitions {
			oem: Some(part("oem", PartitionRole::Oem, Some("/oem"), 100)),
			state: Some(part("state", PartitionRole::State, Some("/run/elemental/state"), 0)),
			recovery: Some(part("recovery", PartitionRole::Recovery, Some("/run/elemental/recovery"), 2048)),
			..Default::default()
		};
		let order: Vec<_> = layout.install_order().into_iter().map(|p| p.name.as_str()).collect();
		assert_eq!(order, vec!["oem", "recovery", "state"]);
	}

	#[test]
	fn mount_order_is_shallowest_first_with_root_winning_ties() {
		let layout = ElementalPartitions {
			persistent: Some(part("persistent", PartitionRole::Persistent, Some("/usr/local"), 0)),
			oem: Some(part("oem", PartitionRole::Oem, Some("/oem"), 100)),
			state: Some(part("state", PartitionRole::State, Some("/"), 4096)),
			..Default::default()
		};
		let order: Vec<_> = layout.mount_order().into_iter().map(|p| p.name.as_str()).collect();
		assert_eq!(order, vec!["state", "oem", "persistent"]);
		let unorder: Vec<_> = layout.unmount_order().into_iter().map(|p| p.name.as_str()).collect();
		assert_eq!(unorder, vec!["persistent", "oem", "state"]);
	}

	#[test]
	fn duplicate_names_rejected() {
		let layout = ElementalPartitions {
			oem: Some(part("dup", PartitionRole::Oem, Some("/oem"), 100)),
			state: Some(part("dup", PartitionRole::State, Some("/state"), 2048)),
			..Default::default()
		};
		assert!(layout.check_no_duplicate_names().is_err());
	}
}
