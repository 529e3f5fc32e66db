//! UEFI load-option codec and `Boot####`/`BootOrder` entry management,
//! built on top of the [`crate::capability::EfiVarStore`] capability.
//! Decodes the payload's internal structure per the UEFI load-option
//! layout: an attributes word, `FilePathListLength`, a UCS-2 description,
//! a file-path device path, and optional trailing data.

use color_eyre::{eyre::eyre, Result};

use crate::{
	capability::{
		host::{EFI_VAR_BOOTSERVICE_ACCESS, EFI_VAR_NON_VOLATILE, EFI_VAR_RUNTIME_ACCESS},
		EfiVarStore, EfiVariable,
	},
	error::ActionError,
};

/// Attributes every entry this crate writes uses: non-volatile,
/// boot-service-accessible, runtime-accessible.
pub const LOAD_OPTION_ATTRIBUTES: u32 = EFI_VAR_NON_VOLATILE | EFI_VAR_BOOTSERVICE_ACCESS | EFI_VAR_RUNTIME_ACCESS;

/// Default boot entry description this crate creates and later matches
/// against when clearing stale entries.
pub const DEFAULT_ENTRY_DESCRIPTION: &str = "elemental-shim";

const MEDIA_DEVICE_PATH_TYPE: u8 = 0x04;
const FILE_PATH_SUBTYPE: u8 = 0x04;
const END_ENTIRE_TYPE: u8 = 0x7F;
const END_ENTIRE_SUBTYPE: u8 = 0xFF;

fn encode_ucs2_nul(s: &str) -> Vec<u8> {
	let mut out = Vec::with_capacity(s.len() * 2 + 2);
	for unit in s.encode_utf16() {
		out.extend_from_slice(&unit.to_le_bytes());
	}
	out.extend_from_slice(&0u16.to_le_bytes());
	out
}

/// Decodes a NUL-terminated UCS-2 string starting at `bytes[0]`, returning
/// the string and the number of bytes consumed (including the terminator).
fn decode_ucs2_nul(bytes: &[u8]) -> Result<(String, usize)> {
	let mut units = Vec::new();
	let mut i = 0;
	while i + 1 < bytes.len() {
		let unit = u16::from_le_bytes([bytes[i], bytes[i + 1]]);
		i += 2;
		if unit == 0 {
			return Ok((String::from_utf16(&units)?, i));
		}
		units.push(unit);
	}
	Err(eyre!("UCS-2 string is not NUL-terminated"))
}

fn encode_file_path_node(device_path: &str) -> Vec<u8> {
	let name = encode_ucs2_nul(device_path);
	let len = u16::try_from(4 + name.len()).unwrap_or(u16::MAX);
	let mut out = Vec::with_capacity(len as usize);
	out.push(MEDIA_DEVICE_PATH_TYPE);
	out.push(FILE_PATH_SUBTYPE);
	out.extend_from_slice(&len.to_le_bytes());
	out.extend_from_slice(&name);
	out
}

fn decode_file_path_node(bytes: &[u8]) -> Result<String> {
	if bytes.len() < 4 {
		return Err(eyre!("device path node shorter than its 4-byte header"));
	}
	let (name, _) = decode_ucs2_nul(&bytes[4..])?;
	Ok(name)
}

/// One decoded EFI `Boot####` load option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOption {
	pub description: String,
	/// Full device path to the boot image, e.g. `\EFI\ELEMENTAL\bootx64.efi`.
	pub device_path: String,
	pub optional_data: Vec<u8>,
}

impl LoadOption {
	#[must_use]
	pub fn new(description: impl Into<String>, device_path: impl Into<String>) -> Self {
		Self { description: description.into(), device_path: device_path.into(), optional_data: Vec::new() }
	}

	/// Encodes to the raw payload `EfiVarStore` stores after the 4-byte
	/// attribute header (`FilePathListLength` + description + device path +
	/// optional data).
	#[must_use]
	pub fn encode(&self) -> Vec<u8> {
		let end_node = [END_ENTIRE_TYPE, END_ENTIRE_SUBTYPE, 4, 0];
		let file_path_node = encode_file_path_node(&self.device_path);
		let mut file_path_list = Vec::with_capacity(file_path_node.len() + end_node.len());
		file_path_list.extend_from_slice(&file_path_node);
		file_path_list.extend_from_slice(&end_node);

		let description = encode_ucs2_nul(&self.description);

		let mut out = Vec::with_capacity(2 + description.len() + file_path_list.len() + self.optional_data.len());
		out.extend_from_slice(&u16::try_from(file_path_list.len()).unwrap_or(u16::MAX).to_le_bytes());
		out.extend_from_slice(&description);
		out.extend_from_slice(&file_path_list);
		out.extend_from_slice(&self.optional_data);
		out
	}

	/// Decodes a raw load-option payload.
	///
	/// # Errors
	/// Returns an error if the payload is truncated or contains malformed
	/// UCS-2 text.
	pub fn decode(data: &[u8]) -> Result<Self> {
		if data.len() < 2 {
			return Err(eyre!("load option payload shorter than its length prefix"));
		}
		let file_path_list_len = usize::from(u16::from_le_bytes([data[0], data[1]]));
		let (description, desc_len) = decode_ucs2_nul(&data[2..])?;
		let file_path_start = 2 + desc_len;
		let file_path_end = file_path_start
			.checked_add(file_path_list_len)
			.ok_or_else(|| eyre!("load option file-path-list length overflows"))?;
		let file_path_bytes =
			data.get(file_path_start..file_path_end).ok_or_else(|| eyre!("load option payload truncated"))?;
		let device_path = decode_file_path_node(file_path_bytes)?;
		let optional_data = data.get(file_path_end..).unwrap_or_default().to_vec();
		Ok(Self { description, device_path, optional_data })
	}
}

fn slot_name(slot: u16) -> String {
	format!("Boot{slot:04X}")
}

fn slot_number(name: &str) -> Option<u16> {
	name.strip_prefix("Boot").and_then(|hex| u16::from_str_radix(hex, 16).ok())
}

fn encode_boot_order(slots: &[u16]) -> Vec<u8> {
	let mut out = Vec::with_capacity(slots.len() * 2);
	for slot in slots {
		out.extend_from_slice(&slot.to_le_bytes());
	}
	out
}

fn decode_boot_order(data: &[u8]) -> Vec<u16> {
	data.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]])).collect()
}

/// The lowest-numbered `Boot####` slot not currently occupied.
///
/// # Errors
/// Returns [`ActionError::EfiEntrySlotsExhausted`] if all 65536 slots are in
/// use.
pub fn lowest_free_slot(efi_vars: &dyn EfiVarStore) -> Result<u16> {
	let taken: std::collections::BTreeSet<u16> =
		efi_vars.list_boot_entries()?.iter().filter_map(|v| slot_number(&v.name)).collect();
	(0..=u16::MAX).find(|slot| !taken.contains(slot)).ok_or_else(|| ActionError::EfiEntrySlotsExhausted.into())
}

/// Creates a `Boot####` entry for `option`, reusing an existing slot whose
/// description and device path already match, or allocating the lowest
/// free slot otherwise. Returns the slot name (`Boot####`) in either case.
///
/// # Errors
/// Returns [`ActionError::EfiEntrySlotsExhausted`] when no slot is free.
pub fn create_or_reuse_entry(efi_vars: &dyn EfiVarStore, option: &LoadOption) -> Result<String> {
	for existing in efi_vars.list_boot_entries()? {
		if let Ok(decoded) = LoadOption::decode(&existing.data) {
			if decoded.description == option.description && decoded.device_path == option.device_path {
				return Ok(existing.name);
			}
		}
	}
	let slot = lowest_free_slot(efi_vars)?;
	let name = slot_name(slot);
	efi_vars.write(EfiVariable { name: name.clone(), attributes: LOAD_OPTION_ATTRIBUTES, data: option.encode() })?;
	Ok(name)
}

/// Prepends `slot_name` to `BootOrder`, creating `BootOrder` with just this
/// entry if it doesn't exist yet (per the resolved Open Question: default
/// attributes, contents `[new-entry]`).
pub fn prepend_boot_order(efi_vars: &dyn EfiVarStore, slot_name: &str) -> Result<()> {
	let Some(slot) = slot_number(slot_name) else { return Err(eyre!("not a Boot#### slot name: {slot_name}")) };
	let mut order = match efi_vars.read("BootOrder")? {
		Some(var) => decode_boot_order(&var.data),
		None => Vec::new(),
	};
	order.retain(|existing| *existing != slot);
	order.insert(0, slot);
	efi_vars.write(EfiVariable {
		name: "BootOrder".to_owned(),
		attributes: LOAD_OPTION_ATTRIBUTES,
		data: encode_boot_order(&order),
	})
}

/// Deletes every `Boot####` entry whose decoded description matches
/// `description`.
pub fn clear_entries_named(efi_vars: &dyn EfiVarStore, description: &str) -> Result<()> {
	for existing in efi_vars.list_boot_entries()? {
		if let Ok(decoded) = LoadOption::decode(&existing.data) {
			if decoded.description == description {
				efi_vars.delete(&existing.name)?;
			}
		}
	}
	Ok(())
}
