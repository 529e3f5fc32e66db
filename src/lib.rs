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

//! `atomik`: an immutable-OS lifecycle toolkit. Spec sanitization ->
//! GPT partitioning -> atomic snapshotting -> GRUB/UEFI bootloader
//! installation, composed by the `actions` layer into `Install`/`Upgrade`/
//! `Reset`/`BuildDisk`/`BuildISO`. Split into a library and a thin `main.rs`
//! binary so `tests/scenarios.rs` can drive full end-to-end scenarios
//! against the mock capability set without a real disk or root.

#[macro_use]
pub mod macros;

pub mod actions;
pub mod bootloader;
pub mod capability;
pub mod config;
pub mod error;
pub mod partitioner;
pub mod snapshot;
pub mod spec;
