//! VMCS management core for Intel VT-x.
//!
//! This crate owns the life cycle of a Virtual Machine Control Structure:
//! allocating and revision-stamping the 4 KiB region, populating the
//! guest/host/control field sets from a caller-supplied state snapshot,
//! synthesizing execution controls under the processor's allowed-0/allowed-1
//! capability MSRs, and launching the guest. When `VMLAUNCH` refuses, the
//! architectural checks the CPU performed are re-run so the failure names
//! the violated rule.
//!
//! Hardware access goes through the [`intel::ports`] traits, so the whole
//! core runs against mock ports in unit tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod global_const;
pub mod intel;
pub mod logger;
