//! Build-time constants shared across the crate.

/// Size in bytes of the host exit-handler stack.
///
/// The top of this buffer, rounded down to 16 bytes, is what `HOST_RSP`
/// points at when a VM-exit hands control back to the host.
pub const STACK_SIZE: usize = 0x8000;
