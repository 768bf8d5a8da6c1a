//! Error taxonomy for the VMCS core.

use thiserror::Error;

/// Which VMX instruction reported failure through RFLAGS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxInstruction {
    Clear,
    Load,
    Launch,
}

/// Every way the VMCS core can fail.
///
/// Nothing in the core retries; each of these surfaces to the caller after
/// the coordinator has released the region and stack in reverse order of
/// acquisition.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("vmcs region allocation failed (no physical mapping)")]
    RegionAllocationFailed,

    #[error("vmx instruction {0:?} failed")]
    VmxInstructionFailed(VmxInstruction),

    #[error("vmread of field {0:#x} failed")]
    VmreadFailed(u64),

    #[error("vmwrite of field {0:#x} failed")]
    VmwriteFailed(u64),

    #[error("architectural check failed: {0}")]
    ArchCheckFailed(&'static str),

    #[error("vmlaunch failed, vm-instruction error {0}")]
    LaunchFailed(u32),

    #[error("resume trampoline returned")]
    ResumeReturned,

    #[error("promote trampoline returned")]
    PromoteReturned,
}
