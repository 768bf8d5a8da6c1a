//! Capability ports the core talks through.
//!
//! Everything that touches hardware goes through these two traits so a test
//! can swap in a mock carrying its own MSR map, VMCS field map, and
//! translation behavior. The coordinator borrows a port for the duration of
//! a launch and never stores it beyond.

use {crate::error::HypervisorError, log::error};

/// The VMX instruction surface plus the two read-only probes the checker
/// needs. Every method either completes synchronously or reports failure;
/// there is no hidden state behind the trait.
pub trait Intrinsics {
    /// Reads the MSR at `msr`.
    fn read_msr(&self, msr: u32) -> u64;

    /// Executes CPUID with `leaf` in EAX and returns EAX.
    fn cpuid_eax(&self, leaf: u32) -> u32;

    /// Reads a VMCS field, `None` when the instruction reports failure.
    fn vmread(&self, field: u64) -> Option<u64>;

    /// Writes a VMCS field, `false` when the instruction reports failure.
    fn vmwrite(&self, field: u64, value: u64) -> bool;

    /// Makes the VMCS at `phys` current.
    fn vmptrld(&self, phys: &u64) -> bool;

    /// Clears the launch state of the VMCS at `phys`.
    fn vmclear(&self, phys: &u64) -> bool;

    /// Enters the guest. Returns `false` when VM entry is refused.
    fn vmlaunch(&self) -> bool;
}

/// Address translation owned by the embedder's memory manager.
pub trait MemoryManager {
    /// Physical address backing `virt`, or 0 when unmappable.
    fn virt_to_phys(&self, virt: *const u8) -> u64;

    /// Virtual mapping of `phys`, or null when unmappable.
    fn phys_to_virt(&self, phys: u64) -> *const u8;
}

/// Reads `field` from the current VMCS.
///
/// This and [`vmwrite`] are the only primitives the rest of the core uses to
/// touch the VMCS.
pub fn vmread(intrinsics: &dyn Intrinsics, field: u64) -> Result<u64, HypervisorError> {
    match intrinsics.vmread(field) {
        Some(value) => Ok(value),
        None => {
            error!("vmread failed for field {:#x}", field);
            Err(HypervisorError::VmreadFailed(field))
        }
    }
}

/// Writes `value` into `field` of the current VMCS.
pub fn vmwrite<V: Into<u64>>(intrinsics: &dyn Intrinsics, field: u64, value: V) -> Result<(), HypervisorError> {
    let value = value.into();

    if !intrinsics.vmwrite(field, value) {
        error!("vmwrite failed for field {:#x} value {:#x}", field, value);
        return Err(HypervisorError::VmwriteFailed(field));
    }

    Ok(())
}
