//! Mock ports for unit tests.
//!
//! Each test owns its instances; the MSR map, VMCS field map, and
//! translation toggles live on the mock rather than in process-wide state.

#![cfg(test)]

use {
    crate::intel::ports::{Intrinsics, MemoryManager},
    alloc::collections::BTreeMap,
    core::cell::{Cell, RefCell},
    x86::msr,
};

/// An [`Intrinsics`] port backed by in-memory maps and failure toggles.
pub struct MockIntrinsics {
    pub msrs: RefCell<BTreeMap<u32, u64>>,
    pub vmcs_fields: RefCell<BTreeMap<u64, u64>>,
    pub cpuid_eax_leaves: RefCell<BTreeMap<u32, u32>>,

    pub fail_vmread: Cell<bool>,
    pub fail_vmwrite: Cell<bool>,
    pub fail_vmptrld: Cell<bool>,
    pub fail_vmclear: Cell<bool>,
    pub fail_vmlaunch: Cell<bool>,

    pub vmptrld_called: Cell<bool>,
    pub vmclear_called: Cell<bool>,
    pub vmwrite_calls: Cell<usize>,
}

/// Permissive capability word: nothing forced on, everything allowed.
const PERMISSIVE_CAP: u64 = 0xFFFF_FFFFu64 << 32;

impl MockIntrinsics {
    /// A processor that supports the TRUE capability MSRs, forces no control
    /// bits, allows them all, and reports a 48-bit physical address width.
    pub fn new() -> Self {
        let mock = Self {
            msrs: RefCell::new(BTreeMap::new()),
            vmcs_fields: RefCell::new(BTreeMap::new()),
            cpuid_eax_leaves: RefCell::new(BTreeMap::new()),
            fail_vmread: Cell::new(false),
            fail_vmwrite: Cell::new(false),
            fail_vmptrld: Cell::new(false),
            fail_vmclear: Cell::new(false),
            fail_vmlaunch: Cell::new(false),
            vmptrld_called: Cell::new(false),
            vmclear_called: Cell::new(false),
            vmwrite_calls: Cell::new(0),
        };

        mock.set_msr(msr::IA32_VMX_BASIC, (1 << 55) | 0x0001_2345);
        mock.set_msr(msr::IA32_VMX_TRUE_PINBASED_CTLS, PERMISSIVE_CAP);
        mock.set_msr(msr::IA32_VMX_TRUE_PROCBASED_CTLS, PERMISSIVE_CAP);
        mock.set_msr(msr::IA32_VMX_TRUE_EXIT_CTLS, PERMISSIVE_CAP);
        mock.set_msr(msr::IA32_VMX_TRUE_ENTRY_CTLS, PERMISSIVE_CAP);
        mock.set_msr(msr::IA32_VMX_PROCBASED_CTLS2, PERMISSIVE_CAP);
        mock.set_msr(msr::IA32_VMX_CR0_FIXED1, u64::MAX);
        mock.set_msr(msr::IA32_VMX_CR4_FIXED1, u64::MAX);
        mock.set_cpuid_eax(0x8000_0008, 48);

        mock
    }

    pub fn set_msr(&self, index: u32, value: u64) {
        self.msrs.borrow_mut().insert(index, value);
    }

    pub fn set_cpuid_eax(&self, leaf: u32, value: u32) {
        self.cpuid_eax_leaves.borrow_mut().insert(leaf, value);
    }

    pub fn set_field(&self, field: u64, value: u64) {
        self.vmcs_fields.borrow_mut().insert(field, value);
    }

    /// Current value of a VMCS field, zero when never written.
    pub fn field(&self, field: u64) -> u64 {
        self.vmcs_fields.borrow().get(&field).copied().unwrap_or(0)
    }
}

impl Intrinsics for MockIntrinsics {
    fn read_msr(&self, index: u32) -> u64 {
        self.msrs.borrow().get(&index).copied().unwrap_or(0)
    }

    fn cpuid_eax(&self, leaf: u32) -> u32 {
        self.cpuid_eax_leaves.borrow().get(&leaf).copied().unwrap_or(0)
    }

    fn vmread(&self, field: u64) -> Option<u64> {
        if self.fail_vmread.get() {
            return None;
        }

        Some(self.field(field))
    }

    fn vmwrite(&self, field: u64, value: u64) -> bool {
        self.vmwrite_calls.set(self.vmwrite_calls.get() + 1);

        if self.fail_vmwrite.get() {
            return false;
        }

        self.set_field(field, value);
        true
    }

    fn vmptrld(&self, _phys: &u64) -> bool {
        self.vmptrld_called.set(true);
        !self.fail_vmptrld.get()
    }

    fn vmclear(&self, _phys: &u64) -> bool {
        self.vmclear_called.set(true);
        !self.fail_vmclear.get()
    }

    fn vmlaunch(&self) -> bool {
        !self.fail_vmlaunch.get()
    }
}

/// A [`MemoryManager`] whose translations are identity mappings with
/// failure toggles.
pub struct MockMemory {
    pub virt_to_phys_returns_zero: Cell<bool>,
    pub phys_to_virt_returns_null: Cell<bool>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self {
            virt_to_phys_returns_zero: Cell::new(false),
            phys_to_virt_returns_null: Cell::new(false),
        }
    }
}

impl MemoryManager for MockMemory {
    fn virt_to_phys(&self, virt: *const u8) -> u64 {
        if self.virt_to_phys_returns_zero.get() { 0 } else { virt as u64 }
    }

    fn phys_to_virt(&self, phys: u64) -> *const u8 {
        if self.phys_to_virt_returns_null.get() {
            core::ptr::null()
        } else {
            phys as *const u8
        }
    }
}
