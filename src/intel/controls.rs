//! Execution-control synthesis.
//!
//! The control words are built in two passes. The 32-bit control-state
//! writer seeds each of the four true-capability fields with
//! `allowed0 & allowed1`, the bits the processor forces on. The synthesis
//! pass then re-reads each word, ORs in the features this hypervisor wants,
//! reconciles the result with the capability MSR, and writes it back.
//! Reconciliation never fails; it reports what it changed at debug level.

use {
    crate::{
        error::HypervisorError,
        intel::{
            fields,
            ports::{Intrinsics, vmread, vmwrite},
        },
    },
    log::debug,
    x86::msr,
};

/// IA32_VMX_BASIC bit 55: the TRUE capability MSRs exist.
const VMX_BASIC_TRUE_CONTROLS: u64 = 1 << 55;

/// Pin-based execution-control bits.
pub mod pin {
    pub const EXTERNAL_INTERRUPT_EXITING: u64 = 1 << 0;
    pub const NMI_EXITING: u64 = 1 << 3;
    pub const VIRTUAL_NMIS: u64 = 1 << 5;
    pub const ACTIVATE_VMX_PREEMPTION_TIMER: u64 = 1 << 6;
    pub const PROCESS_POSTED_INTERRUPTS: u64 = 1 << 7;
}

/// Primary processor-based execution-control bits.
pub mod proc {
    pub const INTERRUPT_WINDOW_EXITING: u64 = 1 << 2;
    pub const USE_TSC_OFFSETTING: u64 = 1 << 3;
    pub const HLT_EXITING: u64 = 1 << 7;
    pub const CR3_LOAD_EXITING: u64 = 1 << 15;
    pub const CR3_STORE_EXITING: u64 = 1 << 16;
    pub const CR8_LOAD_EXITING: u64 = 1 << 19;
    pub const CR8_STORE_EXITING: u64 = 1 << 20;
    pub const USE_TPR_SHADOW: u64 = 1 << 21;
    pub const NMI_WINDOW_EXITING: u64 = 1 << 22;
    pub const MOV_DR_EXITING: u64 = 1 << 23;
    pub const USE_IO_BITMAPS: u64 = 1 << 25;
    pub const MONITOR_TRAP_FLAG: u64 = 1 << 27;
    pub const USE_MSR_BITMAPS: u64 = 1 << 28;
    pub const ACTIVATE_SECONDARY_CONTROLS: u64 = 1 << 31;
}

/// Secondary processor-based execution-control bits.
pub mod proc2 {
    pub const VIRTUALIZE_APIC_ACCESSES: u64 = 1 << 0;
    pub const ENABLE_EPT: u64 = 1 << 1;
    pub const DESCRIPTOR_TABLE_EXITING: u64 = 1 << 2;
    pub const ENABLE_RDTSCP: u64 = 1 << 3;
    pub const VIRTUALIZE_X2APIC_MODE: u64 = 1 << 4;
    pub const ENABLE_VPID: u64 = 1 << 5;
    pub const UNRESTRICTED_GUEST: u64 = 1 << 7;
    pub const APIC_REGISTER_VIRTUALIZATION: u64 = 1 << 8;
    pub const VIRTUAL_INTERRUPT_DELIVERY: u64 = 1 << 9;
    pub const ENABLE_INVPCID: u64 = 1 << 12;
    pub const ENABLE_VM_FUNCTIONS: u64 = 1 << 13;
    pub const VMCS_SHADOWING: u64 = 1 << 14;
    pub const ENABLE_PML: u64 = 1 << 17;
    pub const EPT_VIOLATION_VE: u64 = 1 << 18;
    pub const ENABLE_XSAVES_XRSTORS: u64 = 1 << 20;
}

/// VM-exit control bits.
pub mod exit {
    pub const SAVE_DEBUG_CONTROLS: u64 = 1 << 2;
    pub const HOST_ADDRESS_SPACE_SIZE: u64 = 1 << 9;
    pub const LOAD_IA32_PERF_GLOBAL_CTRL: u64 = 1 << 12;
    pub const ACKNOWLEDGE_INTERRUPT_ON_EXIT: u64 = 1 << 15;
    pub const SAVE_IA32_PAT: u64 = 1 << 18;
    pub const LOAD_IA32_PAT: u64 = 1 << 19;
    pub const SAVE_IA32_EFER: u64 = 1 << 20;
    pub const LOAD_IA32_EFER: u64 = 1 << 21;
    pub const SAVE_VMX_PREEMPTION_TIMER_VALUE: u64 = 1 << 22;
}

/// VM-entry control bits.
pub mod entry {
    pub const LOAD_DEBUG_CONTROLS: u64 = 1 << 2;
    pub const IA_32E_MODE_GUEST: u64 = 1 << 9;
    pub const LOAD_IA32_PERF_GLOBAL_CTRL: u64 = 1 << 13;
    pub const LOAD_IA32_PAT: u64 = 1 << 14;
    pub const LOAD_IA32_EFER: u64 = 1 << 15;
}

/// The five classes of VM-execution control words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

impl VmxControl {
    /// The VMCS field holding this control word.
    pub fn field(self) -> u64 {
        match self {
            Self::PinBased => fields::control::PINBASED_EXEC_CONTROLS,
            Self::ProcessorBased => fields::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
            Self::ProcessorBased2 => fields::control::SECONDARY_PROCBASED_EXEC_CONTROLS,
            Self::VmExit => fields::control::VMEXIT_CONTROLS,
            Self::VmEntry => fields::control::VMENTRY_CONTROLS,
        }
    }

    /// The capability MSR governing this control word, preferring the TRUE
    /// variant when IA32_VMX_BASIC advertises it. Secondary controls have no
    /// TRUE variant.
    pub fn capability_msr(self, intrinsics: &dyn Intrinsics) -> u32 {
        let true_controls = intrinsics.read_msr(msr::IA32_VMX_BASIC) & VMX_BASIC_TRUE_CONTROLS != 0;

        match (self, true_controls) {
            (Self::PinBased, true) => msr::IA32_VMX_TRUE_PINBASED_CTLS,
            (Self::PinBased, false) => msr::IA32_VMX_PINBASED_CTLS,
            (Self::ProcessorBased, true) => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
            (Self::ProcessorBased, false) => msr::IA32_VMX_PROCBASED_CTLS,
            (Self::VmExit, true) => msr::IA32_VMX_TRUE_EXIT_CTLS,
            (Self::VmExit, false) => msr::IA32_VMX_EXIT_CTLS,
            (Self::VmEntry, true) => msr::IA32_VMX_TRUE_ENTRY_CTLS,
            (Self::VmEntry, false) => msr::IA32_VMX_ENTRY_CTLS,
            (Self::ProcessorBased2, _) => msr::IA32_VMX_PROCBASED_CTLS2,
        }
    }
}

/// Seeds the pin/proc/exit/entry control words with `allowed0 & allowed1` of
/// their capability MSRs, the value every processor-forced bit agrees on.
///
/// Secondary controls are not seeded; they stay zero until activated.
pub fn seed_control_state(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    for control in [VmxControl::PinBased, VmxControl::ProcessorBased, VmxControl::VmExit, VmxControl::VmEntry] {
        let cap = intrinsics.read_msr(control.capability_msr(intrinsics));
        let allowed0 = cap & 0xFFFF_FFFF;
        let allowed1 = cap >> 32;

        vmwrite(intrinsics, control.field(), allowed0 & allowed1)?;
    }

    Ok(())
}

/// Reconciles a candidate control word with a capability MSR.
///
/// Force-then-mask: allowed-0 bits are set first, then anything outside
/// allowed-1 is cleared. Post-condition: `allowed0 ⊆ ctrl ⊆ allowed1`.
pub fn filter_unsupported(cap: u64, mut ctrl: u64) -> u64 {
    let allowed0 = cap & 0xFFFF_FFFF;
    let allowed1 = cap >> 32;

    if (allowed0 & ctrl) != allowed0 {
        debug!("control word missing allowed-0 bits: allowed0={:#x} old={:#x}", allowed0, ctrl);
        ctrl |= allowed0;
        debug!("control word forced to {:#x}", ctrl);
    }

    if (ctrl & !allowed1) != 0 {
        debug!("control word exceeds allowed-1 bits: allowed1={:#x} old={:#x}", allowed1, ctrl);
        ctrl &= allowed1;
        debug!("control word masked to {:#x}", ctrl);
    }

    ctrl
}

/// Reads one control word, ORs in `desired`, reconciles, and writes it back.
fn adjust_control(intrinsics: &dyn Intrinsics, control: VmxControl, desired: u64) -> Result<(), HypervisorError> {
    let current = vmread(intrinsics, control.field())?;
    let cap = intrinsics.read_msr(control.capability_msr(intrinsics));
    let adjusted = filter_unsupported(cap, current | desired);

    vmwrite(intrinsics, control.field(), adjusted)
}

pub fn pin_based_vm_execution_controls(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    // Only the hardware-forced bits; interrupt and NMI exiting stay with the
    // embedder's exit handler.
    adjust_control(intrinsics, VmxControl::PinBased, 0)
}

pub fn primary_processor_based_vm_execution_controls(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    adjust_control(intrinsics, VmxControl::ProcessorBased, proc::ACTIVATE_SECONDARY_CONTROLS)
}

pub fn secondary_processor_based_vm_execution_controls(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let desired = proc2::ENABLE_RDTSCP | proc2::ENABLE_INVPCID | proc2::ENABLE_XSAVES_XRSTORS;

    adjust_control(intrinsics, VmxControl::ProcessorBased2, desired)
}

pub fn vm_exit_controls(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let desired = exit::SAVE_DEBUG_CONTROLS
        | exit::HOST_ADDRESS_SPACE_SIZE
        | exit::LOAD_IA32_PERF_GLOBAL_CTRL
        | exit::ACKNOWLEDGE_INTERRUPT_ON_EXIT
        | exit::SAVE_IA32_PAT
        | exit::LOAD_IA32_PAT
        | exit::SAVE_IA32_EFER
        | exit::LOAD_IA32_EFER;

    adjust_control(intrinsics, VmxControl::VmExit, desired)
}

pub fn vm_entry_controls(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let desired = entry::LOAD_DEBUG_CONTROLS
        | entry::IA_32E_MODE_GUEST
        | entry::LOAD_IA32_PERF_GLOBAL_CTRL
        | entry::LOAD_IA32_PAT
        | entry::LOAD_IA32_EFER;

    adjust_control(intrinsics, VmxControl::VmEntry, desired)
}

/// Runs all five synthesis passes in launch order.
pub fn synthesize_execution_controls(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    pin_based_vm_execution_controls(intrinsics)?;
    primary_processor_based_vm_execution_controls(intrinsics)?;
    secondary_processor_based_vm_execution_controls(intrinsics)?;
    vm_exit_controls(intrinsics)?;
    vm_entry_controls(intrinsics)
}
