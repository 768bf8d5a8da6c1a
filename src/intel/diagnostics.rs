//! Launch-failure diagnostics.
//!
//! Everything here logs at error level; it only runs once VMLAUNCH has
//! already refused the VMCS and the goal is a readable dump of what was
//! asked of the processor.

use {
    crate::{
        error::HypervisorError,
        intel::{
            fields,
            ports::{Intrinsics, vmread},
            vmerror::VmInstructionError,
        },
    },
    log::error,
};

const PIN_BITS: &[(&str, u64)] = &[
    ("external_interrupt_exiting", 1 << 0),
    ("nmi_exiting", 1 << 3),
    ("virtual_nmis", 1 << 5),
    ("activate_vmx_preemption_timer", 1 << 6),
    ("process_posted_interrupts", 1 << 7),
];

const PROC_BITS: &[(&str, u64)] = &[
    ("interrupt_window_exiting", 1 << 2),
    ("use_tsc_offsetting", 1 << 3),
    ("hlt_exiting", 1 << 7),
    ("invlpg_exiting", 1 << 9),
    ("mwait_exiting", 1 << 10),
    ("rdpmc_exiting", 1 << 11),
    ("rdtsc_exiting", 1 << 12),
    ("cr3_load_exiting", 1 << 15),
    ("cr3_store_exiting", 1 << 16),
    ("cr8_load_exiting", 1 << 19),
    ("cr8_store_exiting", 1 << 20),
    ("use_tpr_shadow", 1 << 21),
    ("nmi_window_exiting", 1 << 22),
    ("mov_dr_exiting", 1 << 23),
    ("unconditional_io_exiting", 1 << 24),
    ("use_io_bitmaps", 1 << 25),
    ("monitor_trap_flag", 1 << 27),
    ("use_msr_bitmaps", 1 << 28),
    ("monitor_exiting", 1 << 29),
    ("pause_exiting", 1 << 30),
    ("activate_secondary_controls", 1 << 31),
];

const PROC2_BITS: &[(&str, u64)] = &[
    ("virtualize_apic_accesses", 1 << 0),
    ("enable_ept", 1 << 1),
    ("descriptor_table_exiting", 1 << 2),
    ("enable_rdtscp", 1 << 3),
    ("virtualize_x2apic_mode", 1 << 4),
    ("enable_vpid", 1 << 5),
    ("wbinvd_exiting", 1 << 6),
    ("unrestricted_guest", 1 << 7),
    ("apic_register_virtualization", 1 << 8),
    ("virtual_interrupt_delivery", 1 << 9),
    ("pause_loop_exiting", 1 << 10),
    ("rdrand_exiting", 1 << 11),
    ("enable_invpcid", 1 << 12),
    ("enable_vm_functions", 1 << 13),
    ("vmcs_shadowing", 1 << 14),
    ("rdseed_exiting", 1 << 16),
    ("enable_pml", 1 << 17),
    ("ept_violation_ve", 1 << 18),
    ("enable_xsaves_xrstors", 1 << 20),
];

const EXIT_BITS: &[(&str, u64)] = &[
    ("save_debug_controls", 1 << 2),
    ("host_address_space_size", 1 << 9),
    ("load_ia32_perf_global_ctrl", 1 << 12),
    ("acknowledge_interrupt_on_exit", 1 << 15),
    ("save_ia32_pat", 1 << 18),
    ("load_ia32_pat", 1 << 19),
    ("save_ia32_efer", 1 << 20),
    ("load_ia32_efer", 1 << 21),
    ("save_vmx_preemption_timer_value", 1 << 22),
];

const ENTRY_BITS: &[(&str, u64)] = &[
    ("load_debug_controls", 1 << 2),
    ("ia_32e_mode_guest", 1 << 9),
    ("entry_to_smm", 1 << 10),
    ("deactivate_dual_monitor_treatment", 1 << 11),
    ("load_ia32_perf_global_ctrl", 1 << 13),
    ("load_ia32_pat", 1 << 14),
    ("load_ia32_efer", 1 << 15),
];

fn print_control_word(name: &str, word: u64, bits: &[(&str, u64)]) {
    error!("{}: {:#010x}", name, word);

    for (bit_name, bit) in bits {
        if word & bit != 0 {
            error!("    - {}", bit_name);
        }
    }
}

/// Dumps the five execution-control words with their enabled bits named.
pub fn print_execution_controls(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    print_pin_based_vm_execution_controls(intrinsics)?;
    print_primary_processor_based_vm_execution_controls(intrinsics)?;
    print_secondary_processor_based_vm_execution_controls(intrinsics)?;
    print_vm_exit_control_fields(intrinsics)?;
    print_vm_entry_control_fields(intrinsics)
}

pub fn print_pin_based_vm_execution_controls(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let word = vmread(intrinsics, fields::control::PINBASED_EXEC_CONTROLS)?;
    print_control_word("pin-based controls", word, PIN_BITS);

    Ok(())
}

pub fn print_primary_processor_based_vm_execution_controls(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let word = vmread(intrinsics, fields::control::PRIMARY_PROCBASED_EXEC_CONTROLS)?;
    print_control_word("primary proc-based controls", word, PROC_BITS);

    Ok(())
}

pub fn print_secondary_processor_based_vm_execution_controls(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let word = vmread(intrinsics, fields::control::SECONDARY_PROCBASED_EXEC_CONTROLS)?;
    print_control_word("secondary proc-based controls", word, PROC2_BITS);

    Ok(())
}

pub fn print_vm_exit_control_fields(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let word = vmread(intrinsics, fields::control::VMEXIT_CONTROLS)?;
    print_control_word("vm-exit controls", word, EXIT_BITS);

    Ok(())
}

pub fn print_vm_entry_control_fields(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let word = vmread(intrinsics, fields::control::VMENTRY_CONTROLS)?;
    print_control_word("vm-entry controls", word, ENTRY_BITS);

    Ok(())
}

/// Reads and decodes `VM_INSTRUCTION_ERROR`, returning the raw value.
pub fn dump_vm_instruction_error(intrinsics: &dyn Intrinsics) -> Result<u32, HypervisorError> {
    let raw = vmread(intrinsics, fields::ro::VM_INSTRUCTION_ERROR)? as u32;

    match VmInstructionError::from_u32(raw) {
        Some(decoded) => error!("vm-instruction error {}: {:?}", raw, decoded),
        None => error!("vm-instruction error {} (unrecognized)", raw),
    }

    Ok(raw)
}
