//! Architectural pre-launch checks.
//!
//! These mirror the consistency checks the CPU performs on VMLAUNCH (Intel
//! SDM Vol. 3C, chapter 26). They run only after a refused launch, to name
//! the first violated rule; nothing here repairs state. Check order matches
//! the enumeration below, so when several rules are broken the earliest one
//! is the one reported.

use {
    crate::{
        error::HypervisorError,
        intel::{
            controls::{VmxControl, entry, exit, pin, proc, proc2},
            fields,
            ports::{Intrinsics, MemoryManager, vmread},
        },
    },
    log::debug,
    x86::msr,
};

/// A caller-supplied guest-state check, run by [`check_vmcs_guest_state`].
pub type GuestStateCheck = fn(&dyn Intrinsics) -> Result<(), HypervisorError>;

/// EFER bits with architectural meaning: SCE, LME, LMA, NXE.
const EFER_KNOWN_BITS: u64 = (1 << 0) | (1 << 8) | (1 << 10) | (1 << 11);
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

/// IA32_PERF_GLOBAL_CTRL bits with architectural meaning.
const PERF_GLOBAL_CTRL_KNOWN_BITS: u64 = 0x0000_0007_0000_0003;

fn fail(check: &'static str) -> Result<(), HypervisorError> {
    Err(HypervisorError::ArchCheckFailed(check))
}

fn enabled(word: u64, bit: u64) -> bool {
    word & bit != 0
}

/// 48-bit canonical form: bits 63:47 all equal.
fn is_canonical(addr: u64) -> bool {
    let upper = addr & 0xFFFF_8000_0000_0000;
    upper == 0 || upper == 0xFFFF_8000_0000_0000
}

/// Mask of address bits above the processor's physical-address width,
/// derived from CPUID leaf 0x8000_0008.
fn physical_address_mask(intrinsics: &dyn Intrinsics) -> u64 {
    let width = intrinsics.cpuid_eax(0x8000_0008) & 0xFF;
    let width = if width == 0 || width > 52 { 36 } else { width };

    !((1u64 << width) - 1)
}

fn pin_controls(intrinsics: &dyn Intrinsics) -> Result<u64, HypervisorError> {
    vmread(intrinsics, fields::control::PINBASED_EXEC_CONTROLS)
}

fn primary_controls(intrinsics: &dyn Intrinsics) -> Result<u64, HypervisorError> {
    vmread(intrinsics, fields::control::PRIMARY_PROCBASED_EXEC_CONTROLS)
}

/// Secondary controls, or zero when they are not activated.
fn secondary_controls(intrinsics: &dyn Intrinsics) -> Result<u64, HypervisorError> {
    if !enabled(primary_controls(intrinsics)?, proc::ACTIVATE_SECONDARY_CONTROLS) {
        return Ok(0);
    }

    vmread(intrinsics, fields::control::SECONDARY_PROCBASED_EXEC_CONTROLS)
}

fn exit_controls(intrinsics: &dyn Intrinsics) -> Result<u64, HypervisorError> {
    vmread(intrinsics, fields::control::VMEXIT_CONTROLS)
}

fn entry_controls(intrinsics: &dyn Intrinsics) -> Result<u64, HypervisorError> {
    vmread(intrinsics, fields::control::VMENTRY_CONTROLS)
}

/// `allowed0 ⊆ ctrl ⊆ allowed1` for one control word.
fn reserved_properly_set(cap: u64, ctrl: u64) -> bool {
    let allowed0 = cap & 0xFFFF_FFFF;
    let allowed1 = cap >> 32;

    (allowed0 & ctrl) == allowed0 && (ctrl & !allowed1) == 0
}

// ---------------------------------------------------------------------------
// Control-state checks
// ---------------------------------------------------------------------------

fn check_control_pin_based_ctls_reserved_properly_set(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let cap = intrinsics.read_msr(VmxControl::PinBased.capability_msr(intrinsics));

    if !reserved_properly_set(cap, pin_controls(intrinsics)?) {
        return fail("control_pin_based_ctls_reserved_properly_set");
    }

    Ok(())
}

fn check_control_proc_based_ctls_reserved_properly_set(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let cap = intrinsics.read_msr(VmxControl::ProcessorBased.capability_msr(intrinsics));

    if !reserved_properly_set(cap, primary_controls(intrinsics)?) {
        return fail("control_proc_based_ctls_reserved_properly_set");
    }

    Ok(())
}

fn check_control_proc_based_ctls2_reserved_properly_set(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !enabled(primary_controls(intrinsics)?, proc::ACTIVATE_SECONDARY_CONTROLS) {
        return Ok(());
    }

    let cap = intrinsics.read_msr(VmxControl::ProcessorBased2.capability_msr(intrinsics));
    let ctrl = vmread(intrinsics, fields::control::SECONDARY_PROCBASED_EXEC_CONTROLS)?;

    if !reserved_properly_set(cap, ctrl) {
        return fail("control_proc_based_ctls2_reserved_properly_set");
    }

    Ok(())
}

fn check_control_cr3_count_less_than_4(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if vmread(intrinsics, fields::control::CR3_TARGET_COUNT)? > 4 {
        return fail("control_cr3_count_less_than_4");
    }

    Ok(())
}

fn check_control_io_bitmap_address_bits(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !enabled(primary_controls(intrinsics)?, proc::USE_IO_BITMAPS) {
        return Ok(());
    }

    let mask = physical_address_mask(intrinsics);
    let bitmap_a = vmread(intrinsics, fields::control::IO_BITMAP_A_ADDR)?;
    let bitmap_b = vmread(intrinsics, fields::control::IO_BITMAP_B_ADDR)?;

    if bitmap_a & 0xFFF != 0 || bitmap_b & 0xFFF != 0 || bitmap_a & mask != 0 || bitmap_b & mask != 0 {
        return fail("control_io_bitmap_address_bits");
    }

    Ok(())
}

fn check_control_msr_bitmap_address_bits(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !enabled(primary_controls(intrinsics)?, proc::USE_MSR_BITMAPS) {
        return Ok(());
    }

    let bitmap = vmread(intrinsics, fields::control::MSR_BITMAPS_ADDR)?;

    if bitmap & 0xFFF != 0 || bitmap & physical_address_mask(intrinsics) != 0 {
        return fail("control_msr_bitmap_address_bits");
    }

    Ok(())
}

fn check_control_tpr_shadow_and_virtual_apic(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let secondary = secondary_controls(intrinsics)?;

    if enabled(primary_controls(intrinsics)?, proc::USE_TPR_SHADOW) {
        let vapic = vmread(intrinsics, fields::control::VIRT_APIC_ADDR)?;

        if vapic == 0 || vapic & 0xFFF != 0 || vapic & physical_address_mask(intrinsics) != 0 {
            return fail("control_tpr_shadow_and_virtual_apic");
        }
    } else {
        // Without a TPR shadow, none of the APIC virtualization features
        // may be on.
        let dependent = proc2::VIRTUALIZE_X2APIC_MODE | proc2::APIC_REGISTER_VIRTUALIZATION | proc2::VIRTUAL_INTERRUPT_DELIVERY;

        if secondary & dependent != 0 {
            return fail("control_tpr_shadow_and_virtual_apic");
        }
    }

    Ok(())
}

fn check_control_nmi_exiting_and_virtual_nmi(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let pin_ctls = pin_controls(intrinsics)?;

    if !enabled(pin_ctls, pin::NMI_EXITING) && enabled(pin_ctls, pin::VIRTUAL_NMIS) {
        return fail("control_nmi_exiting_and_virtual_nmi");
    }

    Ok(())
}

fn check_control_virtual_nmi_and_nmi_window(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !enabled(pin_controls(intrinsics)?, pin::VIRTUAL_NMIS) && enabled(primary_controls(intrinsics)?, proc::NMI_WINDOW_EXITING) {
        return fail("control_virtual_nmi_and_nmi_window");
    }

    Ok(())
}

fn check_control_virtual_apic_address_bits(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !enabled(secondary_controls(intrinsics)?, proc2::VIRTUALIZE_APIC_ACCESSES) {
        return Ok(());
    }

    let apic_access = vmread(intrinsics, fields::control::APIC_ACCESS_ADDR)?;

    if apic_access & 0xFFF != 0 || apic_access & physical_address_mask(intrinsics) != 0 {
        return fail("control_virtual_apic_address_bits");
    }

    Ok(())
}

fn check_control_x2apic_mode_and_virtual_apic_access(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let secondary = secondary_controls(intrinsics)?;

    if enabled(secondary, proc2::VIRTUALIZE_X2APIC_MODE) && enabled(secondary, proc2::VIRTUALIZE_APIC_ACCESSES) {
        return fail("control_x2apic_mode_and_virtual_apic_access");
    }

    Ok(())
}

fn check_control_virtual_interrupt_and_external_interrupt(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if enabled(secondary_controls(intrinsics)?, proc2::VIRTUAL_INTERRUPT_DELIVERY)
        && !enabled(pin_controls(intrinsics)?, pin::EXTERNAL_INTERRUPT_EXITING)
    {
        return fail("control_virtual_interrupt_and_external_interrupt");
    }

    Ok(())
}

fn check_control_process_posted_interrupt_checks(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !enabled(pin_controls(intrinsics)?, pin::PROCESS_POSTED_INTERRUPTS) {
        return Ok(());
    }

    if !enabled(secondary_controls(intrinsics)?, proc2::VIRTUAL_INTERRUPT_DELIVERY) {
        return fail("control_process_posted_interrupt_checks");
    }

    if !enabled(exit_controls(intrinsics)?, exit::ACKNOWLEDGE_INTERRUPT_ON_EXIT) {
        return fail("control_process_posted_interrupt_checks");
    }

    let vector = vmread(intrinsics, fields::control::POSTED_INTERRUPT_NOTIFICATION_VECTOR)?;
    if vector & !0xFF != 0 {
        return fail("control_process_posted_interrupt_checks");
    }

    // The descriptor is 64 bytes and must be 64-byte aligned.
    let descriptor = vmread(intrinsics, fields::control::POSTED_INTERRUPT_DESC_ADDR)?;
    if descriptor & 0x3F != 0 || descriptor & physical_address_mask(intrinsics) != 0 {
        return fail("control_process_posted_interrupt_checks");
    }

    Ok(())
}

fn check_control_vpid_checks(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if enabled(secondary_controls(intrinsics)?, proc2::ENABLE_VPID) && vmread(intrinsics, fields::control::VPID)? == 0 {
        return fail("control_vpid_checks");
    }

    Ok(())
}

fn check_control_enable_ept_checks(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !enabled(secondary_controls(intrinsics)?, proc2::ENABLE_EPT) {
        return Ok(());
    }

    let eptp = vmread(intrinsics, fields::control::EPT_POINTER)?;

    // Memory type must be uncacheable (0) or write-back (6).
    let memory_type = eptp & 0x7;
    if memory_type != 0 && memory_type != 6 {
        return fail("control_enable_ept_checks");
    }

    // Page-walk length field holds walk length minus one; four levels.
    if (eptp >> 3) & 0x7 != 3 {
        return fail("control_enable_ept_checks");
    }

    // Bits 11:7 are reserved (bit 6 enables accessed/dirty flags).
    if eptp & 0xF80 != 0 {
        return fail("control_enable_ept_checks");
    }

    if eptp & physical_address_mask(intrinsics) != 0 {
        return fail("control_enable_ept_checks");
    }

    Ok(())
}

fn check_control_enable_pml_checks(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let secondary = secondary_controls(intrinsics)?;

    if !enabled(secondary, proc2::ENABLE_PML) {
        return Ok(());
    }

    if !enabled(secondary, proc2::ENABLE_EPT) {
        return fail("control_enable_pml_checks");
    }

    let pml = vmread(intrinsics, fields::control::PML_ADDR)?;
    if pml & 0xFFF != 0 || pml & physical_address_mask(intrinsics) != 0 {
        return fail("control_enable_pml_checks");
    }

    Ok(())
}

fn check_control_unrestricted_guests(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let secondary = secondary_controls(intrinsics)?;

    if enabled(secondary, proc2::UNRESTRICTED_GUEST) && !enabled(secondary, proc2::ENABLE_EPT) {
        return fail("control_unrestricted_guests");
    }

    Ok(())
}

fn check_control_enable_vm_functions(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    const EPTP_SWITCHING: u64 = 1 << 0;

    if !enabled(secondary_controls(intrinsics)?, proc2::ENABLE_VM_FUNCTIONS) {
        return Ok(());
    }

    let vm_function_controls = vmread(intrinsics, fields::control::VM_FUNCTION_CONTROLS)?;

    if vm_function_controls & !EPTP_SWITCHING != 0 {
        return fail("control_enable_vm_functions");
    }

    if enabled(vm_function_controls, EPTP_SWITCHING) {
        if !enabled(secondary_controls(intrinsics)?, proc2::ENABLE_EPT) {
            return fail("control_enable_vm_functions");
        }

        let eptp_list = vmread(intrinsics, fields::control::EPTP_LIST_ADDR)?;
        if eptp_list & 0xFFF != 0 || eptp_list & physical_address_mask(intrinsics) != 0 {
            return fail("control_enable_vm_functions");
        }
    }

    Ok(())
}

fn check_control_enable_vmcs_shadowing(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !enabled(secondary_controls(intrinsics)?, proc2::VMCS_SHADOWING) {
        return Ok(());
    }

    let mask = physical_address_mask(intrinsics);
    let vmread_bitmap = vmread(intrinsics, fields::control::VMREAD_BITMAP_ADDR)?;
    let vmwrite_bitmap = vmread(intrinsics, fields::control::VMWRITE_BITMAP_ADDR)?;

    if vmread_bitmap & 0xFFF != 0 || vmwrite_bitmap & 0xFFF != 0 || vmread_bitmap & mask != 0 || vmwrite_bitmap & mask != 0 {
        return fail("control_enable_vmcs_shadowing");
    }

    Ok(())
}

fn check_control_enable_ept_violation_checks(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !enabled(secondary_controls(intrinsics)?, proc2::EPT_VIOLATION_VE) {
        return Ok(());
    }

    let info_area = vmread(intrinsics, fields::control::VIRT_EXCEPTION_INFO_ADDR)?;

    if info_area & 0xFFF != 0 || info_area & physical_address_mask(intrinsics) != 0 {
        return fail("control_enable_ept_violation_checks");
    }

    Ok(())
}

fn check_control_vm_exit_ctls_reserved_properly_set(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let cap = intrinsics.read_msr(VmxControl::VmExit.capability_msr(intrinsics));

    if !reserved_properly_set(cap, exit_controls(intrinsics)?) {
        return fail("control_vm_exit_ctls_reserved_properly_set");
    }

    Ok(())
}

fn check_control_activate_and_save_preemption_timer_must_be_0(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !enabled(pin_controls(intrinsics)?, pin::ACTIVATE_VMX_PREEMPTION_TIMER)
        && enabled(exit_controls(intrinsics)?, exit::SAVE_VMX_PREEMPTION_TIMER_VALUE)
    {
        return fail("control_activate_and_save_preemption_timer_must_be_0");
    }

    Ok(())
}

/// Shared body for the three MSR-area checks: 16-byte aligned, inside the
/// physical-address width from first to last byte, and mappable.
fn check_msr_area(
    intrinsics: &dyn Intrinsics,
    memory: &dyn MemoryManager,
    count_field: u64,
    addr_field: u64,
    check: &'static str,
) -> Result<(), HypervisorError> {
    let count = vmread(intrinsics, count_field)?;
    if count == 0 {
        return Ok(());
    }

    let mask = physical_address_mask(intrinsics);
    let addr = vmread(intrinsics, addr_field)?;

    if addr & 0xF != 0 || addr & mask != 0 {
        return Err(HypervisorError::ArchCheckFailed(check));
    }

    let last = addr.saturating_add(count.saturating_mul(16)).saturating_sub(1);
    if last & mask != 0 {
        return Err(HypervisorError::ArchCheckFailed(check));
    }

    if memory.phys_to_virt(addr).is_null() {
        return Err(HypervisorError::ArchCheckFailed(check));
    }

    Ok(())
}

fn check_control_exit_msr_store_address(intrinsics: &dyn Intrinsics, memory: &dyn MemoryManager) -> Result<(), HypervisorError> {
    check_msr_area(
        intrinsics,
        memory,
        fields::control::VMEXIT_MSR_STORE_COUNT,
        fields::control::VMEXIT_MSR_STORE_ADDR,
        "control_exit_msr_store_address",
    )
}

fn check_control_exit_msr_load_address(intrinsics: &dyn Intrinsics, memory: &dyn MemoryManager) -> Result<(), HypervisorError> {
    check_msr_area(
        intrinsics,
        memory,
        fields::control::VMEXIT_MSR_LOAD_COUNT,
        fields::control::VMEXIT_MSR_LOAD_ADDR,
        "control_exit_msr_load_address",
    )
}

fn check_control_entry_msr_load_address(intrinsics: &dyn Intrinsics, memory: &dyn MemoryManager) -> Result<(), HypervisorError> {
    check_msr_area(
        intrinsics,
        memory,
        fields::control::VMENTRY_MSR_LOAD_COUNT,
        fields::control::VMENTRY_MSR_LOAD_ADDR,
        "control_entry_msr_load_address",
    )
}

// Event-injection field layout: vector 7:0, type 10:8, deliver-error-code
// 11, reserved 30:12, valid 31.
const INJECTION_VALID: u64 = 1 << 31;
const INJECTION_DELIVER_ERROR_CODE: u64 = 1 << 11;

fn injection_vector(info: u64) -> u64 {
    info & 0xFF
}

fn injection_type(info: u64) -> u64 {
    (info >> 8) & 0x7
}

const TYPE_NMI: u64 = 2;
const TYPE_HARDWARE_EXCEPTION: u64 = 3;
const TYPE_SOFTWARE_INTERRUPT: u64 = 4;
const TYPE_PRIVILEGED_SOFTWARE_EXCEPTION: u64 = 5;
const TYPE_SOFTWARE_EXCEPTION: u64 = 6;

fn check_control_event_injection_type_vector_checks(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let info = vmread(intrinsics, fields::control::VMENTRY_INTERRUPTION_INFO)?;
    if !enabled(info, INJECTION_VALID) {
        return Ok(());
    }

    // Type 1 is reserved.
    if injection_type(info) == 1 {
        return fail("control_event_injection_type_vector_checks");
    }

    if injection_type(info) == TYPE_NMI && injection_vector(info) != 2 {
        return fail("control_event_injection_type_vector_checks");
    }

    if injection_type(info) == TYPE_HARDWARE_EXCEPTION && injection_vector(info) > 31 {
        return fail("control_event_injection_type_vector_checks");
    }

    Ok(())
}

fn check_control_event_injection_delivery_ec_checks(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let info = vmread(intrinsics, fields::control::VMENTRY_INTERRUPTION_INFO)?;
    if !enabled(info, INJECTION_VALID) || !enabled(info, INJECTION_DELIVER_ERROR_CODE) {
        return Ok(());
    }

    // An error code can only accompany a hardware exception that defines one.
    if injection_type(info) != TYPE_HARDWARE_EXCEPTION {
        return fail("control_event_injection_delivery_ec_checks");
    }

    if !matches!(injection_vector(info), 8 | 10 | 11 | 12 | 13 | 14 | 17) {
        return fail("control_event_injection_delivery_ec_checks");
    }

    Ok(())
}

fn check_control_event_injection_reserved_bits_checks(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let info = vmread(intrinsics, fields::control::VMENTRY_INTERRUPTION_INFO)?;

    if enabled(info, INJECTION_VALID) && info & 0x7FFF_F000 != 0 {
        return fail("control_event_injection_reserved_bits_checks");
    }

    Ok(())
}

fn check_control_event_injection_ec_checks(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let info = vmread(intrinsics, fields::control::VMENTRY_INTERRUPTION_INFO)?;
    if !enabled(info, INJECTION_VALID) || !enabled(info, INJECTION_DELIVER_ERROR_CODE) {
        return Ok(());
    }

    if vmread(intrinsics, fields::control::VMENTRY_EXCEPTION_ERR_CODE)? & !0x7FFF != 0 {
        return fail("control_event_injection_ec_checks");
    }

    Ok(())
}

fn check_control_event_injection_instr_length_checks(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let info = vmread(intrinsics, fields::control::VMENTRY_INTERRUPTION_INFO)?;
    if !enabled(info, INJECTION_VALID) {
        return Ok(());
    }

    let software = matches!(
        injection_type(info),
        TYPE_SOFTWARE_INTERRUPT | TYPE_PRIVILEGED_SOFTWARE_EXCEPTION | TYPE_SOFTWARE_EXCEPTION
    );

    if software && vmread(intrinsics, fields::control::VMENTRY_INSTRUCTION_LEN)? > 15 {
        return fail("control_event_injection_instr_length_checks");
    }

    Ok(())
}

fn check_control_vm_entry_ctls_reserved_properly_set(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let cap = intrinsics.read_msr(VmxControl::VmEntry.capability_msr(intrinsics));

    if !reserved_properly_set(cap, entry_controls(intrinsics)?) {
        return fail("control_vm_entry_ctls_reserved_properly_set");
    }

    Ok(())
}

/// Runs every control-state check, stopping at the first violation.
pub fn check_vmcs_control_state(intrinsics: &dyn Intrinsics, memory: &dyn MemoryManager) -> Result<(), HypervisorError> {
    debug!("running vmcs control-state checks");

    check_control_pin_based_ctls_reserved_properly_set(intrinsics)?;
    check_control_proc_based_ctls_reserved_properly_set(intrinsics)?;
    check_control_proc_based_ctls2_reserved_properly_set(intrinsics)?;
    check_control_cr3_count_less_than_4(intrinsics)?;
    check_control_io_bitmap_address_bits(intrinsics)?;
    check_control_msr_bitmap_address_bits(intrinsics)?;
    check_control_tpr_shadow_and_virtual_apic(intrinsics)?;
    check_control_nmi_exiting_and_virtual_nmi(intrinsics)?;
    check_control_virtual_nmi_and_nmi_window(intrinsics)?;
    check_control_virtual_apic_address_bits(intrinsics)?;
    check_control_x2apic_mode_and_virtual_apic_access(intrinsics)?;
    check_control_virtual_interrupt_and_external_interrupt(intrinsics)?;
    check_control_process_posted_interrupt_checks(intrinsics)?;
    check_control_vpid_checks(intrinsics)?;
    check_control_enable_ept_checks(intrinsics)?;
    check_control_enable_pml_checks(intrinsics)?;
    check_control_unrestricted_guests(intrinsics)?;
    check_control_enable_vm_functions(intrinsics)?;
    check_control_enable_vmcs_shadowing(intrinsics)?;
    check_control_enable_ept_violation_checks(intrinsics)?;
    check_control_vm_exit_ctls_reserved_properly_set(intrinsics)?;
    check_control_activate_and_save_preemption_timer_must_be_0(intrinsics)?;
    check_control_exit_msr_store_address(intrinsics, memory)?;
    check_control_exit_msr_load_address(intrinsics, memory)?;
    check_control_entry_msr_load_address(intrinsics, memory)?;
    check_control_event_injection_type_vector_checks(intrinsics)?;
    check_control_event_injection_delivery_ec_checks(intrinsics)?;
    check_control_event_injection_reserved_bits_checks(intrinsics)?;
    check_control_event_injection_ec_checks(intrinsics)?;
    check_control_event_injection_instr_length_checks(intrinsics)?;
    check_control_vm_entry_ctls_reserved_properly_set(intrinsics)
}

// ---------------------------------------------------------------------------
// Host-state checks
// ---------------------------------------------------------------------------

fn check_host_cr0_for_unsupported_bits(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let cr0 = vmread(intrinsics, fields::host::CR0)?;
    let fixed0 = intrinsics.read_msr(msr::IA32_VMX_CR0_FIXED0);
    let fixed1 = intrinsics.read_msr(msr::IA32_VMX_CR0_FIXED1);

    if cr0 & fixed0 != fixed0 || cr0 & !fixed1 != 0 {
        return fail("host_cr0_for_unsupported_bits");
    }

    Ok(())
}

fn check_host_cr3_for_unsupported_bits(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if vmread(intrinsics, fields::host::CR3)? & physical_address_mask(intrinsics) != 0 {
        return fail("host_cr3_for_unsupported_bits");
    }

    Ok(())
}

fn check_host_cr4_for_unsupported_bits(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let cr4 = vmread(intrinsics, fields::host::CR4)?;
    let fixed0 = intrinsics.read_msr(msr::IA32_VMX_CR4_FIXED0);
    let fixed1 = intrinsics.read_msr(msr::IA32_VMX_CR4_FIXED1);

    if cr4 & fixed0 != fixed0 || cr4 & !fixed1 != 0 {
        return fail("host_cr4_for_unsupported_bits");
    }

    Ok(())
}

fn check_host_ia32_sysenter_esp_canonical_address(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !is_canonical(vmread(intrinsics, fields::host::IA32_SYSENTER_ESP)?) {
        return fail("host_ia32_sysenter_esp_canonical_address");
    }

    Ok(())
}

fn check_host_ia32_sysenter_eip_canonical_address(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !is_canonical(vmread(intrinsics, fields::host::IA32_SYSENTER_EIP)?) {
        return fail("host_ia32_sysenter_eip_canonical_address");
    }

    Ok(())
}

fn check_host_verify_load_ia32_perf_global_ctrl(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !enabled(exit_controls(intrinsics)?, exit::LOAD_IA32_PERF_GLOBAL_CTRL) {
        return Ok(());
    }

    if vmread(intrinsics, fields::host::IA32_PERF_GLOBAL_CTRL)? & !PERF_GLOBAL_CTRL_KNOWN_BITS != 0 {
        return fail("host_verify_load_ia32_perf_global_ctrl");
    }

    Ok(())
}

fn check_host_verify_load_ia32_pat(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !enabled(exit_controls(intrinsics)?, exit::LOAD_IA32_PAT) {
        return Ok(());
    }

    let pat = vmread(intrinsics, fields::host::IA32_PAT)?;

    for entry_index in 0..8 {
        let memory_type = (pat >> (entry_index * 8)) & 0xFF;

        if !matches!(memory_type, 0 | 1 | 4 | 5 | 6 | 7) {
            return fail("host_verify_load_ia32_pat");
        }
    }

    Ok(())
}

fn check_host_verify_load_ia32_efer(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    let exit_ctls = exit_controls(intrinsics)?;

    if !enabled(exit_ctls, exit::LOAD_IA32_EFER) {
        return Ok(());
    }

    let efer = vmread(intrinsics, fields::host::IA32_EFER)?;

    if efer & !EFER_KNOWN_BITS != 0 {
        return fail("host_verify_load_ia32_efer");
    }

    // LMA and LME must track the host address-space size.
    let ia32e_host = enabled(exit_ctls, exit::HOST_ADDRESS_SPACE_SIZE);

    if enabled(efer, EFER_LMA) != ia32e_host || enabled(efer, EFER_LME) != ia32e_host {
        return fail("host_verify_load_ia32_efer");
    }

    Ok(())
}

/// RPL and TI of a host selector must both be zero.
fn selector_check(
    intrinsics: &dyn Intrinsics,
    field: u64,
    check: &'static str,
) -> Result<(), HypervisorError> {
    if vmread(intrinsics, field)? & 0x7 != 0 {
        return Err(HypervisorError::ArchCheckFailed(check));
    }

    Ok(())
}

fn check_host_es_selector_rpl_ti_equal_zero(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    selector_check(intrinsics, fields::host::ES_SELECTOR, "host_es_selector_rpl_ti_equal_zero")
}

fn check_host_cs_selector_rpl_ti_equal_zero(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    selector_check(intrinsics, fields::host::CS_SELECTOR, "host_cs_selector_rpl_ti_equal_zero")
}

fn check_host_ss_selector_rpl_ti_equal_zero(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    selector_check(intrinsics, fields::host::SS_SELECTOR, "host_ss_selector_rpl_ti_equal_zero")
}

fn check_host_ds_selector_rpl_ti_equal_zero(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    selector_check(intrinsics, fields::host::DS_SELECTOR, "host_ds_selector_rpl_ti_equal_zero")
}

fn check_host_fs_selector_rpl_ti_equal_zero(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    selector_check(intrinsics, fields::host::FS_SELECTOR, "host_fs_selector_rpl_ti_equal_zero")
}

fn check_host_gs_selector_rpl_ti_equal_zero(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    selector_check(intrinsics, fields::host::GS_SELECTOR, "host_gs_selector_rpl_ti_equal_zero")
}

fn check_host_tr_selector_rpl_ti_equal_zero(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    selector_check(intrinsics, fields::host::TR_SELECTOR, "host_tr_selector_rpl_ti_equal_zero")
}

fn check_host_cs_not_equal_zero(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if vmread(intrinsics, fields::host::CS_SELECTOR)? == 0 {
        return fail("host_cs_not_equal_zero");
    }

    Ok(())
}

fn check_host_tr_not_equal_zero(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if vmread(intrinsics, fields::host::TR_SELECTOR)? == 0 {
        return fail("host_tr_not_equal_zero");
    }

    Ok(())
}

fn check_host_ss_not_equal_zero(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if vmread(intrinsics, fields::host::SS_SELECTOR)? == 0 {
        return fail("host_ss_not_equal_zero");
    }

    Ok(())
}

fn check_host_fs_canonical_base_address(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !is_canonical(vmread(intrinsics, fields::host::FS_BASE)?) {
        return fail("host_fs_canonical_base_address");
    }

    Ok(())
}

fn check_host_gs_canonical_base_address(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !is_canonical(vmread(intrinsics, fields::host::GS_BASE)?) {
        return fail("host_gs_canonical_base_address");
    }

    Ok(())
}

fn check_host_gdtr_canonical_base_address(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !is_canonical(vmread(intrinsics, fields::host::GDTR_BASE)?) {
        return fail("host_gdtr_canonical_base_address");
    }

    Ok(())
}

fn check_host_idtr_canonical_base_address(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !is_canonical(vmread(intrinsics, fields::host::IDTR_BASE)?) {
        return fail("host_idtr_canonical_base_address");
    }

    Ok(())
}

fn check_host_tr_canonical_base_address(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !is_canonical(vmread(intrinsics, fields::host::TR_BASE)?) {
        return fail("host_tr_canonical_base_address");
    }

    Ok(())
}

fn check_host_if_outside_ia32e_mode(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if enabled(intrinsics.read_msr(msr::IA32_EFER), EFER_LMA) {
        return Ok(());
    }

    if enabled(exit_controls(intrinsics)?, exit::HOST_ADDRESS_SPACE_SIZE) {
        return fail("host_if_outside_ia32e_mode");
    }

    Ok(())
}

fn check_host_address_space_size_is_set(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if !enabled(intrinsics.read_msr(msr::IA32_EFER), EFER_LMA) {
        return Ok(());
    }

    if !enabled(exit_controls(intrinsics)?, exit::HOST_ADDRESS_SPACE_SIZE) {
        return fail("host_address_space_size_is_set");
    }

    Ok(())
}

fn check_host_address_space_disabled(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    if enabled(exit_controls(intrinsics)?, exit::HOST_ADDRESS_SPACE_SIZE) {
        return Ok(());
    }

    if enabled(entry_controls(intrinsics)?, entry::IA_32E_MODE_GUEST) {
        return fail("host_address_space_disabled");
    }

    // A 32-bit host cannot return above 4 GiB.
    if vmread(intrinsics, fields::host::RIP)? >> 32 != 0 {
        return fail("host_address_space_disabled");
    }

    Ok(())
}

fn check_host_address_space_enabled(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    const CR4_PAE: u64 = 1 << 5;

    if !enabled(exit_controls(intrinsics)?, exit::HOST_ADDRESS_SPACE_SIZE) {
        return Ok(());
    }

    if !enabled(vmread(intrinsics, fields::host::CR4)?, CR4_PAE) {
        return fail("host_address_space_enabled");
    }

    if !is_canonical(vmread(intrinsics, fields::host::RIP)?) {
        return fail("host_address_space_enabled");
    }

    Ok(())
}

/// Runs every host-state check, stopping at the first violation.
pub fn check_vmcs_host_state(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
    debug!("running vmcs host-state checks");

    check_host_cr0_for_unsupported_bits(intrinsics)?;
    check_host_cr3_for_unsupported_bits(intrinsics)?;
    check_host_cr4_for_unsupported_bits(intrinsics)?;
    check_host_ia32_sysenter_esp_canonical_address(intrinsics)?;
    check_host_ia32_sysenter_eip_canonical_address(intrinsics)?;
    check_host_verify_load_ia32_perf_global_ctrl(intrinsics)?;
    check_host_verify_load_ia32_pat(intrinsics)?;
    check_host_verify_load_ia32_efer(intrinsics)?;
    check_host_es_selector_rpl_ti_equal_zero(intrinsics)?;
    check_host_cs_selector_rpl_ti_equal_zero(intrinsics)?;
    check_host_ss_selector_rpl_ti_equal_zero(intrinsics)?;
    check_host_ds_selector_rpl_ti_equal_zero(intrinsics)?;
    check_host_fs_selector_rpl_ti_equal_zero(intrinsics)?;
    check_host_gs_selector_rpl_ti_equal_zero(intrinsics)?;
    check_host_tr_selector_rpl_ti_equal_zero(intrinsics)?;
    check_host_cs_not_equal_zero(intrinsics)?;
    check_host_tr_not_equal_zero(intrinsics)?;
    check_host_ss_not_equal_zero(intrinsics)?;
    check_host_fs_canonical_base_address(intrinsics)?;
    check_host_gs_canonical_base_address(intrinsics)?;
    check_host_gdtr_canonical_base_address(intrinsics)?;
    check_host_idtr_canonical_base_address(intrinsics)?;
    check_host_tr_canonical_base_address(intrinsics)?;
    check_host_if_outside_ia32e_mode(intrinsics)?;
    check_host_address_space_size_is_set(intrinsics)?;
    check_host_address_space_disabled(intrinsics)?;
    check_host_address_space_enabled(intrinsics)
}

// ---------------------------------------------------------------------------
// Guest-state checks
// ---------------------------------------------------------------------------

/// Runs the caller-registered guest-state checks, if any.
///
/// The built-in set is empty; embedders register checks through
/// [`crate::intel::vm::Vm::register_guest_state_check`].
pub fn check_vmcs_guest_state(intrinsics: &dyn Intrinsics, extra: &[GuestStateCheck]) -> Result<(), HypervisorError> {
    debug!("running {} guest-state checks", extra.len());

    for check in extra {
        check(intrinsics)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::mock::{MockIntrinsics, MockMemory},
        crate::intel::ports::vmwrite,
    };

    fn intrinsics() -> MockIntrinsics {
        MockIntrinsics::new()
    }

    fn set(i: &MockIntrinsics, field: u64, value: u64) {
        vmwrite(i, field, value).unwrap();
    }

    #[test]
    fn pin_reserved_bits_catch_a_forced_bit_cleared() {
        let i = intrinsics();
        i.set_msr(msr::IA32_VMX_TRUE_PINBASED_CTLS, (0xFFFF_FFFFu64 << 32) | 0x16);
        set(&i, fields::control::PINBASED_EXEC_CONTROLS, 0x0);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_pin_based_ctls_reserved_properly_set"));
    }

    #[test]
    fn earlier_enumerated_check_wins() {
        let i = intrinsics();
        i.set_msr(msr::IA32_VMX_TRUE_PINBASED_CTLS, (0xFFFF_FFFFu64 << 32) | 0x16);
        set(&i, fields::control::PINBASED_EXEC_CONTROLS, 0x0);
        // Also violate the CR3-target-count rule, enumerated later.
        set(&i, fields::control::CR3_TARGET_COUNT, 9);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_pin_based_ctls_reserved_properly_set"));
    }

    #[test]
    fn cr3_target_count_above_four_fails() {
        let i = intrinsics();
        set(&i, fields::control::CR3_TARGET_COUNT, 5);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_cr3_count_less_than_4"));
    }

    #[test]
    fn misaligned_io_bitmap_fails_when_io_bitmaps_enabled() {
        let i = intrinsics();
        set(&i, fields::control::PRIMARY_PROCBASED_EXEC_CONTROLS, proc::USE_IO_BITMAPS);
        set(&i, fields::control::IO_BITMAP_A_ADDR, 0x1234);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_io_bitmap_address_bits"));
    }

    #[test]
    fn io_bitmap_beyond_physical_width_fails() {
        let i = intrinsics();
        i.set_cpuid_eax(0x8000_0008, 36);
        set(&i, fields::control::PRIMARY_PROCBASED_EXEC_CONTROLS, proc::USE_IO_BITMAPS);
        set(&i, fields::control::IO_BITMAP_A_ADDR, 1u64 << 40);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_io_bitmap_address_bits"));
    }

    #[test]
    fn virtual_nmis_require_nmi_exiting() {
        let i = intrinsics();
        set(&i, fields::control::PINBASED_EXEC_CONTROLS, pin::VIRTUAL_NMIS);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_nmi_exiting_and_virtual_nmi"));
    }

    #[test]
    fn apic_features_require_a_tpr_shadow() {
        let i = intrinsics();
        set(
            &i,
            fields::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
            proc::ACTIVATE_SECONDARY_CONTROLS,
        );
        set(&i, fields::control::SECONDARY_PROCBASED_EXEC_CONTROLS, proc2::VIRTUALIZE_X2APIC_MODE);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_tpr_shadow_and_virtual_apic"));
    }

    #[test]
    fn vpid_zero_fails_when_vpid_enabled() {
        let i = intrinsics();
        set(
            &i,
            fields::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
            proc::ACTIVATE_SECONDARY_CONTROLS,
        );
        set(&i, fields::control::SECONDARY_PROCBASED_EXEC_CONTROLS, proc2::ENABLE_VPID);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_vpid_checks"));
    }

    #[test]
    fn malformed_eptp_fails_when_ept_enabled() {
        let i = intrinsics();
        set(
            &i,
            fields::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
            proc::ACTIVATE_SECONDARY_CONTROLS,
        );
        set(&i, fields::control::SECONDARY_PROCBASED_EXEC_CONTROLS, proc2::ENABLE_EPT);
        // Memory type 2 is reserved.
        set(&i, fields::control::EPT_POINTER, 0x1000 | (3 << 3) | 2);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_enable_ept_checks"));
    }

    #[test]
    fn well_formed_eptp_passes() {
        let i = intrinsics();
        set(
            &i,
            fields::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
            proc::ACTIVATE_SECONDARY_CONTROLS,
        );
        set(&i, fields::control::SECONDARY_PROCBASED_EXEC_CONTROLS, proc2::ENABLE_EPT);
        set(&i, fields::control::EPT_POINTER, 0x1000 | (3 << 3) | 6);

        check_vmcs_control_state(&i, &MockMemory::new()).unwrap();
    }

    #[test]
    fn unrestricted_guest_requires_ept() {
        let i = intrinsics();
        set(
            &i,
            fields::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
            proc::ACTIVATE_SECONDARY_CONTROLS,
        );
        set(&i, fields::control::SECONDARY_PROCBASED_EXEC_CONTROLS, proc2::UNRESTRICTED_GUEST);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_unrestricted_guests"));
    }

    #[test]
    fn save_preemption_timer_requires_activate() {
        let i = intrinsics();
        set(&i, fields::control::VMEXIT_CONTROLS, exit::SAVE_VMX_PREEMPTION_TIMER_VALUE);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_activate_and_save_preemption_timer_must_be_0"));
    }

    #[test]
    fn misaligned_exit_msr_store_area_fails() {
        let i = intrinsics();
        set(&i, fields::control::VMEXIT_MSR_STORE_COUNT, 2);
        set(&i, fields::control::VMEXIT_MSR_STORE_ADDR, 0x1008 | 0x4);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_exit_msr_store_address"));
    }

    #[test]
    fn unmappable_exit_msr_store_area_fails() {
        let i = intrinsics();
        let memory = MockMemory::new();
        memory.phys_to_virt_returns_null.set(true);
        set(&i, fields::control::VMEXIT_MSR_STORE_COUNT, 1);
        set(&i, fields::control::VMEXIT_MSR_STORE_ADDR, 0x1000);

        let err = check_vmcs_control_state(&i, &memory).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_exit_msr_store_address"));
    }

    #[test]
    fn nmi_injection_with_wrong_vector_fails() {
        let i = intrinsics();
        let info = INJECTION_VALID | (TYPE_NMI << 8) | 3;
        set(&i, fields::control::VMENTRY_INTERRUPTION_INFO, info);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_event_injection_type_vector_checks"));
    }

    #[test]
    fn error_code_delivery_limited_to_contributory_exceptions() {
        let i = intrinsics();
        let info = INJECTION_VALID | INJECTION_DELIVER_ERROR_CODE | (TYPE_HARDWARE_EXCEPTION << 8) | 3;
        set(&i, fields::control::VMENTRY_INTERRUPTION_INFO, info);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_event_injection_delivery_ec_checks"));
    }

    #[test]
    fn page_fault_injection_with_error_code_passes() {
        let i = intrinsics();
        let info = INJECTION_VALID | INJECTION_DELIVER_ERROR_CODE | (TYPE_HARDWARE_EXCEPTION << 8) | 14;
        set(&i, fields::control::VMENTRY_INTERRUPTION_INFO, info);

        check_vmcs_control_state(&i, &MockMemory::new()).unwrap();
    }

    #[test]
    fn injection_reserved_bits_must_be_zero() {
        let i = intrinsics();
        let info = INJECTION_VALID | (1 << 20) | 14 | (TYPE_HARDWARE_EXCEPTION << 8);
        set(&i, fields::control::VMENTRY_INTERRUPTION_INFO, info);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_event_injection_reserved_bits_checks"));
    }

    #[test]
    fn software_exception_instruction_length_is_bounded() {
        let i = intrinsics();
        let info = INJECTION_VALID | (TYPE_SOFTWARE_EXCEPTION << 8) | 3;
        set(&i, fields::control::VMENTRY_INTERRUPTION_INFO, info);
        set(&i, fields::control::VMENTRY_INSTRUCTION_LEN, 16);

        let err = check_vmcs_control_state(&i, &MockMemory::new()).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("control_event_injection_instr_length_checks"));
    }

    fn passing_host(i: &MockIntrinsics) {
        i.set_msr(msr::IA32_VMX_CR0_FIXED0, 0x21);
        i.set_msr(msr::IA32_VMX_CR0_FIXED1, u64::MAX);
        i.set_msr(msr::IA32_VMX_CR4_FIXED0, 0x2000);
        i.set_msr(msr::IA32_VMX_CR4_FIXED1, u64::MAX);
        i.set_msr(msr::IA32_EFER, EFER_LME | EFER_LMA);

        set(i, fields::control::VMEXIT_CONTROLS, exit::HOST_ADDRESS_SPACE_SIZE | exit::LOAD_IA32_EFER);
        set(i, fields::host::CR0, 0x21);
        set(i, fields::host::CR4, 0x2000 | (1 << 5));
        set(i, fields::host::IA32_EFER, EFER_LME | EFER_LMA);
        set(i, fields::host::CS_SELECTOR, 0x08);
        set(i, fields::host::SS_SELECTOR, 0x10);
        set(i, fields::host::TR_SELECTOR, 0x18);
        set(i, fields::host::RIP, 0xFFFF_8000_0000_0000);
    }

    #[test]
    fn a_consistent_host_state_passes() {
        let i = intrinsics();
        passing_host(&i);

        check_vmcs_host_state(&i).unwrap();
    }

    #[test]
    fn host_cr0_missing_a_fixed_bit_fails() {
        let i = intrinsics();
        passing_host(&i);
        set(&i, fields::host::CR0, 0x20);

        let err = check_vmcs_host_state(&i).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("host_cr0_for_unsupported_bits"));
    }

    #[test]
    fn host_cr3_beyond_physical_width_fails() {
        let i = intrinsics();
        passing_host(&i);
        i.set_cpuid_eax(0x8000_0008, 36);
        set(&i, fields::host::CR3, 1u64 << 40);

        let err = check_vmcs_host_state(&i).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("host_cr3_for_unsupported_bits"));
    }

    #[test]
    fn host_sysenter_esp_must_be_canonical() {
        let i = intrinsics();
        passing_host(&i);
        set(&i, fields::host::IA32_SYSENTER_ESP, 0x0000_9000_0000_0000);

        let err = check_vmcs_host_state(&i).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("host_ia32_sysenter_esp_canonical_address"));
    }

    #[test]
    fn host_pat_with_reserved_memory_type_fails() {
        let i = intrinsics();
        passing_host(&i);
        set(
            &i,
            fields::control::VMEXIT_CONTROLS,
            exit::HOST_ADDRESS_SPACE_SIZE | exit::LOAD_IA32_EFER | exit::LOAD_IA32_PAT,
        );
        set(&i, fields::host::IA32_PAT, 0x0000_0000_0000_0002);

        let err = check_vmcs_host_state(&i).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("host_verify_load_ia32_pat"));
    }

    #[test]
    fn host_efer_must_match_address_space_size() {
        let i = intrinsics();
        passing_host(&i);
        set(&i, fields::host::IA32_EFER, 0);

        let err = check_vmcs_host_state(&i).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("host_verify_load_ia32_efer"));
    }

    #[test]
    fn host_selector_with_rpl_fails() {
        let i = intrinsics();
        passing_host(&i);
        set(&i, fields::host::ES_SELECTOR, 0x10 | 0x3);

        let err = check_vmcs_host_state(&i).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("host_es_selector_rpl_ti_equal_zero"));
    }

    #[test]
    fn host_cs_must_be_nonzero() {
        let i = intrinsics();
        passing_host(&i);
        set(&i, fields::host::CS_SELECTOR, 0);

        let err = check_vmcs_host_state(&i).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("host_cs_not_equal_zero"));
    }

    #[test]
    fn host_gdtr_base_must_be_canonical() {
        let i = intrinsics();
        passing_host(&i);
        set(&i, fields::host::GDTR_BASE, 0x0000_9000_0000_0000);

        let err = check_vmcs_host_state(&i).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("host_gdtr_canonical_base_address"));
    }

    #[test]
    fn ia32e_host_requires_the_address_space_bit() {
        let i = intrinsics();
        passing_host(&i);
        set(&i, fields::control::VMEXIT_CONTROLS, exit::LOAD_IA32_EFER);
        set(&i, fields::host::IA32_EFER, 0);

        let err = check_vmcs_host_state(&i).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("host_address_space_size_is_set"));
    }

    #[test]
    fn ia32e_host_requires_cr4_pae() {
        let i = intrinsics();
        passing_host(&i);
        set(&i, fields::host::CR4, 0x2000);

        let err = check_vmcs_host_state(&i).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("host_address_space_enabled"));
    }

    #[test]
    fn empty_guest_check_set_passes() {
        let i = intrinsics();

        check_vmcs_guest_state(&i, &[]).unwrap();
    }

    #[test]
    fn registered_guest_checks_run_in_order() {
        let i = intrinsics();

        fn failing(_: &dyn Intrinsics) -> Result<(), HypervisorError> {
            Err(HypervisorError::ArchCheckFailed("guest_rip_canonical"))
        }

        let err = check_vmcs_guest_state(&i, &[failing]).unwrap_err();
        assert_eq!(err, HypervisorError::ArchCheckFailed("guest_rip_canonical"));
    }
}
