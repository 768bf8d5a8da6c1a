//! The VMCS region and the field writer.
//!
//! The region is a 4 KiB naturally aligned page whose first word carries the
//! VMX revision identifier. The writer copies a [`VmcsState`] snapshot into
//! the guest- and host-state field sets, one width class at a time; control
//! state is seeded and synthesized separately by [`crate::intel::controls`].

use {
    crate::{
        error::HypervisorError,
        intel::{
            fields,
            ports::{Intrinsics, vmwrite},
            state::VmcsState,
        },
    },
    alloc::boxed::Box,
    bit_field::BitField,
    core::fmt,
    log::debug,
    static_assertions::const_assert_eq,
    x86::{bits64::paging::BASE_PAGE_SIZE, msr},
};

/// The 4 KiB VMCS page handed to VMCLEAR/VMPTRLD.
#[repr(C, align(4096))]
pub struct VmcsRegion {
    pub revision_id: u32,
    pub abort_indicator: u32,
    reserved: [u8; BASE_PAGE_SIZE - 8],
}

const_assert_eq!(core::mem::size_of::<VmcsRegion>(), BASE_PAGE_SIZE);

impl VmcsRegion {
    /// Allocates a zeroed region.
    pub fn zeroed() -> Box<Self> {
        Box::new(Self {
            revision_id: 0,
            abort_indicator: 0,
            reserved: [0; BASE_PAGE_SIZE - 8],
        })
    }

    /// Stamps the revision identifier from IA32_VMX_BASIC. Bit 31 is the
    /// shadow-VMCS indicator and must stay clear for an ordinary VMCS.
    pub fn init(&mut self, intrinsics: &dyn Intrinsics) {
        self.revision_id = intrinsics.read_msr(msr::IA32_VMX_BASIC) as u32;
        self.revision_id.set_bit(31, false);
    }
}

impl fmt::Debug for VmcsRegion {
    fn fmt(&self, format: &mut fmt::Formatter<'_>) -> fmt::Result {
        format
            .debug_struct("VmcsRegion")
            .field("address", &(self as *const _))
            .field("revision_id", &self.revision_id)
            .finish_non_exhaustive()
    }
}

/// Writes the full guest-state field set from `state`.
///
/// GUEST_RSP/RIP are owned by the launch intrinsic and are not written here.
pub fn setup_guest_state(intrinsics: &dyn Intrinsics, state: &VmcsState) -> Result<(), HypervisorError> {
    debug!("writing guest-state fields");

    write_16bit_guest_state(intrinsics, state)?;
    write_64bit_guest_state(intrinsics, state)?;
    write_32bit_guest_state(intrinsics, state)?;
    write_natural_guest_state(intrinsics, state)?;

    Ok(())
}

fn write_16bit_guest_state(intrinsics: &dyn Intrinsics, state: &VmcsState) -> Result<(), HypervisorError> {
    vmwrite(intrinsics, fields::guest::ES_SELECTOR, state.es)?;
    vmwrite(intrinsics, fields::guest::CS_SELECTOR, state.cs)?;
    vmwrite(intrinsics, fields::guest::SS_SELECTOR, state.ss)?;
    vmwrite(intrinsics, fields::guest::DS_SELECTOR, state.ds)?;
    vmwrite(intrinsics, fields::guest::FS_SELECTOR, state.fs)?;
    vmwrite(intrinsics, fields::guest::GS_SELECTOR, state.gs)?;
    vmwrite(intrinsics, fields::guest::LDTR_SELECTOR, state.ldtr)?;
    vmwrite(intrinsics, fields::guest::TR_SELECTOR, state.tr)
}

fn write_64bit_guest_state(intrinsics: &dyn Intrinsics, state: &VmcsState) -> Result<(), HypervisorError> {
    // No shadow VMCS; the link pointer must read all-ones.
    vmwrite(intrinsics, fields::guest::LINK_PTR, u64::MAX)?;
    vmwrite(intrinsics, fields::guest::IA32_DEBUGCTL, state.ia32_debugctl_msr)?;
    vmwrite(intrinsics, fields::guest::IA32_PAT, state.ia32_pat_msr)?;
    vmwrite(intrinsics, fields::guest::IA32_EFER, state.ia32_efer_msr)?;
    vmwrite(intrinsics, fields::guest::IA32_PERF_GLOBAL_CTRL, state.ia32_perf_global_ctrl_msr)
}

fn write_32bit_guest_state(intrinsics: &dyn Intrinsics, state: &VmcsState) -> Result<(), HypervisorError> {
    vmwrite(intrinsics, fields::guest::ES_LIMIT, state.es_limit)?;
    vmwrite(intrinsics, fields::guest::CS_LIMIT, state.cs_limit)?;
    vmwrite(intrinsics, fields::guest::SS_LIMIT, state.ss_limit)?;
    vmwrite(intrinsics, fields::guest::DS_LIMIT, state.ds_limit)?;
    vmwrite(intrinsics, fields::guest::FS_LIMIT, state.fs_limit)?;
    vmwrite(intrinsics, fields::guest::GS_LIMIT, state.gs_limit)?;
    vmwrite(intrinsics, fields::guest::LDTR_LIMIT, state.ldtr_limit)?;
    vmwrite(intrinsics, fields::guest::TR_LIMIT, state.tr_limit)?;

    vmwrite(intrinsics, fields::guest::GDTR_LIMIT, state.gdt_limit)?;
    vmwrite(intrinsics, fields::guest::IDTR_LIMIT, state.idt_limit)?;

    vmwrite(intrinsics, fields::guest::ES_ACCESS_RIGHTS, state.es_access_rights)?;
    vmwrite(intrinsics, fields::guest::CS_ACCESS_RIGHTS, state.cs_access_rights)?;
    vmwrite(intrinsics, fields::guest::SS_ACCESS_RIGHTS, state.ss_access_rights)?;
    vmwrite(intrinsics, fields::guest::DS_ACCESS_RIGHTS, state.ds_access_rights)?;
    vmwrite(intrinsics, fields::guest::FS_ACCESS_RIGHTS, state.fs_access_rights)?;
    vmwrite(intrinsics, fields::guest::GS_ACCESS_RIGHTS, state.gs_access_rights)?;
    vmwrite(intrinsics, fields::guest::LDTR_ACCESS_RIGHTS, state.ldtr_access_rights)?;
    vmwrite(intrinsics, fields::guest::TR_ACCESS_RIGHTS, state.tr_access_rights)?;

    vmwrite(intrinsics, fields::guest::IA32_SYSENTER_CS, state.ia32_sysenter_cs_msr)
}

fn write_natural_guest_state(intrinsics: &dyn Intrinsics, state: &VmcsState) -> Result<(), HypervisorError> {
    vmwrite(intrinsics, fields::guest::CR0, state.cr0)?;
    vmwrite(intrinsics, fields::guest::CR3, state.cr3)?;
    vmwrite(intrinsics, fields::guest::CR4, state.cr4)?;

    vmwrite(intrinsics, fields::guest::ES_BASE, state.es_base)?;
    vmwrite(intrinsics, fields::guest::CS_BASE, state.cs_base)?;
    vmwrite(intrinsics, fields::guest::SS_BASE, state.ss_base)?;
    vmwrite(intrinsics, fields::guest::DS_BASE, state.ds_base)?;
    vmwrite(intrinsics, fields::guest::FS_BASE, state.ia32_fs_base_msr)?;
    vmwrite(intrinsics, fields::guest::GS_BASE, state.ia32_gs_base_msr)?;
    vmwrite(intrinsics, fields::guest::LDTR_BASE, state.ldtr_base)?;
    vmwrite(intrinsics, fields::guest::TR_BASE, state.tr_base)?;

    vmwrite(intrinsics, fields::guest::GDTR_BASE, state.gdt_base)?;
    vmwrite(intrinsics, fields::guest::IDTR_BASE, state.idt_base)?;

    vmwrite(intrinsics, fields::guest::DR7, state.dr7)?;
    vmwrite(intrinsics, fields::guest::RFLAGS, state.rflags)?;

    vmwrite(intrinsics, fields::guest::IA32_SYSENTER_ESP, state.ia32_sysenter_esp_msr)?;
    vmwrite(intrinsics, fields::guest::IA32_SYSENTER_EIP, state.ia32_sysenter_eip_msr)
}

/// Writes the full host-state field set from `state`.
///
/// `host_rsp` is the aligned top of the exit-handler stack and `host_rip`
/// the exit-handler entry point; both come from the coordinator.
pub fn setup_host_state(
    intrinsics: &dyn Intrinsics,
    state: &VmcsState,
    host_rsp: u64,
    host_rip: u64,
) -> Result<(), HypervisorError> {
    debug!("writing host-state fields, rsp={:#x} rip={:#x}", host_rsp, host_rip);

    write_16bit_host_state(intrinsics, state)?;
    write_64bit_host_state(intrinsics, state)?;
    write_32bit_host_state(intrinsics, state)?;
    write_natural_host_state(intrinsics, state, host_rsp, host_rip)?;

    Ok(())
}

fn write_16bit_host_state(intrinsics: &dyn Intrinsics, state: &VmcsState) -> Result<(), HypervisorError> {
    vmwrite(intrinsics, fields::host::ES_SELECTOR, state.es)?;
    vmwrite(intrinsics, fields::host::CS_SELECTOR, state.cs)?;
    vmwrite(intrinsics, fields::host::SS_SELECTOR, state.ss)?;
    vmwrite(intrinsics, fields::host::DS_SELECTOR, state.ds)?;
    vmwrite(intrinsics, fields::host::FS_SELECTOR, state.fs)?;
    vmwrite(intrinsics, fields::host::GS_SELECTOR, state.gs)?;
    vmwrite(intrinsics, fields::host::TR_SELECTOR, state.tr)
}

fn write_64bit_host_state(intrinsics: &dyn Intrinsics, state: &VmcsState) -> Result<(), HypervisorError> {
    vmwrite(intrinsics, fields::host::IA32_PAT, state.ia32_pat_msr)?;
    vmwrite(intrinsics, fields::host::IA32_EFER, state.ia32_efer_msr)?;
    vmwrite(intrinsics, fields::host::IA32_PERF_GLOBAL_CTRL, state.ia32_perf_global_ctrl_msr)
}

fn write_32bit_host_state(intrinsics: &dyn Intrinsics, state: &VmcsState) -> Result<(), HypervisorError> {
    vmwrite(intrinsics, fields::host::IA32_SYSENTER_CS, state.ia32_sysenter_cs_msr)
}

fn write_natural_host_state(
    intrinsics: &dyn Intrinsics,
    state: &VmcsState,
    host_rsp: u64,
    host_rip: u64,
) -> Result<(), HypervisorError> {
    vmwrite(intrinsics, fields::host::CR0, state.cr0)?;
    vmwrite(intrinsics, fields::host::CR3, state.cr3)?;
    vmwrite(intrinsics, fields::host::CR4, state.cr4)?;

    vmwrite(intrinsics, fields::host::FS_BASE, state.ia32_fs_base_msr)?;
    vmwrite(intrinsics, fields::host::GS_BASE, state.ia32_gs_base_msr)?;
    vmwrite(intrinsics, fields::host::TR_BASE, state.tr_base)?;

    vmwrite(intrinsics, fields::host::GDTR_BASE, state.gdt_base)?;
    vmwrite(intrinsics, fields::host::IDTR_BASE, state.idt_base)?;

    vmwrite(intrinsics, fields::host::IA32_SYSENTER_ESP, state.ia32_sysenter_esp_msr)?;
    vmwrite(intrinsics, fields::host::IA32_SYSENTER_EIP, state.ia32_sysenter_eip_msr)?;

    vmwrite(intrinsics, fields::host::RSP, host_rsp)?;
    vmwrite(intrinsics, fields::host::RIP, host_rip)
}
