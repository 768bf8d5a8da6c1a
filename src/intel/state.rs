//! CPU state snapshots.
//!
//! A [`VmcsState`] is the read-only record the field writer copies into the
//! VMCS. The coordinator takes one for the host role and one for the guest
//! role; guest-only fields (limits, access rights, RFLAGS, DR7) are simply
//! ignored when the snapshot is used as host state.

use {
    crate::intel::{
        segmentation::SegmentDescriptor,
        support::{cr3, rdmsr, sgdt, sidt},
    },
    log::error,
    x86::{
        bits64::rflags,
        debugregs,
        msr,
        segmentation::{SegmentSelector, cs, ds, es, fs, gs, ss},
    },
    x86_64::registers::control::{Cr0, Cr4},
};

const IA32_PERF_GLOBAL_CTRL: u32 = 0x38F;

/// Everything the field writer needs to populate one role of the VMCS.
#[derive(Debug, Default, Clone, Copy)]
pub struct VmcsState {
    // Segment selectors
    pub es: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub fs: u16,
    pub gs: u16,
    pub ldtr: u16,
    pub tr: u16,

    // Segment limits (guest role only)
    pub es_limit: u32,
    pub cs_limit: u32,
    pub ss_limit: u32,
    pub ds_limit: u32,
    pub fs_limit: u32,
    pub gs_limit: u32,
    pub ldtr_limit: u32,
    pub tr_limit: u32,

    // Segment access rights (guest role only)
    pub es_access_rights: u32,
    pub cs_access_rights: u32,
    pub ss_access_rights: u32,
    pub ds_access_rights: u32,
    pub fs_access_rights: u32,
    pub gs_access_rights: u32,
    pub ldtr_access_rights: u32,
    pub tr_access_rights: u32,

    // Segment bases
    pub es_base: u64,
    pub cs_base: u64,
    pub ss_base: u64,
    pub ds_base: u64,
    pub ldtr_base: u64,
    pub tr_base: u64,

    // Descriptor tables
    pub gdt_base: u64,
    pub gdt_limit: u32,
    pub idt_base: u64,
    pub idt_limit: u32,

    // Control registers
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,

    // Debug state (guest role only)
    pub dr7: u64,
    pub rflags: u64,

    // MSRs
    pub ia32_debugctl_msr: u64,
    pub ia32_pat_msr: u64,
    pub ia32_efer_msr: u64,
    pub ia32_perf_global_ctrl_msr: u64,
    pub ia32_sysenter_cs_msr: u64,
    pub ia32_sysenter_esp_msr: u64,
    pub ia32_sysenter_eip_msr: u64,
    pub ia32_fs_base_msr: u64,
    pub ia32_gs_base_msr: u64,
}

impl VmcsState {
    /// Captures the state of the running logical CPU.
    ///
    /// Segment limits, access rights, and bases are parsed out of the live
    /// GDT; FS/GS bases come from their MSRs as they do in long mode.
    pub fn from_current_cpu() -> Self {
        let gdtr = sgdt();
        let idtr = sidt();

        let ldtr = unsafe { x86::dtables::ldtr() };
        let tr = unsafe { x86::task::tr() };

        let describe = |selector: SegmentSelector| SegmentDescriptor::from_selector(selector, &gdtr);

        let es_desc = describe(es());
        let cs_desc = describe(cs());
        let ss_desc = describe(ss());
        let ds_desc = describe(ds());
        let fs_desc = describe(fs());
        let gs_desc = describe(gs());
        let ldtr_desc = describe(ldtr);
        let tr_desc = describe(tr);

        Self {
            es: es().bits(),
            cs: cs().bits(),
            ss: ss().bits(),
            ds: ds().bits(),
            fs: fs().bits(),
            gs: gs().bits(),
            ldtr: ldtr.bits(),
            tr: tr.bits(),

            es_limit: es_desc.limit,
            cs_limit: cs_desc.limit,
            ss_limit: ss_desc.limit,
            ds_limit: ds_desc.limit,
            fs_limit: fs_desc.limit,
            gs_limit: gs_desc.limit,
            ldtr_limit: ldtr_desc.limit,
            tr_limit: tr_desc.limit,

            es_access_rights: es_desc.access_rights,
            cs_access_rights: cs_desc.access_rights,
            ss_access_rights: ss_desc.access_rights,
            ds_access_rights: ds_desc.access_rights,
            fs_access_rights: fs_desc.access_rights,
            gs_access_rights: gs_desc.access_rights,
            ldtr_access_rights: ldtr_desc.access_rights,
            tr_access_rights: tr_desc.access_rights,

            es_base: es_desc.base,
            cs_base: cs_desc.base,
            ss_base: ss_desc.base,
            ds_base: ds_desc.base,
            ldtr_base: ldtr_desc.base,
            tr_base: tr_desc.base,

            gdt_base: gdtr.base as u64,
            gdt_limit: gdtr.limit as u32,
            idt_base: idtr.base as u64,
            idt_limit: idtr.limit as u32,

            cr0: Cr0::read_raw(),
            cr3: cr3(),
            cr4: Cr4::read_raw(),

            dr7: unsafe { debugregs::dr7().0 as u64 },
            rflags: rflags::read().bits(),

            ia32_debugctl_msr: rdmsr(msr::IA32_DEBUGCTL),
            ia32_pat_msr: rdmsr(msr::IA32_PAT),
            ia32_efer_msr: rdmsr(msr::IA32_EFER),
            ia32_perf_global_ctrl_msr: rdmsr(IA32_PERF_GLOBAL_CTRL),
            ia32_sysenter_cs_msr: rdmsr(msr::IA32_SYSENTER_CS),
            ia32_sysenter_esp_msr: rdmsr(msr::IA32_SYSENTER_ESP),
            ia32_sysenter_eip_msr: rdmsr(msr::IA32_SYSENTER_EIP),
            ia32_fs_base_msr: rdmsr(msr::IA32_FS_BASE),
            ia32_gs_base_msr: rdmsr(msr::IA32_GS_BASE),
        }
    }

    /// Logs every field of the snapshot for the launch-failure diagnostics.
    pub fn dump(&self) {
        error!("selectors: es={:#06x} cs={:#06x} ss={:#06x} ds={:#06x} fs={:#06x} gs={:#06x} ldtr={:#06x} tr={:#06x}",
            self.es, self.cs, self.ss, self.ds, self.fs, self.gs, self.ldtr, self.tr);
        error!("limits: es={:#x} cs={:#x} ss={:#x} ds={:#x} fs={:#x} gs={:#x} ldtr={:#x} tr={:#x}",
            self.es_limit, self.cs_limit, self.ss_limit, self.ds_limit, self.fs_limit, self.gs_limit, self.ldtr_limit, self.tr_limit);
        error!("access rights: es={:#x} cs={:#x} ss={:#x} ds={:#x} fs={:#x} gs={:#x} ldtr={:#x} tr={:#x}",
            self.es_access_rights, self.cs_access_rights, self.ss_access_rights, self.ds_access_rights,
            self.fs_access_rights, self.gs_access_rights, self.ldtr_access_rights, self.tr_access_rights);
        error!("bases: es={:#x} cs={:#x} ss={:#x} ds={:#x} ldtr={:#x} tr={:#x}",
            self.es_base, self.cs_base, self.ss_base, self.ds_base, self.ldtr_base, self.tr_base);
        error!("gdtr: base={:#x} limit={:#x}; idtr: base={:#x} limit={:#x}",
            self.gdt_base, self.gdt_limit, self.idt_base, self.idt_limit);
        error!("cr0={:#x} cr3={:#x} cr4={:#x} dr7={:#x} rflags={:#x}", self.cr0, self.cr3, self.cr4, self.dr7, self.rflags);
        error!("ia32_debugctl={:#x} ia32_pat={:#x} ia32_efer={:#x} ia32_perf_global_ctrl={:#x}",
            self.ia32_debugctl_msr, self.ia32_pat_msr, self.ia32_efer_msr, self.ia32_perf_global_ctrl_msr);
        error!("ia32_sysenter: cs={:#x} esp={:#x} eip={:#x}",
            self.ia32_sysenter_cs_msr, self.ia32_sysenter_esp_msr, self.ia32_sysenter_eip_msr);
        error!("ia32_fs_base={:#x} ia32_gs_base={:#x}", self.ia32_fs_base_msr, self.ia32_gs_base_msr);
    }
}
