//! Resume and promote trampolines.
//!
//! Both stubs hand control away and are not expected to return: resume
//! reloads the saved guest registers and executes VMRESUME; promote rebuilds
//! a regular (non-VMX) context from the guest fields of the current VMCS.
//! The coordinator treats a return from either as an error.

use core::{arch::global_asm, mem::offset_of};

/// Register file the exit handler saves for [`vmx_resume_context`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// Signature of a resume trampoline.
pub type ResumeTrampoline = unsafe extern "sysv64" fn(*mut SavedRegisters);

/// Signature of a promote trampoline.
pub type PromoteTrampoline = unsafe extern "sysv64" fn(u64);

unsafe extern "sysv64" {
    /// Restores `saved` and executes VMRESUME on the current VMCS.
    /// Falls through only when VMRESUME is refused.
    pub fn vmx_resume_context(saved: *mut SavedRegisters);

    /// Loads `host_gs_base` and continues execution as the guest context of
    /// the current VMCS, outside VMX non-root operation.
    /// Falls through only when the VMCS cannot be read.
    pub fn vmx_promote_context(host_gs_base: u64);
}

global_asm!(
    r#"
    .global vmx_resume_context

vmx_resume_context:
    // Callee-saved registers survive the failure path.
    push    rbx
    push    rbp
    push    r12
    push    r13
    push    r14
    push    r15

    mov     rax, [rdi + {rax_off}]
    mov     rcx, [rdi + {rcx_off}]
    mov     rdx, [rdi + {rdx_off}]
    mov     rbx, [rdi + {rbx_off}]
    mov     rbp, [rdi + {rbp_off}]
    mov     rsi, [rdi + {rsi_off}]
    mov     r8,  [rdi + {r8_off}]
    mov     r9,  [rdi + {r9_off}]
    mov     r10, [rdi + {r10_off}]
    mov     r11, [rdi + {r11_off}]
    mov     r12, [rdi + {r12_off}]
    mov     r13, [rdi + {r13_off}]
    mov     r14, [rdi + {r14_off}]
    mov     r15, [rdi + {r15_off}]
    mov     rdi, [rdi + {rdi_off}]

    vmresume

    // Only reached when VMRESUME is refused.
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rbp
    pop     rbx
    ret
"#,
    rax_off = const offset_of!(SavedRegisters, rax),
    rcx_off = const offset_of!(SavedRegisters, rcx),
    rdx_off = const offset_of!(SavedRegisters, rdx),
    rbx_off = const offset_of!(SavedRegisters, rbx),
    rbp_off = const offset_of!(SavedRegisters, rbp),
    rsi_off = const offset_of!(SavedRegisters, rsi),
    rdi_off = const offset_of!(SavedRegisters, rdi),
    r8_off = const offset_of!(SavedRegisters, r8),
    r9_off = const offset_of!(SavedRegisters, r9),
    r10_off = const offset_of!(SavedRegisters, r10),
    r11_off = const offset_of!(SavedRegisters, r11),
    r12_off = const offset_of!(SavedRegisters, r12),
    r13_off = const offset_of!(SavedRegisters, r13),
    r14_off = const offset_of!(SavedRegisters, r14),
    r15_off = const offset_of!(SavedRegisters, r15),
);

global_asm!(
    r#"
    .global vmx_promote_context

vmx_promote_context:
    // rdi = host GS base to restore through IA32_GS_BASE.
    mov     ecx, 0xC0000101
    mov     eax, edi
    mov     rdx, rdi
    shr     rdx, 32
    wrmsr

    // Pull the guest context out of the current VMCS. The switch assumes
    // host and guest share segment state, as they do when the running OS
    // was virtualized in place.
    mov     rax, {guest_cr3}
    vmread  rcx, rax
    mov     cr3, rcx

    mov     rax, {guest_rflags}
    vmread  rcx, rax
    mov     rax, {guest_rsp}
    vmread  rdx, rax
    mov     rax, {guest_rip}
    vmread  rax, rax

    mov     rsp, rdx
    push    rcx
    popfq
    jmp     rax
"#,
    guest_cr3 = const 0x6802u32,
    guest_rflags = const 0x6820u32,
    guest_rsp = const 0x681Cu32,
    guest_rip = const 0x681Eu32,
);
