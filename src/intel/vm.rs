//! The launch/resume/promote coordinator.
//!
//! [`Vm`] owns the VMCS region and the exit-handler stack between `launch`
//! entry and return. Each launch step hands its resource to the coordinator;
//! when any step fails, the rollback path releases everything acquired so
//! far in reverse order before the error propagates.

use {
    crate::{
        error::{HypervisorError, VmxInstruction},
        global_const::STACK_SIZE,
        intel::{
            checks::{self, GuestStateCheck},
            controls, diagnostics,
            ports::{Intrinsics, MemoryManager},
            state::VmcsState,
            trampoline::{PromoteTrampoline, ResumeTrampoline, SavedRegisters, vmx_promote_context, vmx_resume_context},
            vmcs::{self, VmcsRegion},
        },
    },
    alloc::{boxed::Box, vec, vec::Vec},
    core::convert::Infallible,
    log::{error, trace},
};

/// Where the coordinator is in the launch sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStage {
    Idle,
    RegionCreated,
    StackCreated,
    Cleared,
    Loaded,
    StateWritten,
    ControlsWritten,
    Launched,
    Failed,
}

/// Coordinates one VMCS through allocation, population, and launch.
///
/// Borrows its ports for its own lifetime and never stores them elsewhere.
pub struct Vm<'a> {
    intrinsics: &'a dyn Intrinsics,
    memory: &'a dyn MemoryManager,
    exit_handler_entry: u64,
    vmcs_region: Option<Box<VmcsRegion>>,
    vmcs_region_phys: u64,
    exit_handler_stack: Option<Box<[u8]>>,
    state_save: *mut SavedRegisters,
    resume_trampoline: ResumeTrampoline,
    promote_trampoline: PromoteTrampoline,
    guest_checks: Vec<GuestStateCheck>,
    stage: LaunchStage,
}

/// Top of the exit-handler stack, rounded down to 16 bytes.
fn exit_stack_top(base: usize, len: usize) -> u64 {
    ((base + len) as u64) & !0xF
}

impl<'a> Vm<'a> {
    /// Creates an idle coordinator. `exit_handler_entry` is written verbatim
    /// into `HOST_RIP`; the core does not interpret it.
    pub fn new(intrinsics: &'a dyn Intrinsics, memory: &'a dyn MemoryManager, exit_handler_entry: u64) -> Self {
        Self {
            intrinsics,
            memory,
            exit_handler_entry,
            vmcs_region: None,
            vmcs_region_phys: 0,
            exit_handler_stack: None,
            state_save: core::ptr::null_mut(),
            resume_trampoline: vmx_resume_context,
            promote_trampoline: vmx_promote_context,
            guest_checks: Vec::new(),
            stage: LaunchStage::Idle,
        }
    }

    pub fn stage(&self) -> LaunchStage {
        self.stage
    }

    /// Physical address of the VMCS region; zero while no region is live.
    pub fn vmcs_region_phys(&self) -> u64 {
        self.vmcs_region_phys
    }

    pub fn exit_handler_stack(&self) -> Option<&[u8]> {
        self.exit_handler_stack.as_deref()
    }

    /// Registers the register file `resume` hands to its trampoline.
    pub fn set_state_save(&mut self, state_save: *mut SavedRegisters) {
        self.state_save = state_save;
    }

    /// Replaces the resume trampoline.
    pub fn set_resume_trampoline(&mut self, trampoline: ResumeTrampoline) {
        self.resume_trampoline = trampoline;
    }

    /// Replaces the promote trampoline.
    pub fn set_promote_trampoline(&mut self, trampoline: PromoteTrampoline) {
        self.promote_trampoline = trampoline;
    }

    /// Adds a guest-state check to run when a launch is refused.
    pub fn register_guest_state_check(&mut self, check: GuestStateCheck) {
        self.guest_checks.push(check);
    }

    /// Builds the VMCS from the two snapshots and launches the guest.
    ///
    /// On success the region and stack stay allocated; ownership of both
    /// conceptually passes to the exit handler. On any failure they are
    /// released, last acquired first, before the error is returned.
    pub fn launch(&mut self, host_state: &VmcsState, guest_state: &VmcsState) -> Result<(), HypervisorError> {
        match self.try_launch(host_state, guest_state) {
            Ok(()) => {
                self.stage = LaunchStage::Launched;
                trace!("guest launched");
                Ok(())
            }
            Err(error) => {
                self.rollback();
                self.stage = LaunchStage::Failed;
                Err(error)
            }
        }
    }

    fn try_launch(&mut self, host_state: &VmcsState, guest_state: &VmcsState) -> Result<(), HypervisorError> {
        self.create_vmcs_region()?;
        self.create_exit_handler_stack();
        self.clear()?;
        self.load()?;

        vmcs::setup_guest_state(self.intrinsics, guest_state)?;
        vmcs::setup_host_state(self.intrinsics, host_state, self.host_rsp(), self.exit_handler_entry)?;
        self.stage = LaunchStage::StateWritten;

        controls::seed_control_state(self.intrinsics)?;
        controls::synthesize_execution_controls(self.intrinsics)?;
        self.stage = LaunchStage::ControlsWritten;

        trace!("executing vmlaunch");
        if !self.intrinsics.vmlaunch() {
            return Err(self.launch_failure(host_state, guest_state));
        }

        Ok(())
    }

    /// Hands control back to the guest through the resume trampoline.
    ///
    /// The trampoline does not return; a return is reported as
    /// [`HypervisorError::ResumeReturned`].
    pub fn resume(&mut self) -> Result<Infallible, HypervisorError> {
        trace!("resuming guest");
        unsafe { (self.resume_trampoline)(self.state_save) };

        error!("resume trampoline returned");
        Err(HypervisorError::ResumeReturned)
    }

    /// Dissolves the virtualization: restores `host_gs_base` and continues
    /// the guest context of the current VMCS as a regular one.
    ///
    /// The trampoline does not return; a return is reported as
    /// [`HypervisorError::PromoteReturned`].
    pub fn promote(&mut self, host_gs_base: u64) -> Result<Infallible, HypervisorError> {
        trace!("promoting guest state to a regular context");
        unsafe { (self.promote_trampoline)(host_gs_base) };

        error!("promote trampoline returned");
        Err(HypervisorError::PromoteReturned)
    }

    fn create_vmcs_region(&mut self) -> Result<(), HypervisorError> {
        trace!("creating vmcs region");

        let mut region = VmcsRegion::zeroed();
        region.init(self.intrinsics);

        let phys = self.memory.virt_to_phys(region.as_ref() as *const VmcsRegion as *const u8);
        if phys == 0 {
            error!("vmcs region has no physical mapping");
            return Err(HypervisorError::RegionAllocationFailed);
        }

        self.vmcs_region = Some(region);
        self.vmcs_region_phys = phys;
        self.stage = LaunchStage::RegionCreated;
        trace!("vmcs region at {:#x}", phys);

        Ok(())
    }

    fn release_vmcs_region(&mut self) {
        self.vmcs_region = None;
        self.vmcs_region_phys = 0;
    }

    fn create_exit_handler_stack(&mut self) {
        trace!("creating exit-handler stack");
        self.exit_handler_stack = Some(vec![0u8; STACK_SIZE].into_boxed_slice());
        self.stage = LaunchStage::StackCreated;
    }

    fn release_exit_handler_stack(&mut self) {
        self.exit_handler_stack = None;
    }

    /// Releases everything a failed launch acquired, last first.
    fn rollback(&mut self) {
        trace!("releasing launch resources");
        self.release_exit_handler_stack();
        self.release_vmcs_region();
    }

    fn clear(&mut self) -> Result<(), HypervisorError> {
        if !self.intrinsics.vmclear(&self.vmcs_region_phys) {
            error!("vmclear failed for {:#x}", self.vmcs_region_phys);
            return Err(HypervisorError::VmxInstructionFailed(VmxInstruction::Clear));
        }

        self.stage = LaunchStage::Cleared;
        Ok(())
    }

    fn load(&mut self) -> Result<(), HypervisorError> {
        if !self.intrinsics.vmptrld(&self.vmcs_region_phys) {
            error!("vmptrld failed for {:#x}", self.vmcs_region_phys);
            return Err(HypervisorError::VmxInstructionFailed(VmxInstruction::Load));
        }

        self.stage = LaunchStage::Loaded;
        Ok(())
    }

    fn host_rsp(&self) -> u64 {
        match &self.exit_handler_stack {
            Some(stack) => exit_stack_top(stack.as_ptr() as usize, stack.len()),
            None => 0,
        }
    }

    /// Produces the diagnostic trail for a refused launch and the final
    /// error carrying `VM_INSTRUCTION_ERROR`.
    fn launch_failure(&self, host_state: &VmcsState, guest_state: &VmcsState) -> HypervisorError {
        error!("vmlaunch refused the vmcs");

        if let Err(violated) = self.run_checks() {
            error!("first violated rule: {}", violated);
        }

        if let Err(read_failure) = diagnostics::print_execution_controls(self.intrinsics) {
            return read_failure;
        }

        error!("host state:");
        host_state.dump();
        error!("guest state:");
        guest_state.dump();

        match diagnostics::dump_vm_instruction_error(self.intrinsics) {
            Ok(code) => HypervisorError::LaunchFailed(code),
            Err(read_failure) => read_failure,
        }
    }

    fn run_checks(&self) -> Result<(), HypervisorError> {
        checks::check_vmcs_control_state(self.intrinsics, self.memory)?;
        checks::check_vmcs_host_state(self.intrinsics)?;
        checks::check_vmcs_guest_state(self.intrinsics, &self.guest_checks)
    }
}

impl core::fmt::Debug for Vm<'_> {
    fn fmt(&self, format: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        format
            .debug_struct("Vm")
            .field("stage", &self.stage)
            .field("vmcs_region_phys", &self.vmcs_region_phys)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{
            fields,
            mock::{MockIntrinsics, MockMemory},
        },
        x86::msr,
    };

    const EXIT_HANDLER: u64 = 0xFFFF_8000_0010_0000;

    fn passing_host_state() -> VmcsState {
        VmcsState {
            cs: 0x08,
            ss: 0x10,
            tr: 0x18,
            cr0: 0x21,
            cr4: 0x2000 | (1 << 5),
            ia32_efer_msr: (1 << 8) | (1 << 10),
            ..VmcsState::default()
        }
    }

    fn launch_mocks() -> (MockIntrinsics, MockMemory) {
        let intrinsics = MockIntrinsics::new();
        intrinsics.set_msr(msr::IA32_VMX_CR0_FIXED0, 0x21);
        intrinsics.set_msr(msr::IA32_VMX_CR4_FIXED0, 0x2000);
        intrinsics.set_msr(msr::IA32_EFER, (1 << 8) | (1 << 10));

        (intrinsics, MockMemory::new())
    }

    #[test]
    fn happy_launch_keeps_the_resources() {
        let (intrinsics, memory) = launch_mocks();
        let mut vm = Vm::new(&intrinsics, &memory, EXIT_HANDLER);

        vm.launch(&passing_host_state(), &VmcsState::default()).unwrap();

        assert_eq!(vm.stage(), LaunchStage::Launched);
        assert_ne!(vm.vmcs_region_phys(), 0);
        assert!(vm.exit_handler_stack().is_some());
        assert_eq!(intrinsics.field(fields::host::RIP), EXIT_HANDLER);
    }

    #[test]
    fn host_rsp_is_aligned_and_inside_the_stack() {
        let (intrinsics, memory) = launch_mocks();
        let mut vm = Vm::new(&intrinsics, &memory, EXIT_HANDLER);

        vm.launch(&passing_host_state(), &VmcsState::default()).unwrap();

        let stack = vm.exit_handler_stack().unwrap();
        let base = stack.as_ptr() as u64;
        let rsp = intrinsics.field(fields::host::RSP);

        assert_eq!(rsp % 16, 0);
        assert_eq!(rsp, (base + STACK_SIZE as u64) & !0xF);
        assert!(rsp > base && rsp <= base + STACK_SIZE as u64);
    }

    #[test]
    fn exit_stack_top_rounds_down_to_sixteen_bytes() {
        assert_eq!(exit_stack_top(0x1000, 0x4000), 0x5000);
        assert_eq!(exit_stack_top(0x1001, 0x4000), 0x5000);
    }

    #[test]
    fn unmappable_region_aborts_before_any_vmwrite() {
        let (intrinsics, memory) = launch_mocks();
        memory.virt_to_phys_returns_zero.set(true);
        let mut vm = Vm::new(&intrinsics, &memory, EXIT_HANDLER);

        let err = vm.launch(&passing_host_state(), &VmcsState::default()).unwrap_err();

        assert_eq!(err, HypervisorError::RegionAllocationFailed);
        assert_eq!(intrinsics.vmwrite_calls.get(), 0);
        assert_eq!(vm.vmcs_region_phys(), 0);
        assert!(vm.exit_handler_stack().is_none());
        assert_eq!(vm.stage(), LaunchStage::Failed);
    }

    #[test]
    fn vmclear_failure_skips_vmptrld_and_releases() {
        let (intrinsics, memory) = launch_mocks();
        intrinsics.fail_vmclear.set(true);
        let mut vm = Vm::new(&intrinsics, &memory, EXIT_HANDLER);

        let err = vm.launch(&passing_host_state(), &VmcsState::default()).unwrap_err();

        assert_eq!(err, HypervisorError::VmxInstructionFailed(VmxInstruction::Clear));
        assert!(!intrinsics.vmptrld_called.get());
        assert_eq!(vm.vmcs_region_phys(), 0);
        assert!(vm.exit_handler_stack().is_none());
    }

    #[test]
    fn vmptrld_failure_releases() {
        let (intrinsics, memory) = launch_mocks();
        intrinsics.fail_vmptrld.set(true);
        let mut vm = Vm::new(&intrinsics, &memory, EXIT_HANDLER);

        let err = vm.launch(&passing_host_state(), &VmcsState::default()).unwrap_err();

        assert_eq!(err, HypervisorError::VmxInstructionFailed(VmxInstruction::Load));
        assert_eq!(vm.vmcs_region_phys(), 0);
    }

    #[test]
    fn vmwrite_failure_surfaces_the_field_and_releases() {
        let (intrinsics, memory) = launch_mocks();
        intrinsics.fail_vmwrite.set(true);
        let mut vm = Vm::new(&intrinsics, &memory, EXIT_HANDLER);

        let err = vm.launch(&passing_host_state(), &VmcsState::default()).unwrap_err();

        assert_eq!(err, HypervisorError::VmwriteFailed(fields::guest::ES_SELECTOR));
        assert_eq!(vm.vmcs_region_phys(), 0);
        assert!(vm.exit_handler_stack().is_none());
    }

    #[test]
    fn refused_launch_reports_the_vm_instruction_error() {
        let (intrinsics, memory) = launch_mocks();
        intrinsics.fail_vmlaunch.set(true);
        intrinsics.set_field(fields::ro::VM_INSTRUCTION_ERROR, 7);
        let mut vm = Vm::new(&intrinsics, &memory, EXIT_HANDLER);

        // The host snapshot violates IA32_VMX_CR0_FIXED0, which the checker
        // will name before the error is raised.
        let mut host_state = passing_host_state();
        host_state.cr0 = 0;

        let err = vm.launch(&host_state, &VmcsState::default()).unwrap_err();

        assert_eq!(err, HypervisorError::LaunchFailed(7));
        assert_eq!(vm.vmcs_region_phys(), 0);
        assert!(vm.exit_handler_stack().is_none());
        assert_eq!(vm.stage(), LaunchStage::Failed);
    }

    #[test]
    fn refused_launch_with_consistent_state_still_fails() {
        let (intrinsics, memory) = launch_mocks();
        intrinsics.fail_vmlaunch.set(true);
        intrinsics.set_field(fields::ro::VM_INSTRUCTION_ERROR, 4);
        let mut vm = Vm::new(&intrinsics, &memory, EXIT_HANDLER);

        let err = vm.launch(&passing_host_state(), &VmcsState::default()).unwrap_err();

        assert_eq!(err, HypervisorError::LaunchFailed(4));
    }

    #[test]
    fn registered_guest_checks_survive_the_failure_path() {
        let (intrinsics, memory) = launch_mocks();
        intrinsics.fail_vmlaunch.set(true);
        let mut vm = Vm::new(&intrinsics, &memory, EXIT_HANDLER);

        fn rip_nonzero(intrinsics: &dyn Intrinsics) -> Result<(), HypervisorError> {
            match crate::intel::ports::vmread(intrinsics, fields::guest::RIP)? {
                0 => Err(HypervisorError::ArchCheckFailed("guest_rip_nonzero")),
                _ => Ok(()),
            }
        }
        vm.register_guest_state_check(rip_nonzero);

        let err = vm.launch(&passing_host_state(), &VmcsState::default()).unwrap_err();

        assert_eq!(err, HypervisorError::LaunchFailed(0));
    }

    #[test]
    fn releases_are_idempotent() {
        let (intrinsics, memory) = launch_mocks();
        let mut vm = Vm::new(&intrinsics, &memory, EXIT_HANDLER);

        vm.create_vmcs_region().unwrap();
        assert_ne!(vm.vmcs_region_phys(), 0);

        vm.release_vmcs_region();
        vm.release_vmcs_region();
        vm.release_exit_handler_stack();

        assert_eq!(vm.vmcs_region_phys(), 0);
        assert!(vm.exit_handler_stack().is_none());
    }

    #[test]
    fn returning_resume_trampoline_is_an_error() {
        let (intrinsics, memory) = launch_mocks();
        let mut vm = Vm::new(&intrinsics, &memory, EXIT_HANDLER);

        extern "sysv64" fn stub(_: *mut SavedRegisters) {}
        vm.set_resume_trampoline(stub);

        assert_eq!(vm.resume().unwrap_err(), HypervisorError::ResumeReturned);
    }

    #[test]
    fn returning_promote_trampoline_is_an_error() {
        let (intrinsics, memory) = launch_mocks();
        let mut vm = Vm::new(&intrinsics, &memory, EXIT_HANDLER);

        extern "sysv64" fn stub(_: u64) {}
        vm.set_promote_trampoline(stub);

        assert_eq!(vm.promote(0xFFFF_8000_0000_2000).unwrap_err(), HypervisorError::PromoteReturned);
    }
}
