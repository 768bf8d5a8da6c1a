//! VM-instruction error numbers.
//!
//! The small enumeration the CPU leaves in `VM_INSTRUCTION_ERROR` when a VMX
//! instruction fails with VMfailValid. See Intel SDM Vol. 3C, Table 30-1.

/// Decoded `VM_INSTRUCTION_ERROR` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VmInstructionError {
    VmcallInVmxRoot = 1,
    VmclearInvalidAddress = 2,
    VmclearVmxonPointer = 3,
    VmlaunchNonClearVmcs = 4,
    VmresumeNonLaunchedVmcs = 5,
    VmresumeAfterVmxoff = 6,
    EntryInvalidControlFields = 7,
    EntryInvalidHostState = 8,
    VmptrldInvalidAddress = 9,
    VmptrldVmxonPointer = 10,
    VmptrldIncorrectRevision = 11,
    UnsupportedVmcsComponent = 12,
    VmwriteReadOnlyComponent = 13,
    VmxonInVmxRoot = 15,
    EntryInvalidExecutiveVmcsPointer = 16,
    EntryNonLaunchedExecutiveVmcs = 17,
    EntryExecutiveVmcsNotVmxonPointer = 18,
    VmcallNonClearVmcs = 19,
    VmcallInvalidExitControlFields = 20,
    VmcallIncorrectMsegRevision = 22,
    VmxoffUnderDualMonitor = 23,
    VmcallInvalidSmmMonitorFeatures = 24,
    EntryInvalidExecutiveVmcsExecutionControls = 25,
    EntryEventsBlockedByMovSs = 26,
    InvalidOperandToInveptInvvpid = 28,
}

impl VmInstructionError {
    /// Decodes a raw `VM_INSTRUCTION_ERROR` value.
    pub fn from_u32(value: u32) -> Option<Self> {
        use VmInstructionError::*;

        Some(match value {
            1 => VmcallInVmxRoot,
            2 => VmclearInvalidAddress,
            3 => VmclearVmxonPointer,
            4 => VmlaunchNonClearVmcs,
            5 => VmresumeNonLaunchedVmcs,
            6 => VmresumeAfterVmxoff,
            7 => EntryInvalidControlFields,
            8 => EntryInvalidHostState,
            9 => VmptrldInvalidAddress,
            10 => VmptrldVmxonPointer,
            11 => VmptrldIncorrectRevision,
            12 => UnsupportedVmcsComponent,
            13 => VmwriteReadOnlyComponent,
            15 => VmxonInVmxRoot,
            16 => EntryInvalidExecutiveVmcsPointer,
            17 => EntryNonLaunchedExecutiveVmcs,
            18 => EntryExecutiveVmcsNotVmxonPointer,
            19 => VmcallNonClearVmcs,
            20 => VmcallInvalidExitControlFields,
            22 => VmcallIncorrectMsegRevision,
            23 => VmxoffUnderDualMonitor,
            24 => VmcallInvalidSmmMonitorFeatures,
            25 => EntryInvalidExecutiveVmcsExecutionControls,
            26 => EntryEventsBlockedByMovSs,
            28 => InvalidOperandToInveptInvvpid,
            _ => return None,
        })
    }
}
