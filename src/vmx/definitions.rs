use core::fmt::{Debug, Display, Formatter, Result};

use numeric_enum_macro::numeric_enum;

/// VM instruction error numbers. (SDM Vol. 3C, Section 31.4)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VmxInstructionError(u32);

impl VmxInstructionError {
    pub const VMCALL_IN_VMX_ROOT: Self = Self(1);
    pub const VMCLEAR_INVALID_ADDRESS: Self = Self(2);
    pub const VMCLEAR_VMXON_POINTER: Self = Self(3);
    pub const VMLAUNCH_NONCLEAR_VMCS: Self = Self(4);
    pub const VMRESUME_NONLAUNCHED_VMCS: Self = Self(5);
    pub const VMRESUME_AFTER_VMXOFF: Self = Self(6);
    pub const ENTRY_INVALID_CONTROL_FIELDS: Self = Self(7);
    pub const ENTRY_INVALID_HOST_STATE: Self = Self(8);
    pub const VMPTRLD_INVALID_ADDRESS: Self = Self(9);
    pub const VMPTRLD_VMXON_POINTER: Self = Self(10);
    pub const VMPTRLD_INCORRECT_REVISION: Self = Self(11);
    pub const VMREAD_VMWRITE_UNSUPPORTED_COMPONENT: Self = Self(12);
    pub const VMWRITE_READ_ONLY_COMPONENT: Self = Self(13);
    pub const VMXON_IN_VMX_ROOT: Self = Self(15);
    pub const ENTRY_INVALID_EXECUTIVE_VMCS: Self = Self(16);
    pub const ENTRY_NONLAUNCHED_EXECUTIVE_VMCS: Self = Self(17);
    pub const ENTRY_EXECUTIVE_VMCS_NOT_VMXON: Self = Self(18);
    pub const VMCALL_NONCLEAR_VMCS: Self = Self(19);
    pub const VMCALL_INVALID_EXIT_CONTROLS: Self = Self(20);
    pub const VMCALL_INCORRECT_MSEG_REVISION: Self = Self(22);
    pub const VMXOFF_UNDER_DUAL_MONITOR: Self = Self(23);
    pub const VMCALL_INVALID_SMM_MONITOR: Self = Self(24);
    pub const ENTRY_INVALID_EXECUTION_CONTROLS: Self = Self(25);
    pub const ENTRY_EVENTS_BLOCKED_BY_MOV_SS: Self = Self(26);
    pub const INVALID_INVEPT_INVVPID: Self = Self(28);

    pub const fn new(code: u32) -> Self {
        Self(code)
    }

    /// The raw error number, as read from the VM-instruction error field.
    pub const fn code(&self) -> u32 {
        self.0
    }

    pub fn as_str(&self) -> &'static str {
        match self.0 {
            0 => "OK",
            1 => "VMCALL executed in VMX root operation",
            2 => "VMCLEAR with invalid physical address",
            3 => "VMCLEAR with VMXON pointer",
            4 => "VMLAUNCH with non-clear VMCS",
            5 => "VMRESUME with non-launched VMCS",
            6 => "VMRESUME after VMXOFF (VMXOFF and VMXON between VMLAUNCH and VMRESUME)",
            7 => "VM entry with invalid control field(s)",
            8 => "VM entry with invalid host-state field(s)",
            9 => "VMPTRLD with invalid physical address",
            10 => "VMPTRLD with VMXON pointer",
            11 => "VMPTRLD with incorrect VMCS revision identifier",
            12 => "VMREAD/VMWRITE from/to unsupported VMCS component",
            13 => "VMWRITE to read-only VMCS component",
            15 => "VMXON executed in VMX root operation",
            16 => "VM entry with invalid executive-VMCS pointer",
            17 => "VM entry with non-launched executive VMCS",
            18 => "VM entry with executive-VMCS pointer not VMXON pointer (when attempting to deactivate the dual-monitor treatment of SMIs and SMM)",
            19 => "VMCALL with non-clear VMCS (when attempting to activate the dual-monitor treatment of SMIs and SMM)",
            20 => "VMCALL with invalid VM-exit control fields",
            22 => "VMCALL with incorrect MSEG revision identifier (when attempting to activate the dual-monitor treatment of SMIs and SMM)",
            23 => "VMXOFF under dual-monitor treatment of SMIs and SMM",
            24 => "VMCALL with invalid SMM-monitor features (when attempting to activate the dual-monitor treatment of SMIs and SMM)",
            25 => "VM entry with invalid VM-execution control fields in executive VMCS (when attempting to return from SMM)",
            26 => "VM entry with events blocked by MOV SS",
            28 => "Invalid operand to INVEPT/INVVPID",
            _ => "[INVALID]",
        }
    }
}

impl From<u32> for VmxInstructionError {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Debug for VmxInstructionError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "VmxInstructionError({}, {:?})", self.0, self.as_str())
    }
}

impl Display for VmxInstructionError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{} (error {})", self.as_str(), self.0)
    }
}

numeric_enum! {
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// Basic VM-exit reasons. (SDM Vol. 3D, Appendix C)
pub enum VmxExitReason {
    EXCEPTION_NMI = 0,
    EXTERNAL_INTERRUPT = 1,
    TRIPLE_FAULT = 2,
    INIT = 3,
    SIPI = 4,
    SMI = 5,
    OTHER_SMI = 6,
    INTERRUPT_WINDOW = 7,
    NMI_WINDOW = 8,
    TASK_SWITCH = 9,
    CPUID = 10,
    GETSEC = 11,
    HLT = 12,
    INVD = 13,
    INVLPG = 14,
    RDPMC = 15,
    RDTSC = 16,
    RSM = 17,
    VMCALL = 18,
    VMCLEAR = 19,
    VMLAUNCH = 20,
    VMPTRLD = 21,
    VMPTRST = 22,
    VMREAD = 23,
    VMRESUME = 24,
    VMWRITE = 25,
    VMOFF = 26,
    VMON = 27,
    CR_ACCESS = 28,
    DR_ACCESS = 29,
    IO_INSTRUCTION = 30,
    MSR_READ = 31,
    MSR_WRITE = 32,
    INVALID_GUEST_STATE = 33,
    MSR_LOAD_FAIL = 34,
    MWAIT_INSTRUCTION = 36,
    MONITOR_TRAP_FLAG = 37,
    MONITOR_INSTRUCTION = 39,
    PAUSE_INSTRUCTION = 40,
    MCE_DURING_VMENTRY = 41,
    TPR_BELOW_THRESHOLD = 43,
    APIC_ACCESS = 44,
    VIRTUALIZED_EOI = 45,
    GDTR_IDTR = 46,
    LDTR_TR = 47,
    EPT_VIOLATION = 48,
    EPT_MISCONFIG = 49,
    INVEPT = 50,
    RDTSCP = 51,
    PREEMPTION_TIMER = 52,
    INVVPID = 53,
    WBINVD = 54,
    XSETBV = 55,
    APIC_WRITE = 56,
    RDRAND = 57,
    INVPCID = 58,
    VMFUNC = 59,
    ENCLS = 60,
    RDSEED = 61,
    PML_FULL = 62,
    XSAVES = 63,
    XRSTORS = 64,
}
}

impl VmxExitReason {
    /// Whether the VM-exit instruction-length field is valid for this exit.
    /// (SDM Vol. 3C, Section 28.2.5)
    pub fn has_instruction_length(self) -> bool {
        use VmxExitReason::*;
        matches!(
            self,
            EXCEPTION_NMI
                | TASK_SWITCH
                | CPUID
                | GETSEC
                | HLT
                | INVD
                | INVLPG
                | RDPMC
                | RDTSC
                | VMCALL
                | VMCLEAR
                | VMLAUNCH
                | VMPTRLD
                | VMPTRST
                | VMREAD
                | VMRESUME
                | VMWRITE
                | VMOFF
                | VMON
                | CR_ACCESS
                | DR_ACCESS
                | IO_INSTRUCTION
                | MSR_READ
                | MSR_WRITE
                | MWAIT_INSTRUCTION
                | MONITOR_INSTRUCTION
                | PAUSE_INSTRUCTION
                | APIC_ACCESS
                | GDTR_IDTR
                | LDTR_TR
                | INVEPT
                | RDTSCP
                | INVVPID
                | WBINVD
                | XSETBV
                | RDRAND
                | INVPCID
                | VMFUNC
                | ENCLS
                | RDSEED
                | XSAVES
                | XRSTORS
        )
    }

    /// Whether the VM-exit instruction-information field is valid for this
    /// exit. For I/O instructions it is valid only for INS and OUTS, which the
    /// caller has to check in the qualification.
    pub fn has_instruction_info(self) -> bool {
        use VmxExitReason::*;
        matches!(
            self,
            VMCLEAR
                | VMPTRLD
                | VMPTRST
                | VMREAD
                | VMWRITE
                | VMON
                | GDTR_IDTR
                | LDTR_TR
                | INVEPT
                | INVVPID
                | RDRAND
                | INVPCID
                | RDSEED
                | XSAVES
                | XRSTORS
                | IO_INSTRUCTION
        )
    }

    /// Whether the VM-exit interruption-information field is valid.
    pub fn has_exit_interruption_info(self) -> bool {
        matches!(
            self,
            VmxExitReason::EXCEPTION_NMI | VmxExitReason::EXTERNAL_INTERRUPT
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_error_names() {
        assert_eq!(
            VmxInstructionError::VMLAUNCH_NONCLEAR_VMCS.as_str(),
            "VMLAUNCH with non-clear VMCS"
        );
        assert_eq!(VmxInstructionError::from(5).code(), 5);
        assert_eq!(VmxInstructionError::new(14).as_str(), "[INVALID]");
        assert_eq!(VmxInstructionError::new(99).as_str(), "[INVALID]");
    }

    #[test]
    fn test_exit_reason_conversion() {
        assert_eq!(VmxExitReason::try_from(30u16), Ok(VmxExitReason::IO_INSTRUCTION));
        assert_eq!(VmxExitReason::try_from(48u16), Ok(VmxExitReason::EPT_VIOLATION));
        assert!(VmxExitReason::try_from(35u16).is_err());
        assert!(VmxExitReason::try_from(65u16).is_err());
    }

    #[test]
    fn test_exit_reason_field_validity() {
        assert!(VmxExitReason::CPUID.has_instruction_length());
        assert!(!VmxExitReason::EXTERNAL_INTERRUPT.has_instruction_length());
        assert!(!VmxExitReason::EPT_VIOLATION.has_instruction_length());
        assert!(VmxExitReason::VMREAD.has_instruction_info());
        assert!(!VmxExitReason::CPUID.has_instruction_info());
        assert!(VmxExitReason::EXCEPTION_NMI.has_exit_interruption_info());
        assert!(!VmxExitReason::HLT.has_exit_interruption_info());
    }
}
