//! VM-exit information and its decoding. (SDM Vol. 3C, Section 28.2)

use bit_field::BitField;
use numeric_enum_macro::numeric_enum;

use super::definitions::VmxExitReason;
use super::instructions::VmxInstructions;
use super::interrupt::InterruptionInfo;
use super::percpu::VmxPerCpuState;
use super::vmcs::{VmcsGuestNW, VmcsReadOnly32, VmcsReadOnly64, VmcsReadOnlyNW, VmcsRegion};
use crate::{Hal, Result, VmxError};

/// The exit-reason field, split into its parts. (SDM Vol. 3C, Table 25-18)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReason {
    /// Basic exit reason (bits 15:0).
    pub basic: u16,
    /// A pending MTF VM exit was saved by an SMM VM exit (bit 28).
    pub pending_mtf: bool,
    /// The exit was from VMX root operation (bit 29).
    pub from_vmx_root: bool,
    /// VM entry failed (bit 31).
    pub entry_failure: bool,
}

impl ExitReason {
    pub fn from_raw(raw: u32) -> Self {
        Self {
            basic: raw.get_bits(0..16) as u16,
            pending_mtf: raw.get_bit(28),
            from_vmx_root: raw.get_bit(29),
            entry_failure: raw.get_bit(31),
        }
    }

    pub fn raw(&self) -> u32 {
        let mut raw = self.basic as u32;
        raw.set_bit(28, self.pending_mtf);
        raw.set_bit(29, self.from_vmx_root);
        raw.set_bit(31, self.entry_failure);
        raw
    }

    /// The basic reason, `None` if the processor reported an unknown one.
    pub fn reason(&self) -> Option<VmxExitReason> {
        VmxExitReason::try_from(self.basic).ok()
    }
}

/// VM-Exit Informations. (SDM Vol. 3C, Section 25.9)
///
/// Fields that the exit reason does not define are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxExitInfo {
    pub exit_reason: ExitReason,
    /// Exit qualification; its layout depends on the basic exit reason.
    pub exit_qualification: u64,
    /// Guest `RIP` at the time of the exit.
    pub guest_rip: usize,
    /// VM-exit instruction length.
    pub exit_instruction_length: Option<u32>,
    /// VM-exit instruction information.
    pub instruction_info: Option<InstructionInfo>,
    /// VM-exit interruption information and its error code.
    pub exit_interruption: Option<(InterruptionInfo, Option<u32>)>,
    /// IDT-vectoring information and its error code, for exits during event delivery.
    pub idt_vectoring: Option<(InterruptionInfo, Option<u32>)>,
    pub guest_physical_address: Option<u64>,
    pub guest_linear_address: Option<usize>,
}

impl VmxExitInfo {
    /// An exit carrying only a reason and a qualification.
    pub fn new(raw_reason: u32, exit_qualification: u64, guest_rip: usize) -> Self {
        Self {
            exit_reason: ExitReason::from_raw(raw_reason),
            exit_qualification,
            guest_rip,
            exit_instruction_length: None,
            instruction_info: None,
            exit_interruption: None,
            idt_vectoring: None,
            guest_physical_address: None,
            guest_linear_address: None,
        }
    }

    /// Reads the exit information from `vmcs`, which must be current on
    /// `cpu`, right after a VM exit. Only the fields the exit reason defines
    /// are read.
    pub fn capture<H: Hal, I: VmxInstructions>(
        vmcs: &VmcsRegion<H>,
        cpu: &VmxPerCpuState<H, I>,
    ) -> Result<Self> {
        let raw_reason = vmcs.read(cpu, VmcsReadOnly32::EXIT_REASON)?;
        let mut info = Self::new(
            raw_reason,
            vmcs.read(cpu, VmcsReadOnlyNW::EXIT_QUALIFICATION)? as u64,
            vmcs.read(cpu, VmcsGuestNW::RIP)?,
        );
        if info.exit_reason.entry_failure {
            return Ok(info);
        }

        let read_event = |info_field: VmcsReadOnly32,
                          err_field: VmcsReadOnly32|
         -> Result<Option<(InterruptionInfo, Option<u32>)>> {
            let event = InterruptionInfo::from_raw(vmcs.read(cpu, info_field)?);
            if !event.is_valid() {
                return Ok(None);
            }
            let err_code = if event.raw().get_bit(11) {
                Some(vmcs.read(cpu, err_field)?)
            } else {
                None
            };
            Ok(Some((event, err_code)))
        };
        info.idt_vectoring = read_event(
            VmcsReadOnly32::IDT_VECTORING_INFO,
            VmcsReadOnly32::IDT_VECTORING_ERR_CODE,
        )?;

        let Some(reason) = info.exit_reason.reason() else {
            return Ok(info);
        };
        if reason.has_instruction_length() {
            info.exit_instruction_length =
                Some(vmcs.read(cpu, VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN)?);
        }
        let is_string_io =
            reason == VmxExitReason::IO_INSTRUCTION && info.exit_qualification.get_bit(4);
        if reason.has_instruction_info()
            && (reason != VmxExitReason::IO_INSTRUCTION || is_string_io)
        {
            info.instruction_info = Some(InstructionInfo(
                vmcs.read(cpu, VmcsReadOnly32::VMEXIT_INSTRUCTION_INFO)?,
            ));
        }
        if reason.has_exit_interruption_info() {
            info.exit_interruption = read_event(
                VmcsReadOnly32::VMEXIT_INTERRUPTION_INFO,
                VmcsReadOnly32::VMEXIT_INTERRUPTION_ERR_CODE,
            )?;
        }
        if matches!(
            reason,
            VmxExitReason::EPT_VIOLATION | VmxExitReason::EPT_MISCONFIG
        ) {
            info.guest_physical_address =
                Some(vmcs.read(cpu, VmcsReadOnly64::GUEST_PHYSICAL_ADDR)?);
        }
        if reason == VmxExitReason::EPT_VIOLATION
            && info.exit_qualification.get_bit(EptViolationInfo::GLA_VALID_BIT)
        {
            info.guest_linear_address = Some(vmcs.read(cpu, VmcsReadOnlyNW::GUEST_LINEAR_ADDR)?);
        }
        Ok(info)
    }
}

/// VM-exit instruction information, in the layout used by VMX and
/// descriptor-table instructions. (SDM Vol. 3C, Section 28.2.5)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct InstructionInfo(u32);

impl InstructionInfo {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Index scaling factor (`1 << scaling`).
    pub fn scaling(&self) -> u8 {
        self.0.get_bits(0..2) as u8
    }

    /// The first register operand (bits 6:3).
    pub fn reg1(&self) -> u8 {
        self.0.get_bits(3..7) as u8
    }

    /// Address size in bytes: 2, 4 or 8.
    pub fn address_size(&self) -> Option<u8> {
        match self.0.get_bits(7..10) {
            0 => Some(2),
            1 => Some(4),
            2 => Some(8),
            _ => None,
        }
    }

    /// The operand is a register rather than memory.
    pub fn is_register_operand(&self) -> bool {
        self.0.get_bit(10)
    }

    /// Segment register of a memory operand (0 = ES ... 5 = GS).
    pub fn segment(&self) -> u8 {
        self.0.get_bits(15..18) as u8
    }

    pub fn index_reg(&self) -> Option<u8> {
        (!self.0.get_bit(22)).then(|| self.0.get_bits(18..22) as u8)
    }

    pub fn base_reg(&self) -> Option<u8> {
        (!self.0.get_bit(27)).then(|| self.0.get_bits(23..27) as u8)
    }

    /// The second register operand (bits 31:28).
    pub fn reg2(&self) -> u8 {
        self.0.get_bits(28..32) as u8
    }
}

impl core::fmt::Debug for InstructionInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InstructionInfo")
            .field("raw", &format_args!("{:#x}", self.0))
            .field("scaling", &self.scaling())
            .field("reg1", &self.reg1())
            .field("address_size", &self.address_size())
            .field("register_operand", &self.is_register_operand())
            .field("segment", &self.segment())
            .field("index", &self.index_reg())
            .field("base", &self.base_reg())
            .field("reg2", &self.reg2())
            .finish()
    }
}

/// Exit qualification for I/O instructions. (SDM Vol. 3C, Table 28-5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxIoExitInfo {
    /// Size of access in bytes: 1, 2 or 4.
    pub access_size: u8,
    /// Direction of the attempted access (`true` = IN).
    pub is_in: bool,
    /// String instruction (INS or OUTS).
    pub is_string: bool,
    /// REP prefixed.
    pub is_repeat: bool,
    /// The port number was an immediate operand rather than DX.
    pub is_immediate: bool,
    /// Port number.
    pub port: u16,
}

impl VmxIoExitInfo {
    pub fn decode(qualification: u64) -> Option<Self> {
        let access_size = match qualification.get_bits(0..3) {
            0 => 1,
            1 => 2,
            3 => 4,
            _ => return None,
        };
        Some(Self {
            access_size,
            is_in: qualification.get_bit(3),
            is_string: qualification.get_bit(4),
            is_repeat: qualification.get_bit(5),
            is_immediate: qualification.get_bit(6),
            port: qualification.get_bits(16..32) as u16,
        })
    }
}

numeric_enum! {
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Access type of a control-register access.
pub enum CrAccessType {
    MovToCr = 0,
    MovFromCr = 1,
    Clts = 2,
    Lmsw = 3,
}
}

/// Exit qualification for control-register accesses. (SDM Vol. 3C, Table 28-3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxCrAccessInfo {
    /// Number of the control register (0, 3, 4 or 8).
    pub cr_number: u8,
    pub access_type: CrAccessType,
    /// The LMSW operand was in memory.
    pub lmsw_memory_operand: bool,
    /// General-purpose register operand of MOV CR.
    pub gpr: u8,
    /// Source data of LMSW.
    pub lmsw_source_data: u16,
}

impl VmxCrAccessInfo {
    pub fn decode(qualification: u64) -> Option<Self> {
        let cr_number = qualification.get_bits(0..4) as u8;
        if !matches!(cr_number, 0 | 3 | 4 | 8) {
            return None;
        }
        Some(Self {
            cr_number,
            access_type: CrAccessType::try_from(qualification.get_bits(4..6) as u8).ok()?,
            lmsw_memory_operand: qualification.get_bit(6),
            gpr: qualification.get_bits(8..12) as u8,
            lmsw_source_data: qualification.get_bits(16..32) as u16,
        })
    }
}

/// Exit qualification for MOV DR. (SDM Vol. 3C, Table 28-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxDrAccessInfo {
    pub dr_number: u8,
    /// `true` for MOV from DR, `false` for MOV to DR.
    pub is_read: bool,
    pub gpr: u8,
}

impl VmxDrAccessInfo {
    pub fn decode(qualification: u64) -> Self {
        Self {
            dr_number: qualification.get_bits(0..3) as u8,
            is_read: qualification.get_bit(4),
            gpr: qualification.get_bits(8..12) as u8,
        }
    }
}

numeric_enum! {
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The source of a task switch.
pub enum TaskSwitchSource {
    Call = 0,
    Iret = 1,
    Jmp = 2,
    IdtTaskGate = 3,
}
}

/// Exit qualification for task switches. (SDM Vol. 3C, Table 28-2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxTaskSwitchInfo {
    /// Selector of the new TSS.
    pub selector: u16,
    pub source: TaskSwitchSource,
}

impl VmxTaskSwitchInfo {
    pub fn decode(qualification: u64) -> Self {
        Self {
            selector: qualification.get_bits(0..16) as u16,
            // Two bits, every value is defined.
            source: TaskSwitchSource::try_from(qualification.get_bits(30..32) as u8)
                .unwrap_or(TaskSwitchSource::Call),
        }
    }
}

/// Exit qualification for EPT violations. (SDM Vol. 3C, Table 28-7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EptViolationInfo {
    pub read: bool,
    pub write: bool,
    pub instruction_fetch: bool,
    /// The guest-physical address was readable.
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// The guest linear-address field is valid.
    pub gla_valid: bool,
    /// The access was to the translated linear address rather than a
    /// paging-structure entry. Defined only if `gla_valid`.
    pub is_translation: bool,
    /// NMI unblocking due to IRET.
    pub nmi_unblocking: bool,
    pub guest_physical_address: u64,
    pub guest_linear_address: Option<usize>,
}

impl EptViolationInfo {
    const GLA_VALID_BIT: usize = 7;

    pub fn decode(
        qualification: u64,
        guest_physical_address: u64,
        guest_linear_address: Option<usize>,
    ) -> Self {
        Self {
            read: qualification.get_bit(0),
            write: qualification.get_bit(1),
            instruction_fetch: qualification.get_bit(2),
            readable: qualification.get_bit(3),
            writable: qualification.get_bit(4),
            executable: qualification.get_bit(5),
            gla_valid: qualification.get_bit(Self::GLA_VALID_BIT),
            is_translation: qualification.get_bit(8),
            nmi_unblocking: qualification.get_bit(12),
            guest_physical_address,
            guest_linear_address,
        }
    }
}

numeric_enum! {
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// How the guest accessed the APIC-access page.
pub enum ApicAccessType {
    LinearRead = 0,
    LinearWrite = 1,
    LinearFetch = 2,
    LinearEventDelivery = 3,
    PhysicalEventDelivery = 10,
    PhysicalFetch = 15,
}
}

/// Exit qualification for APIC-access exits. (SDM Vol. 3C, Table 28-6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxApicAccessInfo {
    /// Page offset of the access, for linear accesses.
    pub offset: u16,
    pub access_type: ApicAccessType,
}

impl VmxApicAccessInfo {
    pub fn decode(qualification: u64) -> Option<Self> {
        Some(Self {
            offset: qualification.get_bits(0..12) as u16,
            access_type: ApicAccessType::try_from(qualification.get_bits(12..16) as u8).ok()?,
        })
    }
}

/// Why a VM entry failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFailureReason {
    InvalidGuestState,
    MsrLoading,
    MachineCheck,
    Other(u16),
}

/// A VM exit, interpreted according to its basic exit reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedExit {
    /// VM entry failed; the guest never ran.
    EntryFailure {
        reason: EntryFailureReason,
        qualification: u64,
    },
    Io(VmxIoExitInfo),
    CrAccess(VmxCrAccessInfo),
    DrAccess(VmxDrAccessInfo),
    TaskSwitch(VmxTaskSwitchInfo),
    EptViolation(EptViolationInfo),
    EptMisconfig { guest_physical_address: u64 },
    ApicAccess(VmxApicAccessInfo),
    VirtualizedEoi { vector: u8 },
    /// Any other exit, or a qualification this decoder does not understand.
    Other {
        reason: ExitReason,
        qualification: u64,
    },
}

impl DecodedExit {
    /// Interprets `info` according to its basic exit reason.
    ///
    /// A qualification with a reserved encoding decodes to [`DecodedExit::Other`].
    /// An EPT exit whose guest-physical address was not captured is an error.
    pub fn decode(info: &VmxExitInfo) -> Result<Self> {
        let qualification = info.exit_qualification;
        let other = Self::Other {
            reason: info.exit_reason,
            qualification,
        };

        if info.exit_reason.entry_failure {
            let reason = match info.exit_reason.reason() {
                Some(VmxExitReason::INVALID_GUEST_STATE) => EntryFailureReason::InvalidGuestState,
                Some(VmxExitReason::MSR_LOAD_FAIL) => EntryFailureReason::MsrLoading,
                Some(VmxExitReason::MCE_DURING_VMENTRY) => EntryFailureReason::MachineCheck,
                _ => EntryFailureReason::Other(info.exit_reason.basic),
            };
            return Ok(Self::EntryFailure {
                reason,
                qualification,
            });
        }

        let Some(reason) = info.exit_reason.reason() else {
            return Ok(other);
        };
        let gpa = || {
            info.guest_physical_address.ok_or_else(|| {
                warn!("[HV] {reason:?} exit without a guest-physical address");
                VmxError::MalformedField {
                    name: "guest-physical address",
                    raw: info.exit_reason.raw() as u64,
                }
            })
        };
        let decoded = match reason {
            VmxExitReason::IO_INSTRUCTION => VmxIoExitInfo::decode(qualification).map(Self::Io),
            VmxExitReason::CR_ACCESS => VmxCrAccessInfo::decode(qualification).map(Self::CrAccess),
            VmxExitReason::DR_ACCESS => Some(Self::DrAccess(VmxDrAccessInfo::decode(qualification))),
            VmxExitReason::TASK_SWITCH => {
                Some(Self::TaskSwitch(VmxTaskSwitchInfo::decode(qualification)))
            }
            VmxExitReason::EPT_VIOLATION => Some(Self::EptViolation(EptViolationInfo::decode(
                qualification,
                gpa()?,
                info.guest_linear_address,
            ))),
            VmxExitReason::EPT_MISCONFIG => Some(Self::EptMisconfig {
                guest_physical_address: gpa()?,
            }),
            VmxExitReason::APIC_ACCESS => {
                VmxApicAccessInfo::decode(qualification).map(Self::ApicAccess)
            }
            VmxExitReason::VIRTUALIZED_EOI => Some(Self::VirtualizedEoi {
                vector: qualification.get_bits(0..8) as u8,
            }),
            _ => return Ok(other),
        };
        Ok(decoded.unwrap_or_else(|| {
            warn!("[HV] malformed qualification {qualification:#x} for {reason:?}");
            other
        }))
    }
}
