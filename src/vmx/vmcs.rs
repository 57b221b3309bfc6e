//! VMCS field encodings and the lifecycle of a VMCS region.

use core::fmt::Debug;
use core::mem::ManuallyDrop;

use bit_field::BitField;
use numeric_enum_macro::numeric_enum;

use super::capability::{ActivityStates, VmxCapability};
use super::definitions::VmxInstructionError;
use super::exit::ExitReason;
use super::instructions::{VmFail, VmxInstructions};
use super::percpu::VmxPerCpuState;
use super::structs::VmxRegion;
use super::vcpu::VcpuExecutionState;
use crate::{Hal, HostPhysAddr, Result, VmxError};

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// 16-Bit Control Fields. (SDM Vol. 3D, Appendix B.1.1)
pub enum VmcsControl16 {
    /// Virtual-processor identifier (VPID).
    VPID = 0x0,
    /// Posted-interrupt notification vector.
    POSTED_INTERRUPT_NOTIFICATION_VECTOR = 0x2,
    /// EPTP index.
    EPTP_INDEX = 0x4,
}
}

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// 64-Bit Control Fields. (SDM Vol. 3D, Appendix B.2.1)
pub enum VmcsControl64 {
    IO_BITMAP_A_ADDR = 0x2000,
    IO_BITMAP_B_ADDR = 0x2002,
    MSR_BITMAPS_ADDR = 0x2004,
    VMEXIT_MSR_STORE_ADDR = 0x2006,
    VMEXIT_MSR_LOAD_ADDR = 0x2008,
    VMENTRY_MSR_LOAD_ADDR = 0x200a,
    EXECUTIVE_VMCS_PTR = 0x200c,
    PML_ADDR = 0x200e,
    TSC_OFFSET = 0x2010,
    VIRT_APIC_ADDR = 0x2012,
    APIC_ACCESS_ADDR = 0x2014,
    POSTED_INTERRUPT_DESC_ADDR = 0x2016,
    VM_FUNCTION_CONTROLS = 0x2018,
    /// EPT pointer.
    EPTP = 0x201a,
    EOI_EXIT0 = 0x201c,
    EOI_EXIT1 = 0x201e,
    EOI_EXIT2 = 0x2020,
    EOI_EXIT3 = 0x2022,
    EPTP_LIST_ADDR = 0x2024,
    VMREAD_BITMAP_ADDR = 0x2026,
    VMWRITE_BITMAP_ADDR = 0x2028,
    VIRT_EXCEPTION_INFO_ADDR = 0x202a,
    XSS_EXITING_BITMAP = 0x202c,
    ENCLS_EXITING_BITMAP = 0x202e,
    SUBPAGE_PERM_TABLE_PTR = 0x2030,
    TSC_MULTIPLIER = 0x2032,
}
}

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// 32-Bit Control Fields. (SDM Vol. 3D, Appendix B.3.1)
pub enum VmcsControl32 {
    PINBASED_EXEC_CONTROLS = 0x4000,
    PRIMARY_PROCBASED_EXEC_CONTROLS = 0x4002,
    EXCEPTION_BITMAP = 0x4004,
    PAGE_FAULT_ERR_CODE_MASK = 0x4006,
    PAGE_FAULT_ERR_CODE_MATCH = 0x4008,
    CR3_TARGET_COUNT = 0x400a,
    VMEXIT_CONTROLS = 0x400c,
    VMEXIT_MSR_STORE_COUNT = 0x400e,
    VMEXIT_MSR_LOAD_COUNT = 0x4010,
    VMENTRY_CONTROLS = 0x4012,
    VMENTRY_MSR_LOAD_COUNT = 0x4014,
    VMENTRY_INTERRUPTION_INFO_FIELD = 0x4016,
    VMENTRY_EXCEPTION_ERR_CODE = 0x4018,
    VMENTRY_INSTRUCTION_LEN = 0x401a,
    TPR_THRESHOLD = 0x401c,
    SECONDARY_PROCBASED_EXEC_CONTROLS = 0x401e,
    PLE_GAP = 0x4020,
    PLE_WINDOW = 0x4022,
}
}

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// Natural-Width Control Fields. (SDM Vol. 3D, Appendix B.4.1)
pub enum VmcsControlNW {
    CR0_GUEST_HOST_MASK = 0x6000,
    CR4_GUEST_HOST_MASK = 0x6002,
    CR0_READ_SHADOW = 0x6004,
    CR4_READ_SHADOW = 0x6006,
    CR3_TARGET_VALUE0 = 0x6008,
    CR3_TARGET_VALUE1 = 0x600a,
    CR3_TARGET_VALUE2 = 0x600c,
    CR3_TARGET_VALUE3 = 0x600e,
}
}

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// 16-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.1.2)
pub enum VmcsGuest16 {
    ES_SELECTOR = 0x800,
    CS_SELECTOR = 0x802,
    SS_SELECTOR = 0x804,
    DS_SELECTOR = 0x806,
    FS_SELECTOR = 0x808,
    GS_SELECTOR = 0x80a,
    LDTR_SELECTOR = 0x80c,
    TR_SELECTOR = 0x80e,
    INTERRUPT_STATUS = 0x810,
    PML_INDEX = 0x812,
}
}

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// 64-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.2.3)
pub enum VmcsGuest64 {
    LINK_PTR = 0x2800,
    IA32_DEBUGCTL = 0x2802,
    IA32_PAT = 0x2804,
    IA32_EFER = 0x2806,
    IA32_PERF_GLOBAL_CTRL = 0x2808,
    PDPTE0 = 0x280a,
    PDPTE1 = 0x280c,
    PDPTE2 = 0x280e,
    PDPTE3 = 0x2810,
    IA32_BNDCFGS = 0x2812,
    IA32_RTIT_CTL = 0x2814,
}
}

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// 32-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.3.3)
pub enum VmcsGuest32 {
    ES_LIMIT = 0x4800,
    CS_LIMIT = 0x4802,
    SS_LIMIT = 0x4804,
    DS_LIMIT = 0x4806,
    FS_LIMIT = 0x4808,
    GS_LIMIT = 0x480a,
    LDTR_LIMIT = 0x480c,
    TR_LIMIT = 0x480e,
    GDTR_LIMIT = 0x4810,
    IDTR_LIMIT = 0x4812,
    ES_ACCESS_RIGHTS = 0x4814,
    CS_ACCESS_RIGHTS = 0x4816,
    SS_ACCESS_RIGHTS = 0x4818,
    DS_ACCESS_RIGHTS = 0x481a,
    FS_ACCESS_RIGHTS = 0x481c,
    GS_ACCESS_RIGHTS = 0x481e,
    LDTR_ACCESS_RIGHTS = 0x4820,
    TR_ACCESS_RIGHTS = 0x4822,
    INTERRUPTIBILITY_STATE = 0x4824,
    ACTIVITY_STATE = 0x4826,
    SMBASE = 0x4828,
    IA32_SYSENTER_CS = 0x482a,
    VMX_PREEMPTION_TIMER_VALUE = 0x482e,
}
}

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// Natural-Width Guest-State Fields. (SDM Vol. 3D, Appendix B.4.3)
pub enum VmcsGuestNW {
    CR0 = 0x6800,
    CR3 = 0x6802,
    CR4 = 0x6804,
    ES_BASE = 0x6806,
    CS_BASE = 0x6808,
    SS_BASE = 0x680a,
    DS_BASE = 0x680c,
    FS_BASE = 0x680e,
    GS_BASE = 0x6810,
    LDTR_BASE = 0x6812,
    TR_BASE = 0x6814,
    GDTR_BASE = 0x6816,
    IDTR_BASE = 0x6818,
    DR7 = 0x681a,
    RSP = 0x681c,
    RIP = 0x681e,
    RFLAGS = 0x6820,
    PENDING_DBG_EXCEPTIONS = 0x6822,
    IA32_SYSENTER_ESP = 0x6824,
    IA32_SYSENTER_EIP = 0x6826,
}
}

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// 16-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.1.3)
pub enum VmcsHost16 {
    ES_SELECTOR = 0xc00,
    CS_SELECTOR = 0xc02,
    SS_SELECTOR = 0xc04,
    DS_SELECTOR = 0xc06,
    FS_SELECTOR = 0xc08,
    GS_SELECTOR = 0xc0a,
    TR_SELECTOR = 0xc0c,
}
}

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// 64-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.2.4)
pub enum VmcsHost64 {
    IA32_PAT = 0x2c00,
    IA32_EFER = 0x2c02,
    IA32_PERF_GLOBAL_CTRL = 0x2c04,
}
}

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// 32-Bit Host-State Field. (SDM Vol. 3D, Appendix B.3.4)
pub enum VmcsHost32 {
    IA32_SYSENTER_CS = 0x4c00,
}
}

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// Natural-Width Host-State Fields. (SDM Vol. 3D, Appendix B.4.4)
pub enum VmcsHostNW {
    CR0 = 0x6c00,
    CR3 = 0x6c02,
    CR4 = 0x6c04,
    FS_BASE = 0x6c06,
    GS_BASE = 0x6c08,
    TR_BASE = 0x6c0a,
    GDTR_BASE = 0x6c0c,
    IDTR_BASE = 0x6c0e,
    IA32_SYSENTER_ESP = 0x6c10,
    IA32_SYSENTER_EIP = 0x6c12,
    RSP = 0x6c14,
    RIP = 0x6c16,
}
}

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// 64-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.2.2)
pub enum VmcsReadOnly64 {
    GUEST_PHYSICAL_ADDR = 0x2400,
}
}

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// 32-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.3.2)
pub enum VmcsReadOnly32 {
    VM_INSTRUCTION_ERROR = 0x4400,
    EXIT_REASON = 0x4402,
    VMEXIT_INTERRUPTION_INFO = 0x4404,
    VMEXIT_INTERRUPTION_ERR_CODE = 0x4406,
    IDT_VECTORING_INFO = 0x4408,
    IDT_VECTORING_ERR_CODE = 0x440a,
    VMEXIT_INSTRUCTION_LEN = 0x440c,
    VMEXIT_INSTRUCTION_INFO = 0x440e,
}
}

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// Natural-Width Read-Only Data Fields. (SDM Vol. 3D, Appendix B.4.2)
pub enum VmcsReadOnlyNW {
    EXIT_QUALIFICATION = 0x6400,
    IO_RCX = 0x6402,
    IO_RSI = 0x6404,
    IO_RDI = 0x6406,
    IO_RIP = 0x6408,
    GUEST_LINEAR_ADDR = 0x640a,
}
}

/// Width of a VMCS field, bits 14:13 of its encoding. (SDM Vol. 3C, Section 25.11.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmcsFieldWidth {
    Bits16,
    Bits64,
    Bits32,
    Natural,
}

impl VmcsFieldWidth {
    pub fn from_encoding(encoding: u32) -> Self {
        match encoding.get_bits(13..15) {
            0 => Self::Bits16,
            1 => Self::Bits64,
            2 => Self::Bits32,
            _ => Self::Natural,
        }
    }

    /// Size in bytes; natural-width fields are 64 bits wide on x86-64.
    pub fn bytes(self) -> usize {
        match self {
            Self::Bits16 => 2,
            Self::Bits32 => 4,
            Self::Bits64 | Self::Natural => 8,
        }
    }

    /// Keeps the bits a field of this width stores.
    pub fn truncate(self, value: u64) -> u64 {
        match self {
            Self::Bits16 => value & 0xffff,
            Self::Bits32 => value & 0xffff_ffff,
            Self::Bits64 | Self::Natural => value,
        }
    }
}

/// A VMCS field with a fixed width.
pub trait VmcsField: Copy + Debug {
    type Value: Copy + Debug;

    /// The field encoding used as VMREAD/VMWRITE operand.
    fn encoding(self) -> u32;
    fn from_raw(raw: u64) -> Self::Value;
    fn into_raw(value: Self::Value) -> u64;

    fn width(self) -> VmcsFieldWidth {
        VmcsFieldWidth::from_encoding(self.encoding())
    }
}

/// A VMCS field software may write. Read-only data fields do not implement it.
pub trait WritableVmcsField: VmcsField {}

macro_rules! vmcs_field {
    ($field: ident, $ty: ty) => {
        impl VmcsField for $field {
            type Value = $ty;

            fn encoding(self) -> u32 {
                self as u32
            }

            fn from_raw(raw: u64) -> $ty {
                raw as $ty
            }

            fn into_raw(value: $ty) -> u64 {
                value as u64
            }
        }
    };
    ($field: ident, $ty: ty, writable) => {
        vmcs_field!($field, $ty);
        impl WritableVmcsField for $field {}
    };
}

vmcs_field!(VmcsControl16, u16, writable);
vmcs_field!(VmcsControl64, u64, writable);
vmcs_field!(VmcsControl32, u32, writable);
vmcs_field!(VmcsControlNW, usize, writable);
vmcs_field!(VmcsGuest16, u16, writable);
vmcs_field!(VmcsGuest64, u64, writable);
vmcs_field!(VmcsGuest32, u32, writable);
vmcs_field!(VmcsGuestNW, usize, writable);
vmcs_field!(VmcsHost16, u16, writable);
vmcs_field!(VmcsHost64, u64, writable);
vmcs_field!(VmcsHost32, u32, writable);
vmcs_field!(VmcsHostNW, usize, writable);
vmcs_field!(VmcsReadOnly64, u64);
vmcs_field!(VmcsReadOnly32, u32);
vmcs_field!(VmcsReadOnlyNW, usize);

numeric_enum! {
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Guest activity state. (SDM Vol. 3C, Section 25.4.2)
pub enum ActivityState {
    Active = 0,
    Hlt = 1,
    Shutdown = 2,
    WaitForSipi = 3,
}
}

impl ActivityState {
    /// The IA32_VMX_MISC bit that allows entering with this state, if any.
    pub fn required_capability(self) -> Option<ActivityStates> {
        match self {
            Self::Active => None,
            Self::Hlt => Some(ActivityStates::HLT),
            Self::Shutdown => Some(ActivityStates::SHUTDOWN),
            Self::WaitForSipi => Some(ActivityStates::WAIT_FOR_SIPI),
        }
    }
}

/// Access-rights bit 16: the segment is unusable.
const SEGMENT_UNUSABLE: u32 = 1 << 16;

/// Guest segment registers held in the guest-state area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestSegment {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Ldtr,
    Tr,
}

struct SegmentFields {
    selector: VmcsGuest16,
    base: VmcsGuestNW,
    limit: VmcsGuest32,
    access_rights: VmcsGuest32,
}

impl GuestSegment {
    pub const ALL: [Self; 8] = [
        Self::Es,
        Self::Cs,
        Self::Ss,
        Self::Ds,
        Self::Fs,
        Self::Gs,
        Self::Ldtr,
        Self::Tr,
    ];

    fn fields(self) -> SegmentFields {
        macro_rules! segment_fields {
            ($seg: ident) => {
                paste::paste! {
                    SegmentFields {
                        selector: VmcsGuest16::[<$seg _SELECTOR>],
                        base: VmcsGuestNW::[<$seg _BASE>],
                        limit: VmcsGuest32::[<$seg _LIMIT>],
                        access_rights: VmcsGuest32::[<$seg _ACCESS_RIGHTS>],
                    }
                }
            };
        }
        match self {
            Self::Es => segment_fields!(ES),
            Self::Cs => segment_fields!(CS),
            Self::Ss => segment_fields!(SS),
            Self::Ds => segment_fields!(DS),
            Self::Fs => segment_fields!(FS),
            Self::Gs => segment_fields!(GS),
            Self::Ldtr => segment_fields!(LDTR),
            Self::Tr => segment_fields!(TR),
        }
    }
}

/// A guest segment register.
///
/// `access_rights` uses the VMCS format; 0 stands for an unusable segment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: usize,
    pub limit: u32,
    pub access_rights: u32,
}

impl Segment {
    pub const fn new(selector: u16, base: usize, limit: u32, access_rights: u32) -> Self {
        Self {
            selector,
            base,
            limit,
            access_rights,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.access_rights != 0
    }
}

/// Guest GDTR or IDTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestDescriptorTable {
    Gdtr,
    Idtr,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: usize,
    pub limit: u32,
}

impl GuestDescriptorTable {
    fn fields(self) -> (VmcsGuestNW, VmcsGuest32) {
        match self {
            Self::Gdtr => (VmcsGuestNW::GDTR_BASE, VmcsGuest32::GDTR_LIMIT),
            Self::Idtr => (VmcsGuestNW::IDTR_BASE, VmcsGuest32::IDTR_LIMIT),
        }
    }
}

/// Whether a current VMCS has completed a VM entry since it was last cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Unlaunched,
    Launched,
}

/// Lifecycle state of a VMCS region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmcsState {
    /// Allocated and stamped, never cleared.
    Uninitialized,
    /// Cleared and not current on any hardware thread.
    Cleared,
    /// Current on the hardware thread `cpu_id`.
    Current { cpu_id: usize, launch: LaunchState },
}

/// A VMCS region together with the lifecycle state software tracks for it.
///
/// Every operation takes the hardware thread it runs on, so the region can
/// only be used where it is current.
///
/// The memory is not returned to the [`Hal`] while the VMCS is current on
/// some hardware thread: the processor may still write it back.
#[derive(Debug)]
pub struct VmcsRegion<H: Hal> {
    region: ManuallyDrop<VmxRegion<H>>,
    state: VmcsState,
}

impl<H: Hal> VmcsRegion<H> {
    /// Allocates a zeroed VMCS stamped with the processor's revision identifier.
    pub fn allocate(cap: &VmxCapability) -> Result<Self> {
        let region = VmxRegion::new(cap.revision_id, false)?;
        debug!("[HV] allocated VMCS({:#x})", region.phys_addr());
        Ok(Self {
            region: ManuallyDrop::new(region),
            state: VmcsState::Uninitialized,
        })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.region.phys_addr()
    }

    pub fn state(&self) -> VmcsState {
        self.state
    }

    pub fn revision_id(&self) -> u32 {
        self.region.revision_id()
    }

    /// Whether this VMCS is current on `cpu`.
    pub fn is_current_on<I: VmxInstructions>(&self, cpu: &VmxPerCpuState<H, I>) -> bool {
        matches!(self.state, VmcsState::Current { cpu_id, .. } if cpu_id == cpu.cpu_id())
            && cpu.current_vmcs() == Some(self.phys_addr())
    }

    fn ensure_current<I: VmxInstructions>(&self, cpu: &VmxPerCpuState<H, I>) -> Result {
        if self.is_current_on(cpu) {
            Ok(())
        } else {
            Err(VmxError::VmcsNotCurrent)
        }
    }

    fn ensure_not_elsewhere<I: VmxInstructions>(&self, cpu: &VmxPerCpuState<H, I>) -> Result {
        match self.state {
            VmcsState::Current { cpu_id, .. } if cpu_id != cpu.cpu_id() => {
                warn!(
                    "[HV] VMCS({:#x}) is current on CPU {cpu_id}, not on CPU {}",
                    self.phys_addr(),
                    cpu.cpu_id()
                );
                Err(VmxError::VmcsCurrentElsewhere { cpu_id })
            }
            _ => Ok(()),
        }
    }

    /// Executes VMCLEAR, flushing the VMCS to memory and resetting its launch
    /// state. If the VMCS was current on `cpu`, it is no longer.
    pub fn clear<I: VmxInstructions>(&mut self, cpu: &mut VmxPerCpuState<H, I>) -> Result {
        self.ensure_not_elsewhere(cpu)?;
        if !cpu.is_enabled() {
            return Err(VmxError::VmxNotEnabled);
        }
        let paddr = self.phys_addr();
        cpu.instructions_mut().vmclear(paddr)?;
        cpu.release_current(paddr);
        trace!("[HV] VMCS({paddr:#x}) {:?} -> Cleared", self.state);
        self.state = VmcsState::Cleared;
        Ok(())
    }

    /// Executes VMPTRLD, making this VMCS current on `cpu`.
    ///
    /// Loading the VMCS that is already current on `cpu` does nothing.
    pub fn load<I: VmxInstructions>(&mut self, cpu: &mut VmxPerCpuState<H, I>) -> Result {
        self.ensure_not_elsewhere(cpu)?;
        match self.state {
            VmcsState::Current { .. } if self.is_current_on(cpu) => return Ok(()),
            VmcsState::Cleared => {}
            _ => {
                warn!(
                    "[HV] VMCS({:#x}) must be cleared before loading, state {:?}",
                    self.phys_addr(),
                    self.state
                );
                return Err(VmxError::BadVmcsState);
            }
        }
        if !cpu.is_enabled() {
            return Err(VmxError::VmxNotEnabled);
        }

        let paddr = self.phys_addr();
        if let Some(current) = cpu.current_vmcs() {
            if current != paddr {
                return Err(VmxError::CurrentVmcsBusy { current });
            }
        }

        let expected = cpu.vmcs_revision_id();
        let found = self.region.revision_id();
        if found != expected {
            error!("[HV] VMCS({paddr:#x}) revision {found:#x}, processor expects {expected:#x}");
            return Err(VmxError::RevisionMismatch { expected, found });
        }

        cpu.instructions_mut().vmptrld(paddr)?;
        cpu.acquire_current(paddr);
        self.state = VmcsState::Current {
            cpu_id: cpu.cpu_id(),
            launch: LaunchState::Unlaunched,
        };
        trace!("[HV] VMCS({paddr:#x}) current on CPU {}", cpu.cpu_id());
        Ok(())
    }

    /// Reads a field of this VMCS, which must be current on `cpu`.
    pub fn read<F: VmcsField, I: VmxInstructions>(
        &self,
        cpu: &VmxPerCpuState<H, I>,
        field: F,
    ) -> Result<F::Value> {
        self.ensure_current(cpu)?;
        let raw = cpu.instructions().vmread(field.encoding())?;
        Ok(F::from_raw(raw))
    }

    /// Writes a field of this VMCS, which must be current on `cpu`.
    pub fn write<F: WritableVmcsField, I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        field: F,
        value: F::Value,
    ) -> Result {
        self.ensure_current(cpu)?;
        cpu.instructions_mut()
            .vmwrite(field.encoding(), F::into_raw(value))
            .map_err(|err| {
                warn!("[HV] failed to write VMCS field {field:?} = {value:#x?}: {err}");
                VmxError::from(err)
            })
    }

    /// Reads a guest segment register. An unusable segment reads back with
    /// access rights 0.
    pub fn read_segment<I: VmxInstructions>(
        &self,
        cpu: &VmxPerCpuState<H, I>,
        seg: GuestSegment,
    ) -> Result<Segment> {
        let fields = seg.fields();
        let access_rights = self.read(cpu, fields.access_rights)?;
        Ok(Segment {
            selector: self.read(cpu, fields.selector)?,
            base: self.read(cpu, fields.base)?,
            limit: self.read(cpu, fields.limit)?,
            access_rights: if access_rights & SEGMENT_UNUSABLE != 0 {
                0
            } else {
                access_rights
            },
        })
    }

    /// Writes a guest segment register. Access rights 0 mark it unusable.
    pub fn write_segment<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        seg: GuestSegment,
        segment: Segment,
    ) -> Result {
        let fields = seg.fields();
        let access_rights = if segment.is_usable() {
            segment.access_rights
        } else {
            SEGMENT_UNUSABLE
        };
        self.write(cpu, fields.selector, segment.selector)?;
        self.write(cpu, fields.base, segment.base)?;
        self.write(cpu, fields.limit, segment.limit)?;
        self.write(cpu, fields.access_rights, access_rights)
    }

    pub fn read_descriptor_table<I: VmxInstructions>(
        &self,
        cpu: &VmxPerCpuState<H, I>,
        table: GuestDescriptorTable,
    ) -> Result<DescriptorTable> {
        let (base, limit) = table.fields();
        Ok(DescriptorTable {
            base: self.read(cpu, base)?,
            limit: self.read(cpu, limit)?,
        })
    }

    pub fn write_descriptor_table<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        table: GuestDescriptorTable,
        value: DescriptorTable,
    ) -> Result {
        let (base, limit) = table.fields();
        self.write(cpu, base, value.base)?;
        self.write(cpu, limit, value.limit)
    }

    /// Logs the fields that decide whether a VM entry succeeds, and the
    /// information of the last exit, at debug level.
    pub fn dump<I: VmxInstructions>(&self, cpu: &VmxPerCpuState<H, I>) -> Result {
        macro_rules! dump_fields {
            ($vmcs: expr, $cpu: expr; $($field: expr),* $(,)?) => {$(
                let field = $field;
                let value = $vmcs.read($cpu, field)?;
                let width = 2 + 2 * field.width().bytes();
                debug!("[HV]   {field:?} = {value:#0width$x}");
            )*};
        }

        debug!("[HV] VMCS({:#x}) {:?}:", self.phys_addr(), self.state);
        dump_fields!(
            self, cpu;
            VmcsReadOnly32::VM_INSTRUCTION_ERROR,
            VmcsReadOnly32::EXIT_REASON,
            VmcsReadOnlyNW::EXIT_QUALIFICATION,
            VmcsControl32::PINBASED_EXEC_CONTROLS,
            VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS,
            VmcsControl32::SECONDARY_PROCBASED_EXEC_CONTROLS,
            VmcsControl32::VMEXIT_CONTROLS,
            VmcsControl32::VMENTRY_CONTROLS,
            VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD,
            VmcsGuestNW::CR0,
            VmcsGuestNW::CR3,
            VmcsGuestNW::CR4,
            VmcsGuestNW::RIP,
            VmcsGuestNW::RSP,
            VmcsGuestNW::RFLAGS,
            VmcsGuest64::IA32_EFER,
            VmcsGuest64::LINK_PTR,
            VmcsGuest32::INTERRUPTIBILITY_STATE,
            VmcsGuest32::ACTIVITY_STATE,
        );
        for seg in GuestSegment::ALL {
            let segment = self.read_segment(cpu, seg)?;
            debug!("[HV]   {seg:?} = {segment:#x?}");
        }
        for table in [GuestDescriptorTable::Gdtr, GuestDescriptorTable::Idtr] {
            let value = self.read_descriptor_table(cpu, table)?;
            debug!("[HV]   {table:?} = {value:#x?}");
        }
        Ok(())
    }

    /// The first VM entry with this VMCS (VMLAUNCH).
    ///
    /// The VMCS must be current on `cpu` and not launched yet; otherwise this
    /// fails the way VMLAUNCH would, without touching the hardware.
    pub fn launch<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        state: &mut VcpuExecutionState,
    ) -> Result {
        self.ensure_not_elsewhere(cpu)?;
        match self.state {
            VmcsState::Current {
                launch: LaunchState::Unlaunched,
                ..
            } => {}
            VmcsState::Cleared => return Err(VmxError::VmcsNotCurrent),
            _ => {
                return Err(VmxError::VmFailValid(
                    VmxInstructionError::VMLAUNCH_NONCLEAR_VMCS,
                ));
            }
        }
        self.ensure_current(cpu)?;
        let result = cpu.instructions_mut().vmlaunch(state);
        self.complete_entry(cpu, result)
    }

    /// A subsequent VM entry with this VMCS (VMRESUME).
    ///
    /// The VMCS must be current on `cpu` and launched; otherwise this fails the
    /// way VMRESUME would, without touching the hardware.
    pub fn resume<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        state: &mut VcpuExecutionState,
    ) -> Result {
        self.ensure_not_elsewhere(cpu)?;
        if !matches!(
            self.state,
            VmcsState::Current {
                launch: LaunchState::Launched,
                ..
            }
        ) {
            return Err(VmxError::VmFailValid(
                VmxInstructionError::VMRESUME_NONLAUNCHED_VMCS,
            ));
        }
        self.ensure_current(cpu)?;
        let result = cpu.instructions_mut().vmresume(state);
        self.complete_entry(cpu, result)
    }

    /// Enters the guest with VMLAUNCH or VMRESUME, whichever the launch state
    /// calls for.
    pub fn enter<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        state: &mut VcpuExecutionState,
    ) -> Result {
        match self.state {
            VmcsState::Current {
                launch: LaunchState::Launched,
                ..
            } => self.resume(cpu, state),
            _ => self.launch(cpu, state),
        }
    }

    fn complete_entry<I: VmxInstructions>(
        &mut self,
        cpu: &VmxPerCpuState<H, I>,
        result: core::result::Result<(), VmFail>,
    ) -> Result {
        if let Err(fail) = result {
            warn!("[HV] VM entry with VMCS({:#x}) failed: {fail}", self.phys_addr());
            return Err(fail.into());
        }

        let reason = self.read(cpu, VmcsReadOnly32::EXIT_REASON)?;
        if !ExitReason::from_raw(reason).entry_failure {
            if let VmcsState::Current { launch, .. } = &mut self.state {
                *launch = LaunchState::Launched;
            }
        }
        Ok(())
    }

    /// Clears the VMCS and gives its memory back.
    ///
    /// If the VMCS cannot be cleared on `cpu`, it is handed back unchanged
    /// together with the error.
    pub fn release<I: VmxInstructions>(
        mut self,
        cpu: &mut VmxPerCpuState<H, I>,
    ) -> core::result::Result<(), (Self, VmxError)> {
        if let Err(err) = self.clear(cpu) {
            return Err((self, err));
        }
        debug!("[HV] released VMCS({:#x})", self.phys_addr());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn region_mut(&mut self) -> &mut VmxRegion<H> {
        &mut self.region
    }
}

impl<H: Hal> Drop for VmcsRegion<H> {
    fn drop(&mut self) {
        if let VmcsState::Current { cpu_id, .. } = self.state {
            // The processor may still write the VMCS back, so leak the frame.
            error!(
                "[HV] VMCS({:#x}) dropped while current on CPU {cpu_id}, leaking it",
                self.phys_addr()
            );
            return;
        }
        // SAFETY: `region` is not used after this.
        unsafe { ManuallyDrop::drop(&mut self.region) };
    }
}
