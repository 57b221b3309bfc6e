use alloc::collections::VecDeque;
use core::fmt::{Debug, Formatter};

use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::rflags::RFlags;

use super::capability::VmxCapability;
use super::controls::{
    ControlField, ControlFieldSet, ControlRequest, PinbasedControls, PrimaryControls,
    SecondaryControls,
};
use super::definitions::VmxExitReason;
use super::exit::VmxExitInfo;
use super::instructions::VmxInstructions;
use super::interrupt::{InterruptionInfo, InterruptionType};
use super::percpu::VmxPerCpuState;
use super::vmcs::{
    ActivityState, DescriptorTable, GuestDescriptorTable, GuestSegment, Segment, VmcsControl16,
    VmcsControl32, VmcsControl64, VmcsControlNW, VmcsGuest32, VmcsGuest64, VmcsGuestNW,
    VmcsReadOnly32, VmcsRegion, VmcsState,
};
use crate::regs::{GeneralRegisters, GeneralRegistersDiff};
use crate::{Hal, Result, VmxError};

/// Power-on value of IA32_PAT.
const PAT_RESET_VALUE: u64 = 0x0007_0406_0007_0406;

/// Guest state that lives outside the VMCS and is swapped by the entry and
/// exit trampolines.
///
/// `regs` must stay the first field: the trampolines address the registers
/// at fixed offsets from the start of this structure.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VcpuExecutionState {
    pub regs: GeneralRegisters,
    /// Guest CR2, which VM entry and VM exit do not switch.
    pub cr2: u64,
}

const _: () = assert!(core::mem::offset_of!(VcpuExecutionState, regs) == 0);

/// Initial configuration of a virtual CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuConfig {
    pub controls: ControlRequest,
    /// Guest `RIP` of the first instruction, with `CS.base` = 0.
    pub entry: usize,
    /// Exceptions that cause VM exits.
    pub exception_bitmap: u32,
    /// Virtual-processor identifier; requires [`SecondaryControls::ENABLE_VPID`].
    pub vpid: Option<u16>,
    /// EPT pointer; requires [`SecondaryControls::ENABLE_EPT`].
    pub eptp: Option<u64>,
}

impl VcpuConfig {
    /// A guest that starts at `entry` with the host-side default controls.
    pub fn new(entry: usize) -> Self {
        Self {
            controls: ControlRequest::host_defaults(),
            entry,
            exception_bitmap: 0,
            vpid: None,
            eptp: None,
        }
    }

    pub fn with_controls(mut self, controls: ControlRequest) -> Self {
        self.controls = controls;
        self
    }

    /// Translates guest-physical addresses with the EPT rooted at `eptp`.
    ///
    /// Also enables unrestricted guest, so the guest may run in real mode.
    pub fn with_ept(mut self, eptp: u64) -> Self {
        self.eptp = Some(eptp);
        self.controls = self
            .controls
            .with_secondary(SecondaryControls::ENABLE_EPT | SecondaryControls::UNRESTRICTED_GUEST);
        self
    }

    pub fn with_vpid(mut self, vpid: u16) -> Self {
        self.vpid = Some(vpid);
        self.controls = self.controls.with_secondary(SecondaryControls::ENABLE_VPID);
        self
    }
}

/// A VM exit the caller asks for before the next entry, so that [`VmxVcpu::run`]
/// comes back at a well-defined point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitRequest {
    /// Exit as soon as the guest can take an external interrupt.
    InterruptWindow,
    /// Exit as soon as the guest is not blocked by NMI. Requires virtual NMIs.
    NmiWindow,
    /// Exit after the VMX-preemption timer counts down from the given value.
    PreemptionTimer(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEvent {
    vector: u8,
    ty: InterruptionType,
    error_code: Option<u32>,
}

/// A virtual CPU: a VMCS plus the guest registers it does not hold.
pub struct VmxVcpu<H: Hal> {
    state: VcpuExecutionState,
    vmcs: VmcsRegion<H>,
    capability: VmxCapability,
    controls: Option<ControlFieldSet>,
    pending_events: VecDeque<PendingEvent>,
}

impl<H: Hal> VmxVcpu<H> {
    /// Creates a virtual CPU with a freshly cleared VMCS.
    ///
    /// `cpu` must be in VMX root operation.
    pub fn new<I: VmxInstructions>(
        cap: &VmxCapability,
        cpu: &mut VmxPerCpuState<H, I>,
    ) -> Result<Self> {
        let mut vmcs = VmcsRegion::allocate(cap)?;
        vmcs.clear(cpu)?;
        debug!("[HV] created VmxVcpu(vmcs: {:#x})", vmcs.phys_addr());
        Ok(Self {
            state: VcpuExecutionState::default(),
            vmcs,
            capability: *cap,
            controls: None,
            pending_events: VecDeque::new(),
        })
    }

    /// Makes this virtual CPU's VMCS current on `cpu`.
    pub fn bind<I: VmxInstructions>(&mut self, cpu: &mut VmxPerCpuState<H, I>) -> Result {
        self.vmcs.load(cpu)
    }

    /// Clears this virtual CPU's VMCS, so that it may be bound on another
    /// hardware thread.
    pub fn unbind<I: VmxInstructions>(&mut self, cpu: &mut VmxPerCpuState<H, I>) -> Result {
        self.vmcs.clear(cpu)
    }

    /// Releases the VMCS. The virtual CPU must not be current elsewhere;
    /// otherwise it is handed back together with the error.
    pub fn destroy<I: VmxInstructions>(
        self,
        cpu: &mut VmxPerCpuState<H, I>,
    ) -> core::result::Result<(), (Self, VmxError)> {
        let Self {
            state,
            vmcs,
            capability,
            controls,
            pending_events,
        } = self;
        vmcs.release(cpu).map_err(|(vmcs, err)| {
            let vcpu = Self {
                state,
                vmcs,
                capability,
                controls,
                pending_events,
            };
            (vcpu, err)
        })
    }

    pub fn vmcs(&self) -> &VmcsRegion<H> {
        &self.vmcs
    }

    pub fn vmcs_state(&self) -> VmcsState {
        self.vmcs.state()
    }

    /// The control fields written by the last [`VmxVcpu::setup`].
    pub fn controls(&self) -> Option<&ControlFieldSet> {
        self.controls.as_ref()
    }

    pub fn regs(&self) -> &GeneralRegisters {
        &self.state.regs
    }

    pub fn regs_mut(&mut self) -> &mut GeneralRegisters {
        &mut self.state.regs
    }

    pub fn execution_state(&self) -> &VcpuExecutionState {
        &self.state
    }

    pub fn execution_state_mut(&mut self) -> &mut VcpuExecutionState {
        &mut self.state
    }

    /// Writes the control fields and the architectural reset state of the
    /// guest. The VMCS must be bound to `cpu`.
    ///
    /// All controls are validated before the first write, so an invalid
    /// configuration leaves the VMCS untouched.
    pub fn setup<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        config: &VcpuConfig,
    ) -> Result {
        let controls = ControlFieldSet::build(&config.controls, &self.capability)?;
        let require_secondary = |present: bool, flags: SecondaryControls| {
            if present && !controls.secondary_contains(flags) {
                warn!("[HV] {flags:?} must be enabled in the secondary controls");
                return Err(VmxError::ConfigInvalid {
                    field: ControlField::Secondary,
                    rejected: flags.bits(),
                });
            }
            Ok(())
        };
        require_secondary(config.vpid.is_some(), SecondaryControls::ENABLE_VPID)?;
        require_secondary(config.eptp.is_some(), SecondaryControls::ENABLE_EPT)?;

        self.setup_vmcs_control(cpu, &controls, config)?;
        self.controls = Some(controls);
        self.setup_vmcs_guest(cpu, config.entry)?;
        self.pending_events.clear();
        debug!(
            "[HV] VMCS({:#x}) set up, entry {:#x}, controls {controls:#x?}",
            self.vmcs.phys_addr(),
            config.entry
        );
        Ok(())
    }

    fn setup_vmcs_control<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        controls: &ControlFieldSet,
        config: &VcpuConfig,
    ) -> Result {
        let vmcs = &mut self.vmcs;
        for field in [
            ControlField::Pinbased,
            ControlField::Primary,
            ControlField::Exit,
            ControlField::Entry,
        ] {
            vmcs.write(cpu, field.vmcs_field(), controls.value(field))?;
        }
        if let Some(secondary) = controls.secondary {
            vmcs.write(cpu, ControlField::Secondary.vmcs_field(), secondary)?;
        }

        vmcs.write(cpu, VmcsControl32::EXCEPTION_BITMAP, config.exception_bitmap)?;
        vmcs.write(cpu, VmcsControl32::PAGE_FAULT_ERR_CODE_MASK, 0)?;
        vmcs.write(cpu, VmcsControl32::PAGE_FAULT_ERR_CODE_MATCH, 0)?;
        vmcs.write(cpu, VmcsControl32::CR3_TARGET_COUNT, 0)?;
        vmcs.write(cpu, VmcsControl32::VMEXIT_MSR_STORE_COUNT, 0)?;
        vmcs.write(cpu, VmcsControl32::VMEXIT_MSR_LOAD_COUNT, 0)?;
        vmcs.write(cpu, VmcsControl32::VMENTRY_MSR_LOAD_COUNT, 0)?;
        vmcs.write(cpu, VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD, 0)?;

        if let Some(vpid) = config.vpid {
            vmcs.write(cpu, VmcsControl16::VPID, vpid)?;
        }
        if let Some(eptp) = config.eptp {
            vmcs.write(cpu, VmcsControl64::EPTP, eptp)?;
        }
        Ok(())
    }

    fn setup_vmcs_guest<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        entry: usize,
    ) -> Result {
        let cr0 = Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::CACHE_DISABLE | Cr0Flags::EXTENSION_TYPE;
        self.set_guest_cr(cpu, 0, cr0.bits())?;
        self.set_guest_cr(cpu, 4, 0)?;
        self.set_guest_cr(cpu, 3, 0)?;

        // 16-bit, present, read/write data, accessed
        let data = Segment::new(0, 0, 0xffff, 0x93);
        let vmcs = &mut self.vmcs;
        for seg in [
            GuestSegment::Es,
            GuestSegment::Ss,
            GuestSegment::Ds,
            GuestSegment::Fs,
            GuestSegment::Gs,
        ] {
            vmcs.write_segment(cpu, seg, data)?;
        }
        let code = Segment {
            access_rights: 0x9b, // execute/read code
            ..data
        };
        let tss = Segment {
            access_rights: 0x8b, // system, 32-bit busy TSS
            ..data
        };
        let ldt = Segment {
            access_rights: 0x82, // system, LDT
            ..data
        };
        vmcs.write_segment(cpu, GuestSegment::Cs, code)?;
        vmcs.write_segment(cpu, GuestSegment::Tr, tss)?;
        vmcs.write_segment(cpu, GuestSegment::Ldtr, ldt)?;

        let real_mode_table = DescriptorTable {
            base: 0,
            limit: 0xffff,
        };
        vmcs.write_descriptor_table(cpu, GuestDescriptorTable::Gdtr, real_mode_table)?;
        vmcs.write_descriptor_table(cpu, GuestDescriptorTable::Idtr, real_mode_table)?;

        vmcs.write(cpu, VmcsGuestNW::DR7, 0x400)?;
        vmcs.write(cpu, VmcsGuestNW::RSP, 0)?;
        vmcs.write(cpu, VmcsGuestNW::RIP, entry)?;
        vmcs.write(cpu, VmcsGuestNW::RFLAGS, 0x2)?;
        vmcs.write(cpu, VmcsGuestNW::PENDING_DBG_EXCEPTIONS, 0)?;
        vmcs.write(cpu, VmcsGuestNW::IA32_SYSENTER_ESP, 0)?;
        vmcs.write(cpu, VmcsGuestNW::IA32_SYSENTER_EIP, 0)?;
        vmcs.write(cpu, VmcsGuest32::IA32_SYSENTER_CS, 0)?;

        vmcs.write(cpu, VmcsGuest32::INTERRUPTIBILITY_STATE, 0)?;
        vmcs.write(cpu, VmcsGuest32::ACTIVITY_STATE, ActivityState::Active as u32)?;
        vmcs.write(cpu, VmcsGuest32::VMX_PREEMPTION_TIMER_VALUE, 0)?;

        vmcs.write(cpu, VmcsGuest64::LINK_PTR, u64::MAX)?; // SDM Vol. 3C, Section 25.4.2
        vmcs.write(cpu, VmcsGuest64::IA32_DEBUGCTL, 0)?;
        vmcs.write(cpu, VmcsGuest64::IA32_PAT, PAT_RESET_VALUE)?;
        vmcs.write(cpu, VmcsGuest64::IA32_EFER, 0)?;

        self.state = VcpuExecutionState::default();
        Ok(())
    }

    /// Sets guest CR0, CR3 or CR4, keeping the bits VMX operation fixes and
    /// showing the guest the value it asked for through the read shadow.
    pub fn set_guest_cr<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        cr_idx: usize,
        val: u64,
    ) -> Result {
        match cr_idx {
            0 => {
                // NW and CD are not switched on VM exit, keep them off. PE and
                // PG are the guest's choice under unrestricted guest.
                let fixed = self.capability.cr0_fixed;
                let must0 = fixed.may_be_one
                    & !(Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::CACHE_DISABLE).bits();
                let mut must1 = fixed.must_be_one;
                if self.unrestricted_guest() {
                    must1 &= !(Cr0Flags::PAGING | Cr0Flags::PROTECTED_MODE_ENABLE).bits();
                }
                self.vmcs
                    .write(cpu, VmcsGuestNW::CR0, ((val & must0) | must1) as usize)?;
                self.vmcs
                    .write(cpu, VmcsControlNW::CR0_READ_SHADOW, val as usize)?;
                self.vmcs.write(
                    cpu,
                    VmcsControlNW::CR0_GUEST_HOST_MASK,
                    (must1 | !must0) as usize,
                )?;
            }
            3 => self.vmcs.write(cpu, VmcsGuestNW::CR3, val as usize)?,
            4 => {
                let fixed = self.capability.cr4_fixed;
                let must0 = fixed.may_be_one;
                let must1 = fixed.must_be_one;
                let val = val | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
                self.vmcs
                    .write(cpu, VmcsGuestNW::CR4, ((val & must0) | must1) as usize)?;
                self.vmcs
                    .write(cpu, VmcsControlNW::CR4_READ_SHADOW, val as usize)?;
                self.vmcs.write(
                    cpu,
                    VmcsControlNW::CR4_GUEST_HOST_MASK,
                    (must1 | !must0) as usize,
                )?;
            }
            _ => return Err(VmxError::InvalidInput("control register index")),
        }
        Ok(())
    }

    /// Reads guest CR0, CR3 or CR4 as the guest sees it.
    pub fn guest_cr<I: VmxInstructions>(
        &self,
        cpu: &VmxPerCpuState<H, I>,
        cr_idx: usize,
    ) -> Result<u64> {
        let shadowed = |value: VmcsGuestNW,
                        shadow: VmcsControlNW,
                        mask: VmcsControlNW|
         -> Result<u64> {
            let host_mask = self.vmcs.read(cpu, mask)?;
            Ok(((self.vmcs.read(cpu, shadow)? & host_mask)
                | (self.vmcs.read(cpu, value)? & !host_mask)) as u64)
        };
        match cr_idx {
            0 => shadowed(
                VmcsGuestNW::CR0,
                VmcsControlNW::CR0_READ_SHADOW,
                VmcsControlNW::CR0_GUEST_HOST_MASK,
            ),
            3 => Ok(self.vmcs.read(cpu, VmcsGuestNW::CR3)? as u64),
            4 => shadowed(
                VmcsGuestNW::CR4,
                VmcsControlNW::CR4_READ_SHADOW,
                VmcsControlNW::CR4_GUEST_HOST_MASK,
            ),
            _ => Err(VmxError::InvalidInput("control register index")),
        }
    }

    fn unrestricted_guest(&self) -> bool {
        self.controls
            .is_some_and(|c| c.secondary_contains(SecondaryControls::UNRESTRICTED_GUEST))
    }

    pub fn rip<I: VmxInstructions>(&self, cpu: &VmxPerCpuState<H, I>) -> Result<usize> {
        self.vmcs.read(cpu, VmcsGuestNW::RIP)
    }

    pub fn set_rip<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        rip: usize,
    ) -> Result {
        self.vmcs.write(cpu, VmcsGuestNW::RIP, rip)
    }

    /// Skips the instruction that caused the last VM exit.
    pub fn advance_rip<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        instr_len: u32,
    ) -> Result {
        let rip = self.rip(cpu)?;
        self.set_rip(cpu, rip.wrapping_add(instr_len as usize))
    }

    pub fn guest_segment<I: VmxInstructions>(
        &self,
        cpu: &VmxPerCpuState<H, I>,
        seg: GuestSegment,
    ) -> Result<Segment> {
        self.vmcs.read_segment(cpu, seg)
    }

    pub fn set_guest_segment<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        seg: GuestSegment,
        segment: Segment,
    ) -> Result {
        self.vmcs.write_segment(cpu, seg, segment)
    }

    pub fn activity_state<I: VmxInstructions>(
        &self,
        cpu: &VmxPerCpuState<H, I>,
    ) -> Result<ActivityState> {
        let raw = self.vmcs.read(cpu, VmcsGuest32::ACTIVITY_STATE)?;
        ActivityState::try_from(raw).map_err(|_| VmxError::MalformedField {
            name: "activity state",
            raw: raw as u64,
        })
    }

    /// Sets the activity state the guest is entered in, if the processor
    /// supports entering in that state.
    pub fn set_activity_state<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        state: ActivityState,
    ) -> Result {
        if let Some(required) = state.required_capability() {
            if !self.capability.misc.activity_states.contains(required) {
                return Err(VmxError::UnsupportedFeature(alloc::format!(
                    "activity state {state:?}"
                )));
            }
        }
        self.vmcs
            .write(cpu, VmcsGuest32::ACTIVITY_STATE, state as u32)
    }

    /// Reads the general-purpose register with the given encoding. RSP is
    /// taken from the VMCS. Indices above 15 are `InvalidInput`.
    pub fn read_gpr<I: VmxInstructions>(
        &self,
        cpu: &VmxPerCpuState<H, I>,
        index: u8,
    ) -> Result<u64> {
        check_gpr_index(index)?;
        if index == GeneralRegisters::RSP_INDEX {
            Ok(self.vmcs.read(cpu, VmcsGuestNW::RSP)? as u64)
        } else {
            Ok(self.state.regs.get_reg_of_index(index))
        }
    }

    /// Writes the general-purpose register with the given encoding. RSP is
    /// written to the VMCS.
    pub fn write_gpr<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        index: u8,
        value: u64,
    ) -> Result {
        check_gpr_index(index)?;
        if index == GeneralRegisters::RSP_INDEX {
            self.vmcs.write(cpu, VmcsGuestNW::RSP, value as usize)
        } else {
            self.state.regs.set_reg_of_index(index, value);
            Ok(())
        }
    }

    /// Queues an event to inject on a later VM entry.
    ///
    /// The interruption type follows from `vector`. An error code is only
    /// delivered with exceptions that push one, and defaults to 0 for them.
    pub fn queue_event(&mut self, vector: u8, err_code: Option<u32>) {
        let ty = InterruptionType::from_vector(vector);
        let error_code = if ty == InterruptionType::HardwareException
            && InterruptionType::vector_has_error_code(vector)
        {
            Some(err_code.unwrap_or(0))
        } else {
            None
        };
        self.pending_events.push_back(PendingEvent {
            vector,
            ty,
            error_code,
        });
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending_events.len()
    }

    /// Asks for a VM exit at a well-defined point of the next guest run.
    ///
    /// The request is checked against the processor's capabilities and is
    /// withdrawn automatically once the corresponding exit happens.
    pub fn request_exit<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        request: ExitRequest,
    ) -> Result {
        match request {
            ExitRequest::InterruptWindow => {
                let bits = PrimaryControls::INTERRUPT_WINDOW_EXITING.bits();
                self.check_allowed(ControlField::Primary, bits)?;
                self.update_control(cpu, ControlField::Primary, bits, true)
            }
            ExitRequest::NmiWindow => {
                let bits = PrimaryControls::NMI_WINDOW_EXITING.bits();
                self.check_allowed(ControlField::Primary, bits)?;
                let pinbased = self
                    .vmcs
                    .read(cpu, ControlField::Pinbased.vmcs_field())?;
                if !PinbasedControls::from_bits_retain(pinbased)
                    .contains(PinbasedControls::VIRTUAL_NMIS)
                {
                    warn!("[HV] NMI-window exiting needs virtual NMIs enabled");
                    return Err(VmxError::ConfigInvalid {
                        field: ControlField::Primary,
                        rejected: bits,
                    });
                }
                self.update_control(cpu, ControlField::Primary, bits, true)
            }
            ExitRequest::PreemptionTimer(value) => {
                let bits = PinbasedControls::VMX_PREEMPTION_TIMER.bits();
                self.check_allowed(ControlField::Pinbased, bits)?;
                self.vmcs
                    .write(cpu, VmcsGuest32::VMX_PREEMPTION_TIMER_VALUE, value)?;
                self.update_control(cpu, ControlField::Pinbased, bits, true)
            }
        }
    }

    fn check_allowed(&self, field: ControlField, bits: u32) -> Result {
        let allowed = field.capability(&self.capability);
        if allowed.allows(bits) {
            Ok(())
        } else {
            Err(VmxError::ConfigInvalid {
                field,
                rejected: bits & !allowed.may_be_one,
            })
        }
    }

    fn update_control<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        field: ControlField,
        bits: u32,
        enable: bool,
    ) -> Result {
        let mut ctrl = self.vmcs.read(cpu, field.vmcs_field())?;
        if enable {
            ctrl |= bits
        } else {
            ctrl &= !bits
        }
        self.vmcs.write(cpu, field.vmcs_field(), ctrl)
    }

    /// Whether the guest can take an external interrupt now.
    /// (SDM Vol. 3C, Section 25.4.2, Table 25-3)
    fn allow_interrupt<I: VmxInstructions>(&self, cpu: &VmxPerCpuState<H, I>) -> Result<bool> {
        let rflags = self.vmcs.read(cpu, VmcsGuestNW::RFLAGS)?;
        let block_state = self.vmcs.read(cpu, VmcsGuest32::INTERRUPTIBILITY_STATE)?;
        Ok(rflags as u64 & RFlags::INTERRUPT_FLAG.bits() != 0 && block_state == 0)
    }

    /// Writes the first pending event to the VMCS, or opens an interrupt
    /// window if it is an external interrupt the guest cannot take yet.
    ///
    /// Returns whether an event was written. It stays queued until an entry
    /// delivers it.
    fn inject_pending_events<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
    ) -> Result<bool> {
        let Some(event) = self.pending_events.front().copied() else {
            return Ok(false);
        };
        if event.ty != InterruptionType::External || self.allow_interrupt(cpu)? {
            self.inject_event(cpu, event)?;
            Ok(true)
        } else {
            trace!("[HV] vector {:#x} blocked, open interrupt window", event.vector);
            self.update_control(
                cpu,
                ControlField::Primary,
                PrimaryControls::INTERRUPT_WINDOW_EXITING.bits(),
                true,
            )?;
            Ok(false)
        }
    }

    /// Takes back an injection the last entry did not deliver, so that the
    /// next entry decides afresh.
    fn withdraw_injection<I: VmxInstructions>(&mut self, cpu: &mut VmxPerCpuState<H, I>) {
        if let Err(err) = self
            .vmcs
            .write(cpu, VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD, 0)
        {
            warn!("[HV] failed to withdraw event injection: {err}");
        }
    }

    /// Writes the VM-entry event-injection fields. (SDM Vol. 3C, Section 25.8.3)
    fn inject_event<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        event: PendingEvent,
    ) -> Result {
        let info = InterruptionInfo::encode(event.vector, event.ty, event.error_code.is_some());
        trace!("[HV] inject {info:?}, error code {:?}", event.error_code);
        if let Some(err_code) = event.error_code {
            self.vmcs
                .write(cpu, VmcsControl32::VMENTRY_EXCEPTION_ERR_CODE, err_code)?;
        }
        if event.ty.is_soft() {
            let len = self.vmcs.read(cpu, VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN)?;
            self.vmcs
                .write(cpu, VmcsControl32::VMENTRY_INSTRUCTION_LEN, len)?;
        }
        self.vmcs
            .write(cpu, VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD, info.raw())
    }

    /// Runs the guest until the next VM exit and returns its information.
    ///
    /// The first pending event is injected before entry and leaves the queue
    /// only once an entry succeeds; after a failed VMLAUNCH/VMRESUME or an
    /// entry-failure exit it is injected again next time. Exits caused by a
    /// window or timer this virtual CPU armed disarm it again, and an event
    /// whose delivery was cut short by the exit is queued for re-injection.
    pub fn run<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
    ) -> Result<VmxExitInfo> {
        let injected = self.inject_pending_events(cpu)?;

        let regs_before = self.state.regs;
        if let Err(err) = self.vmcs.enter(cpu, &mut self.state) {
            if injected {
                self.withdraw_injection(cpu);
            }
            return Err(err);
        }
        let exit_info = VmxExitInfo::capture(&self.vmcs, cpu)?;
        if injected {
            if exit_info.exit_reason.entry_failure {
                self.withdraw_injection(cpu);
            } else {
                self.pending_events.pop_front();
            }
        }

        trace!("[HV] VM exit: {exit_info:#x?}");
        if cfg!(feature = "tracing") && log_enabled!(log::Level::Trace) {
            let diff = GeneralRegistersDiff::new(regs_before, self.state.regs);
            if !diff.is_same() {
                trace!("[HV] guest registers changed: {diff:?}");
            }
        }

        self.builtin_vmexit_handler(cpu, &exit_info)?;
        Ok(exit_info)
    }

    /// Bookkeeping every VM exit needs before the caller sees it.
    fn builtin_vmexit_handler<I: VmxInstructions>(
        &mut self,
        cpu: &mut VmxPerCpuState<H, I>,
        exit_info: &VmxExitInfo,
    ) -> Result {
        if exit_info.exit_reason.entry_failure {
            warn!(
                "[HV] VM entry failed: reason {}, qualification {:#x}",
                exit_info.exit_reason.basic, exit_info.exit_qualification
            );
            if log_enabled!(log::Level::Debug) {
                self.vmcs.dump(cpu)?;
            }
            return Ok(());
        }

        if let Some((info, error_code)) = exit_info.idt_vectoring {
            match info.decode() {
                Ok(Some(event)) if event.ty != InterruptionType::Other => {
                    debug!("[HV] re-queue interrupted delivery of {info:?}");
                    self.pending_events.push_front(PendingEvent {
                        vector: event.vector,
                        ty: event.ty,
                        error_code: error_code.filter(|_| event.has_error_code),
                    });
                }
                Ok(_) => {}
                Err(err) => warn!("[HV] dropping IDT-vectoring information: {err}"),
            }
        }

        match exit_info.exit_reason.reason() {
            Some(VmxExitReason::INTERRUPT_WINDOW) => self.update_control(
                cpu,
                ControlField::Primary,
                PrimaryControls::INTERRUPT_WINDOW_EXITING.bits(),
                false,
            ),
            Some(VmxExitReason::NMI_WINDOW) => self.update_control(
                cpu,
                ControlField::Primary,
                PrimaryControls::NMI_WINDOW_EXITING.bits(),
                false,
            ),
            Some(VmxExitReason::PREEMPTION_TIMER) => self.update_control(
                cpu,
                ControlField::Pinbased,
                PinbasedControls::VMX_PREEMPTION_TIMER.bits(),
                false,
            ),
            _ => Ok(()),
        }
    }
}

fn check_gpr_index(index: u8) -> Result {
    if index < 16 {
        Ok(())
    } else {
        warn!("[HV] no general-purpose register with index {index}");
        Err(VmxError::InvalidInput("general-purpose register index"))
    }
}

impl<H: Hal> Debug for VmxVcpu<H> {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        f.debug_struct("VmxVcpu")
            .field("vmcs", &format_args!("{:#x}", self.vmcs.phys_addr()))
            .field("vmcs_state", &self.vmcs.state())
            .field("state", &self.state)
            .field("controls", &self.controls)
            .field("pending_events", &self.pending_events)
            .finish()
    }
}
