//! VM-execution, VM-exit and VM-entry control fields, resolved against the
//! processor's capability snapshot. (SDM Vol. 3C, Sections 25.6 - 25.8)

use bitflags::bitflags;

use super::capability::{ControlCapability, VmxCapability};
use super::vmcs::VmcsControl32;
use crate::{Result, VmxError};

bitflags! {
    /// Pin-based VM-execution controls. (SDM Vol. 3C, Table 25-5)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PinbasedControls: u32 {
        /// External-interrupt exiting.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// NMI exiting.
        const NMI_EXITING = 1 << 3;
        /// Virtual NMIs.
        const VIRTUAL_NMIS = 1 << 5;
        /// Activate VMX-preemption timer.
        const VMX_PREEMPTION_TIMER = 1 << 6;
        /// Process posted interrupts.
        const POSTED_INTERRUPTS = 1 << 7;
    }

    /// Primary processor-based VM-execution controls. (SDM Vol. 3C, Table 25-6)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PrimaryControls: u32 {
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        const USE_TSC_OFFSETTING = 1 << 3;
        const HLT_EXITING = 1 << 7;
        const INVLPG_EXITING = 1 << 9;
        const MWAIT_EXITING = 1 << 10;
        const RDPMC_EXITING = 1 << 11;
        const RDTSC_EXITING = 1 << 12;
        const CR3_LOAD_EXITING = 1 << 15;
        const CR3_STORE_EXITING = 1 << 16;
        const ACTIVATE_TERTIARY_CONTROLS = 1 << 17;
        const CR8_LOAD_EXITING = 1 << 19;
        const CR8_STORE_EXITING = 1 << 20;
        const USE_TPR_SHADOW = 1 << 21;
        const NMI_WINDOW_EXITING = 1 << 22;
        const MOV_DR_EXITING = 1 << 23;
        const UNCOND_IO_EXITING = 1 << 24;
        const USE_IO_BITMAPS = 1 << 25;
        const MONITOR_TRAP_FLAG = 1 << 27;
        const USE_MSR_BITMAPS = 1 << 28;
        const MONITOR_EXITING = 1 << 29;
        const PAUSE_EXITING = 1 << 30;
        /// Activate secondary controls.
        const SECONDARY_CONTROLS = 1 << 31;
    }

    /// Secondary processor-based VM-execution controls. (SDM Vol. 3C, Table 25-7)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecondaryControls: u32 {
        const VIRT_APIC_ACCESSES = 1 << 0;
        const ENABLE_EPT = 1 << 1;
        const DESC_TABLE_EXITING = 1 << 2;
        const ENABLE_RDTSCP = 1 << 3;
        const VIRT_X2APIC_MODE = 1 << 4;
        const ENABLE_VPID = 1 << 5;
        const WBINVD_EXITING = 1 << 6;
        const UNRESTRICTED_GUEST = 1 << 7;
        const APIC_REGISTER_VIRT = 1 << 8;
        const VIRT_INTR_DELIVERY = 1 << 9;
        const PAUSE_LOOP_EXITING = 1 << 10;
        const RDRAND_EXITING = 1 << 11;
        const ENABLE_INVPCID = 1 << 12;
        const ENABLE_VM_FUNCTIONS = 1 << 13;
        const VMCS_SHADOWING = 1 << 14;
        const ENCLS_EXITING = 1 << 15;
        const RDSEED_EXITING = 1 << 16;
        const ENABLE_PML = 1 << 17;
        const EPT_VIOLATION_VE = 1 << 18;
        const CONCEAL_VMX_FROM_PT = 1 << 19;
        const ENABLE_XSAVES_XRSTORS = 1 << 20;
        const MODE_BASED_EPT_EXEC = 1 << 22;
        const SUB_PAGE_WRITE_PERM = 1 << 23;
        const INTEL_PT_GUEST_PHYSICAL = 1 << 24;
        const USE_TSC_SCALING = 1 << 25;
        const ENABLE_USER_WAIT_PAUSE = 1 << 26;
        const ENCLV_EXITING = 1 << 28;
    }

    /// VM-exit controls. (SDM Vol. 3C, Table 25-13)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExitControls: u32 {
        const SAVE_DEBUG_CONTROLS = 1 << 2;
        /// Host is in 64-bit mode after exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 12;
        const ACK_INTERRUPT_ON_EXIT = 1 << 15;
        const SAVE_IA32_PAT = 1 << 18;
        const LOAD_IA32_PAT = 1 << 19;
        const SAVE_IA32_EFER = 1 << 20;
        const LOAD_IA32_EFER = 1 << 21;
        const SAVE_VMX_PREEMPTION_TIMER = 1 << 22;
        const CLEAR_IA32_BNDCFGS = 1 << 23;
        const CONCEAL_VMX_FROM_PT = 1 << 24;
    }

    /// VM-entry controls. (SDM Vol. 3C, Table 25-15)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryControls: u32 {
        const LOAD_DEBUG_CONTROLS = 1 << 2;
        const IA32E_MODE_GUEST = 1 << 9;
        const ENTRY_TO_SMM = 1 << 10;
        const DEACTIVATE_DUAL_MONITOR = 1 << 11;
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 13;
        const LOAD_IA32_PAT = 1 << 14;
        const LOAD_IA32_EFER = 1 << 15;
        const LOAD_IA32_BNDCFGS = 1 << 16;
        const CONCEAL_VMX_FROM_PT = 1 << 17;
    }
}

/// The 32-bit control fields governed by a capability MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlField {
    Pinbased,
    Primary,
    Secondary,
    Exit,
    Entry,
}

impl ControlField {
    /// The allowed settings of this field. Secondary controls that do not
    /// exist allow nothing.
    pub fn capability(self, cap: &VmxCapability) -> ControlCapability {
        match self {
            ControlField::Pinbased => cap.pinbased,
            ControlField::Primary => cap.procbased,
            ControlField::Secondary => cap.secondary.unwrap_or_default(),
            ControlField::Exit => cap.exit,
            ControlField::Entry => cap.entry,
        }
    }

    pub fn vmcs_field(self) -> VmcsControl32 {
        match self {
            ControlField::Pinbased => VmcsControl32::PINBASED_EXEC_CONTROLS,
            ControlField::Primary => VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS,
            ControlField::Secondary => VmcsControl32::SECONDARY_PROCBASED_EXEC_CONTROLS,
            ControlField::Exit => VmcsControl32::VMEXIT_CONTROLS,
            ControlField::Entry => VmcsControl32::VMENTRY_CONTROLS,
        }
    }

    /// Resolves `requested` into a value the processor accepts: every
    /// must-be-one bit is added, and the request fails if it asks for a bit
    /// that cannot be one.
    pub fn build(self, requested: u32, cap: &VmxCapability) -> Result<u32> {
        let allowed = self.capability(cap);
        let rejected = requested & !allowed.may_be_one;
        if rejected != 0 {
            warn!(
                "[HV] {self:?} controls {requested:#x} rejected, bits {rejected:#x} not allowed (may be one: {:#x})",
                allowed.may_be_one
            );
            return Err(VmxError::ConfigInvalid {
                field: self,
                rejected,
            });
        }
        Ok((requested | allowed.must_be_one) & allowed.may_be_one)
    }
}

/// Control bits a caller asks for, before reconciliation with the hardware.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub pinbased: u32,
    pub primary: u32,
    pub secondary: u32,
    pub exit: u32,
    pub entry: u32,
}

impl ControlRequest {
    /// The controls this crate needs to drive a 64-bit host: NMI exiting,
    /// a 64-bit host after exit and PAT/EFER switching.
    pub fn host_defaults() -> Self {
        Self {
            pinbased: PinbasedControls::NMI_EXITING.bits(),
            primary: 0,
            secondary: 0,
            exit: (ExitControls::HOST_ADDRESS_SPACE_SIZE
                | ExitControls::SAVE_IA32_PAT
                | ExitControls::LOAD_IA32_PAT
                | ExitControls::SAVE_IA32_EFER
                | ExitControls::LOAD_IA32_EFER)
                .bits(),
            entry: (EntryControls::LOAD_IA32_PAT | EntryControls::LOAD_IA32_EFER).bits(),
        }
    }

    pub fn with_pinbased(mut self, flags: PinbasedControls) -> Self {
        self.pinbased |= flags.bits();
        self
    }

    pub fn with_primary(mut self, flags: PrimaryControls) -> Self {
        self.primary |= flags.bits();
        self
    }

    /// Adds secondary controls, activating them in the primary controls.
    pub fn with_secondary(mut self, flags: SecondaryControls) -> Self {
        self.primary |= PrimaryControls::SECONDARY_CONTROLS.bits();
        self.secondary |= flags.bits();
        self
    }

    pub fn with_exit(mut self, flags: ExitControls) -> Self {
        self.exit |= flags.bits();
        self
    }

    pub fn with_entry(mut self, flags: EntryControls) -> Self {
        self.entry |= flags.bits();
        self
    }
}

/// Control values accepted by the processor, ready to be written to a VMCS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFieldSet {
    pub pinbased: u32,
    pub primary: u32,
    /// Present only if [`PrimaryControls::SECONDARY_CONTROLS`] is set in `primary`.
    pub secondary: Option<u32>,
    pub exit: u32,
    pub entry: u32,
}

impl ControlFieldSet {
    /// Builds every control field of `request`. Nothing is written anywhere, so
    /// a failure leaves the caller's VMCS untouched.
    pub fn build(request: &ControlRequest, cap: &VmxCapability) -> Result<Self> {
        let activate_secondary = PrimaryControls::SECONDARY_CONTROLS.bits();
        if request.secondary != 0 && request.primary & activate_secondary == 0 {
            warn!(
                "[HV] secondary controls {:#x} requested without activating them",
                request.secondary
            );
            return Err(VmxError::SecondaryControlsDisabled);
        }

        let pinbased = ControlField::Pinbased.build(request.pinbased, cap)?;
        let primary = ControlField::Primary.build(request.primary, cap)?;
        let secondary = if primary & activate_secondary != 0 {
            Some(ControlField::Secondary.build(request.secondary, cap)?)
        } else {
            None
        };
        let exit = ControlField::Exit.build(request.exit, cap)?;
        let entry = ControlField::Entry.build(request.entry, cap)?;

        Ok(Self {
            pinbased,
            primary,
            secondary,
            exit,
            entry,
        })
    }

    /// The request that reproduces this set.
    pub fn request(&self) -> ControlRequest {
        ControlRequest {
            pinbased: self.pinbased,
            primary: self.primary,
            secondary: self.secondary.unwrap_or(0),
            exit: self.exit,
            entry: self.entry,
        }
    }

    /// The resolved value of `field`, zero for absent secondary controls.
    pub fn value(&self, field: ControlField) -> u32 {
        match field {
            ControlField::Pinbased => self.pinbased,
            ControlField::Primary => self.primary,
            ControlField::Secondary => self.secondary.unwrap_or(0),
            ControlField::Exit => self.exit,
            ControlField::Entry => self.entry,
        }
    }

    pub fn secondary_contains(&self, flags: SecondaryControls) -> bool {
        self.secondary
            .is_some_and(|bits| SecondaryControls::from_bits_retain(bits).contains(flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock::sample_capability;

    fn pin_only_capability(must_be_one: u32, may_be_one: u32) -> VmxCapability {
        let mut cap = sample_capability();
        cap.pinbased = ControlCapability {
            must_be_one,
            may_be_one,
        };
        cap
    }

    #[test]
    fn test_build_within_allowed() {
        let cap = pin_only_capability(0, 0x69);
        assert_eq!(ControlField::Pinbased.build(0x9, &cap), Ok(0x9));
    }

    #[test]
    fn test_build_rejects_disallowed_bits() {
        let cap = pin_only_capability(0, 0x69);
        assert_eq!(
            ControlField::Pinbased.build(0x109, &cap),
            Err(VmxError::ConfigInvalid {
                field: ControlField::Pinbased,
                rejected: 0x100,
            })
        );
    }

    #[test]
    fn test_build_adds_must_be_one() {
        let cap = pin_only_capability(0x16, 0xff);
        let value = ControlField::Pinbased.build(0x1, &cap).unwrap();
        assert_eq!(value, 0x17);
        assert_eq!(value & 0x16, 0x16);
        assert_eq!(value & !0xff, 0);
    }

    #[test]
    fn test_build_is_idempotent() {
        let cap = sample_capability();
        for requested in [0u32, 0x1, 0x8, 0x9, 0x29, 0x69] {
            let once = ControlField::Pinbased.build(requested, &cap).unwrap();
            assert_eq!(ControlField::Pinbased.build(once, &cap), Ok(once));
        }

        let request = ControlRequest::host_defaults()
            .with_primary(PrimaryControls::HLT_EXITING)
            .with_secondary(SecondaryControls::ENABLE_EPT | SecondaryControls::UNRESTRICTED_GUEST);
        let set = ControlFieldSet::build(&request, &cap).unwrap();
        assert_eq!(ControlFieldSet::build(&set.request(), &cap), Ok(set));
    }

    #[test]
    fn test_secondary_requires_activation() {
        let cap = sample_capability();
        let request = ControlRequest {
            secondary: SecondaryControls::ENABLE_EPT.bits(),
            ..ControlRequest::host_defaults()
        };
        assert_eq!(
            ControlFieldSet::build(&request, &cap),
            Err(VmxError::SecondaryControlsDisabled)
        );
    }

    #[test]
    fn test_secondary_absent_without_activation() {
        let cap = sample_capability();
        let set = ControlFieldSet::build(&ControlRequest::host_defaults(), &cap).unwrap();
        assert_eq!(set.secondary, None);
        assert!(!set.secondary_contains(SecondaryControls::ENABLE_EPT));
        assert_eq!(set.value(ControlField::Secondary), 0);
    }

    #[test]
    fn test_secondary_unsupported_by_processor() {
        let mut cap = sample_capability();
        cap.procbased.may_be_one &= !PrimaryControls::SECONDARY_CONTROLS.bits();
        cap.secondary = None;
        let request = ControlRequest::default().with_secondary(SecondaryControls::ENABLE_EPT);
        assert_eq!(
            ControlFieldSet::build(&request, &cap),
            Err(VmxError::ConfigInvalid {
                field: ControlField::Primary,
                rejected: PrimaryControls::SECONDARY_CONTROLS.bits(),
            })
        );
    }

    #[test]
    fn test_control_field_encodings() {
        assert_eq!(ControlField::Pinbased.vmcs_field() as u32, 0x4000);
        assert_eq!(ControlField::Primary.vmcs_field() as u32, 0x4002);
        assert_eq!(ControlField::Secondary.vmcs_field() as u32, 0x401e);
        assert_eq!(ControlField::Exit.vmcs_field() as u32, 0x400c);
        assert_eq!(ControlField::Entry.vmcs_field() as u32, 0x4012);
    }
}
