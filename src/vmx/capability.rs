//! Decoding of the VMX capability MSRs. (SDM Vol. 3D, Appendix A)

use bit_field::BitField;
use bitflags::bitflags;
use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;
use spin::Once;

use super::controls::{PrimaryControls, SecondaryControls};
use super::has_hardware_support;
use crate::msr::Msr;
use crate::{Result, VmxError};

/// Raw values of the VMX capability MSRs.
///
/// MSRs that do not exist on the processor are left as zero; [`VmxCapability::from_msrs`]
/// never looks at them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmxCapabilityMsrs {
    pub basic: u64,
    pub pinbased: u64,
    pub procbased: u64,
    pub exit: u64,
    pub entry: u64,
    pub misc: u64,
    pub cr0_fixed0: u64,
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
    pub vmcs_enum: u64,
    pub procbased2: u64,
    pub ept_vpid_cap: u64,
    pub true_pinbased: u64,
    pub true_procbased: u64,
    pub true_exit: u64,
    pub true_entry: u64,
}

impl VmxCapabilityMsrs {
    /// Reads the capability MSRs of the current processor, skipping the ones
    /// whose existence is not reported.
    pub fn read() -> Self {
        let mut msrs = Self {
            basic: Msr::IA32_VMX_BASIC.read(),
            pinbased: Msr::IA32_VMX_PINBASED_CTLS.read(),
            procbased: Msr::IA32_VMX_PROCBASED_CTLS.read(),
            exit: Msr::IA32_VMX_EXIT_CTLS.read(),
            entry: Msr::IA32_VMX_ENTRY_CTLS.read(),
            misc: Msr::IA32_VMX_MISC.read(),
            cr0_fixed0: Msr::IA32_VMX_CR0_FIXED0.read(),
            cr0_fixed1: Msr::IA32_VMX_CR0_FIXED1.read(),
            cr4_fixed0: Msr::IA32_VMX_CR4_FIXED0.read(),
            cr4_fixed1: Msr::IA32_VMX_CR4_FIXED1.read(),
            vmcs_enum: Msr::IA32_VMX_VMCS_ENUM.read(),
            ..Default::default()
        };
        if msrs.basic.get_bit(VmxCapability::BASIC_TRUE_CONTROLS_BIT) {
            msrs.true_pinbased = Msr::IA32_VMX_TRUE_PINBASED_CTLS.read();
            msrs.true_procbased = Msr::IA32_VMX_TRUE_PROCBASED_CTLS.read();
            msrs.true_exit = Msr::IA32_VMX_TRUE_EXIT_CTLS.read();
            msrs.true_entry = Msr::IA32_VMX_TRUE_ENTRY_CTLS.read();
        }
        if ControlCapability::from_msr(msrs.procbased).allows(PrimaryControls::SECONDARY_CONTROLS.bits())
        {
            msrs.procbased2 = Msr::IA32_VMX_PROCBASED_CTLS2.read();
            if VmxCapability::secondary_allows_ept_or_vpid(msrs.procbased2) {
                msrs.ept_vpid_cap = Msr::IA32_VMX_EPT_VPID_CAP.read();
            }
        }
        msrs
    }
}

/// Allowed settings of one 32-bit control field.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControlCapability {
    /// Bits that must be one (allowed 0-settings, low half of the MSR).
    pub must_be_one: u32,
    /// Bits that may be one (allowed 1-settings, high half of the MSR).
    pub may_be_one: u32,
}

impl ControlCapability {
    pub const fn from_msr(raw: u64) -> Self {
        Self {
            must_be_one: raw as u32,
            may_be_one: (raw >> 32) as u32,
        }
    }

    /// Whether every bit in `bits` may be set to one.
    pub const fn allows(&self, bits: u32) -> bool {
        bits & !self.may_be_one == 0
    }
}

/// Fixed bits of CR0 or CR4 in VMX operation. (SDM Vol. 3D, Appendix A.7, A.8)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FixedBits {
    /// Bits fixed to one (`FIXED0`).
    pub must_be_one: u64,
    /// Bits allowed to be one (`FIXED1`); everything else is fixed to zero.
    pub may_be_one: u64,
}

impl FixedBits {
    pub const fn is_valid(&self, value: u64) -> bool {
        value & self.must_be_one == self.must_be_one && value & !self.may_be_one == 0
    }

    /// Forces the fixed bits of `value`.
    pub const fn apply(&self, value: u64) -> u64 {
        (value | self.must_be_one) & self.may_be_one
    }
}

bitflags! {
    /// Activity states supported besides "active". (IA32_VMX_MISC bits 8:6)
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ActivityStates: u8 {
        const HLT = 1 << 0;
        const SHUTDOWN = 1 << 1;
        const WAIT_FOR_SIPI = 1 << 2;
    }
}

/// Miscellaneous data reported by IA32_VMX_MISC. (SDM Vol. 3D, Appendix A.6)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmxMisc {
    /// The preemption timer counts down every time this bit of the TSC changes.
    pub preemption_timer_rate: u8,
    pub stores_lma_on_exit: bool,
    pub activity_states: ActivityStates,
    pub max_cr3_targets: u16,
    /// Recommended maximum number of entries in each MSR load/store list.
    pub max_msr_list_size: u32,
    pub vmwrite_any_field: bool,
    pub zero_length_injection: bool,
    pub mseg_revision: u32,
}

impl VmxMisc {
    pub fn from_msr(raw: u64) -> Self {
        Self {
            preemption_timer_rate: raw.get_bits(0..5) as u8,
            stores_lma_on_exit: raw.get_bit(5),
            activity_states: ActivityStates::from_bits_truncate(raw.get_bits(6..9) as u8),
            max_cr3_targets: raw.get_bits(16..25) as u16,
            max_msr_list_size: 512 * (raw.get_bits(25..28) as u32 + 1),
            vmwrite_any_field: raw.get_bit(29),
            zero_length_injection: raw.get_bit(30),
            mseg_revision: raw.get_bits(32..64) as u32,
        }
    }
}

bitflags! {
    /// EPT and VPID capabilities. (SDM Vol. 3D, Appendix A.10)
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct EptVpidCapability: u64 {
        const EXECUTE_ONLY = 1 << 0;
        const PAGE_WALK_4 = 1 << 6;
        const PAGE_WALK_5 = 1 << 7;
        const MEMORY_TYPE_UC = 1 << 8;
        const MEMORY_TYPE_WB = 1 << 14;
        const PDE_2MB = 1 << 16;
        const PDPTE_1GB = 1 << 17;
        const INVEPT = 1 << 20;
        const ACCESSED_DIRTY = 1 << 21;
        const ADVANCED_EXIT_INFO = 1 << 22;
        const SUPERVISOR_SHADOW_STACK = 1 << 23;
        const INVEPT_SINGLE_CONTEXT = 1 << 25;
        const INVEPT_ALL_CONTEXT = 1 << 26;
        const INVVPID = 1 << 32;
        const INVVPID_INDIVIDUAL_ADDRESS = 1 << 40;
        const INVVPID_SINGLE_CONTEXT = 1 << 41;
        const INVVPID_ALL_CONTEXT = 1 << 42;
        const INVVPID_SINGLE_CONTEXT_RETAINING_GLOBALS = 1 << 43;
    }
}

/// The VMX capabilities of the processor, decoded once and shared by every
/// virtual CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxCapability {
    /// VMCS revision identifier, stamped at offset 0 of every VMCS and VMXON region.
    pub revision_id: u32,
    /// Number of bytes to allocate for VMCS and VMXON regions.
    pub region_size: u16,
    /// Memory type the processor uses to access the VMCS.
    pub memory_type: u8,
    /// Physical addresses of VMX regions are limited to 32 bits.
    pub is_32bit_address: bool,
    pub dual_monitor: bool,
    /// Exits due to INS/OUTS report instruction information.
    pub io_exit_info: bool,
    /// The `TRUE_*` control MSRs were used for the control capabilities.
    pub true_controls: bool,

    pub pinbased: ControlCapability,
    pub procbased: ControlCapability,
    /// Present only if the primary controls allow activating secondary controls.
    pub secondary: Option<ControlCapability>,
    pub exit: ControlCapability,
    pub entry: ControlCapability,

    pub misc: VmxMisc,
    pub cr0_fixed: FixedBits,
    pub cr4_fixed: FixedBits,
    /// Highest index value used for any VMCS encoding.
    pub max_vmcs_index: u16,
    /// Present only if the secondary controls allow EPT or VPID.
    pub ept_vpid: Option<EptVpidCapability>,
}

static CAPABILITY: Once<VmxCapability> = Once::new();

impl VmxCapability {
    pub const MEMORY_TYPE_WRITE_BACK: u8 = 6;
    const BASIC_TRUE_CONTROLS_BIT: usize = 55;

    fn secondary_allows_ept_or_vpid(procbased2: u64) -> bool {
        let allowed = ControlCapability::from_msr(procbased2);
        allowed.may_be_one
            & (SecondaryControls::ENABLE_EPT | SecondaryControls::ENABLE_VPID).bits()
            != 0
    }

    /// Decodes a capability snapshot from raw MSR values.
    pub fn from_msrs(msrs: &VmxCapabilityMsrs) -> Self {
        let basic = msrs.basic;
        let true_controls = basic.get_bit(Self::BASIC_TRUE_CONTROLS_BIT);
        let select = |default: u64, truth: u64| {
            ControlCapability::from_msr(if true_controls { truth } else { default })
        };

        let procbased = select(msrs.procbased, msrs.true_procbased);
        let secondary = procbased
            .allows(PrimaryControls::SECONDARY_CONTROLS.bits())
            .then(|| ControlCapability::from_msr(msrs.procbased2));
        let ept_vpid = secondary
            .filter(|_| Self::secondary_allows_ept_or_vpid(msrs.procbased2))
            .map(|_| EptVpidCapability::from_bits_retain(msrs.ept_vpid_cap));

        Self {
            revision_id: basic.get_bits(0..31) as u32,
            region_size: basic.get_bits(32..45) as u16,
            memory_type: basic.get_bits(50..54) as u8,
            is_32bit_address: basic.get_bit(48),
            dual_monitor: basic.get_bit(49),
            io_exit_info: basic.get_bit(54),
            true_controls,
            pinbased: select(msrs.pinbased, msrs.true_pinbased),
            procbased,
            secondary,
            exit: select(msrs.exit, msrs.true_exit),
            entry: select(msrs.entry, msrs.true_entry),
            misc: VmxMisc::from_msr(msrs.misc),
            cr0_fixed: FixedBits {
                must_be_one: msrs.cr0_fixed0,
                may_be_one: msrs.cr0_fixed1,
            },
            cr4_fixed: FixedBits {
                must_be_one: msrs.cr4_fixed0,
                may_be_one: msrs.cr4_fixed1,
            },
            max_vmcs_index: msrs.vmcs_enum.get_bits(1..10) as u16,
            ept_vpid,
        }
    }

    /// Probes the capabilities of the current processor.
    ///
    /// The MSRs are read on the first call only; every later call returns the
    /// same snapshot.
    pub fn probe() -> Result<&'static VmxCapability> {
        CAPABILITY.try_call_once(|| {
            if !has_hardware_support() {
                return Err(VmxError::UnsupportedFeature(
                    "CPU does not support feature VMX".into(),
                ));
            }
            let cap = Self::from_msrs(&VmxCapabilityMsrs::read());
            info!(
                "[HV] VMX capability: revision {:#x}, true controls {}, secondary {}, EPT/VPID {}",
                cap.revision_id,
                cap.true_controls,
                cap.secondary.is_some(),
                cap.ept_vpid.is_some()
            );
            Ok(cap)
        })
    }

    /// Rejects processors whose VMX regions this crate cannot set up.
    pub fn check_host_requirements(&self) -> Result {
        if self.region_size as usize > PAGE_SIZE {
            return Err(VmxError::UnsupportedFeature(
                "VMX region size is larger than 4K".into(),
            ));
        }
        if self.memory_type != Self::MEMORY_TYPE_WRITE_BACK {
            return Err(VmxError::UnsupportedFeature(
                "VMX memory type is not write-back".into(),
            ));
        }
        if self.is_32bit_address {
            return Err(VmxError::UnsupportedFeature(
                "32-bit VMX not supported".into(),
            ));
        }
        if !self.io_exit_info {
            return Err(VmxError::UnsupportedFeature(
                "IO exit info not supported".into(),
            ));
        }
        Ok(())
    }

    /// Whether the processor supports every capability in `caps`.
    pub fn supports(&self, caps: EptVpidCapability) -> bool {
        self.ept_vpid.is_some_and(|c| c.contains(caps))
    }
}
