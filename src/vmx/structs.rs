use bitflags::bitflags;

use crate::mem::PhysFrame;
use crate::msr::Msr;
use crate::{Hal, HostPhysAddr, Result};

/// A 4K region used as VMXON region or VMCS, tagged with the VMCS revision
/// identifier. (SDM Vol. 3C, Section 26.2)
#[derive(Debug)]
pub struct VmxRegion<H: Hal> {
    frame: PhysFrame<H>,
}

impl<H: Hal> VmxRegion<H> {
    const SHADOW_INDICATOR: u32 = 1 << 31;

    pub fn new(revision_id: u32, shadow_indicator: bool) -> Result<Self> {
        let mut frame = PhysFrame::alloc_zero()?;
        let tag = if shadow_indicator {
            revision_id | Self::SHADOW_INDICATOR
        } else {
            revision_id & !Self::SHADOW_INDICATOR
        };
        frame.write_u32(0, tag);
        Ok(Self { frame })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }

    /// The revision identifier stored at offset 0.
    pub fn revision_id(&self) -> u32 {
        self.frame.read_u32(0) & !Self::SHADOW_INDICATOR
    }

    pub fn is_shadow(&self) -> bool {
        self.frame.read_u32(0) & Self::SHADOW_INDICATOR != 0
    }

    #[cfg(test)]
    pub(crate) fn overwrite_revision_id(&mut self, revision_id: u32) {
        self.frame.write_u32(0, revision_id);
    }
}

bitflags! {
    /// IA32_FEATURE_CONTROL flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureControlFlags: u64 {
        /// Lock bit: when set, locks this MSR from being written. when clear,
        /// VMXON causes a #GP.
        const LOCKED = 1 << 0;
        /// Enable VMX inside SMX operation.
        const VMXON_ENABLED_INSIDE_SMX = 1 << 1;
        /// Enable VMX outside SMX operation.
        const VMXON_ENABLED_OUTSIDE_SMX = 1 << 2;
    }
}

/// Control Features in Intel 64 Processor. (SDM Vol. 3C, Section 24.7)
pub struct FeatureControl;

impl FeatureControl {
    pub fn read() -> FeatureControlFlags {
        FeatureControlFlags::from_bits_truncate(Msr::IA32_FEATURE_CONTROL.read())
    }

    /// # Safety
    ///
    /// Once locked, the MSR cannot be written again until reset.
    pub unsafe fn write(flags: FeatureControlFlags) {
        let old = Msr::IA32_FEATURE_CONTROL.read() & !FeatureControlFlags::all().bits();
        unsafe { Msr::IA32_FEATURE_CONTROL.write(old | flags.bits()) };
    }
}
