use super::capability::{EptVpidCapability, VmxCapability};
use super::instructions::{InvalidationScope, VmxInstructions};
use super::structs::VmxRegion;
use crate::{Hal, HostPhysAddr, Result, VmxError};

/// Represents the per-CPU state for Virtual Machine Extensions (VMX).
///
/// One instance exists per hardware thread. Besides the VMXON region, it owns
/// the thread's "current VMCS" slot: at most one VMCS is current on a thread,
/// and [`VmcsRegion`](super::VmcsRegion) consults this slot before issuing
/// VMPTRLD or VMCLEAR.
#[derive(Debug)]
pub struct VmxPerCpuState<H: Hal, I: VmxInstructions> {
    cpu_id: usize,
    /// The VMCS revision identifier the processor reported when VMX was turned on.
    vmcs_revision_id: u32,
    vmxon_region: Option<VmxRegion<H>>,
    current_vmcs: Option<HostPhysAddr>,
    ept_vpid: Option<EptVpidCapability>,
    instructions: I,
}

impl<H: Hal, I: VmxInstructions> VmxPerCpuState<H, I> {
    pub fn new(cpu_id: usize, instructions: I) -> Result<Self> {
        Ok(Self {
            cpu_id,
            vmcs_revision_id: 0,
            vmxon_region: None,
            current_vmcs: None,
            ept_vpid: None,
            instructions,
        })
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    pub fn vmcs_revision_id(&self) -> u32 {
        self.vmcs_revision_id
    }

    /// Whether this hardware thread is in VMX root operation.
    pub fn is_enabled(&self) -> bool {
        self.vmxon_region.is_some()
    }

    /// The physical address of the VMCS current on this thread.
    pub fn current_vmcs(&self) -> Option<HostPhysAddr> {
        self.current_vmcs
    }

    /// Enters VMX root operation with VMXON.
    pub fn hardware_enable(&mut self, cap: &VmxCapability) -> Result {
        if self.is_enabled() {
            return Err(VmxError::VmxAlreadyEnabled);
        }
        cap.check_host_requirements()?;
        self.instructions.prepare_root_mode(cap)?;

        let region = match VmxRegion::new(cap.revision_id, false) {
            Ok(region) => region,
            Err(err) => {
                self.instructions.leave_root_mode();
                return Err(err);
            }
        };
        if let Err(err) = self.instructions.vmxon(region.phys_addr()) {
            self.instructions.leave_root_mode();
            error!("[HV] VMXON failed on CPU {}: {err}", self.cpu_id);
            return Err(err.into());
        }

        self.vmcs_revision_id = cap.revision_id;
        self.ept_vpid = cap.ept_vpid;
        self.vmxon_region = Some(region);
        info!("[HV] succeeded to turn on VMX on CPU {}.", self.cpu_id);
        Ok(())
    }

    /// Leaves VMX root operation with VMXOFF.
    ///
    /// The VMCS current on this thread must be cleared first.
    pub fn hardware_disable(&mut self) -> Result {
        if !self.is_enabled() {
            return Err(VmxError::VmxNotEnabled);
        }
        if let Some(current) = self.current_vmcs {
            warn!(
                "[HV] refusing VMXOFF on CPU {}, VMCS({current:#x}) is still current",
                self.cpu_id
            );
            return Err(VmxError::CurrentVmcsBusy { current });
        }

        self.instructions.vmxoff()?;
        self.instructions.leave_root_mode();
        self.vmxon_region = None;
        info!("[HV] succeeded to turn off VMX on CPU {}.", self.cpu_id);
        Ok(())
    }

    /// Invalidates cached EPT or VPID translations with INVEPT or INVVPID.
    pub fn invalidate(&mut self, scope: InvalidationScope) -> Result {
        if !self.is_enabled() {
            return Err(VmxError::VmxNotEnabled);
        }
        let required = scope.required_capability();
        if !self.ept_vpid.is_some_and(|cap| cap.contains(required)) {
            return Err(VmxError::UnsupportedFeature(alloc::format!(
                "{scope:?} not supported by the processor"
            )));
        }
        trace!("[HV] CPU {} invalidate {scope:?}", self.cpu_id);
        self.instructions.invalidate(scope)?;
        Ok(())
    }

    pub(crate) fn instructions(&self) -> &I {
        &self.instructions
    }

    pub(crate) fn instructions_mut(&mut self) -> &mut I {
        &mut self.instructions
    }

    pub(crate) fn acquire_current(&mut self, vmcs: HostPhysAddr) {
        self.current_vmcs = Some(vmcs);
    }

    pub(crate) fn release_current(&mut self, vmcs: HostPhysAddr) {
        if self.current_vmcs == Some(vmcs) {
            self.current_vmcs = None;
        }
    }
}

impl<H: Hal, I: VmxInstructions> Drop for VmxPerCpuState<H, I> {
    fn drop(&mut self) {
        if self.is_enabled() {
            if let Err(err) = self.hardware_disable() {
                warn!("[HV] failed to turn off VMX on CPU {}: {err}", self.cpu_id);
            }
        }
    }
}
