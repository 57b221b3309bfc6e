use core::fmt;

use super::capability::{EptVpidCapability, VmxCapability};
use super::definitions::VmxInstructionError;
use super::vcpu::VcpuExecutionState;
use crate::{HostPhysAddr, Result, VmxError};

/// Failure of a VMX instruction. (SDM Vol. 3C, Section 31.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmFail {
    /// `VMfailInvalid`: CF is set, there is no current VMCS to report the error in.
    FailInvalid,
    /// `VMfailValid`: ZF is set, the error number was stored in the current VMCS.
    FailValid(VmxInstructionError),
}

pub type VmResult<T = ()> = core::result::Result<T, VmFail>;

impl From<VmFail> for VmxError {
    fn from(fail: VmFail) -> Self {
        match fail {
            VmFail::FailInvalid => VmxError::VmFailInvalid,
            VmFail::FailValid(err) => VmxError::VmFailValid(err),
        }
    }
}

impl fmt::Display for VmFail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmFail::FailInvalid => write!(f, "VMfailInvalid"),
            VmFail::FailValid(err) => write!(f, "VMfailValid: {err}"),
        }
    }
}

/// The type and operands of an INVEPT or INVVPID. (SDM Vol. 3C, Section 29.4.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationScope {
    /// INVEPT type 1: mappings tagged with one EPTP.
    EptSingleContext { eptp: u64 },
    /// INVEPT type 2: mappings of all EPTPs.
    EptAllContexts,
    /// INVVPID type 0: one linear address of one VPID.
    VpidIndividualAddress { vpid: u16, address: u64 },
    /// INVVPID type 1: all mappings of one VPID.
    VpidSingleContext { vpid: u16 },
    /// INVVPID type 2: all mappings of every VPID except 0.
    VpidAllContexts,
    /// INVVPID type 3: one VPID, keeping global translations.
    VpidSingleContextRetainingGlobals { vpid: u16 },
}

impl InvalidationScope {
    /// The instruction type operand.
    pub fn invalidation_type(&self) -> u64 {
        match self {
            InvalidationScope::VpidIndividualAddress { .. } => 0,
            InvalidationScope::EptSingleContext { .. }
            | InvalidationScope::VpidSingleContext { .. } => 1,
            InvalidationScope::EptAllContexts | InvalidationScope::VpidAllContexts => 2,
            InvalidationScope::VpidSingleContextRetainingGlobals { .. } => 3,
        }
    }

    /// The 128-bit descriptor operand, as `[low, high]`.
    pub fn descriptor(&self) -> [u64; 2] {
        match *self {
            InvalidationScope::EptSingleContext { eptp } => [eptp, 0],
            InvalidationScope::VpidIndividualAddress { vpid, address } => [vpid as u64, address],
            InvalidationScope::VpidSingleContext { vpid }
            | InvalidationScope::VpidSingleContextRetainingGlobals { vpid } => [vpid as u64, 0],
            InvalidationScope::EptAllContexts | InvalidationScope::VpidAllContexts => [0, 0],
        }
    }

    pub fn is_ept(&self) -> bool {
        matches!(
            self,
            InvalidationScope::EptSingleContext { .. } | InvalidationScope::EptAllContexts
        )
    }

    /// The capabilities the processor must report for this invalidation.
    pub fn required_capability(&self) -> EptVpidCapability {
        use EptVpidCapability as Cap;
        match self {
            InvalidationScope::EptSingleContext { .. } => Cap::INVEPT | Cap::INVEPT_SINGLE_CONTEXT,
            InvalidationScope::EptAllContexts => Cap::INVEPT | Cap::INVEPT_ALL_CONTEXT,
            InvalidationScope::VpidIndividualAddress { .. } => {
                Cap::INVVPID | Cap::INVVPID_INDIVIDUAL_ADDRESS
            }
            InvalidationScope::VpidSingleContext { .. } => Cap::INVVPID | Cap::INVVPID_SINGLE_CONTEXT,
            InvalidationScope::VpidAllContexts => Cap::INVVPID | Cap::INVVPID_ALL_CONTEXT,
            InvalidationScope::VpidSingleContextRetainingGlobals { .. } => {
                Cap::INVVPID | Cap::INVVPID_SINGLE_CONTEXT_RETAINING_GLOBALS
            }
        }
    }
}

/// The VMX instruction set of one hardware thread.
///
/// Every method maps to one instruction and reports its tri-state outcome. The
/// callers in this crate check the VMCS lifecycle before issuing anything, so
/// an implementation only has to execute the instruction.
pub trait VmxInstructions {
    /// Prepares the processor for VMXON (feature control, CR4.VMXE).
    fn prepare_root_mode(&mut self, _cap: &VmxCapability) -> Result {
        Ok(())
    }

    /// Undoes [`VmxInstructions::prepare_root_mode`] after VMXOFF.
    fn leave_root_mode(&mut self) {}

    fn vmxon(&mut self, vmxon_region: HostPhysAddr) -> VmResult;
    fn vmxoff(&mut self) -> VmResult;
    fn vmclear(&mut self, vmcs: HostPhysAddr) -> VmResult;
    fn vmptrld(&mut self, vmcs: HostPhysAddr) -> VmResult;
    /// Returns the current-VMCS pointer, `None` if there is no current VMCS.
    fn vmptrst(&self) -> VmResult<Option<HostPhysAddr>>;
    fn vmread(&self, field: u32) -> VmResult<u64>;
    fn vmwrite(&mut self, field: u32, value: u64) -> VmResult;

    /// Launches the current VMCS, running the guest with the registers in
    /// `state` until the next VM exit, which stores them back.
    fn vmlaunch(&mut self, state: &mut VcpuExecutionState) -> VmResult;
    /// Resumes the current VMCS. See [`VmxInstructions::vmlaunch`].
    fn vmresume(&mut self, state: &mut VcpuExecutionState) -> VmResult;

    /// Executes INVEPT or INVVPID.
    fn invalidate(&mut self, scope: InvalidationScope) -> VmResult;
}
