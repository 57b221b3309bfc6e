use alloc::string::String;
use core::fmt;

use axerrno::AxError;

use crate::HostPhysAddr;
use crate::vmx::{ControlField, VmxInstructionError};

/// Errors raised by the VMX execution core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmxError {
    /// The processor lacks a feature the core depends on.
    UnsupportedFeature(String),
    /// Requested control bits are not allowed to be one by the capability MSRs.
    ConfigInvalid {
        field: ControlField,
        /// The requested bits outside the may-be-one mask.
        rejected: u32,
    },
    /// Secondary controls were requested without activating them in the
    /// primary processor-based controls.
    SecondaryControlsDisabled,
    /// A VMX instruction failed without a current VMCS (`VMfailInvalid`).
    VmFailInvalid,
    /// A VMX instruction failed with a current VMCS (`VMfailValid`).
    VmFailValid(VmxInstructionError),
    /// The revision identifier in a VMCS region does not match the processor's.
    RevisionMismatch { expected: u32, found: u32 },
    /// The VMCS is not current on the given hardware thread.
    VmcsNotCurrent,
    /// Another VMCS is already current on the given hardware thread.
    CurrentVmcsBusy { current: HostPhysAddr },
    /// The VMCS is current on another hardware thread and must be cleared there first.
    VmcsCurrentElsewhere { cpu_id: usize },
    /// The VMCS is in a state that does not permit the operation.
    BadVmcsState,
    /// VMX is already turned on on this hardware thread.
    VmxAlreadyEnabled,
    /// VMX is not turned on on this hardware thread.
    VmxNotEnabled,
    /// Failed to allocate memory for a VMX region.
    MemoryAllocationFailed,
    /// A bit-packed hardware field carries a reserved encoding.
    MalformedField { name: &'static str, raw: u64 },
    /// An argument is out of range.
    InvalidInput(&'static str),
}

/// A [`Result`](core::result::Result) type with [`VmxError`] as the error type.
pub type Result<T = ()> = core::result::Result<T, VmxError>;

impl fmt::Display for VmxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmxError::UnsupportedFeature(feature) => write!(f, "unsupported feature: {feature}"),
            VmxError::ConfigInvalid { field, rejected } => {
                write!(f, "{field:?} controls {rejected:#x} are not allowed by hardware")
            }
            VmxError::SecondaryControlsDisabled => {
                write!(f, "secondary controls requested but not activated")
            }
            VmxError::VmFailInvalid => write!(f, "VMX instruction failed: no current VMCS"),
            VmxError::VmFailValid(err) => write!(f, "VMX instruction failed: {err}"),
            VmxError::RevisionMismatch { expected, found } => write!(
                f,
                "VMCS revision mismatch: expected {expected:#x}, found {found:#x}"
            ),
            VmxError::VmcsNotCurrent => write!(f, "VMCS is not current on this processor"),
            VmxError::CurrentVmcsBusy { current } => {
                write!(f, "VMCS {current:#x} is already current on this processor")
            }
            VmxError::VmcsCurrentElsewhere { cpu_id } => {
                write!(f, "VMCS is current on processor {cpu_id}")
            }
            VmxError::BadVmcsState => write!(f, "VMCS is in a bad state"),
            VmxError::VmxAlreadyEnabled => write!(f, "VMX is already enabled"),
            VmxError::VmxNotEnabled => write!(f, "VMX is not enabled"),
            VmxError::MemoryAllocationFailed => write!(f, "failed to allocate VMX region"),
            VmxError::MalformedField { name, raw } => {
                write!(f, "malformed {name}: {raw:#x}")
            }
            VmxError::InvalidInput(what) => write!(f, "invalid {what}"),
        }
    }
}

impl From<VmxError> for AxError {
    fn from(err: VmxError) -> Self {
        match err {
            VmxError::UnsupportedFeature(_) => AxError::Unsupported,
            VmxError::ConfigInvalid { .. }
            | VmxError::SecondaryControlsDisabled
            | VmxError::MalformedField { .. }
            | VmxError::InvalidInput(_) => AxError::InvalidInput,
            VmxError::CurrentVmcsBusy { .. } | VmxError::VmcsCurrentElsewhere { .. } => {
                AxError::ResourceBusy
            }
            VmxError::MemoryAllocationFailed => AxError::NoMemory,
            _ => AxError::BadState,
        }
    }
}
