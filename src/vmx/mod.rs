mod capability;
mod controls;
mod definitions;
mod exit;
mod instructions;
mod interrupt;
mod percpu;
mod structs;
mod vcpu;
mod vmcs;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod hardware;
        pub use self::hardware::HardwareVmx;
    }
}

pub use self::capability::{
    ActivityStates, ControlCapability, EptVpidCapability, FixedBits, VmxCapability,
    VmxCapabilityMsrs, VmxMisc,
};
pub use self::controls::{
    ControlField, ControlFieldSet, ControlRequest, EntryControls, ExitControls,
    PinbasedControls, PrimaryControls, SecondaryControls,
};
pub use self::definitions::{VmxExitReason, VmxInstructionError};
pub use self::exit::{
    ApicAccessType, CrAccessType, DecodedExit, EntryFailureReason, EptViolationInfo, ExitReason,
    InstructionInfo, TaskSwitchSource, VmxApicAccessInfo, VmxCrAccessInfo, VmxDrAccessInfo,
    VmxExitInfo, VmxIoExitInfo, VmxTaskSwitchInfo,
};
pub use self::instructions::{InvalidationScope, VmFail, VmResult, VmxInstructions};
pub use self::interrupt::{InterruptionInfo, InterruptionType, VectoredEvent};
pub use self::percpu::VmxPerCpuState;
pub use self::structs::VmxRegion;
pub use self::vcpu::{ExitRequest, VcpuConfig, VcpuExecutionState, VmxVcpu};
pub use self::vmcs::{
    ActivityState, DescriptorTable, GuestDescriptorTable, GuestSegment, LaunchState, Segment,
    VmcsControl16, VmcsControl32, VmcsControl64, VmcsControlNW, VmcsField, VmcsFieldWidth,
    VmcsGuest16, VmcsGuest32, VmcsGuest64, VmcsGuestNW, VmcsHost16, VmcsHost32, VmcsHost64,
    VmcsHostNW, VmcsReadOnly32, VmcsReadOnly64, VmcsReadOnlyNW, VmcsRegion, VmcsState,
    WritableVmcsField,
};

/// Return if current platform support virtualization extension.
pub fn has_hardware_support() -> bool {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            if let Some(feature) = raw_cpuid::CpuId::new().get_feature_info() {
                feature.has_vmx()
            } else {
                false
            }
        } else {
            false
        }
    }
}
