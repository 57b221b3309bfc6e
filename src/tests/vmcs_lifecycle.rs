//! VMCS lifecycle: clear, load, launch, resume and migration between
//! hardware threads.

use super::{MockCpu, enabled_cpu, enabled_cpu_keep_state};
use crate::test_utils::mock::{MockMmHal, MockVmx, ScriptedExit, sample_capability};
use crate::vmx::{
    DescriptorTable, GuestDescriptorTable, GuestSegment, LaunchState, Segment,
    VcpuExecutionState, VmcsGuest16, VmcsGuest32, VmcsGuestNW, VmcsReadOnly32, VmcsRegion,
    VmcsState, VmxExitReason, VmxInstructionError, VmxInstructions,
};
use crate::VmxError;

fn cleared_vmcs(cpu: &mut MockCpu) -> VmcsRegion<MockMmHal> {
    let mut vmcs = VmcsRegion::allocate(&sample_capability()).unwrap();
    vmcs.clear(cpu).unwrap();
    vmcs
}

fn current_on(cpu_id: usize, launch: LaunchState) -> VmcsState {
    VmcsState::Current { cpu_id, launch }
}

#[test]
fn test_launch_then_resume() {
    let mut cpu = enabled_cpu(0);
    let mut state = VcpuExecutionState::default();
    let mut vmcs = cleared_vmcs(&mut cpu);
    assert_eq!(vmcs.state(), VmcsState::Cleared);
    assert_eq!(vmcs.revision_id(), sample_capability().revision_id);

    vmcs.load(&mut cpu).unwrap();
    assert_eq!(vmcs.state(), current_on(0, LaunchState::Unlaunched));
    assert_eq!(cpu.current_vmcs(), Some(vmcs.phys_addr()));
    assert!(vmcs.is_current_on(&cpu));
    // loading it again changes nothing
    vmcs.load(&mut cpu).unwrap();

    vmcs.enter(&mut cpu, &mut state).unwrap();
    assert_eq!(vmcs.state(), current_on(0, LaunchState::Launched));
    vmcs.enter(&mut cpu, &mut state).unwrap();

    let launches: alloc::vec::Vec<bool> =
        cpu.instructions().entries().iter().map(|e| e.launch).collect();
    assert_eq!(launches, [true, false]);

    // VMCLEAR makes the next entry a launch again.
    vmcs.clear(&mut cpu).unwrap();
    assert_eq!(cpu.current_vmcs(), None);
    vmcs.load(&mut cpu).unwrap();
    vmcs.enter(&mut cpu, &mut state).unwrap();
    assert!(cpu.instructions().entries()[2].launch);

    vmcs.release(&mut cpu).unwrap();
    assert_eq!(cpu.current_vmcs(), None);
}

#[test]
fn test_launch_requires_cleared_vmcs() {
    let mut cpu = enabled_cpu(0);
    let mut state = VcpuExecutionState::default();
    let mut vmcs = VmcsRegion::<MockMmHal>::allocate(&sample_capability()).unwrap();
    assert_eq!(vmcs.state(), VmcsState::Uninitialized);

    assert_eq!(
        vmcs.launch(&mut cpu, &mut state),
        Err(VmxError::VmFailValid(
            VmxInstructionError::VMLAUNCH_NONCLEAR_VMCS
        ))
    );
    assert_eq!(vmcs.load(&mut cpu), Err(VmxError::BadVmcsState));
    assert!(cpu.instructions().entries().is_empty());
}

#[test]
fn test_launch_twice_fails() {
    let mut cpu = enabled_cpu(0);
    let mut state = VcpuExecutionState::default();
    let mut vmcs = cleared_vmcs(&mut cpu);
    vmcs.load(&mut cpu).unwrap();
    vmcs.launch(&mut cpu, &mut state).unwrap();

    assert_eq!(
        vmcs.launch(&mut cpu, &mut state),
        Err(VmxError::VmFailValid(
            VmxInstructionError::VMLAUNCH_NONCLEAR_VMCS
        ))
    );
    assert_eq!(vmcs.state(), current_on(0, LaunchState::Launched));
    assert_eq!(cpu.instructions().entries().len(), 1);
    vmcs.release(&mut cpu).unwrap();
}

#[test]
fn test_resume_unlaunched_fails() {
    let mut cpu = enabled_cpu(0);
    let mut state = VcpuExecutionState::default();
    let mut vmcs = cleared_vmcs(&mut cpu);
    vmcs.load(&mut cpu).unwrap();

    assert_eq!(
        vmcs.resume(&mut cpu, &mut state),
        Err(VmxError::VmFailValid(
            VmxInstructionError::VMRESUME_NONLAUNCHED_VMCS
        ))
    );
    assert_eq!(vmcs.state(), current_on(0, LaunchState::Unlaunched));
    assert!(cpu.instructions().entries().is_empty());
    vmcs.release(&mut cpu).unwrap();
}

#[test]
fn test_entry_failure_keeps_unlaunched() {
    let mut cpu = enabled_cpu(0);
    let mut state = VcpuExecutionState::default();
    let mut vmcs = cleared_vmcs(&mut cpu);
    vmcs.load(&mut cpu).unwrap();

    MockVmx::script_exit(ScriptedExit::entry_failure(
        VmxExitReason::INVALID_GUEST_STATE,
    ));
    vmcs.enter(&mut cpu, &mut state).unwrap();
    assert_eq!(vmcs.state(), current_on(0, LaunchState::Unlaunched));

    // The retry is a VMLAUNCH again.
    vmcs.enter(&mut cpu, &mut state).unwrap();
    let entries = cpu.instructions().entries();
    assert!(entries[0].launch && entries[1].launch);
    assert_eq!(vmcs.state(), current_on(0, LaunchState::Launched));
    vmcs.release(&mut cpu).unwrap();
}

#[test]
fn test_instruction_error_reported_by_entry() {
    let mut cpu = enabled_cpu(0);
    let mut state = VcpuExecutionState::default();
    let mut vmcs = cleared_vmcs(&mut cpu);
    vmcs.load(&mut cpu).unwrap();

    MockVmx::fail_next_entry(VmxInstructionError::ENTRY_INVALID_CONTROL_FIELDS);
    assert_eq!(
        vmcs.enter(&mut cpu, &mut state),
        Err(VmxError::VmFailValid(
            VmxInstructionError::ENTRY_INVALID_CONTROL_FIELDS
        ))
    );
    assert_eq!(vmcs.state(), current_on(0, LaunchState::Unlaunched));
    assert_eq!(
        vmcs.read(&cpu, VmcsReadOnly32::VM_INSTRUCTION_ERROR),
        Ok(VmxInstructionError::ENTRY_INVALID_CONTROL_FIELDS.code())
    );
    vmcs.release(&mut cpu).unwrap();
}

#[test]
fn test_one_current_vmcs_per_cpu() {
    let mut cpu = enabled_cpu(0);
    let mut first = cleared_vmcs(&mut cpu);
    let mut second = cleared_vmcs(&mut cpu);

    first.load(&mut cpu).unwrap();
    assert_eq!(
        second.load(&mut cpu),
        Err(VmxError::CurrentVmcsBusy {
            current: first.phys_addr()
        })
    );
    assert_eq!(second.state(), VmcsState::Cleared);

    first.clear(&mut cpu).unwrap();
    second.load(&mut cpu).unwrap();
    assert_eq!(cpu.current_vmcs(), Some(second.phys_addr()));
    assert!(!first.is_current_on(&cpu));

    first.release(&mut cpu).unwrap();
    second.release(&mut cpu).unwrap();
}

#[test]
fn test_migration_between_cpus() {
    let mut cpu0 = enabled_cpu(0);
    let mut cpu1 = enabled_cpu_keep_state(1);
    let mut state = VcpuExecutionState::default();
    let mut vmcs = cleared_vmcs(&mut cpu0);

    vmcs.load(&mut cpu0).unwrap();
    vmcs.write(&mut cpu0, VmcsGuestNW::RIP, 0x7c00).unwrap();
    vmcs.enter(&mut cpu0, &mut state).unwrap();

    let elsewhere = Err(VmxError::VmcsCurrentElsewhere { cpu_id: 0 });
    assert_eq!(vmcs.load(&mut cpu1), elsewhere);
    assert_eq!(vmcs.clear(&mut cpu1), elsewhere);
    assert_eq!(vmcs.enter(&mut cpu1, &mut state), elsewhere);
    assert_eq!(
        vmcs.read(&cpu1, VmcsGuestNW::RIP),
        Err(VmxError::VmcsNotCurrent)
    );

    vmcs.clear(&mut cpu0).unwrap();
    vmcs.load(&mut cpu1).unwrap();
    assert_eq!(vmcs.state(), current_on(1, LaunchState::Unlaunched));
    assert_eq!(cpu0.current_vmcs(), None);
    // The guest state went along with the VMCS.
    assert_eq!(vmcs.read(&cpu1, VmcsGuestNW::RIP), Ok(0x7c00));

    vmcs.enter(&mut cpu1, &mut state).unwrap();
    assert!(cpu1.instructions().entries()[0].launch);
    vmcs.release(&mut cpu1).unwrap();
}

#[test]
fn test_revision_mismatch() {
    let mut cpu = enabled_cpu(0);
    let mut vmcs = cleared_vmcs(&mut cpu);
    vmcs.region_mut().overwrite_revision_id(0x99);

    assert_eq!(
        vmcs.load(&mut cpu),
        Err(VmxError::RevisionMismatch {
            expected: sample_capability().revision_id,
            found: 0x99,
        })
    );
    assert_eq!(vmcs.state(), VmcsState::Cleared);
    assert_eq!(cpu.current_vmcs(), None);
}

#[test]
fn test_field_access_requires_current() {
    let mut cpu = enabled_cpu(0);
    let mut vmcs = cleared_vmcs(&mut cpu);

    assert_eq!(
        vmcs.read(&cpu, VmcsGuestNW::RIP),
        Err(VmxError::VmcsNotCurrent)
    );
    assert_eq!(
        vmcs.write(&mut cpu, VmcsGuestNW::RIP, 0x1000),
        Err(VmxError::VmcsNotCurrent)
    );

    vmcs.load(&mut cpu).unwrap();
    vmcs.write(&mut cpu, VmcsGuestNW::RIP, 0x1000).unwrap();
    assert_eq!(vmcs.read(&cpu, VmcsGuestNW::RIP), Ok(0x1000));
    vmcs.release(&mut cpu).unwrap();
}

#[test]
fn test_vmx_must_be_enabled() {
    MockMmHal::reset();
    let mut cpu = MockCpu::new(0, MockVmx::new()).unwrap();
    let mut vmcs = VmcsRegion::<MockMmHal>::allocate(&sample_capability()).unwrap();
    assert_eq!(vmcs.clear(&mut cpu), Err(VmxError::VmxNotEnabled));
    assert_eq!(vmcs.state(), VmcsState::Uninitialized);
}

#[test]
fn test_release_frees_memory() {
    let mut cpu = enabled_cpu(0);
    // the VMXON region
    assert_eq!(MockMmHal::allocated_frames(), 1);

    let mut vmcs = cleared_vmcs(&mut cpu);
    vmcs.load(&mut cpu).unwrap();
    assert_eq!(MockMmHal::allocated_frames(), 2);

    vmcs.release(&mut cpu).unwrap();
    assert_eq!(cpu.current_vmcs(), None);
    assert_eq!(MockMmHal::allocated_frames(), 1);

    cpu.hardware_disable().unwrap();
    assert_eq!(MockMmHal::allocated_frames(), 0);
}

#[test]
fn test_release_elsewhere_hands_vmcs_back() {
    let mut cpu0 = enabled_cpu(0);
    let mut cpu1 = enabled_cpu_keep_state(1);
    let mut vmcs = cleared_vmcs(&mut cpu0);
    vmcs.load(&mut cpu0).unwrap();
    let paddr = vmcs.phys_addr();
    // two VMXON regions and the VMCS
    assert_eq!(MockMmHal::allocated_frames(), 3);

    let (vmcs, err) = vmcs.release(&mut cpu1).unwrap_err();
    assert_eq!(err, VmxError::VmcsCurrentElsewhere { cpu_id: 0 });
    assert_eq!(vmcs.phys_addr(), paddr);
    assert_eq!(vmcs.state(), current_on(0, LaunchState::Unlaunched));
    assert_eq!(MockMmHal::allocated_frames(), 3);
    assert_eq!(cpu0.current_vmcs(), Some(paddr));
    assert_eq!(cpu1.current_vmcs(), None);

    // The owner can still release it and leave VMX operation.
    vmcs.release(&mut cpu0).unwrap();
    assert_eq!(cpu0.current_vmcs(), None);
    assert_eq!(MockMmHal::allocated_frames(), 2);
    cpu0.hardware_disable().unwrap();
    cpu1.hardware_disable().unwrap();
    assert_eq!(MockMmHal::allocated_frames(), 0);
}

#[test]
fn test_drop_while_current_leaks_vmcs() {
    let mut cpu = enabled_cpu(0);
    let mut vmcs = cleared_vmcs(&mut cpu);
    vmcs.load(&mut cpu).unwrap();
    let paddr = vmcs.phys_addr();
    assert_eq!(MockMmHal::allocated_frames(), 2);

    drop(vmcs);
    assert_eq!(MockMmHal::allocated_frames(), 2);
    assert_eq!(cpu.current_vmcs(), Some(paddr));
    assert_eq!(
        cpu.hardware_disable(),
        Err(VmxError::CurrentVmcsBusy { current: paddr })
    );
}

#[test]
fn test_drop_cleared_vmcs_frees_memory() {
    let mut cpu = enabled_cpu(0);
    let vmcs = cleared_vmcs(&mut cpu);
    assert_eq!(MockMmHal::allocated_frames(), 2);
    drop(vmcs);
    assert_eq!(MockMmHal::allocated_frames(), 1);
}

#[test]
fn test_segment_access() {
    let mut cpu = enabled_cpu(0);
    let mut vmcs = cleared_vmcs(&mut cpu);
    vmcs.load(&mut cpu).unwrap();
    let paddr = vmcs.phys_addr();

    let code = Segment::new(0x8, 0x1000, 0xffff_ffff, 0xa09b);
    vmcs.write_segment(&mut cpu, GuestSegment::Cs, code).unwrap();
    assert_eq!(MockVmx::peek(paddr, VmcsGuest16::CS_SELECTOR), Some(0x8));
    assert_eq!(vmcs.read_segment(&cpu, GuestSegment::Cs), Ok(code));

    // A null segment is written as unusable and reads back as access rights 0.
    vmcs.write_segment(&mut cpu, GuestSegment::Fs, Segment::default())
        .unwrap();
    assert_eq!(
        MockVmx::peek(paddr, VmcsGuest32::FS_ACCESS_RIGHTS),
        Some(0x10000)
    );
    let fs = vmcs.read_segment(&cpu, GuestSegment::Fs).unwrap();
    assert!(!fs.is_usable());
    assert_eq!(fs, Segment::default());

    // Unusable set by the processor, with other access-rights bits left over.
    MockVmx::poke(paddr, VmcsGuest32::GS_ACCESS_RIGHTS, 0x1_c093);
    assert_eq!(
        vmcs.read_segment(&cpu, GuestSegment::Gs).map(|s| s.access_rights),
        Ok(0)
    );

    let idt = DescriptorTable {
        base: 0xffff_8000_0000_1000,
        limit: 0xfff,
    };
    vmcs.write_descriptor_table(&mut cpu, GuestDescriptorTable::Idtr, idt)
        .unwrap();
    assert_eq!(
        vmcs.read_descriptor_table(&cpu, GuestDescriptorTable::Idtr),
        Ok(idt)
    );
    assert_eq!(MockVmx::peek(paddr, VmcsGuest32::IDTR_LIMIT), Some(0xfff));

    vmcs.release(&mut cpu).unwrap();
}

#[test]
fn test_writes_keep_field_width() {
    let mut cpu = enabled_cpu(0);
    let mut vmcs = cleared_vmcs(&mut cpu);
    vmcs.load(&mut cpu).unwrap();
    cpu.instructions_mut()
        .vmwrite(VmcsGuest16::SS_SELECTOR as u32, 0xdead_0010)
        .unwrap();
    assert_eq!(vmcs.read(&cpu, VmcsGuest16::SS_SELECTOR), Ok(0x10));
    vmcs.release(&mut cpu).unwrap();
}

#[test]
fn test_dump_requires_current() {
    let mut cpu = enabled_cpu(0);
    let mut vmcs = cleared_vmcs(&mut cpu);
    assert_eq!(vmcs.dump(&cpu), Err(VmxError::VmcsNotCurrent));

    vmcs.load(&mut cpu).unwrap();
    assert_eq!(vmcs.dump(&cpu), Ok(()));
    vmcs.release(&mut cpu).unwrap();
}
