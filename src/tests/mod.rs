//! Tests that drive several parts of the crate together against the mock
//! VMX instructions.

mod vmcs_lifecycle;

use crate::test_utils::mock::{MockMmHal, MockVmx, sample_capability};
use crate::vmx::VmxPerCpuState;

type MockCpu = VmxPerCpuState<MockMmHal, MockVmx>;

/// A hardware thread in VMX root operation, with fresh mock state.
fn enabled_cpu(cpu_id: usize) -> MockCpu {
    MockMmHal::reset();
    enabled_cpu_keep_state(cpu_id)
}

/// Like [`enabled_cpu`], but shares the mock state with other CPUs of the test.
fn enabled_cpu_keep_state(cpu_id: usize) -> MockCpu {
    let mut cpu = MockCpu::new(cpu_id, MockVmx::new()).unwrap();
    cpu.hardware_enable(&sample_capability()).unwrap();
    cpu
}
