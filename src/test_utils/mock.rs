//! A software model of the VMX instructions and of host memory.
//!
//! All mock state is thread-local, so tests running in parallel do not see
//! each other. Call [`MockMmHal::reset`] at the start of every test.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use std::alloc::{Layout, alloc_zeroed, dealloc};

use crate::vmx::{
    InvalidationScope, VcpuExecutionState, VmFail, VmResult, VmcsField, VmcsFieldWidth,
    VmcsGuestNW, VmcsReadOnly32, VmcsReadOnlyNW, VmxCapability, VmxCapabilityMsrs,
    VmxExitReason, VmxInstructionError, VmxInstructions,
};
use crate::{GeneralRegisters, Hal, HostPhysAddr, HostVirtAddr, Result};

const FRAME_LAYOUT: Layout = match Layout::from_size_align(0x1000, 0x1000) {
    Ok(layout) => layout,
    Err(_) => panic!("bad frame layout"),
};

/// VM-entry interruption-information field.
const VMENTRY_INTERRUPTION_INFO: u32 = 0x4016;

#[derive(Debug, Default)]
struct MockVmcsMemory {
    fields: BTreeMap<u32, u64>,
    launched: bool,
}

thread_local! {
    static ALLOCATED_FRAMES: Cell<usize> = const { Cell::new(0) };
    static FAIL_NEXT_ALLOC: Cell<bool> = const { Cell::new(false) };
    static VMCS_MEMORY: RefCell<BTreeMap<HostPhysAddr, MockVmcsMemory>> =
        const { RefCell::new(BTreeMap::new()) };
    static SCRIPTED_EXITS: RefCell<VecDeque<ScriptedExit>> = const { RefCell::new(VecDeque::new()) };
    static FAIL_NEXT_ENTRY: Cell<Option<VmxInstructionError>> = const { Cell::new(None) };
}

/// Host memory backed by the test process heap. Physical and virtual
/// addresses are identical.
#[derive(Debug)]
pub struct MockMmHal;

impl MockMmHal {
    /// Resets all mock state of the calling thread.
    pub fn reset() {
        ALLOCATED_FRAMES.set(0);
        FAIL_NEXT_ALLOC.set(false);
        FAIL_NEXT_ENTRY.set(None);
        VMCS_MEMORY.with_borrow_mut(|memory| memory.clear());
        SCRIPTED_EXITS.with_borrow_mut(|exits| exits.clear());
    }

    /// Frames allocated and not yet returned.
    pub fn allocated_frames() -> usize {
        ALLOCATED_FRAMES.get()
    }

    pub fn fail_next_alloc() {
        FAIL_NEXT_ALLOC.set(true);
    }
}

impl Hal for MockMmHal {
    fn alloc_frame() -> Option<HostPhysAddr> {
        if FAIL_NEXT_ALLOC.replace(false) {
            return None;
        }
        let ptr = unsafe { alloc_zeroed(FRAME_LAYOUT) };
        if ptr.is_null() {
            return None;
        }
        ALLOCATED_FRAMES.set(ALLOCATED_FRAMES.get() + 1);
        // Fresh memory carries no VMCS data of an earlier frame at this address.
        VMCS_MEMORY.with_borrow_mut(|memory| memory.remove(&(ptr as HostPhysAddr)));
        Some(ptr as HostPhysAddr)
    }

    fn dealloc_frame(paddr: HostPhysAddr) {
        ALLOCATED_FRAMES.set(ALLOCATED_FRAMES.get() - 1);
        unsafe { dealloc(paddr as *mut u8, FRAME_LAYOUT) };
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        paddr
    }
}

/// The outcome of the next VM entry the mock performs.
#[derive(Debug, Clone)]
pub struct ScriptedExit {
    reason: u32,
    qualification: u64,
    fields: Vec<(u32, u64)>,
    regs: Option<GeneralRegisters>,
}

impl ScriptedExit {
    pub fn new(reason: VmxExitReason) -> Self {
        Self {
            reason: reason as u32,
            qualification: 0,
            fields: Vec::new(),
            regs: None,
        }
    }

    /// A VM exit that reports a failed VM entry.
    pub fn entry_failure(reason: VmxExitReason) -> Self {
        Self {
            reason: reason as u32 | (1 << 31),
            ..Self::new(reason)
        }
    }

    pub fn qualification(mut self, qualification: u64) -> Self {
        self.qualification = qualification;
        self
    }

    /// Sets a VMCS field as part of the exit.
    pub fn field<F: VmcsField>(mut self, field: F, value: u64) -> Self {
        self.fields.push((field.encoding(), value));
        self
    }

    /// The guest registers at the time of the exit.
    pub fn regs(mut self, regs: GeneralRegisters) -> Self {
        self.regs = Some(regs);
        self
    }
}

/// A VM entry the mock performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockEntry {
    /// VMLAUNCH rather than VMRESUME.
    pub launch: bool,
    /// The VMCS the entry used.
    pub vmcs: HostPhysAddr,
    /// The VM-entry interruption-information field at entry.
    pub injected: u32,
}

/// One hardware thread's VMX instructions, modelled after the SDM's
/// instruction descriptions. VMCS contents live in thread-local memory shared
/// by every `MockVmx` of the thread, so a VMCS can move between mock CPUs.
#[derive(Debug, Default)]
pub struct MockVmx {
    /// CR4.VMXE
    vmxe: bool,
    vmxon_region: Option<HostPhysAddr>,
    current: Option<HostPhysAddr>,
    invalidations: Vec<InvalidationScope>,
    entries: Vec<MockEntry>,
}

impl MockVmx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_root_mode(&self) -> bool {
        self.vmxon_region.is_some()
    }

    /// Whether VMX operation is prepared, as CR4.VMXE shows it.
    pub fn vmxe(&self) -> bool {
        self.vmxe
    }

    pub fn invalidations(&self) -> Vec<InvalidationScope> {
        self.invalidations.clone()
    }

    pub fn entries(&self) -> &[MockEntry] {
        &self.entries
    }

    /// Queues the outcome of a later VM entry. Entries without a scripted
    /// exit exit with HLT.
    pub fn script_exit(exit: ScriptedExit) {
        SCRIPTED_EXITS.with_borrow_mut(|exits| exits.push_back(exit));
    }

    /// Makes the next VMLAUNCH or VMRESUME fail with `VMfailValid(error)`.
    pub fn fail_next_entry(error: VmxInstructionError) {
        FAIL_NEXT_ENTRY.set(Some(error));
    }

    /// Reads a field straight from VMCS memory.
    pub fn peek<F: VmcsField>(vmcs: HostPhysAddr, field: F) -> Option<u64> {
        VMCS_MEMORY.with_borrow(|memory| {
            memory
                .get(&vmcs)
                .and_then(|m| m.fields.get(&field.encoding()).copied())
        })
    }

    /// Writes a field straight to VMCS memory, like the guest changing its state.
    pub fn poke<F: VmcsField>(vmcs: HostPhysAddr, field: F, value: u64) {
        VMCS_MEMORY.with_borrow_mut(|memory| {
            memory
                .entry(vmcs)
                .or_default()
                .fields
                .insert(field.encoding(), value);
        });
    }

    fn revision_of(region: HostPhysAddr) -> u32 {
        unsafe { (region as *const u32).read_volatile() & !(1 << 31) }
    }

    /// `VMfail(error)`: reported in the current VMCS if there is one.
    fn fail(&self, error: VmxInstructionError) -> VmFail {
        match self.current {
            Some(current) => {
                Self::poke(
                    current,
                    VmcsReadOnly32::VM_INSTRUCTION_ERROR,
                    error.code() as u64,
                );
                VmFail::FailValid(error)
            }
            None => VmFail::FailInvalid,
        }
    }

    fn root_mode(&self) -> VmResult {
        if self.in_root_mode() {
            Ok(())
        } else {
            Err(VmFail::FailInvalid)
        }
    }

    fn current(&self) -> VmResult<HostPhysAddr> {
        self.root_mode()?;
        self.current.ok_or(VmFail::FailInvalid)
    }

    fn run_guest(
        &mut self,
        vmcs: HostPhysAddr,
        launch: bool,
        state: &mut VcpuExecutionState,
    ) -> VmResult {
        if let Some(error) = FAIL_NEXT_ENTRY.take() {
            return Err(self.fail(error));
        }

        let injected = VMCS_MEMORY.with_borrow(|memory| {
            memory
                .get(&vmcs)
                .and_then(|m| m.fields.get(&VMENTRY_INTERRUPTION_INFO).copied())
                .unwrap_or(0)
        }) as u32;
        self.entries.push(MockEntry {
            launch,
            vmcs,
            injected,
        });

        let exit = SCRIPTED_EXITS
            .with_borrow_mut(|exits| exits.pop_front())
            .unwrap_or_else(|| {
                ScriptedExit::new(VmxExitReason::HLT)
                    .field(VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN, 1)
            });
        let entry_failure = exit.reason & (1 << 31) != 0;

        VMCS_MEMORY.with_borrow_mut(|memory| {
            let vmcs = memory.entry(vmcs).or_default();
            // A successful entry consumes the injected event.
            if !entry_failure {
                vmcs.fields.insert(VMENTRY_INTERRUPTION_INFO, injected as u64 & !(1 << 31));
            }
            for field in [
                VmcsReadOnly32::IDT_VECTORING_INFO,
                VmcsReadOnly32::VMEXIT_INTERRUPTION_INFO,
            ] {
                vmcs.fields.insert(field.encoding(), 0);
            }
            vmcs.fields
                .insert(VmcsReadOnly32::EXIT_REASON.encoding(), exit.reason as u64);
            vmcs.fields.insert(
                VmcsReadOnlyNW::EXIT_QUALIFICATION.encoding(),
                exit.qualification,
            );
            vmcs.fields
                .entry(VmcsGuestNW::RIP.encoding())
                .or_insert(0);
            for (field, value) in &exit.fields {
                vmcs.fields.insert(*field, *value);
            }
            if !entry_failure {
                vmcs.launched = true;
            }
        });
        if let Some(regs) = exit.regs {
            state.regs = regs;
        }
        Ok(())
    }
}

impl VmxInstructions for MockVmx {
    fn prepare_root_mode(&mut self, _cap: &VmxCapability) -> Result {
        self.vmxe = true;
        Ok(())
    }

    fn leave_root_mode(&mut self) {
        self.vmxe = false;
    }

    fn vmxon(&mut self, vmxon_region: HostPhysAddr) -> VmResult {
        if self.in_root_mode() {
            return Err(self.fail(VmxInstructionError::VMXON_IN_VMX_ROOT));
        }
        self.vmxon_region = Some(vmxon_region);
        Ok(())
    }

    fn vmxoff(&mut self) -> VmResult {
        self.root_mode()?;
        self.vmxon_region = None;
        self.current = None;
        Ok(())
    }

    fn vmclear(&mut self, vmcs: HostPhysAddr) -> VmResult {
        self.root_mode()?;
        if self.vmxon_region == Some(vmcs) {
            return Err(self.fail(VmxInstructionError::VMCLEAR_VMXON_POINTER));
        }
        VMCS_MEMORY.with_borrow_mut(|memory| memory.entry(vmcs).or_default().launched = false);
        if self.current == Some(vmcs) {
            self.current = None;
        }
        Ok(())
    }

    fn vmptrld(&mut self, vmcs: HostPhysAddr) -> VmResult {
        let vmxon_region = self.vmxon_region.ok_or(VmFail::FailInvalid)?;
        if vmcs == vmxon_region {
            return Err(self.fail(VmxInstructionError::VMPTRLD_VMXON_POINTER));
        }
        if Self::revision_of(vmcs) != Self::revision_of(vmxon_region) {
            return Err(self.fail(VmxInstructionError::VMPTRLD_INCORRECT_REVISION));
        }
        VMCS_MEMORY.with_borrow_mut(|memory| {
            memory.entry(vmcs).or_default();
        });
        self.current = Some(vmcs);
        Ok(())
    }

    fn vmptrst(&self) -> VmResult<Option<HostPhysAddr>> {
        self.root_mode()?;
        Ok(self.current)
    }

    fn vmread(&self, field: u32) -> VmResult<u64> {
        let vmcs = self.current()?;
        Ok(VMCS_MEMORY.with_borrow(|memory| {
            memory
                .get(&vmcs)
                .and_then(|m| m.fields.get(&field).copied())
                .unwrap_or(0)
        }))
    }

    fn vmwrite(&mut self, field: u32, value: u64) -> VmResult {
        let vmcs = self.current()?;
        // Bits 11:10 of the encoding give the field type, 1 is read-only data.
        if (field >> 10) & 0b11 == 1 {
            return Err(self.fail(VmxInstructionError::VMWRITE_READ_ONLY_COMPONENT));
        }
        let value = VmcsFieldWidth::from_encoding(field).truncate(value);
        VMCS_MEMORY.with_borrow_mut(|memory| {
            memory.entry(vmcs).or_default().fields.insert(field, value);
        });
        Ok(())
    }

    fn vmlaunch(&mut self, state: &mut VcpuExecutionState) -> VmResult {
        let vmcs = self.current()?;
        let launched = VMCS_MEMORY.with_borrow(|memory| memory.get(&vmcs).is_some_and(|m| m.launched));
        if launched {
            return Err(self.fail(VmxInstructionError::VMLAUNCH_NONCLEAR_VMCS));
        }
        self.run_guest(vmcs, true, state)
    }

    fn vmresume(&mut self, state: &mut VcpuExecutionState) -> VmResult {
        let vmcs = self.current()?;
        let launched = VMCS_MEMORY.with_borrow(|memory| memory.get(&vmcs).is_some_and(|m| m.launched));
        if !launched {
            return Err(self.fail(VmxInstructionError::VMRESUME_NONLAUNCHED_VMCS));
        }
        self.run_guest(vmcs, false, state)
    }

    fn invalidate(&mut self, scope: InvalidationScope) -> VmResult {
        self.root_mode()?;
        self.invalidations.push(scope);
        Ok(())
    }
}

/// Capability MSRs of a processor with true controls, secondary controls,
/// EPT and VPID.
pub fn sample_capability_msrs() -> VmxCapabilityMsrs {
    VmxCapabilityMsrs {
        // revision 0x12, 4K regions, write-back, IO exit info, true controls
        basic: 0x12 | (0x1000 << 32) | (6 << 50) | (1 << 54) | (1 << 55),
        pinbased: (0xff << 32) | 0x16,
        procbased: (0xfff9_fffe << 32) | 0x0401_e172,
        exit: (0x003f_ffff << 32) | 0x0003_6dff,
        entry: (0xffff << 32) | 0x11ff,
        misc: 0x0004_01e5,
        cr0_fixed0: 0x8000_0021,
        cr0_fixed1: 0xffff_ffff,
        cr4_fixed0: 0x2000,
        cr4_fixed1: 0x0037_27ff,
        vmcs_enum: 0x2e,
        procbased2: 0x3fff << 32,
        ept_vpid_cap: 0x0000_0f01_0673_4141,
        true_pinbased: (0xff << 32) | 0x16,
        true_procbased: (0xfff9_fffe << 32) | 0x0400_6172,
        true_exit: (0x003f_ffff << 32) | 0x0003_6dfb,
        true_entry: (0xffff << 32) | 0x11fb,
    }
}

pub fn sample_capability() -> VmxCapability {
    VmxCapability::from_msrs(&sample_capability_msrs())
}
