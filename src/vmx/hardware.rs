//! [`VmxInstructions`] backed by the processor.

use core::arch::{asm, global_asm};
use core::marker::PhantomData;
use core::mem::offset_of;

use bit_field::BitField;
use x86::bits64::vmx;
use x86::dtables::{self, DescriptorTablePointer};
use x86::segmentation::{self, SegmentSelector};
use x86_64::registers::control::{Cr0, Cr3, Cr4, Cr4Flags};

use super::capability::VmxCapability;
use super::definitions::VmxInstructionError;
use super::instructions::{InvalidationScope, VmFail, VmResult, VmxInstructions};
use super::structs::{FeatureControl, FeatureControlFlags};
use super::vcpu::VcpuExecutionState;
use super::vmcs::{
    VmcsField, VmcsHost16, VmcsHost32, VmcsHost64, VmcsHostNW, VmcsReadOnly32, WritableVmcsField,
};
use crate::msr::Msr;
use crate::regs::GeneralRegisters;
use crate::{HostPhysAddr, Result, VmxError};

/// The VMX instructions of the hardware thread this value lives on.
///
/// Not `Send`: VMX state belongs to one hardware thread.
#[derive(Debug)]
pub struct HardwareVmx {
    _not_send: PhantomData<*const ()>,
}

impl HardwareVmx {
    /// # Safety
    ///
    /// Must run at CPL 0, and the value must only be used on the hardware
    /// thread it was created on, by one [`VmxPerCpuState`](super::VmxPerCpuState).
    pub unsafe fn new() -> Self {
        Self {
            _not_send: PhantomData,
        }
    }

    /// Converts an x86 crate failure, fetching the error number for `VMfailValid`.
    fn check(result: x86::vmx::Result<()>) -> VmResult {
        result.map_err(Self::map_fail)
    }

    fn map_fail(err: x86::vmx::VmFail) -> VmFail {
        match err {
            x86::vmx::VmFail::VmFailInvalid => VmFail::FailInvalid,
            x86::vmx::VmFail::VmFailValid => VmFail::FailValid(Self::instruction_error()),
        }
    }

    fn instruction_error() -> VmxInstructionError {
        let code = unsafe { vmx::vmread(VmcsReadOnly32::VM_INSTRUCTION_ERROR.encoding()) }
            .unwrap_or(0);
        VmxInstructionError::from(code as u32)
    }

    fn write_host<F: WritableVmcsField>(field: F, value: F::Value) -> VmResult {
        Self::check(unsafe { vmx::vmwrite(field.encoding(), F::into_raw(value)) })
    }

    /// Fills the host-state area from this thread, so that the next VM exit
    /// comes back to [`vmx_exit`] with the current segments, tables and
    /// control registers. HOST_RSP is written by the entry trampoline.
    fn setup_vmcs_host(&mut self) -> VmResult {
        let mut gdtp = DescriptorTablePointer::<u64>::default();
        let mut idtp = DescriptorTablePointer::<u64>::default();
        unsafe {
            dtables::sgdt(&mut gdtp);
            dtables::sidt(&mut idtp);
        }
        let tr = unsafe { x86::task::tr() };

        let selectors = [
            (VmcsHost16::ES_SELECTOR, segmentation::es()),
            (VmcsHost16::CS_SELECTOR, segmentation::cs()),
            (VmcsHost16::SS_SELECTOR, segmentation::ss()),
            (VmcsHost16::DS_SELECTOR, segmentation::ds()),
            (VmcsHost16::FS_SELECTOR, segmentation::fs()),
            (VmcsHost16::GS_SELECTOR, segmentation::gs()),
            (VmcsHost16::TR_SELECTOR, tr),
        ];
        for (field, selector) in selectors {
            Self::write_host(field, selector.bits())?;
        }

        for (field, msr) in [
            (VmcsHost64::IA32_PAT, Msr::IA32_PAT),
            (VmcsHost64::IA32_EFER, Msr::IA32_EFER),
        ] {
            Self::write_host(field, msr.read())?;
        }
        Self::write_host(
            VmcsHost32::IA32_SYSENTER_CS,
            Msr::IA32_SYSENTER_CS.read() as u32,
        )?;

        // SAFETY: SGDT reports the GDT this thread runs on.
        let gdt = unsafe { gdt_entries(&gdtp) };
        let natural = [
            (VmcsHostNW::CR0, Cr0::read_raw() as usize),
            (
                VmcsHostNW::CR3,
                Cr3::read_raw().0.start_address().as_u64() as usize,
            ),
            (VmcsHostNW::CR4, Cr4::read_raw() as usize),
            (VmcsHostNW::FS_BASE, Msr::IA32_FS_BASE.read() as usize),
            (VmcsHostNW::GS_BASE, Msr::IA32_GS_BASE.read() as usize),
            (VmcsHostNW::TR_BASE, tss_base(gdt, tr)),
            (VmcsHostNW::GDTR_BASE, gdtp.base as usize),
            (VmcsHostNW::IDTR_BASE, idtp.base as usize),
            (
                VmcsHostNW::IA32_SYSENTER_ESP,
                Msr::IA32_SYSENTER_ESP.read() as usize,
            ),
            (
                VmcsHostNW::IA32_SYSENTER_EIP,
                Msr::IA32_SYSENTER_EIP.read() as usize,
            ),
            (VmcsHostNW::RIP, vmx_exit as usize),
        ];
        for (field, value) in natural {
            Self::write_host(field, value)?;
        }
        Ok(())
    }

    fn enter(&mut self, state: &mut VcpuExecutionState, resume: bool) -> VmResult {
        self.setup_vmcs_host()?;
        match unsafe { vmx_entry(state, resume as u64) } {
            0 => Ok(()),
            1 => Err(VmFail::FailInvalid),
            _ => Err(VmFail::FailValid(Self::instruction_error())),
        }
    }
}

impl VmxInstructions for HardwareVmx {
    fn prepare_root_mode(&mut self, cap: &VmxCapability) -> Result {
        // Enable VMXON, if required.
        let ctrl = FeatureControl::read();
        let locked = ctrl.contains(FeatureControlFlags::LOCKED);
        let vmxon_outside = ctrl.contains(FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX);
        if !locked {
            unsafe {
                FeatureControl::write(
                    ctrl | FeatureControlFlags::LOCKED
                        | FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX,
                )
            }
        } else if !vmxon_outside {
            return Err(VmxError::UnsupportedFeature("VMX disabled by BIOS".into()));
        }

        // Check control registers are in a VMX-friendly state. (SDM Vol. 3C, Appendix A.7, A.8)
        if !cap.cr0_fixed.is_valid(Cr0::read_raw()) {
            return Err(VmxError::UnsupportedFeature(
                "host CR0 is not valid in VMX operation".into(),
            ));
        }
        let cr4 = Cr4::read_raw() | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
        if !cap.cr4_fixed.is_valid(cr4) {
            return Err(VmxError::UnsupportedFeature(
                "host CR4 is not valid in VMX operation".into(),
            ));
        }

        unsafe { Cr4::write_raw(cr4) };
        Ok(())
    }

    fn leave_root_mode(&mut self) {
        unsafe { Cr4::update(|cr4| cr4.remove(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS)) };
    }

    fn vmxon(&mut self, vmxon_region: HostPhysAddr) -> VmResult {
        Self::check(unsafe { vmx::vmxon(vmxon_region as u64) })
    }

    fn vmxoff(&mut self) -> VmResult {
        Self::check(unsafe { vmx::vmxoff() })
    }

    fn vmclear(&mut self, vmcs: HostPhysAddr) -> VmResult {
        Self::check(unsafe { vmx::vmclear(vmcs as u64) })
    }

    fn vmptrld(&mut self, vmcs: HostPhysAddr) -> VmResult {
        Self::check(unsafe { vmx::vmptrld(vmcs as u64) })
    }

    fn vmptrst(&self) -> VmResult<Option<HostPhysAddr>> {
        let ptr = unsafe { vmx::vmptrst() }.map_err(|_| VmFail::FailInvalid)?;
        Ok((ptr != u64::MAX).then_some(ptr as HostPhysAddr))
    }

    fn vmread(&self, field: u32) -> VmResult<u64> {
        unsafe { vmx::vmread(field) }.map_err(Self::map_fail)
    }

    fn vmwrite(&mut self, field: u32, value: u64) -> VmResult {
        Self::check(unsafe { vmx::vmwrite(field, value) })
    }

    fn vmlaunch(&mut self, state: &mut VcpuExecutionState) -> VmResult {
        self.enter(state, false)
    }

    fn vmresume(&mut self, state: &mut VcpuExecutionState) -> VmResult {
        self.enter(state, true)
    }

    fn invalidate(&mut self, scope: InvalidationScope) -> VmResult {
        let descriptor = scope.descriptor();
        let (cf, zf): (u8, u8);
        unsafe {
            if scope.is_ept() {
                asm!(
                    "invept {ty}, [{desc}]",
                    "setc {cf}",
                    "setz {zf}",
                    ty = in(reg) scope.invalidation_type(),
                    desc = in(reg) &descriptor,
                    cf = out(reg_byte) cf,
                    zf = out(reg_byte) zf,
                    options(nostack),
                );
            } else {
                asm!(
                    "invvpid {ty}, [{desc}]",
                    "setc {cf}",
                    "setz {zf}",
                    ty = in(reg) scope.invalidation_type(),
                    desc = in(reg) &descriptor,
                    cf = out(reg_byte) cf,
                    zf = out(reg_byte) zf,
                    options(nostack),
                );
            }
        }
        if cf != 0 {
            Err(VmFail::FailInvalid)
        } else if zf != 0 {
            Err(VmFail::FailValid(Self::instruction_error()))
        } else {
            Ok(())
        }
    }
}

/// The GDT described by `gdtp`, as 8-byte descriptors.
///
/// # Safety
///
/// `gdtp` must describe a GDT that stays mapped while the slice is used.
unsafe fn gdt_entries(gdtp: &DescriptorTablePointer<u64>) -> &[u64] {
    let len = (gdtp.limit as usize + 1) / core::mem::size_of::<u64>();
    unsafe { core::slice::from_raw_parts(gdtp.base, len) }
}

/// Base address of the TSS that `tr` selects, taken from its 16-byte system
/// descriptor. (SDM Vol. 3A, Section 8.2.3)
///
/// A TSS descriptor that is missing or not present has base 0.
fn tss_base(gdt: &[u64], tr: SegmentSelector) -> usize {
    let index = tr.index() as usize;
    match (gdt.get(index), gdt.get(index + 1)) {
        (Some(&low), Some(&high)) if low.get_bit(47) => {
            let base = low.get_bits(16..40)
                | low.get_bits(56..64) << 24
                | high.get_bits(0..32) << 32;
            base as usize
        }
        _ => 0,
    }
}

unsafe extern "C" {
    /// Saves the callee-saved host registers, loads the guest registers from
    /// `state` and executes VMLAUNCH (`resume` = 0) or VMRESUME.
    ///
    /// Returns 0 after a VM exit, which stored the guest registers back, 1 on
    /// `VMfailInvalid` and 2 on `VMfailValid`.
    #[link_name = "__vmx_core_entry"]
    fn vmx_entry(state: *mut VcpuExecutionState, resume: u64) -> u64;

    /// The host RIP of every VM exit. Returns from [`vmx_entry`].
    #[link_name = "__vmx_core_exit"]
    fn vmx_exit();
}

global_asm!(
    ".pushsection .text",
    ".global __vmx_core_entry",
    "__vmx_core_entry:",
    "push   rbp",
    "push   rbx",
    "push   r12",
    "push   r13",
    "push   r14",
    "push   r15",
    // `state` stays on top of the host stack for the exit path.
    "push   rdi",
    "mov    rax, {host_rsp}",
    "vmwrite rax, rsp",
    "jc     3f",
    "jz     4f",
    "mov    rax, [rdi + {cr2}]",
    "mov    cr2, rax",
    "test   rsi, rsi",
    "mov    rax, [rdi + {off_rax}]",
    "mov    rcx, [rdi + {off_rcx}]",
    "mov    rdx, [rdi + {off_rdx}]",
    "mov    rbx, [rdi + {off_rbx}]",
    "mov    rbp, [rdi + {off_rbp}]",
    "mov    rsi, [rdi + {off_rsi}]",
    "mov    r8,  [rdi + {off_r8}]",
    "mov    r9,  [rdi + {off_r9}]",
    "mov    r10, [rdi + {off_r10}]",
    "mov    r11, [rdi + {off_r11}]",
    "mov    r12, [rdi + {off_r12}]",
    "mov    r13, [rdi + {off_r13}]",
    "mov    r14, [rdi + {off_r14}]",
    "mov    r15, [rdi + {off_r15}]",
    "mov    rdi, [rdi + {off_rdi}]",
    "jnz    6f",
    "vmlaunch",
    "jmp    2f",
    "6:",
    "vmresume",
    // VM entry failed, the flags tell how.
    "2:",
    "mov    eax, 2",
    "mov    ecx, 1",
    "cmovc  eax, ecx",
    "jmp    5f",
    "3:",
    "mov    eax, 1",
    "jmp    5f",
    "4:",
    "mov    eax, 2",
    "5:",
    "pop    rdi",
    "pop    r15",
    "pop    r14",
    "pop    r13",
    "pop    r12",
    "pop    rbx",
    "pop    rbp",
    "ret",
    "",
    ".global __vmx_core_exit",
    "__vmx_core_exit:",
    "push   rdi",
    "mov    rdi, [rsp + 8]",
    "mov    [rdi + {off_rax}], rax",
    "mov    [rdi + {off_rcx}], rcx",
    "mov    [rdi + {off_rdx}], rdx",
    "mov    [rdi + {off_rbx}], rbx",
    "mov    [rdi + {off_rbp}], rbp",
    "mov    [rdi + {off_rsi}], rsi",
    "mov    [rdi + {off_r8}], r8",
    "mov    [rdi + {off_r9}], r9",
    "mov    [rdi + {off_r10}], r10",
    "mov    [rdi + {off_r11}], r11",
    "mov    [rdi + {off_r12}], r12",
    "mov    [rdi + {off_r13}], r13",
    "mov    [rdi + {off_r14}], r14",
    "mov    [rdi + {off_r15}], r15",
    "pop    rax",
    "mov    [rdi + {off_rdi}], rax",
    "mov    rax, cr2",
    "mov    [rdi + {cr2}], rax",
    "pop    rdi",
    "pop    r15",
    "pop    r14",
    "pop    r13",
    "pop    r12",
    "pop    rbx",
    "pop    rbp",
    "xor    eax, eax",
    "ret",
    ".popsection",
    host_rsp = const VmcsHostNW::RSP as u32,
    cr2 = const offset_of!(VcpuExecutionState, cr2),
    off_rax = const offset_of!(GeneralRegisters, rax),
    off_rcx = const offset_of!(GeneralRegisters, rcx),
    off_rdx = const offset_of!(GeneralRegisters, rdx),
    off_rbx = const offset_of!(GeneralRegisters, rbx),
    off_rbp = const offset_of!(GeneralRegisters, rbp),
    off_rsi = const offset_of!(GeneralRegisters, rsi),
    off_rdi = const offset_of!(GeneralRegisters, rdi),
    off_r8 = const offset_of!(GeneralRegisters, r8),
    off_r9 = const offset_of!(GeneralRegisters, r9),
    off_r10 = const offset_of!(GeneralRegisters, r10),
    off_r11 = const offset_of!(GeneralRegisters, r11),
    off_r12 = const offset_of!(GeneralRegisters, r12),
    off_r13 = const offset_of!(GeneralRegisters, r13),
    off_r14 = const offset_of!(GeneralRegisters, r14),
    off_r15 = const offset_of!(GeneralRegisters, r15),
);
