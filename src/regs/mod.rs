mod diff;

pub use diff::GeneralRegistersDiff;

/// General-purpose registers of a guest, saved and restored around VM entry.
///
/// The order matches the register encoding used by exit qualifications and
/// instruction information (`0` = RAX ... `15` = R15). RSP lives in the VMCS
/// guest-state area, so its slot here is never loaded into the guest.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub(crate) _unused_rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl GeneralRegisters {
    /// The names of the registers, indexed by their encoding.
    pub const REGISTER_NAMES: [&'static str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];

    /// Index of RSP, which is not part of this structure.
    pub const RSP_INDEX: u8 = 4;

    /// Returns the name of the register with the given encoding.
    pub fn register_name(index: u8) -> &'static str {
        Self::REGISTER_NAMES[index as usize]
    }

    /// Returns the value of the register with the given encoding.
    ///
    /// # Panics
    ///
    /// Panics on RSP (4) and on indices above 15.
    pub fn get_reg_of_index(&self, index: u8) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => panic!("Illegal index of GeneralRegisters {index}"),
        }
    }

    /// Sets the register with the given encoding.
    ///
    /// # Panics
    ///
    /// Panics on RSP (4) and on indices above 15.
    pub fn set_reg_of_index(&mut self, index: u8, value: u64) {
        let reg = match index {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            15 => &mut self.r15,
            _ => panic!("Illegal index of GeneralRegisters {index}"),
        };
        *reg = value;
    }
}
