//! Interruption-information fields, shared by VM-entry event injection, VM-exit
//! interruption information and IDT-vectoring information.
//! (SDM Vol. 3C, Sections 25.8.3, 25.9.2 and 25.9.3)

use core::fmt;

use bit_field::BitField;
use numeric_enum_macro::numeric_enum;

use crate::{Result, VmxError};

numeric_enum! {
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The interruption type (bits 10:8). Type 1 is reserved.
pub enum InterruptionType {
    /// External interrupt
    External = 0,
    /// Non-maskable interrupt (NMI)
    Nmi = 2,
    /// Hardware exception (e.g. #PF)
    HardwareException = 3,
    /// Software interrupt (INT n)
    SoftwareInterrupt = 4,
    /// Privileged software exception (INT1)
    PrivilegedSoftwareException = 5,
    /// Software exception (INT3 or INTO)
    SoftwareException = 6,
    /// Other event
    Other = 7,
}
}

impl InterruptionType {
    /// Vectors of exceptions that push an error code:
    /// #DF, #TS, #NP, #SS, #GP, #PF, #AC and #CP.
    pub const fn vector_has_error_code(vector: u8) -> bool {
        matches!(vector, 8 | 10..=14 | 17 | 21)
    }

    /// The type an event with `vector` is delivered as.
    pub const fn from_vector(vector: u8) -> Self {
        match vector {
            2 => Self::Nmi,
            // #BP (INT3) and #OF (INTO)
            3 | 4 => Self::SoftwareException,
            0..32 => Self::HardwareException,
            _ => Self::External,
        }
    }

    /// Whether VM entry needs the instruction length to deliver this type.
    pub const fn is_soft(&self) -> bool {
        matches!(
            *self,
            Self::SoftwareInterrupt | Self::PrivilegedSoftwareException | Self::SoftwareException
        )
    }
}

/// A decoded, valid interruption-information field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectoredEvent {
    pub vector: u8,
    pub ty: InterruptionType,
    /// An error code is delivered with the event (bit 11).
    pub has_error_code: bool,
    /// NMI unblocking due to IRET (bit 12); meaningful in exit information only.
    pub nmi_unblocking: bool,
}

/// A raw 32-bit interruption-information field.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptionInfo(u32);

impl InterruptionInfo {
    const VALID_BIT: usize = 31;
    const ERROR_CODE_BIT: usize = 11;
    const NMI_UNBLOCKING_BIT: usize = 12;

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Builds a valid field for injecting an event.
    pub fn encode(vector: u8, ty: InterruptionType, deliver_error_code: bool) -> Self {
        let mut raw = 0u32;
        raw.set_bits(0..8, vector as u32);
        raw.set_bits(8..11, ty as u32);
        raw.set_bit(Self::ERROR_CODE_BIT, deliver_error_code);
        raw.set_bit(Self::VALID_BIT, true);
        Self(raw)
    }

    /// Builds a valid field for `vector`, choosing the type and error-code
    /// delivery the way the processor would for that vector.
    pub fn for_vector(vector: u8) -> Self {
        let ty = InterruptionType::from_vector(vector);
        let has_error_code = ty == InterruptionType::HardwareException
            && InterruptionType::vector_has_error_code(vector);
        Self::encode(vector, ty, has_error_code)
    }

    pub fn is_valid(&self) -> bool {
        self.0.get_bit(Self::VALID_BIT)
    }

    /// Decodes the field. A clear valid bit means there is no event, which is
    /// `Ok(None)`; a reserved interruption type is an error.
    pub fn decode(&self) -> Result<Option<VectoredEvent>> {
        if !self.is_valid() {
            return Ok(None);
        }
        let ty = InterruptionType::try_from(self.0.get_bits(8..11) as u8).map_err(|_| {
            VmxError::MalformedField {
                name: "interruption information",
                raw: self.0 as u64,
            }
        })?;
        Ok(Some(VectoredEvent {
            vector: self.0.get_bits(0..8) as u8,
            ty,
            has_error_code: self.0.get_bit(Self::ERROR_CODE_BIT),
            nmi_unblocking: self.0.get_bit(Self::NMI_UNBLOCKING_BIT),
        }))
    }
}

impl fmt::Debug for InterruptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok(Some(event)) => write!(f, "InterruptionInfo({:#x}, {event:?})", self.0),
            Ok(None) => write!(f, "InterruptionInfo({:#x}, invalid)", self.0),
            Err(_) => write!(f, "InterruptionInfo({:#x}, malformed)", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_fault_round_trip() {
        let info = InterruptionInfo::encode(14, InterruptionType::HardwareException, true);
        assert_eq!(info.raw(), 0x8000_0b0e);
        let event = info.decode().unwrap().unwrap();
        assert_eq!(event.vector, 14);
        assert_eq!(event.ty, InterruptionType::HardwareException);
        assert!(event.has_error_code);
        assert!(!event.nmi_unblocking);
        assert!(info.is_valid());
    }

    #[test]
    fn test_invalid_means_no_event() {
        assert_eq!(InterruptionInfo::from_raw(0).decode(), Ok(None));
        // Everything but the valid bit is ignored.
        assert_eq!(InterruptionInfo::from_raw(0x0000_0b0e).decode(), Ok(None));
    }

    #[test]
    fn test_reserved_type_rejected() {
        let raw = 0x8000_0120;
        assert_eq!(
            InterruptionInfo::from_raw(raw).decode(),
            Err(VmxError::MalformedField {
                name: "interruption information",
                raw: raw as u64,
            })
        );
    }

    #[test]
    fn test_nmi_unblocking_bit() {
        let event = InterruptionInfo::from_raw(0x8000_1202)
            .decode()
            .unwrap()
            .unwrap();
        assert_eq!(event.vector, 2);
        assert_eq!(event.ty, InterruptionType::Nmi);
        assert!(event.nmi_unblocking);
    }

    #[test]
    fn test_for_vector() {
        let cases = [
            (0, InterruptionType::HardwareException, false),
            (1, InterruptionType::HardwareException, false),
            (2, InterruptionType::Nmi, false),
            (3, InterruptionType::SoftwareException, false),
            (4, InterruptionType::SoftwareException, false),
            (8, InterruptionType::HardwareException, true),
            (13, InterruptionType::HardwareException, true),
            (14, InterruptionType::HardwareException, true),
            (17, InterruptionType::HardwareException, true),
            (21, InterruptionType::HardwareException, true),
            (6, InterruptionType::HardwareException, false),
            (0x20, InterruptionType::External, false),
            (0xec, InterruptionType::External, false),
        ];
        for (vector, ty, has_error_code) in cases {
            let event = InterruptionInfo::for_vector(vector)
                .decode()
                .unwrap()
                .unwrap();
            assert_eq!(event.vector, vector);
            assert_eq!(event.ty, ty, "vector {vector}");
            assert_eq!(event.has_error_code, has_error_code, "vector {vector}");
        }
        assert!(InterruptionType::SoftwareException.is_soft());
        assert!(!InterruptionType::HardwareException.is_soft());
    }
}
