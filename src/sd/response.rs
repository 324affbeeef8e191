use bitfield::Bit;

#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(C)]
pub struct R1(pub u8);

impl Default for R1 {
    fn default() -> Self {
        Self(0x80)
    }
}

#[derive(Copy, Clone, Debug)]
#[repr(u8)]
pub enum R1Status {
    InIdleState = 0,
    EraseReset,
    IllegalCommand,
    CommandCRCError,
    EraseSequenceError,
    AddressError,
    ParameterError,
}

impl R1 {
    pub const READY: Self = Self(0x00);
    pub const IDLE: Self = Self(0x01);

    pub fn valid(self) -> bool {
        !self.0.bit(7)
    }

    pub fn has(self, status: R1Status) -> bool {
        self.0.bit(status as usize)
    }

    pub fn ready(self) -> bool {
        self == Self::READY
    }

    pub fn idle(self) -> bool {
        self == Self::IDLE
    }
}

/// OCR register, returned by READ_OCR.
#[derive(Copy, Clone, Default, Debug)]
#[repr(C)]
pub struct R3(pub u32);

impl R3 {
    pub fn card_capacity_status(self) -> bool {
        self.0.bit(30)
    }
}

#[derive(Copy, Clone, Default, Debug)]
pub struct R7(pub u32);

impl R7 {
    /// Echoed voltage field is exactly 2.7-3.6V.
    pub fn voltage_accepted(self) -> bool {
        (self.0 >> 8) as u8 == 0x01
    }

    pub fn echo_back_check_pattern(self) -> u8 {
        self.0 as u8
    }
}

#[derive(Copy, Clone, Default)]
pub struct Response {
    pub r1: R1,
    pub ex: u32,
}

mod test {
    #[test]
    fn test_r1() {
        use super::{R1Status, R1};

        assert!(!R1::default().valid());
        assert!(R1(0x05).valid());
        assert!(R1(0x05).has(R1Status::IllegalCommand));
        assert!(R1(0x05).has(R1Status::InIdleState));
        assert!(!R1(0x05).idle());
        assert!(R1(0x01).idle() && R1(0x00).ready());
    }

    #[test]
    fn test_r3_r7() {
        use super::{R3, R7};

        assert!(R3(0xC0FF_8000).card_capacity_status());
        assert!(!R3(0x80FF_8000).card_capacity_status());
        let r7 = R7(0x0000_01AA);
        assert!(r7.voltage_accepted());
        assert_eq!(r7.echo_back_check_pattern(), 0xAA);
        assert!(!R7(0x0000_11AA).voltage_accepted());
        assert!(!R7(0x0000_03AA).voltage_accepted());
        assert!(!R7(0x0000_00AA).voltage_accepted());
    }
}
