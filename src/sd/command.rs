use core::mem;

use super::response;

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SendInterfaceCondition {
    pub pcie_1_2v_suppport: bool, // PCIe 1.2V
    pub pcie_availability: bool,
    pub voltage_supplied: bool,
    pub check_pattern: u8,
}

impl SendInterfaceCondition {
    /// 2.7-3.6V window with the `0xAA` check pattern.
    pub fn spi() -> Self {
        Self { voltage_supplied: true, check_pattern: 0xAA, ..Default::default() }
    }
}

impl Into<u32> for SendInterfaceCondition {
    fn into(self) -> u32 {
        (self.pcie_1_2v_suppport as u32) << 15
            | (self.pcie_availability as u32) << 14
            | (self.voltage_supplied as u32) << 8
            | self.check_pattern as u32
    }
}

pub type RCA = u16;
pub type Address = u32;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AppCommand {
    SDSendOpCond(bool), // host-capacity-support
}

impl AppCommand {
    pub fn index(self) -> u8 {
        match self {
            Self::SDSendOpCond(_) => 41,
        }
    }

    pub fn argument(self) -> u32 {
        match self {
            Self::SDSendOpCond(hcs) => (hcs as u32) << 30,
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    GoIdleState,
    SendOpCond,
    SendIfCond(SendInterfaceCondition),
    SetBlockLength(u32),
    ReadSingleBlock(Address),
    WriteBlock(Address),
    AppCommand(RCA),
    ReadOCR,
    App(AppCommand),
}

/// Stop bit with an all-zero checksum; the card ignores checksums in SPI mode.
const PLACEHOLDER_CHECKSUM: u8 = 0x01;

impl Command {
    pub fn index(self) -> u8 {
        match self {
            Self::GoIdleState => 0,
            Self::SendOpCond => 1,
            Self::SendIfCond(_) => 8,
            Self::SetBlockLength(_) => 16,
            Self::ReadSingleBlock(_) => 17,
            Self::WriteBlock(_) => 24,
            Self::AppCommand(_) => 55,
            Self::ReadOCR => 58,
            Self::App(command) => command.index(),
        }
    }

    pub fn argument(self) -> u32 {
        match self {
            Self::GoIdleState | Self::SendOpCond | Self::ReadOCR => 0,
            Self::SendIfCond(cond) => cond.into(),
            Self::SetBlockLength(length) => length,
            Self::AppCommand(rca) => (rca as u32) << 16,
            Self::ReadSingleBlock(address) | Self::WriteBlock(address) => address,
            Self::App(command) => command.argument(),
        }
    }

    /// Checksum byte. Only the two commands sent before the card leaves
    /// native mode carry a real CRC7.
    pub fn checksum(self) -> u8 {
        match self {
            Self::GoIdleState => 0x95,
            Self::SendIfCond(cond) if cond == SendInterfaceCondition::spi() => 0x87,
            _ => PLACEHOLDER_CHECKSUM,
        }
    }

    /// Bytes following R1 in the response.
    pub fn expected_response_ex_size(self) -> usize {
        match self {
            Self::SendIfCond(_) => mem::size_of::<response::R7>(),
            Self::ReadOCR => mem::size_of::<response::R3>(),
            _ => 0,
        }
    }
}

impl Into<[u8; 6]> for Command {
    fn into(self) -> [u8; 6] {
        let bytes = u32::to_be_bytes(self.argument());
        [0x40 | self.index(), bytes[0], bytes[1], bytes[2], bytes[3], self.checksum()]
    }
}

mod test {
    #[cfg(test)]
    fn crc7(data: &[u8]) -> u8 {
        let mut crc = 0u8;
        for &b in data.iter() {
            for i in 0..8 {
                crc <<= 1;
                if (((b << i) & 0x80) ^ (crc & 0x80)) != 0 {
                    crc ^= 0x09;
                }
            }
        }
        crc << 1 | 1
    }

    #[test]
    fn test_command_to_bytes() {
        use super::{AppCommand, Command, SendInterfaceCondition};
        use hex_literal::hex;

        let cmd = Command::GoIdleState;
        let bytes: [u8; 6] = cmd.into();
        assert_eq!(bytes, hex!("40 00 00 00 00 95"));

        let cmd = Command::SendIfCond(SendInterfaceCondition::spi());
        let bytes: [u8; 6] = cmd.into();
        assert_eq!(bytes, hex!("48 00 00 01 AA 87"));

        let cmd = Command::App(AppCommand::SDSendOpCond(true));
        let bytes: [u8; 6] = cmd.into();
        assert_eq!(bytes, hex!("69 40 00 00 00 01"));

        let cmd = Command::SetBlockLength(512);
        let bytes: [u8; 6] = cmd.into();
        assert_eq!(bytes, hex!("50 00 00 02 00 01"));

        let cmd = Command::ReadSingleBlock(1536);
        let bytes: [u8; 6] = cmd.into();
        assert_eq!(bytes, hex!("51 00 00 06 00 01"));
    }

    #[test]
    fn test_fixed_checksums() {
        use super::{Command, SendInterfaceCondition};

        for cmd in [Command::GoIdleState, Command::SendIfCond(SendInterfaceCondition::spi())] {
            let bytes: [u8; 6] = cmd.into();
            assert_eq!(bytes[5], crc7(&bytes[..5]));
        }
    }
}
