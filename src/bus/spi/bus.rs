use core::hint;

use embedded_hal::digital::v2::OutputPin;

use crate::bus;
use crate::sd::command::{AppCommand, Command};
use crate::sd::response::{Response, R1};

use super::calibrate::{Calibration, Width};

#[derive(Debug)]
pub enum Error<PORT, CS> {
    Port(PORT),
    CS(CS),
}

pub type BUSError<PORT, CS> = bus::Error<Error<PORT, CS>>;

/// Idle level of MOSI, clocked out whenever only the response matters.
pub const FILLER: u8 = 0xFF;

/// Skip Ncr, 0~8 bytes for SDC, 1~8 bytes for MMC
const NCR_ATTEMPTS: usize = 10;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Speed {
    /// Identification clock, 100~400KHz
    Slow,
    Fast,
}

/// Register interface of the SPI transfer controller.
///
/// A shift starts an exchange and returns immediately; the byte clocked in
/// is latched into the receive register some time later. The engine waits a
/// calibrated number of no-op cycles before reading it back.
pub trait Port {
    type Error;
    /// Starts an 8 clock exchange of `tx`, MSB first.
    fn shift8(&mut self, tx: u8) -> Result<(), Self::Error>;
    /// Starts a 16 clock exchange of `tx`, MSB first.
    fn shift16(&mut self, tx: u16) -> Result<(), Self::Error>;
    fn rx8(&mut self) -> Result<u8, Self::Error>;
    fn rx16(&mut self) -> Result<u16, Self::Error>;
    /// Parks the line with clock low and MOSI high.
    fn idle(&mut self) -> Result<(), Self::Error>;

    fn set_speed(&mut self, _speed: Speed) -> Result<(), Self::Error> {
        Ok(())
    }

    fn nop(&mut self, cycles: u8) {
        for _ in 0..cycles {
            hint::spin_loop();
        }
    }
}

pub enum Direction<'a> {
    Send(&'a [u8]),
    /// Receive into the buffer while clocking out the filler byte.
    Receive(&'a mut [u8], u8),
}

pub struct Bus<PORT, CS> {
    port: PORT,
    cs: CS,
    calibration: Calibration,
}

/// Bytes to move singly before the first 16-bit unit.
fn leading(address: usize, length: usize) -> usize {
    core::cmp::min(address & 1, length)
}

impl<E, F, PORT, CS> Bus<PORT, CS>
where
    PORT: Port<Error = E>,
    CS: OutputPin<Error = F>,
{
    /// Transfers use the conservative delays until calibrated.
    pub fn new(port: PORT, cs: CS) -> Self {
        Self { port, cs, calibration: Calibration::CONSERVATIVE }
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    /// Adopts known delays instead of measuring them.
    pub fn set_calibration(&mut self, calibration: Calibration) {
        self.calibration = calibration
    }

    pub fn port<R>(&mut self, f: impl FnOnce(&mut PORT) -> R) -> R {
        f(&mut self.port)
    }

    pub(crate) fn port_error(error: E) -> BUSError<E, F> {
        BUSError::BUS(Error::Port(error))
    }

    pub fn select(&mut self, enable: bool) -> Result<(), BUSError<E, F>> {
        if enable {
            return self.cs.set_low().map_err(|e| BUSError::BUS(Error::CS(e)));
        }
        self.port.idle().map_err(Self::port_error)?;
        self.cs.set_high().map_err(|e| BUSError::BUS(Error::CS(e)))
    }

    pub fn set_speed(&mut self, speed: Speed) -> Result<(), BUSError<E, F>> {
        self.port.set_speed(speed).map_err(Self::port_error)
    }

    /// Exchanges a single byte and returns what the card sent meanwhile.
    pub fn transfer_byte(&mut self, tx: u8) -> Result<u8, BUSError<E, F>> {
        self.port.shift8(tx).map_err(Self::port_error)?;
        self.port.nop(self.calibration.nops(Width::Duplex));
        self.read_byte()
    }

    /// Last latched byte, without starting an exchange.
    pub fn read_byte(&mut self) -> Result<u8, BUSError<E, F>> {
        self.port.rx8().map_err(Self::port_error)
    }

    /// Last latched word, without starting an exchange.
    pub fn read_word(&mut self) -> Result<u16, BUSError<E, F>> {
        self.port.rx16().map_err(Self::port_error)
    }

    fn shift_byte(&mut self, tx: u8) -> Result<(), BUSError<E, F>> {
        self.port.shift8(tx).map_err(Self::port_error)?;
        self.port.nop(self.calibration.nops(Width::Byte));
        Ok(())
    }

    fn shift_word(&mut self, tx: u16) -> Result<(), BUSError<E, F>> {
        self.port.shift16(tx).map_err(Self::port_error)?;
        self.port.nop(self.calibration.nops(Width::Word));
        Ok(())
    }

    pub fn transfer_bytes(&mut self, direction: Direction<'_>) -> Result<(), BUSError<E, F>> {
        match direction {
            Direction::Send(bytes) => {
                let (head, words) = bytes.split_at(leading(bytes.as_ptr() as usize, bytes.len()));
                for &byte in head {
                    self.shift_byte(byte)?;
                }
                let mut pairs = words.chunks_exact(2);
                for pair in &mut pairs {
                    self.shift_word(u16::from_be_bytes([pair[0], pair[1]]))?;
                }
                for &byte in pairs.remainder() {
                    self.shift_byte(byte)?;
                }
            }
            Direction::Receive(buffer, filler) => {
                let length = buffer.len();
                let (head, words) = buffer.split_at_mut(leading(buffer.as_ptr() as usize, length));
                for byte in head.iter_mut() {
                    self.shift_byte(filler)?;
                    *byte = self.read_byte()?;
                }
                let mut pairs = words.chunks_exact_mut(2);
                for pair in &mut pairs {
                    self.shift_word(u16::from_be_bytes([filler, filler]))?;
                    pair.copy_from_slice(&self.read_word()?.to_be_bytes());
                }
                for byte in pairs.into_remainder() {
                    self.shift_byte(filler)?;
                    *byte = self.read_byte()?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn tx(&mut self, bytes: &[u8]) -> Result<(), BUSError<E, F>> {
        self.transfer_bytes(Direction::Send(bytes))
    }

    pub(crate) fn rx(&mut self) -> Result<u8, BUSError<E, F>> {
        self.transfer_byte(FILLER)
    }

    /// Clocks `count` bytes of `filler`, discarding what comes back.
    pub fn skip(&mut self, count: usize, filler: u8) -> Result<(), BUSError<E, F>> {
        for _ in 0..count / 2 {
            self.shift_word(u16::from_be_bytes([filler, filler]))?;
        }
        if count % 2 == 1 {
            self.shift_byte(filler)?;
        }
        Ok(())
    }

    /// Deselects and clocks one more byte so the card releases MISO.
    pub fn release(&mut self) -> Result<(), BUSError<E, F>> {
        self.select(false)?;
        self.rx().map(|_| ())
    }

    pub(crate) fn send_command(&mut self, cmd: Command) -> Result<Response, BUSError<E, F>> {
        self.select(false)?;
        self.rx()?;
        self.select(true)?;
        self.rx()?;

        let bytes: [u8; 6] = cmd.into();
        trace!("CMD{} {:02X?}", cmd.index(), bytes);
        self.tx(&bytes[..])?;

        let mut r1 = R1::default();
        for _ in 0..NCR_ATTEMPTS {
            r1 = R1(self.rx()?);
            if r1.valid() {
                break;
            }
        }
        let mut response = Response { r1, ..Default::default() };
        if !r1.valid() {
            trace!("CMD{} no response", cmd.index());
            return Ok(response);
        }

        let size = cmd.expected_response_ex_size();
        if size > 0 && (r1.ready() || r1.idle()) {
            let mut buffer = [0u8; 4];
            self.transfer_bytes(Direction::Receive(&mut buffer[4 - size..], FILLER))?;
            response.ex = u32::from_be_bytes(buffer);
        }
        Ok(response)
    }

    /// APP_CMD followed by `cmd`; an APP_CMD error stands for the whole exchange.
    pub(crate) fn send_app_command(&mut self, cmd: AppCommand) -> Result<Response, BUSError<E, F>> {
        let response = self.send_command(Command::AppCommand(0))?;
        if response.r1.0 > R1::IDLE.0 {
            return Ok(response);
        }
        self.send_command(Command::App(cmd))
    }

    pub(crate) fn issue(&mut self, cmd: Command) -> Result<R1, BUSError<E, F>> {
        let response = match cmd {
            Command::App(app) => self.send_app_command(app)?,
            _ => self.send_command(cmd)?,
        };
        Ok(response.r1)
    }
}

mod test {
    #[cfg(test)]
    #[repr(align(2))]
    struct Aligned([u8; 8]);

    #[test]
    fn test_transfer_byte() {
        use crate::bus::sim::{self, Card, Kind};

        let (mut bus, card) = sim::bus(Card::new(Kind::Sd1));
        bus.select(true).unwrap();
        card.borrow_mut().queue(&[0x12]);
        assert_eq!(bus.transfer_byte(0xA5).unwrap(), 0x12);
        assert_eq!(bus.read_byte().unwrap(), 0x12);
        let last = *card.borrow().transcript.last().unwrap();
        assert_eq!((last.tx, last.rx), (0xA5, 0x12));
    }

    #[test]
    fn test_transfer_bytes_alignment() {
        use super::Direction;
        use crate::bus::sim::{self, Card, Kind, Shift};

        let (mut bus, card) = sim::bus(Card::new(Kind::Sd1));
        bus.select(true).unwrap();

        bus.transfer_bytes(Direction::Receive(&mut [], 0xFF)).unwrap();
        bus.transfer_bytes(Direction::Send(&[])).unwrap();
        assert!(bus.port(|port| port.shifts.is_empty()));

        card.borrow_mut().queue(&[1, 2, 3, 4, 5, 6]);
        let mut buffer = Aligned([0u8; 8]);
        bus.transfer_bytes(Direction::Receive(&mut buffer.0[1..7], 0xFF)).unwrap();
        assert_eq!(buffer.0, [0, 1, 2, 3, 4, 5, 6, 0]);
        let shifts = bus.port(|port| core::mem::take(&mut port.shifts));
        assert_eq!(shifts, [Shift::Byte, Shift::Word, Shift::Word, Shift::Byte]);

        let bytes = Aligned([0x11, 0x12, 0x13, 0x14, 0x15, 0, 0, 0]);
        bus.transfer_bytes(Direction::Send(&bytes.0[..5])).unwrap();
        let shifts = bus.port(|port| core::mem::take(&mut port.shifts));
        assert_eq!(shifts, [Shift::Word, Shift::Word, Shift::Byte]);
        let sent: Vec<u8> = card.borrow().transcript.iter().rev().take(5).map(|x| x.tx).collect();
        assert_eq!(sent, [0x15, 0x14, 0x13, 0x12, 0x11]);
    }

    #[test]
    fn test_release_parks_line() {
        use crate::bus::sim::{self, Card, Kind};

        let (mut bus, card) = sim::bus(Card::new(Kind::Sd1));
        bus.select(true).unwrap();
        bus.release().unwrap();
        let card = card.borrow();
        assert_eq!(card.parked, 1);
        assert!(!card.transcript.last().unwrap().selected);
    }
}
