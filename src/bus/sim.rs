//! Simulated card behind a simulated transfer controller.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::digital::v2::OutputPin;

use super::spi::{Bus, Port, Speed, TimedTransferProbe, Width};
use crate::sd::BLOCK_SIZE;

const BLOCKS: usize = 16;

const IDLE: u8 = 0x01;
const ILLEGAL_COMMAND: u8 = 0x04;
const ADDRESS_ERROR: u8 = 0x20;
const PARAMETER_ERROR: u8 = 0x40;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Kind {
    Absent,
    Mmc,
    Sd1,
    Sd2 { high_capacity: bool },
}

#[derive(Copy, Clone, Debug)]
pub struct Exchange {
    pub tx: u8,
    pub rx: u8,
    pub selected: bool,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum State {
    Command,
    WaitToken(usize),
    Data(usize),
}

pub struct Card {
    /// Changing it after bring-up makes the card go silent or misbehave.
    pub kind: Kind,
    /// Op-cond commands answered with idle before the card is ready.
    pub idle_polls: usize,
    pub echo: u8,
    /// Voltage field echoed by CMD8 instead of the requested one.
    pub voltage: Option<u8>,
    pub reject_blocklen: bool,
    pub reject_ocr: bool,
    /// 0xFF bytes before the read data token.
    pub token_latency: usize,
    /// Busy bytes after an accepted block.
    pub busy_bytes: usize,
    pub reject_writes: bool,
    pub blocks: Vec<[u8; BLOCK_SIZE]>,
    pub transcript: Vec<Exchange>,
    pub speeds: Vec<Speed>,
    pub parked: usize,
    pub last_address: Option<u32>,
    pub last_packet: Option<Vec<u8>>,
    selected: bool,
    idle: bool,
    app: bool,
    frame: Vec<u8>,
    state: State,
    out: VecDeque<u8>,
    pending_read: Option<(usize, usize)>,
    busy: usize,
    packet: Vec<u8>,
}

impl Card {
    pub fn new(kind: Kind) -> Self {
        let mut blocks = vec![[0u8; BLOCK_SIZE]; BLOCKS];
        for (i, block) in blocks.iter_mut().enumerate() {
            for (j, byte) in block.iter_mut().enumerate() {
                *byte = (i * 31 + j * 7) as u8;
            }
        }
        Self {
            kind,
            idle_polls: 0,
            echo: 0xAA,
            voltage: None,
            reject_blocklen: false,
            reject_ocr: false,
            token_latency: 2,
            busy_bytes: 3,
            reject_writes: false,
            blocks,
            transcript: Vec::new(),
            speeds: Vec::new(),
            parked: 0,
            last_address: None,
            last_packet: None,
            selected: false,
            idle: false,
            app: false,
            frame: Vec::new(),
            state: State::Command,
            out: VecDeque::new(),
            pending_read: None,
            busy: 0,
            packet: Vec::new(),
        }
    }

    pub fn selected(&self) -> bool {
        self.selected
    }

    pub fn queue(&mut self, bytes: &[u8]) {
        self.out.extend(bytes.iter().copied());
    }

    /// Selected exchanges following the first data token in the transcript.
    pub fn packet_bytes_clocked(&self) -> usize {
        let start = self.transcript.iter().position(|x| x.selected && x.rx == 0xFE);
        start.map_or(0, |start| self.transcript[start + 1..].iter().take_while(|x| x.selected).count())
    }

    fn deselect(&mut self) {
        self.selected = false;
        self.out.clear();
        self.frame.clear();
        self.pending_read = None;
        self.state = State::Command;
    }

    fn exchange(&mut self, tx: u8) -> u8 {
        let rx = match self.selected && self.kind != Kind::Absent {
            true => {
                let rx = self.next_out();
                self.clock_in(tx);
                rx
            }
            false => 0xFF,
        };
        self.transcript.push(Exchange { tx, rx, selected: self.selected });
        rx
    }

    fn next_out(&mut self) -> u8 {
        if let Some(byte) = self.out.pop_front() {
            return byte;
        }
        if let Some((latency, sector)) = self.pending_read.take() {
            if latency > 0 {
                self.pending_read = Some((latency - 1, sector));
                return 0xFF;
            }
            self.out.extend(self.blocks[sector].iter().copied());
            self.out.extend([0xC3, 0x3C]);
            return 0xFE;
        }
        if self.busy > 0 {
            self.busy -= 1;
            return 0x00;
        }
        0xFF
    }

    fn clock_in(&mut self, tx: u8) {
        match self.state {
            State::Command => {
                if self.frame.is_empty() && tx & 0xC0 != 0x40 {
                    return;
                }
                self.frame.push(tx);
                if self.frame.len() == 6 {
                    let frame = std::mem::take(&mut self.frame);
                    self.command(&frame);
                }
            }
            State::WaitToken(sector) => {
                if tx == 0xFE {
                    self.packet.clear();
                    self.state = State::Data(sector);
                }
            }
            State::Data(sector) => {
                self.packet.push(tx);
                if self.packet.len() == BLOCK_SIZE + 2 {
                    self.state = State::Command;
                    self.program(sector);
                }
            }
        }
    }

    fn command(&mut self, frame: &[u8]) {
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let app = std::mem::replace(&mut self.app, false);
        let status = self.idle as u8;

        self.out.push_back(0xFF); // Ncr
        match (index, app) {
            (0, _) => {
                self.idle = true;
                self.out.push_back(IDLE);
            }
            (8, _) => match self.kind {
                Kind::Sd2 { .. } => {
                    let voltage = self.voltage.unwrap_or((arg >> 8) as u8 & 0x0F);
                    self.out.extend([status, 0x00, 0x00, voltage, self.echo]);
                }
                _ => self.out.push_back(status | ILLEGAL_COMMAND),
            },
            (55, _) if self.kind != Kind::Mmc => {
                self.app = true;
                self.out.push_back(status);
            }
            (41, true) => self.op_cond(),
            (1, false) if self.kind == Kind::Mmc => self.op_cond(),
            (58, _) if self.reject_ocr => self.out.push_back(status | ILLEGAL_COMMAND),
            (58, _) => {
                let ocr = match self.kind {
                    Kind::Sd2 { high_capacity: true } => 0xC0,
                    _ => 0x80,
                };
                self.out.extend([status, ocr, 0xFF, 0x80, 0x00]);
            }
            (16, _) => self.out.push_back(match arg == BLOCK_SIZE as u32 && !self.reject_blocklen {
                true => status,
                false => status | PARAMETER_ERROR,
            }),
            (17, _) | (24, _) => self.block_command(index, arg, status),
            _ => self.out.push_back(status | ILLEGAL_COMMAND),
        }
    }

    fn op_cond(&mut self) {
        if self.idle_polls > 0 {
            self.idle_polls -= 1;
            self.out.push_back(IDLE);
        } else {
            self.idle = false;
            self.out.push_back(0x00);
        }
    }

    fn block_command(&mut self, index: u8, arg: u32, status: u8) {
        self.last_address = Some(arg);
        let sector = match self.kind {
            Kind::Sd2 { high_capacity: true } => arg as usize,
            _ => arg as usize / BLOCK_SIZE,
        };
        if status != 0 || sector >= self.blocks.len() {
            self.out.push_back(status | ADDRESS_ERROR);
            return;
        }
        self.out.push_back(0x00);
        match index {
            17 => self.pending_read = Some((self.token_latency, sector)),
            _ => self.state = State::WaitToken(sector),
        }
    }

    fn program(&mut self, sector: usize) {
        let packet = std::mem::take(&mut self.packet);
        if self.reject_writes {
            self.out.push_back(0x0B);
        } else {
            self.blocks[sector].copy_from_slice(&packet[..BLOCK_SIZE]);
            self.out.push_back(0xE5);
            self.busy = self.busy_bytes;
        }
        self.last_packet = Some(packet);
    }
}

pub type Shared = Rc<RefCell<Card>>;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Shift {
    Byte,
    Word,
}

/// Transfer controller failure.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Fault;

pub struct SimPort {
    card: Shared,
    latched: u16,
    /// Any shift carrying this byte fails.
    pub fault_on: Option<u8>,
    pub shifts: Vec<Shift>,
    /// No-op cycles each width needs before its result is latched.
    pub settle: [u8; 3],
    pub probes: usize,
}

impl Port for SimPort {
    type Error = Fault;

    fn shift8(&mut self, tx: u8) -> Result<(), Fault> {
        if self.fault_on == Some(tx) {
            return Err(Fault);
        }
        self.shifts.push(Shift::Byte);
        self.latched = self.card.borrow_mut().exchange(tx) as u16;
        Ok(())
    }

    fn shift16(&mut self, tx: u16) -> Result<(), Fault> {
        let bytes = tx.to_be_bytes();
        if bytes.iter().any(|&byte| self.fault_on == Some(byte)) {
            return Err(Fault);
        }
        self.shifts.push(Shift::Word);
        let mut card = self.card.borrow_mut();
        let high = card.exchange(bytes[0]);
        let low = card.exchange(bytes[1]);
        self.latched = u16::from_be_bytes([high, low]);
        Ok(())
    }

    fn rx8(&mut self) -> Result<u8, Fault> {
        Ok(self.latched as u8)
    }

    fn rx16(&mut self) -> Result<u16, Fault> {
        Ok(self.latched)
    }

    fn idle(&mut self) -> Result<(), Fault> {
        self.card.borrow_mut().parked += 1;
        Ok(())
    }

    fn set_speed(&mut self, speed: Speed) -> Result<(), Fault> {
        self.card.borrow_mut().speeds.push(speed);
        Ok(())
    }
}

impl TimedTransferProbe for SimPort {
    type Error = Fault;

    fn probe(&mut self, width: Width, nops: u8, samples: &mut [u8]) -> Result<(), Fault> {
        self.probes += 1;
        let needed = match width {
            Width::Byte => self.settle[0],
            Width::Word => self.settle[1],
            Width::Duplex => self.settle[2],
        };
        for (i, sample) in samples.iter_mut().enumerate() {
            *sample = match nops < needed && i % 16 == 5 {
                true => width.clocks() - 1,
                false => width.clocks(),
            };
        }
        Ok(())
    }
}

pub struct SimSelect(Shared);

impl OutputPin for SimSelect {
    type Error = Fault;

    fn set_low(&mut self) -> Result<(), Fault> {
        self.0.borrow_mut().selected = true;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Fault> {
        self.0.borrow_mut().deselect();
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingDelay {
    pub calls: usize,
    pub total_us: u64,
}

impl DelayUs<u32> for CountingDelay {
    fn delay_us(&mut self, us: u32) {
        self.calls += 1;
        self.total_us += us as u64;
    }
}

pub fn bus(card: Card) -> (Bus<SimPort, SimSelect>, Shared) {
    let card = Rc::new(RefCell::new(card));
    let port = SimPort { card: card.clone(), latched: 0xFFFF, fault_on: None, shifts: Vec::new(), settle: [0; 3], probes: 0 };
    (Bus::new(port, SimSelect(card.clone())), card)
}
