//! # sdmmc
//!
//! > SD/MMC card driver for `no_std` systems, over a self-calibrating SPI transfer engine
//!
//! ## Using this crate
//!
//! Assuming you already have a `PORT` which implements `sdmmc::bus::spi::Port`
//! and a chip select pin
//!
//! ```ignore
//! let mut bus = sdmmc::bus::spi::Bus::new(port, cs);
//! bus.calibrate()?;
//! let mut sd = SD::new(bus, delay);
//! let card = sd.initialize()?;
//! debug!("Card: {:?}", card);
//!
//! let mut buffer = [0u8; 512];
//! sd.read_block(0, &mut buffer)?;
//!
//! sd.write(WriteOp::Open { sector: 1 })?;
//! sd.write(WriteOp::Payload(&buffer[..256]))?;
//! sd.write(WriteOp::Payload(&buffer[256..]))?;
//! sd.write(WriteOp::Close)?;
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
extern crate log;
#[cfg(feature = "spidev")]
extern crate spidev;

pub mod bus;
pub mod config;
pub mod delay;
pub mod sd;

use bus::{Destination, Error};
pub use config::Config;
use delay::Delay;
pub use sd::{CardType, BLOCK_SIZE};

/// Sector number, in units of `BLOCK_SIZE`.
type LBA = u32;

/// Step of a single block write.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum WriteOp<'a> {
    Open { sector: LBA },
    /// Next payload bytes; chunks of any size up to the block remainder.
    Payload(&'a [u8]),
    Close,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Transaction {
    Closed,
    Open { remaining: usize },
}

pub struct SD<BUS, D> {
    bus: BUS,
    delay: D,
    config: Config,
    card: CardType,
    transaction: Transaction,
}

impl<E, BUS, D> SD<BUS, D>
where
    BUS: bus::Init<Error = E> + bus::Read<Error = E> + bus::Write<Error = E>,
    D: Delay,
{
    pub fn new(bus: BUS, delay: D) -> Self {
        Self::with_config(bus, delay, Config::default())
    }

    pub fn with_config(bus: BUS, delay: D, config: Config) -> Self {
        Self { bus, delay, config, card: CardType::NONE, transaction: Transaction::Closed }
    }

    pub fn card_type(&self) -> CardType {
        self.card
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus<R>(&mut self, f: impl FnOnce(&mut BUS) -> R) -> R {
        f(&mut self.bus)
    }

    /// Detects the card from scratch. An open write transaction is dropped.
    pub fn initialize(&mut self) -> Result<CardType, Error<E>> {
        self.card = CardType::NONE;
        self.transaction = Transaction::Closed;
        let card = self.bus.init(&mut self.delay, &self.config)?;
        self.bus.speed_up()?;
        info!("Card {:?} ready", card);
        self.card = card;
        Ok(card)
    }

    fn read_into(&mut self, sector: LBA, offset: usize, destination: Destination<'_>) -> Result<(), Error<E>> {
        if self.card.is_none() {
            return Err(Error::NotInitialized);
        }
        if offset.saturating_add(destination.len()) > BLOCK_SIZE {
            return Err(Error::OutOfRange);
        }
        let address = self.card.address(sector);
        self.bus.read(&mut self.delay, &self.config, address, offset, destination)
    }

    /// Reads `buffer.len()` bytes of `sector`, starting at byte `offset`.
    pub fn read(&mut self, sector: LBA, offset: usize, buffer: &mut [u8]) -> Result<(), Error<E>> {
        self.read_into(sector, offset, Destination::Buffer(buffer))
    }

    /// Like `read`, handing each byte to `sink` instead of storing it.
    pub fn read_forward(
        &mut self,
        sector: LBA,
        offset: usize,
        count: usize,
        sink: &mut dyn FnMut(u8),
    ) -> Result<(), Error<E>> {
        self.read_into(sector, offset, Destination::Forward { count, sink })
    }

    pub fn read_block(&mut self, sector: LBA, block: &mut [u8; BLOCK_SIZE]) -> Result<(), Error<E>> {
        self.read(sector, 0, &mut block[..])
    }

    pub fn write(&mut self, op: WriteOp<'_>) -> Result<(), Error<E>> {
        match (op, self.transaction) {
            (WriteOp::Open { sector }, Transaction::Closed) => {
                if self.card.is_none() {
                    return Err(Error::NotInitialized);
                }
                self.bus.open(self.card.address(sector))?;
                self.transaction = Transaction::Open { remaining: BLOCK_SIZE };
                Ok(())
            }
            (WriteOp::Open { .. }, Transaction::Open { .. }) => Err(Error::TransactionOpen),
            (WriteOp::Payload(bytes), Transaction::Open { remaining }) => {
                let size = core::cmp::min(bytes.len(), remaining);
                if size < bytes.len() {
                    warn!("Payload overruns block, {} bytes dropped", bytes.len() - size);
                }
                self.transaction = Transaction::Open { remaining: remaining - size };
                self.bus.send(&bytes[..size])
            }
            (WriteOp::Close, Transaction::Open { remaining }) => {
                self.transaction = Transaction::Closed;
                self.bus.close(&mut self.delay, &self.config, remaining)
            }
            (_, Transaction::Closed) => Err(Error::NoTransaction),
        }
    }

    pub fn write_block(&mut self, sector: LBA, block: &[u8; BLOCK_SIZE]) -> Result<(), Error<E>> {
        self.write(WriteOp::Open { sector })?;
        self.write(WriteOp::Payload(&block[..]))?;
        self.write(WriteOp::Close)
    }
}

mod test {
    #[cfg(test)]
    use crate::bus::sim::{self, Card, CountingDelay, Kind, SimPort, SimSelect};
    #[cfg(test)]
    use crate::bus::spi::Bus;

    #[cfg(test)]
    type TestSD = super::SD<Bus<SimPort, SimSelect>, CountingDelay>;

    #[cfg(test)]
    fn sd(card: Card) -> (TestSD, sim::Shared) {
        let (bus, card) = sim::bus(card);
        (super::SD::new(bus, CountingDelay::default()), card)
    }

    #[test]
    fn test_detect_card_types() {
        use super::CardType;

        let cases = [
            (Kind::Mmc, CardType::MMC),
            (Kind::Sd1, CardType::SD1),
            (Kind::Sd2 { high_capacity: false }, CardType::SD2),
            (Kind::Sd2 { high_capacity: true }, CardType::SD2 | CardType::BLOCK),
        ];
        for (kind, expected) in cases {
            let (mut sd, card) = sd(Card::new(kind));
            assert_eq!(sd.initialize().unwrap(), expected);
            assert_eq!(sd.card_type(), expected);
            assert!(!(expected.is_mmc() && expected.is_sd()));
            assert_eq!(card.borrow().speeds, [super::bus::spi::Speed::Slow, super::bus::spi::Speed::Fast]);
            assert!(!card.borrow().selected());
        }
    }

    #[test]
    fn test_detect_waits_for_idle_exit() {
        let mut card = Card::new(Kind::Sd2 { high_capacity: true });
        card.idle_polls = 3;
        let (mut sd, _) = sd(card);
        sd.initialize().unwrap();
        assert_eq!(sd.delay.calls, 3);
        assert_eq!(sd.delay.total_us, 3000);
    }

    #[test]
    fn test_no_card() {
        use super::bus::Error;

        let (mut sd, _) = sd(Card::new(Kind::Absent));
        assert!(matches!(sd.initialize(), Err(Error::NotReady)));
        assert!(sd.card_type().is_none());
        assert_eq!(sd.delay.calls, 0);
    }

    #[test]
    fn test_stuck_card_bounded() {
        use super::bus::Error;

        for kind in [Kind::Sd2 { high_capacity: false }, Kind::Sd1, Kind::Mmc] {
            let mut card = Card::new(kind);
            card.idle_polls = usize::MAX;
            let (mut sd, _) = sd(card);
            assert!(matches!(sd.initialize(), Err(Error::NotReady)));
            assert!(sd.card_type().is_none());
            assert_eq!(sd.delay.calls, 1000);
            assert_eq!(sd.delay.total_us, 1000 * 1000);
        }
    }

    #[test]
    fn test_voltage_mismatch() {
        use super::bus::Error;

        let mut card = Card::new(Kind::Sd2 { high_capacity: true });
        card.echo = 0x55;
        let (mut sd, _) = sd(card);
        assert!(matches!(sd.initialize(), Err(Error::NotReady)));
    }

    #[test]
    fn test_voltage_window_echo() {
        use super::bus::Error;

        for voltage in [0x11, 0x03, 0x00] {
            let mut card = Card::new(Kind::Sd2 { high_capacity: true });
            card.voltage = Some(voltage);
            let (mut sd, _) = sd(card);
            assert!(matches!(sd.initialize(), Err(Error::NotReady)));
            assert!(sd.card_type().is_none());
        }
    }

    #[test]
    fn test_block_length_rejected() {
        use super::bus::Error;

        for kind in [Kind::Sd1, Kind::Mmc] {
            let mut card = Card::new(kind);
            card.reject_blocklen = true;
            let (mut sd, card) = sd(card);
            assert!(matches!(sd.initialize(), Err(Error::NotReady)));
            assert!(sd.card_type().is_none());
            assert!(!card.borrow().selected());
        }
    }

    #[test]
    fn test_ocr_rejected() {
        use super::bus::Error;

        let mut card = Card::new(Kind::Sd2 { high_capacity: true });
        card.reject_ocr = true;
        let (mut sd, card) = sd(card);
        assert!(matches!(sd.initialize(), Err(Error::NotReady)));
        assert!(sd.card_type().is_none());
        assert!(!card.borrow().selected());
    }

    #[test]
    fn test_reinitialize_after_failure() {
        use super::{bus::Error, CardType};

        let (mut sd, card) = sd(Card::new(Kind::Sd1));
        assert_eq!(sd.initialize().unwrap(), CardType::SD1);
        card.borrow_mut().reject_blocklen = true;
        assert!(matches!(sd.initialize(), Err(Error::NotReady)));
        assert!(sd.card_type().is_none());
    }

    #[test]
    fn test_not_initialized() {
        use super::{bus::Error, WriteOp};

        let (mut sd, _) = sd(Card::new(Kind::Sd1));
        let mut buffer = [0u8; 16];
        assert!(matches!(sd.read(0, 0, &mut buffer), Err(Error::NotInitialized)));
        assert!(matches!(sd.write(WriteOp::Open { sector: 1 }), Err(Error::NotInitialized)));
        assert!(matches!(sd.write(WriteOp::Payload(&buffer)), Err(Error::NoTransaction)));
        assert!(matches!(sd.write(WriteOp::Close), Err(Error::NoTransaction)));
    }

    #[test]
    fn test_sector_address() {
        for (kind, address) in [
            (Kind::Sd1, 1536),
            (Kind::Mmc, 1536),
            (Kind::Sd2 { high_capacity: false }, 1536),
            (Kind::Sd2 { high_capacity: true }, 3),
        ] {
            let (mut sd, card) = sd(Card::new(kind));
            sd.initialize().unwrap();
            let mut block = [0u8; super::BLOCK_SIZE];
            sd.read_block(3, &mut block).unwrap();
            assert_eq!(card.borrow().last_address, Some(address));
            assert_eq!(block, card.borrow().blocks[3]);
        }
    }

    #[test]
    fn test_round_trip() {
        use super::BLOCK_SIZE;

        let (mut sd, card) = sd(Card::new(Kind::Sd2 { high_capacity: true }));
        sd.initialize().unwrap();

        let mut original = [0u8; BLOCK_SIZE];
        sd.read_block(7, &mut original).unwrap();
        sd.write_block(7, &original).unwrap();
        let mut again = [0u8; BLOCK_SIZE];
        sd.read_block(7, &mut again).unwrap();
        assert_eq!(original, again);

        let mut block = [0u8; BLOCK_SIZE];
        for (i, byte) in block.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        sd.write_block(2, &block).unwrap();
        sd.read_block(2, &mut again).unwrap();
        assert_eq!(block, again);
        assert_eq!(card.borrow().blocks[2], block);
    }

    #[test]
    fn test_partial_read_drains_packet() {
        for (offset, count) in [(100, 50), (0, 512), (462, 50), (0, 0), (511, 1)] {
            let (mut sd, card) = sd(Card::new(Kind::Sd1));
            sd.initialize().unwrap();
            card.borrow_mut().transcript.clear();

            let mut buffer = vec![0u8; count];
            sd.read(4, offset, &mut buffer).unwrap();
            let card = card.borrow();
            assert_eq!(buffer[..], card.blocks[4][offset..offset + count]);
            assert_eq!(card.packet_bytes_clocked(), 514);
        }
    }

    #[test]
    fn test_read_forward() {
        let (mut sd, card) = sd(Card::new(Kind::Sd2 { high_capacity: false }));
        sd.initialize().unwrap();
        card.borrow_mut().transcript.clear();

        let mut forwarded = Vec::new();
        sd.read_forward(1, 10, 20, &mut |byte| forwarded.push(byte)).unwrap();
        let card = card.borrow();
        assert_eq!(forwarded[..], card.blocks[1][10..30]);
        assert_eq!(card.packet_bytes_clocked(), 514);
    }

    #[test]
    fn test_read_out_of_range() {
        use super::bus::Error;

        let (mut sd, card) = sd(Card::new(Kind::Sd1));
        sd.initialize().unwrap();
        card.borrow_mut().transcript.clear();
        let mut buffer = [0u8; 20];
        assert!(matches!(sd.read(0, 500, &mut buffer), Err(Error::OutOfRange)));
        assert!(card.borrow().transcript.is_empty());
    }

    #[test]
    fn test_read_rejected_and_timeout() {
        use super::bus::Error;

        let (mut sd, card) = sd(Card::new(Kind::Sd1));
        sd.initialize().unwrap();
        let mut buffer = [0u8; 8];
        // Past the last block: address error
        assert!(matches!(sd.read(100, 0, &mut buffer), Err(Error::Rejected(0x20))));
        assert!(!card.borrow().selected());

        card.borrow_mut().token_latency = usize::MAX;
        assert!(matches!(sd.read(0, 0, &mut buffer), Err(Error::TokenTimeout)));
        assert!(!card.borrow().selected());
        assert_eq!(sd.delay.calls, 1000);
        assert_eq!(sd.delay.total_us, 1000 * 100);
    }

    #[test]
    fn test_read_card_gone_silent() {
        use super::bus::Error;

        let (mut sd, card) = sd(Card::new(Kind::Sd2 { high_capacity: false }));
        sd.initialize().unwrap();
        card.borrow_mut().kind = Kind::Absent;
        let mut buffer = [0u8; 8];
        assert!(matches!(sd.read(0, 0, &mut buffer), Err(Error::CommandTimeout(17))));
        assert!(!card.borrow().selected());
        assert_eq!(sd.delay.calls, 0);
    }

    #[test]
    fn test_write_open_rejected() {
        use super::{bus::Error, WriteOp};

        let (mut sd, card) = sd(Card::new(Kind::Sd1));
        sd.initialize().unwrap();
        assert!(matches!(sd.write(WriteOp::Open { sector: 100 }), Err(Error::Rejected(0x20))));
        assert!(!card.borrow().selected());
        assert!(matches!(sd.write(WriteOp::Payload(&[0u8; 4])), Err(Error::NoTransaction)));
        assert!(matches!(sd.write(WriteOp::Close), Err(Error::NoTransaction)));
    }

    #[test]
    fn test_write_header_fault_releases() {
        use super::{bus::Error, WriteOp};
        use crate::bus::{sim::Fault, spi};

        let (mut sd, card) = sd(Card::new(Kind::Sd1));
        sd.initialize().unwrap();
        sd.bus(|bus| bus.port(|port| port.fault_on = Some(0xFE)));
        let result = sd.write(WriteOp::Open { sector: 1 });
        assert!(matches!(result, Err(Error::BUS(spi::Error::Port(Fault)))));
        assert!(!card.borrow().selected());
        assert!(matches!(sd.write(WriteOp::Close), Err(Error::NoTransaction)));
    }

    #[test]
    fn test_short_write_padded() {
        use super::{WriteOp, BLOCK_SIZE};

        let (mut sd, card) = sd(Card::new(Kind::Sd1));
        sd.initialize().unwrap();

        sd.write(WriteOp::Open { sector: 5 }).unwrap();
        sd.write(WriteOp::Payload(&[0xAB; 100])).unwrap();
        sd.write(WriteOp::Payload(&[0xCD; 200])).unwrap();
        sd.write(WriteOp::Close).unwrap();

        let card = card.borrow();
        let packet = card.last_packet.as_ref().unwrap();
        assert_eq!(packet.len(), BLOCK_SIZE + 2);
        assert!(packet[..100].iter().all(|&b| b == 0xAB));
        assert!(packet[100..300].iter().all(|&b| b == 0xCD));
        assert!(packet[300..].iter().all(|&b| b == 0));
        assert_eq!(card.blocks[5][..300], packet[..300]);
        assert_eq!(card.last_address, Some(5 * 512));
        assert!(!card.selected());
    }

    #[test]
    fn test_payload_overrun_dropped() {
        use super::WriteOp;

        let (mut sd, card) = sd(Card::new(Kind::Sd1));
        sd.initialize().unwrap();
        sd.write(WriteOp::Open { sector: 0 }).unwrap();
        sd.write(WriteOp::Payload(&[0x11; 500])).unwrap();
        sd.write(WriteOp::Payload(&[0x22; 20])).unwrap();
        sd.write(WriteOp::Close).unwrap();

        let card = card.borrow();
        assert!(card.blocks[0][..500].iter().all(|&b| b == 0x11));
        assert!(card.blocks[0][500..].iter().all(|&b| b == 0x22));
    }

    #[test]
    fn test_write_rejected_skips_busy_poll() {
        use super::{bus::Error, WriteOp};

        let mut card = Card::new(Kind::Sd2 { high_capacity: true });
        card.reject_writes = true;
        let (mut sd, card) = sd(card);
        sd.initialize().unwrap();

        sd.write(WriteOp::Open { sector: 1 }).unwrap();
        sd.write(WriteOp::Payload(&[0x5A; 512])).unwrap();
        card.borrow_mut().transcript.clear();
        assert!(matches!(sd.write(WriteOp::Close), Err(Error::Rejected(0x0B))));
        assert_eq!(sd.delay.calls, 0);

        let card = card.borrow();
        // 2 CRC bytes, the data response, then straight to release
        let selected = card.transcript.iter().take_while(|x| x.selected).count();
        assert_eq!(selected, 3);
        assert!(!card.selected());
        assert!(matches!(sd.write(WriteOp::Close), Err(Error::NoTransaction)));
    }

    #[test]
    fn test_write_busy_timeout() {
        use super::{bus::Error, WriteOp};

        let mut card = Card::new(Kind::Sd1);
        card.busy_bytes = usize::MAX;
        let (mut sd, card) = sd(card);
        sd.initialize().unwrap();
        sd.write(WriteOp::Open { sector: 1 }).unwrap();
        assert!(matches!(sd.write(WriteOp::Close), Err(Error::TokenTimeout)));
        assert_eq!(sd.delay.calls, 10000);
        assert!(!card.borrow().selected());
    }

    #[test]
    fn test_open_twice() {
        use super::{bus::Error, WriteOp};

        let (mut sd, _) = sd(Card::new(Kind::Sd1));
        sd.initialize().unwrap();
        sd.write(WriteOp::Open { sector: 1 }).unwrap();
        assert!(matches!(sd.write(WriteOp::Open { sector: 2 }), Err(Error::TransactionOpen)));
        sd.write(WriteOp::Close).unwrap();
    }
}
