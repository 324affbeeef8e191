use embedded_hal::digital::v2::OutputPin;

use super::bus::{BUSError, Bus, Port};

/// Transfer granularity with its own settle delay.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Width {
    Byte,
    Word,
    /// Single exchange whose received byte is read right away.
    Duplex,
}

impl Width {
    /// Clocks a transfer of this width takes.
    pub fn clocks(self) -> u8 {
        match self {
            Self::Byte | Self::Duplex => 8,
            Self::Word => 16,
        }
    }
}

/// No-op cycles to wait after starting a transfer, per width.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Calibration {
    pub byte: u8,
    pub word: u8,
    pub duplex: u8,
}

impl Calibration {
    pub const MAX_NOPS: u8 = 32;
    pub const CONSERVATIVE: Self =
        Self { byte: Self::MAX_NOPS, word: Self::MAX_NOPS, duplex: Self::MAX_NOPS };

    pub fn nops(&self, width: Width) -> u8 {
        match width {
            Width::Byte => self.byte,
            Width::Word => self.word,
            Width::Duplex => self.duplex,
        }
    }

    fn set(&mut self, width: Width, nops: u8) {
        match width {
            Width::Byte => self.byte = nops,
            Width::Word => self.word = nops,
            Width::Duplex => self.duplex = nops,
        }
    }
}

/// Samples per self-test burst.
pub const PROBE_SAMPLES: usize = 64;

/// Timed self-test transfers of the controller.
///
/// Backends without a transfer timer, or whose transfers complete
/// synchronously, report every sample as settled.
pub trait TimedTransferProbe {
    type Error;
    /// Runs `samples.len()` back-to-back transfers of `width` with the card
    /// deselected, waiting `nops` cycles before each result is read. Each
    /// sample is the number of clocks the controller had completed when the
    /// result was read.
    fn probe(&mut self, width: Width, nops: u8, samples: &mut [u8]) -> Result<(), Self::Error>;
}

impl<E, F, PORT, CS> Bus<PORT, CS>
where
    PORT: Port<Error = E> + TimedTransferProbe<Error = E>,
    CS: OutputPin<Error = F>,
{
    /// Measures the shortest delay after which each transfer width has
    /// latched its result, and adopts it.
    pub fn calibrate(&mut self) -> Result<Calibration, BUSError<E, F>> {
        self.select(false)?;
        let mut samples = [0u8; PROBE_SAMPLES];
        let mut calibration = Calibration::default();
        for width in [Width::Byte, Width::Word, Width::Duplex] {
            let nops = self.settle(width, &mut samples)?;
            calibration.set(width, nops);
        }
        debug!("Transfer calibration {:?}", calibration);
        self.set_calibration(calibration);
        Ok(calibration)
    }

    fn settle(&mut self, width: Width, samples: &mut [u8]) -> Result<u8, BUSError<E, F>> {
        for nops in 0..=Calibration::MAX_NOPS {
            self.port(|port| port.probe(width, nops, samples)).map_err(Self::port_error)?;
            if samples.iter().all(|&clocks| clocks >= width.clocks()) {
                return Ok(nops);
            }
        }
        warn!("{:?} transfers never settled, using {} nops", width, Calibration::MAX_NOPS);
        Ok(Calibration::MAX_NOPS)
    }
}

mod test {
    #[test]
    fn test_calibrate() {
        use super::{Calibration, Width};
        use crate::bus::sim::{self, Card, Kind};

        let (mut bus, _) = sim::bus(Card::new(Kind::Sd1));
        assert_eq!(bus.calibration(), Calibration::CONSERVATIVE);
        bus.port(|port| port.settle = [2, 5, 0]);
        let calibration = bus.calibrate().unwrap();
        assert_eq!(calibration, Calibration { byte: 2, word: 5, duplex: 0 });
        assert_eq!(bus.calibration().nops(Width::Word), 5);
        // 3 + 6 + 1 bursts
        assert_eq!(bus.port(|port| port.probes), 10);
    }

    #[test]
    fn test_calibrate_never_settles() {
        use super::Calibration;
        use crate::bus::sim::{self, Card, Kind};

        let (mut bus, _) = sim::bus(Card::new(Kind::Sd1));
        bus.port(|port| port.settle = [1, Calibration::MAX_NOPS + 1, 1]);
        let calibration = bus.calibrate().unwrap();
        assert_eq!(calibration.word, Calibration::MAX_NOPS);
        assert_eq!(calibration.byte, 1);
    }
}
