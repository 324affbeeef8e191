use crate::config::Config;
use crate::delay::Delay;
use crate::sd::response::R1;
use crate::sd::CardType;

#[derive(Debug)]
pub enum Error<BUS> {
    BUS(BUS),
    NotReady,            // Bring-up did not detect a usable card
    CommandTimeout(u8),  // R1 never became valid, command index
    TokenTimeout,        // No data token or busy release within attempts
    Rejected(u8),        // Error R1, error token or refused data response
    NotInitialized,      // No card detected yet
    NoTransaction,       // Write payload or close without open
    TransactionOpen,     // Write open while another is in flight
    OutOfRange,          // Partial window exceeds the sector
}

impl<BUS> Error<BUS> {
    /// Classifies a non-ready R1 returned for `command`.
    pub(crate) fn from_r1(command: u8, r1: R1) -> Self {
        match r1.valid() {
            true => Self::Rejected(r1.0),
            false => Self::CommandTimeout(command),
        }
    }
}

/// Where the bytes of a partial sector read go.
pub enum Destination<'a> {
    Buffer(&'a mut [u8]),
    /// Each byte handed to the sink as it leaves the bus.
    Forward { count: usize, sink: &'a mut dyn FnMut(u8) },
}

impl<'a> Destination<'a> {
    pub fn len(&self) -> usize {
        match self {
            Self::Buffer(buffer) => buffer.len(),
            Self::Forward { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait Init {
    type Error;
    fn init<D: Delay>(&mut self, delay: &mut D, config: &Config) -> Result<CardType, Error<Self::Error>>;
    fn speed_up(&mut self) -> Result<(), Error<Self::Error>>;
}

pub trait Read {
    type Error;
    fn read<D: Delay>(
        &mut self,
        delay: &mut D,
        config: &Config,
        address: u32,
        offset: usize,
        destination: Destination<'_>,
    ) -> Result<(), Error<Self::Error>>;
}

pub trait Write {
    type Error;
    fn open(&mut self, address: u32) -> Result<(), Error<Self::Error>>;
    fn send(&mut self, bytes: &[u8]) -> Result<(), Error<Self::Error>>;
    fn close<D: Delay>(
        &mut self,
        delay: &mut D,
        config: &Config,
        padding: usize,
    ) -> Result<(), Error<Self::Error>>;
}

#[cfg(feature = "linux-spi")]
pub mod linux;
#[cfg(test)]
pub(crate) mod sim;
pub mod spi;
