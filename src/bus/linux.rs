use std::io;

use gpio::{sysfs::SysFsGpioOutput, GpioOut};
use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};

use crate::bus::spi::{self, Speed, TimedTransferProbe, Width};

const SLOW_HZ: u32 = 400_000;
pub const DEFAULT_FAST_HZ: u32 = 10_000_000;

/// spidev exchanges complete before the ioctl returns, so the received
/// bytes are latched into a software register.
pub struct SPI {
    dev: Spidev,
    latched: u16,
    fast_hz: u32,
}

impl SPI {
    pub fn new(spi: &str, fast_hz: u32) -> io::Result<Self> {
        let mut dev = Spidev::open(spi)?;
        dev.configure(&Self::options(SLOW_HZ))?;
        Ok(Self { dev, latched: 0xFFFF, fast_hz })
    }

    fn options(hz: u32) -> SpidevOptions {
        SpidevOptions::new().bits_per_word(8).max_speed_hz(hz).mode(SpiModeFlags::SPI_MODE_0).build()
    }

    fn exchange<const N: usize>(&mut self, tx: [u8; N]) -> io::Result<[u8; N]> {
        let mut rx = [0u8; N];
        self.dev.transfer(&mut SpidevTransfer::read_write(&tx, &mut rx))?;
        Ok(rx)
    }
}

impl spi::Port for SPI {
    type Error = io::Error;

    fn shift8(&mut self, tx: u8) -> io::Result<()> {
        let rx = self.exchange([tx])?;
        self.latched = rx[0] as u16;
        Ok(())
    }

    fn shift16(&mut self, tx: u16) -> io::Result<()> {
        let rx = self.exchange(tx.to_be_bytes())?;
        self.latched = u16::from_be_bytes(rx);
        Ok(())
    }

    fn rx8(&mut self) -> io::Result<u8> {
        Ok(self.latched as u8)
    }

    fn rx16(&mut self) -> io::Result<u16> {
        Ok(self.latched)
    }

    // Mode 0 leaves the clock low between transfers
    fn idle(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn set_speed(&mut self, speed: Speed) -> io::Result<()> {
        let hz = match speed {
            Speed::Slow => SLOW_HZ,
            Speed::Fast => self.fast_hz,
        };
        debug!("SPI clock {}Hz", hz);
        self.dev.configure(&Self::options(hz))
    }

    fn nop(&mut self, _cycles: u8) {}
}

impl TimedTransferProbe for SPI {
    type Error = io::Error;

    fn probe(&mut self, width: Width, _nops: u8, samples: &mut [u8]) -> io::Result<()> {
        samples.iter_mut().for_each(|sample| *sample = width.clocks());
        Ok(())
    }
}

pub struct GPIO(SysFsGpioOutput);

impl embedded_hal::digital::v2::OutputPin for GPIO {
    type Error = io::Error;

    fn set_high(&mut self) -> io::Result<()> {
        self.0.set_value(true)
    }

    fn set_low(&mut self) -> io::Result<()> {
        self.0.set_value(false)
    }
}

/// Opens the spidev device and chip select GPIO; transfers are calibrated
/// by the time this returns.
pub fn spi(spi: &str, cs: u16, fast_hz: u32) -> io::Result<spi::Bus<SPI, GPIO>> {
    let port = SPI::new(spi, fast_hz)?;
    let cs = SysFsGpioOutput::open(cs)?;
    let mut bus = spi::Bus::new(port, GPIO(cs));
    let calibration = bus.calibrate().map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{:?}", e)))?;
    trace!("Calibration {:?}", calibration);
    Ok(bus)
}
