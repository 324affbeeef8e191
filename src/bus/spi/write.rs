use embedded_hal::digital::v2::OutputPin;

use crate::{
    bus::Write,
    config::Config,
    delay::Delay,
    sd::{
        command::Command,
        transfer::{Response, Token, DATA_RESPONSE_MASK},
    },
};

use super::bus::{BUSError, Bus, Error, Port, FILLER};

/// Data response of a block the card accepted, after masking.
const ACCEPTED: u8 = 0x05;

impl<E, F, PORT, CS> Bus<PORT, CS>
where
    PORT: Port<Error = E>,
    CS: OutputPin<Error = F>,
{
    fn finish<D: Delay>(&mut self, delay: &mut D, config: &Config, padding: usize) -> Result<(), BUSError<E, F>> {
        // Unsent payload and CRC
        self.skip(padding + 2, 0x00)?;

        let byte = self.rx()?;
        if byte & DATA_RESPONSE_MASK != ACCEPTED {
            warn!("Block not accepted {:02X}: {:?}", byte, Response::try_from(byte));
            return Err(BUSError::Rejected(byte));
        }

        for _ in 0..config.write_busy_attempts {
            if self.rx()? == FILLER {
                return Ok(());
            }
            delay.delay_us(config.write_busy_interval_us);
        }
        warn!("Card still busy after {} attempts", config.write_busy_attempts);
        Err(BUSError::TokenTimeout)
    }
}

impl<E, F, PORT, CS> Write for Bus<PORT, CS>
where
    PORT: Port<Error = E>,
    CS: OutputPin<Error = F>,
{
    type Error = Error<E, F>;

    /// Starts a single block write; the card stays selected on success.
    fn open(&mut self, address: u32) -> Result<(), BUSError<E, F>> {
        let cmd = Command::WriteBlock(address);
        let r1 = self.send_command(cmd)?.r1;
        if !r1.ready() {
            let error = BUSError::from_r1(cmd.index(), r1);
            self.release()?;
            return Err(error);
        }
        if let Err(error) = self.tx(&[FILLER, Token::Start as u8]) {
            self.release()?;
            return Err(error);
        }
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), BUSError<E, F>> {
        self.tx(bytes)
    }

    /// Pads the block with `padding` zero bytes and waits for it to be programmed.
    fn close<D: Delay>(&mut self, delay: &mut D, config: &Config, padding: usize) -> Result<(), BUSError<E, F>> {
        let result = self.finish(delay, config, padding);
        let released = self.release();
        result.and(released)
    }
}
