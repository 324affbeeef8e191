use embedded_hal::digital::v2::OutputPin;

use crate::{
    bus::{Destination, Read},
    config::Config,
    delay::Delay,
    sd::{
        command::Command,
        transfer::{Token, TokenError},
        BLOCK_SIZE,
    },
};

use super::bus::{BUSError, Bus, Direction, Error, Port, FILLER};

/// Data block plus its trailing CRC.
const PACKET_SIZE: usize = BLOCK_SIZE + 2;

impl<E, F, PORT, CS> Bus<PORT, CS>
where
    PORT: Port<Error = E>,
    CS: OutputPin<Error = F>,
{
    fn wait_start_token<D: Delay>(&mut self, delay: &mut D, config: &Config) -> Result<(), BUSError<E, F>> {
        for _ in 0..config.read_token_attempts {
            delay.delay_us(config.read_token_interval_us);
            let byte = self.rx()?;
            if byte == FILLER {
                continue;
            }
            match Token::try_from(byte) {
                Ok(Token::Start) => return Ok(()),
                Err(TokenError::NotToken) => continue,
                Err(e) => {
                    warn!("Data error token {:02X}: {:?}", byte, e);
                    return Err(BUSError::Rejected(byte));
                }
            }
        }
        warn!("No data token after {} attempts", config.read_token_attempts);
        Err(BUSError::TokenTimeout)
    }

    fn read_window<D: Delay>(
        &mut self,
        delay: &mut D,
        config: &Config,
        address: u32,
        offset: usize,
        destination: Destination<'_>,
    ) -> Result<(), BUSError<E, F>> {
        let cmd = Command::ReadSingleBlock(address);
        let r1 = self.send_command(cmd)?.r1;
        if !r1.ready() {
            return Err(BUSError::from_r1(cmd.index(), r1));
        }
        self.wait_start_token(delay, config)?;

        let count = destination.len();
        self.skip(offset, FILLER)?;
        match destination {
            Destination::Buffer(buffer) => self.transfer_bytes(Direction::Receive(buffer, FILLER))?,
            Destination::Forward { count, sink } => {
                for _ in 0..count {
                    sink(self.rx()?);
                }
            }
        }
        self.skip(PACKET_SIZE - offset - count, FILLER)
    }
}

impl<E, F, PORT, CS> Read for Bus<PORT, CS>
where
    PORT: Port<Error = E>,
    CS: OutputPin<Error = F>,
{
    type Error = Error<E, F>;

    /// Reads `destination.len()` bytes starting `offset` bytes into the block
    /// at `address`. The whole packet is always drained.
    fn read<D: Delay>(
        &mut self,
        delay: &mut D,
        config: &Config,
        address: u32,
        offset: usize,
        destination: Destination<'_>,
    ) -> Result<(), BUSError<E, F>> {
        if offset.saturating_add(destination.len()) > BLOCK_SIZE {
            return Err(BUSError::OutOfRange);
        }
        let result = self.read_window(delay, config, address, offset, destination);
        let released = self.release();
        result.and(released)
    }
}
