pub mod bus;
pub mod calibrate;
pub mod read;
pub mod write;

use embedded_hal::digital::v2::OutputPin;

use crate::{
    bus::Init,
    config::Config,
    delay::Delay,
    sd::{
        command::{AppCommand, Command, SendInterfaceCondition},
        response, CardType, BLOCK_SIZE,
    },
};
pub use bus::{BUSError, Bus, Direction, Error, Port, Speed, FILLER};
pub use calibrate::{Calibration, TimedTransferProbe, Width};

impl<E, F, PORT, CS> Bus<PORT, CS>
where
    PORT: Port<Error = E>,
    CS: OutputPin<Error = F>,
{
    /// Repeats `cmd` until the card leaves the idle state.
    fn leave_idle<D: Delay>(
        &mut self,
        delay: &mut D,
        config: &Config,
        cmd: Command,
    ) -> Result<(), BUSError<E, F>> {
        for _ in 0..config.init_attempts {
            if self.issue(cmd)?.ready() {
                return Ok(());
            }
            delay.delay_us(config.init_interval_us);
        }
        warn!("Card still idle after {} attempts of CMD{}", config.init_attempts, cmd.index());
        Err(BUSError::NotReady)
    }

    fn detect<D: Delay>(&mut self, delay: &mut D, config: &Config) -> Result<CardType, BUSError<E, F>> {
        let r1 = self.issue(Command::GoIdleState)?;
        if !r1.idle() {
            debug!("No card in idle state, R1 {:02X}", r1.0);
            return Err(BUSError::NotReady);
        }

        let r = self.send_command(Command::SendIfCond(SendInterfaceCondition::spi()))?;
        if r.r1.idle() {
            let r7 = response::R7(r.ex);
            if !r7.voltage_accepted() || r7.echo_back_check_pattern() != 0xAA {
                debug!("Voltage window not accepted, R7 {:08X}", r.ex);
                return Err(BUSError::NotReady);
            }
            self.leave_idle(delay, config, Command::App(AppCommand::SDSendOpCond(true)))?;
            let r = self.send_command(Command::ReadOCR)?;
            if !r.r1.ready() {
                return Err(BUSError::NotReady);
            }
            return Ok(match response::R3(r.ex).card_capacity_status() {
                true => CardType::SD2 | CardType::BLOCK,
                false => CardType::SD2,
            });
        }

        let probe = Command::App(AppCommand::SDSendOpCond(false));
        let (card, cmd) = match self.issue(probe)?.0 <= 1 {
            true => (CardType::SD1, probe),
            false => (CardType::MMC, Command::SendOpCond),
        };
        self.leave_idle(delay, config, cmd)?;
        if !self.issue(Command::SetBlockLength(BLOCK_SIZE as u32))?.ready() {
            return Err(BUSError::NotReady);
        }
        Ok(card)
    }
}

impl<E, F, PORT, CS> Init for Bus<PORT, CS>
where
    PORT: Port<Error = E>,
    CS: OutputPin<Error = F>,
{
    type Error = Error<E, F>;

    /// Runs at the identification clock; see `speed_up`.
    fn init<D: Delay>(&mut self, delay: &mut D, config: &Config) -> Result<CardType, BUSError<E, F>> {
        self.set_speed(Speed::Slow)?;
        // Supply minimum of 74 clock cycles without CS asserted.
        self.select(false)?;
        self.skip(10, FILLER)?;

        let result = self.detect(delay, config);
        match &result {
            Ok(card) => debug!("Card {:?} detected", card),
            Err(_) => debug!("No usable card detected"),
        }
        let released = self.release();
        result.and_then(|card| released.map(|_| card))
    }

    fn speed_up(&mut self) -> Result<(), BUSError<E, F>> {
        self.set_speed(Speed::Fast)
    }
}
