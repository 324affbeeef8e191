/// Retry budgets and poll intervals of the card protocol.
///
/// Every timeout is `attempts × interval`; the defaults cover the worst-case
/// card latencies of about 1s for bring-up, 100ms before read data and 1s
/// for a block write to complete.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Config {
    /// ACMD41 / CMD1 attempts while leaving the idle state.
    pub init_attempts: usize,
    pub init_interval_us: u32,
    /// Polls for the data start token of a read.
    pub read_token_attempts: usize,
    pub read_token_interval_us: u32,
    /// Polls for the end of busy after a write.
    pub write_busy_attempts: usize,
    pub write_busy_interval_us: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            init_attempts: 1000,
            init_interval_us: 1000,
            read_token_attempts: 1000,
            read_token_interval_us: 100,
            write_busy_attempts: 10000,
            write_busy_interval_us: 100,
        }
    }
}
