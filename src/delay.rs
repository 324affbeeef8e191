use embedded_hal::blocking::delay::DelayUs;

/// Fixed pause between two poll attempts.
pub trait Delay: DelayUs<u32> {}

impl<T: DelayUs<u32>> Delay for T {}

#[cfg(feature = "std")]
pub mod std {
    pub struct Delay;

    impl embedded_hal::blocking::delay::DelayUs<u32> for Delay {
        fn delay_us(&mut self, us: u32) {
            ::std::thread::sleep(::std::time::Duration::from_micros(us as u64));
        }
    }
}
