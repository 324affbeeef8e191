pub mod command;
pub mod response;
pub mod transfer;

use core::fmt;

use bitfield::Bit;

pub const BLOCK_SIZE: usize = 512;

/// Kind of card found by the last bring-up, as a set of flags.
///
/// `SD1` and `SD2` never appear together, `BLOCK` only accompanies an SD
/// variant. The empty set means no usable card.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct CardType(u8);

impl CardType {
    pub const NONE: Self = Self(0);
    pub const MMC: Self = Self(1 << 0);
    pub const SD1: Self = Self(1 << 1);
    pub const SD2: Self = Self(1 << 2);
    pub const BLOCK: Self = Self(1 << 3);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_mmc(self) -> bool {
        self.0.bit(0)
    }

    pub fn is_sd1(self) -> bool {
        self.0.bit(1)
    }

    pub fn is_sd2(self) -> bool {
        self.0.bit(2)
    }

    pub fn is_sd(self) -> bool {
        self.is_sd1() || self.is_sd2()
    }

    /// Block-addressed (high capacity) card.
    pub fn block_addressing(self) -> bool {
        self.0.bit(3)
    }

    /// Bus address of `sector`: byte address for byte-addressed cards,
    /// the sector number itself otherwise.
    pub fn address(self, sector: u32) -> u32 {
        match self.block_addressing() {
            true => sector,
            false => sector.wrapping_mul(BLOCK_SIZE as u32),
        }
    }
}

impl core::ops::BitOr for CardType {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Debug for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("None");
        }
        let names = [(Self::MMC, "MMC"), (Self::SD1, "SD1"), (Self::SD2, "SD2"), (Self::BLOCK, "BLOCK")];
        let mut first = true;
        for (flag, name) in names.iter() {
            if self.0 & flag.0 == 0 {
                continue;
            }
            if !first {
                f.write_str(" | ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

mod test {
    #[test]
    fn test_sector_address() {
        use super::CardType;

        assert_eq!((CardType::SD2).address(3), 1536);
        assert_eq!(CardType::MMC.address(3), 1536);
        assert_eq!((CardType::SD2 | CardType::BLOCK).address(3), 3);
    }

    #[test]
    fn test_card_type_flags() {
        use super::CardType;

        let card = CardType::SD2 | CardType::BLOCK;
        assert!(card.is_sd() && card.is_sd2() && card.block_addressing());
        assert!(!card.is_mmc() && !card.is_sd1());
        assert!(CardType::NONE.is_none());
        assert_eq!(format!("{:?}", card), "SD2 | BLOCK");
        assert_eq!(format!("{:?}", CardType::NONE), "None");
    }
}
