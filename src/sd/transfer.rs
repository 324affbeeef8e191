#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TokenError {
    NotToken,
    Generic,
    CC,
    CardECC,
    OutOfRange,
    CardLocked,
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum Token {
    Start = 0xFE,
}

impl TryFrom<u8> for Token {
    type Error = TokenError;

    fn try_from(byte: u8) -> Result<Token, TokenError> {
        if byte == Token::Start as u8 {
            return Ok(Token::Start);
        }
        // Data error tokens are 0b000x_xxxx with at least one bit set
        if byte & 0xE0 != 0 || byte == 0 {
            return Err(TokenError::NotToken);
        }
        match byte ^ (byte & byte.wrapping_sub(1)) {
            0x10 => Err(TokenError::CardLocked),
            0x8 => Err(TokenError::OutOfRange),
            0x4 => Err(TokenError::CardECC),
            0x2 => Err(TokenError::CC),
            _ => Err(TokenError::Generic),
        }
    }
}

/// Low five bits of the data response token after a written block.
pub const DATA_RESPONSE_MASK: u8 = 0x1F;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Response {
    Accepted,
    CRCError,
    WriteError,
}

impl Response {
    pub fn try_from(byte: u8) -> Option<Self> {
        if byte & 0b10001 != 0x1 {
            return None;
        }
        let value = match (byte >> 1) & 0b111 {
            0b010 => Self::Accepted,
            0b101 => Self::CRCError,
            0b110 => Self::WriteError,
            _ => return None,
        };
        Some(value)
    }
}

mod test {
    #[test]
    fn test_token() {
        use super::{Token, TokenError};

        assert_eq!(Token::try_from(0xFE), Ok(Token::Start));
        assert_eq!(Token::try_from(0xFF), Err(TokenError::NotToken));
        assert_eq!(Token::try_from(0x00), Err(TokenError::NotToken));
        assert_eq!(Token::try_from(0x08), Err(TokenError::OutOfRange));
        assert_eq!(Token::try_from(0x01), Err(TokenError::Generic));
        assert_eq!(Token::try_from(0x03), Err(TokenError::Generic));
    }

    #[test]
    fn test_data_response() {
        use super::{Response, DATA_RESPONSE_MASK};

        assert_eq!(Response::try_from(0xE5), Some(Response::Accepted));
        assert_eq!(0xE5 & DATA_RESPONSE_MASK, 0x05);
        assert_eq!(Response::try_from(0x0B), Some(Response::CRCError));
        assert_eq!(Response::try_from(0x0D), Some(Response::WriteError));
        assert_eq!(Response::try_from(0xFF), None);
    }
}
