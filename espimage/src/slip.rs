//! SLIP (Serial Line Internet Protocol) framing
//!
//! The ROM bootloader frames every command and reply with the classic SLIP
//! delimiter/escape scheme.

use thiserror::Error;

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SlipError {
    #[error("invalid byte 0x{0:02x} following SLIP escape")]
    InvalidEscape(u8),

    #[error("truncated SLIP frame")]
    Truncated,
}

/// Encode one frame: delimiter, byte-stuffed payload, delimiter.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2 + 2);
    out.push(END);
    for &byte in data {
        match byte {
            END => {
                out.push(ESC);
                out.push(ESC_END);
            }
            ESC => {
                out.push(ESC);
                out.push(ESC_ESC);
            }
            _ => out.push(byte),
        }
    }
    out.push(END);
    out
}

/// Decode one frame from a byte stream, undoing the escape stuffing.
///
/// A single leading delimiter is tolerated; the frame ends at the next
/// delimiter. A missing terminator or a bad escape pair is a framing error.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, SlipError> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().peekable();
    if iter.peek() == Some(&&END) {
        iter.next();
    }
    while let Some(&byte) = iter.next() {
        match byte {
            END => return Ok(out),
            ESC => match iter.next() {
                Some(&ESC_END) => out.push(END),
                Some(&ESC_ESC) => out.push(ESC),
                Some(&other) => return Err(SlipError::InvalidEscape(other)),
                None => return Err(SlipError::Truncated),
            },
            _ => out.push(byte),
        }
    }
    Err(SlipError::Truncated)
}
