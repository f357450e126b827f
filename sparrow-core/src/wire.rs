//! Framing: NMDC commands are text terminated by `|`. Raw payloads follow `$ADCSND` out of band.

use crate::protocol::Command;

/// Command terminator on hub and peer channels.
pub const TERMINATOR: u8 = b'|';
/// Longest line accepted from a remote, terminator included.
pub const MAX_LINE_LEN: usize = 64 * 1024; // 64 KiB

/// Encode a command into a single `|`-terminated line.
pub fn encode_line(cmd: &Command) -> Result<Vec<u8>, LineEncodeError> {
    let out = cmd.to_bytes();
    if out.len() > MAX_LINE_LEN {
        return Err(LineEncodeError::TooLarge);
    }
    if out[..out.len() - 1].contains(&TERMINATOR) {
        return Err(LineEncodeError::EmbeddedTerminator);
    }
    Ok(out)
}

/// Error encoding a command into a line.
#[derive(Debug, thiserror::Error)]
pub enum LineEncodeError {
    #[error("line too large")]
    TooLarge,
    #[error("unescaped '|' inside command")]
    EmbeddedTerminator,
}

/// Split one line off the front of `bytes` without interpreting it. Returns the line (terminator kept).
/// Peer lines such as `$Key` carry arbitrary bytes, so this never checks the encoding.
pub fn decode_raw_line(bytes: &[u8]) -> Result<&[u8], LineDecodeError> {
    let end = match bytes.iter().position(|&b| b == TERMINATOR) {
        Some(i) => i + 1,
        None if bytes.len() >= MAX_LINE_LEN => return Err(LineDecodeError::TooLarge),
        None => return Err(LineDecodeError::NeedMore),
    };
    if end > MAX_LINE_LEN {
        return Err(LineDecodeError::TooLarge);
    }
    Ok(&bytes[..end])
}

/// Decode one text line from the front of `bytes`. Returns the line (terminator kept) and the number of bytes consumed.
/// Call with partial buffer; returns error if no terminator yet (caller should try again after more data).
pub fn decode_line(bytes: &[u8]) -> Result<(String, usize), LineDecodeError> {
    let raw = decode_raw_line(bytes)?;
    let line = std::str::from_utf8(raw).map_err(LineDecodeError::Utf8)?;
    Ok((line.to_string(), raw.len()))
}

/// Error decoding a line (need more bytes, too large, or not UTF-8).
#[derive(Debug, thiserror::Error)]
pub enum LineDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("line too large")]
    TooLarge,
    #[error("line is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}
