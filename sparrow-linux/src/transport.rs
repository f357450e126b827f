//! Line-oriented reads over tokio streams, shared by the hub and peer sessions.

use sparrow_core::wire::{decode_raw_line, LineDecodeError, MAX_LINE_LEN, TERMINATOR};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Error, Result};

/// Read one `|`-terminated line as raw bytes, terminator kept. EOF, a read error, or a line
/// cut short is `ConnectionLost`; an oversized line is `ProtocolViolation`.
pub async fn read_raw_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = reader
        .take(MAX_LINE_LEN as u64)
        .read_until(TERMINATOR, buf)
        .await
        .map_err(|e| Error::ConnectionLost(e.to_string()))?;
    if n == 0 {
        return Err(Error::ConnectionLost("closed by remote".into()));
    }
    match decode_raw_line(buf) {
        Ok(line) => Ok(line.to_vec()),
        Err(LineDecodeError::NeedMore) => Err(Error::ConnectionLost("closed mid-line".into())),
        Err(e) => Err(Error::ProtocolViolation(e.to_string())),
    }
}

/// Read one `|`-terminated text line. Besides the `read_raw_line` failures, a non-UTF-8 line
/// is `ProtocolViolation`.
pub async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let raw = read_raw_line(reader, buf).await?;
    String::from_utf8(raw)
        .map_err(|e| Error::ProtocolViolation(format!("line is not valid UTF-8: {}", e.utf8_error())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_consecutive_lines() {
        let mut r = BufReader::new(&b"$Lock ABCD|$Hello|"[..]);
        let mut buf = Vec::new();
        assert_eq!(read_line(&mut r, &mut buf).await.unwrap(), "$Lock ABCD|");
        assert_eq!(read_line(&mut r, &mut buf).await.unwrap(), "$Hello|");
        assert!(matches!(
            read_line(&mut r, &mut buf).await,
            Err(Error::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn truncated_line_is_connection_lost() {
        let mut r = BufReader::new(&b"$Hel"[..]);
        let mut buf = Vec::new();
        assert!(matches!(
            read_line(&mut r, &mut buf).await,
            Err(Error::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn raw_lines_accept_any_bytes() {
        let mut r = BufReader::new(&b"$Key \xd1\xb1|<bob> hi|"[..]);
        let mut buf = Vec::new();
        assert_eq!(read_raw_line(&mut r, &mut buf).await.unwrap(), b"$Key \xd1\xb1|");
        assert_eq!(read_line(&mut r, &mut buf).await.unwrap(), "<bob> hi|");
    }

    #[tokio::test]
    async fn text_lines_reject_invalid_utf8() {
        let mut r = BufReader::new(&b"<bob> \xff|"[..]);
        let mut buf = Vec::new();
        assert!(matches!(
            read_line(&mut r, &mut buf).await,
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn oversized_line_is_violation() {
        let data = vec![b'a'; MAX_LINE_LEN + 10];
        let mut r = BufReader::new(&data[..]);
        let mut buf = Vec::new();
        assert!(matches!(
            read_line(&mut r, &mut buf).await,
            Err(Error::ProtocolViolation(_))
        ));
    }
}
