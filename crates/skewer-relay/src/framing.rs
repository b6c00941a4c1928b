//! Stream framing: extracting whole records from a byte stream.
//!
//! Three record framers (LF, octet-counted, auto-detecting) plus the
//! RELP frame decoder, all implemented as [`tokio_util::codec::Decoder`]
//! so a reader loop is just a `FramedRead` over the socket. Framers
//! tolerate arbitrary transport-level splitting, never consume past the
//! record they emit, and enforce the configured maximum record size.
//!
//! A [`FramingError`] is fatal to the connection that produced it.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Upper bound on a RELP header (`TXNR SP COMMAND SP DATALEN`).
const MAX_RELP_HEADER: usize = 4096;
/// Upper bound on the decimal length token of octet-counted framing.
const MAX_LENGTH_DIGITS: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("record exceeds the maximum size of {max} bytes")]
    Oversize { max: usize },
    #[error("invalid octet-count length prefix")]
    BadLength,
    #[error("invalid relp header: {0}")]
    BadRelpHeader(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How a stream listener frames records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingMode {
    /// One record per line; surrounding whitespace stripped.
    Lf,
    /// RFC 6587 octet counting: `LEN SP` then exactly `LEN` bytes.
    OctetCounted,
    /// LF when the record starts with `<`, octet counting when it
    /// starts with a digit run, LF otherwise.
    #[default]
    Auto,
}

fn trim_leading(buf: &mut BytesMut) {
    let skip = buf
        .iter()
        .take_while(|b| matches!(b, b' ' | b'\r' | b'\n'))
        .count();
    buf.advance(skip);
}

fn trim_bytes(mut slice: Bytes) -> Bytes {
    let start = slice
        .iter()
        .take_while(|b| matches!(b, b' ' | b'\r' | b'\n'))
        .count();
    slice.advance(start);
    let end = slice
        .iter()
        .rev()
        .take_while(|b| matches!(b, b' ' | b'\r' | b'\n'))
        .count();
    slice.truncate(slice.len() - end);
    slice
}

/// Framer for LF, octet-counted and auto modes.
#[derive(Debug)]
pub struct RecordDecoder {
    mode: FramingMode,
    max_record_size: usize,
}

impl RecordDecoder {
    #[must_use]
    pub fn new(mode: FramingMode, max_record_size: usize) -> Self {
        RecordDecoder {
            mode,
            max_record_size,
        }
    }

    fn decode_lf(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        match buf.iter().position(|&b| b == b'\n') {
            Some(i) => {
                if i > self.max_record_size {
                    return Err(FramingError::Oversize {
                        max: self.max_record_size,
                    });
                }
                let record = buf.split_to(i).freeze();
                buf.advance(1);
                Ok(Some(trim_bytes(record)))
            }
            None if buf.len() > self.max_record_size => Err(FramingError::Oversize {
                max: self.max_record_size,
            }),
            None => Ok(None),
        }
    }

    fn decode_octet_counted(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        let digits = buf.iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == buf.len() {
            // length token may still be incomplete
            if digits > MAX_LENGTH_DIGITS {
                return Err(FramingError::BadLength);
            }
            return Ok(None);
        }
        if digits == 0 || digits > MAX_LENGTH_DIGITS || buf[digits] != b' ' {
            return Err(FramingError::BadLength);
        }
        let len: usize = std::str::from_utf8(&buf[..digits])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(FramingError::BadLength)?;
        if len > self.max_record_size {
            return Err(FramingError::Oversize {
                max: self.max_record_size,
            });
        }
        self.take_counted(buf, digits, len)
    }

    /// Consumes `LEN SP DATA` once fully buffered; the caller has
    /// already validated the length token.
    fn take_counted(
        &self,
        buf: &mut BytesMut,
        digits: usize,
        len: usize,
    ) -> Result<Option<Bytes>, FramingError> {
        let total = digits + 1 + len;
        if buf.len() < total {
            return Ok(None);
        }
        buf.advance(digits + 1);
        let record = buf.split_to(len).freeze();
        Ok(Some(trim_bytes(record)))
    }

    fn decode_auto(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        if buf[0] == b'<' {
            return self.decode_lf(buf);
        }
        let Some(sep) = buf.iter().position(|&b| b == b' ' || b == b'\n') else {
            if buf.len() > self.max_record_size {
                return Err(FramingError::Oversize {
                    max: self.max_record_size,
                });
            }
            return Ok(None);
        };
        let token = &buf[..sep];
        let parsed = std::str::from_utf8(token)
            .ok()
            .filter(|t| !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|t| t.parse::<usize>().ok());
        match parsed {
            Some(len) if len > self.max_record_size => Err(FramingError::Oversize {
                max: self.max_record_size,
            }),
            Some(len) => self.take_counted(buf, sep, len),
            // not a length token: fall back to line framing
            None => self.decode_lf(buf),
        }
    }
}

impl Decoder for RecordDecoder {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        loop {
            trim_leading(buf);
            if buf.is_empty() {
                return Ok(None);
            }
            let record = match self.mode {
                FramingMode::Lf => self.decode_lf(buf)?,
                FramingMode::OctetCounted => self.decode_octet_counted(buf)?,
                FramingMode::Auto => self.decode_auto(buf)?,
            };
            match record {
                Some(record) if record.is_empty() => continue,
                Some(record) => return Ok(Some(record)),
                None => return Ok(None),
            }
        }
    }
}

/// One RELP frame: `TXNR SP COMMAND SP DATALEN [SP DATA] LF`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelpFrame {
    pub txnr: u64,
    pub command: String,
    pub data: Bytes,
}

/// Decoder for the RELP wire framing.
#[derive(Debug)]
pub struct RelpDecoder {
    max_record_size: usize,
}

impl RelpDecoder {
    #[must_use]
    pub fn new(max_record_size: usize) -> Self {
        RelpDecoder { max_record_size }
    }
}

/// Reads a decimal token starting at `pos`. Returns `(value, next)`
/// where `next` indexes the byte after the token, or `None` when the
/// buffer ends inside the token.
fn read_number(buf: &[u8], pos: usize, what: &'static str)
    -> Result<Option<(u64, usize)>, FramingError>
{
    let digits = buf[pos..].iter().take_while(|b| b.is_ascii_digit()).count();
    if pos + digits == buf.len() {
        return Ok(None);
    }
    if digits == 0 || digits > MAX_LENGTH_DIGITS {
        return Err(FramingError::BadRelpHeader(what));
    }
    let value = std::str::from_utf8(&buf[pos..pos + digits])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(FramingError::BadRelpHeader(what))?;
    Ok(Some((value, pos + digits)))
}

impl Decoder for RelpDecoder {
    type Item = RelpFrame;
    type Error = FramingError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RelpFrame>, FramingError> {
        trim_leading(buf);
        if buf.is_empty() {
            return Ok(None);
        }
        if buf.len() > MAX_RELP_HEADER + 1 + self.max_record_size + 1 {
            // nothing valid can be this large
            return Err(FramingError::Oversize {
                max: self.max_record_size,
            });
        }

        // TXNR
        let Some((txnr, mut pos)) = read_number(buf, 0, "transaction number")? else {
            return Ok(None);
        };
        if buf[pos] != b' ' {
            return Err(FramingError::BadRelpHeader("expected space after txnr"));
        }
        pos += 1;

        // COMMAND
        let cmd_start = pos;
        while pos < buf.len() && buf[pos].is_ascii_lowercase() {
            pos += 1;
        }
        if pos == buf.len() {
            return Ok(None);
        }
        if pos == cmd_start || buf[pos] != b' ' || pos - cmd_start > 32 {
            return Err(FramingError::BadRelpHeader("invalid command"));
        }
        let command = String::from_utf8_lossy(&buf[cmd_start..pos]).into_owned();
        pos += 1;

        // DATALEN
        let Some((datalen, pos)) = read_number(buf, pos, "data length")? else {
            return Ok(None);
        };
        let datalen = datalen as usize;
        if datalen > self.max_record_size {
            return Err(FramingError::Oversize {
                max: self.max_record_size,
            });
        }

        // [SP DATA] LF -- one separator byte, the data, one trailer byte
        let (data_start, total) = if datalen == 0 {
            (pos, pos + 1)
        } else {
            (pos + 1, pos + 1 + datalen + 1)
        };
        if buf.len() < total {
            return Ok(None);
        }
        let data = if datalen == 0 {
            Bytes::new()
        } else {
            trim_bytes(buf.clone().freeze().slice(data_start..data_start + datalen))
        };
        buf.advance(total);
        Ok(Some(RelpFrame {
            txnr,
            command,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut impl Decoder<Item = Bytes, Error = FramingError>, input: &[u8])
        -> Vec<Bytes>
    {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(record) = decoder.decode(&mut buf).unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn test_lf_framing_basic() {
        let mut decoder = RecordDecoder::new(FramingMode::Lf, 1024);
        let records = decode_all(&mut decoder, b"  <13>one\r\n<13>two\n");
        assert_eq!(records, vec![Bytes::from("<13>one"), Bytes::from("<13>two")]);
    }

    #[test]
    fn test_lf_framing_across_chunks() {
        let mut decoder = RecordDecoder::new(FramingMode::Lf, 1024);
        let mut buf = BytesMut::from(&b"<13>par"[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"tial\nrest\n");
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), "<13>partial");
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), "rest");
    }

    #[test]
    fn test_octet_counted_basic() {
        let mut decoder = RecordDecoder::new(FramingMode::OctetCounted, 1024);
        let records = decode_all(&mut decoder, b"5 hello7 goodbye");
        assert_eq!(records, vec![Bytes::from("hello"), Bytes::from("goodbye")]);
    }

    #[test]
    fn test_octet_counted_waits_for_full_record() {
        let mut decoder = RecordDecoder::new(FramingMode::OctetCounted, 1024);
        let mut buf = BytesMut::from(&b"11 hello"[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b" world!");
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), "hello world");
    }

    #[test]
    fn test_octet_counted_rejects_bad_length() {
        let mut decoder = RecordDecoder::new(FramingMode::OctetCounted, 1024);
        let mut buf = BytesMut::from(&b"abc hello\n"[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FramingError::BadLength)
        ));
    }

    #[test]
    fn test_auto_detects_both_framings_in_order() {
        // first record line-framed, second octet-counted
        let mut decoder = RecordDecoder::new(FramingMode::Auto, 1024);
        let input = b"<14>1 2020-01-01T00:00:00Z h a p m - hi\n11 <14>1 again";
        let records = decode_all(&mut decoder, input);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], &b"<14>1 2020-01-01T00:00:00Z h a p m - hi"[..]);
        assert_eq!(records[1], &b"<14>1 again"[..]);
    }

    #[test]
    fn test_auto_nonnumeric_token_falls_back_to_lf() {
        let mut decoder = RecordDecoder::new(FramingMode::Auto, 1024);
        let records = decode_all(&mut decoder, b"plain message\n");
        assert_eq!(records, vec![Bytes::from("plain message")]);
    }

    #[test]
    fn test_max_size_boundary() {
        // a record of exactly max bytes passes, one more byte fails
        let max = 8;
        let mut decoder = RecordDecoder::new(FramingMode::Lf, max);
        let mut buf = BytesMut::from(&b"<3>45678\n"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), "<3>45678");

        let mut decoder = RecordDecoder::new(FramingMode::Lf, max);
        let mut buf = BytesMut::from(&b"<3>456789\n"[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FramingError::Oversize { .. })
        ));
    }

    #[test]
    fn test_consumption_accounting() {
        // all input bytes are either emitted, whitespace, or framing
        let mut decoder = RecordDecoder::new(FramingMode::Auto, 1024);
        let input: &[u8] = b"  <13>a\n5 bcdef<13>c\n";
        let mut buf = BytesMut::from(input);
        let mut emitted = 0;
        while let Some(record) = decoder.decode(&mut buf).unwrap() {
            emitted += record.len();
        }
        assert_eq!(buf.len(), 0, "all bytes consumed");
        // 2 ws + "<13>a"(5) + lf + "5 "(2) + "bcdef"(5) + "<13>c"(5) + lf
        assert_eq!(emitted, 15);
        assert_eq!(input.len() - emitted, 6);
    }

    #[test]
    fn test_relp_open_frame() {
        let mut decoder = RelpDecoder::new(1024);
        let mut buf = BytesMut::from(&b"1 open 14 relp_version=0\n"[..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.txnr, 1);
        assert_eq!(frame.command, "open");
        assert_eq!(frame.data, "relp_version=0");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_relp_zero_datalen() {
        let mut decoder = RelpDecoder::new(1024);
        let mut buf = BytesMut::from(&b"3 close 0\n"[..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.txnr, 3);
        assert_eq!(frame.command, "close");
        assert!(frame.data.is_empty());
    }

    #[test]
    fn test_relp_partial_header_requests_more() {
        let mut decoder = RelpDecoder::new(1024);
        let mut buf = BytesMut::from(&b"12 sysl"[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"og 2 hi\n");
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.txnr, 12);
        assert_eq!(frame.command, "syslog");
        assert_eq!(frame.data, "hi");
    }

    #[test]
    fn test_relp_partial_data_requests_more() {
        let mut decoder = RelpDecoder::new(1024);
        let mut buf = BytesMut::from(&b"2 syslog 10 01234"[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"56789\n");
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.data, "0123456789");
    }

    #[test]
    fn test_relp_bad_txnr_is_fatal() {
        let mut decoder = RelpDecoder::new(1024);
        let mut buf = BytesMut::from(&b"x open 0\n"[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FramingError::BadRelpHeader(_))
        ));
    }

    #[test]
    fn test_relp_bad_datalen_is_fatal() {
        let mut decoder = RelpDecoder::new(1024);
        let mut buf = BytesMut::from(&b"1 syslog nope hi\n"[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FramingError::BadRelpHeader(_))
        ));
    }

    #[test]
    fn test_relp_oversize_datalen_without_ingestion() {
        let mut decoder = RelpDecoder::new(16);
        let mut buf = BytesMut::from(&b"1 syslog 1000 "[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FramingError::Oversize { .. })
        ));
    }

    #[test]
    fn test_relp_multiple_frames() {
        let mut decoder = RelpDecoder::new(1024);
        let mut buf =
            BytesMut::from(&b"1 open 14 relp_version=0\n2 syslog 5 hello\n3 close 0\n"[..]);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].command, "open");
        assert_eq!(frames[1].data, "hello");
        assert_eq!(frames[2].command, "close");
    }
}
