//! Length-prefixed message framing over a byte stream.
//!
//! Every message is `[10 ASCII digits, zero padded][payload]`. The helpers
//! here never trust a single `read`/`write` call to move a whole buffer: short
//! transfers are retried from the unsent offset, and a zero-length transfer
//! on a non-empty buffer means the peer is gone.
//!
//! Everything is generic over `Read`/`Write` so the same code drives the
//! control channel, the data channel and in-memory tests.

use std::io::{ErrorKind, Read, Write};

use crate::error::{Error, Result};
use crate::protocol::{HEADER_WIDTH, MAX_MESSAGE_LEN};

// Largest single read issued while collecting a message
const READ_CHUNK: usize = 64 * 1024;

/// Encode `len` as the fixed-width decimal header.
pub fn encode_header(len: u64) -> Result<[u8; HEADER_WIDTH]> {
    if len > MAX_MESSAGE_LEN {
        return Err(Error::MessageTooLarge { len });
    }
    let digits = format!("{:0width$}", len, width = HEADER_WIDTH);
    let mut header = [0u8; HEADER_WIDTH];
    header.copy_from_slice(digits.as_bytes());
    Ok(header)
}

/// Decode a header; anything other than exactly `HEADER_WIDTH` ASCII digits
/// is a protocol mismatch.
pub fn decode_header(header: &[u8]) -> Result<u64> {
    if header.len() != HEADER_WIDTH || !header.iter().all(u8::is_ascii_digit) {
        return Err(Error::ProtocolMismatch {
            header: header.to_vec(),
        });
    }
    Ok(header
        .iter()
        .fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0')))
}

/// Write every byte of `buf`, continuing from the unsent offset after short
/// writes. `sent` is advanced as bytes are accepted so callers can report
/// progress when the connection breaks.
fn write_fully<W: Write + ?Sized>(writer: &mut W, mut buf: &[u8], sent: &mut u64) -> Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => {
                return Err(Error::ConnectionBroken {
                    transferred: *sent,
                    partial: Vec::new(),
                })
            }
            Ok(n) => {
                buf = &buf[n..];
                *sent += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(Error::Transport {
                    transferred: *sent,
                    source: e,
                })
            }
        }
    }
    Ok(())
}

/// Write the length header for a payload of `len` bytes.
pub fn write_header<W: Write + ?Sized>(writer: &mut W, len: u64) -> Result<()> {
    let header = encode_header(len)?;
    // Header bytes are not payload; a failure here has moved nothing.
    let mut header_sent = 0u64;
    write_fully(writer, &header, &mut header_sent).map_err(|e| match e {
        Error::ConnectionBroken { partial, .. } => Error::ConnectionBroken {
            transferred: 0,
            partial,
        },
        Error::Transport { source, .. } => Error::Transport {
            transferred: 0,
            source,
        },
        other => other,
    })
}

/// Write a slice of payload that follows an already written header.
pub fn write_payload<W: Write + ?Sized>(writer: &mut W, buf: &[u8], sent: &mut u64) -> Result<()> {
    write_fully(writer, buf, sent)
}

/// Frame and send one message. Returns the number of payload bytes sent.
pub fn send_message<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<u64> {
    write_header(writer, payload.len() as u64)?;
    let mut sent = 0u64;
    write_payload(writer, payload, &mut sent)?;
    writer.flush().map_err(|e| Error::Transport {
        transferred: sent,
        source: e,
    })?;
    Ok(sent)
}

/// Read exactly `n` bytes. A zero-length read before `n` is reached fails
/// with `ConnectionBroken`, carrying the bytes collected so far.
pub fn receive_exact<R: Read + ?Sized>(reader: &mut R, n: u64) -> Result<Vec<u8>> {
    // Grow with the data actually received, not with what the peer claims.
    let mut out = Vec::with_capacity(n.min(READ_CHUNK as u64) as usize);
    let mut chunk = vec![0u8; n.min(READ_CHUNK as u64) as usize];
    while (out.len() as u64) < n {
        let want = (n - out.len() as u64).min(chunk.len() as u64) as usize;
        match reader.read(&mut chunk[..want]) {
            Ok(0) => {
                return Err(Error::ConnectionBroken {
                    transferred: out.len() as u64,
                    partial: out,
                })
            }
            Ok(k) => out.extend_from_slice(&chunk[..k]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(Error::Transport {
                    transferred: out.len() as u64,
                    source: e,
                })
            }
        }
    }
    Ok(out)
}

/// Read and decode one length header.
pub fn read_header<R: Read + ?Sized>(reader: &mut R) -> Result<u64> {
    let header = receive_exact(reader, HEADER_WIDTH as u64)?;
    decode_header(&header)
}

/// Receive one framed message.
pub fn receive_message<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_header(reader)?;
    receive_exact(reader, len)
}

/// Receive one framed message that must be text (commands and replies).
pub fn receive_text<R: Read + ?Sized>(reader: &mut R) -> Result<String> {
    let payload = receive_message(reader)?;
    String::from_utf8(payload)
        .map_err(|e| Error::UnexpectedReply(String::from_utf8_lossy(e.as_bytes()).into_owned()))
}
