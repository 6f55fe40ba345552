//! Multi-part message framing.
//!
//! ```text
//! u32 BE part count (1..=MAX_PARTS)
//! per part: u32 BE length (<= MAX_PART_BYTES), then the bytes
//! ```
//!
//! `MessageDecoder` is incremental: it buffers whatever the socket hands it and
//! yields messages only once they are complete, so a read timeout in the middle
//! of a message never desynchronises the stream.

use anyhow::{anyhow, Result};
use std::io::Write;

pub const MAX_PARTS: usize = 16;
pub const MAX_PART_BYTES: usize = 64 * 1024 * 1024;

const LEN_BYTES: usize = 4;

/// Encode a message into a single buffer.
pub fn encode_message<P: AsRef<[u8]>>(parts: &[P]) -> Result<Vec<u8>> {
    if parts.is_empty() || parts.len() > MAX_PARTS {
        return Err(anyhow!(
            "message must have between 1 and {} parts (got {})",
            MAX_PARTS,
            parts.len()
        ));
    }
    let body: usize = parts.iter().map(|p| LEN_BYTES + p.as_ref().len()).sum();
    let mut out = Vec::with_capacity(LEN_BYTES + body);
    out.extend_from_slice(&(parts.len() as u32).to_be_bytes());
    for part in parts {
        let part = part.as_ref();
        if part.len() > MAX_PART_BYTES {
            return Err(anyhow!(
                "message part of {} bytes exceeds limit of {}",
                part.len(),
                MAX_PART_BYTES
            ));
        }
        out.extend_from_slice(&(part.len() as u32).to_be_bytes());
        out.extend_from_slice(part);
    }
    Ok(out)
}

/// Encode and write one message.
pub fn write_message<W: Write, P: AsRef<[u8]>>(writer: &mut W, parts: &[P]) -> Result<()> {
    let buf = encode_message(parts)?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: Vec<u8>,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet part of a complete message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete message, if any.
    ///
    /// Errors mean the stream is corrupt; the caller must drop the connection.
    pub fn next_message(&mut self) -> Result<Option<Vec<Vec<u8>>>> {
        let Some(count) = read_u32(&self.buf, 0) else {
            return Ok(None);
        };
        let count = count as usize;
        if count == 0 || count > MAX_PARTS {
            return Err(anyhow!("invalid part count {}", count));
        }

        let mut offset = LEN_BYTES;
        let mut spans = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(len) = read_u32(&self.buf, offset) else {
                return Ok(None);
            };
            let len = len as usize;
            if len > MAX_PART_BYTES {
                return Err(anyhow!("part length {} exceeds limit", len));
            }
            offset += LEN_BYTES;
            if self.buf.len() < offset + len {
                return Ok(None);
            }
            spans.push((offset, len));
            offset += len;
        }

        let parts = spans
            .into_iter()
            .map(|(start, len)| self.buf[start..start + len].to_vec())
            .collect();
        self.buf.drain(..offset);
        Ok(Some(parts))
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + LEN_BYTES)?;
    let mut raw = [0u8; LEN_BYTES];
    raw.copy_from_slice(bytes);
    Some(u32::from_be_bytes(raw))
}
