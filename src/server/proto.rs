//! Wire framing and payload codec.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload.
//! Document payloads are the gzipped text serialization; stored pack files
//! are already in that shape, so streaming one is framing the file bytes
//! verbatim.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use bytes::Bytes;
use thiserror::Error;

use crate::document::{Document, DocumentError};

pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("frame too large: max {max_bytes} got {got_bytes}")]
    FrameTooLarge { max_bytes: usize, got_bytes: usize },

    #[error("frame length cannot be zero")]
    EmptyFrame,

    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Reads one frame. `Ok(None)` means the peer closed the connection
/// cleanly between frames.
pub fn read_frame(reader: &mut impl Read, max_bytes: usize) -> Result<Option<Bytes>, ProtoError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0usize;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "frame header truncated").into());
        }
        filled += n;
    }

    let length = u32::from_be_bytes(header) as usize;
    if length == 0 {
        return Err(ProtoError::EmptyFrame);
    }
    if length > max_bytes {
        return Err(ProtoError::FrameTooLarge {
            max_bytes,
            got_bytes: length,
        });
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;
    Ok(Some(Bytes::from(body)))
}

pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> Result<(), ProtoError> {
    let length = u32::try_from(payload.len()).map_err(|_| ProtoError::FrameTooLarge {
        max_bytes: u32::MAX as usize,
        got_bytes: payload.len(),
    })?;
    writer.write_all(&length.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads and decodes one document frame. The size limit bounds both the
/// compressed frame and the inflated text.
pub fn read_document(
    reader: &mut impl Read,
    size_limit: usize,
) -> Result<Option<Document>, ProtoError> {
    match read_frame(reader, size_limit)? {
        Some(payload) => Ok(Some(Document::from_gz_bytes(&payload, size_limit)?)),
        None => Ok(None),
    }
}

pub fn write_document(
    writer: &mut impl Write,
    doc: &Document,
    compress_level: u32,
) -> Result<(), ProtoError> {
    let payload = doc.to_gz_bytes(compress_level)?;
    write_frame(writer, &payload)
}

/// Streams a stored pack file as a single frame.
pub fn send_file(writer: &mut impl Write, path: &Path) -> Result<(), ProtoError> {
    let mut file = File::open(path)?;
    let length = file.metadata()?.len();
    let length = u32::try_from(length).map_err(|_| ProtoError::FrameTooLarge {
        max_bytes: u32::MAX as usize,
        got_bytes: length as usize,
    })?;
    writer.write_all(&length.to_be_bytes())?;
    io::copy(&mut file, writer)?;
    writer.flush()?;
    Ok(())
}
