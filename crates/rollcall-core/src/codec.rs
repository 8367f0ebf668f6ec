//! Versioned binary encoding for stored embeddings.
//!
//! Layout: 4-byte magic `RCE1`, format version, model-tag length + UTF-8
//! bytes, little-endian u32 dimension, then the f32 values. The explicit
//! header keeps stored templates forward-compatible and refuses payloads
//! from unknown formats instead of misinterpreting them.

use thiserror::Error;

use crate::types::Embedding;

const MAGIC: [u8; 4] = *b"RCE1";
const FORMAT_VERSION: u8 = 1;

/// Embeddings larger than this are corrupt, not real.
const MAX_DIMENSION: u32 = 8192;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("bad magic bytes — not an embedding payload")]
    BadMagic,
    #[error("unsupported embedding format version {0}")]
    UnsupportedVersion(u8),
    #[error("embedding payload truncated")]
    Truncated,
    #[error("embedding dimension {0} out of range")]
    BadDimension(u32),
    #[error("model tag is not valid UTF-8")]
    TagNotUtf8,
    #[error("embedding contains a non-finite value")]
    NonFinite,
}

pub fn encode_embedding(embedding: &Embedding) -> Result<Vec<u8>, CodecError> {
    if embedding.values.iter().any(|v| !v.is_finite()) {
        return Err(CodecError::NonFinite);
    }
    let tag = embedding.model_tag.as_bytes();
    let dim = embedding.values.len() as u32;

    let mut out = Vec::with_capacity(4 + 1 + 1 + tag.len() + 4 + embedding.values.len() * 4);
    out.extend_from_slice(&MAGIC);
    out.push(FORMAT_VERSION);
    out.push(tag.len() as u8);
    out.extend_from_slice(tag);
    out.extend_from_slice(&dim.to_le_bytes());
    for v in &embedding.values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    Ok(out)
}

pub fn decode_embedding(bytes: &[u8]) -> Result<Embedding, CodecError> {
    let mut cursor = Cursor { bytes, pos: 0 };

    if cursor.take(4)? != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = cursor.take(1)?[0];
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let tag_len = cursor.take(1)?[0] as usize;
    let tag = std::str::from_utf8(cursor.take(tag_len)?)
        .map_err(|_| CodecError::TagNotUtf8)?
        .to_string();

    let dim_bytes: [u8; 4] = cursor
        .take(4)?
        .try_into()
        .map_err(|_| CodecError::Truncated)?;
    let dim = u32::from_le_bytes(dim_bytes);
    if dim == 0 || dim > MAX_DIMENSION {
        return Err(CodecError::BadDimension(dim));
    }

    let mut values = Vec::with_capacity(dim as usize);
    for _ in 0..dim {
        let raw: [u8; 4] = cursor
            .take(4)?
            .try_into()
            .map_err(|_| CodecError::Truncated)?;
        let v = f32::from_le_bytes(raw);
        if !v.is_finite() {
            return Err(CodecError::NonFinite);
        }
        values.push(v);
    }

    if cursor.pos != bytes.len() {
        // Trailing bytes mean the payload was produced by something else.
        return Err(CodecError::Truncated);
    }

    Ok(Embedding::new(values, tag))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated)?;
        if end > self.bytes.len() {
            return Err(CodecError::Truncated);
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}
