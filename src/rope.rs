//! Rope-like immutable byte sequences.
//! - O(1) concatenation and prepend over shared `Bytes` chunks
//! - zero-copy slicing
//! - forward-only reader for the little-endian wire primitives

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};

/// Immutable ordered byte sequence built from refcounted chunks. Appending
/// a rope to another splices chunk lists without copying payload bytes, and
/// `slice` returns a view sharing the underlying storage.
#[derive(Clone, Default)]
pub struct ByteRope {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ByteRope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        let mut rope = Self::new();
        rope.append_chunk(bytes);
        rope
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a chunk, keeping the no-empty-chunks invariant.
    pub fn append_chunk(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.len += chunk.len();
            self.chunks.push_back(chunk);
        }
    }

    /// Splices `other` onto the end of `self` without copying.
    pub fn append_rope(&mut self, other: ByteRope) {
        self.len += other.len;
        self.chunks.extend(other.chunks);
    }

    /// Splices a chunk in front of the rope. The length-prefix of a BSON
    /// document is attached this way once the field bytes are known.
    pub fn prepend_chunk(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.len += chunk.len();
            self.chunks.push_front(chunk);
        }
    }

    /// A view over `from..to`, sharing chunks with `self`.
    ///
    /// Callers pass validated bounds; out-of-range indices are a bug.
    pub fn slice(&self, from: usize, to: usize) -> ByteRope {
        assert!(from <= to && to <= self.len, "rope slice out of bounds");
        let mut out = ByteRope::new();
        let mut pos = 0usize;
        for chunk in &self.chunks {
            let end = pos + chunk.len();
            if end > from && pos < to {
                let lo = from.saturating_sub(pos);
                let hi = chunk.len().min(to - pos);
                out.append_chunk(chunk.slice(lo..hi));
            }
            pos = end;
            if pos >= to {
                break;
            }
        }
        out
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Bytes> {
        self.chunks.iter()
    }

    pub fn last_byte(&self) -> Option<u8> {
        self.chunks.back().map(|c| c[c.len() - 1])
    }

    /// Flattens into one contiguous `Bytes`. Zero-copy when the rope holds a
    /// single chunk.
    pub fn to_bytes(&self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut out = BytesMut::with_capacity(self.len);
                for chunk in &self.chunks {
                    out.extend_from_slice(chunk);
                }
                out.freeze()
            }
        }
    }

    fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.chunks.iter().flat_map(|c| c.iter().copied())
    }
}

impl PartialEq for ByteRope {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.bytes().eq(other.bytes())
    }
}

impl Eq for ByteRope {}

impl std::fmt::Debug for ByteRope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteRope[{}; ", self.len)?;
        for b in self.bytes().take(32) {
            write!(f, "{b:02x}")?;
        }
        if self.len > 32 {
            write!(f, "..")?;
        }
        write!(f, "]")
    }
}

/// Append-only writer producing a [`ByteRope`]. Primitive writes land in a
/// growable tail chunk; splicing a rope freezes the tail first so chunk
/// order matches write order.
#[derive(Default, Debug)]
pub struct RopeBuilder {
    done: ByteRope,
    tail: BytesMut,
}

impl RopeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.done.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append_u8(&mut self, v: u8) {
        self.tail.put_u8(v);
    }

    pub fn append_i32_le(&mut self, v: i32) {
        self.tail.put_i32_le(v);
    }

    pub fn append_i64_le(&mut self, v: i64) {
        self.tail.put_i64_le(v);
    }

    pub fn append_f64_le(&mut self, v: f64) {
        self.tail.put_f64_le(v);
    }

    pub fn append_bytes(&mut self, v: &[u8]) {
        self.tail.put_slice(v);
    }

    /// NUL-terminated string. Interior NUL bytes are forbidden on the wire.
    pub fn append_cstring(&mut self, s: &str) -> Result<(), EncodeError> {
        if s.as_bytes().contains(&0) {
            return Err(EncodeError::InvalidFieldName);
        }
        self.tail.put_slice(s.as_bytes());
        self.tail.put_u8(0);
        Ok(())
    }

    /// int32 length (terminator included) + bytes + NUL.
    pub fn append_utf8_string(&mut self, s: &str) -> Result<(), EncodeError> {
        let encoded = s.len() + 1;
        if encoded > i32::MAX as usize {
            return Err(EncodeError::ValueTooLarge(s.len()));
        }
        self.tail.put_i32_le(encoded as i32);
        self.tail.put_slice(s.as_bytes());
        self.tail.put_u8(0);
        Ok(())
    }

    /// Splices an already-built rope without copying it.
    pub fn append_rope(&mut self, rope: ByteRope) {
        self.freeze_tail();
        self.done.append_rope(rope);
    }

    /// Splices a shared chunk without copying it.
    pub fn append_chunk(&mut self, chunk: Bytes) {
        self.freeze_tail();
        self.done.append_chunk(chunk);
    }

    pub fn finish(mut self) -> ByteRope {
        self.freeze_tail();
        self.done
    }

    fn freeze_tail(&mut self) {
        if !self.tail.is_empty() {
            let frozen = self.tail.split().freeze();
            self.done.append_chunk(frozen);
        }
    }
}

/// Forward-only cursor over a rope. Every read fails with
/// [`DecodeError::Truncated`] when the rope ends mid-field.
pub struct RopeReader {
    rope: ByteRope,
    chunk: usize,
    offset: usize,
    pos: usize,
}

impl RopeReader {
    pub fn new(rope: &ByteRope) -> Self {
        Self {
            rope: rope.clone(),
            chunk: 0,
            offset: 0,
            pos: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.rope.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    pub fn read_f64_le(&mut self) -> Result<f64, DecodeError> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }

    /// Reads the next int32 without consuming it. Used where a length prefix
    /// both sizes a value and belongs to its bytes (BSON documents).
    pub fn peek_i32_le(&mut self) -> Result<i32, DecodeError> {
        let saved = (self.chunk, self.offset, self.pos);
        let v = self.read_i32_le();
        (self.chunk, self.offset, self.pos) = saved;
        v
    }

    /// Reads `n` bytes; zero-copy when they sit inside one chunk.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes, DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated);
        }
        if n == 0 {
            return Ok(Bytes::new());
        }
        let chunk = &self.rope.chunks[self.chunk];
        if self.offset + n <= chunk.len() {
            let out = chunk.slice(self.offset..self.offset + n);
            self.advance(n);
            return Ok(out);
        }
        let mut out = BytesMut::with_capacity(n);
        out.resize(n, 0);
        self.read_exact(&mut out)?;
        Ok(out.freeze())
    }

    /// A rope view over the next `n` bytes, sharing storage with the input.
    pub fn slice_next(&mut self, n: usize) -> Result<ByteRope, DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated);
        }
        let out = self.rope.slice(self.pos, self.pos + n);
        self.advance(n);
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated);
        }
        self.advance(n);
        Ok(())
    }

    /// Bytes up to and including a NUL terminator, returned without it.
    pub fn read_cstring(&mut self) -> Result<String, DecodeError> {
        let mut out = Vec::new();
        loop {
            let b = self.read_u8()?;
            if b == 0 {
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.push(b);
        }
    }

    /// int32 length (terminator included) + bytes + NUL.
    pub fn read_utf8_string(&mut self) -> Result<String, DecodeError> {
        let declared = self.read_i32_le()?;
        if declared < 1 {
            return Err(DecodeError::LengthMismatch);
        }
        let raw = self.read_bytes(declared as usize)?;
        if raw[raw.len() - 1] != 0 {
            return Err(DecodeError::LengthMismatch);
        }
        Ok(String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DecodeError> {
        if self.remaining() < buf.len() {
            return Err(DecodeError::Truncated);
        }
        let mut filled = 0usize;
        while filled < buf.len() {
            let chunk = &self.rope.chunks[self.chunk];
            let take = (chunk.len() - self.offset).min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&chunk[self.offset..self.offset + take]);
            filled += take;
            self.advance(take);
        }
        Ok(())
    }

    fn advance(&mut self, mut n: usize) {
        self.pos += n;
        while n > 0 {
            let chunk_len = self.rope.chunks[self.chunk].len();
            let left = chunk_len - self.offset;
            if n < left {
                self.offset += n;
                return;
            }
            n -= left;
            self.chunk += 1;
            self.offset = 0;
        }
        // Landed exactly on a chunk boundary; nothing else to do.
    }
}
