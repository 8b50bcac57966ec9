//! Little-endian, naturally-aligned primitive codec (spec §4.1).
//!
//! Every integer is aligned at its own size within the buffer; padding
//! bytes are zeroed on encode and skipped (not validated) on decode,
//! mirroring `src/parser/primitive.rs`'s `ALIGNMENT`/`padding` helpers
//! but generalised from XDR's fixed 4-byte alignment to per-type
//! alignment and from big-endian to little-endian.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ReconcileError, Result};

/// A growable little-endian encode buffer bounded by [`super::MAX_PACKET_SIZE`].
pub struct Encoder {
    buf: Vec<u8>,
    limit: usize,
}

impl Encoder {
    pub fn new(limit: usize) -> Self {
        Encoder { buf: Vec::with_capacity(limit.min(4096)), limit }
    }

    /// Padding `width`-alignment would need, computed without mutating
    /// `buf` so callers can bounds-check before committing to it.
    fn align_pad(&self, width: usize) -> usize {
        (width - self.buf.len() % width) % width
    }

    fn check(&self, additional: usize) -> Result<()> {
        if self.buf.len() + additional > self.limit {
            Err(ReconcileError::RequestTooLong)
        } else {
            Ok(())
        }
    }

    pub fn u8(&mut self, v: u8) -> Result<()> {
        self.check(1)?;
        self.buf.push(v);
        Ok(())
    }

    pub fn u32(&mut self, v: u32) -> Result<()> {
        let pad = self.align_pad(4);
        self.check(pad + 4)?;
        self.buf.resize(self.buf.len() + pad, 0);
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
        Ok(())
    }

    pub fn i32(&mut self, v: i32) -> Result<()> {
        self.u32(v as u32)
    }

    pub fn u64(&mut self, v: u64) -> Result<()> {
        let pad = self.align_pad(8);
        self.check(pad + 8)?;
        self.buf.resize(self.buf.len() + pad, 0);
        let mut tmp = [0u8; 8];
        LittleEndian::write_u64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
        Ok(())
    }

    /// `u32 len` + `len` bytes + one NUL (NUL excluded from `len`), per §4.1.
    pub fn string(&mut self, s: &str) -> Result<()> {
        self.u32(s.len() as u32)?;
        self.check(s.len() + 1)?;
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    /// `u32 len` + raw bytes, per §4.1 ("Data buffers").
    pub fn bytes(&mut self, data: &[u8]) -> Result<()> {
        self.u32(data.len() as u32)?;
        self.check(data.len())?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn fixed(&mut self, data: &[u8]) -> Result<()> {
        self.check(data.len())?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}

/// A read cursor over a decoded packet body, mirroring [`Encoder`]'s framing.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Decoder { buf, pos: 0 }
    }

    fn align(&mut self, width: usize) -> Result<()> {
        let pad = (width - self.pos % width) % width;
        if self.pos + pad > self.buf.len() {
            return Err(ReconcileError::InvalidRequest);
        }
        self.pos += pad;
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ReconcileError::InvalidRequest);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.align(4)?;
        if self.pos + 4 > self.buf.len() {
            return Err(ReconcileError::InvalidRequest);
        }
        let v = LittleEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.align(8)?;
        if self.pos + 8 > self.buf.len() {
            return Err(ReconcileError::InvalidRequest);
        }
        let v = LittleEndian::read_u64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    pub fn string(&mut self, max_len: usize) -> Result<String> {
        let len = self.u32()? as usize;
        if len > max_len {
            return Err(ReconcileError::InvalidRequest);
        }
        if self.pos + len + 1 > self.buf.len() {
            return Err(ReconcileError::InvalidRequest);
        }
        let s = String::from_utf8(self.buf[self.pos..self.pos + len].to_vec())
            .map_err(|_| ReconcileError::InvalidRequest)?;
        self.pos += len + 1;
        Ok(s)
    }

    pub fn bytes(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        if len > max_len || self.pos + len > self.buf.len() {
            return Err(ReconcileError::InvalidRequest);
        }
        let v = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(v)
    }

    pub fn fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.pos + N > self.buf.len() {
            return Err(ReconcileError::InvalidRequest);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// The unconsumed tail of the buffer, for handing off to a nested
    /// decoder or forwarding as an opaque reply body.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}
