//! Bit-level packet serialization.
//!
//! Everything on the wire goes through these two types: arbitrary-width
//! integers, floats quantized to a declared range, smallest-three quaternions,
//! and positions at one of three resolutions. A read past the end of the
//! buffer poisons the reader and surfaces as `StreamError`, which aborts the
//! current frame.

use glam::{Quat, Vec3};
use thiserror::Error;

use crate::entity::{AssetId, EntityRef, ASSET_NULL, ID_NULL, MAX_ENTITIES};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("bit stream overrun")]
    Overrun,
    #[error("value out of declared range")]
    Range,
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Encoding width + equality tolerance class for a replicated transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Resolution {
    Low = 0,
    #[default]
    Medium,
    High,
}

impl Resolution {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Low,
            2 => Self::High,
            _ => Self::Medium,
        }
    }

    fn quat_bits(self) -> u32 {
        match self {
            Self::Low => 9,
            Self::Medium => 12,
            Self::High => 16,
        }
    }
}

pub const fn bits_required(range: u64) -> u32 {
    if range == 0 {
        1
    } else {
        64 - range.leading_zeros()
    }
}

#[derive(Default)]
pub struct BitWriter {
    data: Vec<u8>,
    scratch: u64,
    scratch_bits: u32,
    bits_written: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bits_written(&self) -> usize {
        self.bits_written
    }

    pub fn bytes_written(&self) -> usize {
        (self.bits_written + 7) / 8
    }

    pub fn bits(&mut self, value: u32, bits: u32) {
        debug_assert!(bits >= 1 && bits <= 32);
        let masked = if bits == 32 {
            value as u64
        } else {
            (value as u64) & ((1u64 << bits) - 1)
        };
        self.scratch |= masked << self.scratch_bits;
        self.scratch_bits += bits;
        self.bits_written += bits as usize;
        while self.scratch_bits >= 8 {
            self.data.push((self.scratch & 0xff) as u8);
            self.scratch >>= 8;
            self.scratch_bits -= 8;
        }
    }

    pub fn bool(&mut self, value: bool) {
        self.bits(value as u32, 1);
    }

    pub fn u64(&mut self, value: u64) {
        self.bits(value as u32, 32);
        self.bits((value >> 32) as u32, 32);
    }

    /// Integer constrained to `[min, max]`, encoded at the minimum width.
    pub fn int(&mut self, value: i64, min: i64, max: i64) {
        debug_assert!(value >= min && value <= max);
        let bits = bits_required((max - min) as u64);
        self.bits((value - min) as u32, bits);
    }

    pub fn f32(&mut self, value: f32) {
        self.bits(value.to_bits(), 32);
    }

    /// Float quantized to `[min, max]` at `bits` of precision.
    pub fn f32_range(&mut self, value: f32, min: f32, max: f32, bits: u32) {
        let clamped = value.clamp(min, max);
        let scale = ((1u64 << bits) - 1) as f32;
        let normalized = (clamped - min) / (max - min);
        self.bits((normalized * scale + 0.5) as u32, bits);
    }

    /// Flush partial bits so the stream sits on a byte boundary.
    pub fn align(&mut self) {
        let remainder = self.bits_written % 8;
        if remainder != 0 {
            self.bits(0, 8 - remainder as u32);
        }
    }

    /// Raw bytes; the stream is aligned first.
    pub fn bytes(&mut self, bytes: &[u8]) {
        self.align();
        debug_assert_eq!(self.scratch_bits, 0);
        self.data.extend_from_slice(bytes);
        self.bits_written += bytes.len() * 8;
    }

    /// Variable-byte asset id: presence bit, then 7-bit groups with a
    /// continuation bit.
    pub fn asset(&mut self, id: AssetId) {
        if id == ASSET_NULL {
            self.bool(false);
            return;
        }
        self.bool(true);
        let mut v = id;
        loop {
            let group = (v & 0x7f) as u32;
            v >>= 7;
            let more = v != 0;
            self.bits(group, 7);
            self.bool(more);
            if !more {
                break;
            }
        }
    }

    pub fn entity_ref(&mut self, r: EntityRef) {
        let id = if r.is_null() {
            MAX_ENTITIES as i64
        } else {
            r.id as i64
        };
        self.int(id, 0, MAX_ENTITIES as i64);
        self.bits(r.revision as u32, 16);
    }

    pub fn quat(&mut self, q: Quat, resolution: Resolution) {
        let bits = resolution.quat_bits();
        let e = [q.x, q.y, q.z, q.w];
        let mut largest = 0;
        for i in 1..4 {
            if e[i].abs() > e[largest].abs() {
                largest = i;
            }
        }
        let sign = if e[largest] < 0.0 { -1.0 } else { 1.0 };
        self.bits(largest as u32, 2);
        const LIMIT: f32 = std::f32::consts::FRAC_1_SQRT_2;
        for i in 0..4 {
            if i != largest {
                self.f32_range(e[i] * sign, -LIMIT, LIMIT, bits);
            }
        }
    }

    pub fn position(&mut self, p: Vec3, resolution: Resolution) {
        match resolution {
            Resolution::Low => {
                for axis in [p.x, p.y, p.z] {
                    self.f32_range(axis, -256.0, 256.0, 16);
                }
            }
            Resolution::Medium => {
                for axis in [p.x, p.y, p.z] {
                    self.f32_range(axis, -1024.0, 1024.0, 20);
                }
            }
            Resolution::High => {
                for axis in [p.x, p.y, p.z] {
                    self.f32(axis);
                }
            }
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.align();
        self.data
    }
}

pub struct BitReader {
    data: Vec<u8>,
    scratch: u64,
    scratch_bits: u32,
    bits_read: usize,
    byte_cursor: usize,
}

impl BitReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            scratch: 0,
            scratch_bits: 0,
            bits_read: 0,
            byte_cursor: 0,
        }
    }

    pub fn bits_read(&self) -> usize {
        self.bits_read
    }

    pub fn bytes_read(&self) -> usize {
        (self.bits_read + 7) / 8
    }

    pub fn bytes_total(&self) -> usize {
        self.data.len()
    }

    pub fn at_end(&self) -> bool {
        self.bytes_read() >= self.data.len()
    }

    pub fn rewind(&mut self) {
        self.scratch = 0;
        self.scratch_bits = 0;
        self.bits_read = 0;
        self.byte_cursor = 0;
    }

    pub fn bits(&mut self, bits: u32) -> StreamResult<u32> {
        debug_assert!(bits >= 1 && bits <= 32);
        while self.scratch_bits < bits {
            let byte = *self.data.get(self.byte_cursor).ok_or(StreamError::Overrun)?;
            self.scratch |= (byte as u64) << self.scratch_bits;
            self.scratch_bits += 8;
            self.byte_cursor += 1;
        }
        let mask = if bits == 32 {
            u32::MAX as u64
        } else {
            (1u64 << bits) - 1
        };
        let value = (self.scratch & mask) as u32;
        self.scratch >>= bits;
        self.scratch_bits -= bits;
        self.bits_read += bits as usize;
        Ok(value)
    }

    pub fn bool(&mut self) -> StreamResult<bool> {
        Ok(self.bits(1)? != 0)
    }

    pub fn u64(&mut self) -> StreamResult<u64> {
        let lo = self.bits(32)? as u64;
        let hi = self.bits(32)? as u64;
        Ok(lo | (hi << 32))
    }

    pub fn int(&mut self, min: i64, max: i64) -> StreamResult<i64> {
        let bits = bits_required((max - min) as u64);
        let raw = self.bits(bits)? as i64;
        let value = min + raw;
        if value > max {
            return Err(StreamError::Range);
        }
        Ok(value)
    }

    pub fn f32(&mut self) -> StreamResult<f32> {
        Ok(f32::from_bits(self.bits(32)?))
    }

    pub fn f32_range(&mut self, min: f32, max: f32, bits: u32) -> StreamResult<f32> {
        let scale = ((1u64 << bits) - 1) as f32;
        let raw = self.bits(bits)? as f32;
        Ok(min + (raw / scale) * (max - min))
    }

    pub fn align(&mut self) -> StreamResult<()> {
        let remainder = self.bits_read % 8;
        if remainder != 0 {
            self.bits(8 - remainder as u32)?;
        }
        Ok(())
    }

    pub fn bytes(&mut self, out: &mut [u8]) -> StreamResult<()> {
        self.align()?;
        // discard whole bytes buffered in scratch
        while self.scratch_bits >= 8 {
            self.scratch_bits -= 8;
            self.byte_cursor -= 1;
        }
        self.scratch = 0;
        self.scratch_bits = 0;
        let end = self.byte_cursor + out.len();
        if end > self.data.len() {
            return Err(StreamError::Overrun);
        }
        out.copy_from_slice(&self.data[self.byte_cursor..end]);
        self.byte_cursor = end;
        self.bits_read += out.len() * 8;
        Ok(())
    }

    pub fn asset(&mut self) -> StreamResult<AssetId> {
        if !self.bool()? {
            return Ok(ASSET_NULL);
        }
        let mut value: u32 = 0;
        let mut shift = 0;
        loop {
            let group = self.bits(7)?;
            value |= group << shift;
            shift += 7;
            if !self.bool()? {
                break;
            }
            if shift > 14 {
                return Err(StreamError::Range);
            }
        }
        Ok(value as AssetId)
    }

    pub fn entity_ref(&mut self) -> StreamResult<EntityRef> {
        let id = self.int(0, MAX_ENTITIES as i64)?;
        let revision = self.bits(16)? as u16;
        if id == MAX_ENTITIES as i64 {
            Ok(EntityRef {
                id: ID_NULL,
                revision,
            })
        } else {
            Ok(EntityRef {
                id: id as u16,
                revision,
            })
        }
    }

    pub fn quat(&mut self, resolution: Resolution) -> StreamResult<Quat> {
        let bits = resolution.quat_bits();
        let largest = self.bits(2)? as usize;
        const LIMIT: f32 = std::f32::consts::FRAC_1_SQRT_2;
        let mut e = [0.0f32; 4];
        let mut sum_sq = 0.0;
        for i in 0..4 {
            if i != largest {
                let v = self.f32_range(-LIMIT, LIMIT, bits)?;
                e[i] = v;
                sum_sq += v * v;
            }
        }
        e[largest] = (1.0 - sum_sq).max(0.0).sqrt();
        Ok(Quat::from_xyzw(e[0], e[1], e[2], e[3]).normalize())
    }

    pub fn position(&mut self, resolution: Resolution) -> StreamResult<Vec3> {
        let mut axes = [0.0f32; 3];
        match resolution {
            Resolution::Low => {
                for axis in &mut axes {
                    *axis = self.f32_range(-256.0, 256.0, 16)?;
                }
            }
            Resolution::Medium => {
                for axis in &mut axes {
                    *axis = self.f32_range(-1024.0, 1024.0, 20)?;
                }
            }
            Resolution::High => {
                for axis in &mut axes {
                    *axis = self.f32()?;
                }
            }
        }
        Ok(Vec3::from_array(axes))
    }
}
