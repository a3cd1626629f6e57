//! Field codecs for the controller wire protocol.
//!
//! All multi-byte fields are little-endian with no alignment padding, matching
//! the packed parameter blocks the controller exchanges.

use crate::error::{Result, WireError};

// ---------------------------------------------------------------------------
// Read helpers
// ---------------------------------------------------------------------------

/// Read a signed 32-bit integer.
pub fn read_i32(data: &[u8], offset: usize) -> Result<i32> {
    check_len(data, offset, 4, "I32")?;
    Ok(i32::from_le_bytes(word(data, offset)))
}

/// Read an unsigned 32-bit integer.
pub fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    check_len(data, offset, 4, "U32")?;
    Ok(u32::from_le_bytes(word(data, offset)))
}

/// Read an IEEE-754 single precision float.
pub fn read_f32(data: &[u8], offset: usize) -> Result<f32> {
    check_len(data, offset, 4, "F32")?;
    Ok(f32::from_le_bytes(word(data, offset)))
}

/// Read a single byte.
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8> {
    check_len(data, offset, 1, "U8")?;
    Ok(data[offset])
}

/// Read `count` consecutive unsigned 32-bit integers.
pub fn read_u32_array(data: &[u8], offset: usize, count: usize) -> Result<Vec<u32>> {
    check_len(data, offset, count * 4, "U32[]")?;
    Ok(data[offset..offset + count * 4]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Read `count` consecutive signed 32-bit integers.
pub fn read_i32_array(data: &[u8], offset: usize, count: usize) -> Result<Vec<i32>> {
    check_len(data, offset, count * 4, "I32[]")?;
    Ok(data[offset..offset + count * 4]
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

// ---------------------------------------------------------------------------
// Write helpers
// ---------------------------------------------------------------------------

pub fn write_i32(buf: &mut Vec<u8>, val: i32) {
    buf.extend_from_slice(&val.to_le_bytes());
}

pub fn write_u32(buf: &mut Vec<u8>, val: u32) {
    buf.extend_from_slice(&val.to_le_bytes());
}

pub fn write_f32(buf: &mut Vec<u8>, val: f32) {
    buf.extend_from_slice(&val.to_le_bytes());
}

pub fn write_i32_array(buf: &mut Vec<u8>, vals: &[i32]) {
    for &v in vals {
        write_i32(buf, v);
    }
}

pub fn write_u32_array(buf: &mut Vec<u8>, vals: &[u32]) {
    for &v in vals {
        write_u32(buf, v);
    }
}

pub fn write_f32_array(buf: &mut Vec<u8>, vals: &[f32]) {
    for &v in vals {
        write_f32(buf, v);
    }
}

/// Write a NUL-terminated string preceded by its length (including the NUL).
pub fn write_cstring(buf: &mut Vec<u8>, s: &str) {
    write_i32(buf, s.len() as i32 + 1);
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

// ---------------------------------------------------------------------------
// Internal
// ---------------------------------------------------------------------------

fn word(data: &[u8], offset: usize) -> [u8; 4] {
    [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]
}

fn check_len(data: &[u8], offset: usize, need: usize, name: &'static str) -> Result<()> {
    if data.len() < offset + need {
        Err(WireError::payload_too_short(name, offset + need, data.len()))
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
