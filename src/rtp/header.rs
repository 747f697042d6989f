//! RTP header parsing (spec §6.1). Parsed by hand, the way the teacher
//! parses its own wire headers — no external RTP crate.

use crate::error::RtpError;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use num_complex::Complex32;

pub const HEADER_BYTES: usize = 12;
/// 2 x f32 (re, im) little-endian per sample, per spec §6.1.
pub const SAMPLE_BYTES: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

/// Parses the 12-byte RTP header and returns it alongside the sample
/// payload decoded as little-endian `complex<f32>` pairs.
pub fn parse_header(datagram: &[u8]) -> Result<(RtpHeader, Vec<Complex32>), RtpError> {
    if datagram.len() < HEADER_BYTES {
        return Err(RtpError::ShortHeader(datagram.len()));
    }
    let b0 = datagram[0];
    let b1 = datagram[1];
    let header = RtpHeader {
        version: b0 >> 6,
        padding: (b0 & 0x20) != 0,
        extension: (b0 & 0x10) != 0,
        csrc_count: b0 & 0x0F,
        marker: (b1 & 0x80) != 0,
        payload_type: b1 & 0x7F,
        sequence: BigEndian::read_u16(&datagram[2..4]),
        timestamp: BigEndian::read_u32(&datagram[4..8]),
        ssrc: BigEndian::read_u32(&datagram[8..12]),
    };

    let csrc_bytes = header.csrc_count as usize * 4;
    let payload_start = HEADER_BYTES + csrc_bytes;
    if datagram.len() < payload_start {
        return Err(RtpError::ShortHeader(datagram.len()));
    }
    let payload = &datagram[payload_start..];
    if payload.len() % SAMPLE_BYTES != 0 {
        return Err(RtpError::MisalignedPayload(payload.len()));
    }

    let n = payload.len() / SAMPLE_BYTES;
    let mut samples = Vec::with_capacity(n);
    for i in 0..n {
        let off = i * SAMPLE_BYTES;
        let re = LittleEndian::read_f32(&payload[off..off + 4]);
        let im = LittleEndian::read_f32(&payload[off + 4..off + 8]);
        samples.push(Complex32::new(re, im));
    }
    Ok((header, samples))
}

/// Signed 16-bit sequence difference (`a - b`), wrap-aware via the
/// half-range threshold rule in spec §4.1.
pub fn seq_diff(a: u16, b: u16) -> i32 {
    let diff = a.wrapping_sub(b) as i32;
    if diff > i16::MAX as i32 {
        diff - (1 << 16)
    } else if diff < i16::MIN as i32 {
        diff + (1 << 16)
    } else {
        diff
    }
}

/// Signed 32-bit RTP timestamp difference (`a - b`), wrap-aware.
pub fn ts_diff(a: u32, b: u32) -> i64 {
    let diff = a.wrapping_sub(b) as i64;
    if diff > i32::MAX as i64 {
        diff - (1i64 << 32)
    } else if diff < i32::MIN as i64 {
        diff + (1i64 << 32)
    } else {
        diff
    }
}
