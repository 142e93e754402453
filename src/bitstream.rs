//! H.264 elementary stream framing
//!
//! Compression engines hand back access units in length-prefixed (AVCC)
//! form: every NAL unit is preceded by its size as a 4-byte big-endian
//! integer. The files written by stillcast use the start-code (Annex-B)
//! form instead, where every NAL unit is preceded by `00 00 00 01`.

use crate::{Error, Result};
use std::io::Write;

/// Annex-B start code written ahead of every NAL unit
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Size of the big-endian length prefix in AVCC framing
pub const AVCC_LENGTH_SIZE: usize = 4;

/// NAL unit type values used by this crate
pub mod nal_type {
    pub const NON_IDR_SLICE: u8 = 1;
    pub const IDR_SLICE: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const ACCESS_UNIT_DELIMITER: u8 = 9;
}

/// Type of a NAL unit, read from its header byte
pub fn nal_unit_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|header| header & 0x1F)
}

/// Whether the NAL unit carries slice data (coded picture)
pub fn is_slice(nal: &[u8]) -> bool {
    matches!(
        nal_unit_type(nal),
        Some(nal_type::NON_IDR_SLICE) | Some(nal_type::IDR_SLICE)
    )
}

/// Iterator over the NAL payloads of a length-prefixed access unit
pub struct AvccRecords<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for AvccRecords<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let remaining = &self.data[self.offset..];
        if remaining.len() < AVCC_LENGTH_SIZE {
            self.offset = self.data.len();
            return Some(Err(Error::Bitstream(format!(
                "{} trailing bytes cannot hold a length prefix",
                remaining.len()
            ))));
        }

        let mut prefix = [0u8; AVCC_LENGTH_SIZE];
        prefix.copy_from_slice(&remaining[..AVCC_LENGTH_SIZE]);
        let length = u32::from_be_bytes(prefix) as usize;
        let body = &remaining[AVCC_LENGTH_SIZE..];

        if length == 0 || length > body.len() {
            self.offset = self.data.len();
            return Some(Err(Error::Bitstream(format!(
                "NAL record of {} bytes at offset {} does not fit in {} remaining bytes",
                length,
                self.offset,
                body.len()
            ))));
        }

        self.offset += AVCC_LENGTH_SIZE + length;
        Some(Ok(&body[..length]))
    }
}

/// Split a length-prefixed access unit into its NAL payloads
pub fn avcc_records(data: &[u8]) -> AvccRecords<'_> {
    AvccRecords { data, offset: 0 }
}

/// Build a length-prefixed access unit from raw NAL payloads
pub fn to_avcc<'a, I>(nals: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut out = Vec::new();
    for nal in nals {
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// Iterator over the NAL payloads of a start-code delimited stream
pub struct AnnexBUnits<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for AnnexBUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (start, code_len) = find_start_code(self.data, self.offset)?;
            let body_start = start + code_len;
            let body_end = find_start_code(self.data, body_start)
                .map(|(pos, _)| pos)
                .unwrap_or(self.data.len());
            self.offset = body_end;

            let nal = trim_trailing_zeros(&self.data[body_start..body_end]);
            if !nal.is_empty() {
                return Some(nal);
            }
        }
    }
}

/// Scan a start-code delimited stream for its NAL payloads
pub fn annexb_units(data: &[u8]) -> AnnexBUnits<'_> {
    AnnexBUnits { data, offset: 0 }
}

/// Find an H.264 start code at or after `start`, returning its position and length
pub(crate) fn find_start_code(data: &[u8], start: usize) -> Option<(usize, usize)> {
    if start + 3 > data.len() {
        return None;
    }

    for i in start..data.len() - 2 {
        if data[i] == 0x00 && data[i + 1] == 0x00 {
            if data[i + 2] == 0x01 {
                return Some((i, 3));
            }
            if i + 3 < data.len() && data[i + 2] == 0x00 && data[i + 3] == 0x01 {
                return Some((i, 4));
            }
        }
    }

    None
}

pub(crate) fn trim_trailing_zeros(mut nal: &[u8]) -> &[u8] {
    while let [rest @ .., 0x00] = nal {
        nal = rest;
    }
    nal
}

/// Rewrites length-prefixed access units as an Annex-B stream
///
/// Every write goes straight to the underlying writer in call order; the
/// writer does no buffering of its own.
pub struct BitstreamWriter<W: Write> {
    inner: W,
    parameter_sets_written: bool,
    nal_units_written: u64,
    bytes_written: u64,
}

impl<W: Write> BitstreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            parameter_sets_written: false,
            nal_units_written: 0,
            bytes_written: 0,
        }
    }

    /// Write SPS then PPS as two standalone NAL units.
    ///
    /// Allowed once per writer.
    pub fn write_parameter_sets(&mut self, sps: &[u8], pps: &[u8]) -> Result<()> {
        if self.parameter_sets_written {
            return Err(Error::Bitstream(
                "parameter sets already written for this stream".to_string(),
            ));
        }
        if sps.is_empty() || pps.is_empty() {
            return Err(Error::Bitstream("empty parameter set".to_string()));
        }

        self.write_nal(sps)?;
        self.write_nal(pps)?;
        self.parameter_sets_written = true;
        Ok(())
    }

    /// Write every NAL record of a length-prefixed access unit, in record
    /// order. Returns the number of NAL units written.
    ///
    /// The whole unit is validated before anything is written, so a
    /// malformed unit leaves the stream untouched.
    pub fn write_access_unit(&mut self, payload: &[u8]) -> Result<usize> {
        let records = avcc_records(payload).collect::<Result<Vec<_>>>()?;

        for nal in &records {
            self.write_nal(nal)?;
        }

        Ok(records.len())
    }

    fn write_nal(&mut self, nal: &[u8]) -> Result<()> {
        self.inner.write_all(&START_CODE)?;
        self.inner.write_all(nal)?;
        self.nal_units_written += 1;
        self.bytes_written += (START_CODE.len() + nal.len()) as u64;
        Ok(())
    }

    pub fn parameter_sets_written(&self) -> bool {
        self.parameter_sets_written
    }

    /// NAL units written so far, parameter sets included
    pub fn nal_units_written(&self) -> u64 {
        self.nal_units_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
