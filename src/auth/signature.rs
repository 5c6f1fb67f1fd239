//! Conversion between the DER `ECDSA-Sig-Value` a KMS returns and the
//! fixed-width `R||S` form JWS requires.

use crate::error::JvsError;

const SEQUENCE_TAG: u8 = 0x30;
const INTEGER_TAG: u8 = 0x02;

/// Converts a DER signature into `R||S`, each left-padded to `coordinate_len`.
///
/// Fails when the encoding is malformed or when R or S is wider than a
/// coordinate, which means the signature came from a different curve.
pub fn der_to_fixed(der: &[u8], coordinate_len: usize) -> Result<Vec<u8>, JvsError> {
    let mut reader = DerReader::new(der);
    let body = reader.read_tlv(SEQUENCE_TAG)?;
    if !reader.is_empty() {
        return Err(malformed("trailing bytes after signature"));
    }

    let mut inner = DerReader::new(body);
    let r = inner.read_unsigned_integer()?;
    let s = inner.read_unsigned_integer()?;
    if !inner.is_empty() {
        return Err(malformed("trailing bytes inside signature sequence"));
    }

    let mut fixed = vec![0u8; coordinate_len * 2];
    for (i, component) in [r, s].into_iter().enumerate() {
        if component.len() > coordinate_len {
            return Err(JvsError::Signing(format!(
                "signature component is {} bytes, curve allows {}",
                component.len(),
                coordinate_len
            )));
        }
        let end = (i + 1) * coordinate_len;
        fixed[end - component.len()..end].copy_from_slice(component);
    }
    Ok(fixed)
}

/// Encodes a fixed-width `R||S` signature as DER.
pub fn fixed_to_der(fixed: &[u8]) -> Result<Vec<u8>, JvsError> {
    if fixed.is_empty() || fixed.len() % 2 != 0 {
        return Err(malformed("fixed signature length must be even"));
    }
    let (r, s) = fixed.split_at(fixed.len() / 2);

    let mut body = Vec::with_capacity(fixed.len() + 8);
    write_unsigned_integer(&mut body, r);
    write_unsigned_integer(&mut body, s);

    let mut der = Vec::with_capacity(body.len() + 3);
    der.push(SEQUENCE_TAG);
    write_length(&mut der, body.len());
    der.extend_from_slice(&body);
    Ok(der)
}

fn malformed(what: &str) -> JvsError {
    JvsError::Signing(format!("malformed DER signature: {what}"))
}

struct DerReader<'a> {
    buf: &'a [u8],
}

impl<'a> DerReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], JvsError> {
        if self.buf.len() < n {
            return Err(malformed("truncated"));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn read_length(&mut self) -> Result<usize, JvsError> {
        let first = self.take(1)?[0];
        if first < 0x80 {
            return Ok(first as usize);
        }
        // Signatures never need more than two length bytes.
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 2 {
            return Err(malformed("unsupported length encoding"));
        }
        let bytes = self.take(count)?;
        if bytes[0] == 0 {
            return Err(malformed("non-minimal length"));
        }
        let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        if len < 0x80 {
            return Err(malformed("non-minimal length"));
        }
        Ok(len)
    }

    fn read_tlv(&mut self, tag: u8) -> Result<&'a [u8], JvsError> {
        let found = self.take(1)?[0];
        if found != tag {
            return Err(malformed(&format!("expected tag {tag:#04x}, found {found:#04x}")));
        }
        let len = self.read_length()?;
        self.take(len)
    }

    /// Reads a non-negative INTEGER and returns its magnitude without leading zeros.
    fn read_unsigned_integer(&mut self) -> Result<&'a [u8], JvsError> {
        let content = self.read_tlv(INTEGER_TAG)?;
        match content {
            [] => Err(malformed("empty integer")),
            [first, ..] if first & 0x80 != 0 => Err(malformed("negative integer")),
            [0, next, ..] if next & 0x80 == 0 => Err(malformed("non-minimal integer")),
            _ => {
                let start = content.iter().position(|b| *b != 0).unwrap_or(content.len());
                Ok(&content[start..])
            }
        }
    }
}

fn write_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.extend_from_slice(&[0x81, len as u8]);
    } else {
        out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]);
    }
}

fn write_unsigned_integer(out: &mut Vec<u8>, magnitude: &[u8]) {
    let start = magnitude.iter().position(|b| *b != 0).unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    out.push(INTEGER_TAG);
    match trimmed.first() {
        None => {
            write_length(out, 1);
            out.push(0);
        }
        Some(first) if first & 0x80 != 0 => {
            write_length(out, trimmed.len() + 1);
            out.push(0);
            out.extend_from_slice(trimmed);
        }
        Some(_) => {
            write_length(out, trimmed.len());
            out.extend_from_slice(trimmed);
        }
    }
}
