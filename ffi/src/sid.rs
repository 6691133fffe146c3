//! Variable-length security identifiers.
//!
//! The binary layout is the standard one: revision byte, sub-authority
//! count byte, 48-bit big-endian identifier authority, then the
//! sub-authorities as little-endian 32-bit words. The true byte length of
//! an identifier is only known once its two-byte header has been read, so
//! reads follow a two-phase protocol: [`probe_size`] on the header, then a
//! copy of exactly that many bytes.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FfiError, FfiResult};

pub const MAX_SUB_AUTHORITIES: usize = 15;
const HEADER_LEN: usize = 8;

fn invalid(text: &str) -> FfiError {
    FfiError::Definition(format!("invalid identifier value '{}'", text))
}

/// Parse the canonical `S-R-A-S0-S1-...` spelling into the binary layout.
/// The authority accepts decimal or `0x` hexadecimal and must fit 48 bits.
pub fn parse_text(text: &str) -> FfiResult<Vec<u8>> {
    let mut parts = text.split('-');

    match parts.next() {
        Some("S") | Some("s") => {}
        _ => return Err(invalid(text)),
    }
    let revision: u8 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| invalid(text))?;

    let authority_part = parts.next().ok_or_else(|| invalid(text))?;
    let authority: u64 = if let Some(hex) = authority_part
        .strip_prefix("0x")
        .or_else(|| authority_part.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).map_err(|_| invalid(text))?
    } else {
        authority_part.parse().map_err(|_| invalid(text))?
    };
    if authority >= 1 << 48 {
        return Err(invalid(text));
    }

    let mut subs: Vec<u32> = Vec::new();
    for part in parts {
        if subs.len() == MAX_SUB_AUTHORITIES {
            return Err(invalid(text));
        }
        subs.push(part.parse().map_err(|_| invalid(text))?);
    }

    let mut bytes = vec![0u8; HEADER_LEN + 4 * subs.len()];
    bytes[0] = revision;
    bytes[1] = subs.len() as u8;
    for i in 0..6 {
        bytes[2 + i] = (authority >> (8 * (5 - i))) as u8;
    }
    for (i, sub) in subs.iter().enumerate() {
        LittleEndian::write_u32(&mut bytes[HEADER_LEN + 4 * i..HEADER_LEN + 4 * (i + 1)], *sub);
    }
    Ok(bytes)
}

/// Byte length of the identifier whose header starts at `header`. Only the
/// first two bytes are inspected.
pub fn probe_size(header: &[u8]) -> FfiResult<usize> {
    if header.len() < 2 {
        return Err(FfiError::Range("identifier header truncated".into()));
    }
    let count = header[1] as usize;
    if count > MAX_SUB_AUTHORITIES {
        return Err(FfiError::Definition(format!(
            "invalid identifier header: {} sub-authorities",
            count
        )));
    }
    Ok(HEADER_LEN + 4 * count)
}

/// Render the binary layout back into its canonical text. Authorities at or
/// above 2^32 print hexadecimal, matching the canonical spelling rules.
pub fn to_text(bytes: &[u8]) -> FfiResult<String> {
    let size = probe_size(bytes)?;
    if bytes.len() < size {
        return Err(FfiError::Range("identifier truncated".into()));
    }

    let revision = bytes[0];
    let count = bytes[1] as usize;
    let mut authority = 0u64;
    for &b in &bytes[2..HEADER_LEN] {
        authority = authority << 8 | b as u64;
    }

    let mut out = if authority < 1 << 32 {
        format!("S-{}-{}", revision, authority)
    } else {
        format!("S-{}-0x{:012X}", revision, authority)
    };
    for i in 0..count {
        let sub = LittleEndian::read_u32(&bytes[HEADER_LEN + 4 * i..HEADER_LEN + 4 * (i + 1)]);
        out.push('-');
        out.push_str(&sub.to_string());
    }
    Ok(out)
}

/// Copy an identifier out of raw memory: probe the true size from the
/// two-byte header, then copy exactly that many bytes. No guessed buffer
/// sizes, no second probe.
///
/// # Safety
/// `ptr` must point to readable memory holding an identifier with a valid
/// header; `probe_size` bytes from `ptr` must be readable.
pub unsafe fn copy_from_ptr(ptr: *const u8) -> FfiResult<Vec<u8>> {
    let header = std::slice::from_raw_parts(ptr, 2);
    let size = probe_size(header)?;
    Ok(std::slice::from_raw_parts(ptr, size).to_vec())
}
