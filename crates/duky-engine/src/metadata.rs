//! Settings snapshots carried inside generated PNG files.
//!
//! The snapshot JSON is stored in an uncompressed `iTXt` chunk placed just
//! before `IEND`. Pixel data is never touched; chunks are spliced as raw
//! bytes.

use duky_contracts::tools::SettingsSnapshot;

pub const SETTINGS_KEYWORD: &str = "duky-settings";

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const ITXT: [u8; 4] = *b"iTXt";
const IEND: [u8; 4] = *b"IEND";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PngChunkError {
    #[error("payload is not a PNG")]
    NotPng,
    #[error("PNG truncated at byte {0}")]
    Truncated(usize),
    #[error("CRC mismatch in {0} chunk")]
    CrcMismatch(String),
    #[error("PNG has no IEND chunk")]
    MissingEnd,
    #[error("iTXt keyword must be 1-79 Latin-1 bytes without NUL")]
    BadKeyword,
}

#[derive(Debug, Clone, Copy)]
struct Chunk<'a> {
    kind: [u8; 4],
    data: &'a [u8],
    start: usize,
    end: usize,
}

pub fn is_png(bytes: &[u8]) -> bool {
    bytes.starts_with(&PNG_SIGNATURE)
}

/// Returns `png` with the snapshot embedded. Disabled embedding and non-PNG
/// payloads come back unchanged.
pub fn embed_settings(
    png: &[u8],
    snapshot: &SettingsSnapshot,
    enabled: bool,
) -> anyhow::Result<Vec<u8>> {
    if !enabled || !is_png(png) {
        return Ok(png.to_vec());
    }
    Ok(embed_text(png, SETTINGS_KEYWORD, &snapshot.to_json()?)?)
}

pub fn extract_settings(bytes: &[u8]) -> anyhow::Result<Option<SettingsSnapshot>> {
    match extract_text(bytes, SETTINGS_KEYWORD)? {
        Some(raw) => Ok(Some(SettingsSnapshot::from_json(&raw)?)),
        None => Ok(None),
    }
}

/// Inserts an `iTXt` chunk before `IEND`, dropping any earlier chunk with
/// the same keyword.
pub fn embed_text(png: &[u8], keyword: &str, text: &str) -> Result<Vec<u8>, PngChunkError> {
    validate_keyword(keyword)?;
    let chunks = parse_chunks(png)?;
    let iend = chunks
        .iter()
        .find(|chunk| chunk.kind == IEND)
        .ok_or(PngChunkError::MissingEnd)?;

    let mut out = Vec::with_capacity(png.len() + text.len() + keyword.len() + 32);
    out.extend_from_slice(&PNG_SIGNATURE);
    for chunk in &chunks {
        if chunk.kind == IEND {
            break;
        }
        if chunk.kind == ITXT && itxt_keyword(chunk.data) == Some(keyword.as_bytes()) {
            continue;
        }
        out.extend_from_slice(&png[chunk.start..chunk.end]);
    }

    let mut data = Vec::with_capacity(keyword.len() + text.len() + 5);
    data.extend_from_slice(keyword.as_bytes());
    // NUL, compression flag, compression method, empty language tag NUL,
    // empty translated keyword NUL.
    data.extend_from_slice(&[0, 0, 0, 0, 0]);
    data.extend_from_slice(text.as_bytes());
    write_chunk(&mut out, ITXT, &data);

    out.extend_from_slice(&png[iend.start..iend.end]);
    Ok(out)
}

/// Reads the text of the first uncompressed `iTXt` chunk named `keyword`.
pub fn extract_text(bytes: &[u8], keyword: &str) -> Result<Option<String>, PngChunkError> {
    for chunk in parse_chunks(bytes)? {
        if chunk.kind != ITXT || itxt_keyword(chunk.data) != Some(keyword.as_bytes()) {
            continue;
        }
        let rest = &chunk.data[keyword.len() + 1..];
        let [compressed, _method, tail @ ..] = rest else {
            continue;
        };
        if *compressed != 0 {
            continue;
        }
        let Some(lang_end) = tail.iter().position(|byte| *byte == 0) else {
            continue;
        };
        let tail = &tail[lang_end + 1..];
        let Some(translated_end) = tail.iter().position(|byte| *byte == 0) else {
            continue;
        };
        let text = &tail[translated_end + 1..];
        return Ok(Some(String::from_utf8_lossy(text).into_owned()));
    }
    Ok(None)
}

fn validate_keyword(keyword: &str) -> Result<(), PngChunkError> {
    let valid = !keyword.is_empty()
        && keyword.len() <= 79
        && keyword.bytes().all(|byte| byte != 0 && byte.is_ascii());
    if valid {
        Ok(())
    } else {
        Err(PngChunkError::BadKeyword)
    }
}

fn itxt_keyword(data: &[u8]) -> Option<&[u8]> {
    let end = data.iter().position(|byte| *byte == 0)?;
    Some(&data[..end])
}

fn parse_chunks(bytes: &[u8]) -> Result<Vec<Chunk<'_>>, PngChunkError> {
    if !is_png(bytes) {
        return Err(PngChunkError::NotPng);
    }
    let mut chunks = Vec::new();
    let mut offset = PNG_SIGNATURE.len();
    while offset < bytes.len() {
        let header_end = offset + 8;
        if header_end > bytes.len() {
            return Err(PngChunkError::Truncated(offset));
        }
        let length = u32::from_be_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        let kind = [
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ];
        let data_end = header_end
            .checked_add(length)
            .ok_or(PngChunkError::Truncated(offset))?;
        let end = data_end + 4;
        if end > bytes.len() {
            return Err(PngChunkError::Truncated(offset));
        }
        let stored = u32::from_be_bytes([
            bytes[data_end],
            bytes[data_end + 1],
            bytes[data_end + 2],
            bytes[data_end + 3],
        ]);
        if crc32(&bytes[offset + 4..data_end]) != stored {
            return Err(PngChunkError::CrcMismatch(
                String::from_utf8_lossy(&kind).into_owned(),
            ));
        }
        chunks.push(Chunk {
            kind,
            data: &bytes[header_end..data_end],
            start: offset,
            end,
        });
        offset = end;
        if kind == IEND {
            break;
        }
    }
    Ok(chunks)
}

fn write_chunk(out: &mut Vec<u8>, kind: [u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    let crc_start = out.len();
    out.extend_from_slice(&kind);
    out.extend_from_slice(data);
    let crc = crc32(&out[crc_start..]);
    out.extend_from_slice(&crc.to_be_bytes());
}

const CRC_TABLE: [u32; 256] = build_crc_table();

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 {
                0xEDB8_8320 ^ (c >> 1)
            } else {
                c >> 1
            };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for byte in bytes {
        crc = CRC_TABLE[((crc ^ *byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    crc ^ 0xFFFF_FFFF
}
