//!
//! Block decompression: tag dispatch plus the LZJB and ZLE codecs
//!
use nom::combinator::map_res;
use nom::multi::length_data;
use nom::number::complete::be_u32;
use nom::IResult;

use crate::spa::CompressionType;
use crate::{ZfsError, ZfsErrorKind};

/// LZ4 blocks are stored with a big-endian length prefix.
pub fn decompress_lz4(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    map_res(length_data(be_u32), lz4_compression::decompress::decompress)(input)
}

/// Matching compressor, exposed for round-trip tests.
pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    let body = lz4_compression::compress::compress(input);
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

const LZJB_MATCH_BITS: usize = 6;
const LZJB_MATCH_MIN: usize = 3;
const LZJB_MATCH_MAX: usize = (1 << LZJB_MATCH_BITS) + LZJB_MATCH_MIN - 2;
const LZJB_OFFSET_MASK: usize = (1 << (16 - LZJB_MATCH_BITS)) - 1;
const LZJB_LEMPEL_SIZE: usize = 1024;

/// LZJB decompression. The stream is groups of a copy-map byte followed by
/// eight items, each either a literal byte or a 2-byte (length, offset)
/// back-reference.
pub fn decompress_lzjb(input: &[u8], logical_size: usize) -> Result<Vec<u8>, ZfsError> {
    let mut out = Vec::with_capacity(logical_size);
    let mut src = 0;
    'outer: while src < input.len() && out.len() < logical_size {
        let copymap = input[src];
        src += 1;
        for bit in 0..8 {
            if out.len() >= logical_size {
                break;
            }
            if src >= input.len() {
                break 'outer;
            }
            if copymap & (1 << bit) != 0 {
                if src + 1 >= input.len() {
                    return Err(ZfsErrorKind::CorruptBlock.into());
                }
                let mlen = (input[src] as usize >> (8 - LZJB_MATCH_BITS)) + LZJB_MATCH_MIN;
                let offset =
                    (((input[src] as usize) << 8) | input[src + 1] as usize) & LZJB_OFFSET_MASK;
                src += 2;
                if offset == 0 || offset > out.len() {
                    return Err(ZfsErrorKind::CorruptBlock.into());
                }
                let mut cpy = out.len() - offset;
                for _ in 0..mlen {
                    if out.len() >= logical_size {
                        break;
                    }
                    let byte = out[cpy];
                    out.push(byte);
                    cpy += 1;
                }
            } else {
                out.push(input[src]);
                src += 1;
            }
        }
    }
    Ok(out)
}

/// LZJB compression, exposed for round-trip tests.
pub fn compress_lzjb(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 8 + 1);
    let mut lempel = [0usize; LZJB_LEMPEL_SIZE];
    let mut src = 0;
    let mut copymask: u16 = 1 << 7;
    let mut copymap_idx = 0;
    while src < input.len() {
        copymask <<= 1;
        if copymask == 1 << 8 {
            copymask = 1;
            copymap_idx = out.len();
            out.push(0);
        }
        if src + LZJB_MATCH_MAX > input.len() {
            out.push(input[src]);
            src += 1;
            continue;
        }
        let mut hash = ((input[src] as usize) << 16)
            + ((input[src + 1] as usize) << 8)
            + input[src + 2] as usize;
        hash ^= hash >> 9;
        hash += hash >> 5;
        hash &= LZJB_LEMPEL_SIZE - 1;
        let offset = src.wrapping_sub(lempel[hash]) & LZJB_OFFSET_MASK;
        lempel[hash] = src;
        let cpy = src.wrapping_sub(offset);
        if offset != 0 && cpy < src && input[cpy..cpy + LZJB_MATCH_MIN] == input[src..src + LZJB_MATCH_MIN]
        {
            out[copymap_idx] |= copymask as u8;
            let mut mlen = LZJB_MATCH_MIN;
            while mlen < LZJB_MATCH_MAX && input[src + mlen] == input[cpy + mlen] {
                mlen += 1;
            }
            out.push((((mlen - LZJB_MATCH_MIN) << (8 - LZJB_MATCH_BITS)) | (offset >> 8)) as u8);
            out.push(offset as u8);
            src += mlen;
        } else {
            out.push(input[src]);
            src += 1;
        }
    }
    out
}

/// Run threshold for zero-length encoding: bytes below it introduce a
/// literal run, bytes at or above it a zero run.
const ZLE_LEVEL: usize = 64;

pub fn decompress_zle(input: &[u8], logical_size: usize) -> Result<Vec<u8>, ZfsError> {
    let mut out = Vec::with_capacity(logical_size);
    let mut src = 0;
    while src < input.len() && out.len() < logical_size {
        let len = 1 + input[src] as usize;
        src += 1;
        if len <= ZLE_LEVEL {
            if src + len > input.len() {
                return Err(ZfsErrorKind::CorruptBlock.into());
            }
            out.extend_from_slice(&input[src..src + len]);
            src += len;
        } else {
            out.resize(out.len() + (len - ZLE_LEVEL), 0);
        }
    }
    Ok(out)
}

pub fn compress_zle(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut src = 0;
    while src < input.len() {
        if input[src] == 0 {
            let mut run = 0;
            while src + run < input.len() && input[src + run] == 0 && run < 256 - ZLE_LEVEL {
                run += 1;
            }
            out.push((run - 1 + ZLE_LEVEL) as u8);
            src += run;
        } else {
            let mut run = 0;
            while src + run < input.len() && input[src + run] != 0 && run < ZLE_LEVEL {
                run += 1;
            }
            out.push((run - 1) as u8);
            out.extend_from_slice(&input[src..src + run]);
            src += run;
        }
    }
    out
}

/// Decompress `input` into exactly `logical_size` bytes.
///
/// By the time this is called the concrete algorithm must be known:
/// `Inherit` has been resolved by the read context and `On` mapped to the
/// pool default. A length mismatch or malformed stream is `CorruptBlock`.
pub fn decompress(
    kind: &CompressionType,
    input: &[u8],
    logical_size: usize,
) -> Result<Vec<u8>, ZfsError> {
    let out = match kind {
        CompressionType::Off => {
            if input.len() < logical_size {
                return Err(ZfsErrorKind::CorruptBlock.into());
            }
            input[..logical_size].to_vec()
        }
        CompressionType::Empty => vec![0; logical_size],
        CompressionType::LZ4 | CompressionType::On => decompress_lz4(input)?.1,
        CompressionType::LZJB => decompress_lzjb(input, logical_size)?,
        CompressionType::ZLE => decompress_zle(input, logical_size)?,
        other => return Err(ZfsErrorKind::UnsupportedAlgorithm(other.clone() as u8).into()),
    };
    if out.len() != logical_size {
        return Err(ZfsErrorKind::CorruptBlock.into());
    }
    Ok(out)
}
