//!
//! Checksum algorithms used to validate on-disk blocks
//!
use nom::combinator::all_consuming;
use nom::multi::fold_many0;
use nom::number::complete::{le_u32, le_u64};
use nom::sequence::pair;
use nom::IResult;

use sha2::{Digest, Sha256};

use crate::spa::{Checksum, ChecksumType};
use crate::{ZfsError, ZfsErrorKind};

/// Two 64-bit running sums over 128-bit words. Legacy, used by the ZIL.
#[derive(Debug, Clone)]
pub struct Fletcher2 {
    pub a0: u64,
    pub a1: u64,
    pub b0: u64,
    pub b1: u64,
}

impl Fletcher2 {
    pub fn new() -> Self {
        Self {
            a0: 0,
            a1: 0,
            b0: 0,
            b1: 0,
        }
    }
    fn input(&mut self, data0: u64, data1: u64) {
        self.a0 = self.a0.wrapping_add(data0);
        self.a1 = self.a1.wrapping_add(data1);
        self.b0 = self.b0.wrapping_add(self.a0);
        self.b1 = self.b1.wrapping_add(self.a1);
    }
    /// Fails if input length is not a multiple of 16
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        all_consuming(fold_many0(
            pair(le_u64, le_u64),
            Self::new(),
            |mut cksum, (input0, input1)| {
                cksum.input(input0, input1);
                cksum
            },
        ))(input)
    }
}

/// Four 64-bit running sums over 32-bit words. The metadata default.
#[derive(Debug, Clone)]
pub struct Fletcher4 {
    pub a: u64,
    pub b: u64,
    pub c: u64,
    pub d: u64,
}

impl Fletcher4 {
    pub fn new() -> Self {
        Self {
            a: 0,
            b: 0,
            c: 0,
            d: 0,
        }
    }
    fn input(&mut self, data: u32) {
        self.a = self.a.wrapping_add(data as u64);
        self.b = self.b.wrapping_add(self.a);
        self.c = self.c.wrapping_add(self.b);
        self.d = self.d.wrapping_add(self.c);
    }
    /// Fails if input length is not a multiple of 4
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        all_consuming(fold_many0(le_u32, Self::new(), |mut cksum, input| {
            cksum.input(input);
            cksum
        }))(input)
    }
}

/// SHA-256 digest split into the four big-endian words of a `Checksum`.
pub fn sha256(data: &[u8]) -> Checksum {
    let digest = Sha256::digest(data);
    let mut words = [0u64; 4];
    for (word, chunk) in words.iter_mut().zip(digest.chunks_exact(8)) {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(chunk);
        *word = u64::from_be_bytes(buf);
    }
    Checksum { checksum: words }
}

/// Compute the 256-bit checksum of `data` under `kind`.
///
/// `Off` and `NoParity` yield the all-zero value. Tags this implementation
/// does not compute report `UnsupportedAlgorithm`; `Inherit`/`On` must be
/// resolved by the caller before reaching this point (`On` maps to
/// fletcher4).
pub fn checksum(kind: &ChecksumType, data: &[u8]) -> Result<Checksum, ZfsError> {
    match kind {
        ChecksumType::Fletcher2 | ChecksumType::ZILog => {
            let (_input, cksum) = Fletcher2::parse(data)?;
            Ok(cksum.into())
        }
        ChecksumType::Fletcher4 | ChecksumType::On => {
            let (_input, cksum) = Fletcher4::parse(data)?;
            Ok(cksum.into())
        }
        ChecksumType::SHA256 | ChecksumType::Label | ChecksumType::GangHeader => Ok(sha256(data)),
        ChecksumType::Off | ChecksumType::NoParity => Ok(Checksum { checksum: [0; 4] }),
        other => Err(ZfsErrorKind::UnsupportedAlgorithm(other.clone() as u8).into()),
    }
}

/// Verify `data` against the checksum stored in its blkptr.
///
/// A mismatch is reported with both values; it is up to the caller to fall
/// back to another DVA copy.
pub fn verify(kind: &ChecksumType, data: &[u8], expected: &Checksum) -> Result<(), ZfsError> {
    match kind {
        ChecksumType::Off | ChecksumType::NoParity => return Ok(()),
        _ => {}
    }
    let actual = checksum(kind, data)?;
    if actual == *expected {
        Ok(())
    } else {
        Err(ZfsErrorKind::ChecksumMismatch {
            expected: expected.clone(),
            actual,
        }
        .into())
    }
}

/// Magic of the checksum tail embedded in label-checksummed blocks.
pub const ZEC_MAGIC: u64 = 0x0210da7ab10c7a11;

/// Size of the embedded checksum tail in bytes.
pub const ZEC_SIZE: usize = 40;

fn zec_bytes(magic: u64, value: &Checksum) -> [u8; ZEC_SIZE] {
    let mut out = [0u8; ZEC_SIZE];
    out[0..8].copy_from_slice(&magic.to_le_bytes());
    for (i, word) in value.checksum.iter().enumerate() {
        out[8 + i * 8..16 + i * 8].copy_from_slice(&word.to_le_bytes());
    }
    out
}

fn zec_parse(tail: &[u8]) -> (u64, Checksum) {
    let mut magic = [0u8; 8];
    magic.copy_from_slice(&tail[0..8]);
    let mut words = [0u64; 4];
    for (i, word) in words.iter_mut().enumerate() {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&tail[8 + i * 8..16 + i * 8]);
        *word = u64::from_le_bytes(buf);
    }
    (u64::from_le_bytes(magic), Checksum { checksum: words })
}

fn label_digest(data: &[u8], offset: u64) -> Checksum {
    // The tail is checksummed as if its value were the byte offset of the
    // block from the start of the device.
    let verifier = Checksum {
        checksum: [offset, 0, 0, 0],
    };
    let tail = zec_bytes(ZEC_MAGIC, &verifier);
    let mut hasher = Sha256::new();
    hasher.update(&data[..data.len() - ZEC_SIZE]);
    hasher.update(&tail);
    let digest = hasher.finalize();
    let mut words = [0u64; 4];
    for (word, chunk) in words.iter_mut().zip(digest.chunks_exact(8)) {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(chunk);
        *word = u64::from_be_bytes(buf);
    }
    Checksum { checksum: words }
}

/// Verify the embedded checksum tail of a label-checksummed block
/// (uberblock ring slot, gang header). `offset` is the byte offset of the
/// block from the start of its device.
pub fn label_verify(data: &[u8], offset: u64) -> Result<(), ZfsError> {
    if data.len() < ZEC_SIZE {
        return Err(ZfsErrorKind::Invalid.into());
    }
    let (magic, expected) = zec_parse(&data[data.len() - ZEC_SIZE..]);
    if magic != ZEC_MAGIC {
        return Err(ZfsErrorKind::Invalid.into());
    }
    let actual = label_digest(data, offset);
    if actual == expected {
        Ok(())
    } else {
        Err(ZfsErrorKind::ChecksumMismatch { expected, actual }.into())
    }
}

/// Compute and embed the checksum tail of a label-checksummed block.
/// Only needed to synthesize test images; the engine itself never writes.
pub fn label_checksum(data: &mut [u8], offset: u64) -> Result<(), ZfsError> {
    if data.len() < ZEC_SIZE {
        return Err(ZfsErrorKind::Invalid.into());
    }
    let value = label_digest(data, offset);
    let tail = zec_bytes(ZEC_MAGIC, &value);
    let len = data.len();
    data[len - ZEC_SIZE..].copy_from_slice(&tail);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fletcher4_known_words() {
        // Words 1, 2: a = 3, b = 1 + 3 = 4, c = 1 + 4 = 5, d = 1 + 5 = 6.
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&2u32.to_le_bytes());
        let (_, f) = Fletcher4::parse(&data).unwrap();
        assert_eq!((f.a, f.b, f.c, f.d), (3, 4, 5, 6));
    }

    #[test]
    fn fletcher2_known_words() {
        let mut data = Vec::new();
        data.extend_from_slice(&5u64.to_le_bytes());
        data.extend_from_slice(&7u64.to_le_bytes());
        data.extend_from_slice(&5u64.to_le_bytes());
        data.extend_from_slice(&7u64.to_le_bytes());
        let (_, f) = Fletcher2::parse(&data).unwrap();
        assert_eq!((f.a0, f.a1, f.b0, f.b1), (10, 14, 15, 21));
    }

    #[test]
    fn fletcher4_rejects_ragged_input() {
        assert!(Fletcher4::parse(&[0u8; 7]).is_err());
    }

    #[test]
    fn sha256_known_vector() {
        // SHA-256("abc"), first word big-endian.
        let c = sha256(b"abc");
        assert_eq!(c.checksum[0], 0xba7816bf8f01cfea);
        assert_eq!(c.checksum[3], 0xb410ff61f20015ad);
    }

    #[test]
    fn verify_sensitivity() {
        let data = vec![0xa5u8; 4096];
        let expected = checksum(&ChecksumType::Fletcher4, &data).unwrap();
        assert!(verify(&ChecksumType::Fletcher4, &data, &expected).is_ok());
        for idx in [0usize, 1, 511, 4095] {
            let mut corrupt = data.clone();
            corrupt[idx] ^= 0x01;
            let err = verify(&ChecksumType::Fletcher4, &corrupt, &expected);
            assert!(err.is_err(), "byte {} did not flip the checksum", idx);
        }
    }

    #[test]
    fn off_always_verifies() {
        let garbage = Checksum {
            checksum: [1, 2, 3, 4],
        };
        assert!(verify(&ChecksumType::Off, b"anything", &garbage).is_ok());
    }

    #[test]
    fn label_tail_round_trip() {
        let mut block = vec![0x5au8; 1024];
        label_checksum(&mut block, 0x20000).unwrap();
        assert!(label_verify(&block, 0x20000).is_ok());
        // Wrong offset is a different verifier.
        assert!(label_verify(&block, 0x20400).is_err());
        block[17] ^= 0xff;
        assert!(label_verify(&block, 0x20000).is_err());
    }
}
