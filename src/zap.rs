//!
//! ZAP (ZFS Attribute Processor) blocks: the micro form, one block of
//! fixed-size entries, and the fat form, a hashed tree of leaf blocks
//!
use std::convert::TryFrom;
use std::fmt;

use nom::{number::complete as number, IResult};

use crc::{Algorithm, Crc};

/// The hash every ZAP variant keys on: reflected CRC-64/ECMA seeded
/// with the per-object salt, no final xor.
const ZAP_CRC64: Algorithm<u64> = Algorithm {
    width: 64,
    poly: 0x42f0_e1eb_a9ea_3693,
    init: 0,
    refin: true,
    refout: true,
    xorout: 0,
    check: 0,
    residue: 0,
};

const CRC64: Crc<u64> = Crc::<u64>::new(&ZAP_CRC64);

pub fn zap_hash(salt: u64, key: &[u8]) -> u64 {
    // digest_with_initial reflects the seed for reflected algorithms, so
    // pre-reverse to start from the salt itself.
    let mut digest = CRC64.digest_with_initial(salt.reverse_bits());
    digest.update(key);
    digest.finalize()
}

/// The top `shift` bits of the hash select a pointer-table slot.
pub fn zap_hash_idx(hash: u64, shift: u8) -> u64 {
    if shift > 0 {
        hash >> (64 - shift)
    } else {
        0
    }
}

/// A value read back from a ZAP: an array of one of the four integer
/// widths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZapValue {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
}

impl ZapValue {
    fn parse(input: &[u8], int_size: u8) -> Option<ZapValue> {
        match int_size {
            1 => Some(ZapValue::U8(input.to_owned())),
            2 => nom::combinator::all_consuming::<_, _, (), _>(nom::multi::many0(number::be_u16))(
                input,
            )
            .ok()
            .map(|o| ZapValue::U16(o.1)),
            4 => nom::combinator::all_consuming::<_, _, (), _>(nom::multi::many0(number::be_u32))(
                input,
            )
            .ok()
            .map(|o| ZapValue::U32(o.1)),
            8 => nom::combinator::all_consuming::<_, _, (), _>(nom::multi::many0(number::be_u64))(
                input,
            )
            .ok()
            .map(|o| ZapValue::U64(o.1)),
            _ => None,
        }
    }

    /// The value as a single u64, when it is exactly that.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ZapValue::U64(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }
}

pub const ZBT_MICRO: u64 = (1 << 63) + 3;
pub const ZBT_HEADER: u64 = (1 << 63) + 1;
pub const ZBT_LEAF: u64 = 1 << 63;

/// The first block of a ZAP object, discriminated by its leading type
/// word.
#[derive(Debug, Clone)]
pub enum ZapBlock {
    Micro(MicroZap),
    FatHeader(FatZapHeader),
    FatLeaf(ZapLeaf),
}

impl ZapBlock {
    /// `block_size` in bytes.
    pub fn parse(input: &[u8], block_size: usize) -> IResult<&[u8], Self> {
        nom::branch::alt((
            nom::combinator::map(|i| MicroZap::parse(i, block_size), Self::Micro),
            nom::combinator::map(|i| FatZapHeader::parse(i, block_size), Self::FatHeader),
            nom::combinator::map(|i| ZapLeaf::parse(i, block_size), Self::FatLeaf),
        ))(input)
    }
}

/// Micro ZAP: one block of 64-byte entries with inline names and u64
/// values.
#[derive(Debug, Clone)]
pub struct MicroZap {
    pub salt: u64,
    pub normflags: u64,
    pub entries: Vec<MicroZapEntry>,
}

const MICRO_NAME_MAX: usize = 50;

impl MicroZap {
    pub fn parse(input: &[u8], block_size: usize) -> IResult<&[u8], Self> {
        let (input, (_block_type, salt, normflags, _pad, entries)) = nom::combinator::map_parser(
            nom::bytes::complete::take(block_size),
            nom::sequence::tuple((
                nom::combinator::verify(number::le_u64, |btype| *btype == ZBT_MICRO),
                number::le_u64,
                number::le_u64,
                nom::bytes::complete::take(5 * 8usize),
                nom::multi::many1(MicroZapEntry::parse),
            )),
        )(input)?;
        Ok((
            input,
            Self {
                salt,
                normflags,
                entries,
            },
        ))
    }

    pub fn lookup(&self, key: &[u8]) -> Option<u64> {
        if key.len() >= MICRO_NAME_MAX {
            // names are stored inline, NUL-terminated
            return None;
        }
        self.entries.iter().find_map(|entry| {
            if entry.name[0] == 0 {
                return None;
            }
            if &entry.name[..key.len()] == key && entry.name[key.len()] == 0 {
                Some(entry.value)
            } else {
                None
            }
        })
    }

    pub fn entries(&self) -> Vec<(String, u64)> {
        self.entries
            .iter()
            .filter(|e| e.name[0] != 0)
            .map(|e| {
                let end = e.name.iter().position(|c| *c == 0).unwrap_or(e.name.len());
                (
                    String::from_utf8_lossy(&e.name[..end]).into_owned(),
                    e.value,
                )
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct MicroZapEntry {
    pub value: u64,
    pub cd: u32,
    pub name: Vec<u8>,
}

impl MicroZapEntry {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (value, cd, _pad, name)) = nom::sequence::tuple((
            number::le_u64,
            number::le_u32,
            nom::bytes::complete::take(2usize),
            nom::bytes::complete::take(MICRO_NAME_MAX),
        ))(input)?;
        Ok((
            input,
            Self {
                value,
                cd,
                name: name.to_vec(),
            },
        ))
    }
}

impl fmt::Debug for MicroZapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicroZapEntry")
            .field("value", &self.value)
            .field("cd", &self.cd)
            .field("name", &&self.name[..])
            .finish()
    }
}

/// Header block of a fat ZAP: the pointer table mapping hash prefixes
/// to leaf block numbers, embedded in the second half of the block when
/// small enough.
#[derive(Clone)]
pub struct FatZapHeader {
    pub magic: u64,
    pub ptrtbl: ZapTable,
    pub freeblk: u64,
    pub num_leafs: u64,
    pub num_entries: u64,
    pub salt: u64,
    pub leafs: Vec<u64>,
}

impl fmt::Debug for FatZapHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatZapHeader")
            .field("magic", &self.magic)
            .field("ptrtbl", &self.ptrtbl)
            .field("num_leafs", &self.num_leafs)
            .field("num_entries", &self.num_entries)
            .field("salt", &self.salt)
            .finish()
    }
}

impl FatZapHeader {
    pub fn parse(input: &[u8], block_size: usize) -> IResult<&[u8], Self> {
        let (input, (_block_type, magic, ptrtbl, freeblk, num_leafs, num_entries, salt)) =
            nom::sequence::tuple((
                nom::combinator::verify(number::le_u64, |btype| *btype == ZBT_HEADER),
                number::le_u64,
                ZapTable::parse,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
            ))(input)?;
        let (input, _pad) = nom::bytes::complete::take((block_size / 2) - 88)(input)?;
        let (input, leafs) = nom::multi::count(number::le_u64, (block_size / 2) / 8)(input)?;
        Ok((
            input,
            Self {
                magic,
                ptrtbl,
                freeblk,
                num_leafs,
                num_entries,
                salt,
                leafs,
            },
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ZapTable {
    /// First block of the external pointer table; 0 when the table is
    /// embedded in the header block.
    pub blk: u64,
    pub numblks: u64,
    pub shift: u64,
    pub nextblk: u64,
    pub blk_copied: u64,
}

impl ZapTable {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (blk, numblks, shift, nextblk, blk_copied)) = nom::sequence::tuple((
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
        ))(input)?;
        Ok((
            input,
            Self {
                blk,
                numblks,
                shift,
                nextblk,
                blk_copied,
            },
        ))
    }
}

const ZAP_LEAF_ARRAY_BYTES: usize = 24 - 3;
const ZAP_CHAIN_END: u16 = 0xffff;

pub const fn zap_leaf_hash_numentries(block_size: usize) -> usize {
    block_size / 32
}

pub const fn zap_leaf_numchunks(block_size: usize) -> usize {
    ((block_size - (2 * zap_leaf_hash_numentries(block_size))) / 24) - 2
}

// The entry_shift bits of the hash that follow the leaf's prefix select
// a slot in the leaf hash table.
fn leaf_slot(hash: u64, entry_shift: u32, prefix_len: u16) -> u64 {
    let shifted = hash >> (64 - entry_shift as u64 - prefix_len as u64);
    shifted & ((1 << entry_shift) - 1)
}

#[derive(Debug, Clone)]
pub struct ZapLeaf {
    pub hdr: ZapLeafHeader,
    pub hash: Vec<u16>,
    pub chunks: Vec<ZapLeafChunk>,
}

impl ZapLeaf {
    pub fn parse(input: &[u8], block_size: usize) -> IResult<&[u8], Self> {
        let (input, hdr) = ZapLeafHeader::parse(input)?;
        let (input, hash) =
            nom::multi::count(number::le_u16, zap_leaf_hash_numentries(block_size))(input)?;
        let (input, chunks) =
            nom::multi::count(ZapLeafChunk::parse, zap_leaf_numchunks(block_size))(input)?;
        Ok((input, Self { hdr, hash, chunks }))
    }

    pub fn lookup(&self, key: &[u8], hash: u64, leaf_block_shift: u32) -> Option<ZapValue> {
        let mut slot = leaf_slot(hash, leaf_block_shift, self.hdr.prefix_len);
        loop {
            let chunk_idx = match self.hash.get(slot as usize)? {
                &ZAP_CHAIN_END => return None,
                &i => i,
            };
            let entry = match self.chunks.get(chunk_idx as usize)? {
                ZapLeafChunk::Entry(e) => e,
                _ => return None,
            };
            // name array carries the trailing NUL
            let name_length = (entry.name_length as usize).checked_sub(1)?;
            let name = self.read_array(entry.name_chunk, name_length)?;
            if name == key {
                let value = self.read_array(
                    entry.value_chunk,
                    entry.int_size as usize * entry.value_length as usize,
                )?;
                return ZapValue::parse(&value, entry.int_size);
            }
            if entry.next == ZAP_CHAIN_END {
                return None;
            }
            slot = entry.next as u64;
        }
    }

    fn read_array(&self, mut chunk_idx: u16, length: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(length);
        loop {
            let a = match self.chunks.get(chunk_idx as usize)? {
                ZapLeafChunk::Array(a) => a,
                _ => return None,
            };
            out.extend(&a.array);
            if a.next == ZAP_CHAIN_END {
                out.truncate(length);
                return Some(out);
            }
            chunk_idx = a.next;
        }
    }

    pub fn entries(&self) -> Vec<(String, ZapValue)> {
        self.chunks
            .iter()
            .filter_map(|chunk| match chunk {
                ZapLeafChunk::Entry(e) => Some(e),
                _ => None,
            })
            .filter_map(|entry| {
                let name_length = (entry.name_length as usize).checked_sub(1)?;
                let name = self.read_array(entry.name_chunk, name_length)?;
                let value = self.read_array(
                    entry.value_chunk,
                    entry.int_size as usize * entry.value_length as usize,
                )?;
                Some((
                    String::from_utf8_lossy(&name).into_owned(),
                    ZapValue::parse(&value, entry.int_size)?,
                ))
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ZapLeafHeader {
    pub next: u64,
    pub prefix: u64,
    pub magic: u32,
    pub nfree: u16,
    pub nentries: u16,
    pub prefix_len: u16,
    pub freelist: u16,
    pub flags: u8,
}

impl ZapLeafHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (
            input,
            (_block_type, next, prefix, magic, nfree, nentries, prefix_len, freelist, flags, _pad),
        ) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u64, |btype| *btype == ZBT_LEAF),
            number::le_u64,
            number::le_u64,
            number::le_u32,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            number::le_u8,
            nom::bytes::complete::take(11usize),
        ))(input)?;
        Ok((
            input,
            Self {
                next,
                prefix,
                magic,
                nfree,
                nentries,
                prefix_len,
                freelist,
                flags,
            },
        ))
    }
}

const ZAP_LEAF_ENTRY: u8 = 252;
const ZAP_LEAF_ARRAY: u8 = 251;
const ZAP_LEAF_FREE: u8 = 253;

/// A 24-byte leaf chunk, discriminated by its first byte.
#[derive(Debug, Clone)]
pub enum ZapLeafChunk {
    Entry(ZapLeafEntry),
    Array(ZapLeafArray),
    Free(ZapLeafFree),
}

impl ZapLeafChunk {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        nom::branch::alt((ZapLeafEntry::parse, ZapLeafArray::parse, ZapLeafFree::parse))(input)
    }
}

#[derive(Debug, Clone)]
pub struct ZapLeafEntry {
    pub int_size: u8,
    pub next: u16,
    pub name_chunk: u16,
    pub name_length: u16,
    pub value_chunk: u16,
    pub value_length: u16,
    pub cd: u16,
    pub hash: u64,
}

impl ZapLeafEntry {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ZapLeafChunk> {
        let (
            input,
            (_kind, int_size, next, name_chunk, name_length, value_chunk, value_length, cd, _pad, hash),
        ) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u8, |kind| *kind == ZAP_LEAF_ENTRY),
            number::le_u8,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            nom::bytes::complete::take(2usize),
            number::le_u64,
        ))(input)?;
        Ok((
            input,
            ZapLeafChunk::Entry(Self {
                int_size,
                next,
                name_chunk,
                name_length,
                value_chunk,
                value_length,
                cd,
                hash,
            }),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ZapLeafArray {
    pub array: [u8; ZAP_LEAF_ARRAY_BYTES],
    pub next: u16,
}

impl ZapLeafArray {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ZapLeafChunk> {
        let (input, (_kind, array, next)) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u8, |kind| *kind == ZAP_LEAF_ARRAY),
            nom::bytes::complete::take(ZAP_LEAF_ARRAY_BYTES),
            number::le_u16,
        ))(input)?;
        Ok((
            input,
            ZapLeafChunk::Array(Self {
                array: TryFrom::try_from(array).unwrap(),
                next,
            }),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ZapLeafFree {
    pub next: u16,
}

impl ZapLeafFree {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ZapLeafChunk> {
        let (input, (_kind, _pad, next)) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u8, |kind| *kind == ZAP_LEAF_FREE),
            nom::bytes::complete::take(ZAP_LEAF_ARRAY_BYTES),
            number::le_u16,
        ))(input)?;
        Ok((input, ZapLeafChunk::Free(Self { next })))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A micro ZAP block with the given entries.
    pub(crate) fn build_micro_zap(
        block_size: usize,
        salt: u64,
        entries: &[(&str, u64)],
    ) -> Vec<u8> {
        assert!(64 + entries.len() * 64 <= block_size);
        let mut out = vec![0u8; block_size];
        out[0..8].copy_from_slice(&ZBT_MICRO.to_le_bytes());
        out[8..16].copy_from_slice(&salt.to_le_bytes());
        for (i, (name, value)) in entries.iter().enumerate() {
            let base = 64 + i * 64;
            out[base..base + 8].copy_from_slice(&value.to_le_bytes());
            out[base + 14..base + 14 + name.len()].copy_from_slice(name.as_bytes());
        }
        out
    }

    #[test]
    fn hash_is_salted() {
        let a = zap_hash(0x1234, b"ROOT");
        let b = zap_hash(0x5678, b"ROOT");
        assert_ne!(a, b);
        assert_eq!(a, zap_hash(0x1234, b"ROOT"));
    }

    #[test]
    fn hash_matches_reference_update() {
        // Bytewise reflected CRC-64/ECMA with the salt as seed.
        fn reference(salt: u64, key: &[u8]) -> u64 {
            let mut table = [0u64; 256];
            for (i, slot) in table.iter_mut().enumerate() {
                let mut crc = i as u64;
                for _ in 0..8 {
                    crc = if crc & 1 != 0 {
                        (crc >> 1) ^ 0xc96c_5795_d787_0f42
                    } else {
                        crc >> 1
                    };
                }
                *slot = crc;
            }
            let mut h = salt;
            for b in key {
                h = (h >> 8) ^ table[((h ^ *b as u64) & 0xff) as usize];
            }
            h
        }
        for key in [&b"ROOT"[..], b"root_dataset", b""] {
            assert_eq!(zap_hash(0xdeadbeef, key), reference(0xdeadbeef, key));
        }
    }

    #[test]
    fn micro_zap_lookup_and_entries() {
        let block = build_micro_zap(1024, 7, &[("alpha", 11), ("beta", 22)]);
        let (_, parsed) = ZapBlock::parse(&block, 1024).unwrap();
        let micro = match parsed {
            ZapBlock::Micro(m) => m,
            other => panic!("expected micro zap, got {:?}", other),
        };
        assert_eq!(micro.lookup(b"alpha"), Some(11));
        assert_eq!(micro.lookup(b"beta"), Some(22));
        assert_eq!(micro.lookup(b"gamma"), None);
        assert_eq!(micro.lookup(b"alp"), None);
        let mut entries = micro.entries();
        entries.sort();
        assert_eq!(entries, vec![("alpha".into(), 11), ("beta".into(), 22)]);
    }

    /// A leaf block holding one entry for `key`.
    pub(crate) fn build_leaf(block_size: usize, key: &[u8], hash: u64, value: u64) -> Vec<u8> {
        let numentries = zap_leaf_hash_numentries(block_size);
        let numchunks = zap_leaf_numchunks(block_size);
        let entry_shift = numentries.trailing_zeros();

        let mut out = Vec::with_capacity(block_size);
        out.extend_from_slice(&ZBT_LEAF.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // next leaf
        out.extend_from_slice(&0u64.to_le_bytes()); // prefix
        out.extend_from_slice(&0x2AB1_EAFu32.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // nfree
        out.extend_from_slice(&1u16.to_le_bytes()); // nentries
        out.extend_from_slice(&0u16.to_le_bytes()); // prefix_len
        out.extend_from_slice(&0u16.to_le_bytes()); // freelist
        out.push(0); // flags
        out.extend_from_slice(&[0u8; 11]);

        let slot = leaf_slot(hash, entry_shift, 0) as usize;
        for i in 0..numentries {
            let v: u16 = if i == slot { 0 } else { ZAP_CHAIN_END };
            out.extend_from_slice(&v.to_le_bytes());
        }

        // chunk 0: the entry, chunk 1: name array, chunk 2: value array
        let mut name = key.to_vec();
        name.push(0);
        assert!(name.len() <= ZAP_LEAF_ARRAY_BYTES);
        out.push(ZAP_LEAF_ENTRY);
        out.push(8); // int_size
        out.extend_from_slice(&ZAP_CHAIN_END.to_le_bytes()); // next
        out.extend_from_slice(&1u16.to_le_bytes()); // name chunk
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes()); // value chunk
        out.extend_from_slice(&1u16.to_le_bytes()); // value length
        out.extend_from_slice(&0u16.to_le_bytes()); // cd
        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(&hash.to_le_bytes());

        out.push(ZAP_LEAF_ARRAY);
        name.resize(ZAP_LEAF_ARRAY_BYTES, 0);
        out.extend_from_slice(&name);
        out.extend_from_slice(&ZAP_CHAIN_END.to_le_bytes());

        out.push(ZAP_LEAF_ARRAY);
        let mut value_bytes = value.to_be_bytes().to_vec();
        value_bytes.resize(ZAP_LEAF_ARRAY_BYTES, 0);
        out.extend_from_slice(&value_bytes);
        out.extend_from_slice(&ZAP_CHAIN_END.to_le_bytes());

        for _ in 3..numchunks {
            out.push(ZAP_LEAF_FREE);
            out.extend_from_slice(&[0u8; ZAP_LEAF_ARRAY_BYTES]);
            out.extend_from_slice(&ZAP_CHAIN_END.to_le_bytes());
        }
        out.resize(block_size, 0);
        out
    }

    #[test]
    fn fat_leaf_lookup() {
        let block_size = 4096;
        let salt = 0x99;
        let key = b"bonus";
        let hash = zap_hash(salt, key);
        let block = build_leaf(block_size, key, hash, 4242);
        let (_, leaf) = ZapLeaf::parse(&block, block_size).unwrap();
        let shift = zap_leaf_hash_numentries(block_size).trailing_zeros();
        assert_eq!(
            leaf.lookup(key, hash, shift),
            Some(ZapValue::U64(vec![4242]))
        );
        assert_eq!(leaf.lookup(b"other", zap_hash(salt, b"other"), shift), None);
        let entries = leaf.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "bonus");
    }

    #[test]
    fn zero_name_length_entry_is_ignored() {
        let block_size = 4096;
        let key = b"bonus";
        let hash = zap_hash(0x99, key);
        let mut block = build_leaf(block_size, key, hash, 4242);
        // entry chunk 0 sits right after the header and hash table
        let entry_at = 48 + 2 * zap_leaf_hash_numentries(block_size);
        block[entry_at + 6..entry_at + 8].copy_from_slice(&0u16.to_le_bytes());
        let (_, leaf) = ZapLeaf::parse(&block, block_size).unwrap();
        let shift = zap_leaf_hash_numentries(block_size).trailing_zeros();
        assert_eq!(leaf.lookup(key, hash, shift), None);
        assert!(leaf.entries().is_empty());
    }

    #[test]
    fn leaf_block_is_not_a_header() {
        let block_size = 4096;
        let block = build_leaf(block_size, b"x", 0, 1);
        match ZapBlock::parse(&block, block_size).unwrap().1 {
            ZapBlock::FatLeaf(_) => {}
            other => panic!("expected leaf, got {:?}", other),
        }
    }
}
