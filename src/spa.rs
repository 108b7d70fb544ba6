//!
//! On-disk structures owned by the Storage Pool Allocator: labels,
//! uberblocks, DVAs and block pointers
//!
use std::convert::TryFrom;
use std::fmt;

use nom::{number::complete as number, IResult};

use enum_repr_derive::TryFrom;

use crate::checksum::{label_verify, Fletcher2, Fletcher4};

pub const SECTOR_SHIFT: u32 = 9;

/// Byte offset of the allocatable region: two front labels plus the boot
/// block.
pub const DEVICE_DATA_OFFSET: u64 = 0x400000;

/// A 256-bit checksum value.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Checksum {
    pub checksum: [u64; 4],
}

impl From<Fletcher4> for Checksum {
    fn from(f: Fletcher4) -> Self {
        Self {
            checksum: [f.a, f.b, f.c, f.d],
        }
    }
}

impl From<Fletcher2> for Checksum {
    fn from(f: Fletcher2) -> Self {
        Self {
            checksum: [f.a0, f.a1, f.b0, f.b1],
        }
    }
}

impl Checksum {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (c1, c2, c3, c4)) = nom::sequence::tuple((
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
        ))(input)?;
        Ok((
            input,
            Self {
                checksum: [c1, c2, c3, c4],
            },
        ))
    }
}

/// On-disk checksum algorithm tags. Part of the wire format; never
/// renumber.
#[repr(u8)]
#[derive(Debug, Clone, TryFrom, Eq, PartialEq)]
pub enum ChecksumType {
    Inherit = 0,
    On = 1,
    Off = 2,
    Label = 3,
    GangHeader = 4,
    ZILog = 5,
    Fletcher2 = 6,
    Fletcher4 = 7,
    SHA256 = 8,
    ZILog2 = 9,
    NoParity = 10,
    SHA512 = 11,
    Skein = 12,
}

impl ChecksumType {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        nom::combinator::map_res(number::le_u8, Self::try_from)(input)
    }
}

/// On-disk compression algorithm tags. Part of the wire format; never
/// renumber.
#[repr(u8)]
#[derive(Debug, Clone, TryFrom, Eq, PartialEq)]
pub enum CompressionType {
    Inherit = 0,
    On = 1,
    Off = 2,
    LZJB = 3,
    Empty = 4,
    GZIP1 = 5,
    GZIP2 = 6,
    GZIP3 = 7,
    GZIP4 = 8,
    GZIP5 = 9,
    GZIP6 = 10,
    GZIP7 = 11,
    GZIP8 = 12,
    GZIP9 = 13,
    ZLE = 14,
    LZ4 = 15,
}

impl CompressionType {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        nom::combinator::map_res(number::le_u8, Self::try_from)(input)
    }
}

/// Device Virtual Address: one physical copy of a block.
#[derive(Copy, Clone)]
pub struct Dva {
    pub vdev: u32,
    pub grid: u8,
    /// Allocated size in sectors.
    pub asize: u32,
    /// Offset in sectors from the start of the allocatable region.
    pub offset: u64,
    pub gang: bool,
}

impl fmt::Debug for Dva {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dva")
            .field("vdev", &self.vdev)
            .field("asize", &self.asize)
            .field("offset", &format_args!("{:x}", self.offset << SECTOR_SHIFT))
            .field("gang", &self.gang)
            .finish()
    }
}

impl Dva {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (asize, grid, vdev)) =
            nom::sequence::tuple((number::le_u24, number::le_u8, number::le_u32))(input)?;
        let (input, offset_gang) = number::le_u64(input)?;
        Ok((
            input,
            Self {
                vdev,
                grid,
                asize,
                offset: offset_gang & ((1 << 63) - 1),
                gang: offset_gang & (1 << 63) != 0,
            },
        ))
    }

    pub fn is_allocated(&self) -> bool {
        self.asize != 0
    }

    pub fn allocated_bytes(&self) -> u64 {
        (self.asize as u64) << SECTOR_SHIFT
    }
}

/// The DVA-bearing half of a non-embedded block pointer.
#[derive(Debug, Clone)]
pub struct BlockPtrPtr {
    pub dvas: [Dva; 3],
    pub physical_birth: u64,
    pub checksum_type: ChecksumType,
    pub fill_count: u64,
    pub checksum: Checksum,
}

#[derive(Debug, Clone)]
pub enum BlockPtrKind {
    /// Up to three redundant on-disk copies.
    Ptr(BlockPtrPtr),
    /// Payload carried inline; such a pointer has no DVAs.
    Data(Vec<u8>),
}

/// A self-describing reference to one logical block.
#[derive(Debug, Clone)]
pub struct BlockPtr {
    pub kind: BlockPtrKind,
    pub byteorder: bool,
    pub dedup: bool,
    pub encryption: bool,
    /// Raw DMU object type tag of the pointed-to data.
    pub object_type: u8,
    pub compression: CompressionType,
    /// Indirection level; 0 points at data, > 0 at arrays of block
    /// pointers.
    pub level: u8,
    /// Physical (possibly compressed) size in bytes.
    pub physical_size: u32,
    /// Logical (decompressed) size in bytes.
    pub logical_size: u32,
    pub birth_txg: u64,
}

pub const BLOCK_PTR_SIZE: usize = 128;

impl BlockPtr {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        // Peek the flags word to decide between the embedded and the
        // normal layout.
        let (input, (_skip, flags)) = nom::combinator::peek(nom::sequence::tuple((
            nom::bytes::complete::take(6 * 8usize),
            number::le_u64,
        )))(input)?;
        if flags & (1 << 39) != 0 {
            Self::parse_embedded(input)
        } else {
            Self::parse_normal(input)
        }
    }

    fn parse_embedded(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, data0) = nom::bytes::complete::take(6 * 8usize)(input)?;
        let (input, props) = number::le_u64(input)?;
        let (input, (data1, birth_txg, data2)) = nom::sequence::tuple((
            nom::bytes::complete::take(3 * 8usize),
            number::le_u64,
            nom::bytes::complete::take(5 * 8usize),
        ))(input)?;

        let logical_size = (props & ((1 << 25) - 1)) as u32 + 1;
        let physical_size = ((props >> 25) & ((1 << 7) - 1)) as u32 + 1;
        let compression = match CompressionType::try_from(((props >> 32) & 0x7f) as u8) {
            Ok(c) => c,
            Err(_) => {
                return Err(nom::Err::Error((input, nom::error::ErrorKind::MapRes)));
            }
        };
        let object_type = ((props >> 48) & 0xff) as u8;
        let level = ((props >> 56) & 0x1f) as u8;

        let mut data = Vec::with_capacity(data0.len() + data1.len() + data2.len());
        data.extend(data0);
        data.extend(data1);
        data.extend(data2);

        Ok((
            input,
            Self {
                kind: BlockPtrKind::Data(data),
                byteorder: props & (1 << 63) != 0,
                dedup: props & (1 << 62) != 0,
                encryption: props & (1 << 61) != 0,
                object_type,
                compression,
                level,
                physical_size,
                logical_size,
                birth_txg,
            },
        ))
    }

    fn parse_normal(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (d1, d2, d3)) =
            nom::sequence::tuple((Dva::parse, Dva::parse, Dva::parse))(input)?;
        let (input, (logical_size, physical_size)) =
            nom::sequence::tuple((number::le_u16, number::le_u16))(input)?;
        let (input, compression_raw) = number::le_u8(input)?;
        let (input, (checksum_type, object_type)) =
            nom::sequence::tuple((ChecksumType::parse, number::le_u8))(input)?;
        let (input, level_flags) = number::le_u8(input)?;
        let (input, (_pad, physical_birth, birth_txg, fill_count)) = nom::sequence::tuple((
            nom::bytes::complete::take(16usize),
            number::le_u64,
            number::le_u64,
            number::le_u64,
        ))(input)?;
        let (input, checksum) = Checksum::parse(input)?;

        let compression = match CompressionType::try_from(compression_raw & ((1 << 7) - 1)) {
            Ok(c) => c,
            Err(_) => {
                return Err(nom::Err::Error((input, nom::error::ErrorKind::MapRes)));
            }
        };

        Ok((
            input,
            Self {
                kind: BlockPtrKind::Ptr(BlockPtrPtr {
                    dvas: [d1, d2, d3],
                    physical_birth,
                    checksum_type,
                    fill_count,
                    checksum,
                }),
                byteorder: level_flags & (1 << 7) != 0,
                dedup: level_flags & (1 << 6) != 0,
                encryption: level_flags & (1 << 5) != 0,
                object_type,
                compression,
                level: level_flags & ((1 << 5) - 1),
                // Sizes are stored biased as (sectors - 1).
                physical_size: (physical_size as u32 + 1) << SECTOR_SHIFT,
                logical_size: (logical_size as u32 + 1) << SECTOR_SHIFT,
                birth_txg,
            },
        ))
    }

    /// A hole: never written, reads back as zeros.
    pub fn is_hole(&self) -> bool {
        match &self.kind {
            BlockPtrKind::Ptr(p) => self.birth_txg == 0 && p.dvas.iter().all(|d| !d.is_allocated()),
            BlockPtrKind::Data(_) => false,
        }
    }
}

/// Tail shared by gang headers and intent-log blocks.
#[derive(Debug, Clone)]
pub struct ZioBlockTail {
    pub magic: u64,
    pub checksum: Checksum,
}

impl ZioBlockTail {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (magic, checksum)) =
            nom::sequence::tuple((number::le_u64, Checksum::parse))(input)?;
        Ok((input, Self { magic, checksum }))
    }
}

/// Gang header: an oversized allocation split into up to three child
/// block pointers whose payloads concatenate in order.
#[derive(Debug, Clone)]
pub struct GangHeader {
    pub blkptr: [BlockPtr; 3],
    pub tail: ZioBlockTail,
}

pub const GANG_HEADER_SIZE: usize = 512;

impl GangHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (b0, b1, b2, _pad, tail)) = nom::sequence::tuple((
            BlockPtr::parse,
            BlockPtr::parse,
            BlockPtr::parse,
            nom::bytes::complete::take(GANG_HEADER_SIZE - (BLOCK_PTR_SIZE * 3) - (5 * 8)),
            ZioBlockTail::parse,
        ))(input)?;
        Ok((
            input,
            Self {
                blkptr: [b0, b1, b2],
                tail,
            },
        ))
    }
}

pub const UBERBLOCK_MAGIC: u64 = 0x00bab10c;

/// A versioned snapshot of pool state, one per transaction group.
#[derive(Debug, Clone)]
pub struct Uberblock {
    pub magic: u64,
    pub version: u64,
    pub txg: u64,
    pub guid_sum: u64,
    pub timestamp: u64,
    pub rootbp: BlockPtr,
    pub software_version: u64,
    pub mmp_magic: u64,
    pub mmp_delay: u64,
    pub mmp_config: u64,
    pub checkpoint_txg: u64,
}

impl Uberblock {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (
            input,
            (
                magic,
                version,
                txg,
                guid_sum,
                timestamp,
                rootbp,
                software_version,
                mmp_magic,
                mmp_delay,
                mmp_config,
                checkpoint_txg,
            ),
        ) = nom::sequence::tuple((
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            BlockPtr::parse,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
        ))(input)?;
        Ok((
            input,
            Self {
                magic,
                version,
                txg,
                guid_sum,
                timestamp,
                rootbp,
                software_version,
                mmp_magic,
                mmp_delay,
                mmp_config,
                checkpoint_txg,
            },
        ))
    }
}

/// One on-disk label copy. Four copies exist per device, two at the
/// front and two at the tail.
#[derive(Debug, Clone)]
pub struct Label {
    /// XDR-packed pool configuration.
    pub nv_config: Vec<u8>,
    /// Raw uberblock ring, kept unparsed so individual slots can be
    /// verified against their device offsets.
    pub uberblock_ring: Vec<u8>,
}

impl Label {
    pub const SIZE: u64 = 256 * 1024;
    pub const COUNT: usize = 4;
    /// Offset of the uberblock ring within a label.
    pub const RING_OFFSET: u64 = 128 * 1024;
    pub const RING_SIZE: usize = 128 * 1024;
    /// Offset of the nvlist area within a label.
    pub const NV_OFFSET: u64 = 16 * 1024;

    /// Byte offsets of the four label copies on a device of `device_size`
    /// bytes.
    pub fn offsets(device_size: u64) -> [u64; 4] {
        [
            0,
            Self::SIZE,
            device_size - 2 * Self::SIZE,
            device_size - Self::SIZE,
        ]
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (_boot, nv_config, uberblock_ring)) = nom::sequence::tuple((
            nom::bytes::complete::take(16 * 1024usize),
            nom::bytes::complete::take(112 * 1024usize),
            nom::bytes::complete::take(Self::RING_SIZE),
        ))(input)?;
        Ok((
            input,
            Self {
                nv_config: nv_config.to_vec(),
                uberblock_ring: uberblock_ring.to_vec(),
            },
        ))
    }

    /// Uberblock ring slots that carry a verifying embedded checksum and
    /// the uberblock magic. `label_offset` is the byte offset of this
    /// label copy on its device; `ashift` sizes the slots.
    pub fn uberblocks(&self, ashift: u32, label_offset: u64) -> Vec<Uberblock> {
        let slot_shift = ashift.max(10);
        let slot_size = 1usize << slot_shift;
        let mut out = Vec::new();
        for (index, slot) in self.uberblock_ring.chunks_exact(slot_size).enumerate() {
            let offset = label_offset + Self::RING_OFFSET + (index * slot_size) as u64;
            if label_verify(slot, offset).is_err() {
                continue;
            }
            if let Ok((_, ub)) = Uberblock::parse(slot) {
                if ub.magic == UBERBLOCK_MAGIC {
                    out.push(ub);
                }
            }
        }
        out
    }
}

/// Pick the authoritative uberblock: the highest txg among verifying
/// candidates. Ties cannot happen on a well-formed pool because txg is
/// monotonic per write.
pub fn select_uberblock<I>(candidates: I) -> Option<Uberblock>
where
    I: IntoIterator<Item = Uberblock>,
{
    candidates.into_iter().max_by_key(|ub| ub.txg)
}
