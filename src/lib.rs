//!
//! Read-only userspace engine for the ZFS on-disk format: label and
//! uberblock discovery, block-pointer resolution with checksum
//! verification and decompression, RAID-Z reconstruction, object set
//! traversal and the pool history log.
//!
use std::backtrace::Backtrace;
use std::convert::TryFrom;
use std::fmt;
use std::fs::File;
use std::io::Error as IoError;
use std::io::Result as IoResult;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

pub mod checksum;
pub mod compression;
pub mod dmu;
pub mod dsl;
pub mod history;
pub mod nv;
pub mod pool;
pub mod raidz;
pub mod spa;
pub mod vdev;
pub mod zap;
pub mod zpl;

use crate::dmu::DNodePhys;
use crate::spa::{
    BlockPtr, BlockPtrKind, Checksum, ChecksumType, CompressionType, Dva, GangHeader,
    BLOCK_PTR_SIZE, GANG_HEADER_SIZE,
};
use crate::vdev::VdevReader;

pub use crate::pool::{Dataset, ObjectSet, Pool};

/// A byte-addressable storage extent backing one leaf vdev.
pub trait RawDevice {
    type Block: AsRef<[u8]>;
    /// Read the requested amount, given in bytes.
    fn read_raw(&self, addr: u64, size: u64) -> IoResult<Self::Block>;
    /// Total size in bytes; needed to locate the two tail labels.
    fn capacity(&self) -> IoResult<u64>;
}

/// A pool image backed by a regular file or block device.
#[derive(Debug)]
pub struct Disk {
    file: File,
}

impl Disk {
    pub fn open<P: AsRef<Path>>(path: P) -> IoResult<Self> {
        let file = File::open(path)?;
        Ok(Self { file })
    }
}

impl RawDevice for Disk {
    type Block = Vec<u8>;
    fn read_raw(&self, addr: u64, size: u64) -> IoResult<Self::Block> {
        let mut buf = vec![0; size as usize];
        (&self.file).seek(SeekFrom::Start(addr))?;
        (&self.file).read_exact(&mut buf)?;
        Ok(buf)
    }
    fn capacity(&self) -> IoResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[derive(Debug)]
pub struct ZfsError {
    pub source: ZfsErrorKind,
    backtrace: Backtrace,
}

impl fmt::Display for ZfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.source, self.backtrace)
    }
}

impl std::error::Error for ZfsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<ZfsErrorKind> for ZfsError {
    fn from(source: ZfsErrorKind) -> Self {
        Self {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

impl From<IoError> for ZfsError {
    fn from(e: IoError) -> Self {
        ZfsErrorKind::from(e).into()
    }
}

impl<T> From<nom::Err<(T, nom::error::ErrorKind)>> for ZfsError {
    fn from(e: nom::Err<(T, nom::error::ErrorKind)>) -> Self {
        ZfsErrorKind::from(e).into()
    }
}

#[derive(Debug, Error)]
pub enum ZfsErrorKind {
    #[error("structurally malformed data {0:?}")]
    Parse(nom::error::ErrorKind),
    #[error("checksum mismatch: stored {expected:?}, computed {actual:?}")]
    ChecksumMismatch { expected: Checksum, actual: Checksum },
    #[error("every DVA copy failed verification")]
    AllCopiesCorrupt,
    #[error("raid-z stripe has more failed columns than parity can repair")]
    UnrecoverableStripe,
    #[error("unrecognized object type tag {0}")]
    UnsupportedObjectType(u8),
    #[error("unrecognized or unsupported algorithm tag {0}")]
    UnsupportedAlgorithm(u8),
    #[error("block contents do not match their description")]
    CorruptBlock,
    #[error("corrupt history record at offset {0}")]
    CorruptHistoryRecord(u64),
    #[error("invalid data")]
    Invalid,
    #[error("required data not found")]
    NotFound,
    #[error("io error {0}")]
    Io(IoError),
}

impl From<IoError> for ZfsErrorKind {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl<T> From<nom::Err<(T, nom::error::ErrorKind)>> for ZfsErrorKind {
    fn from(e: nom::Err<(T, nom::error::ErrorKind)>) -> Self {
        Self::Parse(match e {
            nom::Err::Incomplete(_) => nom::error::ErrorKind::Complete,
            nom::Err::Error(e) => e.1,
            nom::Err::Failure(f) => f.1,
        })
    }
}

/// Effective checksum/compression settings inherited from the parent of
/// the block being resolved. Threaded explicitly through each recursive
/// resolution rather than held as shared state.
#[derive(Debug, Clone)]
pub struct ReadProps {
    pub checksum: ChecksumType,
    pub compression: CompressionType,
}

impl Default for ReadProps {
    fn default() -> Self {
        Self {
            checksum: ChecksumType::Fletcher4,
            compression: CompressionType::LZ4,
        }
    }
}

impl ReadProps {
    /// Settings recorded in a dnode apply to the blocks it points at.
    pub fn for_dnode(header: &dmu::DNodePhysHeader) -> Self {
        let defaults = Self::default();
        let checksum = match ChecksumType::try_from(header.checksum) {
            Ok(ChecksumType::Inherit) | Ok(ChecksumType::On) | Err(_) => defaults.checksum,
            Ok(c) => c,
        };
        let compression = match CompressionType::try_from(header.compress) {
            Ok(CompressionType::Inherit) | Ok(CompressionType::On) | Err(_) => defaults.compression,
            Ok(c) => c,
        };
        Self {
            checksum,
            compression,
        }
    }

    fn effective_checksum(&self, tag: &ChecksumType) -> ChecksumType {
        match tag {
            ChecksumType::Inherit => self.checksum.clone(),
            ChecksumType::On => ChecksumType::Fletcher4,
            other => other.clone(),
        }
    }

    fn effective_compression(&self, tag: &CompressionType) -> CompressionType {
        match tag {
            CompressionType::Inherit => self.compression.clone(),
            CompressionType::On => CompressionType::LZ4,
            other => other.clone(),
        }
    }
}

const fn level_index(id: u64, level: u8, level_shift: u8) -> u64 {
    (id >> (level as u64 * level_shift as u64)) % (1 << (level_shift as u64))
}

/// Block pointers are 128 bytes, so an indirect block of
/// `1 << indirect_block_shift` bytes holds `1 << (shift - 7)` of them.
/// A smaller shift cannot describe a valid dnode.
fn dnode_level_shift(header: &dmu::DNodePhysHeader) -> Result<u8, ZfsError> {
    if header.indirect_block_shift < 7 {
        return Err(ZfsErrorKind::Parse(nom::error::ErrorKind::Verify).into());
    }
    Ok(header.indirect_block_shift - 7)
}

/// Ephemeral state for one chain of block resolutions: the open vdev set
/// plus the inherited properties threaded through the call stack.
pub struct ReadContext<'a, D: RawDevice> {
    pub vdevs: VdevReader<'a, D>,
}

impl<'a, D: RawDevice> Clone for ReadContext<'a, D> {
    fn clone(&self) -> Self {
        Self {
            vdevs: self.vdevs.clone(),
        }
    }
}

impl<'a, D: RawDevice> ReadContext<'a, D> {
    pub fn new(vdevs: VdevReader<'a, D>) -> Self {
        Self { vdevs }
    }

    /// Resolve a block pointer to its logical bytes: fetch a verified
    /// physical copy (each DVA tried in order), then decompress.
    pub fn resolve(&self, bp: &BlockPtr, inherited: &ReadProps) -> Result<Vec<u8>, ZfsError> {
        if bp.encryption {
            return Err(ZfsErrorKind::UnsupportedAlgorithm(0xff).into());
        }
        let compression = inherited.effective_compression(&bp.compression);
        let logical_size = bp.logical_size as usize;
        match &bp.kind {
            BlockPtrKind::Data(payload) => {
                let physical = bp.physical_size as usize;
                if physical > payload.len() {
                    return Err(ZfsErrorKind::CorruptBlock.into());
                }
                compression::decompress(&compression, &payload[..physical], logical_size)
            }
            BlockPtrKind::Ptr(_) => {
                let physical = self.fetch_physical(bp, inherited)?;
                compression::decompress(&compression, &physical, logical_size)
            }
        }
    }

    /// Fetch the verified physical bytes of a non-embedded block
    /// pointer, trying each allocated DVA copy in order.
    fn fetch_physical(&self, bp: &BlockPtr, inherited: &ReadProps) -> Result<Vec<u8>, ZfsError> {
        let ptr = match &bp.kind {
            BlockPtrKind::Ptr(p) => p,
            BlockPtrKind::Data(_) => return Err(ZfsErrorKind::Invalid.into()),
        };
        let checksum_type = inherited.effective_checksum(&ptr.checksum_type);
        let mut last: Option<ZfsError> = None;
        for dva in ptr.dvas.iter().filter(|d| d.is_allocated()) {
            let attempt = if dva.gang {
                self.read_gang(dva, inherited)
            } else {
                self.vdevs
                    .read_dva(dva, bp.physical_size as usize, &|data: &[u8]| {
                        checksum::verify(&checksum_type, data, &ptr.checksum)
                    })
            };
            match attempt {
                Ok(data) => return Ok(data),
                Err(e) => {
                    log::warn!("DVA copy {:?} failed: {}", dva, e);
                    last = Some(e);
                }
            }
        }
        match last {
            Some(_) => Err(ZfsErrorKind::AllCopiesCorrupt.into()),
            // A pointer with no allocated DVAs that is not a hole.
            None => Err(ZfsErrorKind::Invalid.into()),
        }
    }

    /// A gang DVA points at a header block of up to three child block
    /// pointers; the children's physical payloads concatenate in order.
    /// Children carry their own checksums and are verified individually.
    fn read_gang(&self, dva: &Dva, inherited: &ReadProps) -> Result<Vec<u8>, ZfsError> {
        let offset = dva.offset << spa::SECTOR_SHIFT;
        let header = self.vdevs.read_dva(
            &Dva {
                gang: false,
                ..*dva
            },
            GANG_HEADER_SIZE,
            &|data: &[u8]| checksum::label_verify(data, offset),
        )?;
        let (_, gang) = GangHeader::parse(&header)?;
        let mut out = Vec::new();
        for child in gang.blkptr.iter() {
            if child.is_hole() {
                continue;
            }
            out.extend(self.fetch_physical(child, inherited)?);
        }
        Ok(out)
    }

    /// Random access to one data block of an object, descending the
    /// indirect-block radix. Holes at any level read as zeros.
    pub fn read_block(&self, dnode: &DNodePhys, block_id: u64) -> Result<Vec<u8>, ZfsError> {
        if block_id > dnode.header.max_block_id {
            return Err(ZfsErrorKind::NotFound.into());
        }
        if dnode.header.levels == 0 || dnode.block_pointers.is_empty() {
            return Err(ZfsErrorKind::NotFound.into());
        }
        let props = ReadProps::for_dnode(&dnode.header);
        let level_shift = dnode_level_shift(&dnode.header)?;
        let data_block_size = dnode.header.datablkszsec as u32 * 512;
        let level = dnode.header.levels - 1;
        let idx = level_index(block_id, level, level_shift);
        let bp = dnode
            .block_pointers
            .get(idx as usize)
            .ok_or(ZfsErrorKind::NotFound)?;
        self.lookup_block(bp, block_id, level, level_shift, data_block_size, &props)
    }

    fn lookup_block(
        &self,
        bp: &BlockPtr,
        block_id: u64,
        level: u8,
        level_shift: u8,
        data_block_size: u32,
        props: &ReadProps,
    ) -> Result<Vec<u8>, ZfsError> {
        if bp.is_hole() {
            return Ok(vec![0; data_block_size as usize]);
        }
        let block = self.resolve(bp, props)?;
        if level == 0 {
            return Ok(block);
        }
        let idx = level_index(block_id, level - 1, level_shift);
        let start = idx as usize * BLOCK_PTR_SIZE;
        let (_, child) = BlockPtr::parse(&block[start..])?;
        self.lookup_block(&child, block_id, level - 1, level_shift, data_block_size, props)
    }

    /// Read a whole object as one logical byte stream: indirect blocks
    /// are dereferenced recursively, leaves accumulate in logical
    /// order. An object with no block pointers is the empty sequence.
    pub fn read_object(&self, dnode: &DNodePhys) -> Result<Vec<u8>, ZfsError> {
        if dnode.header.levels == 0 || dnode.block_pointers.is_empty() {
            return Ok(Vec::new());
        }
        let props = ReadProps::for_dnode(&dnode.header);
        let level_shift = dnode_level_shift(&dnode.header)?;
        let data_block_size = dnode.header.datablkszsec as usize * 512;
        let mut out = Vec::new();
        for bp in &dnode.block_pointers {
            self.gather(
                bp,
                dnode.header.levels - 1,
                level_shift,
                data_block_size,
                &props,
                &mut out,
            )?;
        }
        out.truncate((dnode.header.max_block_id as usize + 1) * data_block_size);
        Ok(out)
    }

    fn gather(
        &self,
        bp: &BlockPtr,
        level: u8,
        level_shift: u8,
        data_block_size: usize,
        props: &ReadProps,
        out: &mut Vec<u8>,
    ) -> Result<(), ZfsError> {
        if bp.is_hole() {
            let blocks = 1usize << (level as usize * level_shift as usize);
            out.resize(out.len() + blocks * data_block_size, 0);
            return Ok(());
        }
        let block = self.resolve(bp, props)?;
        if level == 0 {
            out.extend(block);
            return Ok(());
        }
        for chunk in block.chunks_exact(BLOCK_PTR_SIZE) {
            let (_, child) = BlockPtr::parse(chunk)?;
            self.gather(&child, level - 1, level_shift, data_block_size, props, out)?;
        }
        Ok(())
    }

    /// Read one dnode out of an object-set array by id.
    pub fn read_dnode(&self, meta: &DNodePhys, dnode_id: u64) -> Result<DNodePhys, ZfsError> {
        // dnodes are 512 bytes, so a block holds datablkszsec of them.
        let per_block = meta.header.datablkszsec as u64;
        let block_id = dnode_id / per_block;
        let index = dnode_id % per_block;
        let block = self.read_block(meta, block_id)?;
        let (_, dnode) = DNodePhys::parse(&block[index as usize * 512..])?;
        Ok(dnode)
    }
}
