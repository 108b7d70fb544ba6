//!
//! ZFS Posix Layer: directory entry encoding and the system-attribute
//! registration table
//!
use std::convert::TryFrom;

use enum_repr_derive::TryFrom;

/// A directory ZAP value: object number in the low 48 bits, the entry
/// type in the top nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry(pub u64);

impl DirEntry {
    pub fn new(kind: DirEntryType, objnum: u64) -> Self {
        Self(((u8::from(kind) as u64) << 60) | (objnum & ((1 << 48) - 1)))
    }

    pub fn objnum(&self) -> u64 {
        self.0 & ((1 << 48) - 1)
    }

    pub fn kind(&self) -> DirEntryType {
        let tag = (self.0 >> 60) as u8;
        KnownDirEntryType::try_from(tag)
            .map(DirEntryType::from)
            .unwrap_or(DirEntryType::Invalid(tag))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DirEntryType {
    NotSpecified,
    Fifo,
    CharacterDevice,
    Directory,
    BlockDevice,
    RegularFile,
    SymLink,
    Socket,
    Door,
    EventPort,
    Invalid(u8),
}

// The on-disk tags follow the historical ifmt encoding, with gaps.
#[derive(TryFrom, Clone, Copy)]
#[repr(u8)]
enum KnownDirEntryType {
    NotSpecified = 0,
    Fifo = 1,
    CharacterDevice = 2,
    Directory = 4,
    BlockDevice = 6,
    RegularFile = 8,
    SymLink = 10,
    Socket = 12,
    Door = 13,
    EventPort = 14,
}

impl From<KnownDirEntryType> for DirEntryType {
    fn from(k: KnownDirEntryType) -> Self {
        match k {
            KnownDirEntryType::NotSpecified => Self::NotSpecified,
            KnownDirEntryType::Fifo => Self::Fifo,
            KnownDirEntryType::CharacterDevice => Self::CharacterDevice,
            KnownDirEntryType::Directory => Self::Directory,
            KnownDirEntryType::BlockDevice => Self::BlockDevice,
            KnownDirEntryType::RegularFile => Self::RegularFile,
            KnownDirEntryType::SymLink => Self::SymLink,
            KnownDirEntryType::Socket => Self::Socket,
            KnownDirEntryType::Door => Self::Door,
            KnownDirEntryType::EventPort => Self::EventPort,
        }
    }
}

impl From<DirEntryType> for u8 {
    fn from(t: DirEntryType) -> u8 {
        match t {
            DirEntryType::NotSpecified => 0,
            DirEntryType::Fifo => 1,
            DirEntryType::CharacterDevice => 2,
            DirEntryType::Directory => 4,
            DirEntryType::BlockDevice => 6,
            DirEntryType::RegularFile => 8,
            DirEntryType::SymLink => 10,
            DirEntryType::Socket => 12,
            DirEntryType::Door => 13,
            DirEntryType::EventPort => 14,
            DirEntryType::Invalid(i) => i,
        }
    }
}

/// Name of the root directory entry in a filesystem's master node.
pub const MASTER_NODE_ROOT: &str = "ROOT";

/// A registered system attribute, packed into the u64 value of the
/// registration ZAP.
#[derive(Debug, Clone, Copy)]
pub struct SaAttrPhys(pub u64);

impl SaAttrPhys {
    /// Fixed length in bytes; 0 means variable-size.
    pub fn length(&self) -> u16 {
        ((self.0 >> 24) & 0xffff) as u16
    }

    pub fn byteswap(&self) -> Option<SaByteswap> {
        SaByteswap::try_from(((self.0 >> 16) & 0xff) as u8).ok()
    }

    pub fn attr_num(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

#[derive(Debug, Clone, Copy, TryFrom, PartialEq, Eq)]
#[repr(u8)]
pub enum SaByteswap {
    U64Array = 0,
    U32Array = 1,
    U16Array = 2,
    U8Array = 3,
    Acl = 4,
}
