//!
//! Data Management Unit structures: dnodes, object sets and the closed
//! set of object types this reader understands
//!
use std::convert::TryFrom;

use nom::{number::complete as number, IResult};

use enum_repr_derive::TryFrom;

use crate::dsl::{DatasetPhys, DirPhys};
use crate::history::SpaHistoryPhys;
use crate::spa::BlockPtr;
use crate::{ZfsError, ZfsErrorKind};

pub const DNODE_SIZE: usize = 512;

/// The fixed 64-byte head of a dnode.
#[derive(Debug, Clone)]
pub struct DNodePhysHeader {
    /// Raw object type tag; see [`ObjectType`].
    pub kind: u8,
    pub indirect_block_shift: u8,
    pub levels: u8,
    pub num_block_ptr: u8,
    pub bonus_type: u8,
    pub checksum: u8,
    pub compress: u8,
    /// Data block size in 512-byte sectors.
    pub datablkszsec: u16,
    pub bonus_len: u16,
    pub max_block_id: u64,
    pub used_bytes: u64,
}

impl DNodePhysHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (kind, indirect_block_shift, levels, num_block_ptr)) = nom::sequence::tuple((
            number::le_u8,
            number::le_u8,
            number::le_u8,
            number::le_u8,
        ))(input)?;
        let (input, (bonus_type, checksum, compress, _flags)) = nom::sequence::tuple((
            number::le_u8,
            number::le_u8,
            number::le_u8,
            number::le_u8,
        ))(input)?;
        let (input, (datablkszsec, bonus_len)) =
            nom::sequence::tuple((number::le_u16, number::le_u16))(input)?;
        let (input, _pad) = nom::bytes::complete::take(4usize)(input)?;
        let (input, (max_block_id, used_bytes)) =
            nom::sequence::tuple((number::le_u64, number::le_u64))(input)?;
        let (input, _pad) = nom::bytes::complete::take(4 * 8usize)(input)?;
        Ok((
            input,
            Self {
                kind,
                indirect_block_shift,
                levels,
                num_block_ptr,
                bonus_type,
                checksum,
                compress,
                datablkszsec,
                bonus_len,
                max_block_id,
                used_bytes,
            },
        ))
    }
}

/// A full 512-byte dnode: header, block pointer array, bonus buffer.
#[derive(Debug, Clone)]
pub struct DNodePhys {
    pub header: DNodePhysHeader,
    pub block_pointers: Vec<BlockPtr>,
    pub bonus: Vec<u8>,
}

impl DNodePhys {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        nom::combinator::map_parser(nom::bytes::complete::take(DNODE_SIZE), |input| {
            let (input, header) = DNodePhysHeader::parse(input)?;
            let (input, block_pointers) =
                nom::multi::count(BlockPtr::parse, header.num_block_ptr as usize)(input)?;
            let (input, bonus) = nom::bytes::complete::take(header.bonus_len as usize)(input)?;
            Ok((
                input,
                Self {
                    header,
                    block_pointers,
                    bonus: bonus.to_vec(),
                },
            ))
        })(input)
    }
}

#[derive(Debug, Clone, TryFrom, PartialEq, Eq)]
#[repr(u64)]
pub enum OsType {
    None = 0,
    Meta = 1,
    Zfs = 2,
    Zvol = 3,
}

impl OsType {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        nom::combinator::map_res(number::le_u64, OsType::try_from)(input)
    }
}

/// Head of an object set block: the metadnode whose data blocks hold
/// the dnode array. The intent-log header between the metadnode and the
/// type word is skipped; log replay is out of scope for a reader.
#[derive(Debug, Clone)]
pub struct ObjsetPhys {
    pub metadnode: DNodePhys,
    pub os_type: OsType,
}

impl ObjsetPhys {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (metadnode, _zil_header, os_type)) = nom::combinator::map_parser(
            nom::bytes::complete::take(1024usize),
            nom::sequence::tuple((
                DNodePhys::parse,
                nom::bytes::complete::take(192usize),
                OsType::parse,
            )),
        )(input)?;
        Ok((
            input,
            Self { metadnode, os_type },
        ))
    }
}

/// On-disk object type tags. Part of the wire format; never renumber.
#[derive(Debug, Clone, TryFrom, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    None = 0,
    ObjectDirectory = 1,
    ObjectArray = 2,
    PackedNvlist = 3,
    PackedNvlistSize = 4,
    Bpobj = 5,
    BpobjHeader = 6,
    SpaceMapHeader = 7,
    SpaceMap = 8,
    IntentLog = 9,
    DNode = 10,
    Objset = 11,
    DslDir = 12,
    DslDirChildMap = 13,
    DslDsSnapMap = 14,
    DslProps = 15,
    DslDataset = 16,
    ZNode = 17,
    OldAcl = 18,
    PlainFileContents = 19,
    DirectoryContents = 20,
    MasterNode = 21,
    UnlinkedSet = 22,
    Zvol = 23,
    ZvolProp = 24,
    PlainOther = 25,
    Uint64Other = 26,
    ZapOther = 27,
    ErrorLog = 28,
    SpaHistory = 29,
    SpaHistoryOffsets = 30,
    PoolProps = 31,
    DslPerms = 32,
    Acl = 33,
    SysAcl = 34,
    Fuid = 35,
    FuidSize = 36,
    NextClones = 37,
    ScanQueue = 38,
    UsergroupUsed = 39,
    UsergroupQuota = 40,
    Userrefs = 41,
    DdtZap = 42,
    DdtStats = 43,
    Sa = 44,
    SaMasterNode = 45,
    SaAttrRegistration = 46,
    SaAttrLayouts = 47,
}

/// A dnode classified by its type tag, with typed bonus contents where
/// the type defines them. Unrecognized tags are rejected rather than
/// guessed at.
#[derive(Debug, Clone)]
pub enum Object {
    /// A ZPL directory: name to (object number, entry type) ZAP.
    Directory(DNodePhys),
    PlainFile(DNodePhys),
    /// Any other ZAP-backed object: object directory, master node,
    /// child maps, property lists.
    Zap(DNodePhys),
    /// System-attribute registration ZAP: attribute name to encoded id.
    AttrRegistry(DNodePhys),
    Bpobj(DNodePhys, BpobjPhys),
    ObjectArray(DNodePhys),
    PackedNvlist(DNodePhys),
    Dataset(Box<DatasetPhys>),
    DslDir(Box<DirPhys>),
    History(DNodePhys, SpaHistoryPhys),
}

impl Object {
    pub fn from_dnode(dnode: DNodePhys) -> Result<Self, ZfsError> {
        let kind = ObjectType::try_from(dnode.header.kind)
            .map_err(|_| ZfsErrorKind::UnsupportedObjectType(dnode.header.kind))?;
        Ok(match kind {
            ObjectType::DirectoryContents => Self::Directory(dnode),
            ObjectType::PlainFileContents => Self::PlainFile(dnode),
            ObjectType::ObjectDirectory
            | ObjectType::MasterNode
            | ObjectType::DslDirChildMap
            | ObjectType::DslDsSnapMap
            | ObjectType::DslProps
            | ObjectType::DslPerms
            | ObjectType::UnlinkedSet
            | ObjectType::ErrorLog
            | ObjectType::PoolProps
            | ObjectType::NextClones
            | ObjectType::SaMasterNode
            | ObjectType::SaAttrLayouts
            | ObjectType::ZapOther => Self::Zap(dnode),
            ObjectType::SaAttrRegistration => Self::AttrRegistry(dnode),
            ObjectType::Bpobj => {
                let (_, phys) = BpobjPhys::parse(&dnode.bonus)?;
                Self::Bpobj(dnode, phys)
            }
            ObjectType::ObjectArray => Self::ObjectArray(dnode),
            ObjectType::PackedNvlist => Self::PackedNvlist(dnode),
            ObjectType::DslDataset => {
                let (_, phys) = DatasetPhys::parse(&dnode.bonus)?;
                Self::Dataset(Box::new(phys))
            }
            ObjectType::DslDir => {
                let (_, phys) = DirPhys::parse(&dnode.bonus)?;
                Self::DslDir(Box::new(phys))
            }
            ObjectType::SpaHistory => {
                let (_, phys) = SpaHistoryPhys::parse(&dnode.bonus)?;
                Self::History(dnode, phys)
            }
            other => return Err(ZfsErrorKind::UnsupportedObjectType(other as u8).into()),
        })
    }
}

/// Bonus of a block-pointer object: counts first, the subobject list
/// fields only on pools new enough to have written them.
#[derive(Debug, Clone, Default)]
pub struct BpobjPhys {
    pub num_blkptrs: u64,
    pub bytes: u64,
    pub comp: u64,
    pub uncomp: u64,
    pub subobjs: u64,
    pub num_subobjs: u64,
}

impl BpobjPhys {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (num_blkptrs, bytes)) =
            nom::sequence::tuple((number::le_u64, number::le_u64))(input)?;
        let mut phys = Self {
            num_blkptrs,
            bytes,
            ..Self::default()
        };
        if input.len() < 4 * 8 {
            return Ok((input, phys));
        }
        let (input, (comp, uncomp, subobjs, num_subobjs)) = nom::sequence::tuple((
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
        ))(input)?;
        phys.comp = comp;
        phys.uncomp = uncomp;
        phys.subobjs = subobjs;
        phys.num_subobjs = num_subobjs;
        Ok((input, phys))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A 512-byte dnode image with the given type tag, data block
    /// pointers and bonus contents.
    pub(crate) fn build_dnode(
        kind: u8,
        levels: u8,
        datablkszsec: u16,
        max_block_id: u64,
        blkptrs: &[Vec<u8>],
        bonus_type: u8,
        bonus: &[u8],
    ) -> Vec<u8> {
        assert!(blkptrs.len() <= 3);
        let mut out = vec![0u8; DNODE_SIZE];
        out[0] = kind;
        out[1] = 14; // indirect block shift: 16K indirect blocks
        out[2] = levels;
        out[3] = blkptrs.len().max(1) as u8;
        out[4] = bonus_type;
        out[8..10].copy_from_slice(&datablkszsec.to_le_bytes());
        out[10..12].copy_from_slice(&(bonus.len() as u16).to_le_bytes());
        out[16..24].copy_from_slice(&max_block_id.to_le_bytes());
        for (i, bp) in blkptrs.iter().enumerate() {
            out[64 + i * 128..64 + (i + 1) * 128].copy_from_slice(bp);
        }
        let bonus_off = 64 + 128 * blkptrs.len().max(1);
        out[bonus_off..bonus_off + bonus.len()].copy_from_slice(bonus);
        out
    }

    #[test]
    fn parse_dnode() {
        let bp = crate::spa::tests::build_blkptr(
            &[(0, 0x80, 8)],
            4096,
            4096,
            crate::spa::ChecksumType::Fletcher4 as u8,
            crate::spa::CompressionType::Off as u8,
            0,
            7,
            [0; 4],
        );
        let bytes = build_dnode(19, 1, 8, 0, &[bp], 0, b"bonus!");
        let (_, dnode) = DNodePhys::parse(&bytes).unwrap();
        assert_eq!(dnode.header.kind, 19);
        assert_eq!(dnode.header.datablkszsec, 8);
        assert_eq!(dnode.block_pointers.len(), 1);
        assert_eq!(dnode.bonus, b"bonus!");
    }

    #[test]
    fn dispatch_known_types() {
        let file = build_dnode(19, 1, 8, 0, &[], 0, &[]);
        let (_, dnode) = DNodePhys::parse(&file).unwrap();
        assert!(matches!(Object::from_dnode(dnode).unwrap(), Object::PlainFile(_)));

        let zap = build_dnode(1, 1, 8, 0, &[], 0, &[]);
        let (_, dnode) = DNodePhys::parse(&zap).unwrap();
        assert!(matches!(Object::from_dnode(dnode).unwrap(), Object::Zap(_)));
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let bytes = build_dnode(200, 1, 8, 0, &[], 0, &[]);
        let (_, dnode) = DNodePhys::parse(&bytes).unwrap();
        let err = Object::from_dnode(dnode).unwrap_err();
        assert!(matches!(
            err.source,
            ZfsErrorKind::UnsupportedObjectType(200)
        ));
    }

    #[test]
    fn known_but_unreadable_type_is_rejected() {
        // Space maps are recognized tags but not something a reader
        // dereferences.
        let bytes = build_dnode(8, 1, 8, 0, &[], 0, &[]);
        let (_, dnode) = DNodePhys::parse(&bytes).unwrap();
        assert!(Object::from_dnode(dnode).is_err());
    }

    #[test]
    fn objset_phys_carries_type() {
        let meta = build_dnode(10, 1, 32, 0, &[], 0, &[]);
        let mut image = vec![0u8; 2048];
        image[..512].copy_from_slice(&meta);
        image[512 + 192..512 + 200].copy_from_slice(&2u64.to_le_bytes());
        let (_, objset) = ObjsetPhys::parse(&image).unwrap();
        assert_eq!(objset.os_type, OsType::Zfs);
        assert_eq!(objset.metadnode.header.kind, 10);
    }
}
