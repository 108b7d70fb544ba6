//!
//! Dataset and Snapshot Layer structures, parsed out of dnode bonus
//! buffers in the meta object set
//!
use nom::{number::complete as number, IResult};

use crate::spa::BlockPtr;

fn le_u64_4(input: &[u8]) -> IResult<&[u8], [u64; 4]> {
    let (input, (a, b, c, d)) = nom::sequence::tuple((
        number::le_u64,
        number::le_u64,
        number::le_u64,
        number::le_u64,
    ))(input)?;
    Ok((input, [a, b, c, d]))
}

/// Bonus of a DSL dataset object. Its block pointer is the root of the
/// dataset's object set.
#[derive(Debug, Clone)]
pub struct DatasetPhys {
    pub dir_obj: u64,
    pub prev_snap_obj: u64,
    pub prev_snap_txg: u64,
    pub next_snap_obj: u64,
    /// ZAP mapping snapshot names to dataset objects.
    pub snapnames_zapobj: u64,
    pub num_children: u64,
    pub creation_time: u64,
    pub creation_txg: u64,
    pub deadlist_obj: u64,
    pub referenced_bytes: u64,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
    pub unique_bytes: u64,
    pub fsid_guid: u64,
    pub guid: u64,
    pub flags: u64,
    /// Root of the object set.
    pub bp: BlockPtr,
    pub next_clones_obj: u64,
    pub props_obj: u64,
    pub userrefs_obj: u64,
}

impl DatasetPhys {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        nom::combinator::map_parser(nom::bytes::complete::take(320usize), |input| {
            let (input, [dir_obj, prev_snap_obj, prev_snap_txg, next_snap_obj]) = le_u64_4(input)?;
            let (input, [snapnames_zapobj, num_children, creation_time, creation_txg]) =
                le_u64_4(input)?;
            let (input, [deadlist_obj, referenced_bytes, compressed_bytes, uncompressed_bytes]) =
                le_u64_4(input)?;
            let (input, [unique_bytes, fsid_guid, guid, flags]) = le_u64_4(input)?;
            let (input, bp) = BlockPtr::parse(input)?;
            let (input, (next_clones_obj, props_obj, userrefs_obj)) =
                nom::sequence::tuple((number::le_u64, number::le_u64, number::le_u64))(input)?;
            Ok((
                input,
                Self {
                    dir_obj,
                    prev_snap_obj,
                    prev_snap_txg,
                    next_snap_obj,
                    snapnames_zapobj,
                    num_children,
                    creation_time,
                    creation_txg,
                    deadlist_obj,
                    referenced_bytes,
                    compressed_bytes,
                    uncompressed_bytes,
                    unique_bytes,
                    fsid_guid,
                    guid,
                    flags,
                    bp,
                    next_clones_obj,
                    props_obj,
                    userrefs_obj,
                },
            ))
        })(input)
    }
}

/// Bonus of a DSL directory object: the naming node of the dataset
/// hierarchy. Children live in a ZAP keyed by name; the head dataset
/// holds the live data.
#[derive(Debug, Clone)]
pub struct DirPhys {
    pub creation_time: u64,
    pub head_dataset_obj: u64,
    pub parent_obj: u64,
    pub origin_obj: u64,
    /// ZAP mapping child directory names to DSL directory objects.
    pub child_dir_zapobj: u64,
    pub used_bytes: u64,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
    pub quota: u64,
    pub reserved: u64,
    pub props_zapobj: u64,
    pub deleg_zapobj: u64,
    pub flags: u64,
    pub used_breakdown: [u64; 5],
    pub clones: u64,
}

impl DirPhys {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        nom::combinator::map_parser(nom::bytes::complete::take(256usize), |input| {
            let (input, [creation_time, head_dataset_obj, parent_obj, origin_obj]) =
                le_u64_4(input)?;
            let (input, [child_dir_zapobj, used_bytes, compressed_bytes, uncompressed_bytes]) =
                le_u64_4(input)?;
            let (input, [quota, reserved, props_zapobj, deleg_zapobj]) = le_u64_4(input)?;
            let (input, flags) = number::le_u64(input)?;
            let (input, [b0, b1, b2, b3]) = le_u64_4(input)?;
            let (input, (b4, clones)) =
                nom::sequence::tuple((number::le_u64, number::le_u64))(input)?;
            Ok((
                input,
                Self {
                    creation_time,
                    head_dataset_obj,
                    parent_obj,
                    origin_obj,
                    child_dir_zapobj,
                    used_bytes,
                    compressed_bytes,
                    uncompressed_bytes,
                    quota,
                    reserved,
                    props_zapobj,
                    deleg_zapobj,
                    flags,
                    used_breakdown: [b0, b1, b2, b3, b4],
                    clones,
                },
            ))
        })(input)
    }
}
