//!
//! XDR-encoded nvlist decoding, used by the label configuration, packed
//! nvlist objects and the pool history log
//!
use std::convert::TryFrom;

use nom::{number::complete as number, IResult};

use enum_repr_derive::TryFrom;

use crate::{ZfsError, ZfsErrorKind};

pub const NV_ENCODE_XDR: u8 = 1;

/// nvpair data type tags. Part of the wire format; never renumber.
#[repr(i32)]
#[derive(Debug, Clone, Copy, TryFrom, Eq, PartialEq)]
pub enum NvDataType {
    Boolean = 1,
    Byte = 2,
    Int16 = 3,
    Uint16 = 4,
    Int32 = 5,
    Uint32 = 6,
    Int64 = 7,
    Uint64 = 8,
    Str = 9,
    ByteArray = 10,
    Int16Array = 11,
    Uint16Array = 12,
    Int32Array = 13,
    Uint32Array = 14,
    Int64Array = 15,
    Uint64Array = 16,
    StrArray = 17,
    HrTime = 18,
    NvList = 19,
    NvListArray = 20,
    BooleanValue = 21,
    Int8 = 22,
    Uint8 = 23,
    BooleanArray = 24,
    Int8Array = 25,
    Uint8Array = 26,
    Double = 27,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NvValue {
    Boolean,
    BooleanValue(bool),
    Byte(u8),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Str(String),
    Uint64Array(Vec<u64>),
    StrArray(Vec<String>),
    List(NvList),
    ListArray(Vec<NvList>),
    /// A type tag this implementation does not interpret; the pair was
    /// skipped over using its encoded size.
    Unknown(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NvPair {
    pub name: String,
    pub value: NvValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NvList {
    pub version: i32,
    pub flags: u32,
    pub pairs: Vec<NvPair>,
}

/// XDR string: big-endian length, bytes, zero padding to 4-byte
/// alignment.
fn xdr_string(input: &[u8]) -> IResult<&[u8], String> {
    let (input, len) = number::be_u32(input)?;
    let (input, bytes) = nom::bytes::complete::take(len as usize)(input)?;
    let pad = (4 - (len as usize % 4)) % 4;
    let (input, _pad) = nom::bytes::complete::take(pad)(input)?;
    match String::from_utf8(bytes.to_vec()) {
        Ok(s) => Ok((input, s)),
        Err(_) => Err(nom::Err::Error((input, nom::error::ErrorKind::MapRes))),
    }
}

fn parse_value<'a>(input: &'a [u8], kind: i32, nelem: usize) -> IResult<&'a [u8], NvValue> {
    let kind = match NvDataType::try_from(kind) {
        Ok(k) => k,
        Err(_) => return Ok((input, NvValue::Unknown(kind))),
    };
    match kind {
        NvDataType::Boolean => Ok((input, NvValue::Boolean)),
        NvDataType::BooleanValue => {
            let (input, v) = number::be_u32(input)?;
            Ok((input, NvValue::BooleanValue(v != 0)))
        }
        NvDataType::Byte => {
            let (input, v) = number::be_u32(input)?;
            Ok((input, NvValue::Byte(v as u8)))
        }
        NvDataType::Int32 => {
            let (input, v) = number::be_i32(input)?;
            Ok((input, NvValue::Int32(v)))
        }
        NvDataType::Uint32 => {
            let (input, v) = number::be_u32(input)?;
            Ok((input, NvValue::Uint32(v)))
        }
        NvDataType::Int64 => {
            let (input, v) = number::be_i64(input)?;
            Ok((input, NvValue::Int64(v)))
        }
        NvDataType::Uint64 => {
            let (input, v) = number::be_u64(input)?;
            Ok((input, NvValue::Uint64(v)))
        }
        NvDataType::Str => {
            let (input, s) = xdr_string(input)?;
            Ok((input, NvValue::Str(s)))
        }
        NvDataType::Uint64Array => {
            let (input, v) = nom::multi::count(number::be_u64, nelem)(input)?;
            Ok((input, NvValue::Uint64Array(v)))
        }
        NvDataType::StrArray => {
            let (input, v) = nom::multi::count(xdr_string, nelem)(input)?;
            Ok((input, NvValue::StrArray(v)))
        }
        NvDataType::NvList => {
            let (input, list) = NvList::parse(input)?;
            Ok((input, NvValue::List(list)))
        }
        NvDataType::NvListArray => {
            let (input, v) = nom::multi::count(NvList::parse, nelem)(input)?;
            Ok((input, NvValue::ListArray(v)))
        }
        other => Ok((input, NvValue::Unknown(other as i32))),
    }
}

impl NvList {
    /// Parse an embedded nvlist: version, flags, then pairs until the
    /// zero-sized terminator pair.
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (mut input, (version, flags)) =
            nom::sequence::tuple((number::be_i32, number::be_u32))(input)?;
        let mut pairs = Vec::new();
        loop {
            let (rest, (encoded_size, decoded_size)) =
                nom::sequence::tuple((number::be_i32, number::be_i32))(input)?;
            if encoded_size == 0 && decoded_size == 0 {
                input = rest;
                break;
            }
            if encoded_size < 8 {
                return Err(nom::Err::Error((input, nom::error::ErrorKind::Verify)));
            }
            // The encoded size covers the whole pair including the two
            // size words, which bounds the body and lets unknown types be
            // skipped.
            let (rest, body) = nom::bytes::complete::take(encoded_size as usize - 8)(rest)?;
            let (body, name) = xdr_string(body)?;
            let (body, (kind, nelem)) =
                nom::sequence::tuple((number::be_i32, number::be_i32))(body)?;
            let (_body, value) = parse_value(body, kind, nelem as usize)?;
            pairs.push(NvPair { name, value });
            input = rest;
        }
        Ok((
            input,
            Self {
                version,
                flags,
                pairs,
            },
        ))
    }

    /// Unpack a packed nvlist buffer: a 4-byte encoding header followed
    /// by the list itself.
    pub fn unpack(input: &[u8]) -> Result<Self, ZfsError> {
        let (input, (encoding, _endian, _reserved)) = nom::sequence::tuple((
            number::le_u8,
            number::le_u8,
            nom::bytes::complete::take(2usize),
        ))(input)?;
        if encoding != NV_ENCODE_XDR {
            return Err(ZfsErrorKind::Invalid.into());
        }
        let (_input, list) = Self::parse(input)?;
        Ok(list)
    }

    pub fn get(&self, name: &str) -> Option<&NvValue> {
        self.pairs.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        match self.get(name) {
            Some(NvValue::Uint64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(NvValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_list(&self, name: &str) -> Option<&NvList> {
        match self.get(name) {
            Some(NvValue::List(l)) => Some(l),
            _ => None,
        }
    }

    pub fn get_list_array(&self, name: &str) -> Option<&[NvList]> {
        match self.get(name) {
            Some(NvValue::ListArray(l)) => Some(l),
            _ => None,
        }
    }
}

/// XDR nvlist encoding, only for synthesizing test images and fixtures.
#[cfg(test)]
pub(crate) mod encode {
    fn xdr_str_bytes(s: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(s.len() as u32).to_be_bytes());
        out.extend_from_slice(s.as_bytes());
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    fn pair(name: &str, kind: i32, nelem: i32, value: &[u8]) -> Vec<u8> {
        let mut body = xdr_str_bytes(name);
        body.extend_from_slice(&kind.to_be_bytes());
        body.extend_from_slice(&nelem.to_be_bytes());
        body.extend_from_slice(value);
        let mut out = Vec::new();
        out.extend_from_slice(&((body.len() + 8) as i32).to_be_bytes());
        out.extend_from_slice(&((body.len() + 8) as i32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    pub(crate) fn pair_u64(name: &str, v: u64) -> Vec<u8> {
        pair(name, super::NvDataType::Uint64 as i32, 1, &v.to_be_bytes())
    }

    pub(crate) fn pair_str(name: &str, v: &str) -> Vec<u8> {
        pair(name, super::NvDataType::Str as i32, 1, &xdr_str_bytes(v))
    }

    pub(crate) fn pair_list(name: &str, inner: &[u8]) -> Vec<u8> {
        pair(name, super::NvDataType::NvList as i32, 1, inner)
    }

    pub(crate) fn pair_list_array(name: &str, inner: &[Vec<u8>]) -> Vec<u8> {
        let mut value = Vec::new();
        for item in inner {
            value.extend_from_slice(item);
        }
        pair(
            name,
            super::NvDataType::NvListArray as i32,
            inner.len() as i32,
            &value,
        )
    }

    /// An embedded nvlist: version, flags, pairs, terminator.
    pub(crate) fn list(pairs: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0i32.to_be_bytes());
        out.extend_from_slice(&1u32.to_be_bytes());
        for p in pairs {
            out.extend_from_slice(p);
        }
        out.extend_from_slice(&[0u8; 8]);
        out
    }

    /// A packed nvlist: encoding header plus the embedded list.
    pub(crate) fn packed(list_bytes: &[u8]) -> Vec<u8> {
        let mut out = vec![super::NV_ENCODE_XDR, 1, 0, 0];
        out.extend_from_slice(list_bytes);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::encode;
    use super::*;

    #[test]
    fn unpack_flat_list() {
        let packed = encode::packed(&encode::list(&[
            encode::pair_str("name", "tank"),
            encode::pair_u64("txg", 1234),
        ]));
        let list = NvList::unpack(&packed).unwrap();
        assert_eq!(list.get_str("name"), Some("tank"));
        assert_eq!(list.get_u64("txg"), Some(1234));
        assert_eq!(list.get_u64("missing"), None);
    }

    #[test]
    fn unpack_nested_lists() {
        let child = encode::list(&[encode::pair_u64("id", 0), encode::pair_str("type", "disk")]);
        let tree = encode::list(&[
            encode::pair_str("type", "raidz"),
            encode::pair_u64("nparity", 1),
            encode::pair_list_array("children", &[child.clone(), child]),
        ]);
        let packed = encode::packed(&encode::list(&[encode::pair_list("vdev_tree", &tree)]));
        let list = NvList::unpack(&packed).unwrap();
        let tree = list.get_list("vdev_tree").unwrap();
        assert_eq!(tree.get_str("type"), Some("raidz"));
        let children = tree.get_list_array("children").unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[1].get_str("type"), Some("disk"));
    }

    #[test]
    fn unknown_pair_type_is_skipped() {
        // A pair with type tag 99 must not derail the pairs after it.
        let mut odd = Vec::new();
        {
            let mut body = Vec::new();
            body.extend_from_slice(&3u32.to_be_bytes());
            body.extend_from_slice(b"odd\0"); // padded to 4-byte alignment
            body.extend_from_slice(&99i32.to_be_bytes());
            body.extend_from_slice(&1i32.to_be_bytes());
            body.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
            odd.extend_from_slice(&((body.len() + 8) as i32).to_be_bytes());
            odd.extend_from_slice(&((body.len() + 8) as i32).to_be_bytes());
            odd.extend_from_slice(&body);
        }
        let packed = encode::packed(&encode::list(&[odd, encode::pair_u64("after", 7)]));
        let list = NvList::unpack(&packed).unwrap();
        assert_eq!(list.get_u64("after"), Some(7));
        match list.get("odd") {
            Some(NvValue::Unknown(99)) => {}
            other => panic!("expected unknown pair, got {:?}", other),
        }
    }

    #[test]
    fn truncated_list_is_a_parse_error() {
        let packed = encode::packed(&encode::list(&[encode::pair_u64("txg", 1)]));
        assert!(NvList::unpack(&packed[..packed.len() - 6]).is_err());
    }

    #[test]
    fn non_xdr_encoding_rejected() {
        let mut packed = encode::packed(&encode::list(&[]));
        packed[0] = 0; // native encoding
        assert!(NvList::unpack(&packed).is_err());
    }
}
