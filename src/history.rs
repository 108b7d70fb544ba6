//!
//! Pool history log: a ring of length-prefixed packed nvlists kept in
//! the meta object set
//!
use std::convert::TryInto;

use nom::{number::complete as number, IResult};

use crate::nv::NvList;
use crate::{ZfsError, ZfsErrorKind};

/// Bonus of the history object: the write cursor state the kernel keeps
/// while appending records.
#[derive(Debug, Clone)]
pub struct SpaHistoryPhys {
    /// Bytes occupied by the immutable pool-creation records at the
    /// front of the log.
    pub pool_create_len: u64,
    /// Size of the ring; offsets wrap past it.
    pub phys_max_off: u64,
    pub bof: u64,
    pub eof: u64,
    pub records_lost: u64,
}

impl SpaHistoryPhys {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (pool_create_len, phys_max_off, bof, eof, records_lost)) =
            nom::sequence::tuple((
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
            ))(input)?;
        Ok((
            input,
            Self {
                pool_create_len,
                phys_max_off,
                bof,
                eof,
                records_lost,
            },
        ))
    }

    /// Flatten the live part of the history ring into one contiguous
    /// buffer: the immutable pool-creation records at the front, then
    /// the record area from `bof` to `eof`, wrapping at `phys_max_off`
    /// back to the end of the creation records.
    pub fn live_records(&self, data: &[u8]) -> Vec<u8> {
        let clamp = |v: u64| (v as usize).min(data.len());
        let create_end = clamp(self.pool_create_len);
        let mut out = data[..create_end].to_vec();
        let bof = clamp(self.bof).max(create_end);
        let eof = clamp(self.eof);
        if eof >= bof {
            out.extend_from_slice(&data[bof..eof]);
        } else {
            let max = clamp(self.phys_max_off).max(bof);
            out.extend_from_slice(&data[bof..max]);
            out.extend_from_slice(&data[create_end..eof.max(create_end)]);
        }
        out
    }
}

/// One decoded history record with the log offset it was read from, so
/// iteration can be restarted after it.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub offset: u64,
    pub record: NvList,
}

/// Iterator over history records in a byte buffer. Each record is a
/// native-endian u64 length followed by a packed nvlist. A record that
/// fails to decode is reported as an error carrying its offset and then
/// skipped, so one bad record does not end the walk.
pub struct HistoryIter<'a> {
    data: &'a [u8],
    offset: u64,
}

impl<'a> HistoryIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::from_offset(data, 0)
    }

    /// Resume after a previously returned record's offset plus its
    /// length, or anywhere a record boundary is known to lie.
    pub fn from_offset(data: &'a [u8], offset: u64) -> Self {
        Self { data, offset }
    }
}

impl<'a> Iterator for HistoryIter<'a> {
    type Item = Result<HistoryRecord, ZfsError>;

    fn next(&mut self) -> Option<Self::Item> {
        let at = self.offset as usize;
        if at + 8 > self.data.len() {
            return None;
        }
        let length = u64::from_le_bytes(self.data[at..at + 8].try_into().ok()?) as usize;
        if length == 0 {
            return None;
        }
        let body_at = at + 8;
        if body_at + length > self.data.len() {
            // truncated trailing record
            self.offset = self.data.len() as u64;
            return Some(Err(ZfsErrorKind::CorruptHistoryRecord(at as u64).into()));
        }
        let record_offset = self.offset;
        self.offset = (body_at + length) as u64;
        match NvList::unpack(&self.data[body_at..body_at + length]) {
            Ok(record) => Some(Ok(HistoryRecord {
                offset: record_offset,
                record,
            })),
            Err(e) => {
                log::warn!("corrupt history record at {}: {}", record_offset, e);
                Some(Err(ZfsErrorKind::CorruptHistoryRecord(record_offset).into()))
            }
        }
    }
}
