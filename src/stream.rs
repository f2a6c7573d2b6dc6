use std::fmt;

use bytes::Bytes;

use crate::errors::CommandError;
use crate::tokenizer::Resp;

/// A stream entry id: `(ms, seq)`, totally ordered lexicographically and
/// serialized as `"<ms>-<seq>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> StreamId {
        StreamId { ms, seq }
    }

    fn parse(text: &str) -> Result<StreamId, CommandError> {
        let (ms, seq) = text.split_once('-').ok_or(CommandError::BadStreamId)?;
        Ok(StreamId {
            ms: ms.parse().map_err(|_| CommandError::BadStreamId)?,
            seq: seq.parse().map_err(|_| CommandError::BadStreamId)?,
        })
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// The id argument of XADD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSpec {
    /// `*`: take the current wall clock, sequence 0.
    Auto,
    /// `<ms>-*`: fixed milliseconds, allocate the sequence.
    AutoSeq(u64),
    /// `<ms>-<seq>`.
    Explicit(StreamId),
}

impl IdSpec {
    pub fn parse(text: &str) -> Result<IdSpec, CommandError> {
        if text == "*" {
            return Ok(IdSpec::Auto);
        }
        if let Some(ms) = text.strip_suffix("-*") {
            let ms = ms.parse().map_err(|_| CommandError::BadStreamId)?;
            return Ok(IdSpec::AutoSeq(ms));
        }
        StreamId::parse(text).map(IdSpec::Explicit)
    }
}

impl fmt::Display for IdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdSpec::Auto => write!(f, "*"),
            IdSpec::AutoSeq(ms) => write!(f, "{ms}-*"),
            IdSpec::Explicit(id) => write!(f, "{id}"),
        }
    }
}

/// Inclusive XRANGE start bound: `-` is the smallest id, a bare `<ms>` means
/// `(ms, 0)`.
pub fn parse_range_start(text: &str) -> Result<StreamId, CommandError> {
    if text == "-" {
        return Ok(StreamId::ZERO);
    }
    if !text.contains('-') {
        let ms = text.parse().map_err(|_| CommandError::BadStreamId)?;
        return Ok(StreamId::new(ms, 0));
    }
    StreamId::parse(text)
}

/// Inclusive XRANGE end bound: `+` is the largest id, a bare `<ms>` means
/// `(ms, max)`.
pub fn parse_range_end(text: &str) -> Result<StreamId, CommandError> {
    if text == "+" {
        return Ok(StreamId::MAX);
    }
    if !text.contains('-') {
        let ms = text.parse().map_err(|_| CommandError::BadStreamId)?;
        return Ok(StreamId::new(ms, u64::MAX));
    }
    StreamId::parse(text)
}

/// The per-key start position of an XREAD. Reads are exclusive: only entries
/// with a strictly greater id qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStart {
    /// `$`: whatever the key's last id is when the command takes the lock.
    Latest,
    After(StreamId),
}

impl ReadStart {
    pub fn parse(text: &str) -> Result<ReadStart, CommandError> {
        if text == "$" {
            return Ok(ReadStart::Latest);
        }
        if !text.contains('-') {
            let ms = text.parse().map_err(|_| CommandError::BadStreamId)?;
            return Ok(ReadStart::After(StreamId::new(ms, 0)));
        }
        StreamId::parse(text).map(ReadStart::After)
    }
}

impl fmt::Display for ReadStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadStart::Latest => write!(f, "$"),
            ReadStart::After(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: StreamId,
    /// Field insertion order is preserved.
    pub fields: Vec<(Bytes, Bytes)>,
}

impl StreamEntry {
    /// `[id, [field, value, field, value, ...]]`
    pub fn to_resp(&self) -> Resp {
        let mut flat = Vec::with_capacity(self.fields.len() * 2);
        for (field, value) in &self.fields {
            flat.push(Resp::BulkString(field.clone()));
            flat.push(Resp::BulkString(value.clone()));
        }
        Resp::Array(vec![
            Resp::bulk(self.id.to_string()),
            Resp::Array(flat),
        ])
    }
}

/// An append-only sequence of entries with strictly increasing ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stream {
    entries: Vec<StreamEntry>,
}

impl Stream {
    pub fn last_id(&self) -> Option<StreamId> {
        self.entries.last().map(|entry| entry.id)
    }

    /// Appends an entry, allocating the id per the requested form, and
    /// returns the effective id.
    pub fn add(
        &mut self,
        spec: IdSpec,
        fields: Vec<(Bytes, Bytes)>,
        now_ms: u64,
    ) -> Result<StreamId, CommandError> {
        let id = self.allocate(spec, now_ms)?;
        self.entries.push(StreamEntry { id, fields });
        Ok(id)
    }

    fn allocate(&self, spec: IdSpec, now_ms: u64) -> Result<StreamId, CommandError> {
        let last = self.last_id();
        match spec {
            IdSpec::Auto => Ok(match last {
                Some(last) if last.ms >= now_ms => StreamId::new(last.ms, last.seq + 1),
                _ => StreamId::new(now_ms, 0),
            }),
            IdSpec::AutoSeq(ms) => {
                let seq = match last {
                    Some(last) if ms < last.ms => return Err(CommandError::StreamIdTooSmall),
                    Some(last) if ms == last.ms => last.seq + 1,
                    // 0-0 is not a valid id, so an empty stream starts 0-* at 0-1
                    _ if ms == 0 => 1,
                    _ => 0,
                };
                Ok(StreamId::new(ms, seq))
            }
            IdSpec::Explicit(id) => {
                if id == StreamId::ZERO {
                    return Err(CommandError::StreamIdZero);
                }
                if last.is_some_and(|last| id <= last) {
                    return Err(CommandError::StreamIdTooSmall);
                }
                Ok(id)
            }
        }
    }

    /// Entries with ids in `[start, end]`.
    pub fn range(&self, start: StreamId, end: StreamId) -> Vec<StreamEntry> {
        let from = self.entries.partition_point(|entry| entry.id < start);
        self.entries[from..]
            .iter()
            .take_while(|entry| entry.id <= end)
            .cloned()
            .collect()
    }

    /// Entries with ids strictly greater than `after`.
    pub fn entries_after(&self, after: StreamId) -> Vec<StreamEntry> {
        let from = self.entries.partition_point(|entry| entry.id <= after);
        self.entries[from..].to_vec()
    }
}

/// XRANGE reply: an array of `[id, flat field/value array]`.
pub fn range_reply(entries: &[StreamEntry]) -> Resp {
    Resp::Array(entries.iter().map(StreamEntry::to_resp).collect())
}

/// XREAD reply: an array of `[key, range reply]` per key with data, or a nil
/// array when nothing qualified.
pub fn xread_reply(hits: &[(Bytes, Vec<StreamEntry>)]) -> Resp {
    if hits.is_empty() {
        return Resp::NullArray;
    }
    Resp::Array(
        hits.iter()
            .map(|(key, entries)| {
                Resp::Array(vec![Resp::BulkString(key.clone()), range_reply(entries)])
            })
            .collect(),
    )
}
