use std::fmt::Display;

use crate::store::StoreError;

/// Stream entry ID: `(milliseconds, sequence)`, totally ordered
/// lexicographically. Derived `Ord` on the field order gives exactly that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordId {
    pub ms: u64,
    pub seq: u64,
}

impl RecordId {
    pub const MIN: Self = Self { ms: 0, seq: 0 };
    pub const MAX: Self = Self { ms: u64::MAX, seq: u64::MAX };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Parse `ms[-seq]` ID text. An omitted sequence stays `None` so each
    /// caller can default it for its own end of a range; it is never
    /// conflated with an explicit zero.
    pub fn parse_parts(text: &str) -> Option<(u64, Option<u64>)> {
        match text.split_once('-') {
            None => Some((text.parse().ok()?, None)),
            Some((ms, seq)) => Some((ms.parse().ok()?, Some(seq.parse().ok()?))),
        }
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// How XADD names the new entry: `*`, `ms-*`, or an explicit `ms-seq`.
/// An omitted sequence is `None`, never a zero sentinel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntryIdSpec {
    Auto,
    Partial(u64),
    Explicit(RecordId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub id: RecordId,
    pub fields: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Append-only record log with strictly increasing IDs.
#[derive(Debug, Default)]
pub struct Stream {
    records: Vec<StreamRecord>,
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_id(&self) -> RecordId {
        self.records.last().map_or(RecordId::MIN, |record| record.id)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Resolve an ID spec against the current tail.
    ///
    /// `*` takes `max(now, last_ms)` and bumps the sequence on a millisecond
    /// collision. `ms-*` bumps on a collision, starts at 1 for `0-*` on an
    /// empty stream, else starts at 0. Both collapse to the same rule once an
    /// empty stream is treated as having last ID 0-0.
    fn resolve(&self, spec: &EntryIdSpec, now_ms: u64) -> RecordId {
        let last = self.last_id();
        match spec {
            EntryIdSpec::Auto => {
                let ms = now_ms.max(last.ms);
                let seq = if ms == last.ms && !self.is_empty() { last.seq + 1 } else { 0 };
                RecordId::new(ms, seq)
            }
            EntryIdSpec::Partial(ms) => {
                let seq = if *ms == last.ms { last.seq + 1 } else { 0 };
                RecordId::new(*ms, seq)
            }
            EntryIdSpec::Explicit(id) => *id,
        }
    }

    /// Append a new entry, autogenerating ID parts as requested.
    pub fn add(
        &mut self,
        spec: &EntryIdSpec,
        fields: Vec<(Vec<u8>, Vec<u8>)>,
        now_ms: u64,
    ) -> Result<RecordId, StoreError> {
        let id = self.resolve(spec, now_ms);
        if id == RecordId::MIN {
            return Err(StoreError::IdZero);
        }
        if !self.is_empty() && id <= self.last_id() {
            return Err(StoreError::IdTooSmall);
        }
        self.records.push(StreamRecord { id, fields });
        Ok(id)
    }

    /// Entries with `from <= id <= to`.
    pub fn range(&self, from: RecordId, to: RecordId) -> impl Iterator<Item = &StreamRecord> {
        self.records.iter().filter(move |record| record.id >= from && record.id <= to)
    }

    /// Entries strictly after `cursor` (the XREAD read model).
    pub fn after(&self, cursor: RecordId) -> impl Iterator<Item = &StreamRecord> {
        self.records.iter().filter(move |record| record.id > cursor)
    }
}
