use std::collections::hash_map;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::stream::{EntryIdSpec, RecordId, Stream, StreamRecord};

/// Store-level failures. `Display` is the exact wire message, code prefix
/// included.
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("ERR value is not an integer or out of range")]
    NotInteger,
    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    IdTooSmall,
    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    IdZero,
}

/// The typed value held at a key. The tag is authoritative; every operation
/// matches on it explicitly.
pub enum Entry {
    String {
        value: Vec<u8>,
        expires_at: Option<SystemTime>,
    },
    List(VecDeque<Vec<u8>>),
    Stream(Stream),
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

/// The keyspace. Expired strings are removed on first observation; lists and
/// streams are removed as soon as they become empty, so a present key always
/// holds at least one element.
#[derive(Default)]
pub struct KVStore(HashMap<Vec<u8>, Entry>);

impl KVStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn expire_if_due(&mut self, key: &[u8]) {
        let due = matches!(
            self.0.get(key),
            Some(Entry::String { expires_at: Some(at), .. }) if *at < SystemTime::now()
        );
        if due {
            self.0.remove(key);
        }
    }

    /// `None` for a missing, expired, or non-string key.
    pub fn get_string(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.expire_if_due(key);
        match self.0.get(key) {
            Some(Entry::String { value, .. }) => Some(value.clone()),
            _ => None,
        }
    }

    /// Replaces any existing entry of any type.
    pub fn set_string(&mut self, key: &[u8], value: Vec<u8>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| SystemTime::now() + ttl);
        self.0.insert(key.to_vec(), Entry::String { value, expires_at });
    }

    /// Missing keys start from 0. The stored bytes must be a plain signed
    /// decimal; a leading `+` or any other noise is rejected. An existing TTL
    /// survives the rewrite.
    pub fn incr(&mut self, key: &[u8]) -> Result<i64, StoreError> {
        self.expire_if_due(key);
        if !self.0.contains_key(key) {
            self.0.insert(key.to_vec(), Entry::String { value: b"1".to_vec(), expires_at: None });
            return Ok(1);
        }
        match self.0.get_mut(key) {
            Some(Entry::String { value, .. }) => {
                let text = std::str::from_utf8(value).map_err(|_| StoreError::NotInteger)?;
                if text.starts_with('+') {
                    return Err(StoreError::NotInteger);
                }
                let number: i64 = text.parse().map_err(|_| StoreError::NotInteger)?;
                let number = number.checked_add(1).ok_or(StoreError::NotInteger)?;
                *value = number.to_string().into_bytes();
                Ok(number)
            }
            _ => Err(StoreError::WrongType),
        }
    }

    fn list_mut(&mut self, key: &[u8]) -> Result<&mut VecDeque<Vec<u8>>, StoreError> {
        match self.0.entry(key.to_vec()).or_insert_with(|| Entry::List(VecDeque::new())) {
            Entry::List(list) => Ok(list),
            _ => Err(StoreError::WrongType),
        }
    }

    pub fn rpush(&mut self, key: &[u8], values: Vec<Vec<u8>>) -> Result<usize, StoreError> {
        let list = self.list_mut(key)?;
        list.extend(values);
        Ok(list.len())
    }

    /// Each successive value ends up further left.
    pub fn lpush(&mut self, key: &[u8], values: Vec<Vec<u8>>) -> Result<usize, StoreError> {
        let list = self.list_mut(key)?;
        for value in values {
            list.push_front(value);
        }
        Ok(list.len())
    }

    /// Pop up to `count` elements from the front. The key is dropped once the
    /// list runs empty.
    pub fn lpop(&mut self, key: &[u8], count: usize) -> Result<Vec<Vec<u8>>, StoreError> {
        let popped: Vec<Vec<u8>> = match self.0.get_mut(key) {
            None => return Ok(vec![]),
            Some(Entry::List(list)) => {
                let take = count.min(list.len());
                list.drain(..take).collect()
            }
            Some(_) => return Err(StoreError::WrongType),
        };
        let drained = matches!(self.0.get(key), Some(Entry::List(list)) if list.is_empty());
        if drained {
            self.0.remove(key);
        }
        Ok(popped)
    }

    /// Negative indices count from the end; the normalized range is
    /// `[max(start, 0), min(stop + 1, len))`.
    pub fn lrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Vec<u8>>, StoreError> {
        match self.0.get(key) {
            None => Ok(vec![]),
            Some(Entry::List(list)) => {
                let len = list.len() as i64;
                let from = if start >= 0 { start } else { (len + start).max(0) };
                let to = if stop >= 0 { stop + 1 } else { (len + stop + 1).max(0) };
                let to = to.min(len);
                if from >= to {
                    return Ok(vec![]);
                }
                Ok(list.iter().skip(from as usize).take((to - from) as usize).cloned().collect())
            }
            Some(_) => Err(StoreError::WrongType),
        }
    }

    pub fn llen(&self, key: &[u8]) -> Result<usize, StoreError> {
        match self.0.get(key) {
            None => Ok(0),
            Some(Entry::List(list)) => Ok(list.len()),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    pub fn type_of(&mut self, key: &[u8]) -> &'static str {
        self.expire_if_due(key);
        match self.0.get(key) {
            None => "none",
            Some(Entry::String { .. }) => "string",
            Some(Entry::List(_)) => "list",
            Some(Entry::Stream(_)) => "stream",
        }
    }

    /// Append to a stream, creating it on first use. A rejected ID on a fresh
    /// key leaves no empty stream behind.
    pub fn xadd(
        &mut self,
        key: &[u8],
        spec: &EntryIdSpec,
        fields: Vec<(Vec<u8>, Vec<u8>)>,
        now_ms: u64,
    ) -> Result<RecordId, StoreError> {
        match self.0.entry(key.to_vec()) {
            hash_map::Entry::Vacant(vacant) => {
                let mut stream = Stream::new();
                let id = stream.add(spec, fields, now_ms)?;
                vacant.insert(Entry::Stream(stream));
                Ok(id)
            }
            hash_map::Entry::Occupied(mut occupied) => match occupied.get_mut() {
                Entry::Stream(stream) => stream.add(spec, fields, now_ms),
                _ => Err(StoreError::WrongType),
            },
        }
    }

    fn stream(&self, key: &[u8]) -> Result<Option<&Stream>, StoreError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(Entry::Stream(stream)) => Ok(Some(stream)),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// Inclusive range; a missing stream reads as empty.
    pub fn xrange(
        &self,
        key: &[u8],
        from: RecordId,
        to: RecordId,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        Ok(self
            .stream(key)?
            .map(|stream| stream.range(from, to).cloned().collect())
            .unwrap_or_default())
    }

    /// Entries strictly after `cursor`; a missing stream reads as empty.
    pub fn xread_after(
        &self,
        key: &[u8],
        cursor: RecordId,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        Ok(self
            .stream(key)?
            .map(|stream| stream.after(cursor).cloned().collect())
            .unwrap_or_default())
    }

    /// Current tail ID, 0-0 when the stream does not exist (resolves `$`).
    pub fn last_stream_id(&self, key: &[u8]) -> Result<RecordId, StoreError> {
        Ok(self.stream(key)?.map_or(RecordId::MIN, Stream::last_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_and_replace() {
        let mut store = KVStore::new();
        assert_eq!(store.get_string(b"foo"), None);
        store.set_string(b"foo", b"bar".to_vec(), None);
        assert_eq!(store.get_string(b"foo"), Some(b"bar".to_vec()));
        store.set_string(b"foo", b"baz".to_vec(), None);
        assert_eq!(store.get_string(b"foo"), Some(b"baz".to_vec()));
    }

    #[test]
    fn set_replaces_an_entry_of_another_type() {
        let mut store = KVStore::new();
        store.rpush(b"k", vec![b"a".to_vec()]).unwrap();
        store.set_string(b"k", b"v".to_vec(), None);
        assert_eq!(store.type_of(b"k"), "string");
    }

    #[test]
    fn expired_string_reads_as_missing_and_is_removed() {
        let mut store = KVStore::new();
        store.set_string(b"k", b"v".to_vec(), Some(Duration::from_millis(20)));
        assert_eq!(store.get_string(b"k"), Some(b"v".to_vec()));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(store.get_string(b"k"), None);
        assert_eq!(store.type_of(b"k"), "none");
    }

    #[test]
    fn get_on_wrong_type_is_none() {
        let mut store = KVStore::new();
        store.rpush(b"l", vec![b"a".to_vec()]).unwrap();
        assert_eq!(store.get_string(b"l"), None);
        assert_eq!(store.type_of(b"l"), "list");
    }

    #[test]
    fn incr_initializes_counts_and_rejects_garbage() {
        let mut store = KVStore::new();
        assert_eq!(store.incr(b"n"), Ok(1));
        assert_eq!(store.incr(b"n"), Ok(2));
        assert_eq!(store.get_string(b"n"), Some(b"2".to_vec()));

        store.set_string(b"s", b"41".to_vec(), None);
        assert_eq!(store.incr(b"s"), Ok(42));

        store.set_string(b"bad", b"abc".to_vec(), None);
        assert_eq!(store.incr(b"bad"), Err(StoreError::NotInteger));
        store.set_string(b"plus", b"+5".to_vec(), None);
        assert_eq!(store.incr(b"plus"), Err(StoreError::NotInteger));
        store.set_string(b"max", i64::MAX.to_string().into_bytes(), None);
        assert_eq!(store.incr(b"max"), Err(StoreError::NotInteger));

        store.rpush(b"l", vec![b"a".to_vec()]).unwrap();
        assert_eq!(store.incr(b"l"), Err(StoreError::WrongType));
    }

    #[test]
    fn incr_preserves_ttl() {
        let mut store = KVStore::new();
        store.set_string(b"n", b"1".to_vec(), Some(Duration::from_secs(60)));
        assert_eq!(store.incr(b"n"), Ok(2));
        match store.0.get(b"n".as_slice()) {
            Some(Entry::String { expires_at, .. }) => assert!(expires_at.is_some()),
            _ => panic!("expected string entry"),
        }
    }

    #[test]
    fn push_order_and_llen() {
        let mut store = KVStore::new();
        assert_eq!(store.rpush(b"l", vec![b"a".to_vec(), b"b".to_vec()]), Ok(2));
        assert_eq!(store.lpush(b"l", vec![b"c".to_vec(), b"d".to_vec()]), Ok(4));
        let range = store.lrange(b"l", 0, -1).unwrap();
        assert_eq!(range, vec![b"d".to_vec(), b"c".to_vec(), b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(store.llen(b"l"), Ok(4));
        assert_eq!(store.llen(b"missing"), Ok(0));
    }

    #[test]
    fn lrange_normalizes_negative_and_out_of_range_indices() {
        let mut store = KVStore::new();
        store.rpush(b"l", vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]).unwrap();
        assert_eq!(store.lrange(b"l", -2, -1).unwrap(), vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(store.lrange(b"l", 0, 100).unwrap().len(), 3);
        assert_eq!(store.lrange(b"l", 5, 10).unwrap(), Vec::<Vec<u8>>::new());
        assert_eq!(store.lrange(b"l", -100, 0).unwrap(), vec![b"a".to_vec()]);
        assert_eq!(store.lrange(b"l", 2, 1).unwrap(), Vec::<Vec<u8>>::new());
        assert_eq!(store.lrange(b"missing", 0, -1).unwrap(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn lpop_drains_and_drops_the_key() {
        let mut store = KVStore::new();
        store.rpush(b"l", vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]).unwrap();
        assert_eq!(store.lpop(b"l", 2).unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(store.lpop(b"l", 5).unwrap(), vec![b"c".to_vec()]);
        assert_eq!(store.type_of(b"l"), "none");
        assert_eq!(store.lpop(b"l", 1).unwrap(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn list_ops_on_wrong_type_fail_without_mutating() {
        let mut store = KVStore::new();
        store.set_string(b"s", b"v".to_vec(), None);
        assert_eq!(store.rpush(b"s", vec![b"a".to_vec()]), Err(StoreError::WrongType));
        assert_eq!(store.lpop(b"s", 1), Err(StoreError::WrongType));
        assert_eq!(store.llen(b"s"), Err(StoreError::WrongType));
        assert_eq!(store.lrange(b"s", 0, -1), Err(StoreError::WrongType));
        assert_eq!(store.get_string(b"s"), Some(b"v".to_vec()));
    }

    #[test]
    fn rejected_xadd_on_a_fresh_key_leaves_nothing_behind() {
        let mut store = KVStore::new();
        let err = store.xadd(b"s", &EntryIdSpec::Explicit(RecordId::MIN), vec![], 0);
        assert_eq!(err, Err(StoreError::IdZero));
        assert_eq!(store.type_of(b"s"), "none");
    }

    #[test]
    fn xadd_xrange_and_cursor_reads() {
        let mut store = KVStore::new();
        let fields = vec![(b"f".to_vec(), b"v".to_vec())];
        store.xadd(b"s", &EntryIdSpec::Explicit(RecordId::new(1, 1)), fields.clone(), 0).unwrap();
        store.xadd(b"s", &EntryIdSpec::Explicit(RecordId::new(2, 0)), fields.clone(), 0).unwrap();

        let all = store.xrange(b"s", RecordId::MIN, RecordId::MAX).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].fields, fields);

        let after = store.xread_after(b"s", RecordId::new(1, 1)).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, RecordId::new(2, 0));

        assert_eq!(store.last_stream_id(b"s"), Ok(RecordId::new(2, 0)));
        assert_eq!(store.last_stream_id(b"missing"), Ok(RecordId::MIN));
        assert_eq!(store.type_of(b"s"), "stream");

        store.set_string(b"k", b"v".to_vec(), None);
        assert_eq!(store.xrange(b"k", RecordId::MIN, RecordId::MAX), Err(StoreError::WrongType));
    }
}
