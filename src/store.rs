use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::errors::CommandError;
use crate::stream::{IdSpec, ReadStart, Stream, StreamEntry, StreamId};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A stored value. The tag is stable for the value's lifetime: commands of a
/// different type get `WRONGTYPE`, never a silent conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String {
        data: Bytes,
        /// Absolute expiry, milliseconds since the epoch.
        expires_at: Option<u64>,
    },
    List(VecDeque<Bytes>),
    Stream(Stream),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String { .. } => "string",
            Value::List(_) => "list",
            Value::Stream(_) => "stream",
        }
    }
}

/// How many waiters a mutation wakes.
#[derive(Debug, Clone, Copy)]
pub enum NotifyMode {
    /// List pushes: one element feeds one BLPOP.
    One,
    /// Stream appends: every XREAD BLOCK client may be interested.
    All,
}

struct KeyWaiter {
    cv: Arc<Condvar>,
    count: usize,
}

/// Keyspace plus waiter table, all guarded by one mutex. Sessions take the
/// lock for the duration of each command (and across a whole EXEC queue).
#[derive(Default)]
pub struct StoreInner {
    data: HashMap<Bytes, Value>,
    waiters: HashMap<Bytes, KeyWaiter>,
}

impl StoreInner {
    /// Lazy expiry: an expired string is removed the moment a read sees it.
    fn live_value(&mut self, key: &Bytes) -> Option<&mut Value> {
        if let Some(Value::String {
            expires_at: Some(at),
            ..
        }) = self.data.get(key)
        {
            if now_ms() >= *at {
                self.data.remove(key);
                return None;
            }
        }
        self.data.get_mut(key)
    }

    pub fn get(&mut self, key: &Bytes) -> Result<Option<Bytes>, CommandError> {
        match self.live_value(key) {
            None => Ok(None),
            Some(Value::String { data, .. }) => Ok(Some(data.clone())),
            Some(_) => Err(CommandError::WrongType),
        }
    }

    /// SET overwrites whatever was there, of any type, and resets the expiry.
    pub fn set(&mut self, key: Bytes, data: Bytes, px: Option<u64>) {
        let expires_at = px.map(|ms| now_ms() + ms);
        self.data.insert(key, Value::String { data, expires_at });
    }

    pub fn delete(&mut self, key: &Bytes) -> bool {
        self.data.remove(key).is_some()
    }

    pub fn type_name(&mut self, key: &Bytes) -> &'static str {
        match self.live_value(key) {
            None => "none",
            Some(value) => value.type_name(),
        }
    }

    /// Parses the stored string as a base-10 `i64`, adds one, stores the
    /// result with the TTL untouched. A missing key starts from 0.
    pub fn incr(&mut self, key: &Bytes) -> Result<i64, CommandError> {
        let (current, expires_at) = match self.live_value(key) {
            None => (0, None),
            Some(Value::String { data, expires_at }) => {
                let parsed = std::str::from_utf8(data)
                    .ok()
                    .and_then(|text| text.parse::<i64>().ok())
                    .ok_or(CommandError::NotAnInteger)?;
                (parsed, *expires_at)
            }
            Some(_) => return Err(CommandError::WrongType),
        };
        let next = current.checked_add(1).ok_or(CommandError::NotAnInteger)?;
        self.data.insert(
            key.clone(),
            Value::String {
                data: Bytes::from(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    /// LPUSH/RPUSH. Creates the list on demand, returns the new length and
    /// wakes one waiter.
    pub fn push(
        &mut self,
        key: &Bytes,
        elements: Vec<Bytes>,
        at_head: bool,
    ) -> Result<usize, CommandError> {
        // run lazy expiry before the type check
        self.live_value(key);
        let value = self
            .data
            .entry(key.clone())
            .or_insert_with(|| Value::List(VecDeque::new()));
        let Value::List(list) = value else {
            return Err(CommandError::WrongType);
        };
        for element in elements {
            if at_head {
                list.push_front(element);
            } else {
                list.push_back(element);
            }
        }
        let len = list.len();
        self.notify(key, NotifyMode::One);
        Ok(len)
    }

    pub fn pop_front(&mut self, key: &Bytes) -> Result<Option<Bytes>, CommandError> {
        match self.live_value(key) {
            None => Ok(None),
            Some(Value::List(list)) => Ok(list.pop_front()),
            Some(_) => Err(CommandError::WrongType),
        }
    }

    /// LPOP with a count: up to `count` head elements, possibly none.
    pub fn pop_count(&mut self, key: &Bytes, count: u64) -> Result<Vec<Bytes>, CommandError> {
        match self.live_value(key) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => {
                let take = (count as usize).min(list.len());
                Ok(list.drain(..take).collect())
            }
            Some(_) => Err(CommandError::WrongType),
        }
    }

    pub fn llen(&mut self, key: &Bytes) -> Result<usize, CommandError> {
        match self.live_value(key) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(CommandError::WrongType),
        }
    }

    /// Inclusive indices; negatives count from the tail; out-of-range slices
    /// clamp to empty.
    pub fn lrange(&mut self, key: &Bytes, start: i64, stop: i64) -> Result<Vec<Bytes>, CommandError> {
        let list = match self.live_value(key) {
            None => return Ok(Vec::new()),
            Some(Value::List(list)) => list,
            Some(_) => return Err(CommandError::WrongType),
        };
        let len = list.len() as i64;
        let start = if start < 0 { len + start } else { start }.max(0);
        let stop = if stop < 0 { len + stop } else { stop }.min(len - 1);
        if len == 0 || start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    /// XADD. Creates the stream on demand and wakes every waiter on the key.
    pub fn xadd(
        &mut self,
        key: &Bytes,
        spec: IdSpec,
        fields: Vec<(Bytes, Bytes)>,
    ) -> Result<StreamId, CommandError> {
        // run lazy expiry before the type check
        self.live_value(key);
        let existed = self.data.contains_key(key);
        let value = self
            .data
            .entry(key.clone())
            .or_insert_with(|| Value::Stream(Stream::default()));
        let Value::Stream(stream) = value else {
            return Err(CommandError::WrongType);
        };
        match stream.add(spec, fields, now_ms()) {
            Ok(id) => {
                self.notify(key, NotifyMode::All);
                Ok(id)
            }
            Err(err) => {
                // a rejected id must not leave an empty stream behind
                if !existed {
                    self.data.remove(key);
                }
                Err(err)
            }
        }
    }

    pub fn xrange(
        &mut self,
        key: &Bytes,
        start: StreamId,
        end: StreamId,
    ) -> Result<Vec<StreamEntry>, CommandError> {
        match self.live_value(key) {
            None => Ok(Vec::new()),
            Some(Value::Stream(stream)) => Ok(stream.range(start, end)),
            Some(_) => Err(CommandError::WrongType),
        }
    }

    /// The key's current last id, `0-0` for missing or empty streams. Used to
    /// resolve `$` under the lock.
    pub fn last_stream_id(&mut self, key: &Bytes) -> StreamId {
        match self.live_value(key) {
            Some(Value::Stream(stream)) => stream.last_id().unwrap_or(StreamId::ZERO),
            _ => StreamId::ZERO,
        }
    }

    /// One XREAD scan over resolved start ids; keys with nothing new (or of
    /// the wrong type) are omitted.
    pub fn read_streams(&mut self, specs: &[(Bytes, StreamId)]) -> Vec<(Bytes, Vec<StreamEntry>)> {
        let mut hits = Vec::new();
        for (key, after) in specs {
            if let Some(Value::Stream(stream)) = self.live_value(key) {
                let entries = stream.entries_after(*after);
                if !entries.is_empty() {
                    hits.push((key.clone(), entries));
                }
            }
        }
        hits
    }

    /// Signals the key's condition variable, if anyone is waiting.
    pub fn notify(&mut self, key: &Bytes, mode: NotifyMode) {
        if let Some(waiter) = self.waiters.get(key) {
            match mode {
                NotifyMode::One => waiter.cv.notify_one(),
                NotifyMode::All => waiter.cv.notify_all(),
            }
        }
    }

    /// Enrolls the caller as a waiter on `key` and hands back the condvar to
    /// wait on. Must be paired with `unregister_waiter`.
    fn register_waiter(&mut self, key: &Bytes) -> Arc<Condvar> {
        let waiter = self.waiters.entry(key.clone()).or_insert_with(|| KeyWaiter {
            cv: Arc::new(Condvar::new()),
            count: 0,
        });
        waiter.count += 1;
        waiter.cv.clone()
    }

    /// Waiter entries are reference-counted and dropped at zero.
    fn unregister_waiter(&mut self, key: &Bytes) {
        if let Some(waiter) = self.waiters.get_mut(key) {
            waiter.count -= 1;
            if waiter.count == 0 {
                self.waiters.remove(key);
            }
        }
    }

    #[cfg(test)]
    pub fn waiter_count(&self, key: &Bytes) -> usize {
        self.waiters.get(key).map_or(0, |waiter| waiter.count)
    }

    #[cfg(test)]
    pub fn expire_at(&mut self, key: &Bytes, at_ms: u64) {
        if let Some(Value::String { expires_at, .. }) = self.data.get_mut(key) {
            *expires_at = Some(at_ms);
        }
    }
}

pub struct Store {
    inner: Mutex<StoreInner>,
}

impl Default for Store {
    fn default() -> Store {
        Store {
            inner: Mutex::new(StoreInner::default()),
        }
    }
}

impl Store {
    pub fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap()
    }

    /// BLPOP: fast path under the lock, otherwise wait on the key's condvar
    /// until an element arrives or the deadline passes. `None` timeout waits
    /// forever. Returns the popped element, or `None` on timeout.
    pub fn blpop(
        &self,
        key: &Bytes,
        timeout: Option<Duration>,
    ) -> Result<Option<Bytes>, CommandError> {
        let mut inner = self.lock();
        match inner.pop_front(key) {
            Ok(Some(element)) => return Ok(Some(element)),
            Ok(None) => {}
            Err(err) => return Err(err),
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let cv = inner.register_waiter(key);
        let result = loop {
            inner = match deadline {
                None => cv.wait(inner).unwrap(),
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        break Ok(None);
                    };
                    // a timed-out wait still re-checks: a push may have raced
                    // the deadline and the wakeup must not be lost
                    cv.wait_timeout(inner, remaining).unwrap().0
                }
            };
            match inner.pop_front(key) {
                Ok(Some(element)) => break Ok(Some(element)),
                Ok(None) => {}
                Err(err) => break Err(err),
            }
        };
        inner.unregister_waiter(key);
        result
    }

    /// XREAD, optionally blocking. `block_ms` of `None` means no BLOCK clause
    /// (return immediately); `Some(0)` blocks forever. `$` starts resolve to
    /// the key's last id under the same lock acquisition that scans, so
    /// entries appended afterwards qualify on re-scan.
    pub fn xread(
        &self,
        specs: Vec<(Bytes, ReadStart)>,
        block_ms: Option<u64>,
    ) -> Vec<(Bytes, Vec<StreamEntry>)> {
        let mut inner = self.lock();
        let resolved: Vec<(Bytes, StreamId)> = specs
            .into_iter()
            .map(|(key, start)| {
                let after = match start {
                    ReadStart::Latest => inner.last_stream_id(&key),
                    ReadStart::After(id) => id,
                };
                (key, after)
            })
            .collect();
        let hits = inner.read_streams(&resolved);
        if !hits.is_empty() {
            return hits;
        }
        let Some(block_ms) = block_ms else {
            return hits;
        };
        let Some((first_key, _)) = resolved.first().cloned() else {
            return hits;
        };
        let deadline = (block_ms > 0).then(|| Instant::now() + Duration::from_millis(block_ms));
        let cv = inner.register_waiter(&first_key);
        let hits = loop {
            inner = match deadline {
                None => cv.wait(inner).unwrap(),
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        break Vec::new();
                    };
                    cv.wait_timeout(inner, remaining).unwrap().0
                }
            };
            let hits = inner.read_streams(&resolved);
            if !hits.is_empty() {
                break hits;
            }
        };
        inner.unregister_waiter(&first_key);
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn key(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    #[test]
    fn set_then_get() {
        let store = Store::default();
        let mut inner = store.lock();
        inner.set(key("foo"), Bytes::from_static(b"bar"), None);
        assert_eq!(inner.get(&key("foo")).unwrap(), Some(Bytes::from_static(b"bar")));
        assert_eq!(inner.get(&key("missing")).unwrap(), None);
    }

    #[test]
    fn expired_strings_vanish_on_read() {
        let store = Store::default();
        let mut inner = store.lock();
        inner.set(key("k"), Bytes::from_static(b"v"), Some(10_000));
        inner.expire_at(&key("k"), now_ms().saturating_sub(1));
        assert_eq!(inner.get(&key("k")).unwrap(), None);
        assert_eq!(inner.type_name(&key("k")), "none");
    }

    #[test]
    fn delete_removes_any_value() {
        let store = Store::default();
        let mut inner = store.lock();
        inner.set(key("k"), Bytes::from_static(b"v"), None);
        assert!(inner.delete(&key("k")));
        assert!(!inner.delete(&key("k")));
        assert_eq!(inner.get(&key("k")).unwrap(), None);
    }

    #[test]
    fn get_on_a_list_is_a_type_error() {
        let store = Store::default();
        let mut inner = store.lock();
        inner
            .push(&key("l"), vec![Bytes::from_static(b"a")], false)
            .unwrap();
        assert_eq!(inner.get(&key("l")), Err(CommandError::WrongType));
        assert_eq!(inner.incr(&key("l")), Err(CommandError::WrongType));
    }

    #[test]
    fn incr_counts_and_preserves_ttl() {
        let store = Store::default();
        let mut inner = store.lock();
        for expected in 1..=3 {
            assert_eq!(inner.incr(&key("n")).unwrap(), expected);
        }
        assert_eq!(inner.type_name(&key("n")), "string");

        inner.set(key("t"), Bytes::from_static(b"41"), Some(60_000));
        assert_eq!(inner.incr(&key("t")).unwrap(), 42);
        match inner.live_value(&key("t")) {
            Some(Value::String { expires_at, .. }) => assert!(expires_at.is_some()),
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn incr_rejects_garbage_and_overflow() {
        let store = Store::default();
        let mut inner = store.lock();
        inner.set(key("s"), Bytes::from_static(b"abc"), None);
        assert_eq!(inner.incr(&key("s")), Err(CommandError::NotAnInteger));
        inner.set(key("max"), Bytes::from(i64::MAX.to_string()), None);
        assert_eq!(inner.incr(&key("max")), Err(CommandError::NotAnInteger));
    }

    #[test]
    fn push_orders_head_and_tail() {
        let store = Store::default();
        let mut inner = store.lock();
        inner
            .push(
                &key("l"),
                vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
                false,
            )
            .unwrap();
        inner
            .push(
                &key("l"),
                vec![Bytes::from_static(b"c"), Bytes::from_static(b"d")],
                true,
            )
            .unwrap();
        let range = inner.lrange(&key("l"), 0, -1).unwrap();
        let texts: Vec<_> = range.iter().map(|b| &b[..]).collect();
        assert_eq!(texts, vec![&b"d"[..], b"c", b"a", b"b"]);
    }

    #[test]
    fn lrange_clamps_out_of_range_slices() {
        let store = Store::default();
        let mut inner = store.lock();
        inner
            .push(&key("l"), vec![Bytes::from_static(b"a")], false)
            .unwrap();
        assert!(inner.lrange(&key("l"), 5, 9).unwrap().is_empty());
        assert!(inner.lrange(&key("missing"), 0, -1).unwrap().is_empty());
        assert_eq!(inner.lrange(&key("l"), -10, -1).unwrap().len(), 1);
    }

    #[test]
    fn pop_count_takes_at_most_len() {
        let store = Store::default();
        let mut inner = store.lock();
        inner
            .push(
                &key("l"),
                vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
                false,
            )
            .unwrap();
        assert_eq!(inner.pop_count(&key("l"), 5).unwrap().len(), 2);
        assert!(inner.pop_count(&key("l"), 1).unwrap().is_empty());
        assert_eq!(inner.pop_front(&key("l")).unwrap(), None);
    }

    #[test]
    fn blpop_times_out_empty_handed() {
        let store = Store::default();
        let got = store
            .blpop(&key("nothing"), Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(got, None);
        assert_eq!(store.lock().waiter_count(&key("nothing")), 0);
    }

    #[test]
    fn blpop_wakes_on_push() {
        let store = Arc::new(Store::default());
        let waiter = {
            let store = store.clone();
            thread::spawn(move || store.blpop(&key("q"), Some(Duration::from_secs(5))))
        };
        // give the waiter time to enroll
        thread::sleep(Duration::from_millis(50));
        store
            .lock()
            .push(&key("q"), vec![Bytes::from_static(b"v1")], false)
            .unwrap();
        let got = waiter.join().unwrap().unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"v1")));
        let mut inner = store.lock();
        assert_eq!(inner.llen(&key("q")).unwrap(), 0);
        assert_eq!(inner.waiter_count(&key("q")), 0);
    }

    #[test]
    fn xread_blocks_until_an_entry_lands() {
        let store = Arc::new(Store::default());
        let reader = {
            let store = store.clone();
            thread::spawn(move || {
                store.xread(vec![(key("s"), ReadStart::Latest)], Some(5_000))
            })
        };
        thread::sleep(Duration::from_millis(50));
        store
            .lock()
            .xadd(
                &key("s"),
                IdSpec::Explicit(StreamId::new(1, 1)),
                vec![(Bytes::from_static(b"f"), Bytes::from_static(b"v"))],
            )
            .unwrap();
        let hits = reader.join().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1[0].id, StreamId::new(1, 1));
    }

    #[test]
    fn xread_without_block_returns_immediately() {
        let store = Store::default();
        let hits = store.xread(vec![(key("s"), ReadStart::After(StreamId::ZERO))], None);
        assert!(hits.is_empty());
    }
}
