//! The keyed cache and its command-level API.
//!
//! `Store` owns a mutex-guarded key/value map plus an atomic counter bag, and
//! dispatches a [`Command`] to the matching operation the way the source's
//! `Execute<Request, Response>` match does — one arm per opcode, translating the
//! operation's boolean/lookup outcome into the wire-independent [`Response`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use memc_common::Clock;
use memc_protocol::{Command, Op, Record, Response, Value};

/// The version string this server reports to `version` and `stats`.
pub const VERSION: &str = "1.4.17";

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    curr_connections: AtomicU64,
    total_items: AtomicU64,
    cmd_get: AtomicU64,
    cmd_set: AtomicU64,
    cmd_touch: AtomicU64,
    get_hits: AtomicU64,
    get_misses: AtomicU64,
    delete_hits: AtomicU64,
    delete_misses: AtomicU64,
    touch_hits: AtomicU64,
    touch_misses: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

pub struct Store {
    clock: Arc<dyn Clock>,
    threads: u32,
    extra_stats: bool,
    map: Mutex<HashMap<Vec<u8>, Record>>,
    counters: Counters,
}

impl Store {
    pub fn new(clock: Arc<dyn Clock>, threads: u32, extra_stats: bool) -> Self {
        Store {
            clock,
            threads,
            extra_stats,
            map: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn connection_opened(&self) {
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        self.counters.curr_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.counters.curr_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Executes one parsed command end to end and returns the reply to send.
    pub fn execute(&self, cmd: &Command) -> Response {
        match cmd.op {
            Op::Set => {
                self.set(cmd.key().to_vec(), cmd.body.clone(), cmd.flags, cmd.exptime);
                Response::Stored
            }
            Op::Add => {
                if self.add(cmd.key().to_vec(), cmd.body.clone(), cmd.flags, cmd.exptime) {
                    Response::Stored
                } else {
                    Response::NotStored
                }
            }
            Op::Replace => {
                if self.replace(cmd.key().to_vec(), cmd.body.clone(), cmd.flags, cmd.exptime) {
                    Response::Stored
                } else {
                    Response::NotStored
                }
            }
            Op::Append => {
                if self.append(cmd.key(), &cmd.body) {
                    Response::Stored
                } else {
                    Response::NotStored
                }
            }
            Op::Prepend => {
                if self.prepend(cmd.key(), &cmd.body) {
                    Response::Stored
                } else {
                    Response::NotStored
                }
            }
            Op::Get => Response::Values(self.get(&cmd.keys)),
            Op::Delete => {
                if self.delete(cmd.key()) {
                    Response::Deleted
                } else {
                    Response::NotFound
                }
            }
            Op::Touch => {
                if self.touch(cmd.key(), cmd.exptime) {
                    Response::Touched
                } else {
                    Response::NotFound
                }
            }
            Op::Stats => Response::Stats(self.stats()),
            Op::Version => Response::Version(self.version().to_string()),
            Op::Quit => Response::Hangup,
            Op::Malformed | Op::Unsupported => Response::Error,
        }
    }

    pub fn set(&self, key: Vec<u8>, body: Vec<u8>, flags: u32, exptime: u32) -> bool {
        let now = self.clock.now_unix();
        let len = body.len() as u64;
        let mut map = self.map.lock().unwrap();
        map.insert(key, Record::new(body, flags, exptime, now));
        drop(map);
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_written.fetch_add(len, Ordering::Relaxed);
        self.counters.total_items.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn add(&self, key: Vec<u8>, body: Vec<u8>, flags: u32, exptime: u32) -> bool {
        let now = self.clock.now_unix();
        let mut map = self.map.lock().unwrap();
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        if live(&mut map, &key, now).is_some() {
            return false;
        }
        let len = body.len() as u64;
        map.insert(key, Record::new(body, flags, exptime, now));
        drop(map);
        self.counters.bytes_written.fetch_add(len, Ordering::Relaxed);
        self.counters.total_items.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn replace(&self, key: Vec<u8>, body: Vec<u8>, flags: u32, exptime: u32) -> bool {
        let now = self.clock.now_unix();
        let mut map = self.map.lock().unwrap();
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        if live(&mut map, &key, now).is_none() {
            return false;
        }
        let len = body.len() as u64;
        map.insert(key, Record::new(body, flags, exptime, now));
        drop(map);
        self.counters.bytes_written.fetch_add(len, Ordering::Relaxed);
        self.counters.total_items.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn append(&self, key: &[u8], body: &[u8]) -> bool {
        let now = self.clock.now_unix();
        let mut map = self.map.lock().unwrap();
        match live(&mut map, key, now) {
            Some(record) => {
                record.append(body);
                drop(map);
                self.counters.bytes_written.fetch_add(body.len() as u64, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn prepend(&self, key: &[u8], body: &[u8]) -> bool {
        let now = self.clock.now_unix();
        let mut map = self.map.lock().unwrap();
        match live(&mut map, key, now) {
            Some(record) => {
                record.prepend(body);
                drop(map);
                self.counters.bytes_written.fetch_add(body.len() as u64, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, keys: &[Vec<u8>]) -> Vec<Value> {
        let now = self.clock.now_unix();
        let mut map = self.map.lock().unwrap();
        self.counters.cmd_get.fetch_add(1, Ordering::Relaxed);
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            match live(&mut map, key, now) {
                Some(record) => {
                    self.counters.get_hits.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .bytes_read
                        .fetch_add(record.body.len() as u64, Ordering::Relaxed);
                    values.push(Value {
                        key: key.clone(),
                        flags: record.flags,
                        body: record.body.clone(),
                    });
                }
                None => {
                    self.counters.get_misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        values
    }

    pub fn delete(&self, key: &[u8]) -> bool {
        let now = self.clock.now_unix();
        let mut map = self.map.lock().unwrap();
        let was_live = live(&mut map, key, now).is_some();
        if was_live {
            map.remove(key);
            self.counters.delete_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.delete_misses.fetch_add(1, Ordering::Relaxed);
        }
        was_live
    }

    pub fn touch(&self, key: &[u8], exptime: u32) -> bool {
        let now = self.clock.now_unix();
        let mut map = self.map.lock().unwrap();
        self.counters.cmd_touch.fetch_add(1, Ordering::Relaxed);
        match live(&mut map, key, now) {
            Some(record) => {
                record.touch(exptime, now);
                self.counters.touch_hits.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                self.counters.touch_misses.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    /// Snapshots every tracked counter, sorted by key for stable output.
    pub fn stats(&self) -> Vec<(String, String)> {
        let now = self.clock.now_unix();
        let (curr_items, bytes) = {
            let map = self.map.lock().unwrap();
            let mut curr_items = 0u64;
            let mut bytes = 0u64;
            for record in map.values() {
                if !record.expired(now) {
                    curr_items += 1;
                    bytes += record.body.len() as u64;
                }
            }
            (curr_items, bytes)
        };

        let c = &self.counters;
        let mut out = vec![
            ("pid".to_string(), std::process::id().to_string()),
            ("uptime".to_string(), self.clock.uptime().to_string()),
            ("time".to_string(), now.to_string()),
            ("version".to_string(), VERSION.to_string()),
            (
                "curr_connections".to_string(),
                c.curr_connections.load(Ordering::Relaxed).to_string(),
            ),
            (
                "total_connections".to_string(),
                c.total_connections.load(Ordering::Relaxed).to_string(),
            ),
            ("threads".to_string(), self.threads.to_string()),
            ("bytes".to_string(), bytes.to_string()),
            ("curr_items".to_string(), curr_items.to_string()),
            (
                "total_items".to_string(),
                c.total_items.load(Ordering::Relaxed).to_string(),
            ),
            ("evictions".to_string(), "0".to_string()),
            ("cmd_get".to_string(), c.cmd_get.load(Ordering::Relaxed).to_string()),
            ("cmd_set".to_string(), c.cmd_set.load(Ordering::Relaxed).to_string()),
            ("get_hits".to_string(), c.get_hits.load(Ordering::Relaxed).to_string()),
            (
                "get_misses".to_string(),
                c.get_misses.load(Ordering::Relaxed).to_string(),
            ),
            (
                "delete_hits".to_string(),
                c.delete_hits.load(Ordering::Relaxed).to_string(),
            ),
            (
                "delete_misses".to_string(),
                c.delete_misses.load(Ordering::Relaxed).to_string(),
            ),
        ];

        if self.extra_stats {
            out.push(("cmd_touch".to_string(), c.cmd_touch.load(Ordering::Relaxed).to_string()));
            out.push((
                "touch_hits".to_string(),
                c.touch_hits.load(Ordering::Relaxed).to_string(),
            ));
            out.push((
                "touch_misses".to_string(),
                c.touch_misses.load(Ordering::Relaxed).to_string(),
            ));
            out.push((
                "bytes_read".to_string(),
                c.bytes_read.load(Ordering::Relaxed).to_string(),
            ));
            out.push((
                "bytes_written".to_string(),
                c.bytes_written.load(Ordering::Relaxed).to_string(),
            ));
        }

        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

/// Returns the live record for `key`, purging it first if it has expired.
fn live<'a>(
    map: &'a mut HashMap<Vec<u8>, Record>,
    key: &[u8],
    now: u64,
) -> Option<&'a mut Record> {
    let expired = map.get(key)?.expired(now);
    if expired {
        map.remove(key);
        return None;
    }
    map.get_mut(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memc_common::TestClock;

    fn store() -> (Store, Arc<TestClock>) {
        let clock = TestClock::new(1_000);
        (Store::new(clock.clone(), 4, true), clock)
    }

    #[test]
    fn set_then_get_roundtrip() {
        let (store, _clock) = store();
        store.set(b"foo".to_vec(), b"bar".to_vec(), 7, 0);
        let values = store.get(&[b"foo".to_vec()]);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].flags, 7);
        assert_eq!(values[0].body, b"bar");
    }

    #[test]
    fn add_fails_when_present() {
        let (store, _clock) = store();
        assert!(store.add(b"k".to_vec(), b"a".to_vec(), 0, 0));
        assert!(!store.add(b"k".to_vec(), b"b".to_vec(), 0, 0));
        let values = store.get(&[b"k".to_vec()]);
        assert_eq!(values[0].body, b"a");
    }

    #[test]
    fn replace_fails_when_absent() {
        let (store, _clock) = store();
        assert!(!store.replace(b"k".to_vec(), b"a".to_vec(), 0, 0));
    }

    #[test]
    fn append_concatenates() {
        let (store, _clock) = store();
        store.set(b"k".to_vec(), b"ab".to_vec(), 0, 0);
        assert!(store.append(b"k", b"cd"));
        let values = store.get(&[b"k".to_vec()]);
        assert_eq!(values[0].body, b"abcd");
    }

    #[test]
    fn expiry_makes_key_absent() {
        let (store, clock) = store();
        store.set(b"k".to_vec(), b"v".to_vec(), 0, 10);
        assert_eq!(store.get(&[b"k".to_vec()]).len(), 1);
        clock.advance(11);
        assert_eq!(store.get(&[b"k".to_vec()]).len(), 0);
        // treated as absent for add too
        assert!(store.add(b"k".to_vec(), b"v2".to_vec(), 0, 0));
    }

    #[test]
    fn delete_is_idempotent_after_first_miss() {
        let (store, _clock) = store();
        store.set(b"k".to_vec(), b"v".to_vec(), 0, 0);
        assert!(store.delete(b"k"));
        assert!(!store.delete(b"k"));
    }

    #[test]
    fn touch_applies_new_exptime() {
        let (store, clock) = store();
        store.set(b"k".to_vec(), b"v".to_vec(), 0, 5);
        assert!(store.touch(b"k", 100));
        clock.advance(6);
        assert_eq!(store.get(&[b"k".to_vec()]).len(), 1);
    }

    #[test]
    fn stats_counters_never_decrease() {
        let (store, _clock) = store();
        store.set(b"k".to_vec(), b"v".to_vec(), 0, 0);
        store.get(&[b"k".to_vec()]);
        let before = store.stats();
        store.get(&[b"k".to_vec()]);
        let after = store.stats();
        let before_map: HashMap<_, _> = before.into_iter().collect();
        let after_map: HashMap<_, _> = after.into_iter().collect();
        for (k, v) in &after_map {
            if let Ok(after_n) = v.parse::<u64>() {
                if let Some(before_v) = before_map.get(k) {
                    if let Ok(before_n) = before_v.parse::<u64>() {
                        assert!(after_n >= before_n, "{k} decreased");
                    }
                }
            }
        }
    }
}
