//! In-process key/value cache with Redis semantics.
//!
//! Used by tests and by single-node deployments. Mirrors the parts of Redis
//! the cache layer relies on: per-key TTL, glob matching, cursor SCAN whose
//! cursor survives deletes, and sets. Fault switches let tests simulate an
//! outage or a cache that throws mid-operation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use marquee_core::{CacheKey, CacheSetName};
use tokio::time::Instant;

use super::traits::{ttl_seconds, CacheOutcome, CacheUnavailable, KeyValueCache, ScanPage};

#[derive(Debug, Clone)]
enum StoredValue {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: StoredValue,
    expires_at: Option<Instant>,
    /// Position in the scan order. Assigned once when the key is created and
    /// kept across overwrites, so a SCAN cursor stays valid while keys are
    /// deleted underneath it.
    seq: u64,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    slots: HashMap<String, Slot>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl Keyspace {
    fn live(&mut self, key: &str, now: Instant) -> Option<&Slot> {
        if self.slots.get(key).is_some_and(|s| s.is_expired(now)) {
            self.remove(key);
        }
        self.slots.get(key)
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.slots.remove(key) {
            Some(slot) => {
                self.order.remove(&slot.seq);
                true
            }
            None => false,
        }
    }

    fn upsert(&mut self, key: &str, value: StoredValue, expires_at: Option<Instant>) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.value = value;
            slot.expires_at = expires_at;
            return;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        self.order.insert(seq, key.to_string());
        self.slots.insert(
            key.to_string(),
            Slot {
                value,
                expires_at,
                seq,
            },
        );
    }
}

/// In-memory [`KeyValueCache`].
#[derive(Debug, Default)]
pub struct InMemoryKeyValueCache {
    keyspace: RwLock<Keyspace>,
    unreachable: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    closed: AtomicBool,
    get_calls: AtomicU64,
    scan_calls: AtomicU64,
}

impl InMemoryKeyValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with [`CacheUnavailable::Unreachable`].
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make GET fail with a command error (cache throws mid-operation).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make SET, SADD and DEL fail with a command error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Store raw bytes without a TTL, bypassing the fault switches.
    pub fn insert_raw(&self, key: &CacheKey, bytes: &[u8]) {
        if let Ok(mut ks) = self.keyspace.write() {
            ks.upsert(key.as_str(), StoredValue::Bytes(bytes.to_vec()), None);
        }
    }

    /// Whether a live value exists at `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        self.keyspace
            .write()
            .map(|mut ks| ks.live(key.as_str(), now).is_some())
            .unwrap_or(false)
    }

    /// Raw bytes at `key`, bypassing the fault switches.
    pub fn peek(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut ks = self.keyspace.write().ok()?;
        match ks.live(key.as_str(), now).map(|s| &s.value) {
            Some(StoredValue::Bytes(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// Number of live keys (strings and sets).
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.keyspace
            .read()
            .map(|ks| ks.slots.values().filter(|s| !s.is_expired(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many GET calls reached the backend.
    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// How many SCAN pages were served.
    pub fn scan_calls(&self) -> u64 {
        self.scan_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> CacheOutcome<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheUnavailable::Closed);
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CacheUnavailable::Unreachable {
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    fn check_writable(&self) -> CacheOutcome<()> {
        self.check_available()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheUnavailable::Command {
                reason: "write rejected".to_string(),
            });
        }
        Ok(())
    }

    fn write_keyspace(&self) -> CacheOutcome<std::sync::RwLockWriteGuard<'_, Keyspace>> {
        self.keyspace.write().map_err(|_| CacheUnavailable::Command {
            reason: "keyspace lock poisoned".to_string(),
        })
    }
}

#[async_trait]
impl KeyValueCache for InMemoryKeyValueCache {
    async fn get(&self, key: &CacheKey) -> CacheOutcome<Option<Vec<u8>>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheUnavailable::Command {
                reason: "read failed".to_string(),
            });
        }
        let now = Instant::now();
        let mut ks = self.write_keyspace()?;
        match ks.live(key.as_str(), now).map(|s| &s.value) {
            None => Ok(None),
            Some(StoredValue::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(StoredValue::Set(_)) => Err(wrong_type()),
        }
    }

    async fn set(&self, key: &CacheKey, value: &[u8], ttl: Duration) -> CacheOutcome<()> {
        self.check_writable()?;
        let expires_at = Instant::now() + Duration::from_secs(ttl_seconds(ttl));
        let mut ks = self.write_keyspace()?;
        ks.upsert(
            key.as_str(),
            StoredValue::Bytes(value.to_vec()),
            Some(expires_at),
        );
        Ok(())
    }

    async fn delete(&self, keys: &[CacheKey]) -> CacheOutcome<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.check_writable()?;
        let now = Instant::now();
        let mut ks = self.write_keyspace()?;
        let mut removed = 0;
        for key in keys {
            let live = ks.live(key.as_str(), now).is_some();
            if live && ks.remove(key.as_str()) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> CacheOutcome<ScanPage> {
        self.check_available()?;
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        let mut ks = self.write_keyspace()?;

        let examined: Vec<(u64, String)> = ks
            .order
            .range(cursor..)
            .take(count.max(1))
            .map(|(seq, key)| (*seq, key.clone()))
            .collect();

        let mut keys = Vec::new();
        for (_, key) in &examined {
            if ks.live(key, now).is_some() && glob_match(pattern, key) {
                keys.push(CacheKey::from_raw(key.clone()));
            }
        }

        let next = examined.last().map(|(seq, _)| seq + 1).unwrap_or(0);
        let exhausted = next == 0 || ks.order.range(next..).next().is_none();
        Ok(ScanPage {
            cursor: if exhausted { 0 } else { next },
            keys,
        })
    }

    async fn add_to_set(&self, set: &CacheSetName, key: &CacheKey, ttl: Duration) -> CacheOutcome<()> {
        self.check_writable()?;
        let now = Instant::now();
        let expires_at = now + Duration::from_secs(ttl_seconds(ttl));
        let mut ks = self.write_keyspace()?;
        let mut members = match ks.live(set.as_str(), now).map(|s| &s.value) {
            None => BTreeSet::new(),
            Some(StoredValue::Set(members)) => members.clone(),
            Some(StoredValue::Bytes(_)) => return Err(wrong_type()),
        };
        members.insert(key.as_str().to_string());
        ks.upsert(set.as_str(), StoredValue::Set(members), Some(expires_at));
        Ok(())
    }

    async fn set_members(&self, set: &CacheSetName) -> CacheOutcome<Vec<CacheKey>> {
        self.check_available()?;
        let now = Instant::now();
        let mut ks = self.write_keyspace()?;
        match ks.live(set.as_str(), now).map(|s| &s.value) {
            None => Ok(Vec::new()),
            Some(StoredValue::Set(members)) => {
                Ok(members.iter().cloned().map(CacheKey::from_raw).collect())
            }
            Some(StoredValue::Bytes(_)) => Err(wrong_type()),
        }
    }

    async fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

fn wrong_type() -> CacheUnavailable {
    CacheUnavailable::Command {
        reason: "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    }
}

/// Redis-style glob match: `*`, `?`, `[abc]`, `[a-z]`, `[^a]` and `\` escapes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_from(&p, &t)
}

fn glob_match_from(p: &[char], t: &[char]) -> bool {
    let (mut pi, mut ti) = (0, 0);
    // Backtrack point for the most recent `*`: (pattern index after star, text index).
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi + 1, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(p, pi, t[ti]) {
                        if matched {
                            pi = next;
                            ti += 1;
                            continue;
                        }
                    } else if t[ti] == '[' {
                        // Unterminated class matches a literal '['.
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
                '\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == t[ti] {
                        pi += 2;
                        ti += 1;
                        continue;
                    }
                }
                c => {
                    if c == t[ti] {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
            }
        }
        match star {
            Some((star_pi, star_ti)) => {
                pi = star_pi;
                ti = star_ti + 1;
                star = Some((star_pi, star_ti + 1));
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

/// Match `c` against the class starting at `p[start] == '['`.
/// Returns `(matched, index after the closing ']')`, or `None` if unterminated.
fn match_class(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = i < p.len() && p[i] == '^';
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < p.len() {
        if p[i] == ']' && !first {
            return Some((matched != negate, i + 1));
        }
        first = false;
        let lo = if p[i] == '\\' && i + 1 < p.len() {
            i += 1;
            p[i]
        } else {
            p[i]
        };
        if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let hi = p[i + 2];
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            if lo <= c && c <= hi {
                matched = true;
            }
            i += 3;
        } else {
            if lo == c {
                matched = true;
            }
            i += 1;
        }
    }
    None
}
