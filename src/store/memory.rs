use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CounterStore, StoreError};

/// In-process counter store with the same operational contract as Redis.
///
/// Backs the test suites and is handy for running the pipeline locally
/// without a Redis server. Commands can be armed to fail for error-path
/// tests, and per-command invocation counts are recorded.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, String>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<HashMap<&'static str, usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the next `times` invocations of `op` to fail.
    /// `op` is the command name: INCRBYFLOAT, SCAN, GET, SET, or DEL.
    pub fn arm_failure(&self, op: &'static str, times: usize) {
        *self.failures.lock().entry(op).or_insert(0) += times;
    }

    /// Number of times `op` has been invoked, including failed attempts.
    pub fn calls(&self, op: &'static str) -> usize {
        self.calls.lock().get(op).copied().unwrap_or(0)
    }

    /// Snapshot of the whole keyspace, for assertions.
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.data.lock().clone()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.lock().contains_key(key)
    }

    fn enter(&self, op: &'static str) -> Result<(), StoreError> {
        *self.calls.lock().entry(op).or_insert(0) += 1;

        let mut failures = self.failures.lock();
        match failures.get_mut(op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Failed(format!("{op} armed to fail")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<(), StoreError> {
        self.enter("INCRBYFLOAT")?;

        let mut data = self.data.lock();
        let current = match data.get(key) {
            Some(raw) => raw.parse::<f64>().map_err(|_| StoreError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
            })?,
            None => 0.0,
        };
        data.insert(key.to_string(), format!("{}", current + delta));
        Ok(())
    }

    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(Vec<String>, u64), StoreError> {
        self.enter("SCAN")?;

        let data = self.data.lock();
        let all: Vec<&String> = data.keys().collect();
        let start = cursor as usize;
        let end = (start + count.max(1)).min(all.len());

        let page = all[start.min(all.len())..end]
            .iter()
            .filter(|key| glob_match(pattern, key))
            .map(|key| key.to_string())
            .collect();

        let next = if end >= all.len() { 0 } else { end as u64 };
        Ok((page, next))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.enter("GET")?;
        Ok(self.data.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.enter("SET")?;
        self.data.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<(), StoreError> {
        self.enter("DEL")?;
        let mut data = self.data.lock();
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }
}

/// Redis-style glob match restricted to the `*` wildcard.
fn glob_match(pattern: &str, text: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == text;
    }

    let first = segments[0];
    let last = segments[segments.len() - 1];
    if !text.starts_with(first) {
        return false;
    }

    let mut pos = first.len();
    for seg in &segments[1..segments.len() - 1] {
        if seg.is_empty() {
            continue;
        }
        match text[pos..].find(seg) {
            Some(idx) => pos += idx + seg.len(),
            None => return false,
        }
    }

    if last.is_empty() {
        return true;
    }
    text.len() >= pos + last.len() && text[pos..].ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match_counter_pattern() {
        let pattern = "generation:A:tenant:*:sku:*:useUnit:*";
        assert!(glob_match(pattern, "generation:A:tenant:t1:sku:s1:useUnit:KB"));
        assert!(glob_match(
            pattern,
            "generation:A:tenant:t1:sku:s1:useUnit:MB/sec"
        ));
        assert!(!glob_match(pattern, "generation:B:tenant:t1:sku:s1:useUnit:KB"));
        assert!(!glob_match(pattern, "current_generation"));
    }

    #[test]
    fn test_glob_match_literal() {
        assert!(glob_match("current_generation", "current_generation"));
        assert!(!glob_match("current_generation", "current_generation2"));
    }

    #[test]
    fn test_glob_match_anchored_suffix() {
        assert!(glob_match("a*c", "abc"));
        assert!(glob_match("a*c", "ac"));
        assert!(!glob_match("a*c", "acb"));
    }

    #[tokio::test]
    async fn test_incr_accumulates() {
        let store = MemoryStore::new();
        store.incr_by_float("k", 10.0).await.unwrap();
        store.incr_by_float("k", 15.0).await.unwrap();

        let value = store.get("k").await.unwrap().unwrap();
        assert!((value.parse::<f64>().unwrap() - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_scan_pages_until_cursor_wraps() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store
                .incr_by_float(
                    &format!("generation:A:tenant:t{i:02}:sku:s:useUnit:KB"),
                    1.0,
                )
                .await
                .unwrap();
        }
        store.set("current_generation", "A").await.unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (keys, next) = store
                .scan("generation:A:tenant:*:sku:*:useUnit:*", cursor, 10)
                .await
                .unwrap();
            seen.extend(keys);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen.len(), 25);
    }

    #[tokio::test]
    async fn test_del_removes_all_given_keys() {
        let store = MemoryStore::new();
        store.incr_by_float("a", 1.0).await.unwrap();
        store.incr_by_float("b", 1.0).await.unwrap();
        store.del(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert!(store.dump().is_empty());
    }

    #[tokio::test]
    async fn test_armed_failures_consume_then_recover() {
        let store = MemoryStore::new();
        store.arm_failure("INCRBYFLOAT", 2);

        assert!(store.incr_by_float("k", 1.0).await.is_err());
        assert!(store.incr_by_float("k", 1.0).await.is_err());
        assert!(store.incr_by_float("k", 1.0).await.is_ok());
        assert_eq!(store.calls("INCRBYFLOAT"), 3);
    }
}
