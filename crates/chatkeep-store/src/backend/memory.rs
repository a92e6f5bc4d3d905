//! In-process [`DiskBackend`] used by tests.
//!
//! Data is kept as serialized JSON so a round trip goes through the same
//! encode/decode path as a real backend. Switches let tests make the
//! backend unavailable, fail writes, or slow down part reads.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{DiskBackend, ThreadLocation};
use crate::error::{StoreError, StoreResult};
use crate::message::{Message, messages_from_value};

type PartKey = (ThreadLocation, String);

#[derive(Default)]
struct MemoryState {
    indexes: HashMap<String, Value>,
    parts: BTreeMap<PartKey, Value>,
    kv: HashMap<String, Value>,
    raw_replies: HashMap<(String, String), String>,
}

/// Map-backed disk backend with failure injection.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    fail_writes: AtomicBool,
    fail_part_writes: AtomicBool,
    /// Calls that fail as unavailable before the backend "comes up".
    unavailable_calls: AtomicU32,
    read_delay_ms: AtomicU64,
    part_reads: AtomicUsize,
    part_writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `BackendUnavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next `calls` calls fail with `BackendUnavailable`.
    pub fn unavailable_for(&self, calls: u32) {
        self.unavailable_calls.store(calls, Ordering::SeqCst);
    }

    /// Writes and deletes fail with a backend error while set.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Only part writes fail while set; index and documents still save.
    pub fn set_fail_part_writes(&self, fail: bool) {
        self.fail_part_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay applied to every index and part read.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn part_reads(&self) -> usize {
        self.part_reads.load(Ordering::SeqCst)
    }

    pub fn part_writes(&self) -> usize {
        self.part_writes.load(Ordering::SeqCst)
    }

    /// Stored part ids of one thread, in key order.
    pub fn stored_part_ids(&self, location: &ThreadLocation) -> Vec<String> {
        self.with_state(|s| {
            s.parts
                .keys()
                .filter(|(loc, _)| loc == location)
                .map(|(_, pid)| pid.clone())
                .collect()
        })
    }

    /// Total number of stored parts across all scopes.
    pub fn part_count(&self) -> usize {
        self.with_state(|s| s.parts.len())
    }

    pub fn index_document(&self, scope: &str) -> Option<Value> {
        self.with_state(|s| s.indexes.get(scope).cloned())
    }

    pub fn kv_document(&self, name: &str) -> Option<Value> {
        self.with_state(|s| s.kv.get(name).cloned())
    }

    pub fn raw_reply_count(&self) -> usize {
        self.with_state(|s| s.raw_replies.len())
    }

    /// Seed a flat document directly, bypassing failure switches.
    pub fn seed_kv(&self, name: &str, data: Value) {
        self.with_state(|s| {
            s.kv.insert(name.to_string(), data);
        });
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::BackendUnavailable);
        }
        let pending = self.unavailable_calls.load(Ordering::SeqCst);
        if pending > 0 {
            self.unavailable_calls.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::BackendUnavailable);
        }
        Ok(())
    }

    fn check_writable(&self) -> StoreResult<()> {
        self.check_available()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".into()));
        }
        Ok(())
    }

    async fn read_delay(&self) {
        let ms = self.read_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl DiskBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read_index(&self, scope: &str) -> StoreResult<Option<Value>> {
        self.check_available()?;
        self.read_delay().await;
        Ok(self.with_state(|s| s.indexes.get(scope).cloned()))
    }

    async fn write_index(&self, scope: &str, data: &Value) -> StoreResult<()> {
        self.check_writable()?;
        self.with_state(|s| {
            s.indexes.insert(scope.to_string(), data.clone());
        });
        Ok(())
    }

    async fn read_part(
        &self,
        location: &ThreadLocation,
        part_id: &str,
    ) -> StoreResult<Option<Vec<Message>>> {
        self.check_available()?;
        self.read_delay().await;
        self.part_reads.fetch_add(1, Ordering::SeqCst);
        let key = (location.clone(), part_id.to_string());
        Ok(self
            .with_state(|s| s.parts.get(&key).cloned())
            .map(messages_from_value))
    }

    async fn write_part(
        &self,
        location: &ThreadLocation,
        part_id: &str,
        messages: &[Message],
    ) -> StoreResult<()> {
        self.check_writable()?;
        if self.fail_part_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected part write failure".into()));
        }
        let data = serde_json::to_value(messages)?;
        self.part_writes.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| {
            s.parts.insert((location.clone(), part_id.to_string()), data);
        });
        Ok(())
    }

    async fn delete_part(&self, location: &ThreadLocation, part_id: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.with_state(|s| {
            s.parts.remove(&(location.clone(), part_id.to_string()));
        });
        Ok(())
    }

    async fn delete_thread(&self, location: &ThreadLocation) -> StoreResult<()> {
        self.check_writable()?;
        self.with_state(|s| s.parts.retain(|(loc, _), _| loc != location));
        Ok(())
    }

    async fn delete_session(&self, scope: &str, session_dir: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.with_state(|s| {
            s.parts
                .retain(|(loc, _), _| !(loc.scope == scope && loc.session_dir == session_dir))
        });
        Ok(())
    }

    async fn save_kv(&self, name: &str, data: &Value) -> StoreResult<()> {
        self.check_writable()?;
        self.with_state(|s| {
            s.kv.insert(name.to_string(), data.clone());
        });
        Ok(())
    }

    async fn load_kv(&self, name: &str) -> StoreResult<Option<Value>> {
        self.check_available()?;
        Ok(self.with_state(|s| s.kv.get(name).cloned()))
    }

    async fn save_raw_reply(&self, session_id: &str, message_id: &str, text: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.with_state(|s| {
            s.raw_replies
                .insert((session_id.to_string(), message_id.to_string()), text.to_string());
        });
        Ok(())
    }

    async fn load_raw_reply(&self, session_id: &str, message_id: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        Ok(self.with_state(|s| {
            s.raw_replies
                .get(&(session_id.to_string(), message_id.to_string()))
                .cloned()
        }))
    }

    async fn delete_raw_reply(&self, session_id: &str, message_id: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.with_state(|s| {
            s.raw_replies
                .remove(&(session_id.to_string(), message_id.to_string()));
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> ThreadLocation {
        ThreadLocation::new("", "s_1", "t_1")
    }

    #[tokio::test]
    async fn part_round_trip_and_idempotent_delete() {
        let backend = MemoryBackend::new();
        let msgs = vec![Message::user("hi").with_id("a").with_timestamp(1)];
        backend.write_part(&loc(), "part_0001", &msgs).await.unwrap();

        let back = backend.read_part(&loc(), "part_0001").await.unwrap();
        assert_eq!(back, Some(msgs));
        assert_eq!(backend.read_part(&loc(), "part_0002").await.unwrap(), None);

        backend.delete_part(&loc(), "part_0001").await.unwrap();
        backend.delete_part(&loc(), "part_0001").await.unwrap();
        assert_eq!(backend.part_count(), 0);
    }

    #[tokio::test]
    async fn delete_session_only_touches_its_dir() {
        let backend = MemoryBackend::new();
        let other = ThreadLocation::new("", "s_2", "t_9");
        backend.write_part(&loc(), "part_0001", &[]).await.unwrap();
        backend.write_part(&other, "part_0001", &[]).await.unwrap();

        backend.delete_session("", "s_1").await.unwrap();
        assert!(backend.stored_part_ids(&loc()).is_empty());
        assert_eq!(backend.stored_part_ids(&other), vec!["part_0001"]);
    }

    #[tokio::test]
    async fn failure_switches() {
        let backend = MemoryBackend::new();
        backend.set_fail_writes(true);
        assert!(matches!(
            backend.save_kv("k", &Value::Null).await,
            Err(StoreError::Backend(_))
        ));
        // Reads still work.
        assert!(backend.load_kv("k").await.unwrap().is_none());

        backend.set_fail_writes(false);
        backend.unavailable_for(2);
        assert!(backend.load_kv("k").await.unwrap_err().is_unavailable());
        assert!(backend.load_kv("k").await.unwrap_err().is_unavailable());
        assert!(backend.load_kv("k").await.is_ok());
    }
}
