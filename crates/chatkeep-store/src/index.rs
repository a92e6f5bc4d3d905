//! Session index: thread and part metadata for every sharded session.
//!
//! The index never embeds message bodies. It is rewritten as a whole after
//! every structural change, so it stays small: one [`Thread`] per session
//! plus one per archive, each listing its parts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::message::{Message, MessageSnapshot, lenient_millis, lenient_option};

/// Schema version written into every index document.
pub const INDEX_VERSION: u32 = 1;

/// Filesystem-safe unique directory key, e.g. `t_0190d6f2...`.
pub fn make_shard_key(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7().simple())
}

/// Format the `n`-th part id of a thread.
pub fn part_id(n: u32) -> String {
    format!("part_{n:04}")
}

/// Metadata of one stored part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMeta {
    pub id: String,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub chars: usize,
}

impl PartMeta {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            count: 0,
            chars: 0,
        }
    }
}

/// One ordered message sequence: a session's current conversation or an
/// archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub thread_dir: String,
    #[serde(default)]
    pub parts: Vec<PartMeta>,
    #[serde(default)]
    pub total: usize,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub last_message_at: i64,
    #[serde(default, deserialize_with = "lenient_option")]
    pub last_message: Option<MessageSnapshot>,
    /// Next part number to hand out. Never decreases while the thread's
    /// storage exists.
    #[serde(default)]
    pub next_part: u32,
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

impl Thread {
    pub fn new() -> Self {
        Self {
            thread_dir: make_shard_key("t"),
            parts: Vec::new(),
            total: 0,
            last_message_at: 0,
            last_message: None,
            next_part: 1,
        }
    }

    /// Repair fields older writers may have left unset.
    pub fn normalize(&mut self) {
        if self.thread_dir.trim().is_empty() {
            self.thread_dir = make_shard_key("t");
        }
        let highest = self
            .parts
            .iter()
            .filter_map(|p| p.id.strip_prefix("part_")?.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        if self.next_part <= highest {
            self.next_part = highest + 1;
        }
        if self.next_part == 0 {
            self.next_part = self.parts.len() as u32 + 1;
        }
    }

    /// Hand out the next part id.
    pub fn allocate_part_id(&mut self) -> String {
        let n = self.next_part.max(1);
        self.next_part = n + 1;
        part_id(n)
    }

    pub fn part_ids(&self) -> Vec<String> {
        self.parts.iter().map(|p| p.id.clone()).collect()
    }

    pub fn part(&self, id: &str) -> Option<&PartMeta> {
        self.parts.iter().find(|p| p.id == id)
    }

    pub fn part_mut(&mut self, id: &str) -> Option<&mut PartMeta> {
        self.parts.iter_mut().find(|p| p.id == id)
    }

    /// Sum of part counts; equals `total` when the thread is consistent.
    pub fn counted_messages(&self) -> usize {
        self.parts.iter().map(|p| p.count).sum()
    }

    pub fn set_last_message(&mut self, msg: Option<&Message>) {
        match msg {
            Some(msg) => {
                let snap = MessageSnapshot::from(msg);
                self.last_message_at = snap.timestamp;
                self.last_message = Some(snap);
            }
            None => {
                self.last_message = None;
                self.last_message_at = 0;
            }
        }
    }

    /// Forget every part, keeping the directory key.
    pub fn reset_counters(&mut self) {
        self.parts.clear();
        self.total = 0;
        self.last_message = None;
        self.last_message_at = 0;
        self.next_part = 1;
    }
}

/// Threads of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub dir: String,
    #[serde(default)]
    pub current: Thread,
    #[serde(default)]
    pub archives: BTreeMap<String, Thread>,
}

impl Default for SessionEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEntry {
    pub fn new() -> Self {
        Self {
            dir: make_shard_key("s"),
            current: Thread::new(),
            archives: BTreeMap::new(),
        }
    }

    pub fn normalize(&mut self) {
        if self.dir.trim().is_empty() {
            self.dir = make_shard_key("s");
        }
        self.current.normalize();
        for thread in self.archives.values_mut() {
            thread.normalize();
        }
    }

    /// `""` addresses the current thread.
    pub fn thread(&self, archive_id: &str) -> Option<&Thread> {
        if archive_id.is_empty() {
            Some(&self.current)
        } else {
            self.archives.get(archive_id)
        }
    }

    /// Like [`SessionEntry::thread`] but creates a missing archive thread.
    pub fn thread_mut(&mut self, archive_id: &str) -> &mut Thread {
        if archive_id.is_empty() {
            &mut self.current
        } else {
            self.archives.entry(archive_id.to_string()).or_default()
        }
    }
}

/// The per-scope index document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionIndex {
    pub version: u32,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionEntry>,
}

impl Default for SessionIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            sessions: BTreeMap::new(),
        }
    }
}

impl SessionIndex {
    /// Decode a stored index; unreadable session entries are dropped.
    pub fn from_value(value: Value) -> Self {
        let mut index = Self::default();
        let Some(Value::Object(sessions)) = value.get("sessions").cloned() else {
            return index;
        };
        for (sid, raw) in sessions {
            match serde_json::from_value::<SessionEntry>(raw) {
                Ok(mut entry) => {
                    entry.normalize();
                    index.sessions.insert(sid, entry);
                }
                Err(err) => warn!(session_id = %sid, %err, "dropping unreadable index entry"),
            }
        }
        index
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Get or lazily create the entry of `session_id`.
    pub fn ensure_session(&mut self, session_id: &str) -> &mut SessionEntry {
        self.sessions.entry(session_id.to_string()).or_default()
    }

    pub fn session(&self, session_id: &str) -> Option<&SessionEntry> {
        self.sessions.get(session_id)
    }

    /// Read path: never creates anything.
    pub fn get_thread(&self, session_id: &str, archive_id: &str) -> Option<&Thread> {
        self.sessions.get(session_id)?.thread(archive_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn part_ids_are_zero_padded() {
        let mut thread = Thread::new();
        assert_eq!(thread.allocate_part_id(), "part_0001");
        assert_eq!(thread.allocate_part_id(), "part_0002");
        assert_eq!(thread.next_part, 3);
    }

    #[test]
    fn shard_keys_are_prefixed_and_safe() {
        let key = make_shard_key("s");
        assert!(key.starts_with("s_"));
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        assert_ne!(key, make_shard_key("s"));
    }

    #[test]
    fn normalize_never_lets_next_part_reuse_an_id() {
        let mut thread = Thread::new();
        thread.parts = vec![PartMeta::new("part_0003"), PartMeta::new("part_0007")];
        thread.next_part = 0;
        thread.normalize();
        assert_eq!(thread.next_part, 8);
    }

    #[test]
    fn get_thread_does_not_create() {
        let mut index = SessionIndex::default();
        assert!(index.get_thread("s", "").is_none());
        index.ensure_session("s");
        assert!(index.get_thread("s", "").is_some());
        assert!(index.get_thread("s", "arc").is_none());
        assert_eq!(index.sessions.len(), 1);
    }

    #[test]
    fn index_document_uses_camel_case() {
        let mut index = SessionIndex::default();
        let entry = index.ensure_session("s");
        entry.current.set_last_message(Some(
            &Message::user("hi").with_id("m").with_timestamp(5),
        ));
        let value = index.to_value();
        let current = &value["sessions"]["s"]["current"];
        assert_eq!(current["lastMessageAt"], json!(5));
        assert_eq!(current["nextPart"], json!(1));
        assert!(current["threadDir"].as_str().unwrap().starts_with("t_"));
    }

    #[test]
    fn unreadable_entries_are_dropped() {
        let index = SessionIndex::from_value(json!({
            "version": 1,
            "sessions": {
                "good": {"dir": "s_a", "current": {"threadDir": "t_a", "parts": [], "total": 0}},
                "bad": 17
            }
        }));
        assert!(index.session("good").is_some());
        assert!(index.session("bad").is_none());
        assert_eq!(index.get_thread("good", "").unwrap().next_part, 1);
    }
}
