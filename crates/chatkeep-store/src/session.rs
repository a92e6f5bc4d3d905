//! Flat chat document: every session field that is not a sharded message.
//!
//! This is the shape persisted through `save_kv` and the fast cache. Older
//! documents also embed full message arrays here (per session and per
//! archive); once a scope is sharded those arrays only carry the in-memory
//! window and are written out empty.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::config::SessionDefaults;
use crate::message::{
    lenient_default, lenient_messages, lenient_millis, lenient_option, lenient_string,
    lenient_summaries, CompactedSummary, Message, RawSnapshot, SummaryItem,
};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// The whole flat document for one scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatState {
    #[serde(deserialize_with = "lenient_default")]
    pub sessions: BTreeMap<String, SessionState>,
    #[serde(deserialize_with = "lenient_string")]
    pub current_id: String,
    /// Scope the document was written under; empty for legacy documents.
    #[serde(deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub scope_id: String,
}

impl ChatState {
    /// Legacy documents without a scope marker match every scope.
    pub fn matches_scope(&self, scope_id: &str) -> bool {
        let stored = self.scope_id.trim();
        stored.is_empty() || stored == scope_id.trim()
    }

    /// Keep `current_id` if it names a session, else pick the first one.
    pub fn resolve_current_id(&mut self) {
        let raw = self.current_id.trim();
        if !raw.is_empty() && self.sessions.contains_key(raw) {
            self.current_id = raw.to_string();
            return;
        }
        self.current_id = self.sessions.keys().next().cloned().unwrap_or_default();
    }

    /// Decode a stored document. `None` when it is not a chat document.
    pub fn from_value(value: Value) -> Option<Self> {
        if !value.get("sessions").is_some_and(Value::is_object) {
            return None;
        }
        serde_json::from_value(value).ok()
    }
}

/// Per-session fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionState {
    /// Legacy: the full current thread. Sharded: the loaded window only.
    #[serde(deserialize_with = "lenient_messages")]
    pub messages: Vec<Message>,
    #[serde(deserialize_with = "lenient_string")]
    pub draft: String,
    /// Composed but not yet sent.
    #[serde(deserialize_with = "lenient_messages")]
    pub pending: Vec<Message>,
    #[serde(deserialize_with = "lenient_default")]
    pub variables: BTreeMap<String, Value>,
    #[serde(deserialize_with = "lenient_default")]
    pub settings: SessionSettings,
    /// Summaries of the detached (non-archive) thread.
    #[serde(deserialize_with = "lenient_summaries")]
    pub detached_summaries: Vec<SummaryItem>,
    #[serde(deserialize_with = "lenient_option")]
    pub compacted_summary: Option<CompactedSummary>,
    #[serde(deserialize_with = "lenient_option")]
    pub compacted_summary_last_raw: Option<RawSnapshot>,
    #[serde(deserialize_with = "lenient_string")]
    pub last_read_message_id: String,
    /// `None` in documents that predate read tracking.
    #[serde(deserialize_with = "lenient_option")]
    pub last_read_at: Option<i64>,
    #[serde(deserialize_with = "lenient_default")]
    pub unread_count: u32,
    #[serde(deserialize_with = "lenient_vec")]
    pub archives: Vec<Archive>,
    /// Live archive pointer: the archive whose thread is currently open.
    #[serde(deserialize_with = "lenient_option")]
    pub current_archive_id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub last_raw_response: String,
    #[serde(deserialize_with = "lenient_millis")]
    pub last_raw_at: i64,
}

impl SessionState {
    pub fn new(defaults: &SessionDefaults) -> Self {
        Self {
            settings: SessionSettings {
                bubble_color: Some(defaults.bubble_color.clone()),
                text_color: Some(defaults.text_color.clone()),
                ..SessionSettings::default()
            },
            last_read_at: Some(0),
            ..Self::default()
        }
    }

    /// The live archive id, if set and non-blank.
    pub fn live_archive_id(&self) -> Option<&str> {
        self.current_archive_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Thread key of the open thread: the live archive id or `""`.
    pub fn open_archive_key(&self) -> String {
        self.live_archive_id().unwrap_or_default().to_string()
    }

    pub fn archive(&self, id: &str) -> Option<&Archive> {
        self.archives.iter().find(|a| a.id == id)
    }

    pub fn archive_mut(&mut self, id: &str) -> Option<&mut Archive> {
        self.archives.iter_mut().find(|a| a.id == id)
    }

    /// The live archive record, if the pointer resolves.
    pub fn live_archive_mut(&mut self) -> Option<&mut Archive> {
        let id = self.live_archive_id()?.to_string();
        self.archive_mut(&id)
    }

    pub fn live_archive(&self) -> Option<&Archive> {
        self.archive(self.live_archive_id()?)
    }

    pub fn find_message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Whether the legacy document still holds message bodies.
    pub fn has_embedded_messages(&self) -> bool {
        !self.messages.is_empty() || self.archives.iter().any(|a| !a.messages.is_empty())
    }
}

/// Frozen snapshot record of an archived conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Archive {
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub timestamp: i64,
    #[serde(default, deserialize_with = "lenient_default")]
    pub message_count: usize,
    #[serde(default, deserialize_with = "lenient_summaries")]
    pub summaries: Vec<SummaryItem>,
    #[serde(default, deserialize_with = "lenient_option")]
    pub compacted_summary: Option<CompactedSummary>,
    #[serde(default, deserialize_with = "lenient_option")]
    pub compacted_summary_last_raw: Option<RawSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_table_snapshot: Option<Value>,
    /// Embedded messages of legacy documents; stripped by migration.
    #[serde(
        default,
        deserialize_with = "lenient_messages",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub messages: Vec<Message>,
}

/// Per-session presentation settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bubble_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_lock_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub wallpaper: Option<Wallpaper>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallpaper {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub data_url: String,
    /// On-disk copy; when present the url can always be rebuilt.
    #[serde(default)]
    pub path: String,
    /// Picked for preview only, never meant to be persisted inline.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transient: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Decode an array, dropping entries that do not parse.
fn lenient_vec<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let Value::Array(items) = Value::deserialize(d)? else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legacy_document_decodes_leniently() {
        let doc = json!({
            "currentId": "missing",
            "sessions": {
                "alice": {
                    "messages": [{"id": "m1", "role": "user", "content": "hi", "timestamp": 1}],
                    "detachedSummaries": ["old style"],
                    "compactedSummary": "not an object",
                    "unreadCount": "NaN",
                    "archives": [
                        {"id": "a1", "name": "first", "timestamp": 5,
                         "messages": [{"id": "x", "role": "assistant", "content": "yo"}]},
                        {"name": "no id"}
                    ],
                    "currentArchiveId": null
                }
            }
        });
        let mut state = ChatState::from_value(doc).unwrap();
        state.resolve_current_id();
        assert_eq!(state.current_id, "alice");

        let session = &state.sessions["alice"];
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.detached_summaries[0].text, "old style");
        assert!(session.compacted_summary.is_none());
        assert_eq!(session.unread_count, 0);
        assert_eq!(session.archives.len(), 1);
        assert!(session.last_read_at.is_none());
        assert!(session.has_embedded_messages());
    }

    #[test]
    fn non_chat_documents_are_rejected() {
        assert!(ChatState::from_value(json!({"foo": 1})).is_none());
        assert!(ChatState::from_value(json!(null)).is_none());
    }

    #[test]
    fn scope_match_treats_unscoped_as_legacy() {
        let mut state = ChatState::default();
        assert!(state.matches_scope("work"));
        state.scope_id = "work".into();
        assert!(state.matches_scope("work"));
        assert!(!state.matches_scope("home"));
    }

    #[test]
    fn live_archive_pointer_ignores_blank_ids() {
        let mut session = SessionState::new(&SessionDefaults::default());
        session.current_archive_id = Some("  ".into());
        assert_eq!(session.live_archive_id(), None);
        assert_eq!(session.open_archive_key(), "");
        session.current_archive_id = Some("a1".into());
        assert_eq!(session.open_archive_key(), "a1");
        assert!(session.live_archive().is_none());
    }

    #[test]
    fn settings_keep_unknown_keys() {
        let settings: SessionSettings =
            serde_json::from_value(json!({"bubbleColor": "#fff", "fontSize": 14})).unwrap();
        assert_eq!(settings.bubble_color.as_deref(), Some("#fff"));
        assert_eq!(settings.extra["fontSize"], json!(14));
        let back = serde_json::to_value(&settings).unwrap();
        assert_eq!(back["fontSize"], json!(14));
    }
}
