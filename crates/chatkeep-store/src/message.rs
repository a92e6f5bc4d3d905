//! Chat message model.
//!
//! A [`Message`] is the unit stored inside parts. Documents written by
//! older clients are loosely typed, so the list and timestamp helpers in
//! this module accept whatever shape they find and drop entries that
//! cannot be read instead of failing the whole document.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;

/// Max chars of content carried by a [`MessageSnapshot`].
pub const SNAPSHOT_CONTENT_CHARS: usize = 4000;

/// Current wall-clock time as Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(StoreError::InvalidArgument(format!("unknown role: {other}"))),
        }
    }
}

/// Pointer to an out-of-band raw reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReplyRef {
    pub session_id: String,
    pub message_id: String,
}

/// Free-form per-message metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    /// Assistant output meant for the rich renderer.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub render_rich: bool,
    /// Attachment or media url; may be an inline `data:` url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl MessageMeta {
    pub fn is_empty(&self) -> bool {
        !self.render_rich && self.url.is_none() && self.extra.is_empty()
    }

    /// Chars across every string value.
    pub fn string_chars(&self) -> usize {
        let url = self.url.as_deref().map_or(0, |u| u.chars().count());
        let extra: usize = self
            .extra
            .values()
            .filter_map(Value::as_str)
            .map(|s| s.chars().count())
            .sum();
        url + extra
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique within its session and archive.
    #[serde(default)]
    pub id: String,
    pub role: Role,
    #[serde(default, deserialize_with = "lenient_string")]
    pub content: String,
    /// Unix epoch milliseconds.
    #[serde(default, deserialize_with = "lenient_millis")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(default, alias = "raw_source", skip_serializing_if = "Option::is_none")]
    pub raw_source: Option<String>,
    /// Full provider output. Transient: persisted out-of-band only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_original: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_original_ref: Option<RawReplyRef>,
    /// Transient; resolved from contacts at render time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_default",
        skip_serializing_if = "MessageMeta::is_empty"
    )]
    pub meta: MessageMeta,
}

impl Message {
    /// A message with no id and no timestamp yet; see [`Message::ensure_id`].
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            role,
            content: content.into(),
            timestamp: 0,
            name: None,
            status: None,
            raw: None,
            raw_source: None,
            raw_original: None,
            raw_original_ref: None,
            avatar: None,
            meta: MessageMeta::default(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Assign a UUID v7 id and the current time where missing.
    pub fn ensure_id(&mut self) {
        if self.id.trim().is_empty() {
            self.id = Uuid::now_v7().to_string();
        }
        if self.timestamp <= 0 {
            self.timestamp = now_millis();
        }
    }

    /// Character weight used for part accounting.
    pub fn char_count(&self) -> usize {
        let mut total = self.content.chars().count();
        for s in [&self.raw, &self.raw_source].into_iter().flatten() {
            total += s.chars().count();
        }
        total + self.meta.string_chars()
    }

    /// Weight used by the per-session tail budget (content + raw).
    pub fn text_chars(&self) -> usize {
        self.content.chars().count() + self.raw.as_deref().map_or(0, |r| r.chars().count())
    }

    pub fn is_rich_assistant(&self) -> bool {
        self.role == Role::Assistant && self.meta.render_rich
    }

    pub fn has_raw_original(&self) -> bool {
        self.raw_original
            .as_deref()
            .is_some_and(|r| !r.trim().is_empty())
    }
}

/// Field-wise update for a stored message. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_original: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_original_ref: Option<RawReplyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MessageMeta>,
}

impl MessagePatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn raw_original(mut self, raw: impl Into<String>) -> Self {
        self.raw_original = Some(raw.into());
        self
    }

    /// A patch carrying every present field of `msg`.
    pub fn from_message(msg: &Message) -> Self {
        Self {
            content: Some(msg.content.clone()),
            timestamp: Some(msg.timestamp),
            name: msg.name.clone(),
            status: msg.status.clone(),
            raw: msg.raw.clone(),
            raw_source: msg.raw_source.clone(),
            raw_original: msg.raw_original.clone(),
            raw_original_ref: msg.raw_original_ref.clone(),
            meta: (!msg.meta.is_empty()).then(|| msg.meta.clone()),
        }
    }

    pub fn apply(&self, msg: &mut Message) {
        if let Some(content) = &self.content {
            msg.content = content.clone();
        }
        if let Some(ts) = self.timestamp {
            msg.timestamp = ts;
        }
        if let Some(name) = &self.name {
            msg.name = Some(name.clone());
        }
        if let Some(status) = &self.status {
            msg.status = Some(status.clone());
        }
        if let Some(raw) = &self.raw {
            msg.raw = Some(raw.clone());
        }
        if let Some(raw_source) = &self.raw_source {
            msg.raw_source = Some(raw_source.clone());
        }
        if let Some(raw_original) = &self.raw_original {
            msg.raw_original = Some(raw_original.clone());
        }
        if let Some(r) = &self.raw_original_ref {
            msg.raw_original_ref = Some(r.clone());
        }
        if let Some(meta) = &self.meta {
            msg.meta = meta.clone();
        }
    }
}

/// Bounded copy of a thread's newest message kept in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSnapshot {
    #[serde(default)]
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl From<&Message> for MessageSnapshot {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id.clone(),
            role: msg.role,
            content: msg.content.chars().take(SNAPSHOT_CONTENT_CHARS).collect(),
            timestamp: if msg.timestamp > 0 {
                msg.timestamp
            } else {
                now_millis()
            },
            name: msg.name.clone(),
            status: msg.status.clone(),
        }
    }
}

// ── summaries ────────────────────────────────────────────────────────

/// One rolling summary of earlier conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryItem {
    #[serde(default, deserialize_with = "lenient_millis")]
    pub at: i64,
    #[serde(default)]
    pub text: String,
}

impl SummaryItem {
    pub fn new(at: i64, text: impl Into<String>) -> Self {
        Self {
            at,
            text: text.into(),
        }
    }

    /// Identity used by bulk delete/update: `at|text`.
    pub fn key(&self) -> String {
        format!("{}|{}", self.at, self.text)
    }
}

/// Compacted summary replacing a long history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactedSummary {
    #[serde(default, deserialize_with = "lenient_millis")]
    pub at: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

/// Last raw model output that produced a compacted summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSnapshot {
    #[serde(default, deserialize_with = "lenient_millis")]
    pub at: i64,
    #[serde(default)]
    pub raw: String,
}

// ═══════════════════════════════════════════════════════════════════════
//  Lenient decoding
// ═══════════════════════════════════════════════════════════════════════

/// Decode a message array, dropping entries that do not parse.
pub fn messages_from_value(value: Value) -> Vec<Message> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<Message>(item) {
                Ok(msg) => Some(msg),
                Err(err) => {
                    warn!(%err, "dropping malformed message");
                    None
                }
            })
            .collect(),
        Value::Null => Vec::new(),
        other => {
            warn!(kind = value_kind(&other), "expected message array");
            Vec::new()
        }
    }
}

/// Decode a summary list. Bare strings are legacy items with `at = 0`;
/// blank items are dropped.
pub fn summaries_from_value(value: Value) -> Vec<SummaryItem> {
    let Value::Array(items) = value else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(text) => Some(SummaryItem::new(0, text)),
            Value::Object(_) => serde_json::from_value::<SummaryItem>(item).ok(),
            _ => None,
        })
        .filter_map(|mut item| {
            item.text = item.text.trim().to_string();
            (!item.text.is_empty()).then_some(item)
        })
        .collect()
}

pub(crate) fn lenient_messages<'de, D>(d: D) -> Result<Vec<Message>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(messages_from_value(Value::deserialize(d)?))
}

pub(crate) fn lenient_summaries<'de, D>(d: D) -> Result<Vec<SummaryItem>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(summaries_from_value(Value::deserialize(d)?))
}

/// `None` for anything that does not decode as `T`.
pub(crate) fn lenient_option<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(d)?;
    if value.is_null() {
        return Ok(None);
    }
    Ok(serde_json::from_value(value).ok())
}

/// `T::default()` for anything that does not decode as `T`.
pub(crate) fn lenient_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    Ok(serde_json::from_value(Value::deserialize(d)?).unwrap_or_default())
}

/// Integer, float or numeric string; anything else is 0.
pub(crate) fn lenient_millis<'de, D>(d: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(millis_from_value(&Value::deserialize(d)?))
}

pub(crate) fn lenient_string<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    })
}

fn millis_from_value(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(0),
        _ => 0,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
