//! Bounding applied at the persistence boundary.
//!
//! Nothing here touches in-memory state: every function takes a borrowed
//! value and returns a trimmed copy fit for disk or the fast cache.

use crate::config::SanitizeLimits;
use crate::message::{CompactedSummary, Message, RawSnapshot, SummaryItem};
use crate::session::{Archive, ChatState, SessionState, SessionSettings};

/// Replacement for inline binaries that are too large to keep.
pub const BINARY_OMITTED: &str = "[binary omitted]";

const ELLIPSIS: char = '…';

/// Clamp `value` to `max` chars, marking a cut with a trailing `…`.
pub fn clamp_string(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        None => value.to_string(),
        Some((cut, _)) => {
            let mut out = String::with_capacity(cut + ELLIPSIS.len_utf8());
            out.push_str(&value[..cut]);
            out.push(ELLIPSIS);
            out
        }
    }
}

fn is_oversized_data_url(value: &str, limits: &SanitizeLimits) -> bool {
    value.starts_with("data:") && value.chars().count() > limits.max_data_url_chars
}

/// Bounded copy of one message; transient fields dropped.
pub fn sanitize_message(msg: &Message, limits: &SanitizeLimits) -> Message {
    let mut out = msg.clone();
    out.avatar = None;
    out.raw_original = None;

    if is_oversized_data_url(&out.content, limits) {
        out.content = BINARY_OMITTED.to_string();
    }
    out.content = clamp_string(&out.content, limits.max_string_chars);
    if let Some(raw) = out.raw.as_deref() {
        out.raw = Some(clamp_string(raw, limits.max_string_chars));
    }
    if let Some(source) = out.raw_source.as_deref() {
        out.raw_source = Some(clamp_string(source, limits.max_raw_source_chars));
    }

    if let Some(url) = out.meta.url.as_deref() {
        let url = if is_oversized_data_url(url, limits) {
            BINARY_OMITTED.to_string()
        } else {
            clamp_string(url, limits.max_meta_string_chars)
        };
        out.meta.url = Some(url);
    }
    for value in out.meta.extra.values_mut() {
        if let Some(s) = value.as_str() {
            *value = clamp_string(s, limits.max_meta_string_chars).into();
        }
    }
    out
}

/// Walk from the newest item, keeping at most `max_items` and stopping
/// before the running weight exceeds `max_chars`. Never returns an empty
/// list for non-empty input (when `max_items > 0`).
pub fn slice_tail_within_chars<T, F>(items: &[T], weight: F, max_items: usize, max_chars: usize) -> Vec<T>
where
    T: Clone,
    F: Fn(&T) -> usize,
{
    let mut total = 0usize;
    let mut picked: Vec<T> = Vec::new();
    for item in items.iter().rev() {
        if picked.len() >= max_items {
            break;
        }
        let len = weight(item);
        if total + len > max_chars && !picked.is_empty() {
            break;
        }
        total += len;
        picked.push(item.clone());
    }
    picked.reverse();
    picked
}

fn sanitize_message_list(
    messages: &[Message],
    max_items: usize,
    limits: &SanitizeLimits,
) -> Vec<Message> {
    let sanitized: Vec<Message> = messages
        .iter()
        .map(|m| sanitize_message(m, limits))
        .collect();
    slice_tail_within_chars(
        &sanitized,
        Message::text_chars,
        max_items,
        limits.max_session_text_chars,
    )
}

fn sanitize_summaries(items: &[SummaryItem], limits: &SanitizeLimits) -> Vec<SummaryItem> {
    let kept: Vec<SummaryItem> = items
        .iter()
        .filter_map(|it| {
            let text = it.text.trim();
            (!text.is_empty()).then(|| SummaryItem::new(it.at, clamp_string(text, limits.max_summary_chars)))
        })
        .collect();
    let skip = kept.len().saturating_sub(limits.max_summaries);
    kept.into_iter().skip(skip).collect()
}

fn sanitize_compacted(cs: Option<&CompactedSummary>, limits: &SanitizeLimits) -> Option<CompactedSummary> {
    let cs = cs?;
    let text = cs.text.trim();
    if text.is_empty() {
        return None;
    }
    Some(CompactedSummary {
        at: cs.at,
        text: clamp_string(text, limits.max_compacted_text_chars),
        raw: cs
            .raw
            .as_deref()
            .map(|r| clamp_string(r, limits.max_compacted_raw_chars)),
    })
}

fn sanitize_raw_snapshot(snap: Option<&RawSnapshot>, limits: &SanitizeLimits) -> Option<RawSnapshot> {
    let snap = snap?;
    let raw = snap.raw.trim();
    (!raw.is_empty()).then(|| RawSnapshot {
        at: snap.at,
        raw: clamp_string(raw, limits.max_compacted_raw_chars),
    })
}

fn sanitize_archive(arc: &Archive, skip_messages: bool, limits: &SanitizeLimits) -> Archive {
    Archive {
        messages: if skip_messages {
            Vec::new()
        } else {
            sanitize_message_list(&arc.messages, limits.max_archive_messages, limits)
        },
        summaries: sanitize_summaries(&arc.summaries, limits),
        compacted_summary: sanitize_compacted(arc.compacted_summary.as_ref(), limits),
        compacted_summary_last_raw: sanitize_raw_snapshot(arc.compacted_summary_last_raw.as_ref(), limits),
        ..arc.clone()
    }
}

fn sanitize_settings(settings: &SessionSettings, limits: &SanitizeLimits) -> SessionSettings {
    let mut out = settings.clone();
    if let Some(wallpaper) = out.wallpaper.as_mut() {
        let has_path = !wallpaper.path.trim().is_empty();
        let oversized = wallpaper.url.starts_with("data:")
            && wallpaper.url.chars().count() > limits.max_wallpaper_data_url_chars;
        if !has_path && (wallpaper.transient || oversized) {
            wallpaper.url.clear();
            wallpaper.data_url.clear();
        }
    }
    out
}

/// Bounded copy of one session. With `skip_messages` every message array
/// is written empty (the sharded store owns them).
pub fn sanitize_session(session: &SessionState, skip_messages: bool, limits: &SanitizeLimits) -> SessionState {
    let messages = if skip_messages {
        Vec::new()
    } else {
        sanitize_message_list(&session.messages, limits.max_session_messages, limits)
    };

    let mut last_read_message_id = session.last_read_message_id.clone();
    if !skip_messages
        && !last_read_message_id.is_empty()
        && !messages.iter().any(|m| m.id == last_read_message_id)
    {
        last_read_message_id = messages.last().map(|m| m.id.clone()).unwrap_or_default();
    }

    let skip = session.archives.len().saturating_sub(limits.max_archives);
    let archives = session
        .archives
        .iter()
        .skip(skip)
        .map(|a| sanitize_archive(a, skip_messages, limits))
        .collect();

    SessionState {
        messages,
        draft: clamp_string(&session.draft, limits.max_draft_chars),
        pending: session.pending.iter().map(|m| sanitize_message(m, limits)).collect(),
        variables: session.variables.clone(),
        settings: sanitize_settings(&session.settings, limits),
        detached_summaries: sanitize_summaries(&session.detached_summaries, limits),
        compacted_summary: sanitize_compacted(session.compacted_summary.as_ref(), limits),
        compacted_summary_last_raw: sanitize_raw_snapshot(session.compacted_summary_last_raw.as_ref(), limits),
        last_read_message_id,
        last_read_at: session.last_read_at,
        unread_count: session.unread_count,
        archives,
        current_archive_id: session.current_archive_id.clone(),
        last_raw_response: session.last_raw_response.clone(),
        last_raw_at: session.last_raw_at,
    }
}

/// Bounded copy of the whole document.
pub fn sanitize_state(state: &ChatState, skip_messages: bool, limits: &SanitizeLimits) -> ChatState {
    ChatState {
        sessions: state
            .sessions
            .iter()
            .map(|(sid, s)| (sid.clone(), sanitize_session(s, skip_messages, limits)))
            .collect(),
        current_id: state.current_id.clone(),
        scope_id: state.scope_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use crate::session::Wallpaper;

    fn limits() -> SanitizeLimits {
        SanitizeLimits::default()
    }

    fn msg(id: &str, content: &str) -> Message {
        Message::new(Role::User, content).with_id(id).with_timestamp(1)
    }

    #[test]
    fn clamp_appends_ellipsis_only_when_cut() {
        assert_eq!(clamp_string("hello", 5), "hello");
        assert_eq!(clamp_string("hello", 3), "hel…");
        assert_eq!(clamp_string("héllo", 2), "hé…");
        assert_eq!(clamp_string("", 0), "");
    }

    #[test]
    fn message_drops_transient_fields_and_binaries() {
        let mut m = msg("m", &format!("data:image/png;base64,{}", "A".repeat(5000)));
        m.avatar = Some("data:...".into());
        m.raw_original = Some("full".into());
        m.meta.url = Some(format!("data:audio/ogg;base64,{}", "B".repeat(5000)));
        m.meta.extra.insert("note".into(), "x".repeat(50_000).into());

        let out = sanitize_message(&m, &limits());
        assert_eq!(out.content, BINARY_OMITTED);
        assert!(out.avatar.is_none());
        assert!(out.raw_original.is_none());
        assert_eq!(out.meta.url.as_deref(), Some(BINARY_OMITTED));
        assert_eq!(out.meta.extra["note"].as_str().unwrap().chars().count(), 40_001);
    }

    #[test]
    fn raw_source_has_its_own_bound() {
        let mut m = msg("m", "ok");
        m.raw_source = Some("s".repeat(300_000));
        m.raw = Some("r".repeat(200_000));
        let out = sanitize_message(&m, &limits());
        assert_eq!(out.raw_source.unwrap().chars().count(), 300_000);
        assert_eq!(out.raw.unwrap().chars().count(), 180_001);
    }

    #[test]
    fn tail_slice_keeps_newest_and_at_least_one() {
        let items = vec![5usize, 5, 5, 5];
        assert_eq!(slice_tail_within_chars(&items, |n| *n, 10, 12), vec![5, 5]);
        assert_eq!(slice_tail_within_chars(&items, |n| *n, 3, 100), vec![5, 5, 5]);
        // A single oversized item is still kept.
        assert_eq!(slice_tail_within_chars(&[50usize], |n| *n, 10, 12), vec![50]);
    }

    #[test]
    fn session_caps_messages_and_repairs_read_pointer() {
        let mut session = SessionState::default();
        session.messages = (0..450).map(|i| msg(&format!("m{i}"), "hi")).collect();
        session.last_read_message_id = "m3".into();

        let out = sanitize_session(&session, false, &limits());
        assert_eq!(out.messages.len(), 400);
        assert_eq!(out.messages[0].id, "m50");
        assert_eq!(out.last_read_message_id, "m449");
    }

    #[test]
    fn skip_messages_empties_every_list() {
        let mut session = SessionState::default();
        session.messages = vec![msg("a", "1")];
        session.last_read_message_id = "gone".into();
        session.archives.push(Archive {
            id: "arc".into(),
            name: "n".into(),
            timestamp: 1,
            message_count: 1,
            summaries: vec![],
            compacted_summary: None,
            compacted_summary_last_raw: None,
            memory_table_snapshot: None,
            messages: vec![msg("b", "2")],
        });

        let out = sanitize_session(&session, true, &limits());
        assert!(out.messages.is_empty());
        assert!(out.archives[0].messages.is_empty());
        // The read pointer is left alone when bodies are not persisted.
        assert_eq!(out.last_read_message_id, "gone");
    }

    #[test]
    fn summaries_are_trimmed_and_capped() {
        let mut session = SessionState::default();
        session.detached_summaries = (0..130)
            .map(|i| SummaryItem::new(i, format!(" s{i} ")))
            .chain(std::iter::once(SummaryItem::new(999, "   ")))
            .collect();
        session.compacted_summary = Some(CompactedSummary {
            at: 1,
            text: "   ".into(),
            raw: None,
        });

        let out = sanitize_session(&session, false, &limits());
        assert_eq!(out.detached_summaries.len(), 120);
        assert_eq!(out.detached_summaries[0].text, "s10");
        assert!(out.compacted_summary.is_none());
    }

    #[test]
    fn archives_are_capped_at_six() {
        let mut session = SessionState::default();
        session.archives = (0..8)
            .map(|i| Archive {
                id: format!("a{i}"),
                name: String::new(),
                timestamp: i,
                message_count: 0,
                summaries: vec![],
                compacted_summary: None,
                compacted_summary_last_raw: None,
                memory_table_snapshot: None,
                messages: vec![],
            })
            .collect();
        let out = sanitize_session(&session, false, &limits());
        assert_eq!(out.archives.len(), 6);
        assert_eq!(out.archives[0].id, "a0");
    }

    #[test]
    fn oversized_wallpaper_without_path_is_blanked() {
        let mut session = SessionState::default();
        session.settings.wallpaper = Some(Wallpaper {
            url: format!("data:image/jpeg;base64,{}", "C".repeat(200_001)),
            data_url: "data:...".into(),
            ..Wallpaper::default()
        });
        let out = sanitize_session(&session, false, &limits());
        let wp = out.settings.wallpaper.unwrap();
        assert!(wp.url.is_empty());
        assert!(wp.data_url.is_empty());

        session.settings.wallpaper = Some(Wallpaper {
            url: "data:small".into(),
            path: "/wallpapers/a.jpg".into(),
            transient: true,
            ..Wallpaper::default()
        });
        let out = sanitize_session(&session, false, &limits());
        assert_eq!(out.settings.wallpaper.unwrap().url, "data:small");
    }

    #[test]
    fn draft_is_clamped() {
        let mut session = SessionState::default();
        session.draft = "d".repeat(25_000);
        let out = sanitize_session(&session, false, &limits());
        assert_eq!(out.draft.chars().count(), 20_001);
    }
}
