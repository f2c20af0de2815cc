use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

pub const MIN_ROOM_NAME_LEN: usize = 3;
pub const MAX_ROOM_NAME_LEN: usize = 50;
pub const MAX_ROOM_DESCRIPTION_LEN: usize = 200;
pub const MAX_MESSAGE_LEN: usize = 2000;

/// Number of most recent messages returned by a fetch without a watermark.
pub const FULL_FETCH_LIMIT: usize = 50;

pub const DELETED_MESSAGE_PLACEHOLDER: &str = "[Message deleted]";
pub const DELETED_PARENT_PLACEHOLDER: &str = "[Deleted message]";

/// Client-generated placeholder id for an entry the backend has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TempId(u64);

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmp-{}", self.0)
    }
}

/// Monotonic source of [`TempId`]s. Never hands out the same id twice.
#[derive(Debug, Default)]
pub struct TempIds {
    last: AtomicU64,
}

impl TempIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> TempId {
        TempId(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Identity of a room or message as seen by the client: either the durable id
/// issued by the backend, or a temporary id while the write is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryId {
    Confirmed(String),
    Pending(TempId),
}

impl EntryId {
    pub fn durable(&self) -> Option<&str> {
        match self {
            EntryId::Confirmed(id) => Some(id),
            EntryId::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, EntryId::Pending(_))
    }

    pub fn is_durable(&self, id: &str) -> bool {
        self.durable() == Some(id)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryId::Confirmed(id) => f.write_str(id),
            EntryId::Pending(temp) => write!(f, "{}", temp),
        }
    }
}

// -----------------------------------------------------------------------------
// Rooms
// -----------------------------------------------------------------------------

/// Room row as returned by the backend. `member_count` and `last_message_at`
/// are only present when the listing came from the aggregate call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub member_count: i64,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    pub id: EntryId,
    pub name: String,
    pub description: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub member_count: u32,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Room {
    /// Optimistic entry shown while a create call is in flight. The creator is
    /// assumed to be the only member.
    pub fn pending(
        temp_id: TempId,
        name: impl Into<String>,
        description: Option<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: EntryId::Pending(temp_id),
            name: name.into(),
            description,
            created_by: created_by.into(),
            created_at: Utc::now(),
            member_count: 1,
            last_activity_at: None,
        }
    }
}

impl From<RoomRecord> for Room {
    fn from(record: RoomRecord) -> Self {
        Self {
            id: EntryId::Confirmed(record.id),
            name: record.name,
            description: record.description,
            created_by: record.created_by,
            created_at: record.created_at,
            member_count: u32::try_from(record.member_count.max(0)).unwrap_or(u32::MAX),
            last_activity_at: record.last_message_at,
        }
    }
}

/// Trims and checks a room name and description, returning the values to submit.
pub fn validate_room(name: &str, description: Option<&str>) -> Result<(String, Option<String>), String> {
    let name = name.trim();
    let name_len = name.chars().count();
    if name_len == 0 {
        return Err("Room name is required".to_string());
    }
    if name_len < MIN_ROOM_NAME_LEN {
        return Err(format!("Name must be at least {} characters", MIN_ROOM_NAME_LEN));
    }
    if name_len > MAX_ROOM_NAME_LEN {
        return Err(format!("Name must be max {} characters", MAX_ROOM_NAME_LEN));
    }

    let description = description.map(str::trim).filter(|d| !d.is_empty());
    if let Some(d) = description {
        if d.chars().count() > MAX_ROOM_DESCRIPTION_LEN {
            return Err(format!(
                "Description must be max {} characters",
                MAX_ROOM_DESCRIPTION_LEN
            ));
        }
    }

    Ok((name.to_string(), description.map(str::to_string)))
}

// -----------------------------------------------------------------------------
// Messages
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Emoji,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Emoji => "emoji",
        }
    }

    /// A message made only of non-ASCII symbols (no letters or digits) is an emoji message.
    pub fn infer(content: &str) -> Self {
        let mut symbols = content.chars().filter(|c| !c.is_whitespace()).peekable();
        if symbols.peek().is_none() {
            return MessageKind::Text;
        }
        if symbols.all(|c| !c.is_ascii() && !c.is_alphanumeric()) {
            MessageKind::Emoji
        } else {
            MessageKind::Text
        }
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "emoji" => Ok(MessageKind::Emoji),
            other => Err(format!("unknown message kind: {}", other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-only delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Failed,
}

/// Message row as stored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    pub parent_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Denormalized view of the message being replied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPreview {
    pub author_id: String,
    /// `None` when the parent was soft-deleted.
    pub content: Option<String>,
}

impl ReplyPreview {
    pub fn of(parent: &Message) -> Self {
        Self {
            author_id: parent.author_id.clone(),
            content: (!parent.is_deleted()).then(|| parent.content.clone()),
        }
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or(DELETED_PARENT_PLACEHOLDER)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: EntryId,
    pub room_id: String,
    pub author_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub status: DeliveryStatus,
    pub temp_id: Option<TempId>,
    pub reply: Option<ReplyPreview>,
}

impl Message {
    /// Optimistic entry appended before the create call resolves.
    pub fn pending(
        temp_id: TempId,
        room_id: impl Into<String>,
        author_id: impl Into<String>,
        content: impl Into<String>,
        kind: MessageKind,
        parent: Option<&Message>,
    ) -> Self {
        Self {
            id: EntryId::Pending(temp_id),
            room_id: room_id.into(),
            author_id: author_id.into(),
            content: content.into(),
            kind,
            parent_id: parent.and_then(|p| p.durable_id()).map(str::to_string),
            created_at: Utc::now(),
            deleted_at: None,
            status: DeliveryStatus::Sending,
            temp_id: Some(temp_id),
            reply: parent.map(ReplyPreview::of),
        }
    }

    pub fn durable_id(&self) -> Option<&str> {
        self.id.durable()
    }

    pub fn matches_temp(&self, temp_id: TempId) -> bool {
        self.id == EntryId::Pending(temp_id) || self.temp_id == Some(temp_id)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Text to show for this message; soft-deleted content is never shown.
    pub fn display_content(&self) -> &str {
        if self.is_deleted() {
            DELETED_MESSAGE_PLACEHOLDER
        } else {
            &self.content
        }
    }
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        Self {
            id: EntryId::Confirmed(record.id),
            room_id: record.room_id,
            author_id: record.user_id,
            content: record.content,
            kind: record.kind,
            parent_id: record.parent_message_id,
            created_at: record.created_at,
            deleted_at: record.deleted_at,
            status: DeliveryStatus::Sent,
            temp_id: None,
            reply: None,
        }
    }
}

/// Converts one fetched batch into messages, resolving reply previews against
/// the same batch only. Parents outside the batch get no preview.
pub fn resolve_batch(records: Vec<MessageRecord>) -> Vec<Message> {
    let parents: HashMap<String, ReplyPreview> = records
        .iter()
        .map(|r| {
            (
                r.id.clone(),
                ReplyPreview {
                    author_id: r.user_id.clone(),
                    content: r.deleted_at.is_none().then(|| r.content.clone()),
                },
            )
        })
        .collect();

    records
        .into_iter()
        .map(|record| {
            let reply = record
                .parent_message_id
                .as_ref()
                .and_then(|parent| parents.get(parent).cloned());
            Message {
                reply,
                ..Message::from(record)
            }
        })
        .collect()
}

// -----------------------------------------------------------------------------
// Likes
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Like {
    pub message_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn record(id: &str, parent: Option<&str>, deleted: bool) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            room_id: "room".to_string(),
            user_id: format!("author-{}", id),
            content: format!("content {}", id),
            kind: MessageKind::Text,
            parent_message_id: parent.map(str::to_string),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            deleted_at: deleted.then(Utc::now),
        }
    }

    #[test]
    fn temp_ids_are_distinct_and_increasing() {
        let ids = TempIds::new();
        let a = ids.next();
        let b = ids.next();
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(a.to_string(), "tmp-1");
    }

    #[test]
    fn pending_and_confirmed_ids_never_compare_equal() {
        let temp = TempIds::new().next();
        let pending = EntryId::Pending(temp);
        let confirmed = EntryId::Confirmed(temp.to_string());
        assert_ne!(pending, confirmed);
        assert_eq!(pending.durable(), None);
        assert!(confirmed.is_durable("tmp-1"));
    }

    #[rstest]
    #[case("ab", None, false)]
    #[case("   abc   ", None, true)]
    #[case("", None, false)]
    #[case("general", Some("   "), true)]
    fn room_validation(#[case] name: &str, #[case] description: Option<&str>, #[case] ok: bool) {
        assert_eq!(validate_room(name, description).is_ok(), ok);
    }

    #[test]
    fn room_validation_enforces_upper_bounds() {
        let long_name = "n".repeat(MAX_ROOM_NAME_LEN + 1);
        let long_description = "x".repeat(MAX_ROOM_DESCRIPTION_LEN + 1);
        assert!(validate_room(&long_name, None).is_err());
        assert!(validate_room("general", Some(&long_description)).is_err());
        assert!(validate_room(&"n".repeat(MAX_ROOM_NAME_LEN), None).is_ok());
    }

    #[test]
    fn validation_trims_and_drops_blank_description() {
        let (name, description) = validate_room("  lobby ", Some("  ")).unwrap();
        assert_eq!(name, "lobby");
        assert_eq!(description, None);
    }

    #[rstest]
    #[case("hello", MessageKind::Text)]
    #[case("🎉🎉", MessageKind::Emoji)]
    #[case("👍 ok", MessageKind::Text)]
    #[case("", MessageKind::Text)]
    fn kind_inference(#[case] content: &str, #[case] expected: MessageKind) {
        assert_eq!(MessageKind::infer(content), expected);
    }

    #[test]
    fn reply_previews_resolve_within_batch_only() {
        let batch = vec![
            record("1", None, false),
            record("2", Some("1"), false),
            record("3", Some("outside"), false),
        ];
        let messages = resolve_batch(batch);

        assert_eq!(messages[0].reply, None);
        let reply = messages[1].reply.as_ref().unwrap();
        assert_eq!(reply.author_id, "author-1");
        assert_eq!(reply.text(), "content 1");
        assert_eq!(messages[2].reply, None);
    }

    #[test]
    fn reply_to_deleted_parent_uses_placeholder() {
        let messages = resolve_batch(vec![record("1", None, true), record("2", Some("1"), false)]);
        assert_eq!(messages[1].reply.as_ref().unwrap().text(), DELETED_PARENT_PLACEHOLDER);
    }

    #[test]
    fn deleted_message_hides_content() {
        let mut message = Message::from(record("1", None, false));
        assert_eq!(message.display_content(), "content 1");
        message.deleted_at = Some(Utc::now());
        assert_eq!(message.display_content(), DELETED_MESSAGE_PLACEHOLDER);
        assert_eq!(message.content, "content 1");
    }

    #[test]
    fn record_without_type_defaults_to_text() {
        let json = r#"{
            "id": "m1", "room_id": "r1", "user_id": "u1", "content": "hi",
            "parent_message_id": null, "created_at": "2024-05-01T12:00:00.123456+00:00",
            "deleted_at": null
        }"#;
        let record: MessageRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind, MessageKind::Text);
    }

    #[test]
    fn room_record_tolerates_missing_metadata() {
        let json = r#"{
            "id": "r1", "name": "lobby", "description": null, "created_by": "u1",
            "created_at": "2024-05-01T12:00:00+00:00"
        }"#;
        let room = Room::from(serde_json::from_str::<RoomRecord>(json).unwrap());
        assert_eq!(room.member_count, 0);
        assert_eq!(room.last_activity_at, None);
        assert!(room.id.is_durable("r1"));
    }
}
