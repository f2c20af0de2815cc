use chrono::{DateTime, Utc};
use im::{HashMap, HashSet, Vector};

use crate::chat::{DeliveryStatus, Like, Message, TempId};
use crate::store::Reducer;

/// Messages per room in chronological order, likes per message id, and the
/// pending reply target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagesState {
    pub by_room: HashMap<String, Vector<Message>>,
    pub likes: HashMap<String, Vector<Like>>,
    /// `(message_id, user_id)` of optimistic likes whose write is in flight.
    pub pending_likes: HashSet<(String, String)>,
    pub reply_target: Option<Message>,
    pub loading: bool,
    pub error: Option<String>,
}

impl MessagesState {
    pub fn messages(&self, room_id: &str) -> Vector<Message> {
        self.by_room.get(room_id).cloned().unwrap_or_default()
    }

    pub fn find(&self, room_id: &str, message_id: &str) -> Option<&Message> {
        self.by_room
            .get(room_id)?
            .iter()
            .find(|m| m.id.is_durable(message_id))
    }

    pub fn find_pending(&self, room_id: &str, temp_id: TempId) -> Option<&Message> {
        self.by_room
            .get(room_id)?
            .iter()
            .find(|m| m.matches_temp(temp_id))
    }

    /// Created-at of the newest confirmed message, or the epoch for an empty room.
    pub fn watermark(&self, room_id: &str) -> DateTime<Utc> {
        self.by_room
            .get(room_id)
            .and_then(|messages| {
                messages
                    .iter()
                    .filter(|m| m.durable_id().is_some())
                    .map(|m| m.created_at)
                    .max()
            })
            .unwrap_or_default()
    }

    pub fn likes_for(&self, message_id: &str) -> Vector<Like> {
        self.likes.get(message_id).cloned().unwrap_or_default()
    }

    pub fn like_count(&self, message_id: &str) -> usize {
        self.likes.get(message_id).map(Vector::len).unwrap_or(0)
    }

    pub fn has_liked(&self, message_id: &str, user_id: &str) -> bool {
        self.likes
            .get(message_id)
            .map(|likes| likes.iter().any(|l| l.user_id == user_id))
            .unwrap_or(false)
    }

    fn update_room(&mut self, room_id: &str, f: impl FnOnce(&mut Vector<Message>)) {
        if let Some(messages) = self.by_room.get_mut(room_id) {
            f(messages);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessagesEvent {
    FetchStarted,
    /// Full fetch: replaces the room's sequence.
    Loaded { room_id: String, messages: Vec<Message> },
    /// Incremental fetch: appends entries whose durable id is not yet present.
    Appended { room_id: String, messages: Vec<Message> },
    /// Read failures degrade silently. A full fetch empties the room, an
    /// incremental one leaves it alone.
    FetchFailed { room_id: String, incremental: bool },
    /// Every listed message id gets its likes, empty when the batch has none.
    LikesLoaded { message_ids: Vec<String>, likes: Vec<Like> },
    SendStarted(Message),
    SendConfirmed { room_id: String, temp_id: TempId, message: Message },
    SendFailed { room_id: String, temp_id: TempId, error: String },
    RetryStarted { room_id: String, temp_id: TempId },
    Deleted { room_id: String, message_id: String, deleted_at: DateTime<Utc> },
    LikeAdded(Like),
    LikeConfirmed { message_id: String, user_id: String },
    LikeRemoved { message_id: String, user_id: String },
    /// Puts back a like removed optimistically, at its previous position.
    LikeRestored { like: Like, index: usize },
    ReplyTargetSet(Message),
    ReplyTargetCleared,
    Failed(String),
    ClearError,
}

impl Reducer for MessagesState {
    type Event = MessagesEvent;

    fn apply(&self, event: MessagesEvent) -> Self {
        let mut next = self.clone();
        match event {
            MessagesEvent::FetchStarted => {
                next.loading = true;
                next.error = None;
            }
            MessagesEvent::Loaded { room_id, messages } => {
                next.by_room.insert(room_id, messages.into_iter().collect());
                next.loading = false;
                next.error = None;
            }
            MessagesEvent::Appended { room_id, messages } => {
                let current = next.by_room.entry(room_id).or_insert_with(Vector::new);
                let mut known: HashSet<String> = current
                    .iter()
                    .filter_map(|m| m.durable_id().map(str::to_string))
                    .collect();
                for message in messages {
                    let Some(id) = message.durable_id() else {
                        continue;
                    };
                    if known.insert(id.to_string()).is_none() {
                        current.push_back(message);
                    }
                }
                next.loading = false;
                next.error = None;
            }
            MessagesEvent::FetchFailed { room_id, incremental } => {
                if !incremental {
                    next.by_room.insert(room_id, Vector::new());
                }
                next.loading = false;
            }
            MessagesEvent::LikesLoaded { message_ids, likes } => {
                for id in message_ids {
                    let mut batch: Vector<Like> = likes.iter().filter(|l| l.message_id == id).cloned().collect();
                    // Optimistic likes still in flight survive a snapshot taken before their write
                    for local in self.likes_for(&id) {
                        let key = (local.message_id.clone(), local.user_id.clone());
                        if self.pending_likes.contains(&key) && !batch.iter().any(|l| l.user_id == local.user_id) {
                            batch.push_back(local);
                        }
                    }
                    next.likes.insert(id, batch);
                }
            }
            MessagesEvent::SendStarted(message) => {
                next.by_room.entry(message.room_id.clone()).or_insert_with(Vector::new).push_back(message);
            }
            MessagesEvent::SendConfirmed {
                room_id,
                temp_id,
                mut message,
            } => {
                next.update_room(&room_id, |messages| {
                    let Some(index) = messages.iter().position(|m| m.matches_temp(temp_id)) else {
                        return;
                    };
                    let already = message
                        .durable_id()
                        .and_then(|id| messages.iter().position(|m| m.id.is_durable(id)));
                    match already {
                        // A poll delivered the durable copy first
                        Some(existing) if existing != index => {
                            messages.remove(index);
                            if let Some(durable) = messages.iter_mut().find(|m| m.id == message.id) {
                                durable.status = DeliveryStatus::Sent;
                            }
                        }
                        _ => {
                            let pending = messages.remove(index);
                            if message.reply.is_none() {
                                message.reply = pending.reply;
                            }
                            message.status = DeliveryStatus::Sent;
                            let at = confirmed_position(messages, index, message.created_at);
                            messages.insert(at, message);
                        }
                    }
                });
            }
            MessagesEvent::SendFailed {
                room_id,
                temp_id,
                error,
            } => {
                next.update_room(&room_id, |messages| {
                    if let Some(pending) = messages.iter_mut().find(|m| m.matches_temp(temp_id)) {
                        pending.status = DeliveryStatus::Failed;
                    }
                });
                next.error = Some(error);
            }
            MessagesEvent::RetryStarted { room_id, temp_id } => {
                next.update_room(&room_id, |messages| {
                    if let Some(pending) = messages.iter_mut().find(|m| m.matches_temp(temp_id)) {
                        pending.status = DeliveryStatus::Sending;
                    }
                });
                next.error = None;
            }
            MessagesEvent::Deleted {
                room_id,
                message_id,
                deleted_at,
            } => {
                next.update_room(&room_id, |messages| {
                    for message in messages.iter_mut() {
                        if message.id.is_durable(&message_id) {
                            message.deleted_at = Some(deleted_at);
                        } else if message.parent_id.as_deref() == Some(message_id.as_str()) {
                            if let Some(reply) = message.reply.as_mut() {
                                reply.content = None;
                            }
                        }
                    }
                });
            }
            MessagesEvent::LikeAdded(like) => {
                next.pending_likes.insert((like.message_id.clone(), like.user_id.clone()));
                let likes = next.likes.entry(like.message_id.clone()).or_insert_with(Vector::new);
                if !likes.iter().any(|l| l.user_id == like.user_id) {
                    likes.push_back(like);
                }
            }
            MessagesEvent::LikeConfirmed { message_id, user_id } => {
                next.pending_likes.remove(&(message_id, user_id));
            }
            MessagesEvent::LikeRemoved { message_id, user_id } => {
                if let Some(likes) = next.likes.get_mut(&message_id) {
                    likes.retain(|l| l.user_id != user_id);
                }
                next.pending_likes.remove(&(message_id, user_id));
            }
            MessagesEvent::LikeRestored { like, index } => {
                let likes = next.likes.entry(like.message_id.clone()).or_insert_with(Vector::new);
                if !likes.iter().any(|l| l.user_id == like.user_id) {
                    let index = index.min(likes.len());
                    likes.insert(index, like);
                }
            }
            MessagesEvent::ReplyTargetSet(message) => {
                next.reply_target = Some(message);
            }
            MessagesEvent::ReplyTargetCleared => {
                next.reply_target = None;
            }
            MessagesEvent::Failed(error) => {
                next.loading = false;
                next.error = Some(error);
            }
            MessagesEvent::ClearError => {
                next.error = None;
            }
        }
        next
    }
}

/// Where a confirmed entry lands once its pending slot at `from` is removed:
/// after every durable entry from `from` onwards that is not newer than it,
/// and before the first one that is.
fn confirmed_position(messages: &Vector<Message>, from: usize, created_at: DateTime<Utc>) -> usize {
    let mut at = from;
    for (offset, message) in messages.iter().enumerate().skip(from) {
        if message.durable_id().is_none() {
            continue;
        }
        if message.created_at > created_at {
            break;
        }
        at = offset + 1;
    }
    at
}
