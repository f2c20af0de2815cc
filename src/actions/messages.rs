use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::chat::{resolve_batch, DeliveryStatus, Like, Message, MessageKind, TempId, TempIds, MAX_MESSAGE_LEN};
use crate::gateway::Gateway;
use crate::state::{AuthState, MessagesEvent, MessagesState};
use crate::store::Store;

#[derive(Clone)]
pub struct MessageActions {
    gateway: Arc<dyn Gateway>,
    store: Arc<Store<MessagesState>>,
    auth: Arc<Store<AuthState>>,
    temp_ids: Arc<TempIds>,
}

impl MessageActions {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        store: Arc<Store<MessagesState>>,
        auth: Arc<Store<AuthState>>,
        temp_ids: Arc<TempIds>,
    ) -> Self {
        Self {
            gateway,
            store,
            auth,
            temp_ids,
        }
    }

    fn user_id(&self) -> Option<String> {
        self.auth.read(|a| a.user_id().map(str::to_string))
    }

    /// Full fetch without a watermark, incremental merge with one. Likes for
    /// the fetched batch are loaded afterwards.
    pub async fn fetch_messages(&self, room_id: &str, since: Option<DateTime<Utc>>) {
        self.store.dispatch(MessagesEvent::FetchStarted);

        let records = match self.gateway.list_messages(room_id, since).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to fetch messages for {}: {}", room_id, e);
                self.store.dispatch(MessagesEvent::FetchFailed {
                    room_id: room_id.to_string(),
                    incremental: since.is_some(),
                });
                return;
            }
        };

        let message_ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let messages = resolve_batch(records);
        let room_id = room_id.to_string();
        self.store.dispatch(match since {
            Some(_) => MessagesEvent::Appended { room_id, messages },
            None => MessagesEvent::Loaded { room_id, messages },
        });

        self.fetch_likes(message_ids).await;
    }

    /// Incremental fetch from the room's current watermark.
    pub async fn sync_room(&self, room_id: &str) {
        let since = self.store.read(|s| s.watermark(room_id));
        self.fetch_messages(room_id, Some(since)).await;
    }

    async fn fetch_likes(&self, message_ids: Vec<String>) {
        if message_ids.is_empty() {
            return;
        }
        match self.gateway.list_likes(&message_ids).await {
            Ok(likes) => self.store.dispatch(MessagesEvent::LikesLoaded { message_ids, likes }),
            Err(e) => warn!("Failed to fetch likes: {}", e),
        }
    }

    /// Appends the message as `sending`, consumes the reply target, then
    /// confirms or fails the entry in place. Blank or over-long content is
    /// ignored.
    pub async fn send_message(&self, room_id: &str, content: &str, kind: MessageKind) -> Option<TempId> {
        let content = content.trim();
        if content.is_empty() || content.chars().count() > MAX_MESSAGE_LEN {
            debug!("Ignoring message of {} chars", content.chars().count());
            return None;
        }

        let Some(author_id) = self.user_id() else {
            self.store.dispatch(MessagesEvent::Failed("Not signed in".to_string()));
            return None;
        };

        let reply_target = self.store.read(|s| s.reply_target.clone());
        let temp_id = self.temp_ids.next();
        let pending = Message::pending(temp_id, room_id, author_id, content, kind, reply_target.as_ref());
        let parent_id = pending.parent_id.clone();

        self.store.dispatch(MessagesEvent::SendStarted(pending));
        self.store.dispatch(MessagesEvent::ReplyTargetCleared);

        self.deliver(room_id, temp_id, content, kind, parent_id.as_deref()).await;
        Some(temp_id)
    }

    /// Re-sends a failed entry in place.
    pub async fn retry_send(&self, room_id: &str, temp_id: TempId) {
        let failed = self.store.read(|s| {
            s.find_pending(room_id, temp_id)
                .filter(|m| m.status == DeliveryStatus::Failed)
                .cloned()
        });
        let Some(message) = failed else {
            debug!("Nothing to retry for {} in {}", temp_id, room_id);
            return;
        };

        self.store.dispatch(MessagesEvent::RetryStarted {
            room_id: room_id.to_string(),
            temp_id,
        });
        self.deliver(room_id, temp_id, &message.content, message.kind, message.parent_id.as_deref())
            .await;
    }

    async fn deliver(&self, room_id: &str, temp_id: TempId, content: &str, kind: MessageKind, parent_id: Option<&str>) {
        match self.gateway.create_message(room_id, content, kind, parent_id).await {
            Ok(record) => self.store.dispatch(MessagesEvent::SendConfirmed {
                room_id: room_id.to_string(),
                temp_id,
                message: Message::from(record),
            }),
            Err(e) => {
                error!("Failed to send message {} to {}: {}", temp_id, room_id, e);
                self.store.dispatch(MessagesEvent::SendFailed {
                    room_id: room_id.to_string(),
                    temp_id,
                    error: e.to_string(),
                });
            }
        }
    }

    pub async fn delete_message(&self, room_id: &str, message_id: &str) {
        match self.gateway.soft_delete_message(message_id).await {
            Ok(()) => self.store.dispatch(MessagesEvent::Deleted {
                room_id: room_id.to_string(),
                message_id: message_id.to_string(),
                deleted_at: Utc::now(),
            }),
            Err(e) => {
                error!("Failed to delete message {}: {}", message_id, e);
                self.store.dispatch(MessagesEvent::Failed(e.to_string()));
            }
        }
    }

    pub async fn toggle_like(&self, message_id: &str) {
        let Some(user_id) = self.user_id() else {
            self.store.dispatch(MessagesEvent::Failed("Not signed in".to_string()));
            return;
        };
        if self.store.read(|s| s.has_liked(message_id, &user_id)) {
            self.unlike(message_id).await;
        } else {
            self.like(message_id).await;
        }
    }

    /// No-op when already liked.
    pub async fn like(&self, message_id: &str) {
        let Some(user_id) = self.user_id() else {
            self.store.dispatch(MessagesEvent::Failed("Not signed in".to_string()));
            return;
        };
        if self.store.read(|s| s.has_liked(message_id, &user_id)) {
            return;
        }

        self.store.dispatch(MessagesEvent::LikeAdded(Like {
            message_id: message_id.to_string(),
            user_id: user_id.clone(),
            created_at: Utc::now(),
        }));

        match self.gateway.add_like(message_id, &user_id).await {
            Err(e) if !e.is_duplicate() => {
                error!("Failed to like {}: {}", message_id, e);
                self.store.dispatch(MessagesEvent::LikeRemoved {
                    message_id: message_id.to_string(),
                    user_id,
                });
                self.store.dispatch(MessagesEvent::Failed(e.to_string()));
            }
            _ => self.store.dispatch(MessagesEvent::LikeConfirmed {
                message_id: message_id.to_string(),
                user_id,
            }),
        }
    }

    /// No-op when not liked.
    pub async fn unlike(&self, message_id: &str) {
        let Some(user_id) = self.user_id() else {
            self.store.dispatch(MessagesEvent::Failed("Not signed in".to_string()));
            return;
        };
        let Some((index, existing)) = self.store.read(|s| {
            s.likes.get(message_id).and_then(|likes| {
                likes
                    .iter()
                    .position(|l| l.user_id == user_id)
                    .map(|index| (index, likes[index].clone()))
            })
        }) else {
            return;
        };

        self.store.dispatch(MessagesEvent::LikeRemoved {
            message_id: message_id.to_string(),
            user_id: user_id.clone(),
        });

        if let Err(e) = self.gateway.remove_like(message_id, &user_id).await {
            error!("Failed to unlike {}: {}", message_id, e);
            self.store.dispatch(MessagesEvent::LikeRestored { like: existing, index });
            self.store.dispatch(MessagesEvent::Failed(e.to_string()));
        }
    }

    pub fn set_reply_target(&self, message: Message) {
        self.store.dispatch(MessagesEvent::ReplyTargetSet(message));
    }

    pub fn clear_reply_target(&self) {
        self.store.dispatch(MessagesEvent::ReplyTargetCleared);
    }

    pub fn clear_error(&self) {
        self.store.dispatch(MessagesEvent::ClearError);
    }
}
