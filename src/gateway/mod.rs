//! The remote data gateway: authentication plus row-level access to rooms,
//! memberships, messages and likes.
//!
//! Coordinators only ever talk to a `dyn Gateway`, so the hosted REST backend
//! and the local SQLite backend are interchangeable.

pub mod local;
pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::bus::AuthChange;
use crate::chat::{Like, MessageKind, MessageRecord, RoomRecord};
use crate::entity::Session;
use crate::error::Result;

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn authenticate(&self, email: &str, password: &str) -> Result<Session>;

    /// Creates the account and its profile row, leaving the new account signed in.
    async fn create_account(&self, email: &str, password: &str, display_name: &str) -> Result<Session>;

    async fn end_session(&self) -> Result<()>;

    async fn current_session(&self) -> Result<Option<Session>>;

    /// Rooms ordered newest first.
    async fn list_rooms(&self) -> Result<Vec<RoomRecord>>;

    /// Creates a room and makes the caller a member of it.
    async fn create_room(&self, name: &str, description: Option<&str>) -> Result<RoomRecord>;

    async fn add_membership(&self, room_id: &str) -> Result<()>;

    async fn remove_membership(&self, room_id: &str) -> Result<()>;

    /// Messages in ascending creation order. Without `since` only the most
    /// recent [`crate::chat::FULL_FETCH_LIMIT`] are returned; with it, only
    /// messages strictly newer than the watermark.
    async fn list_messages(&self, room_id: &str, since: Option<DateTime<Utc>>) -> Result<Vec<MessageRecord>>;

    async fn create_message(
        &self,
        room_id: &str,
        content: &str,
        kind: MessageKind,
        parent_id: Option<&str>,
    ) -> Result<MessageRecord>;

    async fn soft_delete_message(&self, message_id: &str) -> Result<()>;

    async fn list_likes(&self, message_ids: &[String]) -> Result<Vec<Like>>;

    async fn add_like(&self, message_id: &str, user_id: &str) -> Result<()>;

    async fn remove_like(&self, message_id: &str, user_id: &str) -> Result<()>;

    /// Sign-in / sign-out notifications.
    fn auth_changes(&self) -> broadcast::Receiver<AuthChange>;
}
