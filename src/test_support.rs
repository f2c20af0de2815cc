//! In-memory gateway for coordinator, poller and manager tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::broadcast;

use crate::bus::{AuthChange, EventBus};
use crate::chat::{Like, MessageKind, MessageRecord, RoomRecord, FULL_FETCH_LIMIT};
use crate::entity::Session;
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Authenticate,
    CreateAccount,
    EndSession,
    CurrentSession,
    ListRooms,
    CreateRoom,
    AddMembership,
    RemoveMembership,
    ListMessages,
    CreateMessage,
    SoftDelete,
    ListLikes,
    AddLike,
    RemoveLike,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, (String, Session)>,
    session: Option<Session>,
    rooms: Vec<RoomRecord>,
    members: HashSet<(String, String)>,
    messages: Vec<MessageRecord>,
    likes: Vec<Like>,
    failing: HashSet<Op>,
    calls: HashMap<Op, usize>,
    since: Vec<Option<DateTime<Utc>>>,
    next_id: u64,
}

impl Inner {
    fn enter(&mut self, op: Op) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        if self.failing.contains(&op) {
            return Err(GatewayError::Rejected {
                status: 500,
                message: format!("{:?} failed", op),
            });
        }
        Ok(())
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{}", prefix, self.next_id)
    }

    /// Deterministic, strictly increasing clock.
    fn now(&mut self) -> DateTime<Utc> {
        self.next_id += 1;
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(self.next_id as i64)
    }

    fn user_id(&self) -> Result<String> {
        self.session
            .as_ref()
            .map(|s| s.user_id.clone())
            .ok_or(GatewayError::Unauthenticated)
    }
}

#[derive(Default)]
pub struct FakeGateway {
    inner: Mutex<Inner>,
    bus: EventBus,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later call of `op` fail until [`FakeGateway::recover`].
    pub fn fail(&self, op: Op) {
        self.inner.lock().unwrap().failing.insert(op);
    }

    pub fn recover(&self, op: Op) {
        self.inner.lock().unwrap().failing.remove(&op);
    }

    pub fn calls(&self, op: Op) -> usize {
        self.inner.lock().unwrap().calls.get(&op).copied().unwrap_or(0)
    }

    /// Watermarks passed to `list_messages`, in call order.
    pub fn since_log(&self) -> Vec<Option<DateTime<Utc>>> {
        self.inner.lock().unwrap().since.clone()
    }

    pub fn like_rows(&self) -> Vec<Like> {
        self.inner.lock().unwrap().likes.clone()
    }

    pub fn broadcast(&self, change: AuthChange) {
        self.bus.publish(change);
    }

    /// Signs in a fresh account directly, bypassing failure injection.
    pub fn sign_in_as(&self, user_id: &str) -> Session {
        let session = Session::new(user_id, format!("{}@example.com", user_id), user_id, Utc::now());
        let mut inner = self.inner.lock().unwrap();
        inner.accounts.insert(session.email.clone(), ("password".to_string(), session.clone()));
        inner.session = Some(session.clone());
        session
    }

    pub fn seed_room(&self, name: &str) -> RoomRecord {
        let mut inner = self.inner.lock().unwrap();
        let record = RoomRecord {
            id: inner.next_id("room-"),
            name: name.to_string(),
            description: None,
            created_by: "seed".to_string(),
            created_at: inner.now(),
            member_count: 0,
            last_message_at: None,
        };
        inner.rooms.insert(0, record.clone());
        record
    }

    /// Inserts a message as if another client had posted it.
    pub fn seed_message(&self, room_id: &str, user_id: &str, content: &str) -> MessageRecord {
        let mut inner = self.inner.lock().unwrap();
        let record = MessageRecord {
            id: inner.next_id("msg-"),
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            content: content.to_string(),
            kind: MessageKind::Text,
            parent_message_id: None,
            created_at: inner.now(),
            deleted_at: None,
        };
        inner.messages.push(record.clone());
        record
    }

    pub fn seed_like(&self, message_id: &str, user_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let created_at = inner.now();
        inner.likes.push(Like {
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            created_at,
        });
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn authenticate(&self, email: &str, password: &str) -> Result<Session> {
        let session = {
            let mut inner = self.inner.lock().unwrap();
            inner.enter(Op::Authenticate)?;
            let session = match inner.accounts.get(email) {
                Some((stored, session)) if stored == password => session.clone(),
                _ => return Err(GatewayError::Auth("Invalid login credentials".to_string())),
            };
            inner.session = Some(session.clone());
            session
        };
        self.bus.publish(AuthChange::SignedIn);
        Ok(session)
    }

    async fn create_account(&self, email: &str, password: &str, display_name: &str) -> Result<Session> {
        let session = {
            let mut inner = self.inner.lock().unwrap();
            inner.enter(Op::CreateAccount)?;
            if inner.accounts.contains_key(email) {
                return Err(GatewayError::Auth("User already registered".to_string()));
            }
            let user_id = inner.next_id("user-");
            let created_at = inner.now();
            let session = Session::new(user_id, email, display_name, created_at);
            inner
                .accounts
                .insert(email.to_string(), (password.to_string(), session.clone()));
            inner.session = Some(session.clone());
            session
        };
        self.bus.publish(AuthChange::SignedIn);
        Ok(session)
    }

    async fn end_session(&self) -> Result<()> {
        let result = {
            let mut inner = self.inner.lock().unwrap();
            let result = inner.enter(Op::EndSession);
            inner.session = None;
            result
        };
        self.bus.publish(AuthChange::SignedOut);
        result
    }

    async fn current_session(&self) -> Result<Option<Session>> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(Op::CurrentSession)?;
        Ok(inner.session.clone())
    }

    async fn list_rooms(&self) -> Result<Vec<RoomRecord>> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(Op::ListRooms)?;
        Ok(inner.rooms.clone())
    }

    async fn create_room(&self, name: &str, description: Option<&str>) -> Result<RoomRecord> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(Op::CreateRoom)?;
        let user_id = inner.user_id()?;
        let record = RoomRecord {
            id: inner.next_id("room-"),
            name: name.to_string(),
            description: description.map(str::to_string),
            created_by: user_id.clone(),
            created_at: inner.now(),
            member_count: 1,
            last_message_at: None,
        };
        inner.members.insert((record.id.clone(), user_id));
        inner.rooms.insert(0, record.clone());
        Ok(record)
    }

    async fn add_membership(&self, room_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(Op::AddMembership)?;
        let user_id = inner.user_id()?;
        if !inner.members.insert((room_id.to_string(), user_id)) {
            return Err(GatewayError::Duplicate("already a member".to_string()));
        }
        Ok(())
    }

    async fn remove_membership(&self, room_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(Op::RemoveMembership)?;
        let user_id = inner.user_id()?;
        inner.members.remove(&(room_id.to_string(), user_id));
        Ok(())
    }

    async fn list_messages(&self, room_id: &str, since: Option<DateTime<Utc>>) -> Result<Vec<MessageRecord>> {
        let mut inner = self.inner.lock().unwrap();
        inner.since.push(since);
        inner.enter(Op::ListMessages)?;
        let in_room = inner.messages.iter().filter(|m| m.room_id == room_id);
        let rows: Vec<MessageRecord> = match since {
            Some(since) => in_room.filter(|m| m.created_at > since).cloned().collect(),
            None => {
                let all: Vec<MessageRecord> = in_room.cloned().collect();
                let skip = all.len().saturating_sub(FULL_FETCH_LIMIT);
                all.into_iter().skip(skip).collect()
            }
        };
        Ok(rows)
    }

    async fn create_message(
        &self,
        room_id: &str,
        content: &str,
        kind: MessageKind,
        parent_id: Option<&str>,
    ) -> Result<MessageRecord> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(Op::CreateMessage)?;
        let user_id = inner.user_id()?;
        let record = MessageRecord {
            id: inner.next_id("msg-"),
            room_id: room_id.to_string(),
            user_id,
            content: content.to_string(),
            kind,
            parent_message_id: parent_id.map(str::to_string),
            created_at: inner.now(),
            deleted_at: None,
        };
        inner.messages.push(record.clone());
        Ok(record)
    }

    async fn soft_delete_message(&self, message_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(Op::SoftDelete)?;
        let now = inner.now();
        match inner.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) => {
                message.deleted_at = Some(now);
                Ok(())
            }
            None => Err(GatewayError::NotFound(message_id.to_string())),
        }
    }

    async fn list_likes(&self, message_ids: &[String]) -> Result<Vec<Like>> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(Op::ListLikes)?;
        Ok(inner
            .likes
            .iter()
            .filter(|l| message_ids.contains(&l.message_id))
            .cloned()
            .collect())
    }

    async fn add_like(&self, message_id: &str, user_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(Op::AddLike)?;
        if inner
            .likes
            .iter()
            .any(|l| l.message_id == message_id && l.user_id == user_id)
        {
            return Err(GatewayError::Duplicate("already liked".to_string()));
        }
        let created_at = inner.now();
        inner.likes.push(Like {
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            created_at,
        });
        Ok(())
    }

    async fn remove_like(&self, message_id: &str, user_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(Op::RemoveLike)?;
        inner
            .likes
            .retain(|l| !(l.message_id == message_id && l.user_id == user_id));
        Ok(())
    }

    fn auth_changes(&self) -> broadcast::Receiver<AuthChange> {
        self.bus.subscribe()
    }
}
