use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::actions::{AuthActions, MessageActions, RoomActions};
use crate::chat::TempIds;
use crate::config::{Backend, Config};
use crate::gateway::{local::LocalGateway, rest::RestGateway, Gateway};
use crate::poller::{self, PollHandle};
use crate::state::{AuthState, MessagesState, RoomsState};
use crate::store::Store;

/// Owns the three stores and their coordinators. Built once at startup and
/// shared by reference with whatever presents the state.
pub struct ChatManager {
    pub auth: AuthActions,
    pub rooms: RoomActions,
    pub messages: MessageActions,
    auth_store: Arc<Store<AuthState>>,
    rooms_store: Arc<Store<RoomsState>>,
    messages_store: Arc<Store<MessagesState>>,
    message_poll: Duration,
    room_poll: Duration,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ChatManager {
    pub fn new(gateway: Arc<dyn Gateway>, message_poll: Duration, room_poll: Duration) -> Self {
        let auth_store = Arc::new(Store::new());
        let rooms_store = Arc::new(Store::new());
        let messages_store = Arc::new(Store::new());
        let temp_ids = Arc::new(TempIds::new());

        Self {
            auth: AuthActions::new(gateway.clone(), auth_store.clone()),
            rooms: RoomActions::new(gateway.clone(), rooms_store.clone(), auth_store.clone(), temp_ids.clone()),
            messages: MessageActions::new(gateway, messages_store.clone(), auth_store.clone(), temp_ids),
            auth_store,
            rooms_store,
            messages_store,
            message_poll,
            room_poll,
            listener: Mutex::new(None),
        }
    }

    /// Builds the configured gateway and wires everything to it.
    pub async fn connect(config: &Config) -> Result<Self> {
        let gateway: Arc<dyn Gateway> = match &config.backend {
            Backend::Rest {
                url,
                anon_key,
                room_listing,
            } => {
                info!("Using hosted backend at {} (room listing: {})", url, room_listing);
                Arc::new(RestGateway::new(url.clone(), anon_key.clone(), *room_listing)?)
            }
            Backend::Local { db_path } => Arc::new(LocalGateway::open(db_path).await?),
        };
        Ok(Self::new(gateway, config.message_poll, config.room_poll))
    }

    /// Restores any existing session and starts following auth changes.
    pub async fn start(&self) {
        self.auth.refresh_session().await;

        let mut listener = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if listener.is_none() {
            *listener = Some(self.auth.watch_auth_changes());
        }
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth_store.snapshot()
    }

    pub fn rooms_state(&self) -> RoomsState {
        self.rooms_store.snapshot()
    }

    pub fn messages_state(&self) -> MessagesState {
        self.messages_store.snapshot()
    }

    pub fn subscribe_messages(&self) -> tokio::sync::watch::Receiver<MessagesState> {
        self.messages_store.subscribe()
    }

    /// Periodic room list refresh, stopped when the handle is dropped.
    pub fn watch_rooms(&self) -> PollHandle {
        poller::watch_room_list(self.rooms.clone(), self.room_poll)
    }

    /// Marks the room active and keeps its messages fresh until the view is dropped.
    pub fn open_room(&self, room_id: &str) -> RoomView {
        self.rooms.set_active_room(Some(room_id.to_string()));
        RoomView {
            room_id: room_id.to_string(),
            rooms: self.rooms.clone(),
            _poller: poller::watch_room(self.messages.clone(), room_id.to_string(), self.message_poll),
        }
    }
}

impl Drop for ChatManager {
    fn drop(&mut self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
    }
}

/// An open room. Dropping it stops the poller and releases the active room.
pub struct RoomView {
    room_id: String,
    rooms: RoomActions,
    _poller: PollHandle,
}

impl RoomView {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }
}

impl Drop for RoomView {
    fn drop(&mut self) {
        self.rooms.release_active_room(&self.room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::AuthChange;
    use crate::chat::MessageKind;
    use crate::state::AuthPhase;
    use crate::test_support::{FakeGateway, Op};

    fn manager(gateway: &Arc<FakeGateway>) -> ChatManager {
        ChatManager::new(gateway.clone(), Duration::from_millis(3000), Duration::from_millis(10_000))
    }

    #[tokio::test]
    async fn start_restores_existing_session() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.sign_in_as("ada");
        let manager = manager(&gateway);

        manager.start().await;
        assert_eq!(manager.auth_state().phase(), AuthPhase::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn room_view_lifecycle() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.sign_in_as("ada");
        let room = gateway.seed_room("lobby");
        gateway.seed_message(&room.id, "bob", "hello");
        let manager = manager(&gateway);
        manager.start().await;

        let view = manager.open_room(&room.id);
        assert_eq!(view.room_id(), room.id);
        assert_eq!(manager.rooms_state().active_room.as_deref(), Some(room.id.as_str()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.messages_state().messages(&room.id).len(), 1);

        manager.messages.send_message(&room.id, "hi bob", MessageKind::Text).await;
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(manager.messages_state().messages(&room.id).len(), 2);

        drop(view);
        assert_eq!(manager.rooms_state().active_room, None);
        let calls = gateway.calls(Op::ListMessages);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(gateway.calls(Op::ListMessages), calls);
    }

    #[tokio::test]
    async fn switching_rooms_keeps_the_new_one_active() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.sign_in_as("ada");
        let manager = manager(&gateway);

        let first = manager.open_room("room-a");
        let second = manager.open_room("room-b");
        drop(first);
        assert_eq!(manager.rooms_state().active_room.as_deref(), Some("room-b"));
        drop(second);
        assert_eq!(manager.rooms_state().active_room, None);
    }

    #[tokio::test]
    async fn remote_sign_out_resets_auth() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.sign_in_as("ada");
        let manager = manager(&gateway);
        manager.start().await;

        let mut rx = manager.auth_store.subscribe();
        gateway.broadcast(AuthChange::SignedOut);
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| s.session.is_none()))
            .await
            .unwrap()
            .unwrap();
    }
}
