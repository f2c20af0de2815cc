use std::sync::Arc;

use tracing::{error, info, warn};

use crate::chat::{validate_room, Room, TempIds};
use crate::gateway::Gateway;
use crate::state::{AuthState, RoomsEvent, RoomsState};
use crate::store::Store;

#[derive(Clone)]
pub struct RoomActions {
    gateway: Arc<dyn Gateway>,
    store: Arc<Store<RoomsState>>,
    auth: Arc<Store<AuthState>>,
    temp_ids: Arc<TempIds>,
}

impl RoomActions {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        store: Arc<Store<RoomsState>>,
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

    pub async fn fetch_rooms(&self) {
        self.store.dispatch(RoomsEvent::FetchStarted);
        match self.gateway.list_rooms().await {
            Ok(records) => {
                let rooms = records.into_iter().map(Room::from).collect();
                self.store.dispatch(RoomsEvent::Fetched(rooms));
            }
            Err(e) => {
                warn!("Failed to fetch rooms: {}", e);
                self.store.dispatch(RoomsEvent::Failed(e.to_string()));
            }
        }
    }

    /// Shows the room immediately and swaps in the durable entry once the
    /// backend confirms it. Returns the confirmed room.
    pub async fn create_room(&self, name: &str, description: Option<&str>) -> Option<Room> {
        let (name, description) = match validate_room(name, description) {
            Ok(valid) => valid,
            Err(message) => {
                self.store.dispatch(RoomsEvent::Failed(message));
                return None;
            }
        };

        let created_by = self.auth.read(|a| a.user_id().map(str::to_string)).unwrap_or_default();
        let temp_id = self.temp_ids.next();
        self.store.dispatch(RoomsEvent::CreateStarted(Room::pending(
            temp_id,
            name.clone(),
            description.clone(),
            created_by,
        )));

        match self.gateway.create_room(&name, description.as_deref()).await {
            Ok(record) => {
                info!("Created room {} ({})", record.name, record.id);
                let room = Room::from(record);
                self.store.dispatch(RoomsEvent::Created {
                    temp_id,
                    room: room.clone(),
                });
                Some(room)
            }
            Err(e) => {
                error!("Failed to create room {}: {}", name, e);
                self.store.dispatch(RoomsEvent::CreateFailed {
                    temp_id,
                    error: e.to_string(),
                });
                None
            }
        }
    }

    /// Joining a room the user already belongs to counts as success.
    pub async fn join_room(&self, room_id: &str) {
        self.store.dispatch(RoomsEvent::MembershipStarted);
        match self.gateway.add_membership(room_id).await {
            Ok(()) => self.store.dispatch(RoomsEvent::MembershipUpdated),
            Err(e) if e.is_duplicate() => self.store.dispatch(RoomsEvent::MembershipUpdated),
            Err(e) => {
                error!("Failed to join room {}: {}", room_id, e);
                self.store.dispatch(RoomsEvent::Failed(e.to_string()));
            }
        }
    }

    pub async fn leave_room(&self, room_id: &str) {
        self.store.dispatch(RoomsEvent::MembershipStarted);
        match self.gateway.remove_membership(room_id).await {
            Ok(()) => self.store.dispatch(RoomsEvent::MembershipUpdated),
            Err(e) => {
                error!("Failed to leave room {}: {}", room_id, e);
                self.store.dispatch(RoomsEvent::Failed(e.to_string()));
            }
        }
    }

    pub fn set_active_room(&self, room_id: Option<String>) {
        self.store.dispatch(RoomsEvent::ActiveRoomSet(room_id));
    }

    /// Clears the active room, unless another view has taken over since.
    pub fn release_active_room(&self, room_id: &str) {
        if self.store.read(|s| s.active_room.as_deref() == Some(room_id)) {
            self.store.dispatch(RoomsEvent::ActiveRoomSet(None));
        }
    }

    pub fn clear_error(&self) {
        self.store.dispatch(RoomsEvent::ClearError);
    }
}
