use im::Vector;

use crate::chat::{EntryId, Room, TempId};
use crate::store::Reducer;

/// Room list, newest first, plus the room currently open in a view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomsState {
    pub rooms: Vector<Room>,
    pub active_room: Option<String>,
    pub loading: bool,
    pub error: Option<String>,
}

impl RoomsState {
    pub fn find(&self, room_id: &str) -> Option<&Room> {
        self.rooms.iter().find(|r| r.id.is_durable(room_id))
    }

    fn position(&self, temp_id: TempId) -> Option<usize> {
        let id = EntryId::Pending(temp_id);
        self.rooms.iter().position(|r| r.id == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomsEvent {
    FetchStarted,
    /// Replaces the list wholesale.
    Fetched(Vec<Room>),
    /// Prepends an optimistic room.
    CreateStarted(Room),
    Created { temp_id: TempId, room: Room },
    CreateFailed { temp_id: TempId, error: String },
    MembershipStarted,
    MembershipUpdated,
    Failed(String),
    ActiveRoomSet(Option<String>),
    ClearError,
}

impl Reducer for RoomsState {
    type Event = RoomsEvent;

    fn apply(&self, event: RoomsEvent) -> Self {
        let mut next = self.clone();
        match event {
            RoomsEvent::FetchStarted | RoomsEvent::MembershipStarted => {
                next.loading = true;
                next.error = None;
            }
            RoomsEvent::Fetched(rooms) => {
                next.rooms = rooms.into_iter().collect();
                next.loading = false;
                next.error = None;
            }
            RoomsEvent::CreateStarted(room) => {
                next.rooms.push_front(room);
                next.loading = true;
                next.error = None;
            }
            RoomsEvent::Created { temp_id, room } => {
                if let Some(index) = next.position(temp_id) {
                    next.rooms.set(index, room);
                }
                next.loading = false;
            }
            RoomsEvent::CreateFailed { temp_id, error } => {
                if let Some(index) = next.position(temp_id) {
                    next.rooms.remove(index);
                }
                next.loading = false;
                next.error = Some(error);
            }
            RoomsEvent::MembershipUpdated => {
                next.loading = false;
            }
            RoomsEvent::Failed(error) => {
                next.loading = false;
                next.error = Some(error);
            }
            RoomsEvent::ActiveRoomSet(room_id) => {
                next.active_room = room_id;
            }
            RoomsEvent::ClearError => {
                next.error = None;
            }
        }
        next
    }
}
