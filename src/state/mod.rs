//! The three client-side state machines. Each is a pure [`crate::store::Reducer`].

pub mod auth;
pub mod messages;
pub mod rooms;

pub use auth::{AuthEvent, AuthPhase, AuthState};
pub use messages::{MessagesEvent, MessagesState};
pub use rooms::{RoomsEvent, RoomsState};
