//! Coordinators that turn user intents into gateway calls and reducer events.
//!
//! None of them return errors: every gateway failure ends up in the state
//! of the store the coordinator owns.

pub mod auth;
pub mod messages;
pub mod rooms;

pub use auth::AuthActions;
pub use messages::MessageActions;
pub use rooms::RoomActions;
