use crate::entity::Session;
use crate::store::Reducer;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthState {
    pub session: Option<Session>,
    pub loading: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Anonymous,
    Authenticating,
    Authenticated,
    Failed,
}

impl AuthState {
    pub fn phase(&self) -> AuthPhase {
        if self.loading {
            AuthPhase::Authenticating
        } else if self.session.is_some() {
            AuthPhase::Authenticated
        } else if self.error.is_some() {
            AuthPhase::Failed
        } else {
            AuthPhase::Anonymous
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.user_id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    LoginStarted,
    RegisterStarted,
    LogoutStarted,
    SessionCheckStarted,
    /// Login, registration and session restore all end here.
    Authenticated(Session),
    Failed(String),
    LoggedOut,
    SessionExpired,
    ClearError,
}

impl Reducer for AuthState {
    type Event = AuthEvent;

    fn apply(&self, event: AuthEvent) -> Self {
        match event {
            AuthEvent::LoginStarted
            | AuthEvent::RegisterStarted
            | AuthEvent::LogoutStarted
            | AuthEvent::SessionCheckStarted => AuthState {
                loading: true,
                error: None,
                ..self.clone()
            },
            AuthEvent::Authenticated(session) => AuthState {
                session: Some(session),
                loading: false,
                error: None,
            },
            AuthEvent::Failed(message) => AuthState {
                session: self.session.clone(),
                loading: false,
                error: Some(message),
            },
            AuthEvent::LoggedOut | AuthEvent::SessionExpired => AuthState::default(),
            AuthEvent::ClearError => AuthState {
                error: None,
                ..self.clone()
            },
        }
    }
}
