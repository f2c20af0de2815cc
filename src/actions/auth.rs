use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::AuthChange;
use crate::gateway::Gateway;
use crate::state::{AuthEvent, AuthState};
use crate::store::Store;

#[derive(Clone)]
pub struct AuthActions {
    gateway: Arc<dyn Gateway>,
    store: Arc<Store<AuthState>>,
}

impl AuthActions {
    pub fn new(gateway: Arc<dyn Gateway>, store: Arc<Store<AuthState>>) -> Self {
        Self { gateway, store }
    }

    pub async fn login(&self, email: &str, password: &str) {
        self.store.dispatch(AuthEvent::LoginStarted);
        match self.gateway.authenticate(email, password).await {
            Ok(session) => {
                info!("Signed in as {}", session);
                self.store.dispatch(AuthEvent::Authenticated(session));
            }
            Err(e) => {
                warn!("Login failed: {}", e);
                self.store.dispatch(AuthEvent::Failed(e.to_string()));
            }
        }
    }

    pub async fn register(&self, email: &str, password: &str, display_name: &str) {
        self.store.dispatch(AuthEvent::RegisterStarted);
        match self.gateway.create_account(email, password, display_name).await {
            Ok(session) => {
                info!("Registered {}", session);
                self.store.dispatch(AuthEvent::Authenticated(session));
            }
            Err(e) => {
                warn!("Registration failed: {}", e);
                self.store.dispatch(AuthEvent::Failed(e.to_string()));
            }
        }
    }

    /// Always ends anonymous, whatever the backend says.
    pub async fn logout(&self) {
        self.store.dispatch(AuthEvent::LogoutStarted);
        if let Err(e) = self.gateway.end_session().await {
            warn!("Sign-out call failed, clearing local session anyway: {}", e);
        }
        self.store.dispatch(AuthEvent::LoggedOut);
    }

    /// Restores the session from the gateway. Failures count as signed out.
    pub async fn refresh_session(&self) {
        self.store.dispatch(AuthEvent::SessionCheckStarted);
        match self.gateway.current_session().await {
            Ok(Some(session)) => self.store.dispatch(AuthEvent::Authenticated(session)),
            Ok(None) => self.store.dispatch(AuthEvent::SessionExpired),
            Err(e) => {
                warn!("Session check failed: {}", e);
                self.store.dispatch(AuthEvent::SessionExpired);
            }
        }
    }

    pub fn clear_error(&self) {
        self.store.dispatch(AuthEvent::ClearError);
    }

    /// Follows sign-in / sign-out notifications from the gateway until it goes away.
    pub fn watch_auth_changes(&self) -> JoinHandle<()> {
        let mut rx = self.gateway.auth_changes();
        let actions = self.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(AuthChange::SignedIn) => actions.refresh_session().await,
                    Ok(AuthChange::SignedOut) => actions.store.dispatch(AuthEvent::LoggedOut),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Auth listener lagged by {} notifications", skipped);
                        actions.refresh_session().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
