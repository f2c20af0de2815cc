//! Hosted backend adapter: GoTrue-style auth endpoints plus PostgREST tables
//! (`user_profiles`, `chat_rooms`, `room_members`, `messages`, `message_likes`).

use crate::{
    bus::{AuthChange, EventBus},
    chat::{Like, MessageKind, MessageRecord, RoomRecord, FULL_FETCH_LIMIT},
    entity::{Profile, Session, FALLBACK_DISPLAY_NAME},
    error::{GatewayError, Result},
    gateway::Gateway,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::{fmt, str::FromStr, time::Duration};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, warn};

const ROOMS_AGGREGATE_RPC: &str = "/rest/v1/rpc/get_rooms_with_metadata";

/// Which backend shape serves the room list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoomListing {
    /// Plain table read; member counts default to zero.
    #[default]
    Table,
    /// Remote procedure returning rooms with member count and last activity.
    Aggregate,
}

impl FromStr for RoomListing {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "table" => Ok(RoomListing::Table),
            "rpc" | "aggregate" => Ok(RoomListing::Aggregate),
            other => Err(format!("unknown room listing mode: {}", other)),
        }
    }
}

impl fmt::Display for RoomListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomListing::Table => f.write_str("table"),
            RoomListing::Aggregate => f.write_str("rpc"),
        }
    }
}

#[derive(Debug, Clone)]
struct AuthTokens {
    access_token: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    email: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    user: AuthUser,
}

/// Sign-up answers with a session when email confirmation is off, or with the
/// bare user when it is on.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(AuthUser),
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
    code: Option<Value>,
}

impl ErrorBody {
    fn text(&self) -> Option<String> {
        self.message
            .clone()
            .or_else(|| self.msg.clone())
            .or_else(|| self.error_description.clone())
            .or_else(|| self.error.clone())
    }

    fn code(&self) -> Option<String> {
        match &self.code {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Maps a non-success response body onto the gateway error taxonomy.
fn error_from_body(status: u16, body: &str) -> GatewayError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed.text().unwrap_or_else(|| {
        if body.trim().is_empty() {
            format!("HTTP {}", status)
        } else {
            body.trim().to_string()
        }
    });

    if parsed.code().as_deref() == Some("23505") || status == 409 {
        return GatewayError::Duplicate(message);
    }

    match status {
        401 => GatewayError::Unauthenticated,
        404 => GatewayError::NotFound(message),
        _ => GatewayError::Rejected { status, message },
    }
}

/// Client-side failures on the auth endpoints are user-facing credential errors.
fn auth_error(err: GatewayError) -> GatewayError {
    match err {
        GatewayError::Rejected { status, message } if (400..500).contains(&status) => GatewayError::Auth(message),
        GatewayError::Duplicate(message) => GatewayError::Auth(message),
        GatewayError::Unauthenticated => GatewayError::Auth("Invalid login credentials".to_string()),
        other => other,
    }
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_from_body(status.as_u16(), &body))
}

fn first_row<T>(rows: Vec<T>, what: &str) -> Result<T> {
    rows.into_iter().next().ok_or_else(|| GatewayError::Rejected {
        status: 200,
        message: format!("{} insert returned no row", what),
    })
}

pub struct RestGateway {
    client: reqwest::Client,
    base_url: String,
    anon_key: String,
    room_listing: RoomListing,
    tokens: RwLock<Option<AuthTokens>>,
    bus: EventBus,
}

impl RestGateway {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>, room_listing: RoomListing) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            room_listing,
            tokens: RwLock::new(None),
            bus: EventBus::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let bearer = match self.tokens.read().await.as_ref() {
            Some(tokens) => tokens.access_token.clone(),
            None => self.anon_key.clone(),
        };

        self.client
            .request(method, self.url(path))
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = check(request.send().await?).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<()> {
        check(request.send().await?).await?;
        Ok(())
    }

    async fn user_id(&self) -> Result<String> {
        self.tokens
            .read()
            .await
            .as_ref()
            .map(|t| t.user_id.clone())
            .ok_or(GatewayError::Unauthenticated)
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let request = self
            .request(Method::GET, "/rest/v1/user_profiles")
            .await
            .query(&[("select", "id,display_name".to_string()), ("id", format!("eq.{}", user_id))]);
        let rows: Vec<Profile> = self.fetch(request).await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_profile(&self, user_id: &str, display_name: &str) -> Result<()> {
        let request = self
            .request(Method::POST, "/rest/v1/user_profiles")
            .await
            .json(&json!({ "id": user_id, "display_name": display_name }));
        self.execute(request).await
    }

    async fn store_tokens(&self, token: &TokenResponse) {
        *self.tokens.write().await = Some(AuthTokens {
            access_token: token.access_token.clone(),
            user_id: token.user.id.clone(),
        });
    }

    async fn clear_tokens(&self) -> bool {
        self.tokens.write().await.take().is_some()
    }

    async fn insert_membership(&self, room_id: &str, user_id: &str) -> Result<()> {
        let request = self
            .request(Method::POST, "/rest/v1/room_members")
            .await
            .json(&json!({ "room_id": room_id, "user_id": user_id }));
        self.execute(request).await
    }
}

fn session_for(user: AuthUser, display_name: String) -> Session {
    Session {
        user_id: user.id,
        email: user.email.unwrap_or_default(),
        display_name,
        created_at: user.created_at,
    }
}

#[async_trait]
impl Gateway for RestGateway {
    async fn authenticate(&self, email: &str, password: &str) -> Result<Session> {
        let request = self
            .request(Method::POST, "/auth/v1/token")
            .await
            .query(&[("grant_type", "password")])
            .json(&json!({ "email": email, "password": password }));
        let token: TokenResponse = self.fetch(request).await.map_err(auth_error)?;
        self.store_tokens(&token).await;

        let display_name = match self.fetch_profile(&token.user.id).await {
            Ok(Some(profile)) => profile.display_name,
            Ok(None) => FALLBACK_DISPLAY_NAME.to_string(),
            Err(e) => {
                self.clear_tokens().await;
                return Err(e);
            }
        };

        self.bus.publish(AuthChange::SignedIn);
        Ok(session_for(token.user, display_name))
    }

    async fn create_account(&self, email: &str, password: &str, display_name: &str) -> Result<Session> {
        let request = self.request(Method::POST, "/auth/v1/signup").await.json(&json!({
            "email": email,
            "password": password,
            "data": { "display_name": display_name }
        }));
        let response: SignUpResponse = self.fetch(request).await.map_err(auth_error)?;

        let token = match response {
            SignUpResponse::Session(token) => token,
            SignUpResponse::User(_) => {
                return Err(GatewayError::Auth(
                    "Confirm your email address before signing in".to_string(),
                ))
            }
        };
        self.store_tokens(&token).await;

        // The profile row is normally created by a server trigger that may not
        // have run yet; insert it ourselves when the read comes back empty.
        let display_name = match self.fetch_profile(&token.user.id).await {
            Ok(Some(profile)) => profile.display_name,
            Ok(None) | Err(_) => {
                debug!("Profile for {} not readable yet, inserting it", token.user.id);
                if let Err(e) = self.insert_profile(&token.user.id, display_name).await {
                    self.clear_tokens().await;
                    return Err(e);
                }
                display_name.to_string()
            }
        };

        self.bus.publish(AuthChange::SignedIn);
        Ok(session_for(token.user, display_name))
    }

    async fn end_session(&self) -> Result<()> {
        let result = if self.tokens.read().await.is_some() {
            let request = self.request(Method::POST, "/auth/v1/logout").await;
            self.execute(request).await
        } else {
            Ok(())
        };

        // Local tokens go regardless of what the server said
        if self.clear_tokens().await {
            self.bus.publish(AuthChange::SignedOut);
        }
        result
    }

    async fn current_session(&self) -> Result<Option<Session>> {
        if self.tokens.read().await.is_none() {
            return Ok(None);
        }

        let request = self.request(Method::GET, "/auth/v1/user").await;
        let user: AuthUser = match self.fetch(request).await {
            Ok(user) => user,
            Err(GatewayError::Unauthenticated) => {
                if self.clear_tokens().await {
                    self.bus.publish(AuthChange::SignedOut);
                }
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let display_name = match self.fetch_profile(&user.id).await {
            Ok(Some(profile)) => profile.display_name,
            Ok(None) => FALLBACK_DISPLAY_NAME.to_string(),
            Err(e) => {
                warn!("Failed to read profile for {}: {}", user.id, e);
                FALLBACK_DISPLAY_NAME.to_string()
            }
        };

        Ok(Some(session_for(user, display_name)))
    }

    async fn list_rooms(&self) -> Result<Vec<RoomRecord>> {
        let request = match self.room_listing {
            RoomListing::Aggregate => self.request(Method::POST, ROOMS_AGGREGATE_RPC).await.json(&json!({})),
            RoomListing::Table => self
                .request(Method::GET, "/rest/v1/chat_rooms")
                .await
                .query(&[("select", "*"), ("order", "created_at.desc")]),
        };
        self.fetch(request).await
    }

    async fn create_room(&self, name: &str, description: Option<&str>) -> Result<RoomRecord> {
        let user_id = self.user_id().await?;

        let request = self
            .request(Method::POST, "/rest/v1/chat_rooms")
            .await
            .header("Prefer", "return=representation")
            .json(&json!({ "name": name, "description": description, "created_by": user_id }));
        let rows: Vec<RoomRecord> = self.fetch(request).await?;
        let mut room = first_row(rows, "chat_rooms")?;

        if let Err(e) = self.insert_membership(&room.id, &user_id).await {
            if !e.is_duplicate() {
                // Undo the room so a failed create leaves nothing behind
                let request = self
                    .request(Method::DELETE, "/rest/v1/chat_rooms")
                    .await
                    .query(&[("id", format!("eq.{}", room.id))]);
                if let Err(cleanup) = self.execute(request).await {
                    error!("Failed to roll back room {}: {}", room.id, cleanup);
                }
                return Err(e);
            }
        }

        room.member_count = room.member_count.max(1);
        Ok(room)
    }

    async fn add_membership(&self, room_id: &str) -> Result<()> {
        let user_id = self.user_id().await?;
        self.insert_membership(room_id, &user_id).await
    }

    async fn remove_membership(&self, room_id: &str) -> Result<()> {
        let user_id = self.user_id().await?;
        let request = self
            .request(Method::DELETE, "/rest/v1/room_members")
            .await
            .query(&[("room_id", format!("eq.{}", room_id)), ("user_id", format!("eq.{}", user_id))]);
        self.execute(request).await
    }

    async fn list_messages(&self, room_id: &str, since: Option<DateTime<Utc>>) -> Result<Vec<MessageRecord>> {
        let mut params = vec![
            ("select", "*".to_string()),
            ("room_id", format!("eq.{}", room_id)),
        ];
        match since {
            Some(since) => {
                params.push((
                    "created_at",
                    format!("gt.{}", since.to_rfc3339_opts(SecondsFormat::Micros, true)),
                ));
                params.push(("order", "created_at.asc".to_string()));
            }
            None => {
                params.push(("order", "created_at.desc".to_string()));
                params.push(("limit", FULL_FETCH_LIMIT.to_string()));
            }
        }

        let request = self.request(Method::GET, "/rest/v1/messages").await.query(&params);
        let mut rows: Vec<MessageRecord> = self.fetch(request).await?;
        if since.is_none() {
            rows.reverse();
        }
        Ok(rows)
    }

    async fn create_message(
        &self,
        room_id: &str,
        content: &str,
        kind: MessageKind,
        parent_id: Option<&str>,
    ) -> Result<MessageRecord> {
        let user_id = self.user_id().await?;
        let request = self
            .request(Method::POST, "/rest/v1/messages")
            .await
            .header("Prefer", "return=representation")
            .json(&json!({
                "room_id": room_id,
                "user_id": user_id,
                "content": content,
                "type": kind.as_str(),
                "parent_message_id": parent_id,
            }));
        let rows: Vec<MessageRecord> = self.fetch(request).await?;
        first_row(rows, "messages")
    }

    async fn soft_delete_message(&self, message_id: &str) -> Result<()> {
        let request = self
            .request(Method::PATCH, "/rest/v1/messages")
            .await
            .header("Prefer", "return=representation")
            .query(&[("id", format!("eq.{}", message_id))])
            .json(&json!({ "deleted_at": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true) }));
        let rows: Vec<MessageRecord> = self.fetch(request).await?;
        if rows.is_empty() {
            // Row-level security hides rows the caller may not touch
            return Err(GatewayError::NotFound(format!("message {}", message_id)));
        }
        Ok(())
    }

    async fn list_likes(&self, message_ids: &[String]) -> Result<Vec<Like>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let request = self
            .request(Method::GET, "/rest/v1/message_likes")
            .await
            .query(&[("select", "*".to_string()), ("message_id", format!("in.({})", message_ids.join(",")))]);
        self.fetch(request).await
    }

    async fn add_like(&self, message_id: &str, user_id: &str) -> Result<()> {
        let request = self
            .request(Method::POST, "/rest/v1/message_likes")
            .await
            .json(&json!({ "message_id": message_id, "user_id": user_id }));
        self.execute(request).await
    }

    async fn remove_like(&self, message_id: &str, user_id: &str) -> Result<()> {
        let request = self
            .request(Method::DELETE, "/rest/v1/message_likes")
            .await
            .query(&[("message_id", format!("eq.{}", message_id)), ("user_id", format!("eq.{}", user_id))]);
        self.execute(request).await
    }

    fn auth_changes(&self) -> broadcast::Receiver<AuthChange> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(409, r#"{"message":"conflict"}"#)]
    #[case(400, r#"{"code":"23505","message":"duplicate key value violates unique constraint"}"#)]
    fn unique_violations_map_to_duplicate(#[case] status: u16, #[case] body: &str) {
        let err = error_from_body(status, body);
        assert!(matches!(err, GatewayError::Duplicate(_)));
        assert!(err.is_duplicate());
    }

    #[test]
    fn status_codes_map_onto_taxonomy() {
        assert!(matches!(error_from_body(401, ""), GatewayError::Unauthenticated));
        assert!(matches!(error_from_body(404, "{}"), GatewayError::NotFound(_)));
        match error_from_body(500, "upstream down") {
            GatewayError::Rejected { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "upstream down");
            }
            other => panic!("unexpected {:?}", other),
        }
        match error_from_body(502, "  ") {
            GatewayError::Rejected { message, .. } => assert_eq!(message, "HTTP 502"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn auth_endpoint_rejections_become_auth_errors() {
        let err = auth_error(error_from_body(
            400,
            r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#,
        ));
        assert!(matches!(err, GatewayError::Auth(ref m) if m == "Invalid login credentials"));

        let err = auth_error(error_from_body(422, r#"{"msg":"User already registered"}"#));
        assert!(matches!(err, GatewayError::Auth(ref m) if m == "User already registered"));

        assert!(matches!(
            auth_error(error_from_body(503, "")),
            GatewayError::Rejected { status: 503, .. }
        ));
    }

    #[test]
    fn sign_up_response_shapes() {
        let with_session = r#"{
            "access_token": "tok",
            "user": {"id": "u1", "email": "a@b.c", "created_at": "2024-05-01T12:00:00Z"}
        }"#;
        assert!(matches!(
            serde_json::from_str::<SignUpResponse>(with_session).unwrap(),
            SignUpResponse::Session(_)
        ));

        let bare_user = r#"{"id": "u1", "email": "a@b.c", "created_at": "2024-05-01T12:00:00Z"}"#;
        assert!(matches!(
            serde_json::from_str::<SignUpResponse>(bare_user).unwrap(),
            SignUpResponse::User(_)
        ));
    }

    #[rstest]
    #[case("table", RoomListing::Table)]
    #[case("RPC", RoomListing::Aggregate)]
    #[case(" aggregate ", RoomListing::Aggregate)]
    fn room_listing_parses(#[case] raw: &str, #[case] expected: RoomListing) {
        assert_eq!(raw.parse::<RoomListing>().unwrap(), expected);
    }

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        let gateway = RestGateway::new("https://example.supabase.co/", "anon", RoomListing::Table).unwrap();
        assert_eq!(gateway.url("/rest/v1/messages"), "https://example.supabase.co/rest/v1/messages");
    }

    #[tokio::test]
    async fn writes_without_a_session_fail_fast() {
        let gateway = RestGateway::new("http://127.0.0.1:9", "anon", RoomListing::Table).unwrap();
        assert!(matches!(
            gateway.create_room("lobby", None).await,
            Err(GatewayError::Unauthenticated)
        ));
        assert_eq!(gateway.current_session().await.unwrap(), None);
        gateway.end_session().await.unwrap();
    }
}
