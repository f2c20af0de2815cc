//! Line-oriented terminal client.

use anyhow::Result;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::chat::{DeliveryStatus, EntryId, Message, MessageKind, Room};
use crate::manager::{ChatManager, RoomView};
use crate::poller::PollHandle;

pub const HELP: &str = "\
Commands:
  /login <email> <password>
  /register <email> <password> <display name>
  /logout
  /rooms                       list rooms
  /create <name> [| description]
  /join <room> | /leave <room>  room id or list number
  /open <room> | /close
  /reply <n> | /cancel         reply to message n of the open room
  /like <n> | /unlike <n> | /delete <n>
  /retry <n>                   resend a failed message
  /help | /quit
Anything else is sent to the open room.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { email: String, password: String },
    Register { email: String, password: String, display_name: String },
    Logout,
    Rooms,
    Create { name: String, description: Option<String> },
    Join(String),
    Leave(String),
    Open(String),
    Close,
    Reply(usize),
    Cancel,
    Like(usize),
    Unlike(usize),
    Delete(usize),
    Retry(usize),
    Help,
    Quit,
    Say(String),
}

fn index_arg(name: &str, rest: &str) -> Result<usize, String> {
    rest.trim()
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| format!("Usage: /{} <message number>", name))
}

fn word_arg(name: &str, rest: &str) -> Result<String, String> {
    let rest = rest.trim();
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        return Err(format!("Usage: /{} <room>", name));
    }
    Ok(rest.to_string())
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let Some(body) = line.strip_prefix('/') else {
            return Ok(Command::Say(line.to_string()));
        };
        let (name, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));

        match name.to_ascii_lowercase().as_str() {
            "login" => {
                let mut parts = rest.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(email), Some(password), None) => Ok(Command::Login {
                        email: email.to_string(),
                        password: password.to_string(),
                    }),
                    _ => Err("Usage: /login <email> <password>".to_string()),
                }
            }
            "register" => {
                let mut parts = rest.trim().splitn(3, char::is_whitespace);
                match (parts.next(), parts.next(), parts.next().map(str::trim)) {
                    (Some(email), Some(password), Some(display_name)) if !email.is_empty() && !display_name.is_empty() => {
                        Ok(Command::Register {
                            email: email.to_string(),
                            password: password.to_string(),
                            display_name: display_name.to_string(),
                        })
                    }
                    _ => Err("Usage: /register <email> <password> <display name>".to_string()),
                }
            }
            "logout" => Ok(Command::Logout),
            "rooms" => Ok(Command::Rooms),
            "create" => {
                let (name, description) = match rest.split_once('|') {
                    Some((name, description)) => (name.trim(), Some(description.trim().to_string())),
                    None => (rest.trim(), None),
                };
                if name.is_empty() {
                    return Err("Usage: /create <name> [| description]".to_string());
                }
                Ok(Command::Create {
                    name: name.to_string(),
                    description: description.filter(|d| !d.is_empty()),
                })
            }
            "join" => word_arg("join", rest).map(Command::Join),
            "leave" => word_arg("leave", rest).map(Command::Leave),
            "open" => word_arg("open", rest).map(Command::Open),
            "close" => Ok(Command::Close),
            "reply" => index_arg("reply", rest).map(Command::Reply),
            "cancel" => Ok(Command::Cancel),
            "like" => index_arg("like", rest).map(Command::Like),
            "unlike" => index_arg("unlike", rest).map(Command::Unlike),
            "delete" => index_arg("delete", rest).map(Command::Delete),
            "retry" => index_arg("retry", rest).map(Command::Retry),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(format!("Unknown command /{}. Try /help", other)),
        }
    }
}

pub fn render_room(number: usize, room: &Room) -> String {
    let id = match &room.id {
        EntryId::Confirmed(id) => id.clone(),
        EntryId::Pending(_) => "creating...".to_string(),
    };
    let mut line = format!("{:>3}. {} [{}] {} member(s)", number, room.name, id, room.member_count);
    if let Some(description) = &room.description {
        line.push_str(&format!(" - {}", description));
    }
    line
}

/// One line per message; `own` marks messages written by the signed-in user.
pub fn render_message(number: usize, message: &Message, likes: usize, own: bool) -> String {
    let author = if own { "you" } else { message.author_id.as_str() };
    let mut line = format!("{:>3}. {} {}: ", number, message.created_at.format("%H:%M"), author);

    if let Some(reply) = &message.reply {
        line.push_str(&format!("(re {}: \"{}\") ", reply.author_id, reply.text()));
    }
    line.push_str(message.display_content());
    if likes > 0 {
        line.push_str(&format!("  [{} like(s)]", likes));
    }
    match message.status {
        DeliveryStatus::Sending => line.push_str("  (sending)"),
        DeliveryStatus::Failed => line.push_str("  (failed, /retry to resend)"),
        DeliveryStatus::Sent => {}
    }
    line
}

pub struct Terminal {
    manager: Arc<ChatManager>,
    view: Option<RoomView>,
    room_watch: Option<PollHandle>,
}

impl Terminal {
    pub fn new(manager: Arc<ChatManager>) -> Self {
        Self {
            manager,
            view: None,
            room_watch: None,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let printer = self.spawn_printer();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        match self.manager.auth_state().session {
            Some(session) => println!("Signed in as {}. Type /help for commands.", session),
            None => println!("Not signed in. Use /login or /register, /help for commands."),
        }

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<Command>() {
                Ok(Command::Quit) => break,
                Ok(command) => self.execute(command).await,
                Err(usage) => println!("{}", usage),
            }
            self.report_errors();
        }

        printer.abort();
        info!("Terminal closed");
        Ok(())
    }

    /// Prints messages of the open room as they appear or change.
    fn spawn_printer(&self) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let mut rx = manager.subscribe_messages();

        tokio::spawn(async move {
            let mut shown: HashSet<String> = HashSet::new();
            let mut shown_room: Option<String> = None;

            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                let Some(room_id) = manager.rooms_state().active_room else {
                    continue;
                };
                if shown_room.as_deref() != Some(room_id.as_str()) {
                    shown.clear();
                    shown_room = Some(room_id.clone());
                }
                let me = manager.auth_state().user_id().map(str::to_string);

                for (i, message) in state.messages(&room_id).iter().enumerate() {
                    let likes = message.durable_id().map(|id| state.like_count(id)).unwrap_or(0);
                    let key = format!("{}:{:?}:{}:{}", message.id, message.status, message.is_deleted(), likes);
                    if shown.insert(key) {
                        let own = me.as_deref() == Some(message.author_id.as_str());
                        println!("{}", render_message(i + 1, message, likes, own));
                    }
                }
            }
        })
    }

    fn report_errors(&self) {
        let manager = &self.manager;
        if let Some(error) = manager.auth_state().error {
            println!("! {}", error);
            manager.auth.clear_error();
        }
        if let Some(error) = manager.rooms_state().error {
            println!("! {}", error);
            manager.rooms.clear_error();
        }
        if let Some(error) = manager.messages_state().error {
            println!("! {}", error);
            manager.messages.clear_error();
        }
    }

    /// Accepts a room id or its number in the last listing.
    fn resolve_room(&self, arg: &str) -> String {
        let rooms = self.manager.rooms_state().rooms;
        arg.parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| rooms.get(i))
            .and_then(|room| room.id.durable().map(str::to_string))
            .unwrap_or_else(|| arg.to_string())
    }

    fn open_message(&self, number: usize) -> Option<(String, Message)> {
        let Some(view) = &self.view else {
            println!("Open a room first");
            return None;
        };
        let room_id = view.room_id().to_string();
        let message = self.manager.messages_state().messages(&room_id).get(number - 1).cloned();
        match message {
            Some(message) => Some((room_id, message)),
            None => {
                println!("No message {}", number);
                None
            }
        }
    }

    fn durable_message(&self, number: usize) -> Option<(String, String)> {
        let (room_id, message) = self.open_message(number)?;
        match message.durable_id() {
            Some(id) => Some((room_id, id.to_string())),
            None => {
                println!("Message {} has not been delivered yet", number);
                None
            }
        }
    }

    async fn execute(&mut self, command: Command) {
        debug!(?command, "terminal command");
        let manager = self.manager.clone();

        match command {
            Command::Login { email, password } => {
                manager.auth.login(&email, &password).await;
                if let Some(session) = manager.auth_state().session {
                    println!("Welcome back, {}", session.display_name);
                }
            }
            Command::Register {
                email,
                password,
                display_name,
            } => {
                manager.auth.register(&email, &password, &display_name).await;
                if let Some(session) = manager.auth_state().session {
                    println!("Welcome, {}", session.display_name);
                }
            }
            Command::Logout => {
                self.view = None;
                self.room_watch = None;
                manager.auth.logout().await;
                println!("Signed out");
            }
            Command::Rooms => {
                if self.room_watch.is_none() {
                    self.room_watch = Some(manager.watch_rooms());
                }
                manager.rooms.fetch_rooms().await;
                let rooms = manager.rooms_state().rooms;
                if rooms.is_empty() {
                    println!("No rooms yet. Create the first one with /create");
                }
                for (i, room) in rooms.iter().enumerate() {
                    println!("{}", render_room(i + 1, room));
                }
            }
            Command::Create { name, description } => {
                if let Some(room) = manager.rooms.create_room(&name, description.as_deref()).await {
                    println!("Created {}", render_room(1, &room));
                }
            }
            Command::Join(room) => {
                let room_id = self.resolve_room(&room);
                manager.rooms.join_room(&room_id).await;
            }
            Command::Leave(room) => {
                let room_id = self.resolve_room(&room);
                if self.view.as_ref().map(|v| v.room_id()) == Some(room_id.as_str()) {
                    self.view = None;
                }
                manager.rooms.leave_room(&room_id).await;
            }
            Command::Open(room) => {
                let room_id = self.resolve_room(&room);
                manager.rooms.join_room(&room_id).await;
                self.view = Some(manager.open_room(&room_id));
                println!("Opened {}", room_id);
            }
            Command::Close => {
                self.view = None;
                manager.messages.clear_reply_target();
            }
            Command::Reply(number) => {
                if let Some((_, message)) = self.open_message(number) {
                    println!("Replying to: {}", message.display_content());
                    manager.messages.set_reply_target(message);
                }
            }
            Command::Cancel => manager.messages.clear_reply_target(),
            Command::Like(number) => {
                if let Some((_, id)) = self.durable_message(number) {
                    manager.messages.like(&id).await;
                }
            }
            Command::Unlike(number) => {
                if let Some((_, id)) = self.durable_message(number) {
                    manager.messages.unlike(&id).await;
                }
            }
            Command::Delete(number) => {
                if let Some((room_id, id)) = self.durable_message(number) {
                    manager.messages.delete_message(&room_id, &id).await;
                }
            }
            Command::Retry(number) => {
                if let Some((room_id, message)) = self.open_message(number) {
                    match message.temp_id.filter(|_| message.status == DeliveryStatus::Failed) {
                        Some(temp_id) => manager.messages.retry_send(&room_id, temp_id).await,
                        None => println!("Message {} did not fail", number),
                    }
                }
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => {}
            Command::Say(text) => match &self.view {
                Some(view) => {
                    let room_id = view.room_id().to_string();
                    manager
                        .messages
                        .send_message(&room_id, &text, MessageKind::infer(&text))
                        .await;
                }
                None => println!("Open a room first (/rooms, /open <room>)"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{MessageRecord, ReplyPreview, TempIds, DELETED_MESSAGE_PLACEHOLDER};
    use chrono::{TimeZone, Utc};
    use rstest::rstest;

    #[rstest]
    #[case("/login ada@example.com hunter22", Command::Login { email: "ada@example.com".into(), password: "hunter22".into() })]
    #[case("/register ada@example.com hunter22 Ada Lovelace", Command::Register {
        email: "ada@example.com".into(),
        password: "hunter22".into(),
        display_name: "Ada Lovelace".into(),
    })]
    #[case("/create general", Command::Create { name: "general".into(), description: None })]
    #[case("/create the lounge | somewhere to relax", Command::Create {
        name: "the lounge".into(),
        description: Some("somewhere to relax".into()),
    })]
    #[case("/open 2", Command::Open("2".into()))]
    #[case("/reply 3", Command::Reply(3))]
    #[case("/RETRY 1", Command::Retry(1))]
    #[case("/quit", Command::Quit)]
    #[case("  hello there  ", Command::Say("hello there".into()))]
    fn parses_commands(#[case] line: &str, #[case] expected: Command) {
        assert_eq!(line.parse::<Command>().unwrap(), expected);
    }

    #[rstest]
    #[case("/login ada@example.com")]
    #[case("/register ada@example.com hunter22")]
    #[case("/create")]
    #[case("/like 0")]
    #[case("/delete x")]
    #[case("/join two words")]
    #[case("/dance")]
    fn rejects_bad_commands(#[case] line: &str) {
        assert!(line.parse::<Command>().is_err());
    }

    fn message(content: &str) -> Message {
        Message::from(MessageRecord {
            id: "m1".into(),
            room_id: "r1".into(),
            user_id: "bob".into(),
            content: content.into(),
            kind: MessageKind::Text,
            parent_message_id: None,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 5, 0).unwrap(),
            deleted_at: None,
        })
    }

    #[test]
    fn renders_message_lines() {
        let mut m = message("hi");
        assert_eq!(render_message(1, &m, 0, false), "  1. 09:05 bob: hi");

        m.reply = Some(ReplyPreview {
            author_id: "ada".into(),
            content: None,
        });
        m.deleted_at = Some(Utc::now());
        let line = render_message(2, &m, 3, true);
        assert!(line.contains("you:"));
        assert!(line.contains("[Deleted message]"));
        assert!(line.contains(DELETED_MESSAGE_PLACEHOLDER));
        assert!(line.ends_with("[3 like(s)]"));
    }

    #[test]
    fn renders_pending_states() {
        let temp = TempIds::new().next();
        let mut m = Message::pending(temp, "r1", "ada", "yo", MessageKind::Text, None);
        assert!(render_message(1, &m, 0, true).ends_with("(sending)"));
        m.status = DeliveryStatus::Failed;
        assert!(render_message(1, &m, 0, true).contains("/retry"));
    }

    #[test]
    fn renders_rooms() {
        let room = Room::pending(TempIds::new().next(), "lobby", Some("hang out".into()), "ada");
        assert_eq!(render_room(1, &room), "  1. lobby [creating...] 1 member(s) - hang out");
    }
}
