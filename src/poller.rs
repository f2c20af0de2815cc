use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use crate::actions::{MessageActions, RoomActions};

pub const MESSAGE_POLL_INTERVAL: Duration = Duration::from_millis(3000);
pub const ROOM_LIST_POLL_INTERVAL: Duration = Duration::from_millis(10_000);

/// A repeating background task. The first tick runs immediately; the task is
/// aborted when the handle is dropped.
pub struct PollHandle {
    name: String,
    task: JoinHandle<()>,
}

impl PollHandle {
    pub fn spawn<F>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let name = name.into();
        let task = task::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        debug!("Started poller {} every {:?}", name, period);
        Self { name, task }
    }

    pub fn cancel(self) {
        drop(self);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.task.abort();
        debug!("Stopped poller {}", self.name);
    }
}

/// Keeps an open room fresh: one full fetch, then incremental fetches from the
/// watermark read at each tick.
pub fn watch_room(actions: MessageActions, room_id: String, period: Duration) -> PollHandle {
    let mut loaded = false;
    PollHandle::spawn(format!("room {}", room_id), period, move || {
        let actions = actions.clone();
        let room_id = room_id.clone();
        let full = !std::mem::replace(&mut loaded, true);
        async move {
            if full {
                actions.fetch_messages(&room_id, None).await;
            } else {
                actions.sync_room(&room_id).await;
            }
        }
        .boxed()
    })
}

pub fn watch_room_list(actions: RoomActions, period: Duration) -> PollHandle {
    PollHandle::spawn("room list", period, move || {
        let actions = actions.clone();
        async move { actions.fetch_rooms().await }.boxed()
    })
}
