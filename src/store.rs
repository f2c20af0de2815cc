use std::fmt::Debug;
use tokio::sync::watch;
use tracing::debug;

/// A pure state machine: applying an event to a state yields the next state.
pub trait Reducer: Clone + Default + Send + Sync + 'static {
    type Event: Debug + Send;

    fn apply(&self, event: Self::Event) -> Self;
}

/// Holds the current state of one reducer and notifies subscribers of every change.
///
/// State is only ever replaced through [`Store::dispatch`].
pub struct Store<S: Reducer> {
    tx: watch::Sender<S>,
}

impl<S: Reducer> Store<S> {
    pub fn new() -> Self {
        Self::with_state(S::default())
    }

    pub fn with_state(state: S) -> Self {
        let (tx, _rx) = watch::channel(state);
        Self { tx }
    }

    pub fn dispatch(&self, event: S::Event) {
        debug!(?event, "dispatch");
        self.tx.send_modify(|state| *state = state.apply(event));
    }

    pub fn snapshot(&self) -> S {
        self.tx.borrow().clone()
    }

    /// Reads from the current state without cloning it.
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }
}

impl<S: Reducer> Default for Store<S> {
    fn default() -> Self {
        Self::new()
    }
}
