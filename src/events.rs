use crate::models::Message;
use dashmap::DashMap;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatCreated {
    pub chat_id: String,
    pub ai_model_id: i64,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageSent {
    pub chat_id: String,
    pub user_message: Message,
    pub ai_message: Message,
    pub is_first_user_message: bool,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSummary {
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
}

// Every event that travels over the bus. Domain events are emitted by the
// managers, the `*Requested` ones by whatever stands in for DOM input.
#[derive(Clone, Debug, PartialEq)]
pub enum AppEvent {
    ChatCreated(ChatCreated),
    ChatRemoved { chat_id: String, archived: bool },
    ChatMinimized { chat_id: String },
    ChatRestored { chat_id: String },
    ModelChanged { chat_id: String, old_model_id: i64, new_model_id: i64 },
    MessageSent(MessageSent),
    MessageError { chat_id: String, error: String },
    BroadcastCompleted(BroadcastSummary),

    // APIManager progress for the send-message path
    ApiSending { chat_id: String, ai_model_id: i64 },
    ApiResponded { chat_id: String },
    ApiFailed { chat_id: String, error: String },

    NewChatRequested { ai_model_id: Option<i64> },
    SendRequested { chat_id: String, text: String },
    CloseRequested { chat_id: String, save_to_history: bool },
    MinimizeRequested { chat_id: String },
    RestoreRequested { chat_id: String },
    ModelSelected { chat_id: String, ai_model_id: i64 },
    BroadcastRequested { text: String },
    ClearChatsRequested { include_started: bool },
    HistoryReopenRequested { index: usize },
    ThemeToggleRequested,
    SidebarToggleRequested,
    ViewportResized { width: u32 },

    // Blocking user-facing error
    Alert { message: String },
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum EventKind {
    ChatCreated,
    ChatRemoved,
    ChatMinimized,
    ChatRestored,
    ModelChanged,
    MessageSent,
    MessageError,
    BroadcastCompleted,
    ApiSending,
    ApiResponded,
    ApiFailed,
    NewChatRequested,
    SendRequested,
    CloseRequested,
    MinimizeRequested,
    RestoreRequested,
    ModelSelected,
    BroadcastRequested,
    ClearChatsRequested,
    HistoryReopenRequested,
    ThemeToggleRequested,
    SidebarToggleRequested,
    ViewportResized,
    Alert,
}

impl AppEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AppEvent::ChatCreated(_) => EventKind::ChatCreated,
            AppEvent::ChatRemoved { .. } => EventKind::ChatRemoved,
            AppEvent::ChatMinimized { .. } => EventKind::ChatMinimized,
            AppEvent::ChatRestored { .. } => EventKind::ChatRestored,
            AppEvent::ModelChanged { .. } => EventKind::ModelChanged,
            AppEvent::MessageSent(_) => EventKind::MessageSent,
            AppEvent::MessageError { .. } => EventKind::MessageError,
            AppEvent::BroadcastCompleted(_) => EventKind::BroadcastCompleted,
            AppEvent::ApiSending { .. } => EventKind::ApiSending,
            AppEvent::ApiResponded { .. } => EventKind::ApiResponded,
            AppEvent::ApiFailed { .. } => EventKind::ApiFailed,
            AppEvent::NewChatRequested { .. } => EventKind::NewChatRequested,
            AppEvent::SendRequested { .. } => EventKind::SendRequested,
            AppEvent::CloseRequested { .. } => EventKind::CloseRequested,
            AppEvent::MinimizeRequested { .. } => EventKind::MinimizeRequested,
            AppEvent::RestoreRequested { .. } => EventKind::RestoreRequested,
            AppEvent::ModelSelected { .. } => EventKind::ModelSelected,
            AppEvent::BroadcastRequested { .. } => EventKind::BroadcastRequested,
            AppEvent::ClearChatsRequested { .. } => EventKind::ClearChatsRequested,
            AppEvent::HistoryReopenRequested { .. } => EventKind::HistoryReopenRequested,
            AppEvent::ThemeToggleRequested => EventKind::ThemeToggleRequested,
            AppEvent::SidebarToggleRequested => EventKind::SidebarToggleRequested,
            AppEvent::ViewportResized { .. } => EventKind::ViewportResized,
            AppEvent::Alert { .. } => EventKind::Alert,
        }
    }
}

pub type Callback = Arc<dyn Fn(&AppEvent) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Listener {
    id: ListenerId,
    once: bool,
    callback: Callback,
}

/// Publish/subscribe hub keyed by [`EventKind`].
#[derive(Default)]
pub struct EventBus {
    listeners: DashMap<EventKind, Vec<Listener>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(callback), false)
    }

    /// Like [`EventBus::on`], but the listener is dropped after its first call.
    pub fn once<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(callback), true)
    }

    fn register(&self, kind: EventKind, callback: Callback, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .entry(kind)
            .or_default()
            .push(Listener { id, once, callback });
        id
    }

    /// Returns false when the listener was not registered for `kind`.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let Some(mut listeners) = self.listeners.get_mut(&kind) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        before != listeners.len()
    }

    /// Calls every listener registered for the event's kind, in registration order.
    ///
    /// The listener list is snapshotted first: listeners added or removed by a
    /// callback only affect later emissions. The map guard is released before
    /// any callback runs, so callbacks may freely call back into the bus.
    pub fn emit(&self, event: AppEvent) {
        let kind = event.kind();
        let snapshot: Vec<Listener> = match self.listeners.get_mut(&kind) {
            Some(mut listeners) => {
                let snapshot = listeners.clone();
                listeners.retain(|l| !l.once);
                snapshot
            }
            None => return,
        };

        log::debug!("Emitting {:?} to {} listener(s)", kind, snapshot.len());
        for listener in snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| (listener.callback)(&event)));
            if result.is_err() {
                log::error!("Listener for {:?} panicked; continuing dispatch", kind);
            }
        }
    }

    pub fn clear_event(&self, kind: EventKind) {
        self.listeners.remove(&kind);
    }

    pub fn clear(&self) {
        self.listeners.clear();
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map(|l| l.len()).unwrap_or(0)
    }
}
