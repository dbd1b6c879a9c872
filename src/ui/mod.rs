pub mod model_selector;
pub mod surface;

pub use model_selector::ModelSelector;
pub use surface::{HeadlessSurface, HistoryItemView, PaneView, SelectorView, Surface, TerminalSurface};

use crate::events::{AppEvent, EventBus, EventKind};
use crate::models::{AiModel, Chat, HistoryEntry};
use crate::state::{StateManager, Unsubscribe};
use model_selector::model_name;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub const MAX_LAYOUT: usize = 6;
const HISTORY_TITLE_LEN: usize = 40;

/// What a chat render pass changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RenderDiff {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

/// CSS layout class for a number of visible panes, clamped to `layout-1..layout-6`.
pub fn layout_class(visible: usize) -> String {
    format!("layout-{}", visible.clamp(1, MAX_LAYOUT))
}

/// Projects session state onto a [`Surface`]. Panes are diffed by chat id so
/// existing panes are never rebuilt.
pub struct UiManager {
    me: Weak<UiManager>,
    state: Arc<StateManager>,
    surface: Arc<Mutex<dyn Surface>>,
    mounted: Mutex<Vec<PaneView>>,
    subscriptions: Mutex<Vec<Unsubscribe>>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl UiManager {
    pub fn new(state: Arc<StateManager>, surface: Arc<Mutex<dyn Surface>>) -> Arc<Self> {
        Arc::new_cyclic(|me| UiManager {
            me: me.clone(),
            state,
            surface,
            mounted: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Subscribes to the store keys and bus events that drive rendering.
    pub fn attach(&self, bus: &EventBus) {
        let mut subscriptions = lock(&self.subscriptions);
        subscriptions.push(self.watch("chats", |ui, value| {
            match serde_json::from_value::<Vec<Chat>>(value.clone()) {
                Ok(chats) => {
                    ui.render_chats(&chats);
                }
                Err(e) => log::error!("Cannot render chats: {}", e),
            }
        }));
        subscriptions.push(self.watch("chatHistory", |ui, value| {
            match serde_json::from_value::<Vec<HistoryEntry>>(value.clone()) {
                Ok(history) => ui.render_history(&history),
                Err(e) => log::error!("Cannot render history: {}", e),
            }
        }));
        subscriptions.push(self.watch("isDarkMode", |ui, value| {
            lock(&ui.surface).set_theme(value.as_bool().unwrap_or(false));
        }));
        subscriptions.push(self.watch("ui.sidebarCollapsed", |ui, value| {
            lock(&ui.surface).set_sidebar_collapsed(value.as_bool().unwrap_or(false));
        }));

        let me = self.me.clone();
        bus.on(EventKind::Alert, move |event| {
            if let (Some(ui), AppEvent::Alert { message }) = (me.upgrade(), event) {
                lock(&ui.surface).show_alert(message);
            }
        });
    }

    fn watch<F>(&self, key: &str, render: F) -> Unsubscribe
    where
        F: Fn(&UiManager, &Value) + Send + Sync + 'static,
    {
        let me = self.me.clone();
        self.state.subscribe(key, move |value| {
            if let Some(ui) = me.upgrade() {
                render(&ui, value);
            }
        })
    }

    pub fn detach(&self) {
        for unsubscribe in lock(&self.subscriptions).drain(..) {
            unsubscribe();
        }
    }

    /// Full render from the current state, used once after boot.
    pub fn render_all(&self) {
        let chats: Vec<Chat> = self.state.get_as("chats").unwrap_or_default();
        let history: Vec<HistoryEntry> = self.state.get_as("chatHistory").unwrap_or_default();
        let dark = self.state.get_as("isDarkMode").unwrap_or(false);
        let collapsed = self.state.get_as("ui.sidebarCollapsed").unwrap_or(false);
        {
            let mut surface = lock(&self.surface);
            surface.set_theme(dark);
            surface.set_sidebar_collapsed(collapsed);
        }
        self.render_chats(&chats);
        self.render_history(&history);
    }

    pub fn render_chats(&self, chats: &[Chat]) -> RenderDiff {
        let models: Vec<AiModel> = self.state.get_as("aiTypes").unwrap_or_default();
        let visible: Vec<PaneView> = chats
            .iter()
            .filter(|c| !c.is_minimized)
            .map(|c| pane_view(c, &models))
            .collect();

        let mut diff = RenderDiff::default();
        {
            let mut mounted = lock(&self.mounted);
            let mut surface = lock(&self.surface);

            mounted.retain(|pane| {
                let keep = visible.iter().any(|v| v.chat_id == pane.chat_id);
                if !keep {
                    surface.unmount_pane(&pane.chat_id);
                    diff.removed.push(pane.chat_id.clone());
                }
                keep
            });

            for pane in &visible {
                match mounted.iter_mut().find(|m| m.chat_id == pane.chat_id) {
                    Some(existing) if existing == pane => {}
                    Some(existing) => {
                        surface.update_pane(pane);
                        *existing = pane.clone();
                        diff.updated.push(pane.chat_id.clone());
                    }
                    None => {
                        surface.mount_pane(pane);
                        mounted.push(pane.clone());
                        diff.added.push(pane.chat_id.clone());
                    }
                }
            }

            let count = visible.len();
            surface.set_layout(&layout_class(count));
            surface.set_welcome_visible(count == 0);
        }

        self.state
            .set_value("ui.welcomeScreenVisible", Value::Bool(visible.is_empty()), true);
        if !diff.added.is_empty() || !diff.removed.is_empty() {
            log::debug!("Rendered chats: +{} -{}", diff.added.len(), diff.removed.len());
        }
        diff
    }

    pub fn render_history(&self, history: &[HistoryEntry]) {
        let models: Vec<AiModel> = self.state.get_as("aiTypes").unwrap_or_default();
        let items: Vec<HistoryItemView> = history
            .iter()
            .enumerate()
            .map(|(index, entry)| HistoryItemView {
                index,
                title: history_title(&entry.chat),
                model_name: model_name(&models, entry.chat.ai_model_id),
                message_count: entry.chat.messages.len(),
                closed_timestamp: entry.closed_timestamp,
            })
            .collect();
        lock(&self.surface).render_history(&items);
    }
}

fn pane_view(chat: &Chat, models: &[AiModel]) -> PaneView {
    let model = models.iter().find(|m| m.id == chat.ai_model_id);
    PaneView {
        chat_id: chat.id.clone(),
        model_name: model_name(models, chat.ai_model_id),
        model_icon: model.map(|m| m.icon.clone()).unwrap_or_default(),
        selector: ModelSelector::view(chat, models),
        messages: chat.messages.clone(),
    }
}

// First user message, shortened
fn history_title(chat: &Chat) -> String {
    let text = chat
        .messages
        .iter()
        .find(|m| m.is_user)
        .map(|m| m.text.trim())
        .unwrap_or("Untitled chat");
    if text.chars().count() > HISTORY_TITLE_LEN {
        let cut: String = text.chars().take(HISTORY_TITLE_LEN).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, Message, SessionState};
    use std::time::Duration;

    fn setup() -> (Arc<UiManager>, Arc<StateManager>, Arc<Mutex<HeadlessSurface>>) {
        let categories: Vec<Category> = serde_json::from_value(serde_json::json!([
            { "id": 1, "name": "Text", "models": [{ "id": 10, "name": "X", "icon": "x.png" }] }
        ]))
        .unwrap();
        let state = StateManager::new(Duration::from_millis(50));
        state.initialize(&SessionState::new(categories, 6, false)).unwrap();
        let surface = Arc::new(Mutex::new(HeadlessSurface::new()));
        let ui = UiManager::new(state.clone(), surface.clone());
        (ui, state, surface)
    }

    fn chat(id: &str) -> Chat {
        Chat {
            id: id.to_string(),
            ..Chat::new(10, vec![])
        }
    }

    #[test]
    fn layout_is_clamped() {
        assert_eq!(layout_class(0), "layout-1");
        assert_eq!(layout_class(3), "layout-3");
        assert_eq!(layout_class(9), "layout-6");
    }

    #[test]
    fn panes_are_diffed_not_rebuilt() {
        let (ui, _, surface) = setup();
        let mut chats = vec![chat("a"), chat("b")];

        let diff = ui.render_chats(&chats);
        assert_eq!(diff.added, vec!["a", "b"]);
        assert_eq!(surface.lock().unwrap().layout, "layout-2");

        assert_eq!(ui.render_chats(&chats), RenderDiff::default());

        chats.remove(0);
        chats.push(chat("c"));
        let diff = ui.render_chats(&chats);
        assert_eq!(diff.added, vec!["c"]);
        assert_eq!(diff.removed, vec!["a"]);

        let surface = surface.lock().unwrap();
        assert_eq!(surface.pane_ids(), vec!["b", "c"]);
        assert_eq!(surface.mounts, 3);
        assert_eq!(surface.unmounts, 1);
    }

    #[test]
    fn new_messages_update_in_place() {
        let (ui, _, surface) = setup();
        let mut chats = vec![chat("a")];
        ui.render_chats(&chats);
        chats[0].messages.push(Message::user("hi"));

        let diff = ui.render_chats(&chats);
        assert_eq!(diff.updated, vec!["a"]);
        let surface = surface.lock().unwrap();
        assert_eq!(surface.mounts, 1);
        assert_eq!(surface.updates, 1);
        let pane = surface.pane("a").unwrap();
        assert_eq!(pane.messages.len(), 1);
        assert!(matches!(pane.selector, SelectorView::Locked { .. }));
    }

    #[test]
    fn minimized_chats_are_hidden_and_welcome_shows_when_empty() {
        let (ui, state, surface) = setup();
        let mut chats = vec![chat("a")];
        ui.render_chats(&chats);
        assert!(!surface.lock().unwrap().welcome_visible);

        chats[0].is_minimized = true;
        ui.render_chats(&chats);
        let s = surface.lock().unwrap();
        assert!(s.panes.is_empty());
        assert!(s.welcome_visible);
        assert_eq!(s.layout, "layout-1");
        assert_eq!(state.get_state(Some("ui.welcomeScreenVisible")), Some(Value::Bool(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn state_changes_drive_rendering() {
        let (ui, state, surface) = setup();
        let bus = EventBus::new();
        ui.attach(&bus);

        state.set_state("chats", &vec![chat("a")], false).unwrap();
        state.set_state("chats", &vec![chat("a"), chat("b")], false).unwrap();
        state.set_value("isDarkMode", Value::Bool(true), false);
        tokio::time::sleep(Duration::from_millis(150)).await;

        {
            let s = surface.lock().unwrap();
            assert_eq!(s.pane_ids(), vec!["a", "b"]);
            assert_eq!(s.mounts, 2);
            assert!(s.dark);
        }

        bus.emit(AppEvent::Alert {
            message: "nope".to_string(),
        });
        assert_eq!(surface.lock().unwrap().alerts, vec!["nope"]);

        ui.detach();
        state.set_state("chats", &Vec::<Chat>::new(), false).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(surface.lock().unwrap().panes.len(), 2);
    }

    #[test]
    fn history_items_use_first_user_message() {
        let (ui, _, surface) = setup();
        let long = "x".repeat(60);
        let entries = vec![
            HistoryEntry {
                chat: Chat::new(10, vec![Message::ai("hello"), Message::user("What is Rust?")]),
                closed_timestamp: 2,
            },
            HistoryEntry {
                chat: Chat::new(10, vec![Message::user(long)]),
                closed_timestamp: 1,
            },
        ];
        ui.render_history(&entries);
        let s = surface.lock().unwrap();
        assert_eq!(s.history[0].title, "What is Rust?");
        assert_eq!(s.history[0].model_name, "X");
        assert_eq!(s.history[1].title.len(), HISTORY_TITLE_LEN + 3);
    }
}
