// Glue between input events on the bus and the managers.

use crate::chat::{ChatError, ChatManager};
use crate::events::{AppEvent, EventBus, EventKind};
use crate::models::{UiState, Viewport};
use crate::state::StateManager;
use crate::storage::LocalStore;
use crate::ui::ModelSelector;
use std::future::Future;
use std::sync::{Arc, Weak};

// Failures surface as a blocking alert on the UI
fn alert(bus: &Weak<EventBus>, error: impl std::fmt::Display) {
    if let Some(bus) = bus.upgrade() {
        bus.emit(AppEvent::Alert {
            message: error.to_string(),
        });
    }
}

fn spawn<F>(what: &str, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => log::error!("No async runtime available to {}", what),
    }
}

pub struct ChatHandlers;

impl ChatHandlers {
    pub fn register(bus: &Arc<EventBus>, chats: Arc<ChatManager>, selector: Arc<ModelSelector>) {
        let weak_bus = Arc::downgrade(bus);

        {
            let (chats, b) = (chats.clone(), weak_bus.clone());
            bus.on(EventKind::NewChatRequested, move |event| {
                if let AppEvent::NewChatRequested { ai_model_id } = event {
                    if let Err(e) = chats.create_chat(*ai_model_id, Vec::new()) {
                        alert(&b, e);
                    }
                }
            });
        }

        {
            let (chats, b) = (chats.clone(), weak_bus.clone());
            bus.on(EventKind::SendRequested, move |event| {
                let AppEvent::SendRequested { chat_id, text } = event else {
                    return;
                };
                if text.trim().is_empty() {
                    return;
                }
                let (chats, b, chat_id, text) = (chats.clone(), b.clone(), chat_id.clone(), text.clone());
                spawn("send a message", async move {
                    match chats.send_message(&chat_id, &text).await {
                        Ok(_) => {}
                        // Already visible in the conversation as an error message
                        Err(ChatError::Api(e)) => log::warn!("Message to {} failed: {}", chat_id, e),
                        Err(e) => alert(&b, e),
                    }
                });
            });
        }

        {
            let (chats, b) = (chats.clone(), weak_bus.clone());
            bus.on(EventKind::BroadcastRequested, move |event| {
                let AppEvent::BroadcastRequested { text } = event else {
                    return;
                };
                if text.trim().is_empty() {
                    return;
                }
                let (chats, b, text) = (chats.clone(), b.clone(), text.clone());
                spawn("broadcast", async move {
                    match chats.send_broadcast_message(&text).await {
                        Ok(summary) if summary.failed > 0 => {
                            alert(&b, format!("{} of {} chats failed to answer", summary.failed, summary.total))
                        }
                        Ok(_) => {}
                        Err(e) => alert(&b, e),
                    }
                });
            });
        }

        {
            let (chats, b) = (chats.clone(), weak_bus.clone());
            bus.on(EventKind::CloseRequested, move |event| {
                if let AppEvent::CloseRequested { chat_id, save_to_history } = event {
                    if let Err(e) = chats.remove_chat(chat_id, *save_to_history) {
                        alert(&b, e);
                    }
                }
            });
        }

        {
            let (chats, b) = (chats.clone(), weak_bus.clone());
            bus.on(EventKind::MinimizeRequested, move |event| {
                if let AppEvent::MinimizeRequested { chat_id } = event {
                    if let Err(e) = chats.minimize_chat(chat_id) {
                        alert(&b, e);
                    }
                }
            });
        }

        {
            let (chats, b) = (chats.clone(), weak_bus.clone());
            bus.on(EventKind::RestoreRequested, move |event| {
                if let AppEvent::RestoreRequested { chat_id } = event {
                    if let Err(e) = chats.restore_chat(chat_id) {
                        alert(&b, e);
                    }
                }
            });
        }

        {
            let b = weak_bus.clone();
            bus.on(EventKind::ModelSelected, move |event| {
                if let AppEvent::ModelSelected { chat_id, ai_model_id } = event {
                    if let Err(e) = selector.select(chat_id, *ai_model_id) {
                        alert(&b, e);
                    }
                }
            });
        }

        {
            let (chats, b) = (chats.clone(), weak_bus.clone());
            bus.on(EventKind::ClearChatsRequested, move |event| {
                if let AppEvent::ClearChatsRequested { include_started } = event {
                    match chats.clear_all_chats(*include_started) {
                        Ok(count) => log::info!("Closed {} chat(s)", count),
                        Err(e) => alert(&b, e),
                    }
                }
            });
        }

        let b = weak_bus;
        bus.on(EventKind::HistoryReopenRequested, move |event| {
            if let AppEvent::HistoryReopenRequested { index } = event {
                if let Err(e) = chats.reopen_from_history(*index) {
                    alert(&b, e);
                }
            }
        });
    }
}

pub struct UiHandlers;

impl UiHandlers {
    /// `store` persists the theme preference when present.
    pub fn register(bus: &Arc<EventBus>, state: Arc<StateManager>, store: Option<LocalStore>) {
        {
            let state = state.clone();
            bus.on(EventKind::ThemeToggleRequested, move |_| {
                let dark = !state.get_as::<bool>("isDarkMode").unwrap_or(false);
                state.set_value("isDarkMode", dark.into(), false);
                log::info!("Theme switched to {}", if dark { "dark" } else { "light" });
                if let Some(store) = store.clone() {
                    spawn("save the theme", async move {
                        if let Err(e) = store.save_dark_mode(dark).await {
                            log::error!("Failed to persist theme: {:?}", e);
                        }
                    });
                }
            });
        }

        {
            let state = state.clone();
            bus.on(EventKind::SidebarToggleRequested, move |_| {
                let collapsed = !state.get_as::<bool>("ui.sidebarCollapsed").unwrap_or(false);
                state.set_value("ui.sidebarCollapsed", collapsed.into(), false);
            });
        }

        bus.on(EventKind::ViewportResized, move |event| {
            if let AppEvent::ViewportResized { width } = event {
                let viewport = Viewport::classify(*width);
                if let Err(e) = state.update("ui", |ui: &mut UiState| ui.set_viewport(viewport)) {
                    log::error!("Failed to record viewport: {}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, ChatBackend, SendMessageRequest};
    use crate::models::{Category, Chat, SessionState};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl ChatBackend for Echo {
        async fn send_message(&self, request: &SendMessageRequest) -> Result<String, ApiError> {
            Ok(format!("echo {}", request.chat_message))
        }
    }

    struct Harness {
        bus: Arc<EventBus>,
        state: Arc<StateManager>,
        chats: Arc<ChatManager>,
        alerts: Arc<Mutex<Vec<String>>>,
    }

    fn harness(max_chats: usize, store: Option<LocalStore>) -> Harness {
        let categories: Vec<Category> = serde_json::from_value(serde_json::json!([
            { "id": 1, "name": "Text", "models": [{ "id": 10, "name": "X" }, { "id": 11, "name": "Y" }] }
        ]))
        .unwrap();
        let state = StateManager::new(Duration::from_millis(50));
        state.initialize(&SessionState::new(categories, max_chats, false)).unwrap();
        let bus = Arc::new(EventBus::new());
        let chats = Arc::new(ChatManager::new(state.clone(), bus.clone(), Arc::new(Echo)));
        let selector = Arc::new(ModelSelector::new(chats.clone(), state.clone()));
        ChatHandlers::register(&bus, chats.clone(), selector);
        UiHandlers::register(&bus, state.clone(), store);

        let alerts = Arc::new(Mutex::new(Vec::new()));
        let a = alerts.clone();
        bus.on(EventKind::Alert, move |e| {
            if let AppEvent::Alert { message } = e {
                a.lock().unwrap().push(message.clone());
            }
        });
        Harness {
            bus,
            state,
            chats,
            alerts,
        }
    }

    #[test]
    fn capacity_errors_become_alerts() {
        let h = harness(1, None);
        h.bus.emit(AppEvent::NewChatRequested { ai_model_id: None });
        h.bus.emit(AppEvent::NewChatRequested { ai_model_id: None });
        assert_eq!(h.chats.get_active_chats().len(), 1);
        assert_eq!(*h.alerts.lock().unwrap(), vec!["Maximum of 1 open chats reached"]);
    }

    #[tokio::test]
    async fn send_requests_reach_the_backend() {
        let h = harness(4, None);
        h.bus.emit(AppEvent::NewChatRequested { ai_model_id: Some(11) });
        let id = h.chats.get_active_chats()[0].id.clone();
        h.bus.emit(AppEvent::SendRequested {
            chat_id: id.clone(),
            text: "hello".to_string(),
        });
        h.bus.emit(AppEvent::SendRequested {
            chat_id: id.clone(),
            text: "   ".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let chat = h.chats.get_chat(&id).unwrap();
        let texts: Vec<&str> = chat.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "echo hello"]);
    }

    #[tokio::test]
    async fn locked_model_selection_alerts() {
        let h = harness(4, None);
        let id = h.chats.create_chat(None, vec![]).unwrap();
        h.bus.emit(AppEvent::ModelSelected {
            chat_id: id.clone(),
            ai_model_id: 11,
        });
        assert_eq!(h.chats.get_chat(&id).unwrap().ai_model_id, 11);

        h.chats.send_message(&id, "hi").await.unwrap();
        h.bus.emit(AppEvent::ModelSelected {
            chat_id: id.clone(),
            ai_model_id: 10,
        });
        assert_eq!(h.chats.get_chat(&id).unwrap().ai_model_id, 11);
        assert_eq!(h.alerts.lock().unwrap().len(), 1);
    }

    #[test]
    fn close_minimize_restore_and_clear() {
        let h = harness(4, None);
        let a = h.chats.create_chat(None, vec![]).unwrap();
        let b = h.chats.create_chat(None, vec![crate::models::Message::user("q")]).unwrap();

        h.bus.emit(AppEvent::MinimizeRequested { chat_id: a.clone() });
        assert!(h.chats.get_chat(&a).unwrap().is_minimized);
        h.bus.emit(AppEvent::RestoreRequested { chat_id: a.clone() });
        assert!(!h.chats.get_chat(&a).unwrap().is_minimized);

        h.bus.emit(AppEvent::ClearChatsRequested { include_started: false });
        assert!(h.chats.get_chat(&a).is_none());

        h.bus.emit(AppEvent::CloseRequested {
            chat_id: b.clone(),
            save_to_history: true,
        });
        assert_eq!(h.chats.get_chat_history().len(), 1);

        h.bus.emit(AppEvent::HistoryReopenRequested { index: 0 });
        let reopened: Vec<Chat> = h.chats.get_active_chats();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened[0].messages[0].text, "q");

        h.bus.emit(AppEvent::RestoreRequested {
            chat_id: "ghost".to_string(),
        });
        assert_eq!(h.alerts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn broadcast_without_chats_alerts() {
        let h = harness(4, None);
        h.bus.emit(AppEvent::BroadcastRequested {
            text: "all".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            *h.alerts.lock().unwrap(),
            vec!["There are no active chats to broadcast to"]
        );
    }

    #[tokio::test]
    async fn theme_toggle_updates_state_and_storage() {
        let store = LocalStore::in_memory().await.unwrap();
        let h = harness(4, Some(store.clone()));
        h.bus.emit(AppEvent::ThemeToggleRequested);
        assert_eq!(h.state.get_as::<bool>("isDarkMode").unwrap(), true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.load_dark_mode().await.unwrap(), Some(true));

        h.bus.emit(AppEvent::ThemeToggleRequested);
        assert_eq!(h.state.get_as::<bool>("isDarkMode").unwrap(), false);
    }

    #[test]
    fn sidebar_and_viewport() {
        let h = harness(4, None);
        h.bus.emit(AppEvent::SidebarToggleRequested);
        assert_eq!(h.state.get_as::<bool>("ui.sidebarCollapsed").unwrap(), true);

        h.bus.emit(AppEvent::ViewportResized { width: 500 });
        let ui: UiState = h.state.get_as("ui").unwrap();
        assert!(ui.is_mobile && !ui.is_tablet && !ui.is_desktop);
        assert!(ui.sidebar_collapsed);
    }
}
