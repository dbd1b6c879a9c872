use crate::api::{ApiManager, ChatBackend};
use crate::chat::ChatManager;
use crate::config::ClientConfig;
use crate::events::EventBus;
use crate::handlers::{ChatHandlers, UiHandlers};
use crate::models::{Category, SessionState};
use crate::state::{StateError, StateManager};
use crate::storage::LocalStore;
use crate::ui::{ModelSelector, Surface, UiManager};
use anyhow::Context;
use std::sync::{Arc, Mutex};

// Every component, constructed once and shared by reference
pub struct App {
    pub config: ClientConfig,
    pub bus: Arc<EventBus>,
    pub state: Arc<StateManager>,
    pub chats: Arc<ChatManager>,
    pub selector: Arc<ModelSelector>,
    pub ui: Arc<UiManager>,
    pub store: Option<LocalStore>,
}

impl App {
    /// Wires the components around an already-fetched model catalogue.
    /// Fails if the initial state does not validate.
    pub fn assemble(
        config: ClientConfig,
        bus: Arc<EventBus>,
        backend: Arc<dyn ChatBackend>,
        surface: Arc<Mutex<dyn Surface>>,
        categories: Vec<Category>,
        is_dark_mode: bool,
        store: Option<LocalStore>,
    ) -> Result<Self, StateError> {
        let state = StateManager::new(config.notify_debounce());
        state.initialize(&SessionState::new(categories, config.max_chats, is_dark_mode))?;
        state.validate()?;

        let chats = Arc::new(ChatManager::new(state.clone(), bus.clone(), backend));
        let selector = Arc::new(ModelSelector::new(chats.clone(), state.clone()));
        let ui = UiManager::new(state.clone(), surface);

        ChatHandlers::register(&bus, chats.clone(), selector.clone());
        UiHandlers::register(&bus, state.clone(), store.clone());
        ui.attach(&bus);
        ui.render_all();

        log::info!(
            "App ready: {} model(s), up to {} chats",
            state.get_as::<Vec<serde_json::Value>>("aiTypes").map(|m| m.len()).unwrap_or(0),
            config.max_chats
        );
        Ok(Self {
            config,
            bus,
            state,
            chats,
            selector,
            ui,
            store,
        })
    }

    /// Opens local storage, fetches the model catalogue from the backend and
    /// assembles the app.
    pub async fn boot(config: ClientConfig, surface: Arc<Mutex<dyn Surface>>) -> Result<Self, anyhow::Error> {
        let token = config.api_token()?;
        let bus = Arc::new(EventBus::new());
        let api = Arc::new(ApiManager::new(&config, token, Some(bus.clone())));

        let store = match LocalStore::open(&config.storage_path).await {
            Ok(store) => Some(store),
            Err(e) => {
                log::warn!("Local storage unavailable, preferences will not persist: {:?}", e);
                None
            }
        };
        let is_dark_mode = match &store {
            Some(store) => store.load_dark_mode().await.unwrap_or_else(|e| {
                log::warn!("Could not read theme preference: {:?}", e);
                None
            }),
            None => None,
        }
        .unwrap_or(false);

        let categories = api
            .get_ai_categories()
            .await
            .context("Failed to load AI categories")?;
        log::info!("Loaded {} AI categories", categories.len());

        Self::assemble(config, bus, api, surface, categories, is_dark_mode, store).context("Invalid initial state")
    }

    /// Drops every listener and delivers pending notifications.
    pub fn shutdown(&self) {
        self.ui.detach();
        self.bus.clear();
        self.state.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AppEvent;
    use crate::ui::HeadlessSurface;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn boot_loads_catalogue_and_renders() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ai-categories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": 1, "name": "Text", "models": [{ "id": 10, "name": "X" }] }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/send_message"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "pong" })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            base_url: server.uri(),
            storage_path: dir.path().join("app.sqlite").to_string_lossy().to_string(),
            ..ClientConfig::default()
        };
        let surface = Arc::new(Mutex::new(HeadlessSurface::new()));
        let app = App::boot(config, surface.clone()).await.unwrap();
        assert!(surface.lock().unwrap().welcome_visible);

        app.bus.emit(AppEvent::NewChatRequested { ai_model_id: None });
        let id = app.chats.get_active_chats()[0].id.clone();
        app.bus.emit(AppEvent::SendRequested {
            chat_id: id.clone(),
            text: "ping".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        {
            let s = surface.lock().unwrap();
            let pane = s.pane(&id).unwrap();
            assert_eq!(pane.model_name, "X");
            assert_eq!(pane.messages.len(), 2);
            assert_eq!(pane.messages[1].text, "pong");
            assert_eq!(s.layout, "layout-1");
            assert!(!s.welcome_visible);
        }

        app.shutdown();
    }

    #[tokio::test]
    async fn boot_fails_when_catalogue_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ai-categories"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            base_url: server.uri(),
            storage_path: dir.path().join("app.sqlite").to_string_lossy().to_string(),
            ..ClientConfig::default()
        };
        let surface = Arc::new(Mutex::new(HeadlessSurface::new()));
        assert!(App::boot(config, surface).await.is_err());
    }
}
