use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milliseconds since the unix epoch, the unit every timestamp in the session state uses.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// Represents a single message in a chat pane
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub is_user: bool,
    pub text: String,
    pub timestamp: i64,
    // Set only on synthetic failure messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            is_user: true,
            text: text.into(),
            timestamp: now_millis(),
            is_error: None,
        }
    }

    pub fn ai(text: impl Into<String>) -> Self {
        Self {
            is_user: false,
            text: text.into(),
            timestamp: now_millis(),
            is_error: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }
}

// A chat pane and its conversation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub ai_model_id: i64,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: i64,
    pub last_activity: i64,
    #[serde(default)]
    pub is_minimized: bool,
}

impl Chat {
    pub fn new(ai_model_id: i64, messages: Vec<Message>) -> Self {
        let now = now_millis();
        Self {
            id: generate_chat_id(),
            ai_model_id,
            messages,
            created_at: now,
            last_activity: now,
            is_minimized: false,
        }
    }

    pub fn user_message_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_user).count()
    }

    /// A chat is started once it holds a user message.
    pub fn has_user_message(&self) -> bool {
        self.messages.iter().any(|m| m.is_user)
    }

    /// The assigned model can no longer change once the chat is started.
    pub fn is_model_locked(&self) -> bool {
        self.has_user_message()
    }
}

/// Time-based prefix plus a random suffix, e.g. `chat_1718000000000_3f2a9c1b0`.
pub fn generate_chat_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("chat_{}_{}", now_millis(), &suffix[..9])
}

// A closed chat kept in the history sidebar
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub chat: Chat,
    pub closed_timestamp: i64,
}

// Represents a selectable AI model, denormalized from its category
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AiModel {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category_id: Option<i64>,
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default)]
    pub category_icon: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub models: Vec<AiModel>,
}

/// Flattens categories into a single model list, copying the owning category
/// onto each model.
pub fn flatten_categories(categories: &[Category]) -> Vec<AiModel> {
    categories
        .iter()
        .flat_map(|category| {
            category.models.iter().map(move |model| AiModel {
                category_id: Some(category.id),
                category_name: Some(category.name.clone()),
                category_icon: Some(category.icon.clone()),
                ..model.clone()
            })
        })
        .collect()
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Viewport {
    Mobile,
    Tablet,
    Desktop,
}

impl Viewport {
    pub const MOBILE_MAX_WIDTH: u32 = 768;
    pub const TABLET_MAX_WIDTH: u32 = 1024;

    pub fn classify(width: u32) -> Self {
        if width < Self::MOBILE_MAX_WIDTH {
            Viewport::Mobile
        } else if width < Self::TABLET_MAX_WIDTH {
            Viewport::Tablet
        } else {
            Viewport::Desktop
        }
    }
}

// Transient UI flags
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub is_mobile: bool,
    pub is_tablet: bool,
    pub is_desktop: bool,
    pub sidebar_collapsed: bool,
    pub welcome_screen_visible: bool,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            is_mobile: false,
            is_tablet: false,
            is_desktop: true,
            sidebar_collapsed: false,
            welcome_screen_visible: true,
        }
    }
}

impl UiState {
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.is_mobile = viewport == Viewport::Mobile;
        self.is_tablet = viewport == Viewport::Tablet;
        self.is_desktop = viewport == Viewport::Desktop;
    }
}

/// Root of the session state graph. The store keeps it as JSON so key paths
/// like `ui.sidebarCollapsed` address it directly.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub chats: Vec<Chat>,
    pub chat_history: Vec<HistoryEntry>,
    pub ai_types: Vec<AiModel>,
    pub all_ai_categories: Vec<Category>,
    pub max_chats: usize,
    pub is_dark_mode: bool,
    pub ui: UiState,
}

impl SessionState {
    pub fn new(categories: Vec<Category>, max_chats: usize, is_dark_mode: bool) -> Self {
        Self {
            chats: Vec::new(),
            chat_history: Vec::new(),
            ai_types: flatten_categories(&categories),
            all_ai_categories: categories,
            max_chats,
            is_dark_mode,
            ui: UiState::default(),
        }
    }
}

// Diagnostic counters
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatStats {
    pub total_chats: usize,
    pub active_chats: usize,
    pub minimized_chats: usize,
    pub started_chats: usize,
    pub history_size: usize,
    pub total_messages: usize,
}
