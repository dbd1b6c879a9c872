use super::surface::{ModelGroup, ModelOption, SelectorView};
use crate::chat::{ChatError, ChatManager};
use crate::models::{AiModel, Chat};
use crate::state::StateManager;
use std::sync::Arc;

/// Per-pane model dropdown. Locked chats get no dropdown at all, and this is
/// the only place a selection on a locked chat is refused.
pub struct ModelSelector {
    chats: Arc<ChatManager>,
    state: Arc<StateManager>,
}

impl ModelSelector {
    pub fn new(chats: Arc<ChatManager>, state: Arc<StateManager>) -> Self {
        Self { chats, state }
    }

    pub fn view(chat: &Chat, models: &[AiModel]) -> SelectorView {
        if chat.is_model_locked() {
            return SelectorView::Locked {
                model_id: chat.ai_model_id,
                model_name: model_name(models, chat.ai_model_id),
            };
        }

        let mut groups: Vec<ModelGroup> = Vec::new();
        for model in models {
            let category = model.category_name.clone().unwrap_or_else(|| "Other".to_string());
            let option = ModelOption {
                id: model.id,
                name: model.name.clone(),
                icon: model.icon.clone(),
                description: model.description.clone(),
            };
            match groups.iter_mut().find(|g| g.category == category) {
                Some(group) => group.options.push(option),
                None => groups.push(ModelGroup {
                    category,
                    icon: model.category_icon.clone().unwrap_or_default(),
                    options: vec![option],
                }),
            }
        }
        SelectorView::Dropdown {
            selected: chat.ai_model_id,
            groups,
        }
    }

    pub fn view_for(&self, chat_id: &str) -> Option<SelectorView> {
        let chat = self.chats.get_chat(chat_id)?;
        let models: Vec<AiModel> = self.state.get_as("aiTypes").unwrap_or_default();
        Some(Self::view(&chat, &models))
    }

    pub fn select(&self, chat_id: &str, ai_model_id: i64) -> Result<(), ChatError> {
        let chat = self
            .chats
            .get_chat(chat_id)
            .ok_or_else(|| ChatError::ChatNotFound(chat_id.to_string()))?;
        if chat.is_model_locked() {
            log::warn!("Ignoring model selection for locked chat {}", chat_id);
            return Err(ChatError::ModelLocked(chat_id.to_string()));
        }
        if chat.ai_model_id == ai_model_id {
            return Ok(());
        }
        self.chats.change_ai_model(chat_id, ai_model_id)
    }
}

pub fn model_name(models: &[AiModel], id: i64) -> String {
    models
        .iter()
        .find(|m| m.id == id)
        .map(|m| m.name.clone())
        .unwrap_or_else(|| format!("Model {}", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, ChatBackend, SendMessageRequest};
    use crate::events::EventBus;
    use crate::models::{flatten_categories, Category, Message, SessionState};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl ChatBackend for Echo {
        async fn send_message(&self, request: &SendMessageRequest) -> Result<String, ApiError> {
            Ok(request.chat_message.clone())
        }
    }

    fn categories() -> Vec<Category> {
        serde_json::from_value(serde_json::json!([
            { "id": 1, "name": "Text", "icon": "t", "models": [{ "id": 10, "name": "X" }, { "id": 11, "name": "Y" }] },
            { "id": 2, "name": "Image", "icon": "i", "models": [{ "id": 20, "name": "Z" }] }
        ]))
        .unwrap()
    }

    fn setup() -> (ModelSelector, Arc<ChatManager>) {
        let state = StateManager::new(Duration::from_millis(50));
        state.initialize(&SessionState::new(categories(), 4, false)).unwrap();
        let chats = Arc::new(ChatManager::new(state.clone(), Arc::new(EventBus::new()), Arc::new(Echo)));
        (ModelSelector::new(chats.clone(), state), chats)
    }

    #[test]
    fn dropdown_groups_models_by_category() {
        let chat = Chat::new(11, vec![]);
        let models = flatten_categories(&categories());
        match ModelSelector::view(&chat, &models) {
            SelectorView::Dropdown { selected, groups } => {
                assert_eq!(selected, 11);
                assert_eq!(groups.len(), 2);
                assert_eq!(groups[0].category, "Text");
                assert_eq!(groups[0].options.len(), 2);
                assert_eq!(groups[1].icon, "i");
            }
            other => panic!("expected dropdown, got {:?}", other),
        }
    }

    #[test]
    fn started_chat_shows_locked_model() {
        let chat = Chat::new(20, vec![Message::user("draw a cat")]);
        let models = flatten_categories(&categories());
        assert_eq!(
            ModelSelector::view(&chat, &models),
            SelectorView::Locked {
                model_id: 20,
                model_name: "Z".to_string()
            }
        );
    }

    #[tokio::test]
    async fn selection_is_refused_after_first_message() {
        let (selector, chats) = setup();
        let id = chats.create_chat(None, vec![]).unwrap();
        selector.select(&id, 20).unwrap();
        assert_eq!(chats.get_chat(&id).unwrap().ai_model_id, 20);

        chats.send_message(&id, "hi").await.unwrap();
        assert!(matches!(selector.select(&id, 10), Err(ChatError::ModelLocked(_))));
        assert!(matches!(selector.view_for(&id), Some(SelectorView::Locked { model_id: 20, .. })));
        assert_eq!(chats.get_chat(&id).unwrap().ai_model_id, 20);

        // The manager itself still accepts a direct change
        chats.change_ai_model(&id, 10).unwrap();
        assert_eq!(chats.get_chat(&id).unwrap().ai_model_id, 10);
    }

    #[test]
    fn unknown_chat_has_no_selector() {
        let (selector, _) = setup();
        assert!(selector.view_for("ghost").is_none());
        assert!(matches!(selector.select("ghost", 10), Err(ChatError::ChatNotFound(_))));
    }
}
