use crate::api::{ApiError, ChatBackend, HistoryTurn, SendMessageRequest};
use crate::events::{AppEvent, BroadcastSummary, ChatCreated, EventBus, MessageSent};
use crate::models::{now_millis, AiModel, Chat, ChatStats, HistoryEntry, Message};
use crate::state::{StateError, StateManager};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use std::sync::Arc;

pub const BROADCAST_PREFIX: &str = "[Broadcast] ";

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Maximum of {max} open chats reached")]
    Capacity { max: usize },
    #[error("No AI models are available")]
    NoModelAvailable,
    #[error("Chat {0} not found")]
    ChatNotFound(String),
    #[error("AI model {0} does not exist")]
    InvalidModel(i64),
    #[error("There are no active chats to broadcast to")]
    NoActiveChat,
    #[error("The model of chat {0} is locked after the first message")]
    ModelLocked(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    State(#[from] StateError),
}

// Extra fields merged into an appended message
#[derive(Clone, Debug, Default)]
pub struct MessageOptions {
    pub is_error: bool,
    pub timestamp: Option<i64>,
}

/// Chat session rules on top of the state store: pane limits, model
/// assignment, and the send/receive lifecycle.
pub struct ChatManager {
    state: Arc<StateManager>,
    bus: Arc<EventBus>,
    backend: Arc<dyn ChatBackend>,
}

impl ChatManager {
    pub fn new(state: Arc<StateManager>, bus: Arc<EventBus>, backend: Arc<dyn ChatBackend>) -> Self {
        Self { state, bus, backend }
    }

    // Read accessors stay infallible; an undecodable list is logged and read as empty
    fn read_list<T: DeserializeOwned>(&self, key: &str) -> Vec<T> {
        self.state.get_as(key).unwrap_or_else(|e| {
            log::error!("Could not read '{}' from state: {}", key, e);
            Vec::new()
        })
    }

    fn chats(&self) -> Vec<Chat> {
        self.read_list("chats")
    }

    fn ai_types(&self) -> Vec<AiModel> {
        self.read_list("aiTypes")
    }

    fn max_chats(&self) -> usize {
        self.state.get_as("maxChats").unwrap_or(0)
    }

    pub fn get_chat(&self, chat_id: &str) -> Option<Chat> {
        self.chats().into_iter().find(|c| c.id == chat_id)
    }

    /// Chats that are currently shown, i.e. not minimized.
    pub fn get_active_chats(&self) -> Vec<Chat> {
        self.chats().into_iter().filter(|c| !c.is_minimized).collect()
    }

    pub fn get_chat_history(&self) -> Vec<HistoryEntry> {
        self.read_list("chatHistory")
    }

    pub fn create_chat(&self, ai_model_id: Option<i64>, initial_messages: Vec<Message>) -> Result<String, ChatError> {
        let models: Vec<AiModel> = self.state.get_as("aiTypes")?;
        let model_id = match ai_model_id {
            Some(id) if models.iter().any(|m| m.id == id) => id,
            requested => {
                let first = models.first().ok_or(ChatError::NoModelAvailable)?;
                if let Some(id) = requested {
                    log::warn!("AI model {} not found, falling back to {} ({})", id, first.id, first.name);
                }
                first.id
            }
        };

        let max = self.max_chats();
        let chat = Chat::new(model_id, initial_messages);
        let chat_id = chat.id.clone();
        // Counted under the store lock so concurrent creates cannot overshoot
        let added = self.state.update("chats", |chats: &mut Vec<Chat>| {
            if chats.iter().filter(|c| !c.is_minimized).count() >= max {
                return false;
            }
            chats.push(chat);
            true
        })?;
        if !added {
            log::warn!("Cannot create chat: {} active chats already open", max);
            return Err(ChatError::Capacity { max });
        }

        log::info!("Created chat {} with model {}", chat_id, model_id);
        self.bus.emit(AppEvent::ChatCreated(ChatCreated {
            chat_id: chat_id.clone(),
            ai_model_id: model_id,
        }));
        Ok(chat_id)
    }

    /// Removes a pane. Started chats are archived first when `save_to_history` is set.
    pub fn remove_chat(&self, chat_id: &str, save_to_history: bool) -> Result<(), ChatError> {
        let removed = self.state.update("chats", |chats: &mut Vec<Chat>| {
            let index = chats.iter().position(|c| c.id == chat_id)?;
            Some(chats.remove(index))
        })?;
        let Some(chat) = removed else {
            log::warn!("Tried to remove unknown chat {}", chat_id);
            return Ok(());
        };

        let archived = save_to_history && chat.has_user_message();
        if archived {
            let entry = HistoryEntry {
                chat,
                closed_timestamp: now_millis(),
            };
            self.state
                .update("chatHistory", |history: &mut Vec<HistoryEntry>| history.insert(0, entry))?;
        }

        log::info!("Removed chat {} (archived: {})", chat_id, archived);
        self.bus.emit(AppEvent::ChatRemoved {
            chat_id: chat_id.to_string(),
            archived,
        });
        Ok(())
    }

    /// Closes chats without user messages, or every chat when
    /// `include_started_chats` is set (archiving those). Returns how many closed.
    pub fn clear_all_chats(&self, include_started_chats: bool) -> Result<usize, ChatError> {
        let candidates: Vec<String> = self
            .chats()
            .into_iter()
            .filter(|c| include_started_chats || !c.has_user_message())
            .map(|c| c.id)
            .collect();
        for id in &candidates {
            self.remove_chat(id, include_started_chats)?;
        }
        log::info!("Cleared {} chat(s)", candidates.len());
        Ok(candidates.len())
    }

    /// Appends a message and bumps `lastActivity`. Unknown chats are logged and
    /// yield `None`.
    pub fn add_message(&self, chat_id: &str, text: &str, is_user: bool, options: MessageOptions) -> Option<Message> {
        let message = Message {
            is_user,
            text: text.to_string(),
            timestamp: options.timestamp.unwrap_or_else(now_millis),
            is_error: options.is_error.then_some(true),
        };
        let appended = self.state.update("chats", |chats: &mut Vec<Chat>| {
            let chat = chats.iter_mut().find(|c| c.id == chat_id)?;
            chat.messages.push(message.clone());
            chat.last_activity = now_millis();
            Some(message)
        });
        match appended {
            Ok(Some(message)) => Some(message),
            Ok(None) => {
                log::error!("Cannot add message: chat {} not found", chat_id);
                None
            }
            Err(e) => {
                log::error!("Cannot add message to chat {}: {}", chat_id, e);
                None
            }
        }
    }

    // AI reply, skipped if an identical message (timestamp and text) is already there
    fn add_reply_once(&self, chat_id: &str, reply: Message) -> Result<Message, ChatError> {
        let added = self.state.update("chats", |chats: &mut Vec<Chat>| {
            let chat = chats.iter_mut().find(|c| c.id == chat_id)?;
            let duplicate = chat
                .messages
                .iter()
                .any(|m| m.timestamp == reply.timestamp && m.text == reply.text);
            if duplicate {
                log::debug!("Reply already present in chat {}, skipping", chat_id);
            } else {
                chat.messages.push(reply.clone());
                chat.last_activity = now_millis();
            }
            Some(())
        })?;
        match added {
            Some(()) => Ok(reply),
            None => Err(ChatError::ChatNotFound(chat_id.to_string())),
        }
    }

    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<Message, ChatError> {
        let chat = self
            .get_chat(chat_id)
            .ok_or_else(|| ChatError::ChatNotFound(chat_id.to_string()))?;
        let history: Vec<HistoryTurn> = chat
            .messages
            .iter()
            .filter(|m| !m.text.trim().is_empty())
            .map(HistoryTurn::from_message)
            .collect();

        let user_message = self
            .add_message(chat_id, text, true, MessageOptions::default())
            .ok_or_else(|| ChatError::ChatNotFound(chat_id.to_string()))?;
        let is_first_user_message = chat.user_message_count() == 0;

        let request = SendMessageRequest {
            chat_id: chat_id.to_string(),
            ai_model_id: chat.ai_model_id,
            chat_message: text.to_string(),
            history,
        };

        match self.backend.send_message(&request).await {
            Ok(reply) => {
                let ai_message = self.add_reply_once(chat_id, Message::ai(reply))?;
                self.bus.emit(AppEvent::MessageSent(MessageSent {
                    chat_id: chat_id.to_string(),
                    user_message,
                    ai_message: ai_message.clone(),
                    is_first_user_message,
                }));
                Ok(ai_message)
            }
            Err(e) => {
                log::error!("Sending message to chat {} failed: {}", chat_id, e);
                self.add_message(
                    chat_id,
                    &format!("Error: {}", e),
                    false,
                    MessageOptions {
                        is_error: true,
                        ..MessageOptions::default()
                    },
                );
                self.bus.emit(AppEvent::MessageError {
                    chat_id: chat_id.to_string(),
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Sends `message` to every active chat concurrently. One failure does not
    /// cancel the others.
    pub async fn send_broadcast_message(&self, message: &str) -> Result<BroadcastSummary, ChatError> {
        let targets: Vec<Chat> = self
            .state
            .get_as::<Vec<Chat>>("chats")?
            .into_iter()
            .filter(|c| !c.is_minimized)
            .collect();
        if targets.is_empty() {
            return Err(ChatError::NoActiveChat);
        }

        let text = format!("{}{}", BROADCAST_PREFIX, message);
        log::info!("Broadcasting to {} chat(s)", targets.len());
        let results = join_all(targets.iter().map(|chat| self.send_message(&chat.id, &text))).await;

        let successful = results.iter().filter(|r| r.is_ok()).count();
        let summary = BroadcastSummary {
            successful,
            failed: results.len() - successful,
            total: results.len(),
        };
        self.bus.emit(AppEvent::BroadcastCompleted(summary));
        Ok(summary)
    }

    /// Reassigns the chat's model. The lock after the first user message is
    /// not checked here; `ModelSelector` owns that rule.
    pub fn change_ai_model(&self, chat_id: &str, new_ai_model_id: i64) -> Result<(), ChatError> {
        if !self.ai_types().iter().any(|m| m.id == new_ai_model_id) {
            return Err(ChatError::InvalidModel(new_ai_model_id));
        }

        let old_model_id = self
            .state
            .update("chats", |chats: &mut Vec<Chat>| {
                let chat = chats.iter_mut().find(|c| c.id == chat_id)?;
                Some(std::mem::replace(&mut chat.ai_model_id, new_ai_model_id))
            })?
            .ok_or_else(|| ChatError::ChatNotFound(chat_id.to_string()))?;

        log::info!("Chat {} model changed {} -> {}", chat_id, old_model_id, new_ai_model_id);
        self.bus.emit(AppEvent::ModelChanged {
            chat_id: chat_id.to_string(),
            old_model_id,
            new_model_id: new_ai_model_id,
        });
        Ok(())
    }

    pub fn minimize_chat(&self, chat_id: &str) -> Result<(), ChatError> {
        self.set_minimized(chat_id, true)?;
        self.bus.emit(AppEvent::ChatMinimized {
            chat_id: chat_id.to_string(),
        });
        Ok(())
    }

    /// Restoring counts against `maxChats` like creating a chat does.
    pub fn restore_chat(&self, chat_id: &str) -> Result<(), ChatError> {
        let max = self.max_chats();
        self.state.update("chats", |chats: &mut Vec<Chat>| {
            let active = chats.iter().filter(|c| !c.is_minimized).count();
            let chat = chats
                .iter_mut()
                .find(|c| c.id == chat_id)
                .ok_or_else(|| ChatError::ChatNotFound(chat_id.to_string()))?;
            if chat.is_minimized && active >= max {
                return Err(ChatError::Capacity { max });
            }
            chat.is_minimized = false;
            Ok(())
        })??;
        self.bus.emit(AppEvent::ChatRestored {
            chat_id: chat_id.to_string(),
        });
        Ok(())
    }

    fn set_minimized(&self, chat_id: &str, minimized: bool) -> Result<(), ChatError> {
        let found = self.state.update("chats", |chats: &mut Vec<Chat>| {
            chats
                .iter_mut()
                .find(|c| c.id == chat_id)
                .map(|chat| chat.is_minimized = minimized)
                .is_some()
        })?;
        if !found {
            return Err(ChatError::ChatNotFound(chat_id.to_string()));
        }
        Ok(())
    }

    /// Opens a new pane seeded with an archived conversation.
    pub fn reopen_from_history(&self, index: usize) -> Result<String, ChatError> {
        let entry = self
            .get_chat_history()
            .into_iter()
            .nth(index)
            .ok_or_else(|| ChatError::ChatNotFound(format!("history #{}", index)))?;
        self.create_chat(Some(entry.chat.ai_model_id), entry.chat.messages)
    }

    pub fn get_stats(&self) -> ChatStats {
        let chats = self.chats();
        let minimized_chats = chats.iter().filter(|c| c.is_minimized).count();
        ChatStats {
            total_chats: chats.len(),
            active_chats: chats.len() - minimized_chats,
            minimized_chats,
            started_chats: chats.iter().filter(|c| c.has_user_message()).count(),
            history_size: self.get_chat_history().len(),
            total_messages: chats.iter().map(|c| c.messages.len()).sum(),
        }
    }
}
