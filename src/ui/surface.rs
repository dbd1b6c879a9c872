use crate::models::Message;

#[derive(Clone, Debug, PartialEq)]
pub struct ModelOption {
    pub id: i64,
    pub name: String,
    pub icon: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelGroup {
    pub category: String,
    pub icon: String,
    pub options: Vec<ModelOption>,
}

// The model control shown in a pane header
#[derive(Clone, Debug, PartialEq)]
pub enum SelectorView {
    Dropdown { selected: i64, groups: Vec<ModelGroup> },
    Locked { model_id: i64, model_name: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct PaneView {
    pub chat_id: String,
    pub model_name: String,
    pub model_icon: String,
    pub selector: SelectorView,
    pub messages: Vec<Message>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HistoryItemView {
    pub index: usize,
    pub title: String,
    pub model_name: String,
    pub message_count: usize,
    pub closed_timestamp: i64,
}

/// Render target for [`super::UiManager`]. Panes are addressed by chat id and
/// are only ever mounted, updated in place, or unmounted.
pub trait Surface: Send {
    fn mount_pane(&mut self, pane: &PaneView);
    fn update_pane(&mut self, pane: &PaneView);
    fn unmount_pane(&mut self, chat_id: &str);
    fn set_layout(&mut self, layout_class: &str);
    fn set_welcome_visible(&mut self, visible: bool);
    fn render_history(&mut self, items: &[HistoryItemView]);
    fn set_theme(&mut self, dark: bool);
    fn set_sidebar_collapsed(&mut self, collapsed: bool);
    fn show_alert(&mut self, message: &str);
}

/// In-memory surface that keeps what would be on screen plus operation counts.
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    pub panes: Vec<PaneView>,
    pub layout: String,
    pub welcome_visible: bool,
    pub history: Vec<HistoryItemView>,
    pub dark: bool,
    pub sidebar_collapsed: bool,
    pub alerts: Vec<String>,
    pub mounts: usize,
    pub updates: usize,
    pub unmounts: usize,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pane(&self, chat_id: &str) -> Option<&PaneView> {
        self.panes.iter().find(|p| p.chat_id == chat_id)
    }

    pub fn pane_ids(&self) -> Vec<String> {
        self.panes.iter().map(|p| p.chat_id.clone()).collect()
    }
}

impl Surface for HeadlessSurface {
    fn mount_pane(&mut self, pane: &PaneView) {
        self.mounts += 1;
        self.panes.push(pane.clone());
    }

    fn update_pane(&mut self, pane: &PaneView) {
        self.updates += 1;
        if let Some(existing) = self.panes.iter_mut().find(|p| p.chat_id == pane.chat_id) {
            *existing = pane.clone();
        }
    }

    fn unmount_pane(&mut self, chat_id: &str) {
        self.unmounts += 1;
        self.panes.retain(|p| p.chat_id != chat_id);
    }

    fn set_layout(&mut self, layout_class: &str) {
        self.layout = layout_class.to_string();
    }

    fn set_welcome_visible(&mut self, visible: bool) {
        self.welcome_visible = visible;
    }

    fn render_history(&mut self, items: &[HistoryItemView]) {
        self.history = items.to_vec();
    }

    fn set_theme(&mut self, dark: bool) {
        self.dark = dark;
    }

    fn set_sidebar_collapsed(&mut self, collapsed: bool) {
        self.sidebar_collapsed = collapsed;
    }

    fn show_alert(&mut self, message: &str) {
        self.alerts.push(message.to_string());
    }
}

/// Prints render operations to stdout. Used by the `zekai` binary.
#[derive(Debug, Default)]
pub struct TerminalSurface {
    // Chat ids in display order, so panes can be referred to by position
    order: Vec<String>,
    printed: Vec<(String, usize)>,
}

impl TerminalSurface {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, chat_id: &str) -> usize {
        self.order.iter().position(|id| id == chat_id).map(|i| i + 1).unwrap_or(0)
    }

    fn print_new_messages(&mut self, pane: &PaneView) {
        let position = self.position(&pane.chat_id);
        let already = self
            .printed
            .iter()
            .find(|(id, _)| *id == pane.chat_id)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        for message in pane.messages.iter().skip(already) {
            let who = if message.is_user {
                "you".to_string()
            } else if message.is_error() {
                "error".to_string()
            } else {
                pane.model_name.clone()
            };
            println!("[{}] {}: {}", position, who, message.text);
        }
        match self.printed.iter_mut().find(|(id, _)| *id == pane.chat_id) {
            Some(entry) => entry.1 = pane.messages.len(),
            None => self.printed.push((pane.chat_id.clone(), pane.messages.len())),
        }
    }
}

impl Surface for TerminalSurface {
    fn mount_pane(&mut self, pane: &PaneView) {
        self.order.push(pane.chat_id.clone());
        let lock = match pane.selector {
            SelectorView::Locked { .. } => " (locked)",
            SelectorView::Dropdown { .. } => "",
        };
        println!("[{}] opened chat with {}{}", self.position(&pane.chat_id), pane.model_name, lock);
        self.print_new_messages(pane);
    }

    fn update_pane(&mut self, pane: &PaneView) {
        self.print_new_messages(pane);
    }

    fn unmount_pane(&mut self, chat_id: &str) {
        println!("[{}] closed", self.position(chat_id));
        self.order.retain(|id| id != chat_id);
        self.printed.retain(|(id, _)| id != chat_id);
    }

    fn set_layout(&mut self, layout_class: &str) {
        log::debug!("Layout: {}", layout_class);
    }

    fn set_welcome_visible(&mut self, visible: bool) {
        if visible {
            println!("No open chats. Type /new to start one.");
        }
    }

    fn render_history(&mut self, items: &[HistoryItemView]) {
        if let Some(latest) = items.first() {
            println!("History: {} chat(s), latest \"{}\"", items.len(), latest.title);
        }
    }

    fn set_theme(&mut self, dark: bool) {
        println!("Theme: {}", if dark { "dark" } else { "light" });
    }

    fn set_sidebar_collapsed(&mut self, collapsed: bool) {
        log::debug!("Sidebar collapsed: {}", collapsed);
    }

    fn show_alert(&mut self, message: &str) {
        eprintln!("! {}", message);
    }
}
