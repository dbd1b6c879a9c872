// Line-based input for the terminal front end. Each line maps to one bus
// event, the way clicks and key presses do in the browser UI.

use crate::chat::ChatManager;
use crate::events::AppEvent;
use std::str::FromStr;

#[derive(Debug, PartialEq, Eq)]
pub enum PaneRef {
    // 1-based position among the visible panes
    Position(usize),
    Id(String),
}

impl PaneRef {
    fn parse(s: &str) -> Self {
        match s.parse::<usize>() {
            Ok(n) => PaneRef::Position(n),
            Err(_) => PaneRef::Id(s.to_string()),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    New { ai_model_id: Option<i64> },
    Send { pane: PaneRef, text: String },
    Close { pane: PaneRef },
    Minimize { pane: PaneRef },
    Restore { chat_id: String },
    Model { pane: PaneRef, ai_model_id: i64 },
    Broadcast { text: String },
    Clear { include_started: bool },
    Reopen { index: usize },
    Theme,
    Sidebar,
    Resize { width: u32 },
    Stats,
    Help,
    Quit,
}

pub const HELP: &str = "\
/new [model]        open a chat
<pane> <text>       send to pane (position or id)
/all <text>         broadcast to every open chat
/model <pane> <id>  change a chat's model
/close <pane>       close and archive a chat
/min <pane>         minimize a chat
/restore <id>       restore a minimized chat
/clear [all]        close empty chats (or all)
/reopen <n>         reopen history entry n
/theme  /sidebar  /resize <width>  /stats  /quit";

pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };
    let command = match head {
        "/new" if rest.is_empty() => Command::New { ai_model_id: None },
        "/new" => Command::New {
            ai_model_id: Some(number(rest, "model id")?),
        },
        "/all" if rest.is_empty() => return Err("/all needs a message".to_string()),
        "/all" => Command::Broadcast { text: rest.to_string() },
        "/model" => {
            let (pane, model) = split_pane(head, rest)?;
            Command::Model {
                pane,
                ai_model_id: number(model, "model id")?,
            }
        }
        "/close" => Command::Close {
            pane: split_pane(head, rest)?.0,
        },
        "/min" => Command::Minimize {
            pane: split_pane(head, rest)?.0,
        },
        "/restore" if rest.is_empty() => return Err("/restore needs a chat id".to_string()),
        "/restore" => Command::Restore { chat_id: rest.to_string() },
        "/clear" => Command::Clear {
            include_started: rest == "all",
        },
        "/reopen" => Command::Reopen {
            index: number(rest, "history index")?,
        },
        "/theme" => Command::Theme,
        "/sidebar" => Command::Sidebar,
        "/resize" => Command::Resize {
            width: number(rest, "width")?,
        },
        "/stats" => Command::Stats,
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other if other.starts_with('/') => return Err(format!("Unknown command {}", other)),
        pane if rest.is_empty() => return Err(format!("Nothing to send to {}", pane)),
        pane => Command::Send {
            pane: PaneRef::parse(pane),
            text: rest.to_string(),
        },
    };
    Ok(Some(command))
}

fn number<T: FromStr>(s: &str, what: &str) -> Result<T, String> {
    s.parse().map_err(|_| format!("{} must be a number", what))
}

fn split_pane<'a>(head: &str, rest: &'a str) -> Result<(PaneRef, &'a str), String> {
    match rest.split_once(char::is_whitespace) {
        Some((pane, tail)) => Ok((PaneRef::parse(pane), tail.trim())),
        None if !rest.is_empty() => Ok((PaneRef::parse(rest), "")),
        None => Err(format!("{} needs a pane", head)),
    }
}

fn resolve(chats: &ChatManager, pane: &PaneRef) -> Result<String, String> {
    match pane {
        PaneRef::Id(id) => Ok(id.clone()),
        PaneRef::Position(n) => chats
            .get_active_chats()
            .get(n.wrapping_sub(1))
            .map(|c| c.id.clone())
            .ok_or_else(|| format!("No open chat at position {}", n)),
    }
}

/// Bus event for a command, or `None` for commands handled locally
/// (`/stats`, `/help`, `/quit`).
pub fn to_event(chats: &ChatManager, command: Command) -> Result<Option<AppEvent>, String> {
    let event = match command {
        Command::New { ai_model_id } => AppEvent::NewChatRequested { ai_model_id },
        Command::Send { pane, text } => AppEvent::SendRequested {
            chat_id: resolve(chats, &pane)?,
            text,
        },
        Command::Close { pane } => AppEvent::CloseRequested {
            chat_id: resolve(chats, &pane)?,
            save_to_history: true,
        },
        Command::Minimize { pane } => AppEvent::MinimizeRequested {
            chat_id: resolve(chats, &pane)?,
        },
        Command::Restore { chat_id } => AppEvent::RestoreRequested { chat_id },
        Command::Model { pane, ai_model_id } => AppEvent::ModelSelected {
            chat_id: resolve(chats, &pane)?,
            ai_model_id,
        },
        Command::Broadcast { text } => AppEvent::BroadcastRequested { text },
        Command::Clear { include_started } => AppEvent::ClearChatsRequested { include_started },
        Command::Reopen { index } => AppEvent::HistoryReopenRequested { index },
        Command::Theme => AppEvent::ThemeToggleRequested,
        Command::Sidebar => AppEvent::SidebarToggleRequested,
        Command::Resize { width } => AppEvent::ViewportResized { width },
        Command::Stats | Command::Help | Command::Quit => return Ok(None),
    };
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse("  ").unwrap(), None);
        assert_eq!(parse("/new").unwrap(), Some(Command::New { ai_model_id: None }));
        assert_eq!(parse("/new 11").unwrap(), Some(Command::New { ai_model_id: Some(11) }));
        assert_eq!(
            parse("/model 2 20").unwrap(),
            Some(Command::Model {
                pane: PaneRef::Position(2),
                ai_model_id: 20
            })
        );
        assert_eq!(
            parse("/all hello   everyone").unwrap(),
            Some(Command::Broadcast {
                text: "hello   everyone".to_string()
            })
        );
        assert_eq!(parse("/clear all").unwrap(), Some(Command::Clear { include_started: true }));
        assert_eq!(
            parse("/close chat_1_abc").unwrap(),
            Some(Command::Close {
                pane: PaneRef::Id("chat_1_abc".to_string())
            })
        );
    }

    #[test]
    fn plain_lines_are_messages() {
        assert_eq!(
            parse("1 what is rust?").unwrap(),
            Some(Command::Send {
                pane: PaneRef::Position(1),
                text: "what is rust?".to_string()
            })
        );
        assert!(parse("1").is_err());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("/new gpt").is_err());
        assert!(parse("/bogus").is_err());
        assert!(parse("/model").is_err());
        assert!(parse("/all").is_err());
        assert!(parse("/resize wide").is_err());
    }
}
