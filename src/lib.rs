// Declare the modules
pub mod api;
pub mod app;
pub mod chat;
pub mod config;
pub mod console;
pub mod events;
pub mod handlers;
pub mod models;
pub mod state;
pub mod storage;
pub mod ui;

use anyhow::Context;
use app::App;
use config::ClientConfig;
use console::Command;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use ui::TerminalSurface;

/// Boots against the configured backend and drives the app from stdin until
/// `/quit` or end of input.
pub async fn run() -> anyhow::Result<()> {
    let config = ClientConfig::from_env().context("Invalid configuration")?;

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_level.as_str())).init();
    log::info!("Starting against {}", config.base_url);

    let surface = Arc::new(Mutex::new(TerminalSurface::new()));
    let app = App::boot(config, surface).await?;
    println!("{}", console::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        let command = match console::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("! {}", e);
                continue;
            }
        };

        match command {
            Command::Quit => break,
            Command::Help => println!("{}", console::HELP),
            Command::Stats => {
                let stats = serde_json::to_string_pretty(&app.chats.get_stats())?;
                println!("{}", stats);
            }
            other => match console::to_event(&app.chats, other) {
                Ok(Some(event)) => app.bus.emit(event),
                Ok(None) => {}
                Err(e) => eprintln!("! {}", e),
            },
        }
    }

    app.shutdown();
    log::info!("Bye");
    Ok(())
}
