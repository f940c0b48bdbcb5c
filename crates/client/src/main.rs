// Session Sync Client
// Connects to the relay via WebSocket and edits a shared session document

mod commands;
mod ws;

use anyhow::{Context, Result};
use commands::{default_document, Command, LOG_CAP, LOG_FIELD};
use engine::{
    ChangeOrigin, Collaborators, SaveState, SessionConfig, SessionEvent, SyncConfig, SyncSession,
};
use serde_json::json;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ws::WsTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; quiet by default so the prompt stays readable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    // Configuration
    let server_url =
        std::env::var("SERVER_URL").unwrap_or_else(|_| "ws://127.0.0.1:9001/ws".to_string());
    let session = std::env::var("SESSION").unwrap_or_else(|_| "LOBBY".to_string());
    let display_name = std::env::var("DISPLAY_NAME").unwrap_or_else(|_| "Anonymous".to_string());
    let sync = SyncConfig::from_env();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                   Session Sync - Client                      ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Connecting to server at {}...", server_url);

    let transport = WsTransport::connect(&server_url, sync.request_timeout)
        .await
        .context("Failed to connect to server")?;
    println!("✓ Connected to server!");

    let config = SessionConfig::new(session)
        .with_display_name(display_name)
        .with_initial_document(default_document())
        .with_sync(sync);
    let session = SyncSession::join(config, Collaborators::from_shared(Arc::new(transport))).await;

    if let Some(e) = session.last_error() {
        println!("[warn] Could not load the stored document: {}", e);
    }
    println!(
        "✓ Joined session {} as {}",
        session.session(),
        session.client_id()
    );
    println!();

    let events_task = tokio::spawn(print_events(session.subscribe()));

    // Print help
    print_help();

    // Main input loop
    let stdin = io::stdin();
    let mut input = String::new();

    loop {
        print!("> ");
        io::stdout().flush().ok();

        input.clear();
        match stdin.read_line(&mut input) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let command = match Command::parse(&input) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("[error] {}", e);
                continue;
            }
        };

        if command == Command::Quit {
            break;
        }
        if let Err(e) = handle_command(&session, command).await {
            println!("[error] {}", e);
        }
    }

    // Cleanup
    println!("[info] Saving and leaving...");
    events_task.abort();
    match session.leave().await {
        Ok(()) => println!("[info] Goodbye!"),
        Err(e) => println!("[error] Final save failed: {}", e),
    }

    Ok(())
}

// Command Handlers
fn print_help() {
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│                      Available Commands                     │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│  show                     - Show the whole document         │");
    println!("│  get <field>              - Show one field                  │");
    println!("│  set <field> <json>       - Set a field (text if not JSON)  │");
    println!("│  log <message>            - Add an entry to the log         │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│  edit <field>             - Mark a field as being edited    │");
    println!("│  done <field>             - Stop editing a field            │");
    println!("│  view <name>              - Switch the view you are on      │");
    println!("│  who                      - Who is online, and where        │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│  flush                    - Save pending edits now          │");
    println!("│  status                   - Show sync status                │");
    println!("│  help                     - Show this help                  │");
    println!("│  quit                     - Save, leave and exit            │");
    println!("└─────────────────────────────────────────────────────────────┘");
    println!();
    println!("Shortcuts: s=show, g=get, e=edit, v=view, w=who, f=flush, q=quit");
    println!();
}

async fn handle_command(session: &SyncSession, command: Command) -> Result<()> {
    match command {
        Command::Help => print_help(),

        Command::Show => {
            let document = session.get_document();
            println!("─────────────────────────────────────────");
            if document.is_empty() {
                println!("(empty document)");
            } else {
                println!("{}", serde_json::to_string_pretty(&document)?);
            }
            println!("─────────────────────────────────────────");
        }

        Command::Get(field) => match session.get(&field) {
            Some(value) => println!("{} = {}", field, value),
            None => println!("{} is not set", field),
        },

        Command::Set(field, value) => {
            // Soft locks only warn
            if let Some(editor) = session.get_field_editor(&field) {
                println!("[warn] {} is being edited by {}", field, editor.display_name);
            }
            let changes = session.set(field.clone(), value);
            if changes.is_empty() {
                println!("[info] {} unchanged", field);
            } else {
                println!("[local] Set {}", field);
            }
        }

        Command::Log(message) => {
            let now = chrono::Utc::now();
            let entry = json!({
                "id": now.timestamp_millis().to_string(),
                "timestamp": now.to_rfc3339(),
                "message": message,
                "type": "info",
            });
            session.append_capped(LOG_FIELD, entry, LOG_CAP);
            println!("[local] Logged");
        }

        Command::Edit(field) => {
            if let Some(editor) = session.get_field_editor(&field) {
                println!("[warn] {} is also editing {}", editor.display_name, field);
            }
            session.begin_editing(&field).await;
            println!("[info] Editing {}", field);
        }

        Command::Done(field) => {
            session.stop_editing(&field).await;
            println!("[info] Done editing {}", field);
        }

        Command::View(view) => {
            session.update_current_view(&view).await;
            let others = session.presence().users_in_view(&view);
            println!("[info] Now on {} ({} other(s) here)", view, others.len());
        }

        Command::Who => {
            let me = session.client_id();
            println!("─────────────────────────────────────────");
            for record in session.presence().online_users() {
                let marker = if record.client_id == me { "*" } else { " " };
                let editing: Vec<&str> = record.editing_fields.iter().map(String::as_str).collect();
                println!(
                    "{} {:<20} on {:<12} editing [{}]",
                    marker,
                    record.display_name,
                    record.current_view,
                    editing.join(", ")
                );
            }
            println!("─────────────────────────────────────────");
        }

        Command::Flush => {
            session.flush_now().await?;
            println!("[info] Saved");
        }

        Command::Status => {
            println!("─────────────────────────────────────────");
            println!("Session:    {}", session.session());
            println!("Client ID:  {}", session.client_id());
            println!("Save state: {:?}", session.save_state());
            println!("Unsaved:    {:?}", session.dirty_fields());
            if let Some(e) = session.last_error() {
                println!("Last error: {}", e);
            }
            println!("─────────────────────────────────────────");
        }

        // Handled by the input loop
        Command::Quit => {}
    }

    Ok(())
}

// Session Event Printer
async fn print_events(mut events: tokio::sync::broadcast::Receiver<SessionEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("Missed {} session events", missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let line = match event {
            SessionEvent::DocumentChanged(change) => {
                let fields: Vec<&String> = change.changes.keys().collect();
                match change.origin {
                    ChangeOrigin::Local => continue,
                    ChangeOrigin::Broadcast(sender) => {
                        format!("[remote] {} updated {:?}", sender, fields)
                    }
                    ChangeOrigin::Durable => format!("[sync] Caught up {:?}", fields),
                    ChangeOrigin::Load => format!("[sync] Loaded {:?}", fields),
                }
            }
            SessionEvent::SaveState(SaveState::OfflinePending) => {
                "[warn] Saving failed; edits kept locally until the next change".to_string()
            }
            SessionEvent::Error(e) => format!("[error] {}", e),
            SessionEvent::SaveState(_) | SessionEvent::PresenceChanged => continue,
        };

        println!();
        println!("{}", line);
        print!("> ");
        io::stdout().flush().ok();
    }
}
