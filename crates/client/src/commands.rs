// Command line parsing for the interactive client

use anyhow::{bail, Result};
use protocol::Document;
use serde_json::{json, Value};

/// Entries kept by `log`, newest first
pub const LOG_CAP: usize = 100;

/// Field `log` appends to
pub const LOG_FIELD: &str = "log";

/// Document a session starts from when nothing has been stored yet:
/// threat die at 1, no missions or danger clocks, an empty journal and log
pub fn default_document() -> Document {
    let mut document = Document::new();
    document.insert("threatDie".to_string(), json!(1));
    document.insert("missions".to_string(), json!([]));
    document.insert("dangerClocks".to_string(), json!([]));
    document.insert("journal".to_string(), json!(""));
    document.insert(LOG_FIELD.to_string(), json!([]));
    document
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Show,
    Get(String),
    Set(String, Value),
    Edit(String),
    Done(String),
    View(String),
    Who,
    Log(String),
    Flush,
    Status,
    Quit,
}

impl Command {
    /// Parse one input line. Empty input yields `None`.
    pub fn parse(line: &str) -> Result<Option<Command>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let parts: Vec<&str> = trimmed.splitn(2, ' ').collect();
        let cmd = parts[0].to_lowercase();
        let args = parts.get(1).copied().unwrap_or("").trim();

        let command = match cmd.as_str() {
            "help" | "h" | "?" => Command::Help,
            "show" | "s" => Command::Show,
            "get" | "g" => Command::Get(field(args, "get <field>")?),
            "set" => {
                let (name, raw) = args.split_once(' ').unwrap_or((args, ""));
                if name.is_empty() || raw.trim().is_empty() {
                    bail!("Usage: set <field> <json value>");
                }
                Command::Set(name.to_string(), parse_value(raw.trim()))
            }
            "edit" | "e" => Command::Edit(field(args, "edit <field>")?),
            "done" => Command::Done(field(args, "done <field>")?),
            "view" | "v" => Command::View(field(args, "view <name>")?),
            "who" | "w" => Command::Who,
            "log" => {
                if args.is_empty() {
                    bail!("Usage: log <message>");
                }
                Command::Log(args.to_string())
            }
            "flush" | "f" => Command::Flush,
            "status" => Command::Status,
            "quit" | "exit" | "q" | "leave" => Command::Quit,
            other => bail!(
                "Unknown command '{}'. Type 'help' for available commands.",
                other
            ),
        };
        Ok(Some(command))
    }
}

fn field(args: &str, usage: &str) -> Result<String> {
    match args.split_whitespace().next() {
        Some(name) => Ok(name.to_string()),
        None => bail!("Usage: {}", usage),
    }
}

/// JSON when it parses, otherwise the raw text as a string
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
