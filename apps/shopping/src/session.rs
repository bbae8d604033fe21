//! Interactive list session: one controller drives both the live table and
//! the `add`/`delete` commands typed on stdin.

use anyhow::Result;
use client_core::ListController;
use shared::{
    domain::{Item, ItemId, Snapshot},
    error::ErrorCode,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

pub const HELP: &str =
    "commands: add <name> [quantity] [unit] [price] | delete <id> | list | help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Add {
        name: String,
        quantity: String,
        unit: String,
        price: String,
    },
    Delete(ItemId),
    List,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    List(Snapshot),
    Message(String),
}

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<SessionCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let command = match verb {
        "add" => {
            let name = words.next().ok_or("usage: add <name> [quantity] [unit] [price]")?;
            let mut field = || words.next().unwrap_or_default().to_string();
            let (quantity, unit, price) = (field(), field(), field());
            SessionCommand::Add {
                name: name.to_string(),
                quantity,
                unit,
                price,
            }
        }
        "delete" | "del" => {
            let raw = words.next().ok_or("usage: delete <id>")?;
            let id = raw
                .parse::<i64>()
                .map_err(|_| format!("not an item id: {raw}"))?;
            SessionCommand::Delete(ItemId(id))
        }
        "list" | "ls" => SessionCommand::List,
        "help" | "?" => SessionCommand::Help,
        "quit" | "exit" => SessionCommand::Quit,
        other => return Err(format!("unknown command '{other}'; {HELP}")),
    };
    Ok(Some(command))
}

/// Runs one command against `controller`. `current` resolves ids for
/// `delete`. Returns `None` once the session should end.
pub async fn execute(
    controller: &ListController,
    current: &[Item],
    command: SessionCommand,
) -> Option<SessionOutput> {
    let output = match command {
        SessionCommand::Add {
            name,
            quantity,
            unit,
            price,
        } => match controller.add_item(&name, &quantity, &unit, &price) {
            Ok(pending) => match pending.wait().await {
                Ok(item_id) => SessionOutput::Message(format!("added item_id={item_id}")),
                Err(err) => SessionOutput::Message(format!("{:?}: {err}", err.code())),
            },
            Err(err) => SessionOutput::Message(format!("{:?}: {err}", err.code())),
        },
        SessionCommand::Delete(item_id) => {
            match current.iter().find(|item| item.id == item_id).cloned() {
                Some(item) => match controller.delete_item(item).wait().await {
                    Ok(()) => SessionOutput::Message(format!("deleted item_id={item_id}")),
                    Err(err) => SessionOutput::Message(format!("{:?}: {err}", err.code())),
                },
                None => {
                    warn!(code = ?ErrorCode::NotFound, item_id = item_id.0, "nothing to delete");
                    SessionOutput::Message(format!("no item with id {item_id}"))
                }
            }
        }
        SessionCommand::List => SessionOutput::List(controller.snapshot()),
        SessionCommand::Help => SessionOutput::Message(HELP.to_string()),
        SessionCommand::Quit => return None,
    };
    Some(output)
}

/// Shows the list, then redraws it on every change while reading commands
/// from `input` until `quit` or end of input.
pub async fn run<R>(
    controller: &ListController,
    input: R,
    mut emit: impl FnMut(SessionOutput),
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut list = controller.current_list();
    let mut lines = input.lines();
    emit(SessionOutput::List(list.latest()));
    emit(SessionOutput::Message(HELP.to_string()));

    loop {
        tokio::select! {
            changed = list.changed() => match changed {
                Some(snapshot) => emit(SessionOutput::List(snapshot)),
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("session input closed");
                    break;
                };
                let command = match parse_line(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(message) => {
                        emit(SessionOutput::Message(message));
                        continue;
                    }
                };
                let current = list.latest();
                match execute(controller, &current, command).await {
                    Some(output) => emit(output),
                    None => break,
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
