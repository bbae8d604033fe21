use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{ControllerConfig, ListController};
use shared::{
    domain::{Item, ItemId},
    error::ErrorCode,
};
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod session;

use config::{load_settings, normalize_database_url};
use session::SessionOutput;

#[derive(Parser, Debug)]
#[command(name = "shopping", about = "Keep a local shopping list")]
struct Cli {
    #[arg(long, global = true, default_value = "shopping.toml")]
    config: PathBuf,
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add an item to the list.
    Add {
        name: String,
        #[arg(long, default_value = "")]
        quantity: String,
        #[arg(long, default_value = "")]
        unit: String,
        #[arg(long, default_value = "")]
        price: String,
    },
    /// Remove the item with the given id.
    Delete { id: i64 },
    /// Print the list, newest first.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Interactive session: shows the list live and takes `add`/`delete`
    /// commands on stdin until `quit`, end of input or Ctrl-C.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings(&cli.config);
    if let Some(database_url) = cli.database_url {
        settings.database_url = database_url;
    }
    let database_url = normalize_database_url(&settings.database_url);

    let storage = storage::shared_storage(&database_url)
        .await
        .with_context(|| format!("failed to open shopping list at '{database_url}'"))?;
    let controller = ListController::with_config(
        Arc::new(storage.clone()),
        ControllerConfig {
            share_grace: settings.share_grace(),
        },
    );

    match cli.command {
        Command::Add {
            name,
            quantity,
            unit,
            price,
        } => {
            let item_id = controller
                .add_item(&name, &quantity, &unit, &price)
                .map_err(|err| anyhow!("{:?}: {err}", err.code()))?
                .wait()
                .await
                .map_err(|err| anyhow!("{:?}: {err}", err.code()))?;
            println!("added item_id={item_id}");
        }
        Command::Delete { id } => {
            let items = storage.list_items().await?;
            let Some(item) = items.into_iter().find(|item| item.id == ItemId(id)) else {
                warn!(code = ?ErrorCode::NotFound, item_id = id, "nothing to delete");
                println!("no item with id {id}");
                return Ok(());
            };
            controller
                .delete_item(item)
                .wait()
                .await
                .map_err(|err| anyhow!("{:?}: {err}", err.code()))?;
            println!("deleted item_id={id}");
        }
        Command::List { json } => {
            let items = storage.list_items().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                print_table(&items);
            }
        }
        Command::Watch => {
            info!(database_url = %database_url, "starting list session");
            let input = BufReader::new(tokio::io::stdin());
            tokio::select! {
                result = session::run(&controller, input, print_output) => result?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
    }

    Ok(())
}

fn print_output(output: SessionOutput) {
    match output {
        SessionOutput::List(items) => print_table(&items),
        SessionOutput::Message(text) => println!("{text}"),
    }
}

fn print_table(items: &[Item]) {
    println!("{:>5}  {:<24} {:<12} {:>10}", "Id", "Name", "Qty", "Price");
    for item in items {
        println!(
            "{:>5}  {:<24} {:<12} {:>10}",
            item.id,
            item.name,
            item.quantity_label(),
            item.price
        );
    }
    if items.is_empty() {
        println!("       (empty)");
    }
}
