//! CLI tool to inspect and seed the persisted credential pool
//!
//! Usage:
//!   cargo run --bin pool_store -- show
//!   cargo run --bin pool_store -- seed hf_aaa hf_bbb
//!   cargo run --bin pool_store -- clear --yes

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use credential_relay::{
    config::{create_credential_store, Settings},
    services::pool::{Slot, SlotPool},
    store::CredentialStore,
    utils::mask_secret,
};

/// Manage the persisted credential pool
#[derive(Parser, Debug)]
#[command(name = "pool_store")]
#[command(about = "Inspect and seed the persisted credential pool")]
struct Args {
    /// Storage key (overrides API_KEYS_STORAGE_KEY env var)
    #[arg(long)]
    storage_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the pool slot by slot
    Show {
        /// Print tokens in full instead of masked
        #[arg(long)]
        reveal: bool,
    },
    /// Add tokens to the pool, filling empty slots first
    Seed {
        #[arg(required = true)]
        tokens: Vec<String>,
    },
    /// Delete the persisted pool
    Clear {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load()?;
    if let Some(key) = args.storage_key {
        settings.pool.storage_key = key;
    }

    let store = create_credential_store(&settings)?;
    let key = settings.pool.storage_key.as_str();

    match args.command {
        Command::Show { reveal } => {
            let pool = load(store.as_ref(), key).await?;
            println!(
                "{} ({} backend): {} slots, {} active",
                key,
                store.backend(),
                pool.len(),
                pool.active_count()
            );
            for (index, slot) in pool.slots().iter().enumerate() {
                match slot {
                    Slot::Active(token) if reveal => println!("  [{}] {}", index, token),
                    Slot::Active(token) => println!("  [{}] {}", index, mask_secret(token)),
                    Slot::Empty => println!("  [{}] -", index),
                }
            }
        }
        Command::Seed { tokens } => {
            let mut pool = load(store.as_ref(), key).await?;
            let mut added = 0;
            for token in tokens {
                let token = token.trim().to_string();
                if token.is_empty() {
                    continue;
                }
                let placement = pool.place(token);
                if placement.is_new() {
                    added += 1;
                } else {
                    println!("  slot {} already holds this token, skipped", placement.index());
                }
            }

            if added == 0 {
                println!("Nothing to write");
                return Ok(());
            }

            let json = pool.to_persisted()?;
            store.set(key, &json).await.context("Failed to write credential pool")?;
            println!("Added {} token(s); {} active of {} slots", added, pool.active_count(), pool.len());
        }
        Command::Clear { yes } => {
            if !yes {
                anyhow::bail!("Refusing to delete '{}' without --yes", key);
            }
            if store.delete(key).await.context("Failed to delete credential pool")? {
                println!("Deleted {}", key);
            } else {
                println!("{} did not exist", key);
            }
        }
    }

    Ok(())
}

async fn load(store: &dyn CredentialStore, key: &str) -> Result<SlotPool> {
    match store.get(key).await.context("Failed to read credential pool")? {
        Some(json) => SlotPool::from_persisted(&json).context("Persisted credential pool is corrupt"),
        None => Ok(SlotPool::new()),
    }
}
