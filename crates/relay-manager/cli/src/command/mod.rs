use std::borrow::Cow::{self, Owned};

use anyhow::anyhow;
use clap::Parser;
use nostr::{Keys, PublicKey};
use relay_manager::{RelayList, RelayPermission, RelayRegistry, RelayUrl};
use rustyline::{Completer, Helper, Hinter, Validator, highlight::Highlighter, hint::HistoryHinter};
use serde::Serialize;

#[derive(Clone, Parser)]
pub enum Command {
    /// Exit the interactive shell
    #[command(hide = true)]
    Exit,

    /// List the configured relays and their connection status
    List,

    /// Add a relay
    Add {
        /// The relay address, the scheme is optional
        url: String,

        /// read, write, readwrite or indexer
        #[arg(short, long)]
        permission: Option<RelayPermission>,
    },

    /// Remove a relay
    Remove { url: String },

    /// Move a relay to the next permission (read, write, readwrite, indexer)
    Cycle { url: String },

    /// Retry connecting to a relay from a clean attempt counter
    Reconnect { url: String },

    /// Restore the default relays
    Defaults,

    /// Delete the stored relays of the current identity
    Clear,

    /// Log in with a secret key, or with a public key for a read-only session
    Login {
        #[arg(long, conflicts_with = "npub")]
        nsec: Option<String>,

        #[arg(long)]
        npub: Option<String>,
    },

    /// Log out and return to the global relay list
    Logout,

    /// Use the given relays for the rest of this session without storing them
    SessionDefaults {
        #[arg(required = true)]
        relays: Vec<String>,

        #[arg(short, long, default_value = "read")]
        permission: RelayPermission,
    },
}

#[derive(Helper, Completer, Hinter, Validator)]
pub struct CliHelper {
    #[rustyline(Hinter)]
    pub hinter: HistoryHinter,
}

impl Highlighter for CliHelper {
    fn highlight_hint<'h>(&self, hint: &'h str) -> Cow<'h, str> {
        Owned("\x1b[1m".to_owned() + hint + "\x1b[m")
    }
}

#[derive(Serialize)]
struct Listing<'a> {
    identity: Option<String>,
    can_publish: bool,
    relays: &'a [relay_manager::RelayStatus],
}

pub(crate) async fn execute_command(
    command: Command,
    registry: &RelayRegistry,
) -> Result<bool, anyhow::Error> {
    match command {
        Command::Exit => {
            registry.shutdown().await;
            Ok(false)
        }
        Command::List => {
            let statuses = registry.statuses().await;
            print_value(&Listing {
                identity: registry.identity().await.map(|pk| pk.to_hex()),
                can_publish: registry.can_publish().await,
                relays: &statuses,
            })?;
            Ok(true)
        }
        Command::Add { url, permission } => {
            if registry.add(&url, permission).await? {
                println!("Added {}", RelayUrl::parse(&url)?);
            } else {
                println!("Already configured");
            }
            Ok(true)
        }
        Command::Remove { url } => {
            if !registry.remove(&url).await? {
                println!("Not configured");
            }
            Ok(true)
        }
        Command::Cycle { url } => {
            match registry.cycle_permission(&url).await? {
                Some(permission) => println!("Now {permission}"),
                None => println!("Not configured"),
            }
            Ok(true)
        }
        Command::Reconnect { url } => {
            if !registry.reconnect(&url).await? {
                println!("Not a read relay");
            }
            Ok(true)
        }
        Command::Defaults => {
            registry.restore_defaults().await;
            Ok(true)
        }
        Command::Clear => {
            registry.clear().await;
            Ok(true)
        }
        Command::Login { nsec, npub } => {
            match (nsec, npub) {
                (Some(nsec), _) => {
                    let keys = Keys::parse(&nsec)?;
                    println!("Logged in as {}", keys.public_key().to_hex());
                    registry.sign_in(keys).await;
                }
                (None, Some(npub)) => {
                    let public_key = PublicKey::parse(&npub)?;
                    println!("Read-only session for {}", public_key.to_hex());
                    registry.switch_identity(Some(public_key)).await;
                }
                (None, None) => return Err(anyhow!("Either --nsec or --npub is required")),
            }
            Ok(true)
        }
        Command::Logout => {
            registry.sign_out().await;
            Ok(true)
        }
        Command::SessionDefaults { relays, permission } => {
            let mut list = RelayList::new();
            for url in relays {
                list.insert(RelayUrl::parse(&url)?, permission);
            }
            registry.set_session_defaults(&list).await;
            Ok(true)
        }
    }
}

pub(crate) fn print_value<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
