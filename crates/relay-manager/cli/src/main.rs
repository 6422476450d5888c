mod command;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Result, anyhow};
use clap::Parser;
use command::{CliHelper, Command, execute_command};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use nostr_sdk::Client;
use relay_manager::{
    Config, DefaultRelay, LogEntry, Logger, NostrRelayPool, RegistryBuilder, RelayEvent,
    RelayEventListener, SqliteStorage, default_config,
};
use rustyline::{Editor, error::ReadlineError, hint::HistoryHinter};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Clone, Parser, Debug, Serialize, Deserialize)]
#[command(version, about = "Interactive relay manager", long_about = None)]
struct Args {
    /// Path to the data directory
    #[arg(short, long, default_value = "./.data")]
    data_dir: String,

    /// Optional TOML file overriding these arguments
    #[arg(long, default_value = "relay-cli.toml")]
    config: PathBuf,

    /// Filter for the log file, in env filter format
    #[arg(long)]
    log_filter: Option<String>,

    #[arg(long, default_value = "3")]
    max_connect_attempts: u32,

    #[arg(long, default_value = "30")]
    health_check_interval_secs: u64,

    #[arg(long, default_value = "10")]
    connect_timeout_secs: u64,

    /// Replaces the built-in default relays. Config file only.
    #[arg(skip)]
    #[serde(default)]
    default_relays: Vec<DefaultRelay>,
}

impl Args {
    fn relay_config(&self) -> Config {
        let mut config = default_config();
        config.max_connect_attempts = self.max_connect_attempts;
        config.health_check_interval_secs = self.health_check_interval_secs;
        config.connect_timeout_secs = self.connect_timeout_secs;
        if !self.default_relays.is_empty() {
            config.default_relays = self.default_relays.clone();
        }
        config
    }
}

fn load_args() -> Result<Args> {
    let args = Args::parse();
    let config_file = std::fs::canonicalize(&args.config).ok();
    let mut figment = Figment::new().merge(Serialized::defaults(args));
    if let Some(config_file) = &config_file {
        figment = figment.merge(Toml::file(config_file));
    }
    Ok(figment.merge(Env::prefixed("RELAY_CLI_")).extract()?)
}

fn expand_path(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(stripped) => Ok(dirs::home_dir()
            .ok_or_else(|| anyhow!("Could not find home directory"))?
            .join(stripped)),
        None => Ok(PathBuf::from(path)),
    }
}

/// Parse a command string into a Command using clap
fn parse_command(input: &str) -> Result<Command> {
    if input.trim() == "exit" || input.trim() == "quit" {
        return Ok(Command::Exit);
    }

    let mut args = vec!["relay-cli".to_string()];
    match shlex::split(input) {
        Some(split_args) => args.extend(split_args),
        None => return Err(anyhow!("Failed to parse input string: {}", input)),
    }

    Command::try_parse_from(args).map_err(|e| anyhow!("Command parsing error: {}", e))
}

/// Prints warnings and errors of the relay manager to the shell.
struct CliLogger;

impl Logger for CliLogger {
    fn log(&self, l: LogEntry) {
        if l.level == "WARN" || l.level == "ERROR" {
            println!("[{}] {}", l.level, l.line);
        }
    }
}

struct CliEventListener;

#[async_trait::async_trait]
impl RelayEventListener for CliEventListener {
    async fn on_event(&self, event: RelayEvent) {
        info!(
            "Event: {}",
            serde_json::to_string(&event)
                .unwrap_or_else(|_| "Failed to serialize event".to_string())
        );
    }
}

async fn run_interactive_mode(args: Args) -> Result<()> {
    let data_dir = expand_path(&args.data_dir)?;
    relay_manager::init_logging(&data_dir, Some(Box::new(CliLogger)), args.log_filter.clone())?;
    let history_file = data_dir.join("history.txt");

    let rl = &mut Editor::new()?;
    rl.set_helper(Some(CliHelper {
        hinter: HistoryHinter {},
    }));
    if rl.load_history(&history_file).is_err() {
        info!("No history found");
    }

    let config = args.relay_config();
    let storage = Arc::new(SqliteStorage::new(&data_dir)?);
    let pool = Arc::new(NostrRelayPool::new(Client::default(), config.connect_timeout()));
    let bus = relay_manager::init_global_bus();
    bus.add_listener(Box::new(CliEventListener)).await;

    let registry = RegistryBuilder::new(config, storage, pool)
        .with_event_bus(bus)
        .build()
        .await?;

    println!("Relay manager interactive mode");
    println!("Type 'help' for available commands or 'exit' to quit");

    loop {
        match rl.readline("relay-cli> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                rl.add_history_entry(line.as_str())?;

                match parse_command(trimmed) {
                    Ok(command) => match execute_command(command, &registry).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => println!("Error: {e}"),
                    },
                    Err(e) => println!("{e}"),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                registry.shutdown().await;
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                registry.shutdown().await;
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                registry.shutdown().await;
                break;
            }
        }
    }

    relay_manager::shutdown_global_bus();
    rl.save_history(&history_file)?;
    println!("Goodbye!");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = load_args()?;
    Box::pin(run_interactive_mode(args)).await
}

#[cfg(test)]
mod tests {
    use relay_manager::RelayPermission;

    use super::*;

    #[test]
    fn test_parse_add_with_permission() {
        let command = parse_command("add relay.example.com --permission Read").unwrap();
        let Command::Add { url, permission } = command else {
            panic!("expected add");
        };
        assert_eq!(url, "relay.example.com");
        assert_eq!(permission, Some(RelayPermission::Read));
    }

    #[test]
    fn test_parse_exit_and_errors() {
        assert!(matches!(parse_command(" quit ").unwrap(), Command::Exit));
        assert!(parse_command("add").is_err());
        assert!(parse_command("login --nsec a --npub b").is_err());
        assert!(parse_command("add \"unterminated").is_err());
    }

    #[test]
    fn test_config_file_replaces_default_relays() {
        let args = Args {
            data_dir: "./.data".to_string(),
            config: PathBuf::from("relay-cli.toml"),
            log_filter: None,
            max_connect_attempts: 5,
            health_check_interval_secs: 30,
            connect_timeout_secs: 10,
            default_relays: vec![DefaultRelay {
                url: "wss://only.relay".to_string(),
                permission: RelayPermission::ReadWrite,
            }],
        };
        let config = args.relay_config();
        assert_eq!(config.max_connect_attempts, 5);
        assert_eq!(config.default_relay_list().len(), 1);
    }
}
