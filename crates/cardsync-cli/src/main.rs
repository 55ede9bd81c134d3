//! Cardsync CLI
//!
//! Pair two devices by relaying handshake codes by hand, then edit and
//! mirror a card project from a line prompt.
//!
//! ## Usage
//!
//! ```bash
//! # Device A: print an offer code, then wait at the prompt
//! cardsync --data-dir ./a offer
//! > answer cs1.KLUv_...
//!
//! # Device B: answer A's offer and print the answer code to send back
//! cardsync --data-dir ./b answer cs1.KLUv_...
//!
//! # Inspect or edit the local project without connecting
//! cardsync --data-dir ./a list
//! cardsync --data-dir ./a add "Verse idea" ./take1.wav
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use cardsync_core::logging::LoggingBuilder;
use cardsync_core::{
    Card, CardChanges, CardId, CardOrder, IrohTransport, ProjectStore, RedbStore, SessionEvent,
    SessionHandle, SyncConfig, SyncSession,
};
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;

/// Cardsync - live two-peer sync of a card project
#[derive(Parser)]
#[command(name = "cardsync")]
#[command(version)]
#[command(about = "Cardsync - live two-peer sync of a card project")]
#[command(
    long_about = "Share a voice-memo card project with one other device. Pairing works by copying a handshake code to the other device and a second code back; no server is involved."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.cardsync)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log directory (default: <data-dir>/logs)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Session config as JSON; missing fields take their defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a session and print an offer code for the other device
    Offer,

    /// Answer another device's offer code and print the answer code
    Answer {
        /// The offer code
        code: String,
    },

    /// List the cards in the local project
    List,

    /// Add a card to the local project without connecting
    Add {
        /// Card label
        label: String,
        /// Audio file to attach
        audio: Option<PathBuf>,
    },

    /// Print the effective session config as JSON
    Config,
}

/// One line typed at the session prompt
#[derive(Debug, Clone, PartialEq)]
enum ReplCommand {
    Answer(String),
    Add { label: String, audio: Option<PathBuf> },
    Rename { id: String, label: String },
    Delete(String),
    Move { id: String, position: usize },
    List,
    Push,
    Accept,
    Reject(Option<String>),
    Request(Option<String>),
    Approve,
    Deny(Option<String>),
    Hide,
    Show,
    Status,
    Help,
    Quit,
}

const REPL_HELP: &str = "\
Commands:
  answer <code>            apply the other device's answer code
  add <label> [audio]      add a card (label in quotes if it has spaces)
  rename <id> <label>      change a card's label
  delete <id>              delete a card
  move <id> <position>     move a card (0 = first)
  list                     show the project
  push                     offer the whole project to the peer
  accept | reject [why]    decide on the peer's project
  request [why]            ask for the writer role
  approve | deny [why]     decide on the peer's role request
  hide | show              pause or resume liveness checks
  status                   print session status
  quit                     disconnect and exit

Card ids may be shortened to any unique prefix.";

fn optional(rest: &str) -> Option<String> {
    let rest = rest.trim();
    (!rest.is_empty()).then(|| rest.to_string())
}

/// Split off a leading label, honouring double quotes
fn split_label(rest: &str) -> (String, &str) {
    let rest = rest.trim_start();
    if let Some(quoted) = rest.strip_prefix('"') {
        if let Some(end) = quoted.find('"') {
            return (quoted[..end].to_string(), &quoted[end + 1..]);
        }
    }
    match rest.split_once(char::is_whitespace) {
        Some((label, tail)) => (label.to_string(), tail),
        None => (rest.to_string(), ""),
    }
}

fn parse_line(line: &str) -> Result<Option<ReplCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    let command = match word.to_lowercase().as_str() {
        "answer" => {
            anyhow::ensure!(!rest.is_empty(), "usage: answer <code>");
            // Codes may arrive wrapped; whitespace is ignored by the decoder
            ReplCommand::Answer(rest.to_string())
        }
        "add" => {
            let (label, tail) = split_label(rest);
            anyhow::ensure!(!label.is_empty(), "usage: add <label> [audio-file]");
            ReplCommand::Add {
                label,
                audio: optional(tail).map(PathBuf::from),
            }
        }
        "rename" => {
            let (id, label) = rest
                .split_once(char::is_whitespace)
                .context("usage: rename <id> <label>")?;
            let label = label.trim().trim_matches('"').to_string();
            anyhow::ensure!(!label.is_empty(), "usage: rename <id> <label>");
            ReplCommand::Rename {
                id: id.to_string(),
                label,
            }
        }
        "delete" | "rm" => {
            anyhow::ensure!(!rest.is_empty(), "usage: delete <id>");
            ReplCommand::Delete(rest.to_string())
        }
        "move" | "mv" => {
            let (id, position) = rest
                .split_once(char::is_whitespace)
                .context("usage: move <id> <position>")?;
            let position = position
                .trim()
                .parse::<usize>()
                .map_err(|e| anyhow::anyhow!("Invalid position '{}': {}", position.trim(), e))?;
            ReplCommand::Move {
                id: id.to_string(),
                position,
            }
        }
        "list" | "ls" => ReplCommand::List,
        "push" => ReplCommand::Push,
        "accept" => ReplCommand::Accept,
        "reject" => ReplCommand::Reject(optional(rest)),
        "request" => ReplCommand::Request(optional(rest)),
        "approve" => ReplCommand::Approve,
        "deny" => ReplCommand::Deny(optional(rest)),
        "hide" => ReplCommand::Hide,
        "show" => ReplCommand::Show,
        "status" => ReplCommand::Status,
        "help" | "?" => ReplCommand::Help,
        "quit" | "exit" => ReplCommand::Quit,
        other => anyhow::bail!("Unknown command '{}' (try 'help')", other),
    };
    Ok(Some(command))
}

fn setup_logging(verbosity: u8, log_dir: &Path, peer: &str) -> Result<PathBuf> {
    let mut builder = LoggingBuilder::new(log_dir, peer);
    if std::env::var_os("RUST_LOG").is_none() {
        let filter = match verbosity {
            0 => "warn",
            1 => "info,cardsync_core=debug",
            2 => "debug",
            _ => "trace",
        };
        builder = builder.with_filter(filter);
    }
    builder
        .init()
        .with_context(|| format!("Failed to set up logging in {}", log_dir.display()))
}

/// Get the default data directory (~/.cardsync)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cardsync")
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let config = match path {
        Some(path) => SyncConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// Resolve a full id or a unique prefix of one
fn resolve_card(store: &dyn ProjectStore, prefix: &str) -> Result<CardId> {
    let prefix = prefix.to_uppercase();
    let matches: Vec<CardId> = store
        .list_cards()?
        .into_iter()
        .map(|card| card.id)
        .filter(|id| id.to_string().starts_with(&prefix))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => anyhow::bail!("No card matches '{}'", prefix),
        _ => anyhow::bail!("'{}' matches {} cards, use more of the id", prefix, matches.len()),
    }
}

/// New positions for every card after moving `id` to `position`
fn reorder_for_move(cards: &[Card], id: CardId, position: usize) -> Vec<CardOrder> {
    let mut ids: Vec<CardId> = cards.iter().map(|c| c.id).filter(|c| *c != id).collect();
    ids.insert(position.min(ids.len()), id);
    ids.into_iter()
        .enumerate()
        .map(|(order, id)| CardOrder {
            id,
            order: order as u32,
        })
        .collect()
}

fn print_cards(store: &dyn ProjectStore) -> Result<()> {
    let cards = store.list_cards()?;
    if cards.is_empty() {
        println!("No cards.");
        return Ok(());
    }
    println!("{} card(s):", cards.len());
    for card in cards {
        let audio = store.get_audio(&card.id)?.map(|a| a.len()).unwrap_or(0);
        println!(
            "  {:>3}. {}  {}  ({} audio bytes)",
            card.order, card.id, card.label, audio
        );
    }
    Ok(())
}

async fn read_audio(path: Option<&Path>) -> Result<Option<Bytes>> {
    match path {
        Some(path) => {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(Some(Bytes::from(data)))
        }
        None => Ok(None),
    }
}

/// Hints printed after events that need a decision
fn event_hint(event: &SessionEvent) -> Option<&'static str> {
    match event {
        SessionEvent::SyncRequested(_) => {
            Some("Type 'accept' to replace your project or 'reject' to keep it.")
        }
        SessionEvent::RoleRequested { .. } => Some("Type 'approve' or 'deny'."),
        SessionEvent::ConnectionLost { .. } | SessionEvent::PeerLeft { .. } => {
            Some("Session over. Edits now stay local; 'quit' to exit.")
        }
        _ => None,
    }
}

/// Run one prompt command. Returns false when the user quits.
async fn run_command(
    session: &SessionHandle,
    store: &dyn ProjectStore,
    command: ReplCommand,
) -> Result<bool> {
    match command {
        ReplCommand::Answer(code) => {
            session.accept_answer(code).await?;
            println!("Answer applied, connecting...");
        }
        ReplCommand::Add { label, audio } => {
            let audio = read_audio(audio.as_deref()).await?;
            let card = Card::new(label, store.list_cards()?.len() as u32);
            let id = card.id;
            session.create_card(card, audio).await?;
            println!("Added {}", id);
        }
        ReplCommand::Rename { id, label } => {
            let id = resolve_card(store, &id)?;
            session.update_card(id, CardChanges::label(label)).await?;
        }
        ReplCommand::Delete(id) => {
            let id = resolve_card(store, &id)?;
            session.delete_card(id).await?;
            println!("Deleted {}", id);
        }
        ReplCommand::Move { id, position } => {
            let id = resolve_card(store, &id)?;
            let order = reorder_for_move(&store.list_cards()?, id, position);
            session.reorder_cards(order).await?;
        }
        ReplCommand::List => print_cards(store)?,
        ReplCommand::Push => {
            session.push_project().await?;
            println!("Project offered, waiting for the peer to decide...");
        }
        ReplCommand::Accept => session.accept_sync().await?,
        ReplCommand::Reject(reason) => session.reject_sync(reason).await?,
        ReplCommand::Request(reason) => {
            session.request_role(reason).await?;
            println!("Role requested, waiting for the peer...");
        }
        ReplCommand::Approve => session.approve_role().await?,
        ReplCommand::Deny(reason) => session.deny_role(reason).await?,
        ReplCommand::Hide => session.set_visibility(true)?,
        ReplCommand::Show => session.set_visibility(false)?,
        ReplCommand::Status => {
            println!("{}", serde_json::to_string_pretty(&session.status())?);
        }
        ReplCommand::Help => println!("{}", REPL_HELP),
        ReplCommand::Quit => {
            session.disconnect(true).await?;
            return Ok(false);
        }
    }
    Ok(true)
}

async fn repl(session: SessionHandle, store: Arc<RedbStore>) -> Result<()> {
    let mut events = session.subscribe();
    let stdin = tokio::io::stdin();
    let reader = tokio::io::BufReader::new(stdin);
    let mut lines = tokio::io::AsyncBufReadExt::lines(reader);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match parse_line(&line) {
                        Ok(Some(command)) => match run_command(&session, store.as_ref(), command).await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => eprintln!("Error: {}", e),
                        },
                        Ok(None) => {}
                        Err(e) => eprintln!("{}", e),
                    },
                    Ok(None) => {
                        // EOF - stdin closed
                        session.disconnect(true).await?;
                        break;
                    }
                    Err(e) => eprintln!("Read error: {}", e),
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        println!("* {}", event);
                        if let Some(hint) = event_hint(&event) {
                            println!("  {}", hint);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Event display fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                session.disconnect(true).await?;
                break;
            }
        }
    }

    // Let the farewell reach the peer
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let log_dir = cli.log_dir.unwrap_or_else(|| data_dir.join("logs"));
    let peer = match &cli.command {
        Commands::Offer => "offer",
        Commands::Answer { .. } => "answer",
        _ => "local",
    };
    let log_path = setup_logging(cli.verbose, &log_dir, peer)?;
    tracing::debug!(path = %log_path.display(), "Logging to file");

    let config = load_config(cli.config.as_deref())?;
    if let Commands::Config = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let store = Arc::new(
        RedbStore::new(data_dir.join("project.redb"))
            .with_context(|| format!("Failed to open project in {}", data_dir.display()))?,
    );

    match cli.command {
        Commands::List => print_cards(store.as_ref())?,

        Commands::Add { label, audio } => {
            let audio = read_audio(audio.as_deref()).await?;
            let card = Card::new(label, store.list_cards()?.len() as u32);
            store.put_card(&card)?;
            if let Some(audio) = audio {
                store.put_audio(&card.id, audio)?;
            }
            println!("Card added");
            println!("  ID: {}", card.id);
        }

        Commands::Offer => {
            let session = SyncSession::spawn(config, IrohTransport::new(), store.clone())?;
            println!("Gathering network addresses...");
            let offer = session.create_offer().await?;
            println!();
            println!("Offer code (send this to the other device):");
            println!();
            println!("{}", offer);
            println!();
            println!("Then paste their reply here as: answer <code>");
            repl(session, store).await?;
        }

        Commands::Answer { code } => {
            let session = SyncSession::spawn(config, IrohTransport::new(), store.clone())?;
            println!("Gathering network addresses...");
            let answer = session.accept_offer(code).await?;
            println!();
            println!("Answer code (send this back to the offering device):");
            println!();
            println!("{}", answer);
            println!();
            println!("Waiting for the connection... type 'help' for commands.");
            repl(session, store).await?;
        }

        Commands::Config => {}
    }

    Ok(())
}
