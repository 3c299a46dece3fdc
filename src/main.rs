use std::sync::Arc;

use clap::Parser;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use roomsync::cli::{Args, Command};
use roomsync::config::SyncConfig;
use roomsync::error::SyncError;
use roomsync::gateway::{CompletionGateway, HttpGateway, UnavailableGateway};
use roomsync::hub;
use roomsync::protocol::{ChatEntry, DocumentSnapshot, Origin};
use roomsync::router::CommandOutcome;
use roomsync::session::{SessionUpdate, SyncSession};
use roomsync::document::RemoteApply;

// ---------------------------------------------------------------------------
// Terminal input
// ---------------------------------------------------------------------------

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Chat(String),
    Open(String),
    Edit(String),
    Show,
    Help,
    Quit,
    Unknown(String),
    Blank,
}

fn parse_input(line: &str) -> Input {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Blank;
    }
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Input::Chat(trimmed.to_string());
    };
    let (cmd, arg) = match rest.split_once(char::is_whitespace) {
        Some((c, a)) => (c, a.trim()),
        None => (rest, ""),
    };
    match cmd {
        "open" if !arg.is_empty() => Input::Open(arg.to_string()),
        // Raw remainder so leading spaces in the document survive.
        "edit" => Input::Edit(line.trim_start().get(6..).unwrap_or("").to_string()),
        "show" => Input::Show,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        _ => Input::Unknown(trimmed.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render_entry(entry: &ChatEntry, own_name: &str) -> String {
    let author = match entry.origin {
        Origin::Assistant => entry.author.bright_magenta().bold(),
        Origin::User if entry.author == own_name => entry.author.bright_green(),
        Origin::User => entry.author.bright_cyan(),
    };
    format!("{} {}: {}", format!("[{}]", entry.created_at).dimmed(), author, entry.body)
}

/// Print transcript entries appended since the last call.
fn flush_transcript(session: &SyncSession, printed: &mut usize) {
    for entry in session.transcript().entries().iter().skip(*printed) {
        println!("{}", render_entry(entry, session.username()));
    }
    *printed = session.transcript().len();
}

fn describe_peer(session: &SyncSession, participant_id: &str) -> String {
    session
        .peer_name(participant_id)
        .map(str::to_string)
        .unwrap_or_else(|| participant_id.chars().take(8).collect())
}

fn render_update(session: &SyncSession, update: &SessionUpdate) {
    match update {
        SessionUpdate::Joined { participant_id } => {
            eprintln!("{}", format!("  joined as {participant_id}").bright_blue());
        }
        SessionUpdate::Assistant(CommandOutcome::Failure { error_message }) => {
            eprintln!("{}", error_message.bright_red());
        }
        SessionUpdate::Document { file_id, applied: RemoteApply::Applied } => {
            println!("{}", format!("~ {file_id} updated by a peer").bright_yellow());
        }
        SessionUpdate::Document { file_id, applied: RemoteApply::Queued } => {
            println!("{}", format!("~ update for {file_id} queued until opened").dimmed());
        }
        SessionUpdate::PeerTyping { participant_id, typing: true } => {
            println!("{}", format!("  {} is typing...", describe_peer(session, participant_id)).dimmed());
        }
        SessionUpdate::PeerJoined { username, .. } => {
            println!("{}", format!("* {username} joined").bright_blue());
        }
        SessionUpdate::PeerLeft { participant_id } => {
            println!("{}", format!("* {} left", describe_peer(session, participant_id)).bright_blue());
        }
        SessionUpdate::Disconnected => {
            eprintln!("{}", "  hub connection lost; continuing locally".bright_red());
        }
        _ => {}
    }
}

fn print_document(session: &SyncSession) {
    let doc = session.document();
    match doc.active() {
        Some(snap) => {
            println!("{} {}", "File".bright_yellow(), snap.file_id.bright_white());
            println!("{}", snap.content);
        }
        None => println!("{}", "No file open. Use /open <file>.".dimmed()),
    }
    for (id, cursor) in doc.cursors() {
        let at = cursor.offset.map(|o| o.to_string()).unwrap_or_else(|| "?".into());
        let file = cursor.file_id.as_deref().unwrap_or("?");
        println!("  {} {}:{}", describe_peer(session, id).bright_cyan(), file, at);
    }
}

fn print_help() {
    println!("{}", "Commands".bright_yellow());
    println!("  <text>          send a chat message (start with @ai to ask the assistant)");
    println!("  /open <file>    make <file> the active document");
    println!("  /edit <text>    replace the active document with <text>");
    println!("  /show           print the active document and peer cursors");
    println!("  /quit           leave the room");
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

fn build_gateway(config: &SyncConfig) -> Arc<dyn CompletionGateway> {
    match HttpGateway::from_config(&config.assistant) {
        Ok(gw) => Arc::new(gw),
        Err(e) => {
            eprintln!("{}", format!("  {e}; {} commands will fail", config.assistant.trigger).bright_red());
            Arc::new(UnavailableGateway::new(e.to_string()))
        }
    }
}

/// Returns false when the user asked to leave.
fn handle_input(session: &mut SyncSession, input: Input) -> bool {
    match input {
        Input::Blank => {}
        Input::Chat(text) => match session.submit_message(&text) {
            Ok(()) => {
                if let Some(indicator) = session.router().thinking_indicator() {
                    println!("{}", indicator.bright_magenta().dimmed());
                }
            }
            Err(SyncError::Busy) => {
                println!("{}", session.router().placeholder().bright_yellow());
            }
            Err(e) => eprintln!("{}", e.to_string().bright_red()),
        },
        Input::Open(file_id) => {
            session.open_file(DocumentSnapshot::new(file_id.clone(), ""));
            print_document(session);
        }
        Input::Edit(content) => {
            let Some(file_id) = session.document().active_file_id().map(str::to_string) else {
                println!("{}", "No file open. Use /open <file>.".dimmed());
                return true;
            };
            let cursor = content.chars().count();
            if let Err(e) = session.apply_local_edit(&file_id, &content, cursor) {
                eprintln!("{}", e.to_string().bright_red());
            }
        }
        Input::Show => print_document(session),
        Input::Help => print_help(),
        Input::Quit => return false,
        Input::Unknown(cmd) => println!("{}", format!("Unknown command: {cmd} (try /help)").bright_yellow()),
    }
    true
}

async fn run_join(config: SyncConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "{} {} {} {}",
        "Room".bright_yellow(),
        config.room.bright_white(),
        "as".bright_yellow(),
        config.username.bright_white()
    );
    print_help();

    let gateway = build_gateway(&config);
    let mut session = SyncSession::connect(&config, gateway).await;
    let mut printed = 0usize;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_input(&mut session, parse_input(&line)) {
                    break;
                }
                flush_transcript(&session, &mut printed);
            }
            update = session.tick(), if session.has_pending_work() => {
                if let Some(update) = update {
                    render_update(&session, &update);
                }
                flush_transcript(&session, &mut printed);
            }
        }
    }

    session.shutdown();
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("roomsync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let mut config = args.load_config()?;

    match args.command {
        Command::Serve { bind } => hub::serve(&bind).await?,
        Command::Join(join) => {
            join.apply(&mut config);
            run_join(config).await?;
        }
    }
    Ok(())
}
