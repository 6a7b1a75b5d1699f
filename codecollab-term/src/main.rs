//! codecollab-term: join a shared code session from the terminal.
//!
//! Creates a session (`--new`) or joins an existing one by id. Fetches the
//! session snapshot over HTTP, then keeps the document in step
//! with every other participant over the session WebSocket. Each input line
//! is appended to the document; `:`-prefixed lines are commands.

mod input;
mod snapshot;

use anyhow::Context;
use clap::Parser;
use codecollab_session::{
    invite_link, CollabSession, ConnectionStatus, Language, SessionConfig, SessionEvent,
};
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, BufReader};

use input::Input;

#[derive(Debug, Parser)]
#[command(name = "codecollab-term", version, about = "Join a shared code session")]
struct Args {
    /// Session identifier, as found in the invite link
    #[arg(required_unless_present = "new", conflicts_with = "new")]
    space_id: Option<String>,

    /// Create a new session and join it
    #[arg(long)]
    new: bool,

    /// Language of the new session
    #[arg(long, requires = "new", default_value = "python", value_parser = parse_language)]
    language: Language,

    /// Origin used for the printed invite link (defaults to the API base)
    #[arg(long)]
    origin: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let config = SessionConfig::from_env().context("loading configuration")?;
    let http = reqwest::Client::new();
    let space_id = match args.space_id {
        Some(space_id) => space_id,
        None => snapshot::create(&http, &config, args.language).await?,
    };
    let document = snapshot::fetch(&http, &config, &space_id).await?;

    let mut session = CollabSession::new(&config, &space_id, document)?;
    let origin = args.origin.as_deref().unwrap_or(&config.api_base);
    println!("Invite link: {}", invite_link(origin, &space_id)?);
    println!("Commands: :lang <tag>, :show, :clear, :quit");

    let mut events = session
        .take_event_rx()
        .context("session event stream already taken")?;
    let mut status = session.subscribe_status();
    info!("joining {} at {}", session.space_id(), session.endpoint());
    session.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_label = String::new();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if !handle_line(&session, &line) {
                    break;
                }
            }
            Some(event) = events.recv() => print_event(&event),
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let label = status_label(&status.borrow_and_update());
                if label != last_label {
                    println!("[{label}]");
                    last_label = label;
                }
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

/// Apply one input line. Returns `false` to leave.
fn handle_line(session: &CollabSession, line: &str) -> bool {
    let input = match input::parse(line) {
        Ok(input) => input,
        Err(e) => {
            eprintln!("{e}; supported: {}", input::language_tags());
            return true;
        }
    };

    match input {
        Input::Quit => return false,
        Input::Show => {
            let document = session.document();
            println!("── {} ──", document.language.label());
            print!("{}", document.content);
        }
        Input::Language(language) => session.emit_language_change(language),
        Input::Clear => send_edit(session, String::new()),
        Input::Append(text) => {
            let content = input::append(&session.document().content, &text);
            send_edit(session, content);
        }
    }
    true
}

fn send_edit(session: &CollabSession, content: String) {
    if !session.emit_edit(content) {
        debug!("edit swallowed as the reaction to a remote update");
    }
}

fn parse_language(tag: &str) -> Result<Language, String> {
    tag.parse()
        .map_err(|e| format!("{e}; supported: {}", input::language_tags()))
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Joined {
            participant,
            document,
            presence,
        } => println!(
            "Joined as {participant}: {} line(s) of {}, {presence} online",
            document.content.lines().count(),
            document.language.label()
        ),
        SessionEvent::DocumentReplaced(content) => {
            println!("Document updated ({} line(s))", content.lines().count())
        }
        SessionEvent::LanguageChanged(language) => println!("Language: {}", language.label()),
        SessionEvent::PresenceChanged(count) => println!("{count} online"),
    }
}

fn status_label(status: &ConnectionStatus) -> String {
    if let Some(error) = status.terminal_error() {
        format!("Connection lost: {error}")
    } else if status.is_connected() {
        "Connected".to_string()
    } else if status.is_reconnecting() {
        "Reconnecting...".to_string()
    } else {
        "Offline".to_string()
    }
}
