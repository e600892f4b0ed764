//! Line-oriented chat front ends for the terminal.
//!
//! `chat` runs the customer widget, `console` the admin console. Both read
//! stdin lines and print inbound messages as they arrive.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::api::client::ShopClient;
use crate::api::format_line;
use crate::config::Config;
use crate::models::{ParticipantId, Role};
use crate::session::{AdminConsole, ConsoleEvent, CustomerSession, Delivered};
use crate::socket::ConnectionManager;
use crate::store::Merge;

/// Open the shared connection for this process.
fn open_connection(config: &Config) -> Result<ConnectionManager> {
    let conn = ConnectionManager::new(config.chat.outbound_queue_limit);
    let url = config.socket_url()?;
    conn.connect_websocket(&url);
    Ok(conn)
}

/// Customer support chat.
pub async fn run_customer_chat() -> Result<()> {
    let config = Config::load()?;
    let session = crate::auth::require_session(&config)?;
    if session.chat_role() == Role::Admin {
        anyhow::bail!("Stored session is an admin session. Use 'console' instead.");
    }

    let client = Arc::new(ShopClient::new(&config)?);
    let conn = open_connection(&config)?;
    let mut chat = CustomerSession::new(
        conn.clone(),
        client,
        session.participant_id(),
        &config.chat,
    );

    chat.open().await;
    if let Some(notice) = chat.notice() {
        println!("! {}", notice);
    }
    for msg in chat.messages() {
        println!("{}", format_line(msg));
    }
    println!("Connected as {}. Type a message and press Enter (Ctrl-C to quit).", chat.participant());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if let Err(e) = chat.send(&line) {
                    println!("! {}", e);
                }
            }
            update = chat.next_update() => {
                if let Some(Delivered { merge: Merge::Appended, message }) = update {
                    println!("{}", format_line(&message));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    chat.close();
    conn.disconnect();
    Ok(())
}

/// Admin console commands typed at the prompt.
#[derive(Debug, PartialEq)]
enum ConsoleCommand<'a> {
    Select(&'a str),
    List,
    Roster,
    Help,
    Reply(&'a str),
}

fn parse_command(line: &str) -> ConsoleCommand<'_> {
    let trimmed = line.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some(("/select", id)) => ConsoleCommand::Select(id.trim()),
        _ => match trimmed {
            "/list" => ConsoleCommand::List,
            "/roster" => ConsoleCommand::Roster,
            "/help" => ConsoleCommand::Help,
            _ => ConsoleCommand::Reply(line),
        },
    }
}

const CONSOLE_HELP: &str = "Commands: /select <customer-id>, /list, /roster, /help. Anything else is sent as a reply.";

/// Admin support console.
pub async fn run_admin_console() -> Result<()> {
    let config = Config::load()?;
    let session = crate::auth::require_session(&config)?;
    if session.chat_role() != Role::Admin {
        anyhow::bail!("Stored session is a customer session. Use 'chat' instead.");
    }

    let client = Arc::new(ShopClient::new(&config)?);
    let conn = open_connection(&config)?;
    let mut console = AdminConsole::new(conn.clone(), client, &config.chat);

    console.open().await;
    if let Some(notice) = console.notice() {
        println!("! {}", notice);
    }
    print_roster(&console);
    println!("{}", CONSOLE_HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match parse_command(&line) {
                    ConsoleCommand::Select(id) if !id.is_empty() => {
                        console.select(ParticipantId::new(id));
                        println!("Loading conversation with {}...", id);
                    }
                    ConsoleCommand::Select(_) => println!("Usage: /select <customer-id>"),
                    ConsoleCommand::List => print_view(&console),
                    ConsoleCommand::Roster => {
                        console.refresh_roster().await;
                        print_roster(&console);
                    }
                    ConsoleCommand::Help => println!("{}", CONSOLE_HELP),
                    ConsoleCommand::Reply(body) => {
                        if let Err(e) = console.send(body).await {
                            println!("! {}", e);
                        }
                    }
                }
            }
            event = console.next_update() => {
                match event {
                    Some(ConsoleEvent::HistoryLoaded(_)) => print_view(&console),
                    Some(ConsoleEvent::HistoryFailed(_)) => {
                        if let Some(notice) = console.notice() {
                            println!("! {}", notice);
                        }
                    }
                    Some(ConsoleEvent::Message(Delivered { merge: Merge::Appended, message })) => {
                        if console.active() == Some(&message.participant_id) {
                            println!("{}", format_line(&message));
                        } else {
                            println!(
                                "* new message from {} ({} unread)",
                                message.participant_id,
                                console.unread(&message.participant_id)
                            );
                        }
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    console.close();
    conn.disconnect();
    Ok(())
}

fn print_roster(console: &AdminConsole<ShopClient>) {
    println!("\nCustomers:");
    println!("{:-<60}", "");
    if console.roster().is_empty() {
        println!("  (no customers found)");
    }
    for entry in console.roster() {
        let unread = console.unread(&entry.id);
        if unread > 0 {
            println!("{} [{} unread]", entry.label(), unread);
        } else {
            println!("{}", entry.label());
        }
        println!("  ID: {}", entry.id);
    }
}

fn print_view(console: &AdminConsole<ShopClient>) {
    match console.active() {
        Some(active) => println!("--- {} ---", active),
        None => {
            println!("No conversation selected.");
            for participant in console.conversations() {
                println!("  {} ({} unread)", participant, console.unread(participant));
            }
            return;
        }
    }
    if console.is_loading() {
        println!("(loading history...)");
    }
    let view = console.view();
    if view.is_empty() {
        println!("(no messages)");
    }
    for msg in view {
        println!("{}", format_line(msg));
    }
}
