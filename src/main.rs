//! Konsolen-Runner: liest Befehle von stdin und zeigt Snapshots an
//!
//! Befehle: connect, disconnect, number <n>, dial [n], answer, hangup,
//! mute, unmute, dismiss, log, quit

use anyhow::Context;
use callsession::{
    init_tracing, CallSessionController, CallSnapshot, Collaborators, CoordinatorConfig, EnvToken,
    UserIntent,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

/// Eine Eingabezeile
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Intent(UserIntent),
    ShowLog,
    Help,
}

fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    let word = parts.next()?;
    let arg = parts.next().map(str::to_string);

    let command = match word {
        "connect" => Command::Intent(UserIntent::ConnectSignaling),
        "disconnect" => Command::Intent(UserIntent::DisconnectSignaling),
        "number" => Command::Intent(UserIntent::SetDialNumber(arg.unwrap_or_default())),
        "dial" => Command::Intent(UserIntent::Dial(arg)),
        "answer" => Command::Intent(UserIntent::Answer),
        "hangup" => Command::Intent(UserIntent::Hangup),
        "mute" => Command::Intent(UserIntent::SetMuted(true)),
        "unmute" => Command::Intent(UserIntent::SetMuted(false)),
        "dismiss" => Command::Intent(UserIntent::Dismiss),
        "quit" | "exit" => Command::Intent(UserIntent::Quit),
        "log" => Command::ShowLog,
        _ => Command::Help,
    };
    Some(command)
}

fn print_snapshot(snapshot: &CallSnapshot) {
    let mut line = format!("[{:?}] {}", snapshot.connection, snapshot.call_state);
    if let Some(number) = &snapshot.incoming_number {
        line.push_str(&format!(" from {}", number));
    }
    if !snapshot.status_message.is_empty() {
        line.push_str(&format!(" - {}", snapshot.status_message));
    }
    println!("{}", line);
}

fn print_log(snapshot: &CallSnapshot) {
    for entry in &snapshot.event_log {
        println!("  {} {}", entry.timestamp_ms, entry.message);
    }
}

/// Gibt jeden neuen Snapshot aus, bis der Controller stoppt
async fn watch_snapshots(mut snapshots: watch::Receiver<CallSnapshot>) {
    let mut last = (snapshots.borrow().call_state, String::new());
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        let current = (snapshot.call_state, snapshot.status_message.clone());
        if current != last {
            print_snapshot(&snapshot);
            last = current;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = CoordinatorConfig::from_env().context("invalid configuration")?;
    tracing::info!("Signaling server: {}", config.signaling_url);

    let collaborators = Collaborators::production(&config, Arc::new(EnvToken::default()));
    let controller = CallSessionController::new(config, collaborators);
    let snapshots = controller.subscribe();

    let (intents, intent_rx) = mpsc::channel(32);
    let controller_task = tokio::spawn(controller.run(intent_rx));
    tokio::spawn(watch_snapshots(snapshots.clone()));

    println!("Commands: connect, disconnect, number <n>, dial [n], answer, hangup, mute, unmute, dismiss, log, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        match parse_command(&line) {
            Some(Command::Intent(intent)) => {
                let quit = intent == UserIntent::Quit;
                if intents.send(intent).await.is_err() || quit {
                    break;
                }
            }
            Some(Command::ShowLog) => print_log(&snapshots.borrow()),
            Some(Command::Help) => println!("Unknown command: {}", line.trim()),
            None => {}
        }
    }

    // stdin zu oder quit: Controller sauber beenden
    let _ = intents.send(UserIntent::Quit).await;
    drop(intents);
    controller_task.await.context("controller task panicked")?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
