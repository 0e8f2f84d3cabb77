//! Operator console.
//!
//! Reads one command per line and writes plain status lines back. Input lines
//! are read on their own OS thread and handed over a channel, so a read that
//! never completes cannot hold up runtime shutdown. The binary wires it to
//! stdin/stdout; tests drive it over in-memory readers.

use battle_server::BattleServer;
use std::fmt::Write as _;
use std::io::BufRead;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const HELP: &str = "\
commands:
  dbmod <name>     switch the backing store
  load <path>      load a plugin library
  unload <name>    unload a plugin
  plugins          list loaded plugins
  connections      list live connections
  battles          list running battles
  stats            server counters
  help             this text
  quit             stop the server";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    DbMod(String),
    Load(String),
    Unload(String),
    Plugins,
    Connections,
    Battles,
    Stats,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let argument = |usage: &str| {
            if rest.is_empty() {
                Err(format!("usage: {usage}"))
            } else {
                Ok(rest.to_string())
            }
        };

        match word.to_ascii_lowercase().as_str() {
            "dbmod" => argument("dbmod <name>").map(ConsoleCommand::DbMod),
            "load" => argument("load <path>").map(ConsoleCommand::Load),
            "unload" => argument("unload <name>").map(ConsoleCommand::Unload),
            "plugins" => Ok(ConsoleCommand::Plugins),
            "connections" => Ok(ConsoleCommand::Connections),
            "battles" => Ok(ConsoleCommand::Battles),
            "stats" => Ok(ConsoleCommand::Stats),
            "help" | "?" => Ok(ConsoleCommand::Help),
            "quit" | "exit" => Ok(ConsoleCommand::Quit),
            other => Err(format!("unknown command: {other} (try help)")),
        }
    }
}

/// Run `command` against `server` and render the reply.
pub async fn execute(server: &BattleServer, command: ConsoleCommand) -> String {
    match command {
        ConsoleCommand::DbMod(name) => match server.change_backing_store(&name).await {
            Ok(previous) => format!("backing store: {} -> {}", previous, name.trim()),
            Err(e) => format!("error: {e}"),
        },
        ConsoleCommand::Load(path) => match server.load_plugin(&path).await {
            Ok(name) => format!("loaded {name}"),
            Err(e) => format!("error: {e}"),
        },
        ConsoleCommand::Unload(name) => match server.unload_plugin(&name).await {
            Ok(()) => format!("unloaded {name}"),
            Err(e) => format!("error: {e}"),
        },
        ConsoleCommand::Plugins => {
            let plugins = server.plugins().await;
            let mut out = format!("{} plugin(s)", plugins.len());
            for p in plugins {
                let _ = write!(
                    out,
                    "\n  {} v{} ({} events, {} failed)",
                    p.name, p.version, p.events_delivered, p.events_failed
                );
            }
            out
        }
        ConsoleCommand::Connections => {
            let connections = server.connections().await;
            let mut out = format!("{} connection(s)", connections.len());
            for conn in connections {
                let battle = conn
                    .battle()
                    .await
                    .map(|b| format!(" in {b}"))
                    .unwrap_or_default();
                let _ = write!(
                    out,
                    "\n  #{} {} up {}s{}",
                    conn.id(),
                    conn.remote_addr(),
                    conn.connected_at()
                        .elapsed()
                        .map(|d| d.as_secs())
                        .unwrap_or(0),
                    battle
                );
            }
            out
        }
        ConsoleCommand::Battles => {
            let battles = server.battles().await;
            let mut out = format!("{} battle(s)", battles.len());
            for b in battles {
                let _ = write!(
                    out,
                    "\n  {} [{}] {} vs {} ({}, {}s)",
                    b.battle_id,
                    b.tier,
                    b.players[0],
                    b.players[1],
                    b.state.label(),
                    b.elapsed.as_secs()
                );
            }
            out
        }
        ConsoleCommand::Stats => {
            let stats = server.stats().await;
            format!(
                "connections {} (accepted {}, rejected {}) | battles {} running, {} completed, {} aborted | plugins {} | store {}",
                stats.connections,
                stats.connections_accepted,
                stats.connections_rejected,
                stats.battles_running,
                stats.battles_completed,
                stats.battles_aborted,
                stats.plugins,
                server.backing_store().await
            )
        }
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => "shutting down".to_string(),
    }
}

/// Read lines from `input` on a dedicated thread.
///
/// The channel closes at end of input, on a read error, or once the
/// receiver is dropped and another line arrives.
pub fn spawn_line_reader<R>(input: R) -> mpsc::Receiver<String>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    let spawned = std::thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            for line in input.lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Console input failed: {}", e);
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Could not start console input thread: {}", e);
    }
    rx
}

/// Serve commands from `lines` until `quit` or the channel closes.
///
/// Returns true if the operator asked to quit.
pub async fn run<W>(
    server: Arc<BattleServer>,
    mut lines: mpsc::Receiver<String>,
    mut output: W,
) -> std::io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        debug!("Console command: {}", line.trim());

        let (reply, quit) = match line.parse::<ConsoleCommand>() {
            Ok(command) => {
                let quit = command == ConsoleCommand::Quit;
                (execute(&server, command).await, quit)
            }
            Err(e) => (e, false),
        };

        output.write_all(reply.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;

        if quit {
            info!("🛑 Quit requested from console");
            return Ok(true);
        }
    }
    Ok(false)
}
