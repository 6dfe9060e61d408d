//! agent-monitor-hook: CLI hook handler for agent-monitor session tracking.
//!
//! Called by the agent CLI's lifecycle hooks to forward events to the
//! daemon, and by operators to inspect or reset what the daemon holds.
//!
//! ## Subcommands
//!
//! - `handle`: Main hook handler, reads JSON from stdin
//! - `sessions`: Print the current session snapshot
//! - `watch`: Print a snapshot every time it changes
//! - `dismiss`: Remove one session
//! - `clear`: Remove every session

mod daemon_client;
mod error;
mod handle;
mod logging;

use agent_monitor_protocol::SessionView;
use clap::{Parser, Subcommand};

use error::HookError;

#[derive(Parser)]
#[command(name = "agent-monitor-hook")]
#[command(about = "Agent CLI session state tracker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle a hook event (reads JSON from stdin)
    Handle,

    /// Print the current session snapshot as JSON
    Sessions {
        /// One line per session instead of JSON
        #[arg(long)]
        summary: bool,
    },

    /// Print a snapshot line every time session state changes
    Watch {
        /// One line per session instead of JSON
        #[arg(long)]
        summary: bool,
    },

    /// Remove one session from the daemon
    Dismiss {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// Remove every session from the daemon
    Clear,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Handle => {
            if let Err(e) = handle::run() {
                tracing::error!(error = %e, "agent-monitor-hook handle failed");
                std::process::exit(1);
            }
        }
        Commands::Sessions { summary } => {
            exit_on_error(daemon_client::get_sessions().and_then(|sessions| {
                print_snapshot(&sessions, summary)
            }));
        }
        Commands::Watch { summary } => {
            exit_on_error(daemon_client::watch_sessions(|sessions| {
                print_snapshot(&sessions, summary).is_ok()
            }));
        }
        Commands::Dismiss { session_id } => {
            exit_on_error(daemon_client::dismiss_session(&session_id).map(|dismissed| {
                if dismissed {
                    println!("dismissed {}", session_id);
                } else {
                    println!("no session {}", session_id);
                }
            }));
        }
        Commands::Clear => {
            exit_on_error(daemon_client::clear_sessions().map(|cleared| {
                println!("cleared {} session(s)", cleared);
            }));
        }
    }
}

fn exit_on_error(result: Result<(), HookError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "agent-monitor-hook command failed");
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn print_snapshot(sessions: &[SessionView], summary: bool) -> Result<(), HookError> {
    if !summary {
        println!("{}", serde_json::to_string(sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("(no sessions)");
    }
    for session in sessions {
        println!("{}", summary_line(session));
    }
    println!();
    Ok(())
}

fn summary_line(session: &SessionView) -> String {
    let mut line = format!("{:<18} {}", session.status.as_str(), session.title());
    let agent_types = session.active_agent_types();
    if !agent_types.is_empty() {
        line.push_str(" · ");
        line.push_str(&agent_types.join(" · "));
    }
    line.push_str(&format!(
        "  [{}]",
        session.terminal_identifier.as_deref().unwrap_or("unknown")
    ));
    line
}
