//! TaskBridge CLI - drive the task engine from a terminal
//!
//! Plain lines are user input; lines starting with `/` are commands for
//! answering interactions and managing the session.

mod console_transport;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use console::style;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use console_transport::ConsoleTransport;
use taskbridge_core::{ConfigManager, Engine, Error, JsonSessionRepository, PlanDecision, ProcessAgent, TaskState};

#[derive(Parser)]
#[command(name = "taskbridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a coding agent with human-in-the-loop approvals", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// User id to act as
    #[arg(short, long, default_value_t = 1)]
    user: i64,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive session (default)
    Chat,

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone())?,
        None => ConfigManager::new()?,
    };

    // Logs go to stderr so they do not interleave with rendered output
    let default_filter = if cli.verbose {
        "info,taskbridge_core=debug".to_string()
    } else {
        config_manager.config().general.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .init();
    info!(path = %config_manager.path().display(), "Configuration loaded");

    match cli.command {
        Some(Commands::Config) => show_config(&config_manager)?,
        Some(Commands::Chat) | None => run_chat(&config_manager, cli.user).await?,
    }

    Ok(())
}

fn show_config(config_manager: &ConfigManager) -> anyhow::Result<()> {
    println!("{} {}", style("Config file:").bold(), config_manager.path().display());
    println!();
    println!("{}", toml::to_string_pretty(config_manager.config())?);
    Ok(())
}

async fn run_chat(config_manager: &ConfigManager, user_id: i64) -> anyhow::Result<()> {
    let config = config_manager.config();
    let transport = Arc::new(ConsoleTransport::new());
    let agent = Arc::new(ProcessAgent::from_config(&config.agent));
    let repository = Arc::new(JsonSessionRepository::new(config.session.storage_dir()));
    let engine = Engine::with_repository(config, transport, agent, repository);

    let mut reports = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(report) = reports.recv().await {
            let secs = report.elapsed.as_secs_f32();
            match report.state {
                TaskState::Completed => println!("{}", style(format!("✓ done in {:.1}s", secs)).green()),
                TaskState::Failed => println!(
                    "{}",
                    style(format!("✗ failed after {:.1}s: {}", secs, report.error.unwrap_or_default())).red()
                ),
                TaskState::Cancelled => println!("{}", style("⏹ cancelled").yellow()),
                _ => {}
            }
        }
    });

    let session = engine.session(user_id).await;
    println!("{}", style("TaskBridge").bold().cyan());
    println!(
        "{} {}",
        style("Working directory:").dim(),
        session.working_directory.display()
    );
    println!("{}", style("Type /help for commands, /quit to exit.").dim());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match handle_line(&engine, user_id, line).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(e) => println!("{}", style(format_error(&e)).red()),
        }
    }

    let cancelled = engine.shutdown().await;
    if cancelled > 0 {
        println!("{}", style(format!("Cancelled {} running turn(s)", cancelled)).dim());
    }
    Ok(())
}

enum Flow {
    Continue,
    Quit,
}

async fn handle_line(engine: &Engine, user_id: i64, line: &str) -> taskbridge_core::Result<Flow> {
    let Some(command) = line.strip_prefix('/') else {
        engine.submit_input(user_id, line)?;
        return Ok(Flow::Continue);
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let note = (!rest.is_empty()).then(|| rest.to_string());

    match name {
        "approve" => engine.respond_permission(user_id, true, note)?,
        "deny" => engine.respond_permission(user_id, false, note)?,
        "answer" => engine.respond_question(user_id, rest)?,
        "plan" => {
            let (verb, feedback) = match rest.split_once(char::is_whitespace) {
                Some((verb, feedback)) => (verb, Some(feedback.trim().to_string())),
                None => (rest, None),
            };
            let decision = match verb {
                "approve" => PlanDecision::Approved,
                "reject" => PlanDecision::Rejected { feedback },
                _ => {
                    println!("Usage: /plan approve | /plan reject [feedback]");
                    return Ok(Flow::Continue);
                }
            };
            engine.respond_plan(user_id, decision)?;
        }
        "go" => {
            if !engine.flush_input(user_id).await {
                println!("{}", style("Nothing queued").dim());
            }
        }
        "cancel" => {
            if !engine.cancel(user_id).await {
                println!("{}", style("Nothing to cancel").dim());
            }
        }
        "status" => {
            let status = engine.status(user_id);
            let session = engine.session(user_id).await;
            println!("State:      {}", status.state);
            if status.state != TaskState::Idle {
                println!("Elapsed:    {:.1}s", status.elapsed.as_secs_f32());
            }
            if let Some(kind) = status.pending {
                println!("Waiting on: {}", kind);
            }
            println!("Directory:  {}", session.working_directory.display());
            println!("Auto:       {}", on_off(session.flags.auto_approve));
            println!("Brief:      {}", on_off(session.flags.brief_output));
        }
        "cd" if rest.is_empty() => println!("Usage: /cd <dir>"),
        "cd" => {
            let session = engine.set_working_directory(user_id, rest).await?;
            println!("Working directory: {}", session.working_directory.display());
        }
        "new" => {
            engine.new_session(user_id).await?;
            println!("Started a new conversation");
        }
        "auto" => match parse_switch(rest) {
            Some(enabled) => {
                engine.set_auto_approve(user_id, enabled).await?;
                println!("Auto-approve {}", on_off(enabled));
            }
            None => println!("Usage: /auto on|off"),
        },
        "brief" => match parse_switch(rest) {
            Some(enabled) => {
                engine.set_brief_output(user_id, enabled).await?;
                println!("Brief output {}", on_off(enabled));
            }
            None => println!("Usage: /brief on|off"),
        },
        "help" => print_help(),
        "quit" | "exit" => return Ok(Flow::Quit),
        other => println!("Unknown command: /{} (try /help)", other),
    }
    Ok(Flow::Continue)
}

fn parse_switch(value: &str) -> Option<bool> {
    match value {
        "on" | "true" | "yes" => Some(true),
        "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

fn format_error(error: &Error) -> String {
    match error {
        Error::Busy { .. } => "A turn is still running; wait for it or /cancel".to_string(),
        Error::NoPendingRequest { .. } => "Nothing is waiting for an answer".to_string(),
        other => format!("Error: {}", other),
    }
}

fn print_help() {
    println!("{}", style("Commands:").bold());
    println!("  /approve [note]          Allow the pending tool call");
    println!("  /deny [note]             Refuse it, optionally saying why");
    println!("  /answer <text>           Answer the pending question");
    println!("  /plan approve            Accept the proposed plan");
    println!("  /plan reject [feedback]  Send the plan back");
    println!("  /go                      Start queued input without waiting");
    println!("  /cancel                  Stop the running turn");
    println!("  /status                  Show turn and session state");
    println!("  /cd <dir>                Change working directory");
    println!("  /new                     Forget the conversation");
    println!("  /auto on|off             Approve tool calls automatically");
    println!("  /brief on|off            Hide tool progress lines");
    println!("  /quit                    Exit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_switch() {
        assert_eq!(parse_switch("on"), Some(true));
        assert_eq!(parse_switch("off"), Some(false));
        assert_eq!(parse_switch("maybe"), None);
    }

    #[test]
    fn test_cli_parses_user_and_config() {
        let cli = Cli::parse_from(["taskbridge", "--user", "42", "--config", "/tmp/tb.toml"]);
        assert_eq!(cli.user, 42);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/tb.toml")));
        assert!(cli.command.is_none());
    }
}
