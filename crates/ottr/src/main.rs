use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ottr::bridge::SessionManager;
use ottr::chat::{ChatPort, InboundMessage, TerminalChatPort};
use ottr::config::{self, AppConfig, SandboxMode};
use ottr::sandbox::{ContainerSandbox, HostSandbox, SandboxLifecycle};

const APP_NAME: &str = "ottr";

#[derive(Debug, Parser)]
#[command(
    name = APP_NAME,
    version,
    about = "Chat-thread bridge for sandboxed coding agent sessions"
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonArgs {
    /// Path to the config file (default: ~/.config/ottr/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Enable trace logging
    #[arg(long, global = true)]
    trace: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the bridge with a terminal chat port (development)
    Serve(ServeCommand),
    /// Validate configuration and environment
    Check(CheckCommand),
    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Args)]
struct ServeCommand {
    /// Conversation key terminal input is routed to
    #[arg(long, default_value = "terminal")]
    conversation: String,
}

#[derive(Debug, Args)]
struct CheckCommand {
    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print: bool,
}

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
            Ok(())
        }
        Command::Serve(cmd) => {
            let cfg = load_config(&cli.common)?;
            init_logging(&cli.common, &cfg);
            async_serve(cfg, cmd)
        }
        Command::Check(cmd) => {
            let cfg = load_config(&cli.common)?;
            init_logging(&cli.common, &cfg);
            async_check(cfg, cmd)
        }
    }
}

fn load_config(common: &CommonArgs) -> Result<AppConfig> {
    let path = common.config.as_deref().map(config::expand_path);
    AppConfig::load(path.as_deref())
}

fn init_logging(common: &CommonArgs, cfg: &AppConfig) {
    let level = effective_log_level(common, cfg);
    let level_str = match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ottr={level_str}")));

    if common.json || cfg.log.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(io::stderr().is_terminal()))
            .try_init()
            .ok();
    }

    // Also init env_logger for compatibility with log crate users
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(level);
    builder.try_init().ok();
}

fn effective_log_level(common: &CommonArgs, cfg: &AppConfig) -> LevelFilter {
    if common.trace {
        LevelFilter::Trace
    } else if common.debug {
        LevelFilter::Debug
    } else {
        match common.verbose {
            0 => cfg.log.level.parse().unwrap_or(LevelFilter::Info),
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

async fn build_sandbox(cfg: &AppConfig) -> Result<Arc<dyn SandboxLifecycle>> {
    match cfg.sandbox.mode {
        SandboxMode::Host => Ok(Arc::new(HostSandbox)),
        SandboxMode::Container => {
            let sandbox = ContainerSandbox::detect(
                cfg.sandbox.runtime,
                &cfg.sandbox.container,
                &cfg.sandbox.image,
            )
            .await
            .context("setting up container sandbox")?;
            Ok(Arc::new(sandbox))
        }
    }
}

#[tokio::main]
async fn async_serve(cfg: AppConfig, cmd: ServeCommand) -> Result<()> {
    let manager_config = cfg.manager_config()?;
    let sandbox = build_sandbox(&cfg).await?;
    let chat = Arc::new(TerminalChatPort::new());
    let chat_port: Arc<dyn ChatPort> = chat.clone();
    let manager = SessionManager::new(manager_config, chat_port, sandbox);

    info!("bridge ready; type a message, /restart to reset, /quit to exit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line.trim().to_string(),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdin error: {e}");
                        break;
                    }
                };
                if line.is_empty() {
                    continue;
                }
                // A pending choice prompt claims the line first.
                if chat.offer_line(&line).await {
                    continue;
                }
                match line.as_str() {
                    "/quit" | "/exit" => break,
                    "/restart" => {
                        manager.remove_conversation(&cmd.conversation).await;
                        println!("conversation reset");
                    }
                    "/status" => {
                        let conversations = manager.list_conversations().await;
                        if conversations.is_empty() {
                            println!("no active conversations");
                        }
                        for info in conversations {
                            println!(
                                "{}: {}{}",
                                info.conversation_key,
                                info.state,
                                if info.busy { " (turn in flight)" } else { "" }
                            );
                        }
                    }
                    _ => {
                        if let Err(e) = manager
                            .handle_message(InboundMessage::new(&cmd.conversation, line))
                            .await
                        {
                            warn!("failed to handle message: {e:#}");
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn async_check(cfg: AppConfig, cmd: CheckCommand) -> Result<()> {
    if cmd.print {
        print!("{}", cfg.to_toml()?);
        return Ok(());
    }

    // Validates the overflow patterns and agent command as a side effect.
    let manager_config = cfg.manager_config()?;
    debug!("configuration parsed");

    match cfg.sandbox.mode {
        SandboxMode::Host => {
            match find_in_path(&cfg.agent.binary) {
                Some(path) => println!("agent binary: {} ({})", cfg.agent.binary, path.display()),
                None => println!("agent binary: {} (not found in PATH)", cfg.agent.binary),
            }
            println!("sandbox: host (no isolation)");
        }
        SandboxMode::Container => {
            // The agent binary lives inside the container; only the runtime
            // is checked here.
            let sandbox = ContainerSandbox::detect(
                cfg.sandbox.runtime,
                &cfg.sandbox.container,
                &cfg.sandbox.image,
            )
            .await?;
            println!("agent binary: {} (inside container)", cfg.agent.binary);
            println!(
                "sandbox: container '{}' via {}",
                sandbox.container_name(),
                sandbox.runtime()
            );
        }
    }
    println!("agent args: {}", manager_config.agent.args.join(" "));
    println!(
        "overflow patterns: {}",
        cfg.bridge.overflow_patterns.len()
    );
    println!(
        "question debounce: {}ms, choice timeout: {}s",
        cfg.bridge.question_debounce_ms, cfg.bridge.choice_timeout_secs
    );
    Ok(())
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
