//! autoreply main binary.
//!
//! Runs the WhatsApp auto-reply engine behind a small operator HTTP surface.

mod bot_runtime;
mod config;
mod engine;
mod init;
mod routes;
mod server;
mod settings;
mod store;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "autoreply", version, about = "WhatsApp auto-reply engine")]
struct Cli {
    /// Config file (default: ~/.autoreply/config.toml).
    #[arg(long, global = true, env = "AUTOREPLY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP control surface and the engine (default).
    Serve,
    /// Run the engine in the foreground until ctrl-c, without the HTTP surface.
    Run,
    /// Initialize ~/.autoreply with a config template (idempotent).
    Init,
    /// Check the transport connection and summarize stored conversations.
    Status,
    /// Show or change live bot settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Print the stored messages of one conversation.
    History {
        conversation: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// One-shot send to a WhatsApp number through the configured transport.
    Send { number: String, message: String },
}

#[derive(Debug, Subcommand)]
enum SettingsAction {
    Show,
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let config_path = cli.config;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(config_path).await,
        Command::Run => server::run_foreground(config_path).await,
        Command::Init => {
            let report = init::initialize_default().await?;
            if report.created.is_empty() {
                println!(
                    "autoreply init: already initialized at {}",
                    report.root.display()
                );
            } else {
                println!("autoreply init: initialized {}", report.root.display());
                for path in &report.created {
                    println!("created {}", path.display());
                }
                for path in &report.skipped {
                    println!("kept existing {}", path.display());
                }
            }
            println!(
                "next: fill in the [bot] section of {}/config.toml or run `autoreply settings set`",
                report.root.display()
            );
            Ok(())
        }
        Command::Status => server::status(config_path).await,
        Command::Settings { action } => match action {
            SettingsAction::Show => server::settings_show(config_path).await,
            SettingsAction::Set { key, value } => {
                server::settings_set(config_path, &key, &value).await
            }
        },
        Command::History {
            conversation,
            limit,
        } => server::history(config_path, &conversation, limit).await,
        Command::Send { number, message } => {
            server::send_one_shot(config_path, &number, &message).await
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,autoreply=debug,ar_app=debug,ar_channels=debug,ar_llm=debug,tower_http=info",
        ),
    };
    let log_format = std::env::var("AUTOREPLY_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported AUTOREPLY_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

pub(crate) fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
