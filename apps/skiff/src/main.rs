use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser};
use tokio::io::{AsyncBufReadExt, BufReader};

use skiff_core::bridge::{Bridge, BridgeEvent, BridgeSettings, ConnectionState, WsConnector};
use skiff_core::config::Config;
use skiff_core::identity::{IdentityResolver, SessionStore};
use skiff_core::telemetry::{self, LogConfig, LogLevel};
use skiff_core::translate::{DisplayRecord, RecordBody, SenderKind};

#[derive(Parser, Debug)]
#[command(
    name = "skiff",
    about = "Bridge a terminal chat session to an OneBot-flavored bot backend",
    version
)]
struct Cli {
    #[arg(long, env = "SKIFF_BOT_ID", help = "Display id the bridge announces as the bot")]
    bot_id: String,

    #[arg(long, env = "SKIFF_BOT_NAME", help = "Display name of the bot")]
    bot_name: String,

    #[arg(long, env = "SKIFF_WS_URL", help = "WebSocket endpoint of the chat backend")]
    ws_url: String,

    #[arg(
        long,
        env = "SKIFF_AUTH_URL",
        help = "Base URL of the auth service (anonymous-session variant)"
    )]
    auth_url: Option<String>,

    #[arg(
        long,
        env = "SKIFF_ADMIN_ID",
        help = "Static admin identifier (simplified variant)"
    )]
    admin_id: Option<String>,

    #[arg(
        long,
        env = "SKIFF_ADMIN_SECRET",
        hide_env_values = true,
        help = "Static admin secret (simplified variant)"
    )]
    admin_secret: Option<String>,

    #[arg(
        long,
        env = "SKIFF_SESSION_FILE",
        value_name = "PATH",
        help = "Override the persisted session file"
    )]
    session_file: Option<PathBuf>,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "SKIFF_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "SKIFF_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    telemetry::init(&LogConfig {
        level: cli.logging.level,
        file: cli.logging.file.clone(),
    })
    .context("failed to initialize logging")?;

    let config = Config::resolve(
        cli.bot_id,
        cli.bot_name,
        cli.ws_url,
        cli.auth_url,
        cli.admin_id,
        cli.admin_secret,
        cli.session_file,
    )?;

    let store = match &config.session_file {
        Some(path) => SessionStore::at(path.clone()),
        None => SessionStore::open_default()?,
    };
    let resolver = IdentityResolver::new(config.auth.clone(), store)?;

    let (bridge, mut events) =
        Bridge::spawn(BridgeSettings::from(&config), resolver, Arc::new(WsConnector));
    bridge.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => render_event(&event),
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !dispatch_line(&bridge, &line) {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    bridge.shutdown().await;
    Ok(())
}

/// Returns false when the REPL should exit.
fn dispatch_line(bridge: &Bridge, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }
    match line.split_whitespace().collect::<Vec<_>>().as_slice() {
        ["/quit"] => return false,
        ["/logout"] => bridge.logout(),
        ["/reconnect"] => bridge.connect(),
        ["/login", account, password] => bridge.login_admin(*account, *password),
        ["/login", ..] => eprintln!("usage: /login <account> <password>"),
        _ if line.starts_with('/') => eprintln!("commands: /login /logout /reconnect /quit"),
        _ => bridge.send_text(line),
    }
    true
}

fn render_event(event: &BridgeEvent) {
    match event {
        BridgeEvent::StateChanged(state) => println!("● {}", format_state(*state)),
        BridgeEvent::Notice(text) => println!("[*] {text}"),
        BridgeEvent::Record(record) => render_record(record),
        BridgeEvent::ForwardDetail(transcript) => {
            for entry in &transcript.entries {
                println!("    {} | {}", entry.sender_name, entry.text);
            }
        }
        BridgeEvent::ReplyPending { .. } => println!("[…] bot is typing"),
        // Staleness already arrives as a notice; resolution needs no output.
        BridgeEvent::ReplyResolved { .. } | BridgeEvent::ReplyStale { .. } => {}
    }
}

fn render_record(record: &DisplayRecord) {
    let who = match record.sender {
        SenderKind::User => "you",
        SenderKind::Robot => "bot",
    };
    match &record.body {
        RecordBody::Text(text) => println!("{who}> {text}"),
        RecordBody::Image(reference) if reference.is_empty() => {
            println!("{who}> [image unavailable]");
        }
        RecordBody::Image(reference) => println!("{who}> [image] {reference}"),
        RecordBody::ForwardPreview(preview) => {
            println!("{who}> [forwarded messages]");
            for line in preview.lines() {
                println!("    {line}");
            }
        }
    }
}

fn format_state(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "offline",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Online => "online",
        ConnectionState::Errored => "error",
        ConnectionState::Reconnecting => "reconnecting",
    }
}
