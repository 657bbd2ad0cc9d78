mod render;

use aid_live::{
    FollowTarget, FollowerHandle, HttpSessionFetcher, LiveClient, LiveConfig, SessionFollower,
    SnapshotCache, ViewUpdate,
};
use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::Parser;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "aid-watch", about = "Follow a live alert investigation session")]
struct Args {
    #[arg(long, default_value = "")]
    api_url: String,
    #[arg(long, default_value = "")]
    session: String,
    #[arg(long, default_value_t = false)]
    dashboard: bool,
    #[arg(long)]
    dedup_window: Option<usize>,
    /// Show only the newest N persisted items per update.
    #[arg(long)]
    tail: Option<usize>,
}

#[derive(Debug, PartialEq, Eq)]
enum InputCommand {
    Refresh,
    Retry,
    Switch(String),
    Quit,
}

fn parse_input(line: &str) -> Option<InputCommand> {
    let mut parts = line.split_whitespace();
    let command = parts.next()?;
    match command {
        "r" | "refresh" => Some(InputCommand::Refresh),
        "retry" => Some(InputCommand::Retry),
        "s" | "switch" => parts
            .next()
            .map(|session_id| InputCommand::Switch(session_id.to_string())),
        "q" | "quit" | "exit" => Some(InputCommand::Quit),
        _ => None,
    }
}

fn resolve_config(args: &Args) -> LiveConfig {
    let mut config = LiveConfig::from_env();
    if !args.api_url.trim().is_empty() {
        config.api_base_url = args.api_url.trim().to_string();
    }
    if let Some(window) = args.dedup_window {
        config.dedup_window = window;
    }
    config
}

fn resolve_target(args: &Args) -> Result<FollowTarget> {
    let session = args.session.trim();
    match (args.dashboard, session.is_empty()) {
        (true, true) => Ok(FollowTarget::Dashboard),
        (false, false) => Ok(FollowTarget::Session(session.to_string())),
        (true, false) => bail!("--session and --dashboard are mutually exclusive"),
        (false, true) => bail!("pass --session <id> or --dashboard"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let target = resolve_target(&args)?;
    let config = resolve_config(&args);
    info!(
        event = "watch_start",
        api_url = %config.api_base_url,
        follow = ?target,
        dedup_window = config.dedup_window
    );

    let client = LiveClient::with_http(&config).context("building event stream client")?;
    let fetcher = HttpSessionFetcher::new(&config.api_base_url, config.request_timeout)
        .context("building history client")?;
    let cache = Arc::new(SnapshotCache::new(Arc::new(fetcher)));
    let (follower, handle, updates) = SessionFollower::new(client, cache, target, &config);
    let follower_task = tokio::spawn(follower.run());

    let (input_tx, input_rx) = mpsc::channel(8);
    tokio::spawn(read_input(input_tx));

    watch_loop(updates, input_rx, &handle, args.tail).await;
    handle.shutdown().await;
    let _ = follower_task.await;
    info!(event = "watch_stop");
    Ok(())
}

async fn watch_loop(
    mut updates: mpsc::Receiver<ViewUpdate>,
    mut input: mpsc::Receiver<InputCommand>,
    handle: &FollowerHandle,
    tail: Option<usize>,
) {
    let mut input_open = true;
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else {
                    break;
                };
                print_update(&update, tail);
            }
            command = input.recv(), if input_open => {
                let delivered = match command {
                    Some(InputCommand::Refresh) => handle.refresh().await,
                    Some(InputCommand::Retry) => handle.retry().await,
                    Some(InputCommand::Switch(session_id)) => handle.switch(session_id).await,
                    Some(InputCommand::Quit) => break,
                    // stdin closed; keep following until interrupted
                    None => {
                        input_open = false;
                        true
                    }
                };
                if !delivered {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
}

async fn read_input(tx: mpsc::Sender<InputCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match parse_input(&line) {
            Some(command) => {
                if tx.send(command).await.is_err() {
                    return;
                }
            }
            None if line.trim().is_empty() => {}
            None => eprintln!("commands: refresh | retry | switch <session-id> | quit"),
        }
    }
}

fn print_update(update: &ViewUpdate, tail: Option<usize>) {
    let stamp = Local::now().format("%H:%M:%S");
    match update {
        ViewUpdate::Timeline {
            session_id,
            status,
            revision,
            timeline,
        } => {
            println!();
            for line in render::render_timeline(session_id, *status, *revision, timeline, tail) {
                println!("{line}");
            }
        }
        ViewUpdate::Dashboard { revision, sessions } => {
            println!();
            for line in render::render_dashboard(*revision, sessions) {
                println!("{line}");
            }
        }
        ViewUpdate::Connection { connected, disabled } => {
            println!("[{stamp}] {}", render::render_connection(*connected, *disabled));
        }
        ViewUpdate::FetchFailed {
            session_id,
            message,
        } => {
            let scope = session_id.as_deref().unwrap_or("dashboard");
            println!("[{stamp}] !! refresh of {scope} failed: {message}");
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_enabled = matches!(
        std::env::var("AID_LOG_STDOUT").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("YES")
    );
    if stdout_enabled {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}
