use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streams_client::{HttpStreamTransport, StreamRequest, StreamTransport};
use streams_config::ViewerConfig;
use streams_conversation::{short_model, usage_totals_by_model, ConversationSync, SessionStats};
use streams_core::{ContentBlock, ConversationMessage, HistoryEntry, MessageKind, SessionRecord};
use streams_history::HistoryDirectory;
use streams_pricing::PricingResolver;

#[derive(Parser)]
#[command(name = "claude-streams")]
#[command(about = "Live viewer for Claude session streams", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the stream server base URL
    #[arg(long, value_name = "URL")]
    server: Option<String>,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the history feed and list recent sessions
    Sessions {
        /// Filter sessions by search query
        #[arg(short, long)]
        search: Option<String>,

        /// Filter sessions by project leaf folder (repeatable)
        #[arg(short, long)]
        project: Vec<String>,
    },

    /// Follow one session's conversation and print messages as they arrive
    Watch {
        /// Session identifier
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(ViewerConfig::default_config_path);
    let mut config = if config_path.exists() {
        info!("Loading configuration from: {:?}", config_path);
        ViewerConfig::from_yaml(&config_path)?
    } else {
        info!("Using default configuration");
        ViewerConfig::default()
    };
    if let Some(server) = cli.server {
        config.server.base_url = server;
    }

    match cli.command {
        Commands::Sessions { search, project } => {
            follow_sessions(config, search.unwrap_or_default(), project).await?;
        }
        Commands::Watch { session_id } => {
            watch_session(config, session_id).await?;
        }
    }

    Ok(())
}

/// Keep the history subscription open, reconcile every batch into the
/// directory, and reprint the filtered listing whenever it changes.
async fn follow_sessions(
    config: ViewerConfig,
    search: String,
    projects: Vec<String>,
) -> Result<()> {
    let client = reqwest::Client::new();
    let transport = HttpStreamTransport::new(client, config.retry);

    let mut subscription = transport
        .open(StreamRequest::from_start(config.server.history_url()))
        .await?;

    let mut directory = HistoryDirectory::new();
    let limit = config.limits.recent_sessions;

    println!(
        "Following {} (Ctrl-C to stop)\n",
        config.server.history_url()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            batch = subscription.next_batch() => {
                let Some(batch) = batch else { break };
                let entries: Vec<HistoryEntry> = batch.decode();
                if directory.ingest(&entries) > 0 {
                    print_listing(&directory, &search, &projects, limit);
                }
            }
        }
    }

    subscription.cancel();
    Ok(())
}

fn print_listing(directory: &HistoryDirectory, search: &str, projects: &[String], limit: usize) {
    let sessions = directory.filtered(search, projects, limit);

    println!("\n📋 Recent Sessions ({})", sessions.len());
    println!("═══════════════════════════════════════");
    for session in &sessions {
        print_session_line(session);
    }

    let groups = directory.project_groups(limit);
    if !groups.is_empty() {
        let summary: Vec<String> = groups
            .iter()
            .map(|g| format!("{} ({})", g.name, g.count))
            .collect();
        println!("\nProjects: {}", summary.join(", "));
    }
}

fn print_session_line(session: &SessionRecord) {
    println!(
        "  [{}] {}  {}  {}",
        session.project_leaf(),
        format_relative_time(session.timestamp),
        session.session_id,
        truncate(&session.display, 60),
    );
}

/// Drive the conversation sync for one session; on exit print the session
/// stats and the estimated usage cost.
async fn watch_session(config: ViewerConfig, session_id: String) -> Result<()> {
    let client = reqwest::Client::new();
    let transport = Arc::new(HttpStreamTransport::new(client.clone(), config.retry));

    let mut sync = ConversationSync::new(transport, config.server.clone());
    let mut revision = sync.revision();
    sync.select_session(&session_id).await;

    println!("Watching session {} (Ctrl-C to stop)\n", session_id);

    let mut printed = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = revision.changed() => {
                if changed.is_err() {
                    break;
                }
                let messages = sync.messages();
                for msg in &messages[printed.min(messages.len())..] {
                    print_message(msg);
                }
                printed = messages.len();
            }
        }
    }

    let messages = sync.messages();
    let stats = SessionStats::from_messages(&messages);
    let totals = usage_totals_by_model(&messages);

    let resolver = PricingResolver::over_http(client, config.pricing.dataset_url.clone());
    let cost = resolver.resolve_cost(&totals).await;

    println!("\n📊 Session Summary");
    println!("═══════════════════════════════════════");
    if let Some(model) = &stats.model {
        println!("  Model: {}", short_model(model));
    }
    println!(
        "  Messages: {} human, {} assistant",
        stats.human_count, stats.assistant_count
    );
    println!("  Context: {} tokens", format_tokens(stats.context_tokens));
    println!("  Estimated cost: ${:.4}", cost);

    sync.deselect();
    Ok(())
}

fn print_message(msg: &ConversationMessage) {
    let label = match msg.kind {
        MessageKind::User => "user",
        MessageKind::Assistant => "assistant",
        MessageKind::Other => return,
    };

    for block in msg.content_blocks() {
        match block {
            ContentBlock::Text { text } => {
                if !text.trim().is_empty() {
                    println!("[{label}] {text}");
                }
            }
            ContentBlock::Thinking { thinking } => {
                println!("  (thinking) {}", preview(&thinking));
            }
            ContentBlock::ToolUse { name, input, .. } => {
                let args = input.map(|v| preview(&v.to_string())).unwrap_or_default();
                println!("  🛠️  {name} {args}");
            }
            ContentBlock::ToolResult {
                content, is_error, ..
            } => {
                let marker = if is_error { "err" } else { "ok" };
                let text = content.map(|c| c.as_text()).unwrap_or_default();
                println!("  [{marker}] {}", preview(&text));
            }
            ContentBlock::Unknown => {}
        }
    }
}

fn preview(text: &str) -> String {
    let flat = text.replace('\n', " ");
    truncate(&flat, 60)
}

fn truncate(s: &str, len: usize) -> String {
    if s.chars().count() <= len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(len).collect();
        format!("{cut}...")
    }
}

fn format_relative_time(timestamp_ms: i64) -> String {
    let now = chrono::Utc::now().timestamp_millis();
    let seconds = (now - timestamp_ms).max(0) / 1000;
    if seconds < 60 {
        return "just now".to_string();
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{minutes}m ago");
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{hours}h ago");
    }
    let days = hours / 24;
    if days < 7 {
        return format!("{days}d ago");
    }
    chrono::DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| format!("{days}d ago"))
}

fn format_tokens(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}k", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
