//! Mirror demo - walks mirror-cache through a chat session.
//!
//! Two views subscribe to the same thread, a message is sent, both views see
//! the re-fetched thread, and signing out tears the gated views down.

mod backend;
mod endpoints;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use mirror_cache::session::StaticIdentityProvider;
use mirror_cache::{
    CacheEvent, ClientConfig, Credentials, EntryStatus, Identity, MirrorClient, MirrorError,
    QuerySnapshot,
};
use serde_json::json;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use backend::ChatBackend;

#[derive(Parser, Debug)]
#[command(name = "mirror-demo")]
#[command(about = "Walk through mirror-cache against an in-memory chat backend")]
struct Args {
    /// Thread to open
    #[arg(short, long, default_value = "42")]
    thread_id: u64,

    /// Simulated server latency in milliseconds
    #[arg(long, default_value = "50")]
    latency_ms: u64,

    /// Message to send
    #[arg(short, long, default_value = "hello from the demo")]
    message: String,

    /// JSON client config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn describe(snapshot: &QuerySnapshot) -> String {
    let count = snapshot
        .data
        .as_ref()
        .and_then(|data| data.as_array())
        .map(|messages| messages.len());
    match (snapshot.status, count) {
        (EntryStatus::Fulfilled, Some(n)) => format!("fulfilled, {} messages", n),
        (EntryStatus::Pending, Some(n)) => format!("refreshing, {} messages shown", n),
        (EntryStatus::Rejected, _) => format!(
            "rejected: {}",
            snapshot
                .error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown error")
        ),
        (status, _) => status.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    }
    .with_env_overrides()?;

    let backend = Arc::new(
        ChatBackend::new(Duration::from_millis(args.latency_ms)).with_thread(
            args.thread_id,
            "bob",
            &["welcome to the thread", "anyone around?"],
        ),
    );
    let provider = StaticIdentityProvider::new()
        .with_user(Identity::new("ada").with_display_name("Ada"), "demo");

    let mut builder = MirrorClient::builder()
        .config(config)
        .transport(backend.clone())
        .identity_provider(Arc::new(provider));
    for endpoint in endpoints::all() {
        builder = builder.endpoint(endpoint);
    }
    let client = builder.build().await?;
    info!("Session after startup check: {}", client.session().phase);

    client.observe_cache(|event: &CacheEvent| match &event.snapshot {
        Some(snapshot) => info!("[cache] {} -> {}", event.key, describe(snapshot)),
        None => info!("[cache] {} evicted", event.key),
    });
    client.observe_session(|session| info!("[session] {}", session.phase));

    let args_json = json!({ "threadId": args.thread_id });
    match client.subscribe("messages", &args_json) {
        Err(MirrorError::SessionUnavailable { phase }) => {
            info!("Gate redirects to {} while {}", client.config().entry_point, phase);
        }
        Err(e) => return Err(e.into()),
        Ok(_) => bail!("messages should be gated before sign-in"),
    }

    let session = client.sign_in(&Credentials::new("ada", "demo")).await?;
    if !session.is_authenticated() {
        bail!("sign-in failed: {:?}", session.error);
    }

    // Two views of the same thread share one request.
    let mut list_view = client.subscribe("messages", &args_json)?;
    let mut badge_view = client.subscribe("messages", &args_json)?;
    let (list, badge) = tokio::join!(list_view.settled(), badge_view.settled());
    if let (Some(list), Some(badge)) = (list, badge) {
        info!("List view: {}", describe(&list));
        info!("Badge view: {}", describe(&badge));
    }
    info!("Backend requests so far: {}", backend.request_count());

    let outcome = client
        .mutate("sendMessage", &args_json, json!({ "text": args.message }))
        .await?;
    info!(
        "Sent message {}, invalidated {:?}",
        outcome.data["id"], outcome.invalidated.marked
    );

    // The thread is re-fetched for both views.
    loop {
        match list_view.changed().await {
            Some(snapshot) if snapshot.status == EntryStatus::Fulfilled && !snapshot.stale => {
                info!("List view after send: {}", describe(&snapshot));
                break;
            }
            Some(_) => continue,
            None => {
                warn!("List view closed before the refresh landed");
                break;
            }
        }
    }
    info!("Badge view after send: {}", describe(&badge_view.snapshot()));
    info!("Cache stats: {:?}", client.cache_stats());

    client.sign_out().await?;
    if list_view.changed().await.is_none() {
        info!("Gated views closed on sign-out");
    }
    info!("Cache stats after sign-out: {:?}", client.cache_stats());
    info!("Backend requests in total: {}", backend.request_count());

    Ok(())
}
