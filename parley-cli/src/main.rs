//! Parley demo: two clients chatting through an in-memory store.
//!
//! Both clients run their own coordinator against the same `MemoryStore`,
//! so every write by one side reaches the other through push snapshots.
//! Run with `RUST_LOG=debug` to watch subscription transitions.

use clap::Parser;
use log::info;
use parley_core::{ConversationId, User};
use parley_sync::{
    ChatState, DraftMessage, FieldValue, Fields, MemoryStore, MutationGateway, RemoteStore,
    SyncConfig, SyncCoordinator,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(author, version, about = "Parley chat projection demo", long_about = None)]
struct Args {
    /// Id of the local user
    #[arg(long, default_value = "alice")]
    user_id: String,

    /// Display name of the local user
    #[arg(long, default_value = "Alice")]
    user_name: String,

    /// Id of the simulated peer
    #[arg(long, default_value = "bob")]
    peer_id: String,

    /// Display name of the simulated peer
    #[arg(long, default_value = "Bob")]
    peer_name: String,

    /// Timeout for every remote call, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Messages the peer sends before the local user reads them
    #[arg(long, default_value_t = 3)]
    messages: u32,
}

type DemoResult<T> = Result<T, Box<dyn std::error::Error>>;

struct Client {
    coordinator: Arc<SyncCoordinator>,
    gateway: MutationGateway,
    updates: watch::Receiver<ChatState>,
}

impl Client {
    async fn connect(store: Arc<MemoryStore>, user: User, config: SyncConfig) -> DemoResult<Self> {
        let coordinator = Arc::new(SyncCoordinator::new(store, user, config));
        let updates = coordinator.subscribe();
        coordinator.start().await?;
        Ok(Self {
            gateway: MutationGateway::new(coordinator.clone()),
            coordinator,
            updates,
        })
    }

    async fn wait_for(
        &mut self,
        limit: Duration,
        predicate: impl FnMut(&ChatState) -> bool,
    ) -> DemoResult<ChatState> {
        let state = tokio::time::timeout(limit, self.updates.wait_for(predicate)).await??;
        Ok(state.clone())
    }
}

async fn register(store: &MemoryStore, id: &str, name: &str) -> DemoResult<()> {
    let fields = Fields::from([
        ("nickname".to_string(), FieldValue::Set(json!(name))),
        ("deviceId".to_string(), FieldValue::Set(json!(format!("{id}-cli")))),
    ]);
    store.write("users", Some(id), fields).await?;
    Ok(())
}

fn print_conversations(label: &str, state: &ChatState) {
    info!("[{label}] {} conversation(s), {} unread", state.conversations.len(), state.total_unread());
    let Some(me) = state.current_user() else {
        return;
    };
    for conv in state.conversations.iter() {
        let latest = conv
            .latest_message
            .as_ref()
            .map(|m| format!("{}: {}", m.sender_name, m.display_text()))
            .unwrap_or_else(|| "(no messages)".to_string());
        info!(
            "[{label}]   {} | {} | unread {}",
            conv.display_title(),
            latest,
            conv.unread_count(&me.id)
        );
    }
}

#[tokio::main]
async fn main() -> DemoResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = SyncConfig::default().with_remote_timeout(Duration::from_millis(args.timeout_ms));
    let wait = config.remote_timeout;
    let store = Arc::new(MemoryStore::new());
    register(&store, &args.user_id, &args.user_name).await?;
    register(&store, &args.peer_id, &args.peer_name).await?;

    let mut local = Client::connect(
        store.clone(),
        User::current(args.user_id.as_str(), args.user_name.as_str()),
        config.clone(),
    )
    .await?;
    let peer = Client::connect(
        store.clone(),
        User::current(args.peer_id.as_str(), args.peer_name.as_str()),
        config,
    )
    .await?;

    let conversation: ConversationId = local
        .gateway
        .create_conversation(&[args.peer_id.as_str().into()], "", None)
        .await?;

    for n in 1..=args.messages {
        peer.gateway
            .send_message(&conversation, DraftMessage::text(format!("message #{n}")))
            .await?;
    }

    let target = conversation.clone();
    let expected = args.messages;
    let state = local
        .wait_for(wait, move |s| {
            s.conversation(&target)
                .zip(s.current_user())
                .is_some_and(|(c, me)| c.unread_count(&me.id) == expected)
        })
        .await?;
    print_conversations(&args.user_name, &state);

    local.gateway.mark_read(&conversation).await?;
    let state = local.wait_for(wait, |s| s.total_unread() == 0).await?;
    print_conversations(&args.user_name, &state);

    let history = local.gateway.load_messages(&conversation).await?;
    info!("History of {conversation}: {} message(s)", history.len());
    for message in &history {
        info!("  {} {}: {}", message.created_at.as_millis(), message.user_id, message.text);
    }

    peer.coordinator.shutdown().await?;
    local.coordinator.shutdown().await?;
    info!("Store stats: {:?}", store.stats().await);
    Ok(())
}
