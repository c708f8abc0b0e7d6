use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    ClientEvent, LocalBackend, MessagingClient, MessagingConfig, RealtimeFeed, RestConfig,
    RestDataService,
};
use shared::{
    domain::{ConversationId, DriverProfileId, Role, UserId, Viewer},
    protocol::{Conversation, Message},
};
use storage::Storage;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

mod config;

use config::{load_settings, prepare_database_url, BackendKind, Settings};

#[derive(Parser, Debug)]
#[command(about = "Owner/driver messaging client")]
struct Args {
    #[arg(long, default_value = "chat.toml")]
    config: PathBuf,
    /// Overrides the configured backend.
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,
    /// Signed-in user.
    #[arg(long)]
    user: Option<UserId>,
    #[arg(long, value_enum, default_value_t = RoleArg::Owner)]
    role: RoleArg,
    /// Driver profile of the signed-in driver; looked up when omitted.
    #[arg(long)]
    driver_profile: Option<DriverProfileId>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Owner,
    Driver,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a demo owner, driver and driver profile (local backend only).
    Seed,
    /// List conversations, newest activity first.
    Conversations,
    /// Print a conversation's recent messages and mark it read.
    Open {
        conversation: ConversationId,
        /// Keep printing new messages until interrupted.
        #[arg(long)]
        follow: bool,
    },
    Send {
        conversation: ConversationId,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    Attach {
        conversation: ConversationId,
        url: String,
        #[arg(long, default_value = "")]
        caption: String,
    },
    /// Get or create the conversation between an owner and a driver.
    Start {
        #[arg(long)]
        owner: UserId,
        #[arg(long)]
        driver: DriverProfileId,
    },
    MarkRead {
        conversation: ConversationId,
    },
    Delete {
        conversation: ConversationId,
    },
    /// Keep the conversation list live until interrupted.
    Watch,
}

impl Args {
    fn viewer(&self) -> Result<Viewer> {
        let user_id = self.user.context("--user is required for this command")?;
        Ok(match self.role {
            RoleArg::Owner => Viewer::owner(user_id),
            RoleArg::Driver => Viewer::driver(user_id, self.driver_profile),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config);
    if let Some(backend) = args.backend {
        settings.backend = backend;
    }

    if let Command::Seed = args.command {
        return seed(&settings).await;
    }

    let viewer = args.viewer()?;
    let client = connect(&settings).await?;
    client.sign_in(viewer).await;

    match args.command {
        Command::Seed => {}
        Command::Conversations => {
            let listing = client.list_conversations().await?;
            if let Some(error) = &listing.error {
                warn!("showing cached conversations: {}", error.message);
            }
            if listing.conversations.is_empty() {
                println!("no conversations");
            }
            for conversation in &listing.conversations {
                print_conversation(conversation, viewer.role);
            }
            println!("unread total: {}", client.total_unread().await);
        }
        Command::Open {
            conversation,
            follow,
        } => {
            let mut events = client.subscribe_events();
            let messages = client.open_conversation(conversation).await?;
            for message in &messages {
                print_message(message, viewer.user_id);
            }
            if follow {
                follow_messages(&mut events, viewer.user_id).await;
            }
            client.close_conversation().await;
        }
        Command::Send { conversation, text } => {
            let text = text.join(" ");
            match client.send_message(conversation, &text).await {
                Ok(message) => print_message(&message, viewer.user_id),
                Err(err) => {
                    if let Some(draft) = err.draft() {
                        bail!("{err} (unsent text: {draft:?})");
                    }
                    return Err(err.into());
                }
            }
        }
        Command::Attach {
            conversation,
            url,
            caption,
        } => {
            let message = client.send_attachment(conversation, &url, &caption).await?;
            print_message(&message, viewer.user_id);
        }
        Command::Start { owner, driver } => {
            let conversation = client.start_conversation(owner, driver).await?;
            print_conversation(&conversation, viewer.role);
        }
        Command::MarkRead { conversation } => {
            client.mark_read(conversation).await;
            println!("marked {conversation} read");
        }
        Command::Delete { conversation } => {
            client.delete_conversation(conversation).await?;
            println!("deleted {conversation}");
        }
        Command::Watch => {
            let mut events = client.subscribe_events();
            client.watch_conversation_list().await?;
            for conversation in client.list_conversations().await?.conversations {
                print_conversation(&conversation, viewer.role);
            }
            watch_list(&mut events, viewer.role).await;
            client.unwatch_conversation_list().await;
        }
    }

    client.sign_out().await;
    Ok(())
}

async fn open_storage(settings: &Settings) -> Result<Storage> {
    let database_url = prepare_database_url(&settings.database_url)?;
    Storage::new(&database_url)
        .await
        .with_context(|| format!("failed to open database {database_url}"))
}

async fn connect(settings: &Settings) -> Result<Arc<MessagingClient>> {
    let config = MessagingConfig::with_message_window(settings.message_window);
    match settings.backend {
        BackendKind::Local => {
            let backend = Arc::new(LocalBackend::new(open_storage(settings).await?));
            Ok(MessagingClient::new_local(backend, config))
        }
        BackendKind::Rest => {
            let rest_url = settings
                .rest_url
                .as_deref()
                .context("rest backend needs rest_url (or CHAT__REST_URL)")?;
            let rest = Arc::new(RestDataService::new(RestConfig {
                base_url: Url::parse(rest_url)
                    .with_context(|| format!("invalid rest_url '{rest_url}'"))?,
                api_key: settings.api_key.clone(),
                access_token: settings.access_token.clone(),
            }));
            match settings.realtime_url.as_deref() {
                Some(realtime_url) => {
                    let url = Url::parse(realtime_url)
                        .with_context(|| format!("invalid realtime_url '{realtime_url}'"))?;
                    Ok(MessagingClient::new(rest, Arc::new(RealtimeFeed::new(url)), config))
                }
                None => {
                    warn!("no realtime_url configured; live updates are disabled");
                    Ok(MessagingClient::new_without_feed(rest, config))
                }
            }
        }
    }
}

async fn seed(settings: &Settings) -> Result<()> {
    if settings.backend != BackendKind::Local {
        bail!("seed only works with the local backend");
    }
    let storage = open_storage(settings).await?;
    let owner = storage.create_user("Demo Owner", None).await?;
    let driver_user = storage.create_user("Demo Driver", None).await?;
    let driver = storage.create_driver_profile(driver_user).await?;
    info!(owner = %owner, driver_user = %driver_user, driver = %driver, "seeded demo users");
    println!("owner user:      {owner}");
    println!("driver user:     {driver_user}");
    println!("driver profile:  {driver}");
    Ok(())
}

fn print_conversation(conversation: &Conversation, role: Role) {
    let counterpart = conversation
        .counterpart(role)
        .map(|p| p.display_name.as_str())
        .unwrap_or("(unknown)");
    let preview = conversation
        .last_message
        .as_ref()
        .map(|m| m.content.as_str())
        .unwrap_or("(no messages)");
    println!(
        "{}  {:<20} unread={:<3} {}",
        conversation.id,
        counterpart,
        conversation.unread_for(role),
        preview
    );
}

fn print_message(message: &Message, me: UserId) {
    let sender = if message.sender_id == me {
        "me"
    } else {
        message
            .sender
            .as_ref()
            .map(|s| s.display_name.as_str())
            .unwrap_or("them")
    };
    let body = match &message.attachment_url {
        Some(url) if message.content.is_empty() => format!("[attachment] {url}"),
        Some(url) => format!("{} [attachment] {url}", message.content),
        None => message.content.clone(),
    };
    println!(
        "[{}] {}: {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        sender,
        body
    );
}

async fn follow_messages(events: &mut tokio::sync::broadcast::Receiver<ClientEvent>, me: UserId) {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::MessageAppended { message, .. }) => print_message(&message, me),
                Ok(ClientEvent::Error(err)) => warn!("{err}"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

async fn watch_list(events: &mut tokio::sync::broadcast::Receiver<ClientEvent>, role: Role) {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::ConversationsUpdated(conversations)) => {
                    println!("--");
                    for conversation in &conversations {
                        print_conversation(conversation, role);
                    }
                }
                Ok(ClientEvent::Error(err)) => warn!("{err}"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}
