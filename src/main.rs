use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use memoria::config::{self, MemoriaConfig};
use memoria::context::{ContextAssembler, ContextWindowSelector};
use memoria::embedding::HashEmbedder;
use memoria::memory::{FileBlobStore, MemoryStore, SemanticSearch, Tier, UserContext};
use memoria::types::Conversation;

#[derive(Parser)]
#[command(name = "memoria")]
#[command(about = "Local conversational memory with semantic recall")]
#[command(version)]
struct Cli {
    /// Override the data directory
    #[arg(long, env = "MEMORIA_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a conversation read from a JSON file
    Import {
        /// Path to conversation JSON
        path: PathBuf,
    },

    /// Semantic search across all stored messages
    Search {
        query: String,
        #[arg(short, long, default_value = "5")]
        limit: usize,
        /// Minimum cosine similarity (defaults to the configured threshold)
        #[arg(long)]
        min_similarity: Option<f32>,
    },

    /// Show one conversation, oldest first
    History { conversation_id: String },

    /// Show the newest messages across all conversations
    Recent {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List stored conversation ids
    Conversations,

    /// Show memory statistics
    Stats,

    /// Remove messages past retention
    Cleanup {
        /// Override the tier's retention period
        #[arg(long)]
        days: Option<u32>,
    },

    /// Show or change the subscription tier
    Tier {
        #[command(subcommand)]
        action: Option<TierAction>,
    },

    /// Manage the user profile
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Print the system prompt
    Prompt,

    /// Assemble the context bundle for a new message
    Context {
        conversation_id: String,
        message: String,
    },

    /// Print the context window selected from a conversation JSON file
    Window {
        path: PathBuf,
    },

    /// Delete all stored memory
    Clear {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum TierAction {
    /// Show the current tier and its limits
    Show,
    /// Switch to another tier
    Set { tier: Tier },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Show the stored profile
    Show,
    /// Replace the profile
    Set {
        #[arg(long)]
        name: String,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        company: Option<String>,
        /// Repeatable
        #[arg(long = "fact")]
        facts: Vec<String>,
    },
    /// Append a fact to the profile
    AddFact { fact: String },
}

struct Runtime {
    config: MemoriaConfig,
    store: Arc<MemoryStore>,
    search: SemanticSearch,
}

impl Runtime {
    async fn open(mut config: MemoriaConfig, data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        if data_dir.is_some() {
            config.storage.data_dir = data_dir;
        }
        let dir = config.storage.resolve_data_dir();
        let embedder = Arc::new(HashEmbedder::new(config.embedding.dimension));
        let blobs = Arc::new(FileBlobStore::new(&dir));
        let store = Arc::new(MemoryStore::with_default_tier(
            embedder,
            blobs,
            config.memory.default_tier,
        ));
        store.initialize().await?;
        info!(data_dir = %dir.display(), "memory opened");

        let search =
            SemanticSearch::with_threshold(store.clone(), config.memory.similarity_threshold);
        Ok(Self {
            config,
            store,
            search,
        })
    }

    fn assembler(&self) -> ContextAssembler {
        ContextAssembler::with_limits(
            self.store.clone(),
            self.search.clone(),
            self.config.memory.recent_messages,
            self.config.memory.relevant_messages,
        )
    }
}

fn read_conversation(path: &Path) -> anyhow::Result<Conversation> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("invalid conversation at {}: {e}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = config::load()?;

    let runtime = Runtime::open(config, cli.data_dir).await?;
    let store = &runtime.store;

    match cli.command {
        Commands::Import { path } => {
            let conversation = read_conversation(&path)?;
            let added = store.store_conversation(&conversation).await?;
            println!("stored {added} new message(s) from {}", conversation.id);
        }
        Commands::Search {
            query,
            limit,
            min_similarity,
        } => {
            let results = runtime.search.search(&query, limit, min_similarity).await?;
            print_json(&results)?;
        }
        Commands::History { conversation_id } => {
            for m in store.conversation_history(&conversation_id).await {
                println!("{} {}: {}", m.timestamp.to_rfc3339(), m.role, m.content);
            }
        }
        Commands::Recent { limit } => {
            for m in store.recent_history(limit).await {
                println!("{} {}: {}", m.timestamp.to_rfc3339(), m.role, m.content);
            }
        }
        Commands::Conversations => {
            for id in store.all_conversation_ids().await {
                println!("{id}");
            }
        }
        Commands::Stats => print_json(&store.statistics().await)?,
        Commands::Cleanup { days } => {
            let removed = store.cleanup(days).await?;
            println!("removed {removed} message(s)");
        }
        Commands::Tier { action } => match action.unwrap_or(TierAction::Show) {
            TierAction::Show => {
                let tier = store.tier_config().await;
                let policy = tier.tier.policy();
                println!("tier: {}", tier.tier);
                println!("since: {}", tier.tier_started_at.to_rfc3339());
                println!("max messages: {}", policy.max_history_messages);
                println!("retention: {} days", policy.retention_days);
                match tier.last_cleanup_at {
                    Some(at) => println!("last cleanup: {}", at.to_rfc3339()),
                    None => println!("last cleanup: never"),
                }
            }
            TierAction::Set { tier } => {
                store.update_tier(tier).await?;
                println!("tier set to {tier}");
            }
        },
        Commands::Profile { action } => match action {
            ProfileAction::Show => match store.user_context().await {
                Some(profile) => print_json(&profile)?,
                None => println!("no profile stored"),
            },
            ProfileAction::Set {
                name,
                role,
                company,
                facts,
            } => {
                store
                    .store_user_context(UserContext {
                        name,
                        role,
                        company,
                        facts,
                    })
                    .await?;
                println!("profile saved");
            }
            ProfileAction::AddFact { fact } => {
                store.add_user_fact(fact).await?;
                println!("fact added");
            }
        },
        Commands::Prompt => {
            println!("{}", runtime.assembler().generate_system_prompt(true).await);
        }
        Commands::Context {
            conversation_id,
            message,
        } => {
            let assembler = runtime.assembler();
            let context = assembler
                .build_context(&message, &conversation_id, true)
                .await?;
            let prompt = assembler.generate_system_prompt(true).await;
            print_json(&context.to_provider_messages(&prompt))?;
        }
        Commands::Window { path } => {
            let conversation = read_conversation(&path)?;
            let selector = ContextWindowSelector::new(runtime.config.context.max_exchanges);
            print_json(&selector.select(&conversation.messages))?;
        }
        Commands::Clear { yes } => {
            if !yes {
                anyhow::bail!("refusing to clear memory without --yes");
            }
            store.clear_all().await?;
            println!("memory cleared");
        }
    }

    Ok(())
}
