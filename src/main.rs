use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use flowcast::chat::{describe, run_chat};
use flowcast::gateway::OllamaGateway;
use flowcast::web_server::start_web_server;
use flowcast::{Pipeline, Prompt, Settings};

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Draw a single diagram and print where the artifacts went.
    Generate {
        /// Plain-language description of the process.
        prompt: String,
    },
    /// Interactive chat on stdin.
    Chat,
    /// Start the web UI and JSON API.
    Serve {
        #[arg(long, default_value_t = 9900, help = "Port for the web server.")]
        port: u16,
    },
    /// List the models installed on the Ollama server.
    Models,
    /// Inspect or empty the response cache.
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },
}

#[derive(clap::Subcommand, Debug)]
enum CacheCommands {
    /// Entry count, size and hit rate.
    Stats,
    /// Remove every cached entry and its artifacts.
    Clear,
}

fn init_tracing(settings: &Settings) {
    // RUST_LOG wins over LOG_LEVEL / APP_DEBUG when set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before clap reads its env fallbacks.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let settings = cli.settings;
    init_tracing(&settings);
    settings.validate().context("Invalid configuration")?;

    info!("flowcast starting with command: {:?}", cli.command);

    match cli.command {
        Commands::Generate { prompt } => {
            let pipeline = Pipeline::from_settings(&settings).context("Failed to open the response cache")?;
            match pipeline.run(&Prompt::new(prompt)).await {
                Ok(output) => println!("{}", describe(&output)),
                Err(err) => {
                    error!("{}", err);
                    anyhow::bail!(err.user_message());
                }
            }
        }
        Commands::Chat => {
            let pipeline = Pipeline::from_settings(&settings).context("Failed to open the response cache")?;
            run_chat(Arc::new(pipeline)).await.context("Chat session failed")?;
            info!("Chat session finished.");
        }
        Commands::Serve { port } => {
            let pipeline = Arc::new(Pipeline::from_settings(&settings).context("Failed to open the response cache")?);
            let server = start_web_server(port, pipeline, &settings);
            tokio::select! {
                res = server => res?,
                _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down."),
            }
        }
        Commands::Models => {
            let gateway = OllamaGateway::new(settings.gateway_config());
            let models = gateway
                .list_models()
                .await
                .context("Failed to list models")?;
            let resolved = gateway.resolve_model().await.context("Failed to resolve model")?;
            for model in &models {
                let marker = if *model == resolved || model.starts_with(&format!("{}:", resolved)) {
                    "*"
                } else {
                    " "
                };
                println!("{} {}", marker, model);
            }
            if models.is_empty() {
                println!("No models installed.");
            }
        }
        Commands::Cache { action } => {
            let cache = flowcast::cache::ResponseCache::open(&settings.cache_dir, settings.cache_limits())
                .context("Failed to open the response cache")?;
            match action {
                CacheCommands::Stats => {
                    let stats = cache.stats().await;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                CacheCommands::Clear => {
                    let removed = cache.clear().await.context("Failed to clear the cache")?;
                    println!("Removed {} cached diagram(s).", removed);
                }
            }
        }
    }

    Ok(())
}
