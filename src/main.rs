use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lemline::activities::ActivityRunners;
use lemline::config::{DatabaseKind, LemlineConfig, MessagingKind};
use lemline::consumer::Consumer;
use lemline::definitions::{CompiledWorkflow, DefinitionCache};
use lemline::messaging::InMemoryBroker;
use lemline::outbox::OutboxProcessor;
use lemline::providers::persistence::{
    InMemoryDefinitionRepository, InMemoryOutbox, PostgresDefinitionRepository, PostgresOutbox,
};
use lemline::repository::{DefinitionRepository, OutboxRepository};
use lemline::schema::SchemaRegistry;
use lemline::secrets::EnvSecretStore;

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("Configuration error: {message}"))]
    Configuration { message: String },

    #[snafu(display("Definition error: {source}"))]
    Definition { source: lemline::definitions::Error },

    #[snafu(display("Database error: {source}"))]
    Database { source: lemline::repository::Error },

    #[snafu(display("I/O error reading {path}: {source}"))]
    Io {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Parser, Debug)]
#[command(name = "lemline")]
#[command(version)]
#[command(about = "A broker-driven runtime for Serverless Workflow DSL 1.0", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Attach the consumer and outbox processors and run until ctrl-c
    Serve(ServeArgs),
    /// Parse and compile workflow document(s) without running them
    Validate(ValidateArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Workflow documents to register into the definition store at startup
    #[arg(short = 'w', long = "workflow")]
    workflows: Vec<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, env = "LEMLINE_VERBOSE")]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    /// Workflow document(s) to validate
    files: Vec<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let filter_layer = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            init_tracing(args.verbose);
            let config = LemlineConfig::load().unwrap_or_default();
            serve(config, args).await
        }
        Commands::Validate(args) => {
            init_tracing(args.verbose);
            validate(args)
        }
    }
}

fn validate(args: ValidateArgs) -> Result<(), Error> {
    let mut failures = 0;
    for path in &args.files {
        let source = std::fs::read_to_string(path).context(IoSnafu {
            path: path.display().to_string(),
        })?;
        match CompiledWorkflow::compile("cli", "validate", &source) {
            Ok(compiled) => {
                tracing::info!(
                    path = %path.display(),
                    name = %compiled.definition.document.name,
                    version = %compiled.definition.document.version,
                    nodes = compiled.tree.len(),
                    "workflow is valid"
                );
            }
            Err(e) => {
                failures += 1;
                tracing::error!(path = %path.display(), error = %e, "workflow is invalid");
            }
        }
    }
    if failures > 0 {
        return Err(Error::Configuration {
            message: format!("{failures} document(s) failed validation"),
        });
    }
    Ok(())
}

struct Repositories {
    definitions: Arc<dyn DefinitionRepository>,
    retries: Arc<dyn OutboxRepository>,
    waits: Arc<dyn OutboxRepository>,
}

async fn connect_database(config: &LemlineConfig) -> Result<Repositories, Error> {
    match config.database.kind {
        DatabaseKind::InMemory => Ok(Repositories {
            definitions: Arc::new(InMemoryDefinitionRepository::default()),
            retries: Arc::new(InMemoryOutbox::new()),
            waits: Arc::new(InMemoryOutbox::new()),
        }),
        DatabaseKind::Postgresql => {
            let url = config.database.url.as_deref().ok_or_else(|| {
                Error::Configuration {
                    message: "database.url is required for postgresql".to_string(),
                }
            })?;
            Ok(Repositories {
                definitions: Arc::new(
                    PostgresDefinitionRepository::new(url)
                        .await
                        .context(DatabaseSnafu)?,
                ),
                retries: Arc::new(
                    PostgresOutbox::new(url, "retries")
                        .await
                        .context(DatabaseSnafu)?,
                ),
                waits: Arc::new(
                    PostgresOutbox::new(url, "waits")
                        .await
                        .context(DatabaseSnafu)?,
                ),
            })
        }
        DatabaseKind::Mysql => Err(Error::Configuration {
            message: "database type 'mysql' has no driver compiled in".to_string(),
        }),
    }
}

async fn serve(config: LemlineConfig, args: ServeArgs) -> Result<(), Error> {
    if config.messaging.kind != MessagingKind::InMemory {
        return Err(Error::Configuration {
            message: format!(
                "messaging type {:?} has no driver compiled in",
                config.messaging.kind
            ),
        });
    }
    let broker = InMemoryBroker::new();
    let repositories = connect_database(&config).await?;

    let definitions = Arc::new(DefinitionCache::new(Arc::clone(&repositories.definitions)));
    for path in &args.workflows {
        let source = std::fs::read_to_string(path).context(IoSnafu {
            path: path.display().to_string(),
        })?;
        let parsed = lemline::model::parse_document(&source).map_err(|e| Error::Configuration {
            message: format!("{}: {e}", path.display()),
        })?;
        definitions
            .put(&parsed.document.name, &parsed.document.version, &source)
            .await
            .context(DefinitionSnafu)?;
        tracing::info!(
            name = %parsed.document.name,
            version = %parsed.document.version,
            "workflow registered"
        );
    }

    let mut handles = Vec::new();

    if config.producer.enabled {
        let retry_processor = Arc::new(OutboxProcessor::new(
            "retries",
            Arc::clone(&repositories.retries),
            broker.emitter(),
            config.retry.options(),
        ));
        let (processing, cleanup) = retry_processor.spawn();
        handles.push(processing);
        handles.push(cleanup);

        let wait_processor = Arc::new(OutboxProcessor::new(
            "waits",
            Arc::clone(&repositories.waits),
            broker.emitter(),
            config.wait.options(),
        ));
        let (processing, cleanup) = wait_processor.spawn();
        handles.push(processing);
        handles.push(cleanup);
    }

    if config.consumer.enabled {
        let consumer = Arc::new(Consumer::new(
            definitions,
            Arc::new(EnvSecretStore),
            Arc::new(ActivityRunners::standard(broker.emitter())),
            Arc::new(SchemaRegistry::new()),
            broker.emitter(),
            Arc::clone(&repositories.retries),
            Arc::clone(&repositories.waits),
        ));
        handles.extend(consumer.spawn_workers(
            broker.source(),
            broker.dead_letter_sink(),
            config.consumer.workers,
        ));
    }

    tracing::info!("lemline is running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutting down");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
