use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use connector_runtime::config::load_settings;
use connector_runtime::transport::{MemoryBroker, MemoryTransport};
use connector_runtime::{
    Connector, ConnectorResult, Endpoint, FlowConstruct, Message, RuntimeContext, Settings,
};

/// Connector lifecycle runtime driven by the in-process memory transport
#[derive(Parser)]
#[command(name = "connector-runtime")]
#[command(version)]
#[command(about = "Connector lifecycle runtime driven by the in-process memory transport")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a memory connector with one polling receiver, push messages through it, then shut down
    Run {
        /// Configuration file (default: the user configuration file, if present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// How long to keep the connector started
        #[arg(long, default_value_t = 3000)]
        duration_ms: u64,

        /// Number of messages to dispatch to the receiver's queue
        #[arg(long, default_value_t = 10)]
        messages: usize,
    },
    /// Print the resolved configuration as TOML
    PrintConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Flow that counts what it receives.
struct CountingFlow {
    processed: AtomicUsize,
}

#[async_trait]
impl FlowConstruct for CountingFlow {
    fn name(&self) -> &str {
        "counting-flow"
    }

    fn is_started(&self) -> bool {
        true
    }

    async fn process(&self, message: Message) -> ConnectorResult<Option<Message>> {
        let count = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!(
            target: "connector_runtime::cli",
            "Received #{}: {:?}",
            count,
            message.as_text()
        );
        Ok(None)
    }
}

async fn run(settings: Settings, duration: Duration, messages: usize) -> ConnectorResult<()> {
    let runtime = Arc::new(RuntimeContext::new(&settings.runtime)?);
    let broker = MemoryBroker::new();
    let transport = MemoryTransport::new(broker.clone())
        .with_frequency(settings.receiver.frequency())
        .with_startup_delay(Duration::ZERO);
    let connector = Connector::new(settings.connector.clone(), Arc::new(transport), Arc::clone(&runtime))?;

    let flow = Arc::new(CountingFlow {
        processed: AtomicUsize::new(0),
    });
    let endpoint = Endpoint::parse(&format!(
        "{}://{}",
        settings.connector.protocol, settings.receiver.address
    ))?
    .with_transacted(settings.receiver.transacted);

    connector.initialise().await?;
    connector
        .register_listener(flow.clone(), endpoint.clone())
        .await?;
    runtime.set_started(true);
    connector.start().await?;

    for i in 0..messages {
        connector
            .dispatch(endpoint.clone(), Message::text(format!("message {i}")), None)
            .await?;
    }

    tokio::time::sleep(duration).await;

    connector.stop().await?;
    connector.dispose().await?;

    println!(
        "connector '{}': {} of {} message(s) processed, {} left queued",
        connector.name(),
        flow.processed.load(Ordering::SeqCst),
        messages,
        broker.depth(endpoint.uri().address())
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            duration_ms,
            messages,
        } => {
            let settings = load_settings(config.as_deref()).unwrap_or_else(|e| {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            });
            if let Err(e) = run(settings, Duration::from_millis(duration_ms), messages).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::PrintConfig { config } => {
            let rendered = load_settings(config.as_deref()).and_then(|settings| settings.to_toml());
            match rendered {
                Ok(toml) => print!("{}", toml),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}
