use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kubetally_core::{MetadataConsumer, MetadataDelta, MetricRecord, MetricsConsumer, ResourceKind, Sink};
use kubetally_kubehub::KubeClientFactory;
use kubetally_receiver::{Receiver, ReceiverConfig, SinkRegistry};
use metrics::counter;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kubetallyctl", version, about = "kubetally cluster receiver")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// YAML configuration file (defaults plus KUBETALLY_* overrides when absent)
    #[arg(long = "config", global = true, env = "KUBETALLY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the cluster and print metric records until Ctrl-C
    Run {
        /// Do not print records, only log
        #[arg(long = "quiet", action = ArgAction::SetTrue)]
        quiet: bool,
    },
    /// Print the effective configuration after validation
    Config,
    /// List the resource kinds that can be watched
    Kinds,
}

fn init_tracing() {
    let env = std::env::var("KUBETALLY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUBETALLY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KUBETALLY_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ReceiverConfig> {
    let cfg = match path {
        Some(p) => ReceiverConfig::load(p)?,
        None => ReceiverConfig::default(),
    };
    Ok(cfg.with_env()?)
}

/// Prints every record; also registered as the `stdout` sink, which has no metadata capability.
struct StdoutConsumer {
    output: Output,
    quiet: bool,
}

#[async_trait::async_trait]
impl MetricsConsumer for StdoutConsumer {
    async fn consume_metrics(&self, batch: Vec<MetricRecord>) -> Result<()> {
        counter!("kubetally_printed_records_total", batch.len() as u64);
        if self.quiet {
            return Ok(());
        }
        for r in &batch {
            match self.output {
                Output::Human => {
                    let attrs: Vec<String> = r.attributes.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                    println!("{} {:<11} {:<40} {:<34} {:>6} {}", r.timestamp.format("%H:%M:%S%.3f"), r.kind, r.resource.to_string(), r.name, r.value, attrs.join(","));
                }
                Output::Json => println!("{}", serde_json::to_string(r)?),
            }
        }
        Ok(())
    }
}

impl Sink for StdoutConsumer {
    fn type_name(&self) -> &str { "stdout" }
}

/// Logs metadata deltas; registered as the `log` sink.
struct LogSink;

impl Sink for LogSink {
    fn type_name(&self) -> &str { "log" }

    fn metadata_consumer(self: Arc<Self>) -> Option<Arc<dyn MetadataConsumer>> { Some(self) }
}

#[async_trait::async_trait]
impl MetadataConsumer for LogSink {
    async fn consume_metadata(&self, delta: &MetadataDelta) -> Result<()> {
        info!(
            kind = %delta.kind,
            resource = %delta.resource,
            event = delta.event_type.as_str(),
            labels = delta.after.labels.len(),
            annotations = delta.after.annotations.len(),
            "metadata delta"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Kinds => match cli.output {
            Output::Human => {
                println!("KIND         SCOPE");
                for k in ResourceKind::ALL {
                    println!("{:<12} {}", k, if k.namespaced() { "namespaced" } else { "cluster" });
                }
            }
            Output::Json => println!("{}", serde_json::to_string_pretty(&ResourceKind::ALL)?),
        },
        Commands::Config => {
            let cfg = load_config(cli.config.as_ref())?;
            let kinds = cfg.validate()?;
            match cli.output {
                Output::Human => {
                    print!("{}", serde_yaml::to_string(&cfg)?);
                    let names: Vec<String> = kinds.iter().map(|k| k.kind().to_string()).collect();
                    println!("# watching: {}", names.join(", "));
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&cfg)?),
            }
        }
        Commands::Run { quiet } => {
            let cfg = load_config(cli.config.as_ref())?;
            let consumer = Arc::new(StdoutConsumer { output: cli.output, quiet });
            let mut registry = SinkRegistry::new();
            registry.register("log", Arc::new(LogSink)).register("stdout", consumer.clone());
            info!(sinks = ?registry.names(), exporters = ?cfg.metadata_exporters, "starting receiver");

            let mut receiver = Receiver::new(cfg, Arc::new(KubeClientFactory), consumer);
            receiver.start(&registry).await.context("starting receiver")?;
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "waiting for ctrl-c failed");
            }
            info!("shutting down");
            receiver.shutdown().await;
        }
    }
    Ok(())
}
