use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use kroxide::config::{FilterConfig, ProxyConfig};
use kroxide::connection::{serve_virtual_cluster, FilterChainFactory};
use kroxide::dek::DekManager;
use kroxide::encryption::{RecordEncryptionFilter, RecordField, TopicNameKekSelector};
use kroxide::endpoint::{EndpointRegistry, VirtualCluster};
use kroxide::filter::broker_address::BrokerAddressFilter;
use kroxide::filter::KafkaFilter;
use kroxide::kms::InMemoryKms;
use kroxide::metrics;

const DEFAULT_PER_FILTER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Starts the proxy from a config file.
    Run {
        #[clap(short, long, value_name = "CONFIG_PATH")]
        config: String,
    },
    /// Parses and validates a config file without starting the proxy.
    ValidateConfig {
        #[clap(short, long, value_name = "CONFIG_PATH")]
        config: String,
    },
}

fn load_config(path: &str) -> Result<ProxyConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
    ProxyConfig::from_json_str(&raw).with_context(|| format!("parsing config file {path}"))
}

/// Builds the per-virtual-cluster filter chain factory from its
/// `FilterConfig` list, resolving each type tag against the small set of
/// filters this crate ships. The filters built here are shared across every
/// connection the virtual cluster accepts; the factory adds a fresh
/// eager-metadata learner on top for each one.
fn build_filter_chain_factory(
    filters: &[FilterConfig],
    registry: Arc<EndpointRegistry>,
    virtual_cluster: String,
) -> Result<FilterChainFactory> {
    let mut chain: Vec<Arc<dyn KafkaFilter>> = Vec::new();

    for filter_config in filters {
        match filter_config.type_name.as_str() {
            "broker-address" => {
                chain.push(Arc::new(BrokerAddressFilter::new(Arc::clone(&registry), virtual_cluster.clone())));
            }
            "record-encryption" => {
                let config: kroxide::config::EncryptionFilterConfig = serde_json::from_value(filter_config.config.clone())
                    .with_context(|| "parsing record-encryption filter config")?;
                let kms: Arc<dyn kroxide::kms::Kms> = match config.kms.name.as_str() {
                    "in-memory" => Arc::new(InMemoryKms::new()),
                    other => anyhow::bail!("unknown kms type '{other}'"),
                };
                let dek_manager = Arc::new(DekManager::new(
                    kms,
                    config.max_encryptions_per_dek,
                    config.cache_tuning.encryption_dek_expire_after_write,
                ));
                let selector = Arc::new(TopicNameKekSelector::from_config(&config.kek_selector));
                let record_fields = config
                    .record_fields
                    .iter()
                    .map(|f| match f {
                        kroxide::config::RecordFieldConfig::RecordValue => RecordField::RecordValue,
                        kroxide::config::RecordFieldConfig::RecordHeaderValues => RecordField::RecordHeaderValues,
                    })
                    .collect();
                chain.push(Arc::new(RecordEncryptionFilter::new(
                    dek_manager,
                    selector,
                    record_fields,
                    config.cache_tuning.decrypted_dek_cache_size,
                    config.cache_tuning.decrypted_dek_expire_after_access,
                )));
            }
            other => anyhow::bail!("unknown filter type '{other}'"),
        }
    }

    Ok(FilterChainFactory::new(registry, virtual_cluster, chain, DEFAULT_PER_FILTER_TIMEOUT))
}

async fn run(config: ProxyConfig) -> Result<()> {
    metrics::install();
    let registry = Arc::new(EndpointRegistry::new());

    let mut tasks = Vec::new();
    for vc_config in &config.virtual_clusters {
        let upstream_bootstrap = vc_config
            .upstream_bootstrap
            .rsplit_once(':')
            .map(|(host, port)| Ok::<_, anyhow::Error>((host.to_string(), port.parse::<u16>()?)))
            .context("upstream_bootstrap must be host:port")??;

        let vc = VirtualCluster {
            name: vc_config.name.clone(),
            upstream_bootstrap,
            endpoint_binding_policy: vc_config.endpoint_binding_policy.clone(),
            log_frames: vc_config.log_frames,
            log_network: vc_config.log_network,
        };
        let listeners = registry.register_virtual_cluster(vc).await?;
        let chain_factory = Arc::new(build_filter_chain_factory(
            &config.filters,
            Arc::clone(&registry),
            vc_config.name.clone(),
        )?);

        info!(virtual_cluster = %vc_config.name, "listening");
        tasks.push(tokio::spawn(serve_virtual_cluster(
            vc_config.name.clone(),
            listeners,
            Arc::clone(&registry),
            chain_factory,
        )));
    }

    for task in tasks {
        task.await?;
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    match Args::parse().command {
        Command::ValidateConfig { config } => {
            load_config(&config)?;
            println!("{config} is valid");
            Ok(())
        }
        Command::Run { config } => {
            let config = load_config(&config)?;
            tokio::runtime::Builder::new_multi_thread().enable_all().build()?.block_on(run(config))
        }
    }
}
