use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{error, info, warn};

use kollect_core::DataCollector;
use kollect_helm::HelmCollector;
use kollect_kubehub::{KubeIdentity, ObjectsCollector, TypesCollector};
use kollect_redact::RedactionEngine;
use kollect_session::{filters, Outcome, SessionRunner};

/// Jobs with this name prefix in the agent's namespace count as peer runs.
const JOB_NAME_PREFIX: &str = "kollect-cronjob";

#[derive(Parser, Debug)]
#[command(name = "kollect", version, about = "Kubernetes fetching agent")]
struct Cli {
    /// Cluster identifier registered with the backend
    #[arg(value_name = "CLUSTER_ID", env = "CLUSTER_ID")]
    cluster_id: String,

    /// Set log level to debug
    #[arg(long, action = ArgAction::SetTrue)]
    debug: bool,

    /// Run outside of the cluster (path to a kubeconfig file)
    #[arg(long, value_name = "KUBECONFIG")]
    external: Option<PathBuf>,

    /// Configuration files directory
    #[arg(long = "config", default_value = "/etc/config", value_name = "DIR")]
    config_dir: PathBuf,

    /// Collect and print to stdout without sending anything to the backend
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,
}

fn init_tracing(debug: bool) {
    let env = if debug {
        "debug".to_string()
    } else {
        std::env::var("KOLLECT_LOG").unwrap_or_else(|_| "info".to_string())
    };
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KOLLECT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KOLLECT_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    init_metrics();

    let conf = Arc::new(
        kollect_core::Config::load(&cli.config_dir, cli.dry_run)
            .context("loading agent configuration")?,
    );

    let redactor = Arc::new(match conf.redaction_rules.as_deref() {
        Some(path) => RedactionEngine::with_rules_file(path).context("loading redaction rules")?,
        None => RedactionEngine::builtin(),
    });

    let client = kollect_kubehub::client(cli.external.as_deref())
        .await
        .context("connecting to the Kubernetes cluster")?;

    // One fetching run at a time: back off while a sibling job is active.
    let namespace = kollect_kubehub::current_namespace();
    match kollect_kubehub::active_collector_jobs(&client, &namespace, JOB_NAME_PREFIX).await {
        Ok(active) if active > 1 => {
            warn!(namespace = %namespace, active, "another collector job is running, exiting");
            return Ok(());
        }
        Ok(_) => {}
        Err(err) => {
            warn!(namespace = %namespace, error = ?err, "could not check for peer collector jobs")
        }
    }

    let collectors: Vec<Box<dyn DataCollector>> = vec![
        Box::new(ObjectsCollector::new(client.clone())),
        Box::new(TypesCollector::new(client.clone())),
        Box::new(HelmCollector::new(client.clone())),
    ];

    let session = SessionRunner::new(
        cli.cluster_id,
        conf,
        redactor,
        Arc::new(KubeIdentity::new(client)),
        collectors,
        filters::default_filters(),
    );

    match session.run().await {
        Ok(Outcome::Completed) => info!("fetching finished successfully"),
        Ok(Outcome::DryRun) => info!("dry run finished"),
        Ok(Outcome::Skipped(reason)) => info!(%reason, "fetching cycle skipped"),
        Err(err) => {
            error!(error = ?err, "fetching failed");
            return Err(err.into());
        }
    }
    Ok(())
}
