//! Fetching session orchestration: identity validation, authentication,
//! session negotiation, collector/filter dispatch, the three chunked upload
//! phases and the final lock.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kollect_core::{
    paginate, Config, DataCollector, DataFilter, Record, ResourceKind, ResourceSet,
};
use kollect_redact::RedactionEngine;
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod filters;
pub mod http;
pub mod upload;

pub use http::{parse_negotiation, ApiClient, ApiError, Backend, Negotiation, PageUpload, UploadRoute};
pub use kollect_core::ClusterIdentity;
pub use upload::{upload_pages, PhasePlan, UploadContext};

static CLUSTER_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-z0-9-_]+$").expect("cluster id pattern compiles"));

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid cluster identifier {0:?}: must match ^[a-z0-9-_]+$")]
    InvalidClusterId(String),
    #[error("authenticating with the backend: {0}")]
    Auth(#[source] ApiError),
    #[error("deriving the unique cluster id: {0}")]
    Identity(#[source] anyhow::Error),
    #[error("negotiating a fetching session: {0}")]
    Negotiation(#[source] ApiError),
    #[error("{source_name} collector failed: {source}")]
    Collector {
        source_name: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("uploading {kind} pages: {source}")]
    Upload {
        kind: ResourceKind,
        #[source]
        source: ApiError,
    },
    #[error("encoding collected data: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Recoverable reasons the backend declines a fetching cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotReady,
    Suspended,
    DuplicateClusterId,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NotReady => f.write_str("backend not ready"),
            SkipReason::Suspended => f.write_str("integration suspended"),
            SkipReason::DuplicateClusterId => f.write_str("duplicate cluster identity"),
        }
    }
}

/// How a session ended. `Skipped` is a clean outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    DryRun,
    Skipped(SkipReason),
}

/// One end-to-end run: owns the resource set for the run's duration and
/// drives every registered collector and filter through the upload
/// pipeline. One session in flight per process invocation.
pub struct SessionRunner {
    cluster_id: String,
    conf: Arc<Config>,
    redactor: Arc<RedactionEngine>,
    identity: Arc<dyn ClusterIdentity>,
    collectors: Vec<Box<dyn DataCollector>>,
    filters: Vec<Box<dyn DataFilter>>,
}

impl SessionRunner {
    pub fn new(
        cluster_id: impl Into<String>,
        conf: Arc<Config>,
        redactor: Arc<RedactionEngine>,
        identity: Arc<dyn ClusterIdentity>,
        collectors: Vec<Box<dyn DataCollector>>,
        filters: Vec<Box<dyn DataFilter>>,
    ) -> SessionRunner {
        SessionRunner {
            cluster_id: cluster_id.into(),
            conf,
            redactor,
            identity,
            collectors,
            filters,
        }
    }

    /// Validate, authenticate and execute the session against the real
    /// backend. Dry-run short-circuits before any network traffic.
    pub async fn run(self) -> Result<Outcome, SessionError> {
        validate_cluster_id(&self.cluster_id)?;
        info!(
            cluster = %self.cluster_id,
            login = %self.conf.login_endpoint,
            api = %self.conf.api_endpoint,
            "starting fetching agent"
        );

        if self.conf.dry_run {
            info!("dry run: skipping authentication and upload");
            return self.run_dry().await;
        }

        let client = ApiClient::connect(&self.conf, &self.cluster_id, Arc::clone(&self.redactor))
            .await
            .map_err(SessionError::Auth)?;
        info!("authenticated with the backend");
        self.execute(Arc::new(client)).await
    }

    /// Session body behind the authenticated client; the backend seam lets
    /// tests drive the whole state machine in memory.
    pub async fn execute(self, backend: Arc<dyn Backend>) -> Result<Outcome, SessionError> {
        let unique_cluster_id = self
            .identity
            .unique_cluster_id()
            .await
            .map_err(SessionError::Identity)?;
        let fetching_id = Uuid::new_v4().simple().to_string();

        let negotiation = match backend
            .negotiate(&unique_cluster_id, &fetching_id, self.conf.override_unique_cluster_id)
            .await
        {
            Ok(negotiation) => negotiation,
            Err(ApiError::NotReady) => {
                info!("backend is not ready for a fetching cycle, skipping this run");
                return Ok(Outcome::Skipped(SkipReason::NotReady));
            }
            Err(err @ ApiError::Suspended) => {
                warn!("{err}");
                return Ok(Outcome::Skipped(SkipReason::Suspended));
            }
            Err(err @ ApiError::DuplicateClusterId) => {
                warn!("{err}");
                return Ok(Outcome::Skipped(SkipReason::DuplicateClusterId));
            }
            Err(err) => return Err(SessionError::Negotiation(err)),
        };

        info!(
            cluster = %self.cluster_id,
            fetching = %fetching_id,
            integration = %negotiation.integration_id,
            unique_cluster = %unique_cluster_id,
            send_trees = negotiation.send_trees,
            "fetching session negotiated"
        );

        let mut set = self.collect_all().await?;
        self.apply_filters(&mut set).await;

        let ctx = UploadContext {
            cluster_id: self.cluster_id.clone(),
            fetching_id: fetching_id.clone(),
            integration_id: negotiation.integration_id.clone(),
        };

        let types = Arc::new(set.take(ResourceKind::Types));
        let helm_releases = set.take(ResourceKind::HelmReleases);
        self.upload_kind(
            &backend,
            &ctx,
            PhasePlan {
                kind: ResourceKind::HelmReleases,
                route: UploadRoute::Helm,
                body_key: "helmReleases",
                extra: Some(("k8sTypes", types)),
                concurrency: self.conf.helm_concurrency,
            },
            helm_releases,
        )
        .await?;

        if negotiation.send_trees {
            let records = tree_records(set.get(ResourceKind::Objects))?;
            self.upload_kind(
                &backend,
                &ctx,
                PhasePlan {
                    kind: ResourceKind::Trees,
                    route: UploadRoute::Tree,
                    body_key: "k8sTrees",
                    extra: None,
                    concurrency: self.conf.helm_concurrency,
                },
                records,
            )
            .await?;
        } else {
            info!("tree upload disabled by the backend");
        }

        let objects = set.take(ResourceKind::Objects);
        self.upload_kind(
            &backend,
            &ctx,
            PhasePlan {
                kind: ResourceKind::Objects,
                route: UploadRoute::Objects,
                body_key: "k8sObjects",
                extra: None,
                concurrency: self.conf.objects_concurrency,
            },
            objects,
        )
        .await?;

        // Lock failures never fail the session; the data is already durable
        // on the backend.
        info!(cluster = %self.cluster_id, fetching = %fetching_id, "sending lock request");
        if let Err(err) = backend.lock(&fetching_id, &negotiation.integration_id).await {
            warn!(
                cluster = %self.cluster_id,
                fetching = %fetching_id,
                error = %err,
                "lock request failed"
            );
        }

        info!(cluster = %self.cluster_id, fetching = %fetching_id, "fetching session finished");
        Ok(Outcome::Completed)
    }

    async fn run_dry(self) -> Result<Outcome, SessionError> {
        let mut set = self.collect_all().await?;
        self.apply_filters(&mut set).await;
        let stdout = std::io::stdout();
        serde_json::to_writer(stdout.lock(), &set.to_json())?;
        println!();
        Ok(Outcome::DryRun)
    }

    async fn collect_all(&self) -> Result<ResourceSet, SessionError> {
        debug!(amount = self.collectors.len(), "running collectors");
        let mut set = ResourceSet::new();
        for collector in &self.collectors {
            match collector.collect(&self.conf).await {
                Ok(records) => {
                    info!(
                        source = collector.source(),
                        kind = %collector.kind(),
                        records = records.len(),
                        "collector finished"
                    );
                    set.insert(collector.kind(), records);
                }
                // Helm enumeration is best-effort; everything else is load-bearing.
                Err(err) if collector.kind() == ResourceKind::HelmReleases => {
                    warn!(source = collector.source(), error = ?err, "helm collector failed");
                    set.insert(collector.kind(), Vec::new());
                }
                Err(source) => {
                    return Err(SessionError::Collector {
                        source_name: collector.source(),
                        source,
                    })
                }
            }
        }
        Ok(set)
    }

    async fn apply_filters(&self, set: &mut ResourceSet) {
        for filter in &self.filters {
            debug!(filter = filter.name(), "running filter");
            if let Err(err) = filter.apply(set).await {
                warn!(filter = filter.name(), error = ?err, "filter failed, skipping it");
            }
        }
    }

    async fn upload_kind(
        &self,
        backend: &Arc<dyn Backend>,
        ctx: &UploadContext,
        plan: PhasePlan,
        records: Vec<Record>,
    ) -> Result<(), SessionError> {
        if records.is_empty() {
            warn!(kind = %plan.kind, fetching = %ctx.fetching_id, "nothing to send");
            return Ok(());
        }

        let (pages, stats) = paginate(plan.kind, records, self.conf.page_budget());
        if stats.dropped() > 0 {
            counter!("kollect_records_dropped", stats.dropped() as u64);
        }
        debug!(kind = %plan.kind, pages = pages.len(), "uploading pages");

        let kind = plan.kind;
        let accepted = upload_pages(Arc::clone(backend), ctx, &plan, pages)
            .await
            .map_err(|source| SessionError::Upload { kind, source })?;
        info!(kind = %kind, pages = accepted, fetching = %ctx.fetching_id, "all pages accepted");
        Ok(())
    }
}

fn validate_cluster_id(cluster_id: &str) -> Result<(), SessionError> {
    if CLUSTER_ID_PATTERN.is_match(cluster_id) {
        Ok(())
    } else {
        Err(SessionError::InvalidClusterId(cluster_id.to_string()))
    }
}

/// Build the ownership forest over the collected objects and keep the nodes
/// worth shipping.
fn tree_records(objects: &[Record]) -> Result<Vec<Record>, SessionError> {
    let forest = kollect_tree::build_forest(objects);
    let total = forest.len();
    let mut records = Vec::new();
    for tree in forest {
        if !tree.should_send() {
            debug!(kind = %tree.kind, name = %tree.name, "skipping childless tree");
            continue;
        }
        records.push(serde_json::to_value(tree)?);
    }
    debug!(total, kept = records.len(), "ownership forest prepared");
    Ok(records)
}
