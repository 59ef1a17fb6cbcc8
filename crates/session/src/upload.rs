//! Bounded uploader: fans a phase's pages out over the backend with a fixed
//! admission gate, fans the results back in with first-error semantics.

use std::sync::Arc;

use kollect_core::{Page, Record, ResourceKind};
use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::http::{ApiError, Backend, PageUpload, UploadRoute};

/// Identifiers every page of the session is tagged with.
#[derive(Debug, Clone)]
pub struct UploadContext {
    pub cluster_id: String,
    pub fetching_id: String,
    pub integration_id: String,
}

/// Static description of one upload phase.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    pub kind: ResourceKind,
    pub route: UploadRoute,
    /// Key the page's records are sent under.
    pub body_key: &'static str,
    /// Extra payload repeated on every page of the phase (type metadata for
    /// helm pages).
    pub extra: Option<(&'static str, Arc<Vec<Record>>)>,
    pub concurrency: usize,
}

/// Upload all pages of one phase with at most `plan.concurrency` requests in
/// flight. Tasks are not cancelled when a sibling fails: the fan-out always
/// settles, every failure is logged, and the first error is returned.
/// Returns the number of pages accepted by the backend.
pub async fn upload_pages(
    backend: Arc<dyn Backend>,
    ctx: &UploadContext,
    plan: &PhasePlan,
    pages: Vec<Page>,
) -> Result<usize, ApiError> {
    if pages.is_empty() {
        return Ok(0);
    }

    let gate = Arc::new(Semaphore::new(plan.concurrency));
    let mut tasks: JoinSet<(usize, usize, usize, Result<(), ApiError>)> = JoinSet::new();

    for (index, page) in pages.into_iter().enumerate() {
        let backend = Arc::clone(&backend);
        let gate = Arc::clone(&gate);
        let fetching_id = ctx.fetching_id.clone();
        let integration_id = ctx.integration_id.clone();
        let kind = plan.kind;
        let route = plan.route;
        let body_key = plan.body_key;
        let extra = plan.extra.clone();
        let records = page.records.len();
        let bytes = page.bytes;

        tasks.spawn(async move {
            let result = async {
                let _permit = gate.acquire_owned().await?;
                let upload = PageUpload {
                    kind,
                    route,
                    integration_id,
                    body: page_body(&fetching_id, body_key, page.records, extra.as_ref()),
                };
                backend.send_page(&upload).await
            }
            .await;
            (index, records, bytes, result)
        });
    }

    let mut first_error: Option<ApiError> = None;
    let mut accepted = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((page, records, bytes, Ok(()))) => {
                accepted += 1;
                counter!("kollect_pages_sent", 1u64);
                histogram!("kollect_page_bytes", bytes as f64);
                info!(
                    kind = %plan.kind,
                    page,
                    records,
                    bytes,
                    cluster = %ctx.cluster_id,
                    fetching = %ctx.fetching_id,
                    "page uploaded"
                );
            }
            Ok((page, records, _bytes, Err(err))) => {
                counter!("kollect_pages_failed", 1u64);
                error!(
                    kind = %plan.kind,
                    page,
                    records,
                    cluster = %ctx.cluster_id,
                    fetching = %ctx.fetching_id,
                    error = %err,
                    "page upload failed"
                );
                first_error.get_or_insert(err);
            }
            Err(join_error) => {
                error!(kind = %plan.kind, error = %join_error, "upload task aborted");
                first_error.get_or_insert(ApiError::TaskFailed(join_error.to_string()));
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(accepted),
    }
}

fn page_body(
    fetching_id: &str,
    body_key: &'static str,
    records: Vec<Record>,
    extra: Option<&(&'static str, Arc<Vec<Record>>)>,
) -> serde_json::Value {
    let mut body = serde_json::Map::with_capacity(3);
    body.insert("fetchingId".to_string(), serde_json::Value::String(fetching_id.to_string()));
    body.insert(body_key.to_string(), serde_json::Value::Array(records));
    if let Some((key, shared)) = extra {
        body.insert(key.to_string(), serde_json::Value::Array(shared.as_ref().clone()));
    }
    serde_json::Value::Object(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_body_carries_fetching_id_and_records() {
        let body = page_body("f-1", "k8sObjects", vec![json!({"a": 1})], None);
        assert_eq!(body["fetchingId"], "f-1");
        assert_eq!(body["k8sObjects"].as_array().unwrap().len(), 1);
        assert!(body.get("k8sTypes").is_none());
    }

    #[test]
    fn page_body_repeats_extra_payload() {
        let types = Arc::new(vec![json!({"kind": "Deployment"})]);
        let body = page_body("f-1", "helmReleases", vec![], Some(&("k8sTypes", types)));
        assert_eq!(body["k8sTypes"].as_array().unwrap().len(), 1);
        assert!(body["helmReleases"].as_array().unwrap().is_empty());
    }
}
