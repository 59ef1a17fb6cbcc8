#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kollect_core::{paginate, Config, DataCollector, Record, ResourceKind};
use kollect_redact::RedactionEngine;
use kollect_session::{
    upload_pages, ApiError, Backend, ClusterIdentity, Negotiation, Outcome, PageUpload, PhasePlan,
    SessionError, SessionRunner, SkipReason, UploadContext, UploadRoute,
};

fn test_config() -> Arc<Config> {
    Arc::new(Config {
        access_key: "ak".into(),
        secret_key: "sk".into(),
        api_endpoint: "http://backend.invalid".into(),
        login_endpoint: "http://auth.invalid".into(),
        page_size: 1, // 1000-byte pages keep the tests multi-page
        objects_concurrency: 3,
        helm_concurrency: 2,
        max_retries: 0,
        page_timeout: Duration::from_secs(5),
        override_unique_cluster_id: false,
        dry_run: false,
        redaction_rules: None,
    })
}

/// In-memory backend that tracks concurrency and can fail chosen sends.
#[derive(Default)]
struct FakeBackend {
    send_trees: bool,
    negotiation_error: Mutex<Option<ApiError>>,
    /// 0-based send ordinal (per route) that should fail.
    fail_send: Mutex<Option<(UploadRoute, usize)>>,
    pages: Mutex<Vec<PageUpload>>,
    sends: AtomicUsize,
    ok_sends: AtomicUsize,
    locks: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeBackend {
    fn new(send_trees: bool) -> Self {
        FakeBackend { send_trees, ..Default::default() }
    }

    fn pages_for(&self, route: UploadRoute) -> Vec<PageUpload> {
        self.pages.lock().unwrap().iter().filter(|p| p.route == route).cloned().collect()
    }
}

#[async_trait::async_trait]
impl Backend for FakeBackend {
    async fn negotiate(
        &self,
        _unique_cluster_id: &str,
        _fetching_id: &str,
        _override_unique_cluster_id: bool,
    ) -> Result<Negotiation, ApiError> {
        if let Some(err) = self.negotiation_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(Negotiation { integration_id: "itg-1".into(), send_trees: self.send_trees })
    }

    async fn send_page(&self, page: &PageUpload) -> Result<(), ApiError> {
        let level = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(level, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let ordinal = {
            let mut pages = self.pages.lock().unwrap();
            let seen = pages.iter().filter(|p| p.route == page.route).count();
            pages.push(page.clone());
            seen
        };
        self.sends.fetch_add(1, Ordering::SeqCst);

        if let Some((route, failing)) = *self.fail_send.lock().unwrap() {
            if route == page.route && ordinal == failing {
                return Err(ApiError::UnexpectedStatus { status: 500, body: "boom".into() });
            }
        }
        self.ok_sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn lock(&self, _fetching_id: &str, _integration_id: &str) -> Result<(), ApiError> {
        self.locks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FixedIdentity;

#[async_trait::async_trait]
impl ClusterIdentity for FixedIdentity {
    async fn unique_cluster_id(&self) -> anyhow::Result<String> {
        Ok("uid-123".into())
    }
}

struct StaticCollector {
    source: &'static str,
    kind: ResourceKind,
    records: Vec<Record>,
    fail: bool,
}

impl StaticCollector {
    fn ok(source: &'static str, kind: ResourceKind, records: Vec<Record>) -> Box<Self> {
        Box::new(StaticCollector { source, kind, records, fail: false })
    }

    fn failing(source: &'static str, kind: ResourceKind) -> Box<Self> {
        Box::new(StaticCollector { source, kind, records: Vec::new(), fail: true })
    }
}

#[async_trait::async_trait]
impl DataCollector for StaticCollector {
    fn source(&self) -> &'static str {
        self.source
    }

    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn collect(&self, _conf: &Config) -> anyhow::Result<Vec<Record>> {
        if self.fail {
            anyhow::bail!("{} is unavailable", self.source);
        }
        Ok(self.records.clone())
    }
}

fn objects(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            serde_json::json!({
                "kind": "ConfigMap",
                "metadata": { "name": format!("cm-{i}"), "uid": format!("u-{i}") },
                "data": { "payload": "x".repeat(300) }
            })
        })
        .collect()
}

fn runner(conf: Arc<Config>, collectors: Vec<Box<dyn DataCollector>>) -> SessionRunner {
    SessionRunner::new(
        "prod-eu-1",
        conf,
        Arc::new(RedactionEngine::builtin()),
        Arc::new(FixedIdentity),
        collectors,
        Vec::new(),
    )
}

fn upload_ctx() -> UploadContext {
    UploadContext {
        cluster_id: "prod-eu-1".into(),
        fetching_id: "f-1".into(),
        integration_id: "itg-1".into(),
    }
}

fn objects_plan(concurrency: usize) -> PhasePlan {
    PhasePlan {
        kind: ResourceKind::Objects,
        route: UploadRoute::Objects,
        body_key: "k8sObjects",
        extra: None,
        concurrency,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn uploader_respects_the_concurrency_gate() {
    let backend = Arc::new(FakeBackend::new(true));
    let (pages, _) = paginate(ResourceKind::Objects, objects(40), 1000);
    assert!(pages.len() > 8, "need enough pages to stress the gate");

    let sent = upload_pages(backend.clone(), &upload_ctx(), &objects_plan(3), pages)
        .await
        .unwrap();
    assert_eq!(sent, backend.sends.load(Ordering::SeqCst));
    assert!(
        backend.max_in_flight.load(Ordering::SeqCst) <= 3,
        "observed {} concurrent sends",
        backend.max_in_flight.load(Ordering::SeqCst)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_failing_page_fails_the_phase_but_siblings_complete() {
    let backend = Arc::new(FakeBackend::new(true));
    *backend.fail_send.lock().unwrap() = Some((UploadRoute::Objects, 2));
    let (pages, _) = paginate(ResourceKind::Objects, objects(20), 1000);
    let total = pages.len();
    assert!(total >= 4);

    let result = upload_pages(backend.clone(), &upload_ctx(), &objects_plan(2), pages).await;
    assert!(matches!(result, Err(ApiError::UnexpectedStatus { status: 500, .. })));
    assert_eq!(backend.sends.load(Ordering::SeqCst), total, "all siblings still ran");
    assert_eq!(backend.ok_sends.load(Ordering::SeqCst), total - 1);
}

#[tokio::test]
async fn empty_page_list_uploads_nothing_and_succeeds() {
    let backend = Arc::new(FakeBackend::new(true));
    let sent = upload_pages(backend.clone(), &upload_ctx(), &objects_plan(4), Vec::new())
        .await
        .unwrap();
    assert_eq!(sent, 0);
    assert_eq!(backend.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn completed_session_uploads_phases_in_order_and_locks() {
    let backend = Arc::new(FakeBackend::new(true));
    let session = runner(
        test_config(),
        vec![
            StaticCollector::ok("kubernetes", ResourceKind::Objects, objects(6)),
            StaticCollector::ok(
                "helm",
                ResourceKind::HelmReleases,
                vec![serde_json::json!({"name": "db", "chart": "postgres-12.1.0"})],
            ),
            StaticCollector::ok(
                "types",
                ResourceKind::Types,
                vec![serde_json::json!({"kind": "ConfigMap", "version": "v1"})],
            ),
        ],
    );

    let outcome = session.execute(backend.clone()).await.unwrap();
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(backend.locks.load(Ordering::SeqCst), 1);

    // Helm pages carry the type metadata alongside the releases.
    let helm_pages = backend.pages_for(UploadRoute::Helm);
    assert!(!helm_pages.is_empty());
    for page in &helm_pages {
        assert_eq!(page.body["fetchingId"], helm_pages[0].body["fetchingId"]);
        assert!(page.body["helmReleases"].is_array());
        assert_eq!(page.body["k8sTypes"].as_array().unwrap().len(), 1);
        assert_eq!(page.integration_id, "itg-1");
    }

    // Objects pages reassemble into the collected set.
    let object_pages = backend.pages_for(UploadRoute::Objects);
    let uploaded: usize =
        object_pages.iter().map(|p| p.body["k8sObjects"].as_array().unwrap().len()).sum();
    assert_eq!(uploaded, 6);

    // Helm phase strictly precedes trees, trees precede objects.
    let routes: Vec<UploadRoute> =
        backend.pages.lock().unwrap().iter().map(|p| p.route).collect();
    let last_helm = routes.iter().rposition(|r| *r == UploadRoute::Helm).unwrap();
    let first_tree = routes.iter().position(|r| *r == UploadRoute::Tree);
    let first_objects = routes.iter().position(|r| *r == UploadRoute::Objects).unwrap();
    if let Some(first_tree) = first_tree {
        assert!(last_helm < first_tree);
        assert!(first_tree < first_objects);
    } else {
        assert!(last_helm < first_objects);
    }
}

#[tokio::test]
async fn objects_page_failure_prevents_the_lock() {
    let backend = Arc::new(FakeBackend::new(true));
    *backend.fail_send.lock().unwrap() = Some((UploadRoute::Objects, 0));
    let session = runner(
        test_config(),
        vec![StaticCollector::ok("kubernetes", ResourceKind::Objects, objects(6))],
    );

    let result = session.execute(backend.clone()).await;
    assert!(matches!(
        result,
        Err(SessionError::Upload { kind: ResourceKind::Objects, .. })
    ));
    assert_eq!(backend.locks.load(Ordering::SeqCst), 0, "finalize must not run");
}

#[tokio::test]
async fn backend_tree_flag_disables_the_tree_phase() {
    let backend = Arc::new(FakeBackend::new(false));
    let session = runner(
        test_config(),
        vec![StaticCollector::ok("kubernetes", ResourceKind::Objects, objects(3))],
    );

    session.execute(backend.clone()).await.unwrap();
    assert!(backend.pages_for(UploadRoute::Tree).is_empty());
    assert!(!backend.pages_for(UploadRoute::Objects).is_empty());
}

#[tokio::test]
async fn soft_skip_statuses_end_the_session_cleanly() {
    for (err, reason) in [
        (ApiError::NotReady, SkipReason::NotReady),
        (ApiError::Suspended, SkipReason::Suspended),
        (ApiError::DuplicateClusterId, SkipReason::DuplicateClusterId),
    ] {
        let backend = Arc::new(FakeBackend::new(true));
        *backend.negotiation_error.lock().unwrap() = Some(err);
        let session = runner(
            test_config(),
            vec![StaticCollector::ok("kubernetes", ResourceKind::Objects, objects(2))],
        );

        let outcome = session.execute(backend.clone()).await.unwrap();
        assert_eq!(outcome, Outcome::Skipped(reason));
        assert_eq!(backend.sends.load(Ordering::SeqCst), 0, "no pages after a skip");
        assert_eq!(backend.locks.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn unexpected_negotiation_status_is_fatal() {
    let backend = Arc::new(FakeBackend::new(true));
    *backend.negotiation_error.lock().unwrap() =
        Some(ApiError::UnexpectedStatus { status: 401, body: "no".into() });
    let session = runner(test_config(), Vec::new());

    assert!(matches!(
        session.execute(backend).await,
        Err(SessionError::Negotiation(_))
    ));
}

#[tokio::test]
async fn helm_collector_failure_degrades_to_empty() {
    let backend = Arc::new(FakeBackend::new(true));
    let session = runner(
        test_config(),
        vec![
            StaticCollector::failing("helm", ResourceKind::HelmReleases),
            StaticCollector::ok("kubernetes", ResourceKind::Objects, objects(2)),
        ],
    );

    let outcome = session.execute(backend.clone()).await.unwrap();
    assert_eq!(outcome, Outcome::Completed);
    assert!(backend.pages_for(UploadRoute::Helm).is_empty());
    assert!(!backend.pages_for(UploadRoute::Objects).is_empty());
}

#[tokio::test]
async fn non_helm_collector_failure_is_fatal() {
    let backend = Arc::new(FakeBackend::new(true));
    let session = runner(
        test_config(),
        vec![StaticCollector::failing("kubernetes", ResourceKind::Objects)],
    );

    assert!(matches!(
        session.execute(backend.clone()).await,
        Err(SessionError::Collector { source_name: "kubernetes", .. })
    ));
    assert_eq!(backend.sends.load(Ordering::SeqCst), 0);
}
