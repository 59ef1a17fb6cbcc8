//! Helm release collector.
//!
//! Helm 3 stores one secret per release revision (`helm.sh/release.v1`),
//! with the release document base64'd and usually gzip'd inside the
//! `release` key. The collector decodes every revision, keeps the newest one
//! per release and trims the bulky chart payload.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::io::Read;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, warn};

use kollect_core::{Config, DataCollector, Record, ResourceKind};

const HELM_SECRET_TYPE: &str = "helm.sh/release.v1";
const LIST_PAGE_LIMIT: u32 = 200;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub struct HelmCollector {
    client: Client,
}

impl HelmCollector {
    pub fn new(client: Client) -> HelmCollector {
        HelmCollector { client }
    }
}

#[async_trait::async_trait]
impl DataCollector for HelmCollector {
    fn source(&self) -> &'static str {
        "helm"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::HelmReleases
    }

    async fn collect(&self, _conf: &Config) -> Result<Vec<Record>> {
        let secrets: Api<Secret> = Api::all(self.client.clone());
        let mut params = ListParams::default()
            .fields(&format!("type={HELM_SECRET_TYPE}"))
            .limit(LIST_PAGE_LIMIT);

        // (namespace, release) -> (revision, decoded release)
        let mut latest: BTreeMap<(String, String), (u64, Record)> = BTreeMap::new();
        loop {
            let page = secrets.list(&params).await.context("listing helm release secrets")?;
            let continue_token = page.metadata.continue_.clone();
            for secret in page.items {
                let secret_name = secret.metadata.name.clone().unwrap_or_default();
                match release_from_secret(&secret) {
                    Ok(Some(entry)) => {
                        let key = (entry.namespace.clone(), entry.name.clone());
                        match latest.get(&key) {
                            Some((revision, _)) if *revision >= entry.revision => {}
                            _ => {
                                latest.insert(key, (entry.revision, entry.release));
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(secret = %secret_name, error = %err, "decoding helm release failed")
                    }
                }
            }
            match continue_token {
                Some(token) if !token.is_empty() => params.continue_token = Some(token),
                _ => break,
            }
        }

        let releases: Vec<Record> = latest.into_values().map(|(_, release)| release).collect();
        debug!(releases = releases.len(), "helm releases collected");
        Ok(releases)
    }
}

struct ReleaseEntry {
    namespace: String,
    name: String,
    revision: u64,
    release: Record,
}

/// Decode the release document out of one revision secret. Returns `None`
/// for secrets without a `release` payload.
fn release_from_secret(secret: &Secret) -> Result<Option<ReleaseEntry>> {
    let payload = match secret.data.as_ref().and_then(|data| data.get("release")) {
        Some(payload) => &payload.0,
        None => return Ok(None),
    };
    let mut release = decode_release(payload)?;
    trim_chart(&mut release);

    let name = release
        .get("name")
        .and_then(|n| n.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("release document has no name"))?;
    let namespace = release
        .get("namespace")
        .and_then(|n| n.as_str())
        .or(secret.metadata.namespace.as_deref())
        .unwrap_or_default()
        .to_string();
    let revision = release.get("version").and_then(|v| v.as_u64()).unwrap_or(0);

    Ok(Some(ReleaseEntry { namespace, name, revision, release }))
}

/// The secret value is base64 text wrapping the (optionally gzip'd) release
/// JSON; the outer base64 layer was already removed by the API machinery.
fn decode_release(raw: &[u8]) -> Result<Record> {
    let decoded = BASE64
        .decode(raw.iter().filter(|b| !b.is_ascii_whitespace()).copied().collect::<Vec<u8>>())
        .context("base64-decoding release payload")?;
    let document = if decoded.starts_with(&GZIP_MAGIC) {
        let mut decoder = flate2::read::GzDecoder::new(&decoded[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).context("gunzipping release payload")?;
        out
    } else {
        decoded
    };
    serde_json::from_slice(&document).context("parsing release document")
}

/// Rendered templates and packaged files dominate the document's size and
/// are not needed server-side.
fn trim_chart(release: &mut Record) {
    if let Some(chart) = release.get_mut("chart").and_then(|c| c.as_object_mut()) {
        chart.remove("templates");
        chart.remove("files");
    }
}
