//! `core/v1alpha:ipfs`: fetch a JSON object from the content store and merge it over the base.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use conflux_core::{template_struct, JsonMap, Params, Templated};
use conflux_pipeline::{StepContext, Transformer, TransformerFactory};
use conflux_store::ContentStore;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

pub const CREDITS: u32 = 1;
pub const DEADLINE: Duration = Duration::from_secs(3);

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ipfs://([^/]+)/?(.*)$").expect("static ipfs url regex"));
static CID_RE: Lazy<Regex> = Lazy::new(|| {
    // CIDv0, base32 CIDv1, or a hex blake3 digest from the local stores.
    Regex::new(r"^(Qm[1-9A-HJ-NP-Za-km-z]{44}|b[a-z2-7]{50,}|[0-9a-f]{64})$").expect("static cid regex")
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpfsSpec {
    #[serde(default)]
    pub url: Templated,
}
template_struct!(IpfsSpec { url });

/// Split `ipfs://<cid>/<path>` into its cid and (possibly empty) path.
pub fn parse_url(url: &str) -> Result<(String, String)> {
    let caps = URL_RE.captures(url).ok_or_else(|| anyhow!("failed to parse IPFS URL {url:?}"))?;
    Ok((caps[1].to_string(), caps[2].to_string()))
}

pub fn is_cid(s: &str) -> bool { CID_RE.is_match(s) }

pub struct IpfsFactory {
    store: Arc<dyn ContentStore>,
}

impl IpfsFactory {
    pub fn new(store: Arc<dyn ContentStore>) -> Self { Self { store } }
}

impl TransformerFactory for IpfsFactory {
    type Spec = IpfsSpec;

    fn build(&self, spec: Option<IpfsSpec>, _params: &Params) -> Result<Box<dyn Transformer>> {
        Ok(Box::new(IpfsStep { spec: spec.unwrap_or_default(), store: Arc::clone(&self.store) }))
    }
}

pub struct IpfsStep {
    spec: IpfsSpec,
    store: Arc<dyn ContentStore>,
}

#[async_trait::async_trait]
impl Transformer for IpfsStep {
    async fn execute(&self, _ctx: &StepContext, mut base: JsonMap) -> Result<JsonMap> {
        let (cid, path) = parse_url(self.spec.url.as_str())?;
        let target = if path.is_empty() { cid } else { format!("{cid}/{path}") };
        let data = self.store.get(&target).await.with_context(|| format!("fetching {target}"))?;
        let fetched: JsonMap = serde_json::from_slice(&data).with_context(|| format!("{target} is not a JSON object"))?;
        debug!(target = %target, keys = fetched.len(), "ipfs: fetched");
        base.extend(fetched);
        Ok(base)
    }

    fn validate(&self) -> Result<()> {
        let (cid, _) = parse_url(self.spec.url.as_str())?;
        anyhow::ensure!(is_cid(&cid), "invalid CID {cid:?}");
        Ok(())
    }

    fn credits_consumed(&self) -> u32 { CREDITS }

    fn deadline(&self) -> Duration { DEADLINE }
}

pub fn scaffold() -> Json { serde_json::json!({ "url": "ipfs://" }) }

/// Content store backed by an IPFS node's HTTP RPC API (`/api/v0/add`, `/api/v0/cat`).
pub struct IpfsHttpStore {
    client: reqwest::Client,
    api: String,
}

#[derive(Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

impl IpfsHttpStore {
    pub fn new(api: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("conflux/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .context("building ipfs http client")?;
        Ok(Self { client, api: api.into().trim_end_matches('/').to_string() })
    }
}

#[async_trait::async_trait]
impl ContentStore for IpfsHttpStore {
    async fn push(&self, data: Bytes) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(data.to_vec()).file_name("data.json");
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .client
            .post(format!("{}/api/v0/add?pin=true", self.api))
            .multipart(form)
            .send()
            .await
            .context("ipfs add")?
            .error_for_status()
            .context("ipfs add")?;
        let added: AddResponse = resp.json().await.context("decoding ipfs add response")?;
        Ok(added.hash)
    }

    async fn get(&self, cid: &str) -> Result<Bytes> {
        let resp = self
            .client
            .post(format!("{}/api/v0/cat", self.api))
            .query(&[("arg", cid)])
            .send()
            .await
            .with_context(|| format!("ipfs cat {cid}"))?
            .error_for_status()
            .with_context(|| format!("ipfs cat {cid}"))?;
        Ok(resp.bytes().await?)
    }
}
