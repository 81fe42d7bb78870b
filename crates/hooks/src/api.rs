//! `api` hook: one HTTP request per generation, checked against an expected status.

use std::time::Duration;

use anyhow::Context;
use conflux_core::{template_struct, Params, Templated};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

use crate::error::HookError;
use crate::hook::{decode_templated, Hook, HookFactory};

pub const KIND: &str = "api";

fn default_method() -> String { "GET".into() }
fn default_status() -> u16 { 200 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiHookSpec {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub target: Templated,
    #[serde(default = "default_status")]
    pub status: u16,
}
template_struct!(ApiHookSpec { method, target, status });

impl ApiHookSpec {
    /// Upper-cased request method; blank means GET.
    pub fn http_method(&self) -> String {
        let m = self.method.trim();
        if m.is_empty() { default_method() } else { m.to_uppercase() }
    }
}

pub struct ApiHookFactory {
    client: reqwest::Client,
}

impl ApiHookFactory {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("conflux/0.1")
            .timeout(Duration::from_secs(10))
            .build()
            .context("building hook http client")?;
        Ok(Self { client })
    }
}

impl HookFactory for ApiHookFactory {
    fn build(&self, kind: &str, spec: &Json, params: &Params) -> Result<Box<dyn Hook>, HookError> {
        let spec: ApiHookSpec = decode_templated(kind, spec, params)?;
        Ok(Box::new(ApiHook { spec, client: self.client.clone() }))
    }
}

pub struct ApiHook {
    spec: ApiHookSpec,
    client: reqwest::Client,
}

#[async_trait::async_trait]
impl Hook for ApiHook {
    async fn execute(&self) -> anyhow::Result<()> {
        let method = self.spec.http_method();
        let target = self.spec.target.as_str().to_string();
        let m = reqwest::Method::from_bytes(method.as_bytes()).with_context(|| format!("invalid method {method:?}"))?;
        let resp = self
            .client
            .request(m, &target)
            .send()
            .await
            .map_err(|source| HookError::Transport { method: method.clone(), target: target.clone(), source })?;
        let found = resp.status().as_u16();
        if found != self.spec.status {
            return Err(HookError::UnexpectedStatus { method, target, expected: self.spec.status, found }.into());
        }
        debug!(method = %method, target = %target, status = found, "hooks: api ok");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn target_is_templated_and_defaults_apply() {
        let params = Params::new().with("id", "9");
        let spec: ApiHookSpec = decode_templated(KIND, &json!({"target": "http://hooks.local/{{id}}"}), &params).unwrap();
        assert_eq!(spec.target.as_str(), "http://hooks.local/9");
        assert_eq!(spec.http_method(), "GET");
        assert_eq!(spec.status, 200);
    }

    #[test]
    fn blank_method_is_get() {
        let spec: ApiHookSpec = decode_templated(KIND, &json!({"method": " ", "target": "http://x"}), &Params::new()).unwrap();
        assert_eq!(spec.http_method(), "GET");
        let spec: ApiHookSpec = decode_templated(KIND, &json!({"method": "put", "target": "http://x"}), &Params::new()).unwrap();
        assert_eq!(spec.http_method(), "PUT");
    }

    #[test]
    fn unknown_placeholder_is_a_templating_error() {
        let err = decode_templated::<ApiHookSpec>(KIND, &json!({"target": "{{missing}}"}), &Params::new()).unwrap_err();
        assert!(matches!(err, HookError::TemplatingFailed { .. }));
    }

    #[tokio::test]
    async fn refused_connection_is_transport() {
        let f = ApiHookFactory::new().unwrap();
        let hook = f.build(KIND, &json!({"method": "get", "target": "http://127.0.0.1:1/x"}), &Params::new()).unwrap();
        let err = hook.execute().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<HookError>(), Some(HookError::Transport { .. })));
    }
}
