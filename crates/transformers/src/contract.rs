//! `core/v1alpha:contract`: read-only smart contract call, results written at dotted paths.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use conflux_core::{template_struct, JsonMap, Params, Templated};
use conflux_pipeline::{StepContext, Transformer, TransformerFactory};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

pub const CREDITS: u32 = 3;
pub const DEADLINE: Duration = Duration::from_secs(3);

/// Typed call argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiValue {
    Int(i128),
    Address(String),
    Str(String),
    Bool(bool),
}

impl AbiValue {
    pub fn parse(kind: &str, raw: &str) -> Result<Self> {
        match kind {
            "uint256" | "int256" | "uint" | "int" => {
                raw.trim().parse::<i128>().map(AbiValue::Int).with_context(|| format!("{raw:?} is not an integer"))
            }
            "address" => {
                if !is_address(raw) { bail!("{raw:?} is not an address"); }
                Ok(AbiValue::Address(raw.to_lowercase()))
            }
            "string" => Ok(AbiValue::Str(raw.to_string())),
            "bool" => match raw {
                "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(AbiValue::Bool(true)),
                "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(AbiValue::Bool(false)),
                _ => bail!("{raw:?} is not a bool"),
            },
            other => bail!("unsupported argument type {other}"),
        }
    }
}

fn is_address(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

fn known_type(kind: &str) -> bool {
    matches!(kind, "uint256" | "int256" | "uint" | "int" | "address" | "string" | "bool")
}

/// Chain RPC collaborator. Returns one decoded JSON value per requested return type.
#[async_trait::async_trait]
pub trait ChainClient: Send + Sync {
    async fn call(&self, chain_id: u64, address: &str, signature: &str, args: &[AbiValue], returns: &[String]) -> Result<Vec<Json>>;
}

/// Client used when no RPC endpoint is configured; every call fails.
pub struct NoChainClient;

#[async_trait::async_trait]
impl ChainClient for NoChainClient {
    async fn call(&self, chain_id: u64, _address: &str, signature: &str, _args: &[AbiValue], _returns: &[String]) -> Result<Vec<Json>> {
        Err(anyhow!("no RPC client configured for chain {chain_id} (calling {signature})"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Arg {
    #[serde(rename = "type")]
    pub kind: Templated,
    pub value: Templated,
}
template_struct!(Arg { kind, value });

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ret {
    pub name: Templated,
    #[serde(rename = "type")]
    pub kind: Templated,
}
template_struct!(Ret { name, kind });

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractSpec {
    #[serde(default)]
    pub address: Templated,
    #[serde(default)]
    pub chain_id: u64,
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub args: Vec<Arg>,
    #[serde(default)]
    pub returns: Vec<Ret>,
}
template_struct!(ContractSpec { address, chain_id, function, args, returns });

impl ContractSpec {
    /// `name(type,...)`
    pub fn signature(&self) -> String {
        let types: Vec<&str> = self.args.iter().map(|a| a.kind.as_str()).collect();
        format!("{}({})", self.function, types.join(","))
    }

    pub fn arg_values(&self) -> Result<Vec<AbiValue>> {
        self.args.iter().map(|a| AbiValue::parse(a.kind.as_str(), a.value.as_str())).collect()
    }

    pub fn return_types(&self) -> Vec<String> { self.returns.iter().map(|r| r.kind.as_str().to_string()).collect() }
}

/// Set `value` at dotted `path`, creating intermediate objects and
/// replacing non-object intermediates.
pub fn set_path(map: &mut JsonMap, path: &str, value: Json) {
    let mut parts = path.split('.').peekable();
    let mut cur = map;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            cur.insert(part.to_string(), value);
            return;
        }
        let slot = cur.entry(part.to_string()).or_insert_with(|| Json::Object(JsonMap::new()));
        if !slot.is_object() {
            *slot = Json::Object(JsonMap::new());
        }
        let Json::Object(next) = slot else { return };
        cur = next;
    }
}

pub struct ContractFactory {
    client: Arc<dyn ChainClient>,
}

impl ContractFactory {
    pub fn new(client: Arc<dyn ChainClient>) -> Self { Self { client } }
}

impl TransformerFactory for ContractFactory {
    type Spec = ContractSpec;

    fn build(&self, spec: Option<ContractSpec>, _params: &Params) -> Result<Box<dyn Transformer>> {
        Ok(Box::new(ContractStep { spec: spec.unwrap_or_default(), client: Arc::clone(&self.client) }))
    }
}

pub struct ContractStep {
    spec: ContractSpec,
    client: Arc<dyn ChainClient>,
}

#[async_trait::async_trait]
impl Transformer for ContractStep {
    async fn execute(&self, _ctx: &StepContext, mut base: JsonMap) -> Result<JsonMap> {
        let signature = self.spec.signature();
        let args = self.spec.arg_values()?;
        let address = self.spec.address.as_str();
        let values = self
            .client
            .call(self.spec.chain_id, address, &signature, &args, &self.spec.return_types())
            .await
            .with_context(|| format!("calling {signature} on {address}"))?;
        if values.len() != self.spec.returns.len() {
            bail!("{signature} returned {} values, expected {}", values.len(), self.spec.returns.len());
        }
        for (ret, value) in self.spec.returns.iter().zip(values) {
            set_path(&mut base, ret.name.as_str(), value);
        }
        debug!(signature = %signature, chain_id = self.spec.chain_id, "contract: call ok");
        Ok(base)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.spec.function.is_empty(), "function is required");
        let addr = self.spec.address.as_str();
        if !addr.contains("{{") {
            anyhow::ensure!(is_address(addr), "invalid address {addr:?}");
        }
        for a in &self.spec.args {
            anyhow::ensure!(known_type(a.kind.as_str()), "unsupported argument type {}", a.kind);
        }
        for r in &self.spec.returns {
            anyhow::ensure!(known_type(r.kind.as_str()), "unsupported return type {}", r.kind);
            anyhow::ensure!(!r.name.is_empty(), "return name is required");
        }
        Ok(())
    }

    fn credits_consumed(&self) -> u32 { CREDITS }

    fn deadline(&self) -> Duration { DEADLINE }
}

pub fn scaffold() -> Json {
    serde_json::json!({
        "address": "{{contract}}",
        "chainId": 80001,
        "function": "tokenURI",
        "args": [{"type": "uint256", "value": "{{id}}"}],
        "returns": [{"name": "uri", "type": "string"}]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_and_args() {
        let spec: ContractSpec = serde_json::from_value(json!({
            "address": "0x00000000000000000000000000000000000000aa",
            "chainId": 1,
            "function": "balanceOf",
            "args": [{"type": "address", "value": "0x00000000000000000000000000000000000000AB"}, {"type": "bool", "value": "t"}],
            "returns": [{"name": "a.b", "type": "uint256"}]
        }))
        .unwrap();
        assert_eq!(spec.signature(), "balanceOf(address,bool)");
        assert_eq!(
            spec.arg_values().unwrap(),
            vec![AbiValue::Address("0x00000000000000000000000000000000000000ab".into()), AbiValue::Bool(true)]
        );
        assert!(AbiValue::parse("uint256", "x").is_err());
        assert!(AbiValue::parse("bytes32", "0x").is_err());
    }

    #[test]
    fn dotted_paths_nest() {
        let mut m = JsonMap::new();
        m.insert("a".into(), json!(1));
        set_path(&mut m, "a.b.c", json!("x"));
        set_path(&mut m, "top", json!(true));
        assert_eq!(Json::Object(m), json!({"a": {"b": {"c": "x"}}, "top": true}));
    }
}
