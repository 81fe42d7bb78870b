use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use conflux_api::{ConfluxApi, ConfluxError, Service};
use conflux_core::params::{PARAM_CONTRACT, PARAM_ID, PARAM_MANIFEST_CID};
use conflux_core::{Manifest, Params};
use conflux_hooks::HookDispatcher;
use conflux_pipeline::Registry;
use conflux_store::{content_id, Cache, ContentStore, MemoryContentStore, Resolver};
use conflux_transformers::{register_builtins, Builtins, IpfsHttpStore, NoChainClient};
use serde_json::Value as Json;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "conflux", version, about = "Conflux dynamic metadata CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// IPFS HTTP API used by `ipfs` steps; the local SQLite store is used when unset
    #[arg(long = "ipfs-api", env = "CONFLUX_IPFS_API", global = true)]
    ipfs_api: Option<String>,

    /// Run `container` steps as Kubernetes pods
    #[arg(long = "sandbox", action = ArgAction::SetTrue, global = true)]
    sandbox: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a manifest's pipeline locally and print the result
    Run {
        /// Manifest file (.json, .yaml or .yml)
        manifest: PathBuf,
        /// Token id seeded as `id`
        #[arg(long = "id", default_value = "1")]
        id: String,
        /// Extra params, `key=value` (value parsed as JSON when possible)
        #[arg(long = "param", short = 'p')]
        params: Vec<String>,
    },
    /// Validate every step of a manifest
    Validate { manifest: PathBuf },
    /// Sum the credit cost of a manifest
    Credits {
        manifest: PathBuf,
        /// Fail on unregistered kinds instead of reporting 0
        #[arg(long = "strict", action = ArgAction::SetTrue)]
        strict: bool,
    },
    /// List registered transformer kinds
    Kinds,
    /// Create or update a manifest in the local store
    Publish {
        manifest: PathBuf,
        #[arg(long = "owner", env = "CONFLUX_OWNER")]
        owner: String,
    },
    /// Read token metadata through the cache
    Get {
        chain_id: u64,
        contract: String,
        token_id: String,
    },
}

fn init_tracing() {
    let env = std::env::var("CONFLUX_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CONFLUX_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CONFLUX_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"));
    if yaml {
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {} as YAML", path.display()))
    } else {
        serde_json::from_str(&raw).with_context(|| format!("parsing {} as JSON", path.display()))
    }
}

fn parse_param(kv: &str) -> Result<(String, Json)> {
    let Some((k, v)) = kv.split_once('=') else { bail!("param {kv:?} must be key=value") };
    let value = serde_json::from_str(v).unwrap_or_else(|_| Json::String(v.to_string()));
    Ok((k.trim().to_string(), value))
}

impl Commands {
    /// Commands that read or write the local store.
    fn needs_store(&self) -> bool { matches!(self, Commands::Run { .. } | Commands::Publish { .. } | Commands::Get { .. }) }
}

/// IPFS when configured, else SQLite for commands that touch persistence,
/// else an in-memory store so registry-only commands open nothing on disk.
fn content_store(cli: &Cli) -> Result<Arc<dyn ContentStore>> {
    Ok(match &cli.ipfs_api {
        Some(api) => Arc::new(IpfsHttpStore::new(api.as_str())?),
        None if cli.command.needs_store() => Arc::new(conflux_persist::SqliteContentStore::open_default()?),
        None => Arc::new(MemoryContentStore::new()),
    })
}

async fn build_registry(cli: &Cli, content: Arc<dyn ContentStore>) -> Result<Registry> {
    let sandbox = if cli.sandbox {
        let rt = conflux_sandbox::KubeRuntime::try_default().await?;
        Some(conflux_sandbox::TaskExecutor::new(Arc::new(rt)))
    } else {
        None
    };
    let mut registry = Registry::new();
    register_builtins(&mut registry, Builtins { content, chain: Arc::new(NoChainClient), sandbox })?;
    Ok(registry)
}

fn print_json(v: &Json) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let t0 = Instant::now();

    let content = content_store(&cli)?;
    let registry = build_registry(&cli, Arc::clone(&content)).await?;

    match &cli.command {
        Commands::Run { manifest, id, params } => {
            let m = load_manifest(manifest)?;
            let mut p = Params::new()
                .with(PARAM_ID, id.as_str())
                .with(PARAM_CONTRACT, m.normalized_contract())
                .with(PARAM_MANIFEST_CID, content_id(&serde_json::to_vec(&m)?));
            for kv in params {
                let (k, v) = parse_param(kv)?;
                p.insert(k, v);
            }
            info!(steps = m.transformers.len(), credits = registry.calculate_credits(&m.transformers), "run: starting");
            let out = tokio::select! {
                r = registry.execute(&m.transformers, p) => r?,
                _ = signal::ctrl_c() => bail!("interrupted"),
            };
            print_json(&Json::Object(out))?;
        }
        Commands::Validate { manifest } => {
            let m = load_manifest(manifest)?;
            if !m.valid_version() {
                bail!("unsupported manifest version {:?}", m.version);
            }
            match registry.validate(&m.transformers) {
                Ok(()) => println!("ok: {} steps", m.transformers.len()),
                Err(e) => {
                    error!(error = %e, "validate failed");
                    bail!("{e}");
                }
            }
        }
        Commands::Credits { manifest, strict } => {
            let m = load_manifest(manifest)?;
            let credits = if *strict { registry.try_calculate_credits(&m.transformers)? } else { registry.calculate_credits(&m.transformers) };
            match cli.output {
                Output::Human => println!("{credits}"),
                Output::Json => print_json(&serde_json::json!({ "credits": credits }))?,
            }
        }
        Commands::Kinds => {
            let rows: Vec<Json> = registry
                .registered()
                .into_iter()
                .filter_map(|gvk| {
                    let info = registry.get(&gvk)?;
                    Some(serde_json::json!({
                        "gvk": gvk.to_string(),
                        "credits": info.credits,
                        "deadlineMs": info.deadline.as_millis() as u64,
                        "prompt": info.prompt.is_some(),
                    }))
                })
                .collect();
            match cli.output {
                Output::Human => {
                    for r in &rows {
                        println!("{} • {} credits • {}ms • prompt={}", r["gvk"].as_str().unwrap_or(""), r["credits"], r["deadlineMs"], r["prompt"]);
                    }
                }
                Output::Json => print_json(&Json::Array(rows))?,
            }
        }
        Commands::Publish { manifest, owner } => {
            let m = load_manifest(manifest)?;
            let (svc, hooks) = service(registry, content)?;
            let cid = match svc.create_manifest(m.clone(), owner).await {
                Err(ConfluxError::AlreadyExists(_)) => svc.update_manifest(m.chain_id, &m.contract.clone(), m, owner).await?,
                other => other?,
            };
            println!("{cid}");
            drain_hooks(svc, hooks).await;
        }
        Commands::Get { chain_id, contract, token_id } => {
            let (svc, hooks) = service(registry, content)?;
            print_json(&svc.get_metadata(*chain_id, contract, token_id).await?)?;
            drain_hooks(svc, hooks).await;
        }
    }
    info!(took_ms = %t0.elapsed().as_millis(), "conflux: done");
    Ok(())
}

fn service(registry: Registry, content: Arc<dyn ContentStore>) -> Result<(Service, Arc<HookDispatcher>)> {
    let resolver: Arc<dyn Resolver> = Arc::new(conflux_persist::SqliteResolver::open_default(conflux_core::clock::system_clock())?);
    let hooks = Arc::new(HookDispatcher::start(Arc::new(conflux_hooks::default_registry()?)));
    let svc = Service::new(Arc::new(registry), resolver, Cache::new(content)).with_hooks(Arc::clone(&hooks));
    Ok((svc, hooks))
}

/// Let dispatched hooks finish before the process exits.
async fn drain_hooks(svc: Service, hooks: Arc<HookDispatcher>) {
    drop(svc);
    match Arc::try_unwrap(hooks) {
        Ok(d) => d.shutdown().await,
        Err(_) => tracing::warn!("hooks: dispatcher still shared, not draining"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_persistent_commands_open_the_store() {
        let cli = Cli::parse_from(["conflux", "kinds"]);
        assert!(!cli.command.needs_store());
        let cli = Cli::parse_from(["conflux", "credits", "m.yaml", "--strict"]);
        assert!(!cli.command.needs_store());
        let cli = Cli::parse_from(["conflux", "validate", "m.yaml"]);
        assert!(!cli.command.needs_store());
        let cli = Cli::parse_from(["conflux", "get", "1", "0xab", "7"]);
        assert!(cli.command.needs_store());
        let cli = Cli::parse_from(["conflux", "run", "m.json", "--id", "3"]);
        assert!(cli.command.needs_store());
    }

    #[test]
    fn params_parse_json_or_string() {
        assert_eq!(parse_param("n=3").unwrap(), ("n".to_string(), json!(3)));
        assert_eq!(parse_param("name=bob").unwrap(), ("name".to_string(), json!("bob")));
        assert_eq!(parse_param("o={\"a\":1}").unwrap().1, json!({"a": 1}));
        assert!(parse_param("novalue").is_err());
    }

    #[test]
    fn manifests_load_from_yaml_and_json() {
        let dir = std::env::temp_dir().join(format!("conflux-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let yaml = dir.join("m.yaml");
        std::fs::write(&yaml, "version: v1alpha\ncontract: \"0xAB\"\nchainId: 5\ntransformers:\n  - gvk: core/v1alpha:print\n    spec: {}\n").unwrap();
        let json_path = dir.join("m.json");
        std::fs::write(&json_path, r#"{"version":"v1alpha","contract":"0xAB","chainId":5}"#).unwrap();

        let a = load_manifest(&yaml).unwrap();
        assert_eq!(a.chain_id, 5);
        assert_eq!(a.transformers.len(), 1);
        let b = load_manifest(&json_path).unwrap();
        assert_eq!(b.normalized_contract(), "0xab");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
