use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use conflux_core::params::{PARAM_CONTRACT, PARAM_ID, PARAM_MANIFEST_CID, PARAM_RESULT};
use conflux_core::{Manifest, Params};
use conflux_hooks::HookDispatcher;
use conflux_pipeline::{PipelineError, Registry};
use conflux_store::{alias_key, manifest_key, token_key, Cache, Resolved, Resolver};
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::{ConfluxApi, ConfluxError, ConfluxResult};

/// In-process implementation of [`ConfluxApi`].
pub struct Service {
    registry: Arc<Registry>,
    resolver: Arc<dyn Resolver>,
    cache: Cache,
    hooks: Option<Arc<HookDispatcher>>,
    generations: AtomicU64,
}

impl Service {
    pub fn new(registry: Arc<Registry>, resolver: Arc<dyn Resolver>, cache: Cache) -> Self {
        Self { registry, resolver, cache, hooks: None, generations: AtomicU64::new(0) }
    }

    pub fn with_hooks(mut self, hooks: Arc<HookDispatcher>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn registry(&self) -> &Registry { &self.registry }

    /// Pipeline runs performed by this service so far.
    pub fn generations(&self) -> u64 { self.generations.load(Ordering::Relaxed) }

    /// Run the manifest's pipeline for one token, cache the result under the
    /// token key with the manifest's refresh ttl, then hand hooks to the dispatcher.
    pub async fn generate(&self, manifest: &Manifest, manifest_cid: &str, token_id: &str) -> ConfluxResult<Json> {
        let t0 = Instant::now();
        let contract = manifest.normalized_contract();
        let credits = self.registry.calculate_credits(&manifest.transformers);
        info!(contract = %contract, token = %token_id, credits, "api: generate");

        let params = Params::new()
            .with(PARAM_ID, token_id)
            .with(PARAM_CONTRACT, contract.clone())
            .with(PARAM_MANIFEST_CID, manifest_cid);
        self.generations.fetch_add(1, Ordering::Relaxed);
        let result = self.registry.execute(&manifest.transformers, params.clone()).await?;
        let result = Json::Object(result);

        let cid = self.cache.push(&result).await?;
        let ttl = manifest.config.refresh_after.to_minutes();
        self.resolver.set(&token_key(&contract, token_id), &cid, ttl)?;
        counter!("api_generations_total", 1u64);

        if let Some(hooks) = &self.hooks {
            if !manifest.hooks.is_empty() {
                let hook_params = params.with(PARAM_RESULT, result.clone());
                let accepted = hooks.dispatch(&manifest.hooks, &hook_params);
                debug!(accepted, total = manifest.hooks.len(), "api: hooks dispatched");
            }
        }
        info!(contract = %contract, token = %token_id, cid = %cid, ttl_minutes = ttl, took_ms = %t0.elapsed().as_millis(), "api: generate ok");
        Ok(result)
    }

    /// Current content id and decoded manifest at the canonical key.
    async fn load_manifest(&self, chain_id: u64, contract: &str) -> ConfluxResult<(String, Manifest)> {
        let key = manifest_key(chain_id, contract);
        let cid = match self.resolver.get(&key)? {
            Resolved::Fresh(cid) | Resolved::Expired(cid) => cid,
            Resolved::NotFound => return Err(ConfluxError::NotFound(format!("manifest {chain_id}/{contract}"))),
        };
        let manifest: Manifest = self.cache.get(&cid).await?;
        Ok((cid, manifest))
    }

    async fn load_owned(&self, chain_id: u64, contract: &str, owner: &str) -> ConfluxResult<(String, Manifest)> {
        let (cid, manifest) = self.load_manifest(chain_id, contract).await?;
        if !manifest.owner.eq_ignore_ascii_case(owner) {
            return Err(ConfluxError::Unauthorized(format!("{owner} does not own manifest {chain_id}/{contract}")));
        }
        Ok((cid, manifest))
    }

    fn check_manifest(&self, manifest: &Manifest) -> ConfluxResult<()> {
        if !manifest.valid_version() {
            return Err(ConfluxError::InvalidVersion(manifest.version.clone()));
        }
        match self.registry.validate(&manifest.transformers) {
            Ok(()) => Ok(()),
            Err(PipelineError::Validation(errs)) => Err(ConfluxError::Validation(errs.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Serve from cache, renew a frozen stale entry, or regenerate.
    async fn read_token(&self, manifest_cid: &str, manifest: &Manifest, token_id: &str) -> ConfluxResult<Json> {
        let key = token_key(&manifest.contract, token_id);
        match self.resolver.get(&key)? {
            Resolved::Fresh(cid) => {
                debug!(key = %key, cid = %cid, "api: fresh hit");
                Ok(self.cache.get(&cid).await?)
            }
            Resolved::Expired(cid) if manifest.config.freeze => {
                let ttl = manifest.config.refresh_after.to_minutes();
                self.resolver.set(&key, &cid, ttl)?;
                counter!("api_frozen_renewals_total", 1u64);
                debug!(key = %key, cid = %cid, ttl_minutes = ttl, "api: frozen entry renewed");
                Ok(self.cache.get(&cid).await?)
            }
            Resolved::Expired(_) | Resolved::NotFound => self.generate(manifest, manifest_cid, token_id).await,
        }
    }
}

#[async_trait::async_trait]
impl ConfluxApi for Service {
    async fn create_manifest(&self, mut manifest: Manifest, owner: &str) -> ConfluxResult<String> {
        self.check_manifest(&manifest)?;
        let key = manifest_key(manifest.chain_id, &manifest.contract);
        if !matches!(self.resolver.get(&key)?, Resolved::NotFound) {
            return Err(ConfluxError::AlreadyExists(key));
        }
        if manifest.has_alias() {
            let akey = alias_key(&manifest.config.alias);
            if let Some(other) = self.resolver.get(&akey)?.cid() {
                return Err(ConfluxError::AliasConflict(format!("{} already points at {other}", manifest.config.alias)));
            }
        }
        manifest.owner = owner.to_string();
        manifest.contract = manifest.normalized_contract();

        let cid = self.cache.push(&manifest).await?;
        self.resolver.set(&key, &cid, 0)?;
        if manifest.has_alias() {
            self.resolver.set(&alias_key(&manifest.config.alias), &cid, 0)?;
        }
        info!(key = %key, cid = %cid, credits = self.registry.calculate_credits(&manifest.transformers), "api: manifest created");
        Ok(cid)
    }

    async fn update_manifest(&self, chain_id: u64, contract: &str, mut manifest: Manifest, owner: &str) -> ConfluxResult<String> {
        self.check_manifest(&manifest)?;
        if manifest.chain_id != chain_id || !manifest.contract.eq_ignore_ascii_case(contract) {
            return Err(ConfluxError::Validation(format!(
                "manifest identity {}/{} does not match {chain_id}/{contract}",
                manifest.chain_id, manifest.contract
            )));
        }
        let (old_cid, existing) = self.load_owned(chain_id, contract, owner).await?;

        let new_alias = manifest.config.alias.clone();
        let old_alias = existing.config.alias.clone();
        if !new_alias.is_empty() {
            if let Some(other) = self.resolver.get(&alias_key(&new_alias))?.cid() {
                if other != old_cid {
                    return Err(ConfluxError::AliasConflict(format!("{new_alias} already points at {other}")));
                }
            }
        }

        manifest.owner = existing.owner;
        manifest.contract = manifest.normalized_contract();
        let cid = self.cache.push(&manifest).await?;
        if !new_alias.is_empty() {
            self.resolver.set(&alias_key(&new_alias), &cid, 0)?;
        }
        if !old_alias.is_empty() && old_alias != new_alias {
            self.resolver.delete(&alias_key(&old_alias))?;
            debug!(from = %old_alias, to = %new_alias, "api: alias renamed");
        }
        let key = manifest_key(chain_id, contract);
        self.resolver.set(&key, &cid, 0)?;
        info!(key = %key, cid = %cid, previous = %old_cid, "api: manifest updated");
        Ok(cid)
    }

    async fn get_manifest(&self, chain_id: u64, contract: &str, owner: &str) -> ConfluxResult<Manifest> {
        Ok(self.load_owned(chain_id, contract, owner).await?.1)
    }

    async fn refresh(&self, chain_id: u64, contract: &str, token_id: &str, owner: &str) -> ConfluxResult<Json> {
        let (cid, manifest) = self.load_owned(chain_id, contract, owner).await?;
        self.generate(&manifest, &cid, token_id).await
    }

    async fn get_metadata(&self, chain_id: u64, contract: &str, token_id: &str) -> ConfluxResult<Json> {
        let (cid, manifest) = self.load_manifest(chain_id, contract).await?;
        self.read_token(&cid, &manifest, token_id).await
    }

    async fn get_metadata_by_alias(&self, alias: &str, token_id: &str) -> ConfluxResult<Json> {
        let cid = match self.resolver.get(&alias_key(alias))? {
            Resolved::Fresh(cid) | Resolved::Expired(cid) => cid,
            Resolved::NotFound => return Err(ConfluxError::NotFound(format!("alias {alias}"))),
        };
        let manifest: Manifest = self.cache.get(&cid).await?;
        self.read_token(&cid, &manifest, token_id).await
    }
}
