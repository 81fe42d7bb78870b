//! Kubernetes runtime: each task runs as a single-container Pod.
//! The kubelet handles image pulls (`IfNotPresent`), so image checks are no-ops.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, LogParams, ObjectMeta, PostParams};
use kube::Client;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::runtime::{ContainerRuntime, ContainerSpec, LogStreams};

const TASK_CONTAINER: &str = "task";

pub struct KubeRuntime {
    api: Api<Pod>,
    namespace: String,
    /// Pods built by `create` and submitted by `start`.
    pending: Mutex<FxHashMap<String, Pod>>,
}

impl KubeRuntime {
    /// Namespace from `CONFLUX_SANDBOX_NAMESPACE` (default `default`).
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        let ns: String = conflux_core::env_or("CONFLUX_SANDBOX_NAMESPACE", "default".to_string());
        Ok(Self::new(client, &ns))
    }

    pub fn new(client: Client, namespace: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), namespace: namespace.to_string(), pending: Mutex::new(FxHashMap::default()) }
    }

    pub fn namespace(&self) -> &str { &self.namespace }

    async fn delete_pod(&self, name: &str, grace_seconds: u32) -> Result<()> {
        let dp = DeleteParams { grace_period_seconds: Some(grace_seconds), ..Default::default() };
        match self.api.delete(name, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(anyhow!("deleting pod {name}: {e}")),
        }
    }
}

/// Pod manifest for a task container.
pub fn pod_for(spec: &ContainerSpec) -> Pod {
    let mut limits = BTreeMap::new();
    if let Some(cpu) = &spec.cpu { limits.insert("cpu".to_string(), Quantity(cpu.clone())); }
    if let Some(mem) = &spec.memory { limits.insert("memory".to_string(), Quantity(mem.clone())); }
    let env = spec.env.iter().map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()), ..Default::default() }).collect();
    let labels = BTreeMap::from([("app.kubernetes.io/managed-by".to_string(), "conflux".to_string())]);
    Pod {
        metadata: ObjectMeta { name: Some(spec.name.clone()), labels: Some(labels), ..Default::default() },
        spec: Some(PodSpec {
            restart_policy: Some("Never".into()),
            containers: vec![Container {
                name: TASK_CONTAINER.into(),
                image: Some(spec.image.clone()),
                image_pull_policy: Some("IfNotPresent".into()),
                env: Some(env),
                resources: if limits.is_empty() { None } else { Some(ResourceRequirements { limits: Some(limits), ..Default::default() }) },
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_finished(pod: Option<&Pod>) -> bool {
    matches!(pod.and_then(|p| p.status.as_ref()).and_then(|s| s.phase.as_deref()), Some("Succeeded") | Some("Failed"))
}

/// Exit code of the task container, falling back to the pod phase.
pub fn exit_code(pod: &Pod) -> i64 {
    let status = pod.status.as_ref();
    let terminated = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.name == TASK_CONTAINER))
        .and_then(|c| c.state.as_ref())
        .and_then(|st| st.terminated.as_ref());
    if let Some(t) = terminated {
        return i64::from(t.exit_code);
    }
    match status.and_then(|s| s.phase.as_deref()) {
        Some("Succeeded") => 0,
        _ => 1,
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for KubeRuntime {
    async fn image_present(&self, _image: &str) -> Result<bool> { Ok(true) }

    async fn pull_image(&self, _image: &str) -> Result<()> { Ok(()) }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let pod = pod_for(spec);
        let mut pending = self.pending.lock().map_err(|_| anyhow!("pending pods lock poisoned"))?;
        pending.insert(spec.name.clone(), pod);
        Ok(spec.name.clone())
    }

    async fn start(&self, id: &str) -> Result<()> {
        let pod = {
            let mut pending = self.pending.lock().map_err(|_| anyhow!("pending pods lock poisoned"))?;
            pending.remove(id).ok_or_else(|| anyhow!("pod {id} was not created"))?
        };
        self.api.create(&PostParams::default(), &pod).await.with_context(|| format!("creating pod {id}"))?;
        info!(pod = %id, ns = %self.namespace, "sandbox: pod submitted");
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let done = kube::runtime::wait::await_condition(self.api.clone(), id, pod_finished)
            .await
            .with_context(|| format!("waiting for pod {id}"))?;
        let pod = done.ok_or_else(|| anyhow!("pod {id} disappeared"))?;
        Ok(exit_code(&pod))
    }

    async fn logs(&self, id: &str) -> Result<LogStreams> {
        let lp = LogParams { container: Some(TASK_CONTAINER.to_string()), ..Default::default() };
        let api = self.api.clone();
        let pod = id.to_string();
        let (tx, rx) = mpsc::channel::<std::io::Result<bytes::Bytes>>(64);
        tokio::spawn(async move {
            use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
            let reader = match api.log_stream(&pod, &lp).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(pod = %pod, error = %e, "log_stream failed to open");
                    let _ = tx.send(Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))).await;
                    return;
                }
            };
            let stream = ReaderStream::new(reader.compat());
            futures::pin_mut!(stream);
            while let Some(chunk) = stream.next().await {
                if tx.send(chunk).await.is_err() { break; }
            }
            debug!(pod = %pod, "sandbox: log stream ended");
        });
        // Pod logs interleave both channels; everything arrives on stdout.
        let stdout = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|c| (c, rx)) }).boxed();
        Ok(LogStreams { stdout, stderr: futures::stream::empty().boxed() })
    }

    async fn kill(&self, id: &str) -> Result<()> {
        if let Ok(mut pending) = self.pending.lock() {
            if pending.remove(id).is_some() {
                return Ok(());
            }
        }
        self.delete_pod(id, 0).await
    }

    async fn remove(&self, id: &str) -> Result<()> { self.delete_pod(id, 0).await }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus};

    #[test]
    fn pod_spec_carries_limits_and_env() {
        let spec = ContainerSpec {
            name: "t1".into(),
            image: "ghcr.io/x/task:1".into(),
            cpu: Some("500m".into()),
            memory: None,
            env: vec![("SYNTH_NAME".into(), "t1".into())],
        };
        let pod = pod_for(&spec);
        assert_eq!(pod.metadata.name.as_deref(), Some("t1"));
        let ps = pod.spec.unwrap();
        assert_eq!(ps.restart_policy.as_deref(), Some("Never"));
        let c = &ps.containers[0];
        assert_eq!(c.image_pull_policy.as_deref(), Some("IfNotPresent"));
        let limits = c.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["cpu"], Quantity("500m".into()));
        assert!(!limits.contains_key("memory"));
        assert_eq!(c.env.as_ref().unwrap()[0].value.as_deref(), Some("t1"));
    }

    fn pod_with(phase: &str, code: Option<i32>) -> Pod {
        let statuses = code.map(|c| {
            vec![ContainerStatus {
                name: TASK_CONTAINER.into(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated { exit_code: c, ..Default::default() }),
                    ..Default::default()
                }),
                ..Default::default()
            }]
        });
        Pod {
            status: Some(PodStatus { phase: Some(phase.into()), container_statuses: statuses, ..Default::default() }),
            ..Default::default()
        }
    }

    #[test]
    fn finished_phases_and_exit_codes() {
        assert!(pod_finished(Some(&pod_with("Succeeded", Some(0)))));
        assert!(pod_finished(Some(&pod_with("Failed", Some(2)))));
        assert!(!pod_finished(Some(&pod_with("Running", None))));
        assert!(!pod_finished(None));
        assert_eq!(exit_code(&pod_with("Failed", Some(2))), 2);
        assert_eq!(exit_code(&pod_with("Succeeded", None)), 0);
        assert_eq!(exit_code(&pod_with("Failed", None)), 1);
    }
}
