//! Platform API facade
//!
//! Owns every side effect against the Kubernetes API for one cluster
//! resource: idempotent get-or-create for services, configmaps and volume
//! claims, pod creation with a readiness wait, role labeling, label-selector
//! listing and the exec subresource used to drive MySQL inside instance
//! containers.

use crate::crd::YellowTang;
use crate::error::{OperatorError, Result};
use crate::resources::{pod_is_healthy, ResourceBuilder, MYSQL_CONTAINER, ROLE_LABEL};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, PersistentVolumeClaim, Pod, Service};
use kube::api::{Api, AttachParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Poll interval while waiting for a created pod to become ready
const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Label selector matching every instance of the cluster, optionally
/// narrowed to one role
pub fn instance_selector(role: Option<&str>) -> String {
    match role {
        Some(role) => format!("tang=true,app=mysql,{}={}", ROLE_LABEL, role),
        None => "tang=true,app=mysql".to_string(),
    }
}

/// Typed CRUD surface over the objects owned by one YellowTang cluster
pub struct ResourceFacade<'a> {
    builder: ResourceBuilder<'a>,
    tang: &'a YellowTang,
    pods: Api<Pod>,
    services: Api<Service>,
    configmaps: Api<ConfigMap>,
    pvcs: Api<PersistentVolumeClaim>,
    endpoints: Api<Endpoints>,
}

impl<'a> ResourceFacade<'a> {
    /// Create a facade scoped to the cluster's namespace
    pub fn new(client: &Client, tang: &'a YellowTang) -> Result<Self> {
        let builder = ResourceBuilder::new(tang)?;
        let ns = builder.namespace().to_string();

        Ok(Self {
            builder,
            tang,
            pods: Api::namespaced(client.clone(), &ns),
            services: Api::namespaced(client.clone(), &ns),
            configmaps: Api::namespaced(client.clone(), &ns),
            pvcs: Api::namespaced(client.clone(), &ns),
            endpoints: Api::namespaced(client.clone(), &ns),
        })
    }

    fn is_not_found(err: &kube::Error) -> bool {
        matches!(err, kube::Error::Api(ae) if ae.code == 404)
    }

    /// Get the role service, creating it if absent. Idempotent.
    pub async fn ensure_service(&self, name: &str, role: &str) -> Result<Service> {
        match self.services.get(name).await {
            Ok(svc) => Ok(svc),
            Err(err) if Self::is_not_found(&err) => {
                info!(service = %name, role = %role, "creating service");
                let svc = self.builder.build_service(name, role);
                Ok(self.services.create(&PostParams::default(), &svc).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Get the instance configmap, creating it if absent. Idempotent.
    pub async fn ensure_configmap(&self, name: &str, server_id: i32) -> Result<ConfigMap> {
        match self.configmaps.get(name).await {
            Ok(cm) => Ok(cm),
            Err(err) if Self::is_not_found(&err) => {
                info!(configmap = %name, server_id, "creating configmap");
                let cm = self.builder.build_configmap(name, server_id);
                Ok(self.configmaps.create(&PostParams::default(), &cm).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Get the instance volume claim, creating it if absent. Idempotent.
    pub async fn ensure_pvc(&self, name: &str) -> Result<PersistentVolumeClaim> {
        match self.pvcs.get(name).await {
            Ok(pvc) => Ok(pvc),
            Err(err) if Self::is_not_found(&err) => {
                info!(pvc = %name, "creating persistent volume claim");
                let pvc = self.builder.build_pvc(name);
                Ok(self.pvcs.create(&PostParams::default(), &pvc).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Create an instance pod and block until it reports ready.
    ///
    /// NOT idempotent: creating an existing pod surfaces the platform's
    /// conflict error. The readiness poll has no timeout; dropping the
    /// reconcile future on shutdown is the only exit. Transient get failures
    /// while polling are swallowed and retried.
    pub async fn create_pod(
        &self,
        pod_name: &str,
        pvc_name: &str,
        config_map_name: &str,
        root_password: &str,
    ) -> Result<Pod> {
        let pod = self
            .builder
            .build_pod(pod_name, pvc_name, config_map_name, root_password);
        self.pods.create(&PostParams::default(), &pod).await?;
        info!(pod = %pod_name, "pod created, waiting for readiness");

        loop {
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;

            match self.pods.get(pod_name).await {
                Ok(pod) if pod_is_healthy(&pod) => {
                    info!(pod = %pod_name, "pod is ready");
                    return Ok(pod);
                }
                Ok(_) => {
                    debug!(pod = %pod_name, "pod not ready yet");
                }
                Err(err) => {
                    warn!(pod = %pod_name, error = %err, "transient failure polling pod status");
                }
            }
        }
    }

    /// Fetch one pod by name
    pub async fn get_pod(&self, name: &str) -> Result<Pod> {
        Ok(self.pods.get(name).await?)
    }

    /// List instance pods by label selector
    pub async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(selector);
        Ok(self.pods.list(&lp).await?.items)
    }

    /// Merge the role label into a pod. Idempotent.
    pub async fn label_pod(&self, pod_name: &str, role: &str) -> Result<()> {
        debug!(pod = %pod_name, role = %role, "labeling pod");
        let patch = serde_json::json!({
            "metadata": { "labels": { ROLE_LABEL: role } }
        });
        self.pods
            .patch(pod_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Endpoints of the master-facing service; empty endpoints mean the
    /// primary has no live backend
    pub async fn master_endpoints(&self) -> Result<Endpoints> {
        Ok(self.endpoints.get(&self.tang.spec.master_service).await?)
    }

    /// Run a shell command inside a pod's database container and return its
    /// captured stdout.
    ///
    /// Uses the platform's streaming exec subresource: stdin disabled, no
    /// TTY, stderr forwarded to the operator's own stderr. A non-success
    /// termination status surfaces as [`OperatorError::ExecFailed`].
    pub async fn exec_on_pod(&self, pod_name: &str, command: &str) -> Result<String> {
        let ap = AttachParams::default()
            .container(MYSQL_CONTAINER)
            .stdin(false)
            .stdout(true)
            .stderr(true)
            .tty(false);

        let mut attached = self
            .pods
            .exec(pod_name, ["/bin/sh", "-c", command], &ap)
            .await?;

        if let Some(mut stderr) = attached.stderr() {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stderr, &mut tokio::io::stderr()).await;
            });
        }

        let status_fut = attached.take_status();

        let mut output = Vec::new();
        if let Some(mut stdout) = attached.stdout() {
            stdout
                .read_to_end(&mut output)
                .await
                .map_err(|err| OperatorError::ExecFailed {
                    pod: pod_name.to_string(),
                    message: format!("reading stdout: {}", err),
                })?;
        }

        let status = match status_fut {
            Some(fut) => fut.await,
            None => None,
        };

        attached
            .join()
            .await
            .map_err(|err| OperatorError::ExecFailed {
                pod: pod_name.to_string(),
                message: format!("joining exec stream: {}", err),
            })?;

        if let Some(status) = status {
            if status.status.as_deref() == Some("Failure") {
                return Err(OperatorError::ExecFailed {
                    pod: pod_name.to_string(),
                    message: status
                        .message
                        .unwrap_or_else(|| "command terminated abnormally".to_string()),
                });
            }
        }

        Ok(String::from_utf8_lossy(&output).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_selector() {
        assert_eq!(instance_selector(None), "tang=true,app=mysql");
        assert_eq!(
            instance_selector(Some("slave")),
            "tang=true,app=mysql,role=slave"
        );
    }
}
