//! Kubernetes watch loops feeding [`ClusterState`].

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::KubernetesConfig;
use crate::error::DnsError;
use crate::mcs::ServiceImport;
use crate::metrics::{self, RestartReason, WatchEventType};
use crate::object::{EndpointRecord, NamespaceRecord, ServiceImportRecord, LABEL_SERVICE_NAME};
use crate::state::{CacheObject, ClusterCache, ClusterState};

/// Delay before re-creating a watch stream that ended.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Shutdown signal shared by the watch loops. Flips to `true` exactly once.
pub type Shutdown = watch::Receiver<bool>;

/// Build a kube client from an explicit kubeconfig and context, falling back
/// to the in-cluster/default inference chain.
pub async fn client_from_config(config: &KubernetesConfig) -> Result<Client, DnsError> {
    let options = KubeConfigOptions {
        context: config.context.clone(),
        ..Default::default()
    };

    let client_config = match (&config.kubeconfig, &config.context) {
        (Some(path), _) => {
            debug!(path = %path.display(), context = ?config.context, "loading kubeconfig");
            let kubeconfig = Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?
        }
        (None, Some(context)) => {
            debug!(context, "loading default kubeconfig");
            kube::Config::from_kubeconfig(&options).await?
        }
        (None, None) => kube::Config::infer().await?,
    };

    info!(cluster_url = %client_config.cluster_url, "kube client configured");
    Ok(Client::try_from(client_config)?)
}

/// [`ClusterCache`] backed by kube watchers on ServiceImports, Namespaces
/// and (optionally) EndpointSlices.
pub struct Controller {
    client: Client,
    state: ClusterState,
    shutdown: watch::Sender<bool>,
    stopping: AtomicBool,
}

impl Controller {
    /// Create a controller. Nothing is watched until [`ClusterCache::run`].
    pub fn new(client: Client, endpoints_enabled: bool) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            client,
            state: ClusterState::new(endpoints_enabled),
            shutdown,
            stopping: AtomicBool::new(false),
        }
    }

    /// The state the watch loops write to.
    pub fn state(&self) -> &ClusterState {
        &self.state
    }
}

#[async_trait]
impl ClusterCache for Controller {
    fn service_list(&self) -> Vec<Arc<ServiceImportRecord>> {
        self.state.services()
    }

    fn svc_index(&self, key: &str) -> Vec<Arc<ServiceImportRecord>> {
        self.state.services_by_index(key)
    }

    fn endpoints_list(&self) -> Vec<Arc<EndpointRecord>> {
        self.state.endpoints()
    }

    fn ep_index(&self, key: &str) -> Vec<Arc<EndpointRecord>> {
        self.state.endpoints_by_index(key)
    }

    fn namespace_by_name(&self, name: &str) -> Option<Arc<NamespaceRecord>> {
        self.state.namespace(name)
    }

    fn has_synced(&self) -> bool {
        self.state.has_synced()
    }

    fn modified(&self) -> i64 {
        self.state.modified()
    }

    async fn run(&self) -> Result<(), DnsError> {
        let shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            debug!("controller stopped before start");
            return Ok(());
        }

        info!(
            endpoints = self.state.endpoints_enabled(),
            "starting cluster watches"
        );

        let services = watch_collection(
            Api::<ServiceImport>::all(self.client.clone()),
            watcher::Config::default(),
            self.state.clone(),
            ServiceImportRecord::from_resource,
            shutdown.clone(),
        );
        let namespaces = watch_collection(
            Api::<Namespace>::all(self.client.clone()),
            watcher::Config::default(),
            self.state.clone(),
            NamespaceRecord::from_namespace,
            shutdown.clone(),
        );
        let endpoints = async {
            if self.state.endpoints_enabled() {
                watch_collection(
                    Api::<EndpointSlice>::all(self.client.clone()),
                    watcher::Config::default().labels(LABEL_SERVICE_NAME),
                    self.state.clone(),
                    EndpointRecord::from_slice,
                    shutdown.clone(),
                )
                .await;
            }
        };

        tokio::join!(services, namespaces, endpoints);
        info!("cluster watches stopped");
        Ok(())
    }

    fn stop(&self) -> Result<(), DnsError> {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return Err(DnsError::AlreadyStopping);
        }
        self.shutdown.send_replace(true);
        Ok(())
    }

    fn emit_metrics(&self) {
        self.state.emit_metrics();
    }
}

/// Watch one collection and mirror it into `state` until shutdown.
///
/// A relist is buffered between `Init` and `InitDone` and swapped in at once.
async fn watch_collection<K, T>(
    api: Api<K>,
    config: watcher::Config,
    state: ClusterState,
    convert: fn(&K) -> T,
    mut shutdown: Shutdown,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    T: CacheObject,
{
    let collection = T::COLLECTION;
    let mut reason = RestartReason::InitialConnect;

    loop {
        metrics::record_watch_restart(collection, reason);
        debug!(collection, ?reason, "starting watch");

        let mut stream = watcher::watcher(api.clone(), config.clone())
            .default_backoff()
            .boxed();
        let mut relist: Option<Vec<T>> = None;

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(collection, "watch shutting down");
                        return;
                    }
                }

                item = stream.next() => {
                    match item {
                        Some(Ok(event)) => handle_event(&state, &mut relist, convert, event),
                        Some(Err(e)) => {
                            warn!(collection, error = %e, "watch error");
                            metrics::record_watch_error(collection);
                        }
                        None => break,
                    }
                }
            }
        }

        info!(collection, "watch stream ended, restarting");
        reason = RestartReason::StreamEnded;

        tokio::select! {
            biased;

            _ = shutdown.changed() => return,
            _ = sleep(RESTART_DELAY) => {}
        }
    }
}

fn handle_event<K, T: CacheObject>(
    state: &ClusterState,
    relist: &mut Option<Vec<T>>,
    convert: fn(&K) -> T,
    event: Event<K>,
) {
    let collection = T::COLLECTION;

    match event {
        Event::Apply(obj) => {
            metrics::record_watch_event(collection, WatchEventType::Apply);
            state.apply(convert(&obj));
        }
        Event::Delete(obj) => {
            metrics::record_watch_event(collection, WatchEventType::Delete);
            state.delete(&convert(&obj));
        }
        Event::Init => {
            metrics::record_watch_event(collection, WatchEventType::Init);
            *relist = Some(Vec::new());
        }
        Event::InitApply(obj) => {
            metrics::record_watch_event(collection, WatchEventType::InitApply);
            relist.get_or_insert_with(Vec::new).push(convert(&obj));
        }
        Event::InitDone => {
            metrics::record_watch_event(collection, WatchEventType::InitDone);
            let objects = relist.take().unwrap_or_default();
            let count = objects.len();
            let effective = state.replace_all(objects);
            info!(collection, objects = count, effective, "relist complete");
        }
    }
}
