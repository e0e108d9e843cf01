//! Process-local cluster used by tests and offline development.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast};

use super::{ClusterApi, ClusterError, ListParams, LogStream, ObjectMeta, ResourceKind, WatchEvent, WatchStream};

const WATCH_BUFFER: usize = 256;

/// How the simulated controller reacts to a newly created deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloutBehavior {
    /// One replica appears and its init container starts right away.
    Healthy,
    /// The deployment is accepted but no replica is ever created.
    NeverScheduled,
    /// A replica appears but its init container never starts.
    InitStuck,
    /// Nothing happens; tests drive status by hand through [`InMemoryCluster::upsert`].
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Operation {
    Create,
    Delete,
}

#[derive(Debug)]
struct State {
    objects: BTreeMap<(ResourceKind, String), Value>,
    failures: HashMap<(ResourceKind, Operation), String>,
    logs: HashMap<String, Vec<String>>,
    rollout: RolloutBehavior,
    resource_version: u64,
    watch_opens: usize,
}

#[derive(Debug)]
pub struct InMemoryCluster {
    namespace: String,
    state: Mutex<State>,
    events: broadcast::Sender<(ResourceKind, WatchEvent)>,
}

impl InMemoryCluster {
    pub fn new(namespace: &str) -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            namespace: namespace.to_string(),
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                failures: HashMap::new(),
                logs: HashMap::new(),
                rollout: RolloutBehavior::Healthy,
                resource_version: 0,
                watch_opens: 0,
            }),
            events,
        }
    }

    pub async fn set_rollout(&self, behavior: RolloutBehavior) {
        self.state.lock().await.rollout = behavior;
    }

    pub async fn fail_create(&self, kind: ResourceKind, message: &str) {
        let mut state = self.state.lock().await;
        let _ = state
            .failures
            .insert((kind, Operation::Create), message.to_string());
    }

    pub async fn fail_delete(&self, kind: ResourceKind, message: &str) {
        let mut state = self.state.lock().await;
        let _ = state
            .failures
            .insert((kind, Operation::Delete), message.to_string());
    }

    /// Output returned by `logs` for any pod's `container`.
    pub async fn set_logs(&self, container: &str, lines: &[&str]) {
        let mut state = self.state.lock().await;
        let _ = state.logs.insert(
            container.to_string(),
            lines.iter().map(ToString::to_string).collect(),
        );
    }

    /// Inserts or replaces an object verbatim and notifies watchers.
    pub async fn upsert(&self, kind: ResourceKind, object: Value) -> Result<(), ClusterError> {
        let meta = ObjectMeta::of(&object)?;
        let mut state = self.state.lock().await;
        let existed = state
            .objects
            .insert((kind, meta.name), object.clone())
            .is_some();
        drop(state);
        let event = if existed {
            WatchEvent::Modified(object)
        } else {
            WatchEvent::Added(object)
        };
        let _ = self.events.send((kind, event));
        Ok(())
    }

    pub async fn names(&self, kind: ResourceKind) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .objects
            .keys()
            .filter(|(object_kind, _)| *object_kind == kind)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub async fn watch_opens(&self) -> usize {
        self.state.lock().await.watch_opens
    }

    fn stamp(&self, state: &mut State, kind: ResourceKind, mut object: Value, now: DateTime<Utc>) -> Value {
        state.resource_version = state.resource_version.saturating_add(1);
        let version = state.resource_version.to_string();
        if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            let _ = metadata.insert("namespace".to_string(), json!(self.namespace));
            let _ = metadata.insert("resourceVersion".to_string(), json!(version));
            metadata
                .entry("creationTimestamp")
                .or_insert_with(|| json!(now.to_rfc3339()));
        }
        if kind == ResourceKind::Route {
            let name = object
                .pointer("/metadata/name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let host = format!("{name}-{}.apps.sandbox.test", self.namespace);
            if let Some(spec) = object.get_mut("spec").and_then(Value::as_object_mut) {
                spec.entry("host").or_insert_with(|| json!(host));
            }
        }
        object
    }

    /// Objects the simulated controller derives from a fresh deployment.
    fn rollout_objects(&self, state: &mut State, deployment: &mut Value, now: DateTime<Utc>) -> Vec<(ResourceKind, Value)> {
        let behavior = state.rollout;
        if matches!(behavior, RolloutBehavior::NeverScheduled | RolloutBehavior::Manual) {
            return Vec::new();
        }
        let name = deployment
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let labels = deployment
            .pointer("/spec/template/metadata/labels")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let init_names = container_names(deployment, "/spec/template/spec/initContainers");
        let main_names = container_names(deployment, "/spec/template/spec/containers");

        if let Some(object) = deployment.as_object_mut() {
            let _ = object.insert("status".to_string(), json!({"replicas": 1}));
        }

        let init_state = if behavior == RolloutBehavior::Healthy {
            json!({"running": {"startedAt": now.to_rfc3339()}})
        } else {
            json!({"waiting": {"reason": "PodInitializing"}})
        };
        let pod = json!({
            "metadata": {"name": format!("{name}-0"), "labels": labels},
            "status": {
                "phase": "Pending",
                "initContainerStatuses": init_names
                    .iter()
                    .map(|container| json!({"name": container, "ready": false, "state": init_state}))
                    .collect::<Vec<_>>(),
                "containerStatuses": main_names
                    .iter()
                    .map(|container| json!({"name": container, "ready": false, "state": {"waiting": {"reason": "PodInitializing"}}}))
                    .collect::<Vec<_>>(),
            }
        });
        vec![(ResourceKind::Pod, self.stamp(state, ResourceKind::Pod, pod, now))]
    }
}

fn container_names(object: &Value, pointer: &str) -> Vec<String> {
    object
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(|containers| {
            containers
                .iter()
                .filter_map(|container| container.get("name").and_then(Value::as_str))
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    fn namespace(&self) -> &str {
        self.namespace.as_str()
    }

    async fn create(&self, kind: ResourceKind, manifest: Value) -> Result<Value, ClusterError> {
        let meta = ObjectMeta::of(&manifest)?;
        if meta.name.is_empty() {
            return Err(ClusterError::Api {
                status: 422,
                message: format!("{} name is required", kind.as_str()),
            });
        }
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if let Some(message) = state.failures.get(&(kind, Operation::Create)) {
            return Err(ClusterError::Api {
                status: 500,
                message: message.clone(),
            });
        }
        if state.objects.contains_key(&(kind, meta.name.clone())) {
            return Err(ClusterError::AlreadyExists {
                kind: kind.as_str(),
                name: meta.name,
            });
        }

        let mut object = self.stamp(&mut state, kind, manifest, now);
        let derived = if kind == ResourceKind::Deployment {
            self.rollout_objects(&mut state, &mut object, now)
        } else {
            Vec::new()
        };
        let _ = state.objects.insert((kind, meta.name.clone()), object.clone());
        for (derived_kind, derived_object) in &derived {
            let derived_name = ObjectMeta::of(derived_object)?.name;
            let _ = state
                .objects
                .insert((*derived_kind, derived_name), derived_object.clone());
        }
        drop(state);

        let _ = self.events.send((kind, WatchEvent::Added(object.clone())));
        for (derived_kind, derived_object) in derived {
            let _ = self.events.send((derived_kind, WatchEvent::Added(derived_object)));
        }
        Ok(object)
    }

    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Value, ClusterError> {
        let state = self.state.lock().await;
        state
            .objects
            .get(&(kind, name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: kind.as_str(),
                name: name.to_string(),
            })
    }

    async fn list(&self, kind: ResourceKind, params: &ListParams) -> Result<Vec<Value>, ClusterError> {
        let state = self.state.lock().await;
        Ok(state
            .objects
            .iter()
            .filter(|((object_kind, _), object)| *object_kind == kind && params.matches(object))
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        if let Some(message) = state.failures.get(&(kind, Operation::Delete)) {
            return Err(ClusterError::Api {
                status: 500,
                message: message.clone(),
            });
        }
        let removed = state.objects.remove(&(kind, name.to_string()));
        drop(state);
        match removed {
            Some(object) => {
                let _ = self.events.send((kind, WatchEvent::Deleted(object)));
                Ok(())
            }
            None => Err(ClusterError::NotFound {
                kind: kind.as_str(),
                name: name.to_string(),
            }),
        }
    }

    async fn watch(&self, kind: ResourceKind, params: &ListParams) -> Result<WatchStream, ClusterError> {
        // Subscribe before snapshotting so nothing slips between the two.
        let receiver = self.events.subscribe();
        let initial = {
            let mut state = self.state.lock().await;
            state.watch_opens = state.watch_opens.saturating_add(1);
            state
                .objects
                .iter()
                .filter(|((object_kind, _), object)| *object_kind == kind && params.matches(object))
                .map(|(_, object)| Ok(WatchEvent::Added(object.clone())))
                .collect::<Vec<_>>()
        };

        let params = params.clone();
        let live = futures::stream::unfold(receiver, move |mut receiver| {
            let params = params.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok((event_kind, event)) => {
                            let matches = event_kind == kind
                                && event.object().is_some_and(|object| params.matches(object));
                            if matches {
                                return Some((Ok(event), receiver));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            return Some((
                                Err(ClusterError::Watch(format!("watch lagged by {skipped} events"))),
                                receiver,
                            ));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(futures::stream::iter(initial).chain(live).boxed())
    }

    async fn logs(&self, pod: &str, container: &str, _follow: bool) -> Result<LogStream, ClusterError> {
        let state = self.state.lock().await;
        if !state.objects.contains_key(&(ResourceKind::Pod, pod.to_string())) {
            return Err(ClusterError::NotFound {
                kind: ResourceKind::Pod.as_str(),
                name: pod.to_string(),
            });
        }
        let lines = state.logs.get(container).cloned().unwrap_or_default();
        Ok(futures::stream::iter(lines.into_iter().map(Ok)).boxed())
    }
}
