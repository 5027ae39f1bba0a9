#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use drover_core::{KubernetesResourceId, ReleaseHistory, ReleaseStatus};
use drover_ops::{ClusterOps, MockOps};
use drover_persist::{HistoryStore, MemoryStore, ScopeKey};
use drover_rollout::{run_task, EngineConfig, LogSink, MemorySink, Task, TaskContext, TaskOutcome, TaskParams, TaskScope};

pub const NS: &str = "prod";
pub const RELEASE: &str = "web";

pub const ROLLING_V1: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: web-config
data:
  GREETING: hello
---
apiVersion: v1
kind: Service
metadata:
  name: web
spec:
  selector:
    app: web
  ports:
    - port: 80
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 4
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: web
          image: web:1
          envFrom:
            - configMapRef:
                name: web-config
"#;

pub const BLUE_GREEN: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: web-primary
  annotations:
    drover.io/primary-service: "true"
spec:
  selector:
    app: web
---
apiVersion: v1
kind: Service
metadata:
  name: web-stage
  annotations:
    drover.io/stage-service: "true"
spec:
  selector:
    app: web
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 2
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: web
          image: web:1
"#;

pub const VIRTUAL_SERVICE: &str = r#"
---
apiVersion: networking.istio.io/v1beta1
kind: VirtualService
metadata:
  name: web
spec:
  hosts:
    - web.example.com
  http:
    - route:
        - destination:
            host: web
            port:
              number: 80
          weight: 100
"#;

pub struct Harness {
    pub ops: Arc<MockOps>,
    pub store: Arc<MemoryStore>,
    pub sink: Arc<MemorySink>,
    pub ctx: Arc<TaskContext>,
}

impl Harness {
    pub fn new() -> Self {
        let ops = Arc::new(MockOps::new());
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        let config = EngineConfig {
            poll_interval: Duration::from_millis(1),
            default_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        };
        let ctx = Arc::new(TaskContext::new(
            ops.clone() as Arc<dyn ClusterOps>,
            store.clone() as Arc<dyn HistoryStore>,
            sink.clone() as Arc<dyn LogSink>,
            config,
        ));
        Self { ops, store, sink, ctx }
    }

    pub async fn run(&self, params: TaskParams) -> TaskOutcome {
        run_task(self.ctx.clone(), Task { scope: TaskScope::new(NS, RELEASE), params }).await
    }

    pub fn history(&self) -> ReleaseHistory {
        self.store
            .document(&ScopeKey::new(NS, RELEASE))
            .map(|doc| serde_yaml::from_str(&doc).unwrap())
            .unwrap_or_default()
    }

    pub fn seed(&self, history: &ReleaseHistory) {
        self.store.insert(ScopeKey::new(NS, RELEASE), serde_yaml::to_string(history).unwrap());
    }

    pub fn statuses(&self) -> Vec<(u32, ReleaseStatus)> {
        self.history().releases.iter().map(|r| (r.number, r.status)).collect()
    }
}

pub fn id(kind: &str, name: &str) -> KubernetesResourceId {
    KubernetesResourceId::new(kind, name, Some(NS))
}

/// Names of `ids`, in order.
pub fn names(ids: &[KubernetesResourceId]) -> Vec<String> {
    ids.iter().map(|i| i.name.clone()).collect()
}

pub fn assert_success(outcome: &TaskOutcome) {
    assert!(outcome.is_success(), "task failed: {:?}", outcome.error_message);
}
