//! Orchestrator runtime: owns every component, accepts tasks and hands back
//! handles that resolve to exactly one terminal reply.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use switchyard_protocol::AgentDescriptor;
use switchyard_protocol::AgentExecutor;
use switchyard_protocol::ErrorClass;
use switchyard_protocol::Message;
use switchyard_protocol::Response;
use switchyard_protocol::Task;
use switchyard_protocol::TaskType;
use tokio::sync::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::batch::BatchCoordinator;
use crate::channel::CommunicationChannel;
use crate::classifier::Classification;
use crate::classifier::TaskClassifier;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorErr;
use crate::error::Result;
use crate::events::EventBus;
use crate::events::EventEmitter;
use crate::health::HealthMonitor;
use crate::mode::ModeControl;
use crate::mode::RoutingMode;
use crate::registry::AgentHealth;
use crate::registry::AgentRegistry;
use crate::router::AttemptRecord;
use crate::router::FallbackChain;
use crate::router::Router;
use crate::session::SessionMonitor;
use crate::signal::SignalProtocol;
use crate::store::InMemoryBackend;
use crate::store::SharedStore;
use crate::store::StoreBackend;
use crate::validation::ChannelMetrics;

/// Every component, built once and shared by reference. Nothing in the crate
/// reaches for globals.
pub struct OrchestrationContext {
    pub config: OrchestratorConfig,
    pub events: EventEmitter,
    pub registry: Arc<AgentRegistry>,
    pub channel: Arc<CommunicationChannel>,
    pub batch: Arc<BatchCoordinator>,
    pub session: Arc<SessionMonitor>,
    pub signals: Arc<SignalProtocol>,
    pub store: Arc<SharedStore>,
    pub classifier: TaskClassifier,
    pub mode: ModeControl,
    pub tracker: TaskTracker,
    pub shutdown: CancellationToken,
}

/// Terminal result of a submitted task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub correlation_id: String,
    pub response: Response,
    pub attempts: Vec<AttemptRecord>,
    pub chain: FallbackChain,
    pub classification: Classification,
    pub mode: RoutingMode,
}

/// Caller's handle on a submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    task_id: String,
    correlation_id: String,
    classification: Classification,
    result: watch::Receiver<Option<TaskOutcome>>,
    cancel: CancellationToken,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    /// The outcome if the task already finished.
    pub fn poll(&self) -> Option<TaskOutcome> {
        self.result.borrow().clone()
    }

    /// Waits up to `timeout`. Elapsing does not cancel the task.
    pub async fn wait(&self, timeout: Duration) -> Result<TaskOutcome> {
        let mut result = self.result.clone();
        let finished = tokio::time::timeout(timeout, result.wait_for(Option::is_some))
            .await
            .map_err(|_| OrchestratorErr::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(|_| OrchestratorErr::Shutdown)?;
        (*finished).clone().ok_or(OrchestratorErr::Shutdown)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Read-only health and traffic view.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub agents: Vec<AgentHealth>,
    pub metrics: ChannelMetrics,
    pub mode: RoutingMode,
    pub active_tasks: usize,
}

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    agents: Vec<(AgentDescriptor, Arc<dyn AgentExecutor>)>,
    backend: Option<Arc<dyn StoreBackend>>,
}

impl OrchestratorBuilder {
    pub fn agent(mut self, descriptor: AgentDescriptor, executor: Arc<dyn AgentExecutor>) -> Self {
        self.agents.push((descriptor, executor));
        self
    }

    pub fn store_backend(mut self, backend: Arc<dyn StoreBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub async fn build(self) -> Result<Orchestrator> {
        let OrchestratorBuilder {
            config,
            agents,
            backend,
        } = self;
        config.validate()?;
        let router_config = config.effective_router()?;
        let initial_mode = router_config.mode;

        let events = EventEmitter::new(EventBus::new(config.store.handler_timeout()));
        let registry = Arc::new(AgentRegistry::new(config.health.clone(), events.clone()));
        for (descriptor, executor) in agents {
            registry.register(descriptor, executor).await?;
        }

        let tracker = TaskTracker::new();
        let channel = Arc::new(CommunicationChannel::new(
            Arc::clone(&registry),
            config.channel.clone(),
        ));
        let batch = Arc::new(BatchCoordinator::new(
            Arc::clone(&channel),
            config.batch.clone(),
            tracker.clone(),
        ));
        let session = Arc::new(SessionMonitor::new(
            config.session.clone(),
            Arc::clone(&registry),
            events.clone(),
        ));
        let signals = Arc::new(SignalProtocol::new(
            config.store.mailbox_capacity,
            config.store.handler_timeout(),
        ));
        let store = Arc::new(SharedStore::new(
            backend.unwrap_or_else(|| Arc::new(InMemoryBackend::new())),
            Arc::clone(&signals),
            events.clone(),
            config.store.clone(),
        ));
        let router = Router::new(
            Arc::clone(&registry),
            Arc::clone(&batch),
            Arc::clone(&session),
            events.clone(),
            router_config,
        );

        let context = OrchestrationContext {
            classifier: TaskClassifier::new(config.classifier.clone()),
            mode: ModeControl::new(initial_mode),
            config,
            events,
            registry,
            channel,
            batch,
            session,
            signals,
            store,
            tracker,
            shutdown: CancellationToken::new(),
        };
        Ok(Orchestrator {
            context: Arc::new(context),
            router: Arc::new(router),
            active: Arc::new(RwLock::new(HashMap::new())),
            started: AtomicBool::new(false),
        })
    }
}

/// Entry point for callers: submit tasks, await handles, steer routing.
pub struct Orchestrator {
    context: Arc<OrchestrationContext>,
    router: Arc<Router>,
    /// Tasks still walking their chain, by task id.
    active: Arc<RwLock<HashMap<String, CancellationToken>>>,
    started: AtomicBool,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            agents: Vec::new(),
            backend: None,
        }
    }

    pub fn context(&self) -> &OrchestrationContext {
        &self.context
    }

    pub async fn register_agent(&self, descriptor: AgentDescriptor, executor: Arc<dyn AgentExecutor>) -> Result<()> {
        self.context.registry.register(descriptor, executor).await
    }

    /// Starts the health probe loop and the usage reset ticker. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let context = &self.context;
        let interval = context.config.health.probe_interval();
        HealthMonitor::new(Arc::clone(&context.registry), interval)
            .spawn(&context.tracker, context.shutdown.child_token());

        let session = Arc::clone(&context.session);
        let cancel = context.shutdown.child_token();
        context.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        session.tick(Utc::now()).await;
                    }
                }
            }
        });
        tracing::info!(probe_interval_ms = interval.as_millis() as u64, "orchestrator started");
    }

    pub fn classify(&self, text: &str, hint: Option<TaskType>) -> Classification {
        self.context.classifier.classify(text, hint)
    }

    /// Accepts a task and starts routing it in the background.
    pub async fn submit(&self, task: Task) -> Result<TaskHandle> {
        if self.context.shutdown.is_cancelled() {
            return Err(OrchestratorErr::Shutdown);
        }
        if task.id.trim().is_empty() {
            return Err(OrchestratorErr::Validation("task id must not be empty".to_string()));
        }

        let cancel = self.context.shutdown.child_token();
        {
            let mut active = self.active.write().await;
            if active.contains_key(&task.id) {
                return Err(OrchestratorErr::Validation(format!(
                    "task `{}` is already in flight",
                    task.id
                )));
            }
            active.insert(task.id.clone(), cancel.clone());
        }

        let classification = self
            .context
            .classifier
            .classify(&task.payload, Some(task.task_type));
        let mode = self.context.mode.current().await;
        let (sender, receiver) = watch::channel(None);
        let handle = TaskHandle {
            task_id: task.id.clone(),
            correlation_id: task.correlation_id.clone(),
            classification: classification.clone(),
            result: receiver,
            cancel: cancel.clone(),
        };
        tracing::info!(
            task_id = %task.id,
            task_type = %classification.task_type,
            confidence = classification.confidence,
            %mode,
            "task submitted"
        );

        let router = Arc::clone(&self.router);
        let active = Arc::clone(&self.active);
        let events = self.context.events.clone();
        self.context.tracker.spawn(async move {
            let routed = AssertUnwindSafe(router.route(&task, &classification, mode, &cancel))
                .catch_unwind()
                .await;
            let outcome = match routed {
                Ok(routed) => TaskOutcome {
                    task_id: task.id.clone(),
                    correlation_id: task.correlation_id.clone(),
                    response: routed.response,
                    attempts: routed.attempts,
                    chain: routed.chain,
                    classification,
                    mode,
                },
                Err(_) => {
                    tracing::error!(task_id = %task.id, "routing panicked");
                    let message = Message::for_task(&task, "", classification.task_type, 0, 0);
                    TaskOutcome {
                        task_id: task.id.clone(),
                        correlation_id: task.correlation_id.clone(),
                        response: Response::failure(&message, ErrorClass::RemoteError, "routing panicked")
                            .non_retryable(),
                        attempts: Vec::new(),
                        chain: FallbackChain::default(),
                        classification,
                        mode,
                    }
                }
            };

            let agent_id = outcome
                .attempts
                .last()
                .filter(|attempt| attempt.is_success())
                .map(|attempt| attempt.agent_id.clone());
            events.task_completed(
                &outcome.task_id,
                agent_id.as_deref(),
                outcome.response.status,
                outcome.attempts.len(),
            );
            active.write().await.remove(&outcome.task_id);
            sender.send_replace(Some(outcome));
        });
        Ok(handle)
    }

    pub async fn await_task(&self, handle: &TaskHandle, timeout: Duration) -> Result<TaskOutcome> {
        handle.wait(timeout).await
    }

    pub fn poll(&self, handle: &TaskHandle) -> Option<TaskOutcome> {
        handle.poll()
    }

    /// Stops the task at its next suspension point; it resolves with a
    /// `cancelled` reply.
    pub fn cancel(&self, handle: &TaskHandle) {
        tracing::info!(task_id = %handle.task_id, "task cancellation requested");
        handle.cancel();
    }

    /// Cancels a task by id when no handle is at hand.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        match self.active.read().await.get(task_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn set_mode(&self, mode: RoutingMode) -> RoutingMode {
        self.context.mode.set(mode).await
    }

    pub async fn mode(&self) -> RoutingMode {
        self.context.mode.current().await
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            agents: self.context.registry.snapshot().await,
            metrics: self.context.channel.metrics().await,
            mode: self.context.mode.current().await,
            active_tasks: self.active.read().await.len(),
        }
    }

    pub async fn metrics(&self) -> ChannelMetrics {
        self.context.channel.metrics().await
    }

    pub fn events(&self) -> &EventBus {
        self.context.events.bus()
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.context.store
    }

    pub fn signals(&self) -> &Arc<SignalProtocol> {
        &self.context.signals
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.context.registry
    }

    pub fn session(&self) -> &Arc<SessionMonitor> {
        &self.context.session
    }

    /// Cancels in-flight work and waits for every task to resolve.
    pub async fn shutdown(&self) {
        let pending = self.active.read().await.len();
        tracing::info!(pending, "orchestrator shutting down");
        self.context.shutdown.cancel();
        self.context.tracker.close();
        self.context.tracker.wait().await;
        self.context.store.close().await;
    }
}
