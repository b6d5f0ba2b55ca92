//! Core coordinator that runs one reasoning cycle across the capability set.
//!
//! A cycle validates the query, assesses its complexity, dispatches the
//! eligible capabilities concurrently (dependents of the tool reasoner start
//! once its representation is available), aggregates what completed and
//! finally commits the cycle to the shared field and memory stores.

use crate::aggregator;
use crate::capability::{Capability, CapabilityHealth, CapabilityRequest, CycleCommit};
use crate::complexity::{Assessment, ComplexityAssessor};
use crate::error::{EngineError, EngineResult, FailureClass, SubsystemFailure};
use crate::field::{FieldResonator, FieldSnapshot, NeuralField};
use crate::interpretation::AmbiguityResolver;
use crate::memory::{InMemoryStore, MemoryRecall, MemoryStats, MemoryStore};
use crate::monitoring::{CycleSample, PerformanceMonitor, PerformanceSnapshot};
use crate::settings::Settings;
use crate::symbolic::SymbolicProcessor;
use crate::tools::{Representation, ToolReasoner};
use crate::types::{
    ComplexityLevel, Context, ContextualResponse, Diagnostics, InvocationOutcome, Query,
    ReasoningOptions, ReasoningTraceEntry, SubsystemInvocation, SubsystemKind,
};
use chrono::Utc;
use futures::{FutureExt, Stream};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const EMPTY_QUERY_CONFIDENCE: f64 = 5.0;

/// Progress of a streamed cycle. The last event is always `Completed`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReasoningEvent {
    Started { cycle_id: Uuid, query: String },
    Assessed { level: ComplexityLevel, rationale: String },
    Step(ReasoningTraceEntry),
    Completed(Box<ContextualResponse>),
}

/// Finite, non-restartable event sequence of one cycle. Dropping the stream
/// cancels the cycle.
pub struct ReasoningStream {
    events: mpsc::UnboundedReceiver<ReasoningEvent>,
    cancel: CancellationToken,
}

impl ReasoningStream {
    /// Aborts in-flight calls; the stream still ends with the final response.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn next_event(&mut self) -> Option<ReasoningEvent> {
        self.events.recv().await
    }
}

impl Stream for ReasoningStream {
    type Item = ReasoningEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for ReasoningStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One query of a batch.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub query: String,
    pub context: Context,
    pub options: ReasoningOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub responses: Vec<ContextualResponse>,
    pub success_rate: f64,
    pub total_time: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub engine_status: String,
    pub active_component_count: usize,
    pub version: String,
    pub active_cycles: usize,
    pub uptime_seconds: u64,
    pub pending_configuration: bool,
    pub capabilities: BTreeMap<SubsystemKind, CapabilityHealth>,
    pub performance: PerformanceSnapshot,
    pub memory: MemoryStats,
    pub field: FieldSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigureAck {
    pub accepted_keys: Vec<String>,
    /// Staged settings apply when the next cycle starts.
    pub applies_at: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetScope {
    Field,
    Memory,
    All,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetAck {
    pub reset: String,
    pub at: chrono::DateTime<Utc>,
}

/// Decrements the active-cycle counter when a cycle ends, however it ends.
struct ActiveCycle<'a>(&'a AtomicUsize);

impl<'a> ActiveCycle<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveCycle<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Inner {
    capabilities: parking_lot::RwLock<HashMap<SubsystemKind, Arc<dyn Capability>>>,
    field: Arc<NeuralField>,
    memory: Arc<dyn MemoryStore>,
    assessor: ComplexityAssessor,
    monitor: PerformanceMonitor,
    settings: parking_lot::RwLock<Arc<Settings>>,
    pending: parking_lot::Mutex<Option<Settings>>,
    generation: parking_lot::Mutex<CancellationToken>,
    active_cycles: AtomicUsize,
    started: std::time::Instant,
}

/// Cheap to clone; clones share capabilities, stores and configuration.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// A call still running when the cycle was interrupted.
struct InFlight {
    name: String,
    input: Value,
    started_at: chrono::DateTime<Utc>,
    started: Instant,
}

impl Orchestrator {
    /// Engine with fresh in-process field and memory stores and the built-in capabilities.
    pub fn new(settings: Settings) -> EngineResult<Self> {
        let field = Arc::new(NeuralField::new(settings.field.clone()));
        let memory: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new(settings.memory.clone()));
        Self::with_stores(settings, field, memory)
    }

    /// Engine over caller-owned shared stores.
    pub fn with_stores(
        settings: Settings,
        field: Arc<NeuralField>,
        memory: Arc<dyn MemoryStore>,
    ) -> EngineResult<Self> {
        settings.validate()?;
        field.set_params(settings.field.clone());
        memory.set_policy(settings.memory.clone());

        let builtins: Vec<Arc<dyn Capability>> = vec![
            Arc::new(ToolReasoner::new()),
            Arc::new(MemoryRecall::new(memory.clone())),
            Arc::new(FieldResonator::new(field.clone())),
            Arc::new(SymbolicProcessor::new()),
            Arc::new(AmbiguityResolver::new()),
        ];
        let capabilities = builtins.into_iter().map(|c| (c.kind(), c)).collect();

        Ok(Self {
            inner: Arc::new(Inner {
                capabilities: parking_lot::RwLock::new(capabilities),
                field,
                memory,
                assessor: ComplexityAssessor::new(),
                monitor: PerformanceMonitor::new(settings.orchestrator.recent_window),
                settings: parking_lot::RwLock::new(Arc::new(settings)),
                pending: parking_lot::Mutex::new(None),
                generation: parking_lot::Mutex::new(CancellationToken::new()),
                active_cycles: AtomicUsize::new(0),
                started: std::time::Instant::now(),
            }),
        })
    }

    /// Installs `capability` for its kind, returning the one it replaces.
    pub fn register_capability(&self, capability: Arc<dyn Capability>) -> Option<Arc<dyn Capability>> {
        info!(kind = %capability.kind(), name = capability.name(), "Registering capability");
        self.inner
            .capabilities
            .write()
            .insert(capability.kind(), capability)
    }

    pub fn unregister_capability(&self, kind: SubsystemKind) -> Option<Arc<dyn Capability>> {
        self.inner.capabilities.write().remove(&kind)
    }

    /// Registered capabilities as `(kind, name)`, in canonical order.
    pub fn list_capabilities(&self) -> Vec<(SubsystemKind, String)> {
        let capabilities = self.inner.capabilities.read();
        let mut listed: Vec<_> = capabilities
            .iter()
            .map(|(kind, c)| (*kind, c.name().to_string()))
            .collect();
        listed.sort_by_key(|(kind, _)| *kind);
        listed
    }

    pub fn field(&self) -> Arc<NeuralField> {
        self.inner.field.clone()
    }

    pub fn memory(&self) -> Arc<dyn MemoryStore> {
        self.inner.memory.clone()
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.inner.settings.read().clone()
    }

    /// Runs one reasoning cycle.
    pub async fn reason(
        &self,
        query: &str,
        context: Context,
        options: ReasoningOptions,
    ) -> EngineResult<ContextualResponse> {
        self.reason_with_cancel(query, context, options, CancellationToken::new())
            .await
    }

    /// Like [`Orchestrator::reason`], aborting in-flight calls once `cancel` fires.
    pub async fn reason_with_cancel(
        &self,
        query: &str,
        context: Context,
        options: ReasoningOptions,
        cancel: CancellationToken,
    ) -> EngineResult<ContextualResponse> {
        let (query, settings) = self.prepare(query, context, &options)?;
        Ok(self.execute(query, options, settings, cancel, None).await)
    }

    /// Streams trace entries as they are produced. Validation errors are
    /// returned before the cycle starts.
    pub fn reason_stream(
        &self,
        query: &str,
        context: Context,
        options: ReasoningOptions,
    ) -> EngineResult<ReasoningStream> {
        let (query, settings) = self.prepare(query, context, &options)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let engine = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            engine.execute(query, options, settings, token, Some(tx)).await;
        });

        Ok(ReasoningStream { events: rx, cancel })
    }

    /// Runs independent cycles, at most `max_concurrent_cycles` at a time.
    /// Responses keep the order of `queries`.
    pub async fn reason_batch(
        &self,
        queries: Vec<String>,
        contexts: Option<Vec<Context>>,
    ) -> EngineResult<BatchReport> {
        let contexts = match contexts {
            Some(contexts) if contexts.len() != queries.len() => {
                return Err(EngineError::Validation(format!(
                    "{} queries but {} contexts",
                    queries.len(),
                    contexts.len()
                )));
            }
            Some(contexts) => contexts,
            None => vec![Context::new(); queries.len()],
        };
        let items = queries
            .into_iter()
            .zip(contexts)
            .map(|(query, context)| BatchItem {
                query,
                context,
                options: ReasoningOptions::default(),
            })
            .collect();
        Ok(self.run_batch(items, None).await)
    }

    /// Batch with per-item options. A rejected item yields its own failed
    /// response and leaves the others untouched. `max_concurrent` overrides
    /// `max_concurrent_cycles` for this batch only.
    #[instrument(skip_all, fields(items = items.len()))]
    pub async fn run_batch(&self, items: Vec<BatchItem>, max_concurrent: Option<usize>) -> BatchReport {
        let started = std::time::Instant::now();
        let limit = max_concurrent
            .unwrap_or_else(|| self.cycle_settings().orchestrator.max_concurrent_cycles)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(limit));

        let handles: Vec<_> = items
            .into_iter()
            .map(|item| {
                let engine = self.clone();
                let semaphore = semaphore.clone();
                let query = item.query.clone();
                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    match engine.reason(&item.query, item.context, item.options).await {
                        Ok(response) => response,
                        Err(error) => failed_response(
                            &item.query,
                            FailureClass::Validation,
                            error.to_string(),
                        ),
                    }
                });
                (query, handle)
            })
            .collect();

        let mut responses = Vec::with_capacity(handles.len());
        for (query, handle) in handles {
            match handle.await {
                Ok(response) => responses.push(response),
                Err(error) => {
                    warn!(%error, "batch cycle task failed");
                    responses.push(failed_response(
                        &query,
                        FailureClass::TotalFailure,
                        format!("cycle task failed: {error}"),
                    ));
                }
            }
        }

        let successes = responses.iter().filter(|r| r.success).count();
        let success_rate = if responses.is_empty() {
            0.0
        } else {
            successes as f64 / responses.len() as f64
        };
        info!(total = responses.len(), successes, "Batch finished");

        BatchReport {
            responses,
            success_rate,
            total_time: started.elapsed().as_secs_f64(),
        }
    }

    pub async fn get_status(&self) -> EngineStatus {
        let settings = self.settings();
        let capabilities: Vec<(SubsystemKind, Arc<dyn Capability>)> = self
            .inner
            .capabilities
            .read()
            .iter()
            .filter(|(kind, _)| settings.is_subsystem_enabled(**kind))
            .map(|(kind, c)| (*kind, c.clone()))
            .collect();

        let mut health = BTreeMap::new();
        for (kind, capability) in &capabilities {
            health.insert(*kind, capability.health_check().await);
        }
        let engine_status = if capabilities.is_empty() {
            "unavailable"
        } else if health.values().any(|h| h.status != "healthy") {
            "degraded"
        } else {
            "operational"
        };

        let pending_configuration = self.inner.pending.lock().is_some();
        let memory = self.inner.memory.stats().await;
        let field = self.inner.field.snapshot().await;

        EngineStatus {
            engine_status: engine_status.to_string(),
            active_component_count: capabilities.len(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            active_cycles: self.inner.active_cycles.load(Ordering::SeqCst),
            uptime_seconds: self.inner.started.elapsed().as_secs(),
            pending_configuration,
            capabilities: health,
            performance: self.inner.monitor.snapshot(),
            memory,
            field,
        }
    }

    /// Validates and stages a settings patch for the next cycle. A rejected
    /// patch leaves the engine unchanged.
    pub fn configure(&self, updates: Map<String, Value>) -> EngineResult<ConfigureAck> {
        let mut pending = self.inner.pending.lock();
        let base = match pending.as_ref() {
            Some(staged) => staged.clone(),
            None => (*self.settings()).clone(),
        };
        let next = base.patched(&updates)?;
        *pending = Some(next);
        info!(keys = ?updates.keys().collect::<Vec<_>>(), "Configuration staged");
        Ok(ConfigureAck {
            accepted_keys: updates.keys().cloned().collect(),
            applies_at: "next_cycle",
        })
    }

    /// Cancels in-flight cycles and clears performance history. Field and
    /// memory are left intact.
    pub fn reset(&self) -> ResetAck {
        let previous = std::mem::replace(&mut *self.inner.generation.lock(), CancellationToken::new());
        previous.cancel();
        self.inner.monitor.clear();
        info!("Engine cycle state reset");
        ResetAck {
            reset: "cycle_state".to_string(),
            at: Utc::now(),
        }
    }

    /// Clears process-wide state shared by every cycle.
    #[instrument(skip(self))]
    pub async fn reset_shared_state(&self, scope: ResetScope) -> ResetAck {
        if matches!(scope, ResetScope::Field | ResetScope::All) {
            self.inner.field.reset().await;
        }
        if matches!(scope, ResetScope::Memory | ResetScope::All) {
            self.inner.memory.clear().await;
        }
        warn!(?scope, "Shared reasoning state reset");
        ResetAck {
            reset: match scope {
                ResetScope::Field => "field",
                ResetScope::Memory => "memory",
                ResetScope::All => "field_and_memory",
            }
            .to_string(),
            at: Utc::now(),
        }
    }

    /// Adopts staged settings, if any, and returns the settings for a new cycle.
    fn cycle_settings(&self) -> Arc<Settings> {
        let Some(next) = self.inner.pending.lock().take() else {
            return self.settings();
        };
        let next = Arc::new(next);
        self.inner.field.set_params(next.field.clone());
        self.inner.memory.set_policy(next.memory.clone());
        self.inner.monitor.set_window(next.orchestrator.recent_window);
        *self.inner.settings.write() = next.clone();
        info!("Adopted staged configuration");
        next
    }

    fn prepare(
        &self,
        text: &str,
        context: Context,
        options: &ReasoningOptions,
    ) -> EngineResult<(Query, Arc<Settings>)> {
        let settings = self.cycle_settings();
        let max = settings.orchestrator.max_query_chars;
        let chars = text.chars().count();
        if chars > max {
            return Err(EngineError::Validation(format!(
                "query is {chars} characters; the limit is {max}"
            )));
        }
        if context.keys().any(|k| k.trim().is_empty()) {
            return Err(EngineError::Validation("context keys cannot be empty".to_string()));
        }
        if options
            .task_type
            .as_deref()
            .is_some_and(|t| t.trim().is_empty())
        {
            return Err(EngineError::Validation("task_type cannot be blank".to_string()));
        }
        Ok((Query::new(text, context), settings))
    }

    /// Eligible kinds for `level` that are enabled and registered, in canonical order.
    fn plan(
        &self,
        level: ComplexityLevel,
        settings: &Settings,
    ) -> Vec<(SubsystemKind, Arc<dyn Capability>)> {
        let capabilities = self.inner.capabilities.read();
        level
            .eligible()
            .iter()
            .filter(|kind| settings.is_subsystem_enabled(**kind))
            .filter_map(|kind| capabilities.get(kind).map(|c| (*kind, c.clone())))
            .collect()
    }

    #[instrument(skip_all, fields(cycle))]
    async fn execute(
        &self,
        query: Query,
        options: ReasoningOptions,
        settings: Arc<Settings>,
        cancel: CancellationToken,
        events: Option<mpsc::UnboundedSender<ReasoningEvent>>,
    ) -> ContextualResponse {
        let _active = ActiveCycle::enter(&self.inner.active_cycles);
        let started = Instant::now();
        let cycle_id = Uuid::new_v4();
        tracing::Span::current().record("cycle", tracing::field::display(cycle_id));
        let emit = |event: ReasoningEvent| {
            if let Some(tx) = &events {
                let _ = tx.send(event);
            }
        };
        emit(ReasoningEvent::Started {
            cycle_id,
            query: query.text.clone(),
        });

        if query.is_blank() {
            let entry = ReasoningTraceEntry::note(1, "Empty query; no subsystem invoked");
            emit(ReasoningEvent::Step(entry.clone()));
            let response = ContextualResponse {
                success: true,
                query: query.text.clone(),
                response: "Please provide a question or statement to reason about.".to_string(),
                confidence: EMPTY_QUERY_CONFIDENCE,
                processing_time: started.elapsed().as_secs_f64(),
                components_used: 0,
                reasoning_trace: vec![entry],
                diagnostics: Diagnostics {
                    cycle_id,
                    rationale: "empty query".to_string(),
                    ..Default::default()
                },
            };
            emit(ReasoningEvent::Completed(Box::new(response.clone())));
            return response;
        }

        let assessment = self.inner.assessor.assess(
            &query,
            &self.inner.monitor.snapshot(),
            &settings.orchestrator,
            options.complexity_preference,
        );
        info!(level = %assessment.level, task_type = ?options.task_type, "Reasoning cycle started");
        emit(ReasoningEvent::Assessed {
            level: assessment.level,
            rationale: assessment.rationale.clone(),
        });

        let plan = self.plan(assessment.level, &settings);
        let eligible: Vec<SubsystemKind> = plan.iter().map(|(kind, _)| *kind).collect();
        let generation = self.inner.generation.lock().clone();

        let (invocations, interrupted) = self
            .dispatch(cycle_id, &query, &assessment, &settings, plan, &cancel, &generation, &emit)
            .await;

        let aggregation =
            aggregator::aggregate(&eligible, &invocations, interrupted, &settings.interpretation);

        if aggregation.success && !interrupted {
            let commit = CycleCommit {
                cycle_id,
                query: query.clone(),
                response: aggregation.response.clone(),
                confidence: aggregation.confidence,
                settings: settings.clone(),
            };
            self.commit(&commit, &invocations).await;
        }

        let processing_time = started.elapsed();
        self.inner.monitor.record(CycleSample {
            level: Some(assessment.level),
            success: aggregation.success,
            confidence: aggregation.confidence,
            duration: processing_time,
        });

        let interpretations = invocations
            .iter()
            .filter(|inv| inv.kind == SubsystemKind::Interpretation)
            .find_map(|inv| inv.outcome.output().and_then(|o| o.interpretations.clone()));
        let reasoning_trace = invocations
            .iter()
            .enumerate()
            .map(|(idx, inv)| ReasoningTraceEntry::from_invocation(idx + 1, inv))
            .collect();

        if aggregation.success {
            info!(
                confidence = aggregation.confidence,
                components = aggregation.components_used,
                "Reasoning cycle finished"
            );
        } else {
            warn!(failure = ?aggregation.failure, "Reasoning cycle produced no answer");
        }

        let response = ContextualResponse {
            success: aggregation.success,
            query: query.text.clone(),
            response: aggregation.response,
            confidence: aggregation.confidence,
            processing_time: processing_time.as_secs_f64(),
            components_used: aggregation.components_used,
            reasoning_trace,
            diagnostics: Diagnostics {
                cycle_id,
                level: Some(assessment.level),
                rationale: assessment.rationale,
                degraded: assessment.degraded,
                failure: aggregation.failure,
                failure_reason: aggregation.failure_reason,
                invocations: Arc::from(invocations),
                interpretations,
            },
        };
        emit(ReasoningEvent::Completed(Box::new(response.clone())));
        response
    }

    /// Runs the plan and returns invocations in trace order plus whether the
    /// cycle was interrupted.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        cycle_id: Uuid,
        query: &Query,
        assessment: &Assessment,
        settings: &Arc<Settings>,
        plan: Vec<(SubsystemKind, Arc<dyn Capability>)>,
        cancel: &CancellationToken,
        generation: &CancellationToken,
        emit: &(dyn Fn(ReasoningEvent) + Send + Sync),
    ) -> (Vec<SubsystemInvocation>, bool) {
        let call_timeout = settings.orchestrator.call_timeout();
        let cycle_timeout = settings.orchestrator.cycle_timeout();
        let deadline = Instant::now() + cycle_timeout;

        let request = |representation: Option<Representation>| CapabilityRequest {
            cycle_id,
            query: query.clone(),
            level: assessment.level,
            representation,
            settings: settings.clone(),
        };

        let (dependents, independents): (Vec<_>, Vec<_>) =
            plan.into_iter().partition(|(kind, _)| kind.depends_on_tools());
        let tools_planned = independents
            .iter()
            .any(|(kind, _)| *kind == SubsystemKind::ToolReasoning);

        let mut invocations: Vec<SubsystemInvocation> = Vec::new();
        let record = |invocation: SubsystemInvocation, invocations: &mut Vec<SubsystemInvocation>| {
            if let InvocationOutcome::Failed(failure) = &invocation.outcome {
                warn!(kind = %invocation.kind, reason = failure.reason_code(), "Subsystem failed");
            }
            emit(ReasoningEvent::Step(ReasoningTraceEntry::from_invocation(
                invocations.len() + 1,
                &invocation,
            )));
            invocations.push(invocation);
        };

        let mut set: JoinSet<SubsystemInvocation> = JoinSet::new();
        let mut in_flight: BTreeMap<SubsystemKind, InFlight> = BTreeMap::new();
        let mut waiting = dependents;

        for (kind, capability) in independents {
            spawn_call(&mut set, &mut in_flight, kind, capability, request(None), call_timeout);
        }
        if !tools_planned {
            for (kind, capability) in waiting.drain(..) {
                record(
                    unavailable(kind, capability.name(), request(None).snapshot()),
                    &mut invocations,
                );
            }
        }

        let mut interruption: Option<SubsystemFailure> = None;
        while !set.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interruption = Some(SubsystemFailure::Cancelled);
                    break;
                }
                _ = generation.cancelled() => {
                    interruption = Some(SubsystemFailure::Cancelled);
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    interruption = Some(SubsystemFailure::Timeout(cycle_timeout));
                    break;
                }
                joined = set.join_next() => {
                    let Some(joined) = joined else { break };
                    let invocation = match joined {
                        Ok(invocation) => invocation,
                        Err(error) => {
                            warn!(%error, "capability task ended abnormally");
                            continue;
                        }
                    };
                    in_flight.remove(&invocation.kind);

                    let representation = (invocation.kind == SubsystemKind::ToolReasoning)
                        .then(|| invocation.outcome.output().map(|o| o.representation.clone()))
                        .map(Option::flatten);
                    record(invocation, &mut invocations);

                    if let Some(representation) = representation {
                        for (kind, capability) in waiting.drain(..) {
                            match &representation {
                                Some(rep) => spawn_call(
                                    &mut set,
                                    &mut in_flight,
                                    kind,
                                    capability,
                                    request(Some(rep.clone())),
                                    call_timeout,
                                ),
                                None => record(
                                    unavailable(kind, capability.name(), request(None).snapshot()),
                                    &mut invocations,
                                ),
                            }
                        }
                    }
                }
            }
        }
        if interruption.is_some() {
            // Calls that finished before the interruption was seen are kept.
            while let Some(joined) = set.try_join_next() {
                if let Ok(invocation) = joined {
                    in_flight.remove(&invocation.kind);
                    record(invocation, &mut invocations);
                }
            }
        }
        set.abort_all();

        let leftover = interruption.clone().unwrap_or(SubsystemFailure::Panicked);
        let now = Utc::now();
        for (kind, call) in std::mem::take(&mut in_flight) {
            record(
                SubsystemInvocation {
                    kind,
                    name: call.name,
                    input: call.input,
                    outcome: InvocationOutcome::Failed(leftover.clone()),
                    started_at: call.started_at,
                    finished_at: now,
                    elapsed: call.started.elapsed(),
                },
                &mut invocations,
            );
        }
        for (kind, capability) in waiting {
            record(
                SubsystemInvocation {
                    kind,
                    name: capability.name().to_string(),
                    input: request(None).snapshot(),
                    outcome: InvocationOutcome::Failed(leftover.clone()),
                    started_at: now,
                    finished_at: now,
                    elapsed: Duration::ZERO,
                },
                &mut invocations,
            );
        }

        if let Some(reason) = &interruption {
            let completed = invocations.iter().filter(|i| i.outcome.is_completed()).count();
            warn!(reason = reason.reason_code(), completed, "Reasoning cycle interrupted");
        }
        (invocations, interruption.is_some())
    }

    /// Hands a successful cycle to the capabilities that completed in it.
    async fn commit(&self, commit: &CycleCommit, invocations: &[SubsystemInvocation]) {
        let mut completed: Vec<SubsystemKind> = invocations
            .iter()
            .filter(|inv| inv.outcome.is_completed())
            .map(|inv| inv.kind)
            .collect();
        completed.sort();

        for kind in completed {
            let capability = self.inner.capabilities.read().get(&kind).cloned();
            if let Some(capability) = capability {
                if let Err(failure) = capability.commit(commit).await {
                    warn!(%kind, %failure, "Capability commit failed");
                } else {
                    debug!(%kind, "Capability committed cycle");
                }
            }
        }
    }
}

fn spawn_call(
    set: &mut JoinSet<SubsystemInvocation>,
    in_flight: &mut BTreeMap<SubsystemKind, InFlight>,
    kind: SubsystemKind,
    capability: Arc<dyn Capability>,
    request: CapabilityRequest,
    call_timeout: Duration,
) {
    let input = request.snapshot();
    let started_at = Utc::now();
    let started = Instant::now();
    in_flight.insert(
        kind,
        InFlight {
            name: capability.name().to_string(),
            input: input.clone(),
            started_at,
            started,
        },
    );

    set.spawn(async move {
        let call = AssertUnwindSafe(capability.invoke(&request)).catch_unwind();
        let outcome = match tokio::time::timeout(call_timeout, call).await {
            Ok(Ok(Ok(output))) => InvocationOutcome::Completed(output),
            Ok(Ok(Err(failure))) => InvocationOutcome::Failed(failure),
            Ok(Err(_)) => InvocationOutcome::Failed(SubsystemFailure::Panicked),
            Err(_) => InvocationOutcome::Failed(SubsystemFailure::Timeout(call_timeout)),
        };
        SubsystemInvocation {
            kind,
            name: capability.name().to_string(),
            input,
            outcome,
            started_at,
            finished_at: Utc::now(),
            elapsed: started.elapsed(),
        }
    });
}

fn unavailable(kind: SubsystemKind, name: &str, input: Value) -> SubsystemInvocation {
    let now = Utc::now();
    SubsystemInvocation {
        kind,
        name: name.to_string(),
        input,
        outcome: InvocationOutcome::Failed(SubsystemFailure::DependencyUnavailable(
            SubsystemKind::ToolReasoning.to_string(),
        )),
        started_at: now,
        finished_at: now,
        elapsed: Duration::ZERO,
    }
}

fn failed_response(query: &str, class: FailureClass, reason: String) -> ContextualResponse {
    ContextualResponse {
        success: false,
        query: query.to_string(),
        response: format!("No answer produced: {reason}."),
        confidence: 0.0,
        processing_time: 0.0,
        components_used: 0,
        reasoning_trace: Vec::new(),
        diagnostics: Diagnostics {
            failure: Some(class),
            failure_reason: Some(reason),
            ..Default::default()
        },
    }
}
