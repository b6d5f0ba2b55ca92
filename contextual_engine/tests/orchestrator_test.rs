//! End-to-end cycles against scripted capabilities.

use async_trait::async_trait;
use contextual_engine::capability::{
    Capability, CapabilityHealth, CapabilityOutput, CapabilityRequest, CycleCommit,
};
use contextual_engine::orchestrator::{BatchItem, ReasoningEvent};
use contextual_engine::tools::represent;
use contextual_engine::types::{Context, StepStatus};
use contextual_engine::{
    ComplexityLevel, FailureClass, Orchestrator, ReasoningOptions, Settings, SubsystemFailure,
    SubsystemKind,
};
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum Behavior {
    Answer(f64),
    Fail,
    Panic,
}

struct Scripted {
    kind: SubsystemKind,
    delay: Duration,
    behavior: Behavior,
    commits: Arc<AtomicUsize>,
}

impl Scripted {
    fn new(kind: SubsystemKind, delay_ms: u64, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            kind,
            delay: Duration::from_millis(delay_ms),
            behavior,
            commits: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl Capability for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn kind(&self) -> SubsystemKind {
        self.kind
    }

    async fn invoke(&self, request: &CapabilityRequest) -> Result<CapabilityOutput, SubsystemFailure> {
        tokio::time::sleep(self.delay).await;
        match self.behavior {
            Behavior::Answer(certainty) => {
                let output = CapabilityOutput::new(format!("{} answer", self.kind), certainty);
                if self.kind == SubsystemKind::ToolReasoning {
                    Ok(output.with_representation(represent(&request.query.text, 8)))
                } else {
                    Ok(output)
                }
            }
            Behavior::Fail => Err(SubsystemFailure::failed("scripted_failure", "told to fail")),
            Behavior::Panic => panic!("scripted panic"),
        }
    }

    async fn health_check(&self) -> CapabilityHealth {
        CapabilityHealth::default()
    }

    async fn commit(&self, _commit: &CycleCommit) -> Result<(), SubsystemFailure> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Engine whose five subsystems are scripted `(kind, delay_ms, behavior)`.
fn scripted_engine(script: &[(SubsystemKind, u64, Behavior)]) -> (Orchestrator, Vec<Arc<Scripted>>) {
    let engine = Orchestrator::new(Settings::default()).unwrap();
    let fakes: Vec<_> = script
        .iter()
        .map(|(kind, delay, behavior)| Scripted::new(*kind, *delay, *behavior))
        .collect();
    for fake in &fakes {
        engine.register_capability(fake.clone());
    }
    (engine, fakes)
}

fn deepest() -> ReasoningOptions {
    ReasoningOptions {
        complexity_preference: Some(ComplexityLevel::NeuralField),
        ..Default::default()
    }
}

fn order(response: &contextual_engine::ContextualResponse) -> Vec<SubsystemKind> {
    response.invocations().iter().map(|i| i.kind).collect()
}

use Behavior::*;
use SubsystemKind::*;

#[tokio::test(start_paused = true)]
async fn trace_follows_completion_order() {
    let (engine, _) = scripted_engine(&[
        (ToolReasoning, 10, Answer(1.0)),
        (Memory, 300, Answer(1.0)),
        (FieldResonance, 100, Answer(1.0)),
        (Symbolic, 50, Answer(1.0)),
        (Interpretation, 400, Answer(1.0)),
    ]);

    let response = engine.reason("why is the sky blue", Context::new(), deepest()).await.unwrap();

    assert!(response.success);
    assert_eq!(
        order(&response),
        vec![ToolReasoning, Symbolic, FieldResonance, Memory, Interpretation]
    );
    let steps: Vec<_> = response.reasoning_trace.iter().map(|e| e.step).collect();
    assert_eq!(steps, vec![1, 2, 3, 4, 5]);
    assert!((response.confidence - 100.0).abs() < 1e-9);
    assert!(response.response.starts_with("[Structured reasoning]"));
}

#[tokio::test(start_paused = true)]
async fn one_failure_lowers_confidence_but_keeps_the_answer() {
    let (engine, fakes) = scripted_engine(&[
        (ToolReasoning, 10, Answer(1.0)),
        (Memory, 20, Fail),
        (FieldResonance, 20, Answer(1.0)),
        (Symbolic, 20, Answer(1.0)),
        (Interpretation, 20, Answer(1.0)),
    ]);

    let response = engine.reason("why is the sky blue", Context::new(), deepest()).await.unwrap();

    assert!(response.success);
    assert_eq!(response.components_used, 4);
    // weight 0.85 of 1.0 completed, one of five failed
    assert!((response.confidence - 85.0 * 0.95).abs() < 1e-6);
    assert!(!response.response.contains("[Memory recall]"));

    let memory = response.invocations().iter().find(|i| i.kind == Memory).unwrap();
    assert_eq!(memory.outcome.failure().unwrap().reason_code(), "scripted_failure");
    let failed_steps = response
        .reasoning_trace
        .iter()
        .filter(|e| e.status == StepStatus::Failed)
        .count();
    assert_eq!(failed_steps, 1);

    // Completed subsystems see the commit; the failed one does not.
    assert_eq!(fakes[0].commits.load(Ordering::SeqCst), 1);
    assert_eq!(fakes[1].commits.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn all_failures_produce_a_diagnosis() {
    let (engine, fakes) = scripted_engine(&[
        (ToolReasoning, 10, Fail),
        (Memory, 10, Fail),
        (FieldResonance, 10, Panic),
        (Symbolic, 10, Answer(1.0)),
        (Interpretation, 10, Answer(1.0)),
    ]);

    let response = engine.reason("why is the sky blue", Context::new(), deepest()).await.unwrap();

    assert!(!response.success);
    assert_eq!(response.confidence, 0.0);
    assert_eq!(response.components_used, 0);
    assert_eq!(response.failure(), Some(FailureClass::TotalFailure));
    assert!(response.response.contains("field_resonance: panicked"));
    assert_eq!(response.reasoning_trace.len(), 5);
    assert!(fakes.iter().all(|f| f.commits.load(Ordering::SeqCst) == 0));
}

#[tokio::test(start_paused = true)]
async fn tool_failure_makes_dependents_unavailable() {
    let (engine, _) = scripted_engine(&[
        (ToolReasoning, 10, Fail),
        (Memory, 20, Answer(0.8)),
        (FieldResonance, 20, Answer(0.8)),
        (Symbolic, 5, Answer(1.0)),
        (Interpretation, 5, Answer(1.0)),
    ]);

    let response = engine.reason("why is the sky blue", Context::new(), deepest()).await.unwrap();

    assert!(response.success);
    for kind in [Symbolic, Interpretation] {
        let invocation = response.invocations().iter().find(|i| i.kind == kind).unwrap();
        assert!(matches!(
            invocation.outcome.failure(),
            Some(SubsystemFailure::DependencyUnavailable(_))
        ));
    }
    assert_eq!(response.components_used, 2);
}

#[tokio::test(start_paused = true)]
async fn panicking_subsystem_is_contained() {
    let (engine, _) = scripted_engine(&[
        (ToolReasoning, 10, Answer(1.0)),
        (Memory, 10, Answer(1.0)),
        (FieldResonance, 10, Answer(1.0)),
        (Symbolic, 10, Panic),
        (Interpretation, 10, Answer(1.0)),
    ]);

    let response = engine.reason("why is the sky blue", Context::new(), deepest()).await.unwrap();

    assert!(response.success);
    assert_eq!(response.components_used, 4);
    let symbolic = response.invocations().iter().find(|i| i.kind == Symbolic).unwrap();
    assert_eq!(symbolic.outcome.failure(), Some(&SubsystemFailure::Panicked));
}

#[tokio::test(start_paused = true)]
async fn slow_subsystem_times_out() {
    let (engine, _) = scripted_engine(&[
        (ToolReasoning, 10, Answer(1.0)),
        (Memory, 10_000, Answer(1.0)),
        (FieldResonance, 10, Answer(1.0)),
        (Symbolic, 10, Answer(1.0)),
        (Interpretation, 10, Answer(1.0)),
    ]);
    engine
        .configure(json!({"orchestrator": {"call_timeout_ms": 200}}).as_object().cloned().unwrap())
        .unwrap();

    let response = engine.reason("why is the sky blue", Context::new(), deepest()).await.unwrap();

    assert!(response.success);
    let memory = response.invocations().iter().find(|i| i.kind == Memory).unwrap();
    assert_eq!(
        memory.outcome.failure(),
        Some(&SubsystemFailure::Timeout(Duration::from_millis(200)))
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_keeps_completed_contributions() {
    let (engine, fakes) = scripted_engine(&[
        (ToolReasoning, 10, Answer(1.0)),
        (Memory, 1_000, Answer(1.0)),
        (FieldResonance, 1_000, Answer(1.0)),
        (Symbolic, 1_000, Answer(1.0)),
        (Interpretation, 1_000, Answer(1.0)),
    ]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let response = engine
        .reason_with_cancel("why is the sky blue", Context::new(), deepest(), cancel)
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.components_used, 1);
    assert_eq!(response.reasoning_trace.len(), 5);
    let cancelled = response
        .invocations()
        .iter()
        .filter(|i| i.outcome.failure() == Some(&SubsystemFailure::Cancelled))
        .count();
    assert_eq!(cancelled, 4);
    // Interrupted cycles never commit.
    assert!(fakes.iter().all(|f| f.commits.load(Ordering::SeqCst) == 0));
}

#[tokio::test(start_paused = true)]
async fn cancellation_before_any_result_is_reported() {
    let (engine, _) = scripted_engine(&[
        (ToolReasoning, 1_000, Answer(1.0)),
        (Memory, 1_000, Answer(1.0)),
        (FieldResonance, 1_000, Answer(1.0)),
        (Symbolic, 1_000, Answer(1.0)),
        (Interpretation, 1_000, Answer(1.0)),
    ]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let response = engine
        .reason_with_cancel("why is the sky blue", Context::new(), deepest(), cancel)
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(response.failure(), Some(FailureClass::Cancelled));
    assert_eq!(response.confidence, 0.0);
    assert_eq!(response.invocations().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn reset_cancels_in_flight_cycles() {
    let (engine, _) = scripted_engine(&[
        (ToolReasoning, 1_000, Answer(1.0)),
        (Memory, 1_000, Answer(1.0)),
        (FieldResonance, 1_000, Answer(1.0)),
        (Symbolic, 1_000, Answer(1.0)),
        (Interpretation, 1_000, Answer(1.0)),
    ]);

    let running = engine.clone();
    let cycle = tokio::spawn(async move {
        running.reason("why is the sky blue", Context::new(), deepest()).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.reset();

    let response = cycle.await.unwrap().unwrap();
    assert_eq!(response.failure(), Some(FailureClass::Cancelled));

    // Later cycles run normally.
    let next = engine.reason("why is the sky blue", Context::new(), deepest()).await.unwrap();
    assert!(next.success);
    assert_eq!(engine.get_status().await.active_cycles, 0);
}

#[tokio::test(start_paused = true)]
async fn stream_reports_steps_and_ends_with_response() {
    let (engine, _) = scripted_engine(&[
        (ToolReasoning, 10, Answer(1.0)),
        (Memory, 30, Answer(1.0)),
        (FieldResonance, 20, Answer(1.0)),
        (Symbolic, 10, Answer(1.0)),
        (Interpretation, 10, Fail),
    ]);

    let events: Vec<ReasoningEvent> = engine
        .reason_stream("why is the sky blue", Context::new(), deepest())
        .unwrap()
        .collect()
        .await;

    assert!(matches!(events.first(), Some(ReasoningEvent::Started { .. })));
    let steps = events
        .iter()
        .filter(|e| matches!(e, ReasoningEvent::Step(_)))
        .count();
    assert_eq!(steps, 5);
    match events.last() {
        Some(ReasoningEvent::Completed(response)) => {
            assert!(response.success);
            assert_eq!(response.reasoning_trace.len(), steps);
        }
        other => panic!("expected final response, got {other:?}"),
    }
}

#[tokio::test]
async fn stream_rejects_invalid_input_up_front() {
    let engine = Orchestrator::new(Settings::default()).unwrap();
    let mut context = Context::new();
    context.insert(" ".to_string(), json!("x"));
    assert!(engine
        .reason_stream("hello", context, ReasoningOptions::default())
        .is_err());
}

#[tokio::test]
async fn batch_items_are_independent() {
    let engine = Orchestrator::new(Settings::default()).unwrap();
    let mut bad_context = Context::new();
    bad_context.insert(String::new(), json!(1));

    let items = vec![
        BatchItem {
            query: "What causes ocean tides?".to_string(),
            context: Context::new(),
            options: ReasoningOptions::default(),
        },
        BatchItem {
            query: "this one has a bad context".to_string(),
            context: bad_context,
            options: ReasoningOptions::default(),
        },
        BatchItem {
            query: "Compare TCP and UDP".to_string(),
            context: Context::new(),
            options: ReasoningOptions {
                complexity_preference: Some(ComplexityLevel::Organ),
                ..Default::default()
            },
        },
    ];

    let report = engine.run_batch(items, None).await;

    assert_eq!(report.responses.len(), 3);
    assert_eq!(report.responses[0].query, "What causes ocean tides?");
    assert!(report.responses[0].success);
    assert!(!report.responses[1].success);
    assert_eq!(report.responses[1].failure(), Some(FailureClass::Validation));
    assert!(report.responses[2].success);
    assert_eq!(report.responses[2].level(), Some(ComplexityLevel::Organ));
    assert!((report.success_rate - 2.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn batch_pairs_queries_with_contexts() {
    let engine = Orchestrator::new(Settings::default()).unwrap();
    let mut law = Context::new();
    law.insert("domain".to_string(), json!("law"));

    let report = engine
        .reason_batch(
            vec!["What is a tort?".to_string(), "   ".to_string()],
            Some(vec![law, Context::new()]),
        )
        .await
        .unwrap();

    assert_eq!(report.responses.len(), 2);
    assert!(report.responses.iter().all(|r| r.success));
    assert_eq!(report.responses[1].components_used, 0);
    assert_eq!(report.success_rate, 1.0);
}

#[tokio::test]
async fn repeated_queries_build_memory_and_field_state() {
    let engine = Orchestrator::new(Settings::default()).unwrap();
    for _ in 0..3 {
        let response = engine
            .reason(
                "How does photosynthesis convert light into chemical energy?",
                Context::new(),
                deepest(),
            )
            .await
            .unwrap();
        assert!(response.success);
    }

    let status = engine.get_status().await;
    assert_eq!(status.performance.total_cycles, 3);
    assert_eq!(status.memory.stores, 3);
    assert_eq!(status.memory.retrievals, 3);
    assert!(status.memory.records >= 1);
    // The same query reinforces one pattern rather than adding new ones.
    assert_eq!(status.field.patterns, 1);
    assert_eq!(status.engine_status, "operational");
}

#[tokio::test]
async fn disabled_subsystems_are_skipped() {
    let engine = Orchestrator::new(Settings::default()).unwrap();
    engine
        .configure(
            json!({"orchestrator": {"enabled_subsystems": ["tool_reasoning", "memory"]}})
                .as_object()
                .cloned()
                .unwrap(),
        )
        .unwrap();

    let response = engine
        .reason("Explain how vaccines train the immune system", Context::new(), deepest())
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(order(&response).len(), 2);
    assert!(order(&response).iter().all(|k| matches!(k, ToolReasoning | Memory)));
}

#[tokio::test]
async fn trace_records_ruled_out_readings() {
    let engine = Orchestrator::new(Settings::default()).unwrap();
    let mut context = Context::new();
    context.insert("domain".to_string(), json!("poetry"));

    let response = engine
        .reason(
            "The storm in her heart finally passed",
            context,
            ReasoningOptions {
                complexity_preference: Some(ComplexityLevel::Organ),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let set = response.diagnostics.interpretations.clone().unwrap();
    let selected = set.selected.as_ref().unwrap().perspective;
    let wire = serde_json::to_string(&response.reasoning_trace).unwrap();
    let ruled_out: Vec<_> = set.candidates.iter().filter(|c| c.perspective != selected).collect();

    assert!(!ruled_out.is_empty());
    for candidate in ruled_out {
        assert!(wire.contains(&candidate.meaning), "{:?} missing from trace", candidate.perspective);
    }
}

#[tokio::test(start_paused = true)]
async fn call_finishing_with_the_cancellation_is_kept() {
    let (engine, _) = scripted_engine(&[
        (ToolReasoning, 100, Answer(1.0)),
        (Memory, 1_000, Answer(1.0)),
        (FieldResonance, 1_000, Answer(1.0)),
        (Symbolic, 1_000, Answer(1.0)),
        (Interpretation, 1_000, Answer(1.0)),
    ]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let response = engine
        .reason_with_cancel("why is the sky blue", Context::new(), deepest(), cancel)
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.components_used, 1);
    let tool = response.invocations().iter().find(|i| i.kind == ToolReasoning).unwrap();
    assert!(tool.outcome.is_completed());
    assert_eq!(response.invocations()[0].kind, ToolReasoning);
}

/// Tool reasoner that records how many calls overlap.
#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Capability for Gauge {
    fn name(&self) -> &str {
        "gauge"
    }

    fn kind(&self) -> SubsystemKind {
        ToolReasoning
    }

    async fn invoke(&self, _request: &CapabilityRequest) -> Result<CapabilityOutput, SubsystemFailure> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(CapabilityOutput::new("measured", 1.0))
    }

    async fn health_check(&self) -> CapabilityHealth {
        CapabilityHealth::default()
    }
}

#[tokio::test(start_paused = true)]
async fn batch_limit_applies_to_one_batch_only() {
    let engine = Orchestrator::new(Settings::default()).unwrap();
    let gauge = Arc::new(Gauge::default());
    engine.register_capability(gauge.clone());

    let items: Vec<BatchItem> = (0..6)
        .map(|i| BatchItem {
            query: format!("question number {i}"),
            context: Context::new(),
            options: ReasoningOptions {
                complexity_preference: Some(ComplexityLevel::Atom),
                ..Default::default()
            },
        })
        .collect();

    let report = engine.run_batch(items.clone(), Some(1)).await;
    assert_eq!(report.success_rate, 1.0);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    assert_eq!(engine.settings().orchestrator.max_concurrent_cycles, 4);

    gauge.peak.store(0, Ordering::SeqCst);
    engine.run_batch(items, None).await;
    assert!(gauge.peak.load(Ordering::SeqCst) > 1);
}
