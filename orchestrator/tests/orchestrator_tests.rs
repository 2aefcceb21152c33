#![allow(clippy::unwrap_used)]
//! End-to-end routing behavior against scripted agents.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use pretty_assertions::assert_eq;
use switchyard_orchestrator::AttemptStatus;
use switchyard_orchestrator::Orchestrator;
use switchyard_orchestrator::OrchestratorConfig;
use switchyard_orchestrator::RoutingMode;
use switchyard_orchestrator::events::EventMsg;
use switchyard_orchestrator::session::UsageLevel;
use switchyard_orchestrator::signal::CONTEXT_SHARED;
use switchyard_orchestrator::store::ShareOptions;
use switchyard_protocol::AgentDescriptor;
use switchyard_protocol::ContextPackage;
use switchyard_protocol::ErrorClass;
use switchyard_protocol::HealthState;
use switchyard_protocol::Requirement;
use switchyard_protocol::RequirementKind;
use switchyard_protocol::ResponseStatus;
use switchyard_protocol::Task;
use switchyard_protocol::TaskType;
use switchyard_protocol::context::SemanticContext;
use switchyard_test_support::Behavior;
use switchyard_test_support::ScriptedExecutor;

const WAIT: Duration = Duration::from_secs(30);

fn config(terminal: Option<&str>) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.router.terminal_agent = terminal.map(str::to_string);
    config.router.default_timeout_ms = 1_000;
    config.health.failure_threshold = 3;
    config.health.cooldown_ms = 1_000;
    config
}

fn code_agent(id: &str) -> AgentDescriptor {
    AgentDescriptor::new(id, [TaskType::Code])
}

fn code_task(id: &str) -> Task {
    Task::new(TaskType::Code, "implement X").with_id(id)
}

async fn health_of(orchestrator: &Orchestrator, agent_id: &str) -> HealthState {
    orchestrator
        .registry()
        .snapshot()
        .await
        .into_iter()
        .find(|agent| agent.agent_id == agent_id)
        .map(|agent| agent.health)
        .unwrap()
}

fn attempt_log(outcome: &switchyard_orchestrator::TaskOutcome) -> Vec<(String, AttemptStatus)> {
    outcome
        .attempts
        .iter()
        .map(|attempt| (attempt.agent_id.clone(), attempt.status))
        .collect()
}

#[tokio::test]
async fn fallback_walks_chain_in_rank_order() {
    let orchestrator = Orchestrator::builder(config(None))
        .agent(code_agent("a"), ScriptedExecutor::failing("a broke").shared())
        .agent(code_agent("b"), ScriptedExecutor::failing("b broke").shared())
        .agent(code_agent("c"), ScriptedExecutor::succeeding("done by c").shared())
        .build()
        .await
        .unwrap();

    let handle = orchestrator.submit(code_task("t-1")).await.unwrap();
    let outcome = orchestrator.await_task(&handle, WAIT).await.unwrap();

    assert_eq!(outcome.response.status, ResponseStatus::Success);
    assert_eq!(outcome.response.agent_id, "c");
    assert_eq!(outcome.response.result.as_deref(), Some("done by c"));
    assert_eq!(
        attempt_log(&outcome),
        vec![
            ("a".to_string(), AttemptStatus::Failed),
            ("b".to_string(), AttemptStatus::Failed),
            ("c".to_string(), AttemptStatus::Success),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn primary_timeout_falls_back_to_terminal() {
    let primary = ScriptedExecutor::hanging().shared();
    let orchestrator = Orchestrator::builder(config(Some("terminal")))
        .agent(code_agent("primary"), primary.clone())
        .agent(
            AgentDescriptor::new("terminal", [TaskType::Reasoning]),
            ScriptedExecutor::succeeding("fallback answer").shared(),
        )
        .build()
        .await
        .unwrap();
    let task = Task::new(TaskType::Code, "implement X")
        .with_requirement(Requirement::new("r1", RequirementKind::Functional, "implement X"));

    let handle = orchestrator.submit(task.clone()).await.unwrap();
    let outcome = orchestrator.await_task(&handle, WAIT).await.unwrap();

    assert_eq!(outcome.response.status, ResponseStatus::Success);
    assert_eq!(outcome.attempts.len(), 2);
    assert_eq!(outcome.attempts[0].error, Some(ErrorClass::Timeout));
    assert_eq!(outcome.response.metadata.correlation_id, task.correlation_id);
    assert_eq!(
        primary.cancellations().await,
        vec![(task.correlation_id.clone(), 0)]
    );
}

#[tokio::test]
async fn every_task_resolves_exactly_once() {
    let orchestrator = Orchestrator::builder(config(Some("terminal")))
        .agent(
            code_agent("coin"),
            ScriptedExecutor::scripted(
                (0..20)
                    .map(|i| {
                        if i % 3 == 0 {
                            Behavior::fail("flaked")
                        } else {
                            Behavior::succeed("ok")
                        }
                    })
                    .collect(),
                Behavior::succeed("ok"),
            )
            .shared(),
        )
        .agent(
            code_agent("terminal"),
            ScriptedExecutor::succeeding("terminal ok").shared(),
        )
        .build()
        .await
        .unwrap();
    let mut stream = orchestrator.events().stream();

    let mut handles = Vec::new();
    for i in 0..12 {
        handles.push(orchestrator.submit(code_task(&format!("t-{i}"))).await.unwrap());
    }
    let outcomes = join_all(handles.iter().map(|handle| orchestrator.await_task(handle, WAIT))).await;

    for (handle, outcome) in handles.iter().zip(outcomes) {
        let outcome = outcome.unwrap();
        assert_eq!(outcome.task_id, handle.task_id());
        assert!(outcome.response.is_success());
        assert_eq!(orchestrator.poll(handle).unwrap().response, outcome.response);
    }
    let mut completions: HashMap<String, usize> = HashMap::new();
    while let Ok(event) = stream.try_recv() {
        if let EventMsg::TaskCompleted { task_id, .. } = event.msg {
            *completions.entry(task_id).or_default() += 1;
        }
    }
    assert_eq!(completions.len(), 12);
    assert!(completions.values().all(|count| *count == 1));
    assert_eq!(orchestrator.health().await.active_tasks, 0);
}

#[tokio::test(start_paused = true)]
async fn tripped_agent_is_skipped_until_half_open_probe_succeeds() {
    let flaky = ScriptedExecutor::scripted(
        vec![
            Behavior::fail("down"),
            Behavior::fail("down"),
            Behavior::fail("down"),
        ],
        Behavior::succeed("back"),
    )
    .shared();
    let orchestrator = Orchestrator::builder(config(Some("terminal")))
        .agent(code_agent("flaky"), flaky.clone())
        .agent(code_agent("terminal"), ScriptedExecutor::succeeding("covered").shared())
        .build()
        .await
        .unwrap();

    for i in 0..3 {
        let handle = orchestrator.submit(code_task(&format!("fail-{i}"))).await.unwrap();
        let outcome = orchestrator.await_task(&handle, WAIT).await.unwrap();
        assert_eq!(outcome.response.agent_id, "terminal");
    }
    assert_eq!(health_of(&orchestrator, "flaky").await, HealthState::Tripped);

    let handle = orchestrator.submit(code_task("excluded")).await.unwrap();
    let outcome = orchestrator.await_task(&handle, WAIT).await.unwrap();
    assert_eq!(outcome.chain.agent_ids(), vec!["terminal"]);
    assert_eq!(flaky.call_count().await, 3);

    tokio::time::advance(Duration::from_millis(1_100)).await;
    let handle = orchestrator.submit(code_task("probe")).await.unwrap();
    let outcome = orchestrator.await_task(&handle, WAIT).await.unwrap();

    assert_eq!(
        attempt_log(&outcome),
        vec![("flaky".to_string(), AttemptStatus::Success)]
    );
    assert_eq!(health_of(&orchestrator, "flaky").await, HealthState::Healthy);
}

#[tokio::test]
async fn batched_siblings_fail_independently() {
    let orchestrator = Orchestrator::builder(config(None))
        .agent(
            code_agent("solo"),
            ScriptedExecutor::scripted(
                vec![
                    Behavior::succeed("first"),
                    Behavior::fail_permanently("second broke"),
                    Behavior::succeed("third"),
                ],
                Behavior::succeed("more"),
            )
            .shared(),
        )
        .build()
        .await
        .unwrap();

    let mut handles = Vec::new();
    for id in ["t-1", "t-2", "t-3"] {
        handles.push(orchestrator.submit(code_task(id)).await.unwrap());
    }
    let outcomes = join_all(handles.iter().map(|handle| orchestrator.await_task(handle, WAIT))).await;

    let statuses: Vec<(String, ResponseStatus)> = outcomes
        .into_iter()
        .map(|outcome| {
            let outcome = outcome.unwrap();
            (outcome.task_id, outcome.response.status)
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("t-1".to_string(), ResponseStatus::Success),
            ("t-2".to_string(), ResponseStatus::Failure),
            ("t-3".to_string(), ResponseStatus::Success),
        ]
    );
    assert_eq!(orchestrator.context().batch.stats().batches, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_resolves_task_and_notifies_backend() {
    let mut config = config(None);
    config.batch.enabled = false;
    config.router.default_timeout_ms = 60_000;
    let slow = ScriptedExecutor::hanging().shared();
    let orchestrator = Orchestrator::builder(config)
        .agent(code_agent("slow"), slow.clone())
        .build()
        .await
        .unwrap();

    let handle = orchestrator.submit(code_task("t-1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(orchestrator.poll(&handle).is_none());
    orchestrator.cancel(&handle);
    let outcome = orchestrator.await_task(&handle, WAIT).await.unwrap();

    assert_eq!(outcome.response.error_class(), Some(ErrorClass::Cancelled));
    assert_eq!(
        slow.cancellations().await,
        vec![(handle.correlation_id().to_string(), 0)]
    );
}

#[tokio::test(start_paused = true)]
async fn task_cancelled_inside_batch_window_is_never_dispatched() {
    let mut config = config(None);
    config.batch.window_ms = 200;
    let agent = ScriptedExecutor::succeeding("too late").shared();
    let orchestrator = Orchestrator::builder(config)
        .agent(code_agent("solo"), agent.clone())
        .build()
        .await
        .unwrap();

    let handle = orchestrator.submit(code_task("t-1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    orchestrator.cancel(&handle);
    let outcome = orchestrator.await_task(&handle, WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(outcome.response.error_class(), Some(ErrorClass::Cancelled));
    assert_eq!(agent.call_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn await_timeout_leaves_task_running() {
    let mut config = config(None);
    config.router.default_timeout_ms = 5_000;
    let orchestrator = Orchestrator::builder(config)
        .agent(
            code_agent("slow"),
            ScriptedExecutor::always(Behavior::Delay(
                Duration::from_secs(2),
                Box::new(Behavior::succeed("eventually")),
            ))
            .shared(),
        )
        .build()
        .await
        .unwrap();

    let handle = orchestrator.submit(code_task("t-1")).await.unwrap();
    let err = orchestrator
        .await_task(&handle, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Timeout);

    let outcome = orchestrator.await_task(&handle, WAIT).await.unwrap();
    assert_eq!(outcome.response.result.as_deref(), Some("eventually"));
}

#[tokio::test]
async fn mode_change_applies_to_next_submission() {
    let orchestrator = Orchestrator::builder(config(Some("terminal")))
        .agent(code_agent("primary"), ScriptedExecutor::failing("nope").shared())
        .agent(code_agent("secondary"), ScriptedExecutor::succeeding("second").shared())
        .agent(code_agent("terminal"), ScriptedExecutor::succeeding("last resort").shared())
        .build()
        .await
        .unwrap();

    assert_eq!(orchestrator.set_mode(RoutingMode::PrimaryOnly).await, RoutingMode::All);
    let handle = orchestrator.submit(code_task("t-1")).await.unwrap();
    let outcome = orchestrator.await_task(&handle, WAIT).await.unwrap();
    assert_eq!(outcome.mode, RoutingMode::PrimaryOnly);
    assert_eq!(
        attempt_log(&outcome),
        vec![
            ("primary".to_string(), AttemptStatus::Failed),
            ("terminal".to_string(), AttemptStatus::Success),
        ]
    );

    orchestrator.set_mode(RoutingMode::TerminalOnly).await;
    let handle = orchestrator.submit(code_task("t-2")).await.unwrap();
    let outcome = orchestrator.await_task(&handle, WAIT).await.unwrap();
    assert_eq!(outcome.chain.agent_ids(), vec!["terminal"]);
}

#[tokio::test]
async fn explicit_quota_reply_trips_agent_and_fails_over() {
    let orchestrator = Orchestrator::builder(config(None))
        .agent(
            code_agent("metered"),
            ScriptedExecutor::always(Behavior::FailWithText(
                "Quota exceeded. Your limit resets at 2099-01-01T00:00:00Z".to_string(),
            ))
            .shared(),
        )
        .agent(code_agent("spare"), ScriptedExecutor::succeeding("spare ok").shared())
        .build()
        .await
        .unwrap();
    let mut stream = orchestrator.events().stream();

    let handle = orchestrator.submit(code_task("t-1")).await.unwrap();
    let outcome = orchestrator.await_task(&handle, WAIT).await.unwrap();

    assert_eq!(outcome.response.agent_id, "spare");
    assert_eq!(outcome.attempts[0].error, Some(ErrorClass::QuotaExceeded));
    assert_eq!(health_of(&orchestrator, "metered").await, HealthState::Tripped);
    assert_eq!(orchestrator.health().await.active_tasks, 0);
    let usage = orchestrator.session().usage("metered").await.unwrap();
    assert!(usage.quota_hold);
    assert_eq!(usage.reset_at.unwrap().to_rfc3339(), "2099-01-01T00:00:00+00:00");

    let mut failovers = Vec::new();
    while let Ok(event) = stream.try_recv() {
        if let EventMsg::FailoverRequired { agent_id, level, .. } = event.msg {
            failovers.push((agent_id, level));
        }
    }
    assert_eq!(failovers, vec![("metered".to_string(), UsageLevel::Emergency)]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_resolves_outstanding_tasks() {
    let orchestrator = Orchestrator::builder(config(None))
        .agent(code_agent("slow"), ScriptedExecutor::hanging().shared())
        .build()
        .await
        .unwrap();
    orchestrator.start();

    let mut handles = Vec::new();
    for i in 0..3 {
        handles.push(orchestrator.submit(code_task(&format!("t-{i}"))).await.unwrap());
    }
    orchestrator.shutdown().await;

    for handle in &handles {
        let outcome = orchestrator.poll(handle).unwrap();
        assert!(!outcome.response.is_success());
    }
    assert!(orchestrator.submit(code_task("late")).await.is_err());
}

#[tokio::test]
async fn auto_tasks_are_classified_before_routing() {
    let reasoner = ScriptedExecutor::succeeding("because").shared();
    let orchestrator = Orchestrator::builder(config(None))
        .agent(code_agent("coder"), ScriptedExecutor::succeeding("code").shared())
        .agent(AgentDescriptor::new("reasoner", [TaskType::Reasoning]), reasoner.clone())
        .build()
        .await
        .unwrap();
    let text = "Explain why the scheduler design starves low priority jobs and compare alternatives";

    let first = orchestrator.classify(text, None);
    assert_eq!(first, orchestrator.classify(text, None));
    assert_eq!(first.task_type, TaskType::Reasoning);

    let handle = orchestrator.submit(Task::new(TaskType::Auto, text)).await.unwrap();
    let outcome = orchestrator.await_task(&handle, WAIT).await.unwrap();

    assert_eq!(outcome.classification, first);
    assert_eq!(outcome.response.agent_id, "reasoner");
    assert_eq!(reasoner.calls().await[0].task_type, TaskType::Reasoning);
}

#[tokio::test]
async fn agents_hand_off_context_through_the_store() {
    let orchestrator = Orchestrator::builder(config(None)).build().await.unwrap();
    let package = ContextPackage {
        semantic: Some(SemanticContext {
            summary: "parser rewrite in progress".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };

    let id = orchestrator
        .store()
        .share_context("planner", "coder", package.clone(), ShareOptions::default())
        .await
        .unwrap();

    assert_eq!(
        orchestrator.store().retrieve_context(&id).await.unwrap(),
        Some(package)
    );
    let pending = orchestrator.signals().take_pending("coder").await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].name, CONTEXT_SHARED);
    assert_eq!(pending[0].data["context_id"], id.as_str());

    let store = Arc::clone(orchestrator.store());
    let token = store.lock("plan").await.unwrap();
    let err = store
        .write("plan", serde_json::json!({"step": 2}), None)
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::LockConflict);
    store
        .write("plan", serde_json::json!({"step": 2}), Some(token.as_str()))
        .await
        .unwrap();
    store.unlock("plan", &token).await.unwrap();
}
