//! End-to-end tests across facade → queue → worker → pipeline → store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use crate::config::TraceConfig;
use crate::events::{Event, EventPayload, EventType};
use crate::pipeline::REDACTION_MARKER;
use crate::queue::EventQueue;
use crate::storage::{test_util, ListRunsFilter, RunStatus, StorageExporter, TraceStore};
use crate::trace::{RunOptions, Trace};
use crate::worker::Worker;

async fn setup(mutate: impl FnOnce(&mut TraceConfig)) -> (Trace, TraceStore, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = TraceConfig::default();
    config.db_path = dir.path().join("trace.db").to_str().unwrap().to_string();
    config.sample_rate = 1.0;
    config.batch_size = 16;
    config.batch_timeout_ms = 20;
    mutate(&mut config);

    let trace = Trace::new(config.clone()).await.unwrap();
    let reader = TraceStore::open(&config).await.unwrap();
    (trace, reader, dir)
}

#[tokio::test]
async fn happy_path_single_run_with_redaction() {
    let (trace, reader, _dir) = setup(|c| {
        c.redact_keys = vec!["api_key".to_string()];
        c.redact_patterns = Vec::new();
    })
    .await;

    let run_id = trace.scope("demo", RunOptions::default(), |ctx| {
        ctx.llm("m", "hi", "hello", None, None);
        ctx.tool(
            "search",
            json!({"q": "x", "api_key": "SEKRET"}),
            json!({"hits": 1}),
        );
        ctx.final_answer("done");
        ctx.run_id().to_string()
    });
    trace.shutdown().await;

    let detail = reader.get_run(&run_id).await.unwrap();
    assert_eq!(detail.run.status, RunStatus::Completed);
    assert_eq!(detail.run.name, "demo");
    assert!(detail.run.ended_at_ms.is_some());
    assert_eq!(detail.step_count, 5);
    assert_eq!(detail.error_count, 0);

    let timeline = reader.get_timeline(&run_id).await.unwrap();
    let kinds: Vec<&str> = timeline.iter().map(|t| t.event_type.as_str()).collect();
    assert_eq!(
        kinds,
        ["run_start", "llm_call", "tool_call", "final_answer", "run_end"]
    );

    let steps = reader.get_steps(&run_id, None, None, 0).await.unwrap();
    let tool = &steps[2];
    let data = tool.data.as_ref().unwrap();
    assert_eq!(data["tool_args"]["api_key"], REDACTION_MARKER);
    assert_eq!(data["tool_args"]["q"], "x");
    assert_eq!(data["tool_result"]["hits"], 1);
}

#[tokio::test]
async fn round_trip_export_matches_inputs() {
    let (trace, reader, _dir) = setup(|c| {
        c.redact_keys = vec!["api_key".to_string()];
        c.redact_patterns = Vec::new();
    })
    .await;

    let run_id = trace.scope("demo", RunOptions::default(), |ctx| {
        ctx.llm("m", "hi", "hello", None, None);
        ctx.tool(
            "search",
            json!({"q": "x", "api_key": "SEKRET"}),
            json!({"hits": 1}),
        );
        ctx.final_answer("done");
        ctx.run_id().to_string()
    });
    trace.shutdown().await;

    let export = reader.export_run(&run_id).await.unwrap();
    assert_eq!(export.run.id, run_id);
    assert_eq!(export.timeline.len(), 5);

    let llm = export.timeline[1].data.as_ref().unwrap();
    assert_eq!(llm["model"], "m");
    assert_eq!(llm["prompt"], "hi");
    assert_eq!(llm["response"], "hello");

    let tool = export.timeline[2].data.as_ref().unwrap();
    assert_eq!(tool["tool_args"]["q"], "x");
    assert_eq!(tool["tool_args"]["api_key"], REDACTION_MARKER);

    let answer = export.timeline[3].data.as_ref().unwrap();
    assert_eq!(answer["answer"], "done");

    // Stored order follows emission order.
    let event_ids: Vec<i64> = export.timeline.iter().map(|s| s.event_id).collect();
    assert_eq!(event_ids, [0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn only_on_error_completed_run_leaves_no_rows() {
    let (trace, reader, _dir) = setup(|c| c.only_on_error = true).await;

    trace.scope("fine", RunOptions::default(), |ctx| {
        ctx.llm("m", "p", "r", None, None);
        ctx.final_answer("ok");
    });
    trace.shutdown().await;

    let stats = reader.stats().await.unwrap();
    assert_eq!(stats.total_runs, 0);
    assert_eq!(stats.total_steps, 0);
}

#[tokio::test]
async fn only_on_error_failed_run_persists_in_order() {
    let (trace, reader, _dir) = setup(|c| c.only_on_error = true).await;

    let ctx = trace.start_run("doomed", RunOptions::default());
    let run_id = ctx.run_id().to_string();
    ctx.llm("m", "p", "r", None, None);
    ctx.error("Boom", "it broke", true, None);
    ctx.fail();
    trace.shutdown().await;

    let detail = reader.get_run(&run_id).await.unwrap();
    assert_eq!(detail.run.status, RunStatus::Failed);
    let timeline = reader.get_timeline(&run_id).await.unwrap();
    let kinds: Vec<&str> = timeline.iter().map(|t| t.event_type.as_str()).collect();
    assert_eq!(kinds, ["run_start", "llm_call", "error", "run_end"]);
}

#[tokio::test]
async fn queue_overflow_drops_excess_tool_calls() {
    let (store, _dir) = test_util::temp_store().await;
    store
        .apply_batch(&[test_util::insert_run_op("r-over", 1000)])
        .await
        .unwrap();

    let mut config = TraceConfig::default();
    config.compression_enabled = false;
    config.batch_size = 1000;
    // Effectively paused: nothing flushes until shutdown drains.
    config.batch_timeout_ms = 1_000_000;

    let (queue, rx, counters) = EventQueue::bounded(4);
    let exporter = Arc::new(StorageExporter::new(
        store.clone(),
        &config,
        Arc::clone(&counters),
    ));

    // Fill the queue before any consumer exists: four fit, six drop.
    for i in 0..10 {
        let mut event = Event::new(
            "r-over",
            i,
            EventPayload::ToolCall {
                tool_name: "t".into(),
                tool_args: json!({"i": i}),
                tool_result: json!(null),
            },
        );
        event.timestamp_ms = 1000 + i as i64;
        queue.try_emit(event);
    }
    assert_eq!(counters.dropped_count(EventType::ToolCall), 6);

    // Resume: the worker drains the surviving events.
    let worker = Worker::spawn(rx, exporter, Arc::clone(&counters), &config);
    worker.shutdown().await;

    let steps = store.get_steps("r-over", None, None, 0).await.unwrap();
    assert_eq!(steps.len(), 4);
    let ids: Vec<i64> = steps.iter().map(|s| s.event_id).collect();
    assert_eq!(ids, [0, 1, 2, 3]);
}

#[tokio::test]
async fn sampling_cutoff_stores_nothing() {
    let (trace, reader, _dir) = setup(|c| c.sample_rate = 0.0).await;

    for i in 0..100 {
        trace.scope(&format!("run-{i}"), RunOptions::default(), |ctx| {
            ctx.llm("m", "p", "r", None, None);
            ctx.tool("t", json!({}), json!(null));
        });
    }
    trace.shutdown().await;

    let stats = reader.stats().await.unwrap();
    assert_eq!(stats.total_runs, 0);
    assert_eq!(stats.total_steps, 0);
}

#[tokio::test]
async fn retention_prune_cascades() {
    let (trace, reader, _dir) = setup(|_| {}).await;
    trace.shutdown().await;

    let now = crate::events::now_ms();
    reader
        .apply_batch(&[
            test_util::insert_run_op("recent", now - 10 * 86_400_000),
            test_util::insert_step_op("recent", 0, "run_start", now - 10 * 86_400_000),
            test_util::insert_run_op("old", now - 40 * 86_400_000),
            test_util::insert_step_op("old", 0, "run_start", now - 40 * 86_400_000),
            test_util::insert_step_op("old", 1, "tool_call", now - 40 * 86_400_000 + 1),
        ])
        .await
        .unwrap();

    assert_eq!(reader.prune(30).await.unwrap(), 1);
    assert!(reader.run_exists("recent").await.unwrap());
    assert!(!reader.run_exists("old").await.unwrap());
    let stats = reader.stats().await.unwrap();
    assert_eq!(stats.total_runs, 1);
    assert_eq!(stats.total_steps, 1);
}

#[tokio::test]
async fn blocked_run_end_drops_and_run_stays_running() {
    let (store, _dir) = test_util::temp_store().await;
    let mut config = TraceConfig::default();
    config.compression_enabled = false;

    let (queue, _rx, counters) = EventQueue::bounded(1);
    let exporter = StorageExporter::new(store.clone(), &config, Arc::clone(&counters));

    // The run began normally and its start already reached storage.
    let mut run_start = Event::new(
        "r-stuck",
        0,
        EventPayload::RunStart {
            name: "stuck".into(),
            user_id: None,
            session_id: None,
            parent_run_id: None,
        },
    );
    run_start.timestamp_ms = 1000;
    crate::exporter::Exporter::export_batch(&exporter, &[run_start])
        .await
        .unwrap();

    // Queue full with no consumer: the bounded wait expires and the
    // terminator drops.
    let mut filler = Event::new(
        "r-stuck",
        1,
        EventPayload::ToolCall {
            tool_name: "fills-queue".into(),
            tool_args: json!({}),
            tool_result: json!(null),
        },
    );
    filler.timestamp_ms = 1001;
    assert!(queue.try_emit(filler));

    let mut run_end = Event::new(
        "r-stuck",
        2,
        EventPayload::RunEnd {
            final_status: crate::events::RunOutcome::Completed,
        },
    );
    run_end.timestamp_ms = 1002;
    let started = std::time::Instant::now();
    let sent = queue.emit_critical(run_end, Duration::from_millis(100)).await;
    assert!(!sent);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(counters.dropped_count(EventType::RunEnd), 1);

    // The terminator never arrived; retention will reap the run later.
    let detail = store.get_run("r-stuck").await.unwrap();
    assert_eq!(detail.run.status, RunStatus::Running);
}

#[tokio::test]
async fn shutdown_then_emit_stores_nothing_new() {
    let (trace, reader, _dir) = setup(|_| {}).await;

    let run_id = trace.scope("first", RunOptions::default(), |ctx| {
        ctx.final_answer("ok");
        ctx.run_id().to_string()
    });
    trace.shutdown().await;
    trace.shutdown().await;

    trace.scope("late", RunOptions::default(), |ctx| {
        ctx.tool("ignored", json!({}), json!(null));
    });
    trace.shutdown().await;

    let (runs, total) = reader.list_runs(&ListRunsFilter::default()).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(runs[0].id, run_id);
}
