//! End-to-end pipeline tests: build a subsystem from hooks, route messages
//! through accept/tick, and observe statistics and the error store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nerva_core::prelude::*;
use nerva_core::{ErrorQuery, FacetParts};
use serde_json::{json, Value};

fn message(sub: &Subsystem, path: &str, body: Value) -> Message {
    sub.context()
        .factory()
        .create(path, body, CreateOptions::default())
        .unwrap()
}

#[tokio::test]
async fn accept_tick_roundtrip_with_stats() {
    let sub = Subsystem::builder("orders").create();
    sub.build().await.unwrap();

    let handled = Arc::new(AtomicUsize::new(0));
    let seen = handled.clone();
    sub.register_route(
        "place/{sku}",
        handler(move |msg, params, _opts| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(json!({
                    "sku": params["sku"],
                    "qty": msg.body()["qty"],
                }))
            }
        }),
        RouteMetadata::default(),
    )
    .unwrap();

    for qty in 1..=3 {
        let msg = message(&sub, "orders://place/widget", json!({ "qty": qty }));
        sub.accept(msg, DispatchOptions::default()).await.unwrap();
    }
    assert_eq!(sub.queue_size(), 3);

    let processed = sub.process_slice(Duration::from_secs(1)).await;
    assert_eq!(processed, 3);
    assert_eq!(handled.load(Ordering::SeqCst), 3);

    let stats = sub.stats_snapshot().unwrap();
    assert_eq!(stats.accepted, 3);
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.errors, 0);
}

#[tokio::test]
async fn handler_failures_land_in_the_error_store() {
    let sub = Subsystem::builder("flaky").create();
    sub.build().await.unwrap();
    sub.register_route(
        "bad",
        handler(|_m, _p, _o| async { Err(KernelError::internal("nope")) }),
        RouteMetadata::default(),
    )
    .unwrap();

    let msg = message(&sub, "flaky://bad", Value::Null);
    sub.accept(msg, DispatchOptions::default()).await.unwrap();
    assert!(sub.process_tick().await.unwrap().is_err());

    let store = sub.error_store().unwrap();
    let records = store.query(&ErrorQuery {
        kind: Some(ErrorKind::Internal),
        ..Default::default()
    });
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].subsystem, "flaky");
}

#[tokio::test]
async fn custom_hook_composes_with_defaults() {
    struct AuditLog {
        entries: std::sync::Mutex<Vec<String>>,
    }

    let sub = Subsystem::builder("audited")
        .hook(
            Hook::new("audit", |_build| {
                Ok(FacetParts::new(AuditLog {
                    entries: std::sync::Mutex::new(Vec::new()),
                }))
            })
            .attach(),
        )
        .create();
    sub.build().await.unwrap();

    let audit = sub.api_get::<AuditLog>("audit").unwrap();
    let log = sub.facet::<AuditLog>("audit").unwrap();
    sub.register_route(
        "act",
        handler(move |_m, _p, _o| {
            let log = log.clone();
            async move {
                log.entries.lock().unwrap().push("acted".into());
                Ok(Value::Null)
            }
        }),
        RouteMetadata::default(),
    )
    .unwrap();

    let msg = message(&sub, "audited://act", Value::Null);
    sub.process_immediately(msg, DispatchOptions::default())
        .await
        .unwrap();
    assert_eq!(*audit.entries.lock().unwrap(), vec!["acted".to_string()]);
}

#[tokio::test]
async fn fixed_meta_survives_the_whole_pipeline() {
    let sub = Subsystem::builder("frozen").create();
    sub.build().await.unwrap();
    sub.register_route(
        "check",
        handler(|msg, _p, _o| async move {
            // Handlers may annotate the mutable half freely.
            msg.set_runtime_key("hop", json!(1));
            Ok(json!(msg.trace_id().to_string()))
        }),
        RouteMetadata::default(),
    )
    .unwrap();

    let msg = message(&sub, "frozen://check", Value::Null);
    let fixed_before = msg.fixed_arc();
    let trace = msg.trace_id();

    sub.accept(msg.clone(), DispatchOptions::default())
        .await
        .unwrap();
    let result = sub.process_tick().await.unwrap().unwrap();

    assert_eq!(result, json!(trace.to_string()));
    assert!(Arc::ptr_eq(&fixed_before, &msg.fixed_arc()));
    assert_eq!(msg.runtime_key("hop"), Some(json!(1)));
}
