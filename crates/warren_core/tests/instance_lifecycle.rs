//! Instance behavior end to end: state sync over the control protocol,
//! RPC dispatch, schedules, queues, hibernation and destruction.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use warren_core::{
    Agent, AgentClass, AgentHandler, AgentRequest, Connection, CoreError, EmailMessage, Result,
    Runtime, RuntimeConfig, ScheduleKind, ScheduleQuery, ScheduleWhen, SocketCommand,
};

struct LabHandler {
    flaky_attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentHandler for LabHandler {
    async fn on_message(&self, agent: &Agent, _conn: &Connection, message: String) -> Result<()> {
        if message == "die" {
            return Err(CoreError::handler("poisoned message"));
        }
        agent.set_state(json!({"last_message": message})).await
    }

    async fn on_email(&self, agent: &Agent, email: EmailMessage) -> Result<()> {
        agent
            .set_state(json!({"last_email_from": email.from}))
            .await
    }
}

fn lab_class(flaky_attempts: Arc<AtomicUsize>) -> AgentClass {
    AgentClass::builder(
        "LabAgent",
        LabHandler {
            flaky_attempts: Arc::clone(&flaky_attempts),
        },
    )
    .callable("setAndFail", |agent, _args| async move {
        agent.set_state(json!({"n": 99})).await?;
        Err(CoreError::handler("boom"))
    })
    .callable("whoAmI", |_agent, _args| async move {
        let ctx = warren_core::current()
            .ok_or_else(|| CoreError::handler("no ambient context"))?;
        Ok(json!({
            "agent": ctx.agent.name(),
            "has_connection": ctx.connection.is_some(),
        }))
    })
    .streaming("streamText", |_agent, _args, sink| async move {
        sink.send(json!("chunk1"))?;
        sink.send(json!("chunk2"))?;
        sink.end(json!("final"))?;
        Ok(Value::Null)
    })
    .callback("record", |agent, payload| async move {
        let state = agent.state();
        let mut fired = state
            .get("fired")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        fired.push(payload);
        agent.set_state(json!({"fired": fired})).await?;
        Ok(Value::Null)
    })
    .callback("flaky", move |agent, payload| {
        let attempts = Arc::clone(&flaky_attempts);
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(CoreError::handler("first attempt fails"));
            }
            agent.set_state(json!({"flaky_fired": payload})).await?;
            Ok(Value::Null)
        }
    })
    .build()
}

fn lab_runtime() -> Runtime {
    Runtime::builder()
        .config(RuntimeConfig::ephemeral())
        .register(lab_class(Arc::new(AtomicUsize::new(0))))
        .build()
        .unwrap()
}

async fn recv_text(rx: &mut tokio::sync::mpsc::UnboundedReceiver<SocketCommand>) -> Value {
    match tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection channel closed")
    {
        SocketCommand::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

// -- State sync --------------------------------------------------------------

#[tokio::test]
async fn client_state_update_broadcasts_to_other_peers() {
    let runtime = lab_runtime();
    let (conn_a, mut rx_a) = Connection::channel();
    let (conn_b, mut rx_b) = Connection::channel();
    runtime.connect("LabAgent", "x", conn_a.clone()).await.unwrap();
    runtime.connect("LabAgent", "x", conn_b.clone()).await.unwrap();

    runtime
        .deliver_message(
            "LabAgent",
            "x",
            conn_a.id(),
            r#"{"type":"cf_agent_state","state":{"counter":1}}"#.to_string(),
        )
        .await
        .unwrap();

    let frame = recv_text(&mut rx_b).await;
    assert_eq!(
        frame,
        json!({"type": "cf_agent_state", "state": {"counter": 1}})
    );
    // The sender does not get an echo.
    assert!(rx_a.try_recv().is_err());

    let resp = runtime
        .deliver_request("LabAgent", "x", AgentRequest::new("GET", "/getState"))
        .await
        .unwrap();
    assert_eq!(resp.json_body().unwrap(), json!({"counter": 1}));
}

#[tokio::test]
async fn server_state_update_broadcasts_to_all_peers() {
    let runtime = lab_runtime();
    let (conn_a, mut rx_a) = Connection::channel();
    let (conn_b, mut rx_b) = Connection::channel();
    runtime.connect("LabAgent", "x", conn_a).await.unwrap();
    runtime.connect("LabAgent", "x", conn_b).await.unwrap();

    runtime
        .with_agent("LabAgent", "x", |agent| async move {
            agent.set_state(json!({"source": "server"})).await
        })
        .await
        .unwrap();

    for rx in [&mut rx_a, &mut rx_b] {
        let frame = recv_text(rx).await;
        assert_eq!(frame["type"], json!("cf_agent_state"));
        assert_eq!(frame["state"], json!({"source": "server"}));
    }
}

// -- RPC ---------------------------------------------------------------------

#[tokio::test]
async fn streaming_rpc_chunks_arrive_in_order() {
    let runtime = lab_runtime();
    let (conn, mut rx) = Connection::channel();
    runtime.connect("LabAgent", "x", conn.clone()).await.unwrap();

    runtime
        .deliver_message(
            "LabAgent",
            "x",
            conn.id(),
            r#"{"type":"rpc","id":"s1","method":"streamText","args":[]}"#.to_string(),
        )
        .await
        .unwrap();

    let expectations = [
        (json!("chunk1"), json!(false)),
        (json!("chunk2"), json!(false)),
        (json!("final"), json!(true)),
    ];
    for (result, done) in expectations {
        let frame = recv_text(&mut rx).await;
        assert_eq!(frame["type"], json!("rpc"));
        assert_eq!(frame["id"], json!("s1"));
        assert_eq!(frame["success"], json!(true));
        assert_eq!(frame["result"], result);
        assert_eq!(frame["done"], done);
    }
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unknown_method_reports_method_not_found() {
    let runtime = lab_runtime();
    let (conn, mut rx) = Connection::channel();
    runtime.connect("LabAgent", "x", conn.clone()).await.unwrap();

    runtime
        .deliver_message(
            "LabAgent",
            "x",
            conn.id(),
            r#"{"type":"rpc","id":"r9","method":"record","args":[]}"#.to_string(),
        )
        .await
        .unwrap();

    // "record" is a callback, not a callable; it must not be invocable.
    let frame = recv_text(&mut rx).await;
    assert_eq!(
        frame,
        json!({"type": "rpc", "id": "r9", "success": false, "error": "method not found"})
    );
}

#[tokio::test]
async fn failed_rpc_rolls_back_state_and_emits_no_broadcast() {
    let runtime = lab_runtime();
    runtime
        .with_agent("LabAgent", "x", |agent| async move {
            agent.set_state(json!({"n": 1})).await
        })
        .await
        .unwrap();

    let (conn_a, mut rx_a) = Connection::channel();
    let (conn_b, mut rx_b) = Connection::channel();
    runtime.connect("LabAgent", "x", conn_a.clone()).await.unwrap();
    runtime.connect("LabAgent", "x", conn_b).await.unwrap();

    runtime
        .deliver_message(
            "LabAgent",
            "x",
            conn_a.id(),
            r#"{"type":"rpc","id":"f1","method":"setAndFail","args":[]}"#.to_string(),
        )
        .await
        .unwrap();

    let frame = recv_text(&mut rx_a).await;
    assert_eq!(frame["success"], json!(false));
    assert_eq!(frame["error"], json!("boom"));

    // No state frame reached the other peer, and the write was undone.
    assert!(rx_b.try_recv().is_err());
    let resp = runtime
        .deliver_request("LabAgent", "x", AgentRequest::new("GET", "/getState"))
        .await
        .unwrap();
    assert_eq!(resp.json_body().unwrap(), json!({"n": 1}));
}

#[tokio::test]
async fn ambient_context_reflects_the_invocation() {
    let runtime = lab_runtime();
    let (conn, mut rx) = Connection::channel();
    runtime.connect("LabAgent", "amb", conn.clone()).await.unwrap();

    // Over a connection the context carries that connection.
    runtime
        .deliver_message(
            "LabAgent",
            "amb",
            conn.id(),
            r#"{"type":"rpc","id":"w1","method":"whoAmI","args":[]}"#.to_string(),
        )
        .await
        .unwrap();
    let frame = recv_text(&mut rx).await;
    assert_eq!(
        frame["result"],
        json!({"agent": "amb", "has_connection": true})
    );

    // Over HTTP JSON-RPC there is no connection.
    let req = AgentRequest::new("POST", "/").with_json(
        &json!({"jsonrpc": "2.0", "method": "whoAmI", "params": [], "id": 1}),
    );
    let resp = runtime
        .deliver_request("LabAgent", "amb", req)
        .await
        .unwrap();
    let body = resp.json_body().unwrap();
    assert_eq!(
        body["result"],
        json!({"agent": "amb", "has_connection": false})
    );
}

// -- Non-protocol traffic -----------------------------------------------------

#[tokio::test]
async fn non_protocol_text_reaches_on_message() {
    let runtime = lab_runtime();
    let (conn, _rx) = Connection::channel();
    runtime.connect("LabAgent", "x", conn.clone()).await.unwrap();

    runtime
        .deliver_message("LabAgent", "x", conn.id(), "plain text ping".to_string())
        .await
        .unwrap();

    let state = runtime
        .with_agent("LabAgent", "x", |agent| async move { Ok(agent.state()) })
        .await
        .unwrap();
    assert_eq!(state, json!({"last_message": "plain text ping"}));
}

#[tokio::test]
async fn ws_handler_error_closes_connection_with_1011() {
    let runtime = lab_runtime();
    let (conn, mut rx) = Connection::channel();
    runtime.connect("LabAgent", "x", conn.clone()).await.unwrap();

    runtime
        .deliver_message("LabAgent", "x", conn.id(), "die".to_string())
        .await
        .unwrap();

    match tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap()
    {
        SocketCommand::Close { code, .. } => assert_eq!(code, 1011),
        other => panic!("expected close, got {other:?}"),
    }
}

// -- Schedules ----------------------------------------------------------------

#[tokio::test]
async fn schedule_round_trips_through_storage() {
    let runtime = lab_runtime();

    let created = runtime
        .with_agent("LabAgent", "s", |agent| async move {
            agent
                .schedule(ScheduleWhen::Delay(3600), "record", json!({"k": 1}))
                .await
        })
        .await
        .unwrap();
    assert_eq!(created.kind, ScheduleKind::Delayed);
    assert_eq!(created.delay_seconds, Some(3600));

    let listed = runtime
        .with_agent("LabAgent", "s", |agent| async move {
            agent.get_schedules(ScheduleQuery::default()).await
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, created.id);
    assert_eq!(listed[0].kind, created.kind);
    assert_eq!(listed[0].time, created.time);
    assert_eq!(listed[0].payload, json!({"k": 1}));

    let cancelled = runtime
        .with_agent("LabAgent", "s", {
            let id = created.id.clone();
            move |agent| async move { agent.cancel_schedule(&id).await }
        })
        .await
        .unwrap();
    assert!(cancelled);
}

#[tokio::test]
async fn delayed_schedule_fires_once() {
    let runtime = lab_runtime();
    runtime
        .with_agent("LabAgent", "d", |agent| async move {
            agent
                .schedule(ScheduleWhen::Delay(1), "record", json!("tick"))
                .await
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let (state, schedules) = runtime
        .with_agent("LabAgent", "d", |agent| async move {
            let schedules = agent.get_schedules(ScheduleQuery::default()).await?;
            Ok((agent.state(), schedules))
        })
        .await
        .unwrap();
    assert_eq!(state, json!({"fired": ["tick"]}));
    assert!(schedules.is_empty(), "one-shot row must be deleted");
}

#[tokio::test]
async fn cron_schedule_stores_and_advances_next_fire() {
    let runtime = lab_runtime();
    let created = runtime
        .with_agent("LabAgent", "c", |agent| async move {
            agent
                .schedule("*/5 * * * *", "record", json!(null))
                .await
        })
        .await
        .unwrap();

    assert_eq!(created.kind, ScheduleKind::Cron);
    assert_eq!(created.cron.as_deref(), Some("*/5 * * * *"));
    assert!(created.time > chrono::Utc::now().timestamp());

    let crons = runtime
        .with_agent("LabAgent", "c", |agent| async move {
            agent
                .get_schedules(ScheduleQuery {
                    kind: Some(ScheduleKind::Cron),
                    ..Default::default()
                })
                .await
        })
        .await
        .unwrap();
    assert_eq!(crons.len(), 1);
}

#[tokio::test]
async fn scheduling_an_unregistered_callback_errors() {
    let runtime = lab_runtime();
    let err = runtime
        .with_agent("LabAgent", "e", |agent| async move {
            agent
                .schedule(ScheduleWhen::Delay(5), "noSuchCallback", json!(null))
                .await
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::CallbackNotFound { .. }));
}

// -- Queue --------------------------------------------------------------------

#[tokio::test]
async fn queue_items_fire_in_insertion_order() {
    let runtime = lab_runtime();
    runtime
        .with_agent("LabAgent", "q", |agent| async move {
            agent.queue("record", json!(1)).await?;
            agent.queue("record", json!(2)).await?;
            agent.queue("record", json!(3)).await?;
            Ok(())
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let (state, remaining) = runtime
        .with_agent("LabAgent", "q", |agent| async move {
            Ok((agent.state(), agent.queued_items().await?))
        })
        .await
        .unwrap();
    assert_eq!(state, json!({"fired": [1, 2, 3]}));
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn failed_queue_item_is_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let runtime = Runtime::builder()
        .config(RuntimeConfig::ephemeral())
        .register(lab_class(Arc::clone(&attempts)))
        .build()
        .unwrap();

    runtime
        .with_agent("LabAgent", "r", |agent| async move {
            agent.queue("flaky", json!("payload")).await?;
            Ok(())
        })
        .await
        .unwrap();

    // First attempt fails; the retry (after the 1s ephemeral retry delay)
    // succeeds and removes the item.
    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert!(attempts.load(Ordering::SeqCst) >= 2);
    let (state, remaining) = runtime
        .with_agent("LabAgent", "r", |agent| async move {
            Ok((agent.state(), agent.queued_items().await?))
        })
        .await
        .unwrap();
    assert_eq!(state["flaky_fired"], json!("payload"));
    assert!(remaining.is_empty());
}

// -- Hibernation and destruction ----------------------------------------------

fn disk_runtime(dir: &std::path::Path) -> Runtime {
    let config = RuntimeConfig {
        data_dir: dir.to_path_buf(),
        ephemeral: false,
        idle_timeout_secs: 1,
        alarm_retry_delay_secs: 1,
    };
    Runtime::builder()
        .config(config)
        .register(lab_class(Arc::new(AtomicUsize::new(0))))
        .build()
        .unwrap()
}

#[tokio::test]
async fn state_survives_hibernation() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = disk_runtime(tmp.path());

    let req = AgentRequest::new("POST", "/setState").with_json(&json!({"v": 1}));
    runtime
        .deliver_request("LabAgent", "h", req)
        .await
        .unwrap();

    // Instance hibernates after the 1s idle timeout; the next request
    // re-hydrates it transparently.
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let resp = runtime
        .deliver_request("LabAgent", "h", AgentRequest::new("GET", "/getState"))
        .await
        .unwrap();
    assert_eq!(resp.json_body().unwrap(), json!({"v": 1}));
}

#[tokio::test]
async fn hibernated_instance_wakes_for_its_schedule() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = disk_runtime(tmp.path());

    runtime
        .with_agent("LabAgent", "w", |agent| async move {
            agent
                .schedule(ScheduleWhen::Delay(3), "record", json!("woke"))
                .await
        })
        .await
        .unwrap();

    // Idle timeout (1s) passes well before the fire time (3s); the wake
    // timer must re-hydrate the instance and replay the fire.
    tokio::time::sleep(Duration::from_millis(5500)).await;

    let resp = runtime
        .deliver_request("LabAgent", "w", AgentRequest::new("GET", "/getState"))
        .await
        .unwrap();
    assert_eq!(resp.json_body().unwrap(), json!({"fired": ["woke"]}));
}

#[tokio::test]
async fn destroy_deletes_all_rows_and_closes_connections() {
    let runtime = lab_runtime();
    let (conn, mut rx) = Connection::channel();
    runtime.connect("LabAgent", "z", conn).await.unwrap();

    runtime
        .with_agent("LabAgent", "z", |agent| async move {
            agent.set_state(json!({"v": 1})).await?;
            agent
                .schedule(ScheduleWhen::Delay(3600), "record", json!(null))
                .await?;
            Ok(())
        })
        .await
        .unwrap();
    // Drain the state broadcast.
    let _ = recv_text(&mut rx).await;

    runtime.destroy("LabAgent", "z").await.unwrap();

    match tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap()
    {
        SocketCommand::Close { code, .. } => assert_eq!(code, 1000),
        other => panic!("expected close, got {other:?}"),
    }

    // A fresh resolution starts from a blank slate.
    let (state, schedules, items) = runtime
        .with_agent("LabAgent", "z", |agent| async move {
            Ok((
                agent.state(),
                agent.get_schedules(ScheduleQuery::default()).await?,
                agent.queued_items().await?,
            ))
        })
        .await
        .unwrap();
    assert_eq!(state, Value::Null);
    assert!(schedules.is_empty());
    assert!(items.is_empty());
}

// -- Email ---------------------------------------------------------------------

#[tokio::test]
async fn email_routes_to_on_email() {
    let runtime = lab_runtime();
    runtime
        .deliver_email(
            "LabAgent",
            "m",
            EmailMessage {
                from: "sender@example.com".to_string(),
                to: "lab-agent+m@agents.example".to_string(),
                subject: Some("hello".to_string()),
                headers: Vec::new(),
                body: "ping".to_string(),
            },
        )
        .await
        .unwrap();

    let state = runtime
        .with_agent("LabAgent", "m", |agent| async move { Ok(agent.state()) })
        .await
        .unwrap();
    assert_eq!(state, json!({"last_email_from": "sender@example.com"}));
}

// -- Chat sync ------------------------------------------------------------------

#[tokio::test]
async fn chat_messages_sync_persists_and_rebroadcasts() {
    let runtime = lab_runtime();
    let (conn_a, _rx_a) = Connection::channel();
    let (conn_b, mut rx_b) = Connection::channel();
    runtime.connect("LabAgent", "chat", conn_a.clone()).await.unwrap();
    runtime.connect("LabAgent", "chat", conn_b).await.unwrap();

    let sync = json!({
        "type": "cf_agent_chat_messages",
        "messages": [
            {"id": "m1", "role": "user", "content": "hi"},
            {"id": "m2", "role": "assistant", "content": "hello"}
        ]
    });
    runtime
        .deliver_message("LabAgent", "chat", conn_a.id(), sync.to_string())
        .await
        .unwrap();

    let frame = recv_text(&mut rx_b).await;
    assert_eq!(frame, sync);

    let log = runtime
        .with_agent("LabAgent", "chat", |agent| async move {
            agent.chat_log().await
        })
        .await
        .unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].id, "m1");
    assert_eq!(log[1].id, "m2");

    runtime
        .deliver_message(
            "LabAgent",
            "chat",
            conn_a.id(),
            r#"{"type":"cf_agent_chat_clear"}"#.to_string(),
        )
        .await
        .unwrap();

    let frame = recv_text(&mut rx_b).await;
    assert_eq!(frame, json!({"type": "cf_agent_chat_clear"}));

    let log = runtime
        .with_agent("LabAgent", "chat", |agent| async move {
            agent.chat_log().await
        })
        .await
        .unwrap();
    assert!(log.is_empty());
}
