//! Full agent-turn integration: a canned streaming completion endpoint on one
//! side, the fake DAW on the other, with the approval gate in between.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use deskconf::{AgentConfig, ObserverConfig};
use deskhand::agent::AgentLoop;
use deskhand::events::SessionEvent;
use deskhand::indexer;
use deskhand::sessions::{SessionRegistry, SessionState};
use liveosc::testing::{FakeDevice, FakeLive, FakeParam, FakeTrack};
use liveosc::{LiveBridge, OscTransport};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

// --- Canned completion endpoint -------------------------------------------

#[derive(Clone)]
struct LlmState {
    turns: Arc<Vec<String>>,
    next: Arc<AtomicUsize>,
}

async fn messages_handler(State(state): State<LlmState>) -> impl IntoResponse {
    let index = state.next.fetch_add(1, Ordering::SeqCst);
    let body = state
        .turns
        .get(index)
        .cloned()
        .unwrap_or_else(|| text_turn("no more canned turns"));
    ([(header::CONTENT_TYPE, "text/event-stream")], body)
}

async fn spawn_llm(turns: Vec<String>) -> SocketAddr {
    let state = LlmState {
        turns: Arc::new(turns),
        next: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/v1/messages", post(messages_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn sse(name: &str, data: Value) -> String {
    format!("event: {}\ndata: {}\n\n", name, data)
}

fn text_frames(text: &str, index: usize) -> String {
    sse(
        "content_block_start",
        json!({"type":"content_block_start","index":index,"content_block":{"type":"text","text":""}}),
    ) + &sse(
        "content_block_delta",
        json!({"type":"content_block_delta","index":index,"delta":{"type":"text_delta","text":text}}),
    ) + &sse(
        "content_block_stop",
        json!({"type":"content_block_stop","index":index}),
    )
}

fn text_turn(text: &str) -> String {
    sse("message_start", json!({"type":"message_start"}))
        + &text_frames(text, 0)
        + &sse("message_stop", json!({"type":"message_stop"}))
}

fn tool_turn(text: &str, tool_id: &str, tool_name: &str, input: Value) -> String {
    sse("message_start", json!({"type":"message_start"}))
        + &text_frames(text, 0)
        + &sse(
            "content_block_start",
            json!({"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":tool_id,"name":tool_name,"input":{}}}),
        )
        + &sse(
            "content_block_delta",
            json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":input.to_string()}}),
        )
        + &sse(
            "content_block_stop",
            json!({"type":"content_block_stop","index":1}),
        )
        + &sse("message_stop", json!({"type":"message_stop"}))
}

// --- DAW fixture -----------------------------------------------------------

fn fixture() -> Vec<FakeTrack> {
    vec![
        FakeTrack::new(
            "Drums",
            vec![FakeDevice::new(
                "Kit",
                "DrumGroupDevice",
                vec![FakeParam::new("Volume", 0.8, 0.0, 1.0)],
            )],
        ),
        FakeTrack::new(
            "Bass",
            vec![
                FakeDevice::new(
                    "Op",
                    "InstrumentDevice",
                    vec![FakeParam::new("Osc Level", 0.5, 0.0, 1.0)],
                ),
                FakeDevice::new(
                    "Verb",
                    "Reverb",
                    vec![
                        FakeParam::new("Predelay", 2.5, 0.0, 250.0),
                        FakeParam::new("Size", 100.0, 0.22, 500.0),
                        FakeParam::new("Decay", 1200.0, 200.0, 60_000.0),
                        FakeParam::new("Freeze", 0.0, 0.0, 1.0),
                        FakeParam::new("Reflect", 0.5, 0.0, 1.0),
                        FakeParam::new("Dry/Wet", 0.6, 0.0, 1.0),
                    ],
                ),
            ],
        ),
    ]
}

async fn setup(llm: SocketAddr) -> (FakeLive, Arc<SessionState>, Arc<AgentLoop>) {
    let fake = FakeLive::spawn(fixture()).await.unwrap();
    let transport = Arc::new(OscTransport::bind(0, fake.addr()).await.unwrap());
    let bridge = Arc::new(LiveBridge::new(
        transport,
        Duration::from_millis(500),
        Duration::from_millis(500),
    ));
    let registry = Arc::new(SessionRegistry::new(
        bridge.clone(),
        ObserverConfig::default(),
    ));
    let (session, _) = registry.get_or_create("s1", "p1");
    indexer::run(session.clone(), bridge.clone()).await;
    assert!(session.mirror.is_indexed());

    std::env::set_var("DESKHAND_TEST_API_KEY", "test-key");
    let agent_config = AgentConfig {
        api_base: format!("http://{}", llm),
        api_key_env: "DESKHAND_TEST_API_KEY".to_string(),
        ..AgentConfig::default()
    };
    let agent = Arc::new(AgentLoop::new(&agent_config, bridge).unwrap());
    (fake, session, agent)
}

/// Receive events until (and including) the first one `stop` matches.
async fn recv_until(
    rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    events: &mut Vec<SessionEvent>,
    stop: impl Fn(&SessionEvent) -> bool,
) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        let done = stop(&event);
        events.push(event);
        if done {
            break;
        }
    }
}

fn kinds(events: &[SessionEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e {
            SessionEvent::Text { .. } => "text",
            SessionEvent::FunctionCall { .. } => "function_call",
            SessionEvent::FunctionResult { .. } => "function_result",
            SessionEvent::EndMessage => "end_message",
            SessionEvent::ParameterChange { .. } => "parameter_change",
            SessionEvent::IndexingStatus { .. } => "indexing_status",
            SessionEvent::Error { .. } => "error",
            SessionEvent::ApprovalRequired { .. } => "approval_required",
        })
        .collect()
}

// --- Scenarios -------------------------------------------------------------

#[tokio::test]
async fn approved_mutation_flows_end_to_end() {
    let llm = spawn_llm(vec![
        tool_turn(
            "Okay, reducing it now.",
            "toolu_01",
            "set_device_parameter",
            json!({"track_id": 1, "device_id": 1, "param_id": 5, "value": 0.3}),
        ),
        text_turn("Done - Dry/Wet is at 0.30 now."),
    ])
    .await;
    let (fake, session, agent) = setup(llm).await;

    let mut rx = session.subscribe();
    let turn = {
        let session = session.clone();
        let agent = agent.clone();
        tokio::spawn(async move {
            agent
                .run_turn(session, "turn down the reverb on Bass".to_string(), CancellationToken::new())
                .await;
        })
    };

    let mut events = Vec::new();
    recv_until(&mut rx, &mut events, |e| {
        matches!(e, SessionEvent::ApprovalRequired { .. })
    })
    .await;

    let id = match events.last().unwrap() {
        SessionEvent::ApprovalRequired { requests } => {
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].name, "set_device_parameter");
            requests[0].tool_call_id.clone()
        }
        other => panic!("expected approval_required, got {:?}", other),
    };
    assert!(session.resolve_approvals(HashMap::from([(id, true)])));

    turn.await.unwrap();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert_eq!(
        kinds(&events),
        vec![
            "text",
            "end_message",
            "approval_required",
            "function_call",
            "function_result",
            "text",
            "end_message",
        ]
    );

    match &events[4] {
        SessionEvent::FunctionResult {
            content, is_error, ..
        } => {
            assert!(is_error.is_none());
            let value: Value = serde_json::from_str(content).unwrap();
            assert_eq!(value["from"], "0.60");
            assert_eq!(value["to"], "0.30");
            assert_eq!(value["device_name"], "Verb");
            assert_eq!(value["parameter_name"], "Dry/Wet");
        }
        other => panic!("expected function_result, got {:?}", other),
    }

    // Raw index on the wire is effective + 2.
    assert_eq!(fake.sets(), vec![(1, 1, 7, 0.3)]);

    // user, assistant(tool), user(tool_result), assistant
    assert_eq!(session.history.lock().await.len(), 4);
}

#[tokio::test]
async fn denied_mutation_sends_no_osc() {
    let llm = spawn_llm(vec![
        tool_turn(
            "Reducing the reverb.",
            "toolu_02",
            "set_device_parameter",
            json!({"track_id": 1, "device_id": 1, "param_id": 5, "value": 0.3}),
        ),
        text_turn("Understood, leaving it as it is."),
    ])
    .await;
    let (fake, session, agent) = setup(llm).await;

    let mut rx = session.subscribe();
    let turn = {
        let session = session.clone();
        let agent = agent.clone();
        tokio::spawn(async move {
            agent
                .run_turn(session, "turn down the reverb".to_string(), CancellationToken::new())
                .await;
        })
    };

    let mut events = Vec::new();
    recv_until(&mut rx, &mut events, |e| {
        matches!(e, SessionEvent::ApprovalRequired { .. })
    })
    .await;
    let id = match events.last().unwrap() {
        SessionEvent::ApprovalRequired { requests } => requests[0].tool_call_id.clone(),
        other => panic!("expected approval_required, got {:?}", other),
    };
    assert!(session.resolve_approvals(HashMap::from([(id.clone(), false)])));

    turn.await.unwrap();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    let result = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::FunctionResult { content, .. } => Some(content.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(result, "denied by user");

    // No set ever reached the DAW.
    assert!(fake.sets().is_empty());

    // The denial went back to the model as a tool result.
    let history = session.history.lock().await;
    let tool_results: Vec<_> = history
        .iter()
        .flat_map(|m| &m.content)
        .filter_map(|block| match block {
            deskhand::agent::claude::ContentBlock::ToolResult { content, .. } => {
                Some(content.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(tool_results, vec!["denied by user"]);
}

#[tokio::test]
async fn out_of_range_set_becomes_a_tool_error() {
    let llm = spawn_llm(vec![
        tool_turn(
            "Setting it.",
            "toolu_03",
            "set_device_parameter",
            json!({"track_id": 1, "device_id": 1, "param_id": 5, "value": 4.0}),
        ),
        text_turn("That value is out of range for Dry/Wet."),
    ])
    .await;
    let (fake, session, agent) = setup(llm).await;

    let mut rx = session.subscribe();
    let turn = {
        let session = session.clone();
        let agent = agent.clone();
        tokio::spawn(async move {
            agent
                .run_turn(session, "crank the reverb to 4".to_string(), CancellationToken::new())
                .await;
        })
    };

    let mut events = Vec::new();
    recv_until(&mut rx, &mut events, |e| {
        matches!(e, SessionEvent::ApprovalRequired { .. })
    })
    .await;
    let id = match events.last().unwrap() {
        SessionEvent::ApprovalRequired { requests } => requests[0].tool_call_id.clone(),
        other => panic!("expected approval_required, got {:?}", other),
    };
    session.resolve_approvals(HashMap::from([(id, true)]));

    turn.await.unwrap();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    let (content, is_error) = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::FunctionResult {
                content, is_error, ..
            } => Some((content.clone(), *is_error)),
            _ => None,
        })
        .unwrap();
    assert_eq!(is_error, Some(true));
    assert!(content.contains("out of range"));
    assert!(fake.sets().is_empty());
}

#[tokio::test]
async fn read_tools_execute_without_approval() {
    let llm = spawn_llm(vec![
        tool_turn(
            "Let me look at the mixer.",
            "toolu_04",
            "enumerate_mixer",
            json!({}),
        ),
        text_turn("You have Drums and Bass."),
    ])
    .await;
    let (_fake, session, agent) = setup(llm).await;

    let mut rx = session.subscribe();
    agent
        .run_turn(session.clone(), "what tracks do I have?".to_string(), CancellationToken::new())
        .await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    // No approval round-trip for a read tool.
    assert_eq!(
        kinds(&events),
        vec![
            "text",
            "end_message",
            "function_call",
            "function_result",
            "text",
            "end_message",
        ]
    );

    let content = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::FunctionResult { content, .. } => Some(content.clone()),
            _ => None,
        })
        .unwrap();
    let value: Value = serde_json::from_str(&content).unwrap();
    assert_eq!(value["tracks"][0]["name"], "Drums");
    assert_eq!(value["tracks"][1]["devices"][1]["name"], "Verb");
    // Structure only; parameters stay behind get_device_parameters.
    assert!(value["tracks"][0]["devices"][0].get("parameters").is_none());
}

#[tokio::test]
async fn stream_failure_emits_error_and_ends_the_turn() {
    // An endpoint that truncates mid-message.
    let llm = spawn_llm(vec![sse(
        "content_block_start",
        json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}),
    )])
    .await;
    let (_fake, session, agent) = setup(llm).await;

    let mut rx = session.subscribe();
    agent
        .run_turn(session.clone(), "hello".to_string(), CancellationToken::new())
        .await;

    let mut saw_error = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, SessionEvent::Error { .. }) {
            saw_error = true;
        }
    }
    assert!(saw_error);
}
