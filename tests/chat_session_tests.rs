use std::sync::Arc;
use std::time::Duration;

use axum::routing::post;
use axum::Router;
use serde_json::json;

use llamadesk::client::{ClientConfig, LlmClient};
use llamadesk::protocol::Role;
use llamadesk::session::{Session, SessionEvent, EXECUTION_RESULT_PREFIX};

// Serves one canned NDJSON body on /api/chat, waiting `delay` first so tests
// can observe the in-flight window.
async fn serve_raw_body(body: String, delay: Duration) -> String {
    let app = Router::new().route(
        "/api/chat",
        post(move || {
            let body = body.clone();
            async move {
                tokio::time::sleep(delay).await;
                body
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    endpoint
}

async fn serve_answer(lines: &[serde_json::Value]) -> String {
    let body: String = lines.iter().map(|line| format!("{line}\n")).collect();
    serve_raw_body(body, Duration::ZERO).await
}

fn session_at(endpoint: &str) -> Arc<Session> {
    let client = LlmClient::new(ClientConfig {
        endpoint: endpoint.to_string(),
        model: "llama2".to_string(),
        timeout: Duration::from_secs(10),
    })
    .unwrap();
    Arc::new(Session::new(client))
}

#[tokio::test]
async fn send_extract_execute_round_trip() {
    let endpoint = serve_answer(&[
        json!({"message": {"role": "assistant", "content": "Here's a program:\n"}, "done": false}),
        json!({"message": {"role": "assistant", "content": "```rust\nprint!(\"hello from the model\");\n```"}, "done": false}),
        json!({"message": {"role": "assistant", "content": ""}, "done": true}),
    ])
    .await;
    let session = session_at(&endpoint);

    session.send_user_message("example").await;

    let turns = session.turns().await;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    let assistant = &turns[1];
    assert_eq!(assistant.role, Role::Assistant);
    assert!(!assistant.is_error);
    assert!(assistant.has_code);
    assert_eq!(
        assistant.code_block.as_deref(),
        Some("print!(\"hello from the model\");")
    );
    assert!(!assistant.text.contains("```"));
    assert!(assistant.text.contains("Here's a program:"));

    session.execute_code(assistant.id).await;

    let turns = session.turns().await;
    assert_eq!(turns.len(), 3);
    let result = &turns[2];
    assert!(result.is_execution_result);
    assert!(!result.is_error);
    assert!(result.text.starts_with(EXECUTION_RESULT_PREFIX));
    assert!(result.text.contains("hello from the model"));
}

#[tokio::test]
async fn busy_brackets_the_send_cycle() {
    let endpoint = serve_answer(&[
        json!({"message": {"role": "assistant", "content": "hi"}, "done": true}),
    ])
    .await;
    let session = session_at(&endpoint);
    let mut events = session.subscribe();

    session.send_user_message("hello").await;
    assert!(!session.busy().await);

    assert!(matches!(
        events.recv().await,
        Ok(SessionEvent::BusyChanged(true))
    ));
    assert!(matches!(
        events.recv().await,
        Ok(SessionEvent::TurnAppended(turn)) if turn.role == Role::User
    ));
    assert!(matches!(
        events.recv().await,
        Ok(SessionEvent::TurnAppended(turn)) if turn.role == Role::Assistant && turn.text == "hi"
    ));
    assert!(matches!(
        events.recv().await,
        Ok(SessionEvent::BusyChanged(false))
    ));
}

#[tokio::test]
async fn concurrent_send_is_rejected_inside_the_core() {
    let body = format!(
        "{}\n",
        json!({"message": {"role": "assistant", "content": "slow answer"}, "done": true})
    );
    let endpoint = serve_raw_body(body, Duration::from_millis(300)).await;
    let session = session_at(&endpoint);
    let mut events = session.subscribe();

    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.send_user_message("first").await })
    };

    // Wait until the first send is in flight, then try a second one.
    assert!(matches!(
        events.recv().await,
        Ok(SessionEvent::BusyChanged(true))
    ));
    session.send_user_message("second").await;

    first.await.unwrap();

    let turns = session.turns().await;
    assert_eq!(turns.len(), 2, "the second send must not append turns");
    assert_eq!(turns[0].text, "first");
    assert_eq!(turns[1].text, "slow answer");
}

#[tokio::test]
async fn noisy_stream_lines_are_skipped() {
    let body = format!(
        "{}\nnot json at all\n\n{}\n{{\"broken\":\n{}\n",
        json!({"message": {"role": "assistant", "content": "Hello "}, "done": false}),
        json!({"message": {"role": "assistant", "content": "world"}, "done": false}),
        json!({"message": {"role": "assistant", "content": ""}, "done": true}),
    );
    let endpoint = serve_raw_body(body, Duration::ZERO).await;
    let session = session_at(&endpoint);

    session.send_user_message("anyone there?").await;

    let turns = session.turns().await;
    assert_eq!(turns[1].text, "Hello world");
    assert!(!turns[1].is_error);
}

#[tokio::test]
async fn stream_ending_without_done_still_yields_the_answer() {
    let body = format!(
        "{}\n",
        json!({"message": {"role": "assistant", "content": "cut off mid-"}, "done": false})
    );
    let endpoint = serve_raw_body(body, Duration::ZERO).await;
    let session = session_at(&endpoint);

    session.send_user_message("talk to me").await;

    let turns = session.turns().await;
    assert_eq!(turns[1].text, "cut off mid-");
    assert!(!turns[1].is_error);
}
