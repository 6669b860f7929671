//! Integration tests for Parley: cross-layer flows through the engine, the
//! HTTP router and a real WebSocket.

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    use crate::auth::admin::AdminAuth;
    use crate::auth::media_token::{MediaTokenIssuer, WebhookVerifier};
    use crate::engine::events::{ClientMessage, JoinRoomRequest, ServerEvent};
    use crate::engine::registry::Connection;
    use crate::engine::voice_engine::{EngineSettings, VoiceEngine};
    use crate::web::app_state::{AppState, ConnectionTimeouts};
    use crate::web::rate_limit::ApiRateLimiters;
    use crate::web::router::build_router;

    const ADMIN_PASSWORD: &str = "hunter2";

    // ── Helpers ──────────────────────────────────────────────────

    fn setup_engine() -> Arc<VoiceEngine> {
        let engine = Arc::new(VoiceEngine::new(
            Arc::new(MediaTokenIssuer::new("devkey", "secret", "ws://media.test")),
            AdminAuth::new(ADMIN_PASSWORD, vec![]),
            EngineSettings {
                presence_interval: Duration::from_millis(25),
                ..EngineSettings::default()
            },
        ));
        engine.ensure_room("Lobby", 100).unwrap();
        engine
    }

    fn setup_state() -> Arc<AppState> {
        Arc::new(AppState {
            engine: setup_engine(),
            webhook_verifier: WebhookVerifier::new("devkey", "secret"),
            timeouts: ConnectionTimeouts::default(),
            rate_limiters: Arc::new(ApiRateLimiters::default()),
        })
    }

    fn join(engine: &VoiceEngine, conn: &Arc<Connection>, room: &str, name: &str) {
        engine.handle_message(
            conn,
            ClientMessage::JoinRoom(JoinRoomRequest {
                room_name: room.into(),
                user_name: name.into(),
                voice_mode: Default::default(),
                stealth: false,
            }),
        );
    }

    /// Drain all pending events from a receiver.
    fn drain_events(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait for the first event matching `pred`, skipping others.
    async fn wait_for(
        rx: &mut mpsc::Receiver<ServerEvent>,
        pred: impl Fn(&ServerEvent) -> bool,
    ) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("connection closed while waiting"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn error_code(events: &[ServerEvent]) -> Option<&str> {
        events.iter().find_map(|e| match e {
            ServerEvent::Error { code, .. } => Some(code.as_str()),
            _ => None,
        })
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn admin_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-admin-password", ADMIN_PASSWORD)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    // ── Presence ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_lobby_presence_tone_flow() {
        let engine = setup_engine();
        let (a, mut rx_a) = engine.connect("10.0.0.1");
        let (b, mut rx_b) = engine.connect("10.0.0.2");
        drain_events(&mut rx_a);
        drain_events(&mut rx_b);

        join(&engine, &a, "Lobby", "alice");
        let events = drain_events(&mut rx_a);
        let joined_at = events
            .iter()
            .position(|e| matches!(e, ServerEvent::RoomJoined(_)))
            .unwrap();
        let tone_at = events
            .iter()
            .position(|e| *e == ServerEvent::PlayTestTone)
            .unwrap();
        assert!(joined_at < tone_at);
        match &events[joined_at] {
            ServerEvent::RoomJoined(joined) => {
                assert!(!joined.is_new_room);
                assert!(joined.participants.is_empty());
            }
            _ => unreachable!(),
        }

        join(&engine, &b, "Lobby", "bob");
        match wait_for(&mut rx_b, |e| matches!(e, ServerEvent::RoomJoined(_))).await {
            ServerEvent::RoomJoined(joined) => {
                assert_eq!(joined.participants.len(), 1);
                assert_eq!(joined.participants[0].name, "alice");
            }
            _ => unreachable!(),
        }

        wait_for(&mut rx_a, |e| {
            matches!(e, ServerEvent::UserJoined { user_name, .. } if user_name == "bob")
        })
        .await;
        wait_for(&mut rx_a, |e| *e == ServerEvent::StopTestTone).await;

        // Bob leaves, Alice is alone again.
        engine.handle_message(&b, ClientMessage::LeaveRoom);
        wait_for(&mut rx_a, |e| *e == ServerEvent::PlayTestTone).await;
    }

    // ── Moderation ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_ban_blocks_rejoin_until_lifted() {
        let engine = setup_engine();
        let (x, mut rx_x) = engine.connect("198.51.100.7");
        join(&engine, &x, "jam", "xavier");
        drain_events(&mut rx_x);

        let ban = engine.admin_ban(&x.user_id, "spam", 30).unwrap();
        assert_eq!(ban.expires_at - ban.banned_at, chrono::Duration::minutes(30));

        let events = drain_events(&mut rx_x);
        assert!(events.contains(&ServerEvent::Banned {
            reason: "spam".into(),
            duration_minutes: 30,
        }));
        assert!(engine.users().is_empty());
        assert_eq!(engine.registry().room_of(x.id), None);

        // Same address, new connection.
        let (again, mut rx_again) = engine.connect("198.51.100.7");
        drain_events(&mut rx_again);
        join(&engine, &again, "jam", "xavier");
        assert_eq!(error_code(&drain_events(&mut rx_again)), Some("USER_BANNED"));

        engine.delete_ban(&ban.id).unwrap();
        join(&engine, &again, "jam", "xavier");
        let events = drain_events(&mut rx_again);
        assert_eq!(error_code(&events), None);
        assert!(events.iter().any(|e| matches!(e, ServerEvent::RoomJoined(_))));
    }

    #[tokio::test]
    async fn test_room_capacity_enforced() {
        let state = setup_state();
        let app = build_router(state.clone(), &["*".to_string()]);
        let response = app
            .oneshot(admin_request(
                "POST",
                "/api/admin/rooms",
                json!({ "name": "duo", "capacity": 2 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let engine = &state.engine;
        let mut receivers = Vec::new();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let (conn, mut rx) = engine.connect(&format!("10.0.1.{i}"));
            drain_events(&mut rx);
            join(engine, &conn, "duo", name);
            receivers.push(rx);
        }
        assert_eq!(error_code(&drain_events(&mut receivers[0])), None);
        assert_eq!(error_code(&drain_events(&mut receivers[1])), None);
        assert_eq!(error_code(&drain_events(&mut receivers[2])), Some("ROOM_FULL"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_name_joins_get_distinct_names() {
        let engine = setup_engine();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                let (conn, mut rx) = engine.connect(&format!("10.0.2.{i}"));
                join(&engine, &conn, "party", "sam");
                drain_events(&mut rx)
                    .into_iter()
                    .find_map(|e| match e {
                        ServerEvent::RoomJoined(joined) => Some(joined.user_name),
                        _ => None,
                    })
                    .unwrap()
            }));
        }

        let mut names = Vec::new();
        for task in tasks {
            names.push(task.await.unwrap());
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);
        assert!(names.iter().any(|n| n == "sam"));
        assert!(names.iter().all(|n| n == "sam" || n.starts_with("sam_")));
    }

    // ── HTTP surface ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_admin_routes_require_password() {
        let app = build_router(setup_state(), &["*".to_string()]);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/admin/stats")
                    .header("x-admin-password", "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "INVALID_PASSWORD");
    }

    #[tokio::test]
    async fn test_admin_close_room_over_http() {
        let state = setup_state();
        let engine = state.engine.clone();
        let (conn, mut rx) = engine.connect("10.0.0.1");
        join(&engine, &conn, "jam", "alice");
        drain_events(&mut rx);
        let room_id = engine
            .list_rooms()
            .into_iter()
            .find(|r| r.name == "jam")
            .unwrap()
            .id;

        let app = build_router(state, &["*".to_string()]);
        let response = app
            .clone()
            .oneshot(admin_request(
                "POST",
                &format!("/api/admin/rooms/{room_id}/close"),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["is_closed"], true);
        assert!(
            drain_events(&mut rx)
                .iter()
                .any(|e| matches!(e, ServerEvent::RoomClosed { .. }))
        );

        let response = app
            .oneshot(admin_request(
                "POST",
                "/api/admin/rooms/no-such-room/close",
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "ROOM_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_public_room_list_and_health() {
        let state = setup_state();
        let app = build_router(state, &["*".to_string()]);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/rooms").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let rooms = body_json(response).await;
        assert_eq!(rooms[0]["name"], "Lobby");
        assert_eq!(rooms[0]["type"], "public");
        assert_eq!(rooms[0]["capacity"], 100);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_media_webhook_signature_checked() {
        let state = setup_state();
        let app = build_router(state.clone(), &["*".to_string()]);
        let body = json!({
            "event": "room_started",
            "room": { "sid": "RM_1", "name": "Lobby" },
        })
        .to_string();

        let token = state.webhook_verifier.sign(body.as_bytes()).unwrap();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook/media")
                    .header("authorization", token)
                    .header("content-type", "application/webhook+json")
                    .body(Body::from(body.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let (active, _) = state.engine.media_sessions();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].sid, "RM_1");

        let forged = WebhookVerifier::new("devkey", "not-the-secret")
            .sign(body.as_bytes())
            .unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook/media")
                    .header("authorization", forged)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // ── Real socket ──────────────────────────────────────────────

    async fn next_json<S>(socket: &mut S) -> Value
    where
        S: StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("timed out reading socket")
                .expect("socket closed")
                .expect("socket error");
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_join_and_chat() {
        let app = build_router(setup_state(), &["*".to_string()]);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();

        let connected = next_json(&mut socket).await;
        assert_eq!(connected["type"], "connected");
        assert!(connected["payload"]["user_id"].is_string());
        assert!(connected["timestamp"].is_string());

        socket
            .send(WsMessage::Text(
                json!({ "type": "join_room", "payload": { "room_name": "jam", "user_name": "alice" } })
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();
        let joined = next_json(&mut socket).await;
        assert_eq!(joined["type"], "room_joined");
        assert_eq!(joined["payload"]["is_new_room"], true);
        assert_eq!(joined["payload"]["media_server_url"], "ws://media.test");

        socket
            .send(WsMessage::Text(
                json!({ "type": "chat_message", "payload": { "content": "hi" } })
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();
        loop {
            let event = next_json(&mut socket).await;
            if event["type"] == "chat_message" && event["payload"]["message"]["type"] == "chat" {
                assert_eq!(event["payload"]["message"]["content"], "hi");
                break;
            }
        }

        socket
            .send(WsMessage::Text(r#"{"type":"dance"}"#.into()))
            .await
            .unwrap();
        loop {
            let event = next_json(&mut socket).await;
            if event["type"] == "error" {
                assert_eq!(event["payload"]["code"], "UNKNOWN_TYPE");
                break;
            }
        }
    }
}
