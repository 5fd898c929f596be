use super::*;
use crate::{
    error::TransportError,
    media::{CaptureRequest, CaptureStream, DeviceError},
    reconciler::EntryBody,
};
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use shared::{
    domain::{DeliveryStatus, Direction, Seconds},
    error::{ApiError, ErrorCode},
    protocol::{
        InboxResponse, LoginRequest, LoginResponse, MessageRecord, SendMessageRequest,
        SendMessageResponse, USER_ID_HEADER,
    },
};
use std::sync::{
    atomic::{AtomicI64, AtomicUsize},
    Mutex as StdMutex,
};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct Stored {
    from: UserId,
    to: UserId,
    timestamp: Seconds,
    content: String,
}

/// Shared mailbox standing in for the relay. Every send gets its own second.
#[derive(Default)]
struct InMemoryRelay {
    clock: AtomicI64,
    messages: StdMutex<Vec<Stored>>,
    failing_sends: AtomicUsize,
    failing_fetches: AtomicUsize,
}

impl InMemoryRelay {
    fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    fn sent_by(&self, user: &str) -> Vec<String> {
        let user = UserId::new(user);
        self.messages
            .lock()
            .expect("relay lock")
            .iter()
            .filter(|stored| stored.from == user)
            .map(|stored| stored.content.clone())
            .collect()
    }

    fn sub_types_sent_by(&self, user: &str) -> Vec<&'static str> {
        self.sent_by(user)
            .iter()
            .filter_map(|content| signal::decode(content).ok())
            .map(|signal| signal.sub_type())
            .collect()
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl MessageChannel for InMemoryRelay {
    async fn fetch_inbox(&self, user: &UserId) -> Result<Vec<MessageRecord>, TransportError> {
        if take_failure(&self.failing_fetches) {
            return Err(TransportError::Rejected {
                status: 503,
                message: "relay down".into(),
            });
        }
        let messages = self.messages.lock().expect("relay lock");
        Ok(messages
            .iter()
            .filter_map(|stored| {
                let (direction, counterpart, status) = if &stored.to == user {
                    (Direction::Received, stored.from.clone(), None)
                } else if &stored.from == user {
                    (Direction::Sent, stored.to.clone(), Some(DeliveryStatus::Sent))
                } else {
                    return None;
                };
                Some(MessageRecord {
                    direction,
                    counterpart,
                    timestamp: stored.timestamp,
                    content: stored.content.clone(),
                    status,
                })
            })
            .collect())
    }

    async fn send_message(
        &self,
        from: &UserId,
        to: &UserId,
        content: &str,
    ) -> Result<(), TransportError> {
        if take_failure(&self.failing_sends) {
            return Err(TransportError::Rejected {
                status: 503,
                message: "relay down".into(),
            });
        }
        let timestamp = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.messages.lock().expect("relay lock").push(Stored {
            from: from.clone(),
            to: to.clone(),
            timestamp,
            content: content.to_string(),
        });
        Ok(())
    }
}

#[derive(Default)]
struct CountingDevice {
    next_id: AtomicU64,
    released: AtomicUsize,
}

#[async_trait]
impl CaptureDevice for CountingDevice {
    async fn acquire_capture(&self, request: CaptureRequest) -> Result<CaptureStream, DeviceError> {
        Ok(CaptureStream::new(
            self.next_id.fetch_add(1, Ordering::SeqCst),
            request,
        ))
    }

    async fn release_capture(&self, _stream: CaptureStream) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_settings() -> ClientSettings {
    ClientSettings {
        call_timer_tick_ms: 10,
        handshake_retry_delay_ms: 0,
        ..ClientSettings::default()
    }
}

fn client(
    name: &str,
    relay: &Arc<InMemoryRelay>,
    device: Arc<dyn CaptureDevice>,
) -> Arc<SignalingClient> {
    let channel: Arc<dyn MessageChannel> = relay.clone();
    SignalingClient::new(UserId::new(name), channel, device, test_settings())
}

async fn next_event(
    events: &mut broadcast::Receiver<ClientEvent>,
    mut matches: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn full_call_flow_between_two_clients() {
    let relay = Arc::new(InMemoryRelay::default());
    let alice_device = Arc::new(CountingDevice::default());
    let alice = client("alice", &relay, alice_device.clone());
    let bob = client("bob", &relay, Arc::new(CountingDevice::default()));
    let mut bob_events = bob.subscribe_events();

    alice.select_counterpart(UserId::new("bob")).await;
    alice.place_call(CallType::Video).await.expect("place call");
    alice.flush_outbound().await;
    assert_eq!(alice.call_state().await, CallState::Dialing);

    bob.poll_once().await.expect("bob poll");
    assert_eq!(bob.call_state().await, CallState::Ringing);
    let session = bob.session_snapshot().await.expect("session");
    assert_eq!(session.peer, UserId::new("alice"));
    assert_eq!(session.call_type, CallType::Video);
    let ring = next_event(&mut bob_events, |event| matches!(event, ClientEvent::Ringing(_))).await;
    assert!(matches!(
        ring,
        ClientEvent::Ringing(Ring::Incoming {
            call_type: CallType::Video,
            ..
        })
    ));

    // Re-observing the same offer must not ring again.
    bob.poll_once().await.expect("bob repoll");
    assert_eq!(bob.call_state().await, CallState::Ringing);

    bob.accept_call().await.expect("accept");
    bob.flush_outbound().await;
    assert_eq!(bob.call_state().await, CallState::Live);

    let mut alice_events = alice.subscribe_events();
    alice.poll_once().await.expect("alice poll");
    assert_eq!(alice.call_state().await, CallState::Live);
    let presentation = next_event(&mut alice_events, |event| {
        matches!(event, ClientEvent::MediaPresentationChanged(_))
    })
    .await;
    assert!(matches!(
        presentation,
        ClientEvent::MediaPresentationChanged(Presentation::Video { .. })
    ));

    alice.hang_up().await.expect("hang up");
    alice.flush_outbound().await;
    assert_eq!(alice.call_state().await, CallState::Idle);
    assert_eq!(alice_device.released.load(Ordering::SeqCst), 1);

    bob.poll_once().await.expect("bob sees end");
    bob.flush_outbound().await;
    assert_eq!(bob.call_state().await, CallState::Idle);

    assert_eq!(relay.sub_types_sent_by("alice"), vec!["offer", "system_log", "end"]);
    assert_eq!(relay.sub_types_sent_by("bob"), vec!["accept", "system_log"]);
    assert_eq!(bob.desync_events().await, 0);
}

#[tokio::test]
async fn stopping_during_live_call_hangs_up_and_releases_capture() {
    let relay = Arc::new(InMemoryRelay::default());
    let alice_device = Arc::new(CountingDevice::default());
    let alice = client("alice", &relay, alice_device.clone());
    let bob = client("bob", &relay, Arc::new(CountingDevice::default()));
    let mut alice_events = alice.subscribe_events();

    alice.select_counterpart(UserId::new("bob")).await;
    alice.place_call(CallType::Voice).await.expect("place call");
    alice.flush_outbound().await;
    bob.poll_once().await.expect("bob poll");
    bob.accept_call().await.expect("accept");
    bob.flush_outbound().await;
    alice.poll_once().await.expect("alice poll");
    assert_eq!(alice.call_state().await, CallState::Live);
    next_event(&mut alice_events, |event| {
        matches!(event, ClientEvent::MediaPresentationChanged(_))
    })
    .await;

    alice.stop().await;
    alice.flush_outbound().await;
    drop(alice);

    assert_eq!(alice_device.released.load(Ordering::SeqCst), 1);
    assert_eq!(relay.sub_types_sent_by("alice"), vec!["offer", "system_log", "end"]);

    bob.poll_once().await.expect("bob sees end");
    assert_eq!(bob.call_state().await, CallState::Idle);
}

#[tokio::test]
async fn stopping_while_idle_sends_nothing() {
    let relay = Arc::new(InMemoryRelay::default());
    let alice = client("alice", &relay, Arc::new(CountingDevice::default()));
    alice.stop().await;
    alice.flush_outbound().await;
    assert!(relay.sub_types_sent_by("alice").is_empty());
}

#[tokio::test]
async fn second_caller_gets_busy_drop() {
    let relay = Arc::new(InMemoryRelay::default());
    let device: Arc<dyn CaptureDevice> = Arc::new(CountingDevice::default());
    let alice = client("alice", &relay, device.clone());
    let carol = client("carol", &relay, device.clone());
    let bob = client("bob", &relay, device);

    alice.select_counterpart(UserId::new("bob")).await;
    alice.place_call(CallType::Voice).await.expect("alice calls");
    alice.flush_outbound().await;
    bob.poll_once().await.expect("bob poll");

    carol.select_counterpart(UserId::new("bob")).await;
    carol.place_call(CallType::Voice).await.expect("carol calls");
    carol.flush_outbound().await;
    bob.poll_once().await.expect("bob poll again");

    let session = bob.session_snapshot().await.expect("session");
    assert_eq!(session.peer, UserId::new("alice"));
    assert_eq!(bob.call_state().await, CallState::Ringing);
}

#[tokio::test]
async fn handshake_signals_are_retried() {
    let relay = Arc::new(InMemoryRelay::default());
    let alice = client("alice", &relay, Arc::new(CountingDevice::default()));
    relay.fail_next_sends(2);

    alice.select_counterpart(UserId::new("bob")).await;
    alice.place_call(CallType::Voice).await.expect("place call");
    alice.flush_outbound().await;

    assert_eq!(relay.sub_types_sent_by("alice"), vec!["offer"]);
}

#[tokio::test]
async fn handshake_gives_up_after_configured_attempts() {
    let relay = Arc::new(InMemoryRelay::default());
    let alice = client("alice", &relay, Arc::new(CountingDevice::default()));
    relay.fail_next_sends(3);

    alice.select_counterpart(UserId::new("bob")).await;
    alice.place_call(CallType::Voice).await.expect("place call");
    alice.flush_outbound().await;

    assert!(relay.sent_by("alice").is_empty());
    // The local machine advanced optimistically regardless.
    assert_eq!(alice.call_state().await, CallState::Dialing);
}

#[tokio::test]
async fn media_state_is_best_effort() {
    let relay = Arc::new(InMemoryRelay::default());
    let device: Arc<dyn CaptureDevice> = Arc::new(CountingDevice::default());
    let alice = client("alice", &relay, device.clone());
    let bob = client("bob", &relay, device);

    alice.select_counterpart(UserId::new("bob")).await;
    alice.place_call(CallType::Video).await.expect("call");
    alice.flush_outbound().await;
    bob.poll_once().await.expect("ring");
    bob.accept_call().await.expect("accept");
    bob.flush_outbound().await;
    alice.poll_once().await.expect("live");

    relay.fail_next_sends(1);
    alice.toggle_mute().await.expect("mute");
    alice.flush_outbound().await;
    assert_eq!(relay.sub_types_sent_by("alice"), vec!["offer"]);

    alice.toggle_camera().await.expect("camera off");
    alice.flush_outbound().await;
    assert_eq!(relay.sub_types_sent_by("alice"), vec!["offer", "media_state"]);

    let mut bob_events = bob.subscribe_events();
    bob.poll_once().await.expect("bob sees media state");
    let changed = next_event(&mut bob_events, |event| {
        matches!(event, ClientEvent::RemoteMediaChanged { .. })
    })
    .await;
    assert!(matches!(
        changed,
        ClientEvent::RemoteMediaChanged {
            kind: MediaKind::Video,
            enabled: false
        }
    ));
    assert!(!bob.session_snapshot().await.expect("session").remote_video_enabled);
}

#[tokio::test]
async fn call_timer_ticks_while_live_and_stops_after() {
    let relay = Arc::new(InMemoryRelay::default());
    let device: Arc<dyn CaptureDevice> = Arc::new(CountingDevice::default());
    let alice = client("alice", &relay, device.clone());
    let bob = client("bob", &relay, device);
    let mut bob_events = bob.subscribe_events();

    alice.select_counterpart(UserId::new("bob")).await;
    alice.place_call(CallType::Voice).await.expect("call");
    alice.flush_outbound().await;
    bob.poll_once().await.expect("ring");
    bob.accept_call().await.expect("accept");

    let tick = next_event(&mut bob_events, |event| {
        matches!(event, ClientEvent::CallTimerTick { .. })
    })
    .await;
    assert!(matches!(tick, ClientEvent::CallTimerTick { elapsed } if elapsed == "00:00"));

    bob.hang_up().await.expect("hang up");
    assert!(bob.inner.lock().await.call_timer.is_none());
}

#[tokio::test]
async fn chat_requires_counterpart_and_content() {
    let relay = Arc::new(InMemoryRelay::default());
    let alice = client("alice", &relay, Arc::new(CountingDevice::default()));

    assert!(matches!(
        alice.send_text("hello").await,
        Err(ClientError::NoActiveCounterpart)
    ));
    assert!(matches!(
        alice.place_call(CallType::Voice).await,
        Err(ClientError::NoActiveCounterpart)
    ));

    alice.select_counterpart(UserId::new("bob")).await;
    assert!(matches!(
        alice.send_text("   ").await,
        Err(ClientError::EmptyMessage)
    ));
    assert!(matches!(
        alice.accept_call().await,
        Err(ClientError::Call(_))
    ));
}

#[tokio::test]
async fn transcript_shows_chat_and_rich_but_hides_handshake() {
    let relay = Arc::new(InMemoryRelay::default());
    let device: Arc<dyn CaptureDevice> = Arc::new(CountingDevice::default());
    let alice = client("alice", &relay, device.clone());
    let bob = client("bob", &relay, device);

    alice.select_counterpart(UserId::new("bob")).await;
    alice.send_text("hello bob").await.expect("text");
    alice
        .send_rich(
            "see attached",
            vec![RichAttachment::from_bytes("a.txt", "text/plain", b"abc")],
        )
        .await
        .expect("rich");
    alice.place_call(CallType::Voice).await.expect("call");
    alice.flush_outbound().await;

    let mut bob_events = bob.subscribe_events();
    bob.select_counterpart(UserId::new("alice")).await;
    bob.poll_once().await.expect("poll");

    let update = next_event(&mut bob_events, |event| {
        matches!(event, ClientEvent::TranscriptUpdated { .. })
    })
    .await;
    let ClientEvent::TranscriptUpdated {
        counterpart,
        entries,
    } = update
    else {
        unreachable!();
    };
    assert_eq!(counterpart, UserId::new("alice"));
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].body, EntryBody::Text("hello bob".into()));
    match &entries[1].body {
        EntryBody::Rich(rich) => {
            assert_eq!(rich.text, "see attached");
            assert_eq!(rich.files[0].size, "3 B");
        }
        other => panic!("unexpected entry: {other:?}"),
    }
}

#[tokio::test]
async fn incoming_call_switches_conversation_to_caller() {
    let relay = Arc::new(InMemoryRelay::default());
    let device: Arc<dyn CaptureDevice> = Arc::new(CountingDevice::default());
    let alice = client("alice", &relay, device.clone());
    let bob = client("bob", &relay, device);

    alice.select_counterpart(UserId::new("bob")).await;
    alice.send_text("pick up").await.expect("text");
    alice.place_call(CallType::Video).await.expect("call");
    alice.flush_outbound().await;

    let mut bob_events = bob.subscribe_events();
    bob.select_counterpart(UserId::new("carol")).await;
    bob.poll_once().await.expect("poll");

    assert_eq!(bob.call_state().await, CallState::Ringing);
    assert_eq!(bob.active_counterpart().await, Some(UserId::new("alice")));
    let update = next_event(&mut bob_events, |event| {
        matches!(event, ClientEvent::TranscriptUpdated { .. })
    })
    .await;
    let ClientEvent::TranscriptUpdated {
        counterpart,
        entries,
    } = update
    else {
        unreachable!();
    };
    assert_eq!(counterpart, UserId::new("alice"));
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].body, EntryBody::Text("pick up".into()));
}

#[tokio::test]
async fn new_messages_after_first_poll_chime_once() {
    let relay = Arc::new(InMemoryRelay::default());
    let device: Arc<dyn CaptureDevice> = Arc::new(CountingDevice::default());
    let alice = client("alice", &relay, device.clone());
    let bob = client("bob", &relay, device);
    let mut bob_events = bob.subscribe_events();

    alice.select_counterpart(UserId::new("bob")).await;
    alice.send_text("one").await.expect("send");
    bob.select_counterpart(UserId::new("alice")).await;
    bob.poll_once().await.expect("initial load");

    alice.send_text("two").await.expect("send");
    bob.poll_once().await.expect("poll");
    bob.poll_once().await.expect("identical poll");

    let mut chimes = 0;
    while let Ok(event) = bob_events.try_recv() {
        if matches!(event, ClientEvent::NotificationSound) {
            chimes += 1;
        }
    }
    assert_eq!(chimes, 1);
}

#[tokio::test]
async fn discovered_contacts_are_announced() {
    let relay = Arc::new(InMemoryRelay::default());
    let device: Arc<dyn CaptureDevice> = Arc::new(CountingDevice::default());
    let carol = client("carol", &relay, device.clone());
    let bob = client("bob", &relay, device);
    let mut bob_events = bob.subscribe_events();

    carol.select_counterpart(UserId::new("bob")).await;
    carol.send_text("hi, it's carol").await.expect("send");
    bob.poll_once().await.expect("poll");

    let found = next_event(&mut bob_events, |event| {
        matches!(event, ClientEvent::ContactDiscovered(_))
    })
    .await;
    assert!(matches!(found, ClientEvent::ContactDiscovered(user) if user == UserId::new("carol")));
}

#[tokio::test]
async fn poll_failure_is_reported_and_next_poll_recovers() {
    let relay = Arc::new(InMemoryRelay::default());
    let bob = client("bob", &relay, Arc::new(CountingDevice::default()));
    relay.failing_fetches.store(1, Ordering::SeqCst);

    assert!(matches!(
        bob.poll_once().await,
        Err(ClientError::Transport(TransportError::Rejected { status: 503, .. }))
    ));
    bob.poll_once().await.expect("recovered");
}

#[tokio::test]
async fn start_polling_drives_reconciliation() {
    let relay = Arc::new(InMemoryRelay::default());
    let device: Arc<dyn CaptureDevice> = Arc::new(CountingDevice::default());
    let alice = client("alice", &relay, device.clone());
    let channel: Arc<dyn MessageChannel> = relay.clone();
    let bob = SignalingClient::new(
        UserId::new("bob"),
        channel,
        device,
        ClientSettings {
            poll_interval_ms: 10,
            ..test_settings()
        },
    );
    let mut bob_events = bob.subscribe_events();

    alice.select_counterpart(UserId::new("bob")).await;
    alice.place_call(CallType::Video).await.expect("call");
    alice.flush_outbound().await;

    bob.start_polling().await;
    next_event(&mut bob_events, |event| matches!(event, ClientEvent::Ringing(_))).await;
    bob.stop().await;
    assert_eq!(bob.call_state().await, CallState::Ringing);
}

#[tokio::test]
async fn read_attachment_reports_missing_file() {
    let err = read_attachment(Path::new("/definitely/not/here.png"))
        .await
        .expect_err("missing file");
    assert!(matches!(err, ClientError::Attachment { .. }));
}

#[derive(Clone, Default)]
struct MockRelayState {
    sends: Arc<StdMutex<Vec<(String, SendMessageRequest)>>>,
}

async fn handle_login(Json(body): Json<LoginRequest>) -> Json<LoginResponse> {
    Json(LoginResponse {
        status: "connected".into(),
        user_id: UserId::new(&body.user_id),
    })
}

async fn handle_send(
    State(state): State<MockRelayState>,
    headers: HeaderMap,
    Json(body): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, (StatusCode, Json<ApiError>)> {
    let Some(user) = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ApiError::new(ErrorCode::Unauthorized, "missing user header")),
        ));
    };
    state
        .sends
        .lock()
        .expect("sends lock")
        .push((user.to_string(), body));
    Ok(Json(SendMessageResponse {
        status: "queued".into(),
    }))
}

async fn handle_messages(headers: HeaderMap) -> Json<InboxResponse> {
    let user = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Json(InboxResponse {
        messages: vec![MessageRecord {
            direction: Direction::Received,
            counterpart: UserId::new("protocol_service"),
            timestamp: 42,
            content: format!("hello {user}"),
            status: None,
        }],
    })
}

async fn spawn_mock_relay() -> anyhow::Result<(String, MockRelayState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = MockRelayState::default();
    let app = Router::new()
        .route("/api/login", post(handle_login))
        .route("/api/send", post(handle_send))
        .route("/api/messages", get(handle_messages))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

#[tokio::test]
async fn http_channel_speaks_relay_protocol() {
    let (server_url, state) = spawn_mock_relay().await.expect("spawn relay");
    let channel = HttpMessageChannel::new(&server_url).expect("channel");

    let user = channel.login(&UserId::new("  Alice ")).await.expect("login");
    assert_eq!(user, UserId::new("alice"));

    channel
        .send_message(&user, &UserId::new("bob"), "hi bob")
        .await
        .expect("send");
    let sends = state.sends.lock().expect("sends lock").clone();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].0, "alice");
    assert_eq!(sends[0].1.recipient, "bob");
    assert_eq!(sends[0].1.message, "hi bob");

    let inbox = channel.fetch_inbox(&user).await.expect("inbox");
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].content, "hello alice");
    assert_eq!(inbox[0].timestamp, 42);
}

#[tokio::test]
async fn http_channel_maps_relay_errors() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route(
        "/api/messages",
        get(|| async {
            (
                StatusCode::UNAUTHORIZED,
                Json(ApiError::new(ErrorCode::Unauthorized, "unknown user")),
            )
        }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let channel = HttpMessageChannel::new(&format!("http://{addr}")).expect("channel");
    let err = channel
        .fetch_inbox(&UserId::new("ghost"))
        .await
        .expect_err("rejected");
    match err {
        TransportError::Rejected { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "unknown user");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn path_prefixed_server_url_keeps_its_prefix() {
    for raw in ["http://relay.local:9000/chat", "http://relay.local:9000/chat/"] {
        let channel = HttpMessageChannel::new(raw).expect("channel");
        assert_eq!(channel.base_url().as_str(), "http://relay.local:9000/chat/");
        assert_eq!(
            channel
                .base_url()
                .join("api/messages")
                .expect("join")
                .as_str(),
            "http://relay.local:9000/chat/api/messages"
        );
    }
    let bare = HttpMessageChannel::new("http://relay.local:9000").expect("channel");
    assert_eq!(bare.base_url().as_str(), "http://relay.local:9000/");
}

#[tokio::test]
async fn http_channel_reaches_relay_behind_path_prefix() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().nest(
        "/chat",
        Router::new().route("/api/messages", get(handle_messages)),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let channel = HttpMessageChannel::new(&format!("http://{addr}/chat")).expect("channel");
    let inbox = channel
        .fetch_inbox(&UserId::new("alice"))
        .await
        .expect("inbox");
    assert_eq!(inbox[0].content, "hello alice");
}

#[test]
fn invalid_server_url_is_rejected() {
    assert!(matches!(
        HttpMessageChannel::new("not a url"),
        Err(TransportError::InvalidUrl(_))
    ));
}
