//! End-to-end turn scenarios against in-memory collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use relay_agent::collaborators::{
    ContextBuilder, OutboundDelivery, ResponseStreamer, StreamRequest, StreamedResponse,
};
use relay_agent::{
    MessagePipeline, PipelineDeps, PipelineError, Result, SubmitOutcome, TurnDispatcher,
    TurnToken,
};
use relay_core::config::PipelineConfig;
use relay_core::notify::InjectionMode;
use relay_core::{MessageId, Notification, NotificationSink, SessionId};
use relay_sessions::{
    ActivityCallback, ContextInjectionState, EditingContext, EditingTarget, InboundMessage,
    OutboundMessage, SessionContextStore, SessionHandle, SessionStatus, TaskMessageQueue,
};
use tokio::sync::Notify;

#[derive(Default)]
struct RecordingSink(Mutex<Vec<Notification>>);

impl NotificationSink for RecordingSink {
    fn emit(&self, n: Notification) {
        self.0.lock().unwrap().push(n);
    }
}

impl RecordingSink {
    fn all(&self) -> Vec<Notification> {
        self.0.lock().unwrap().clone()
    }

    fn kinds(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().iter().map(|n| n.kind()).collect()
    }

    fn statuses(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|n| match n {
                Notification::SessionActivity { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }

    fn reset(&self) {
        self.0.lock().unwrap().clear();
    }
}

#[derive(Default)]
struct FakeContext {
    calls: AtomicUsize,
}

#[async_trait]
impl ContextBuilder for FakeContext {
    async fn build_full_context(&self, ec: &EditingContext, user_text: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!(
            "[{} {}]\n{user_text}",
            ec.entity_type,
            ec.entity_id.as_deref().unwrap_or("new")
        ))
    }
}

/// Streamer whose behavior is picked per test.
enum Mode {
    Echo,
    /// Never responds and never reports activity.
    Hang,
    /// The first call waits for `release`; later calls echo.
    Gated,
    /// The first call fails with a provider error; later calls echo.
    FailOnce,
    /// Every call waits for its own `release`.
    GatedAll,
}

struct FakeStreamer {
    mode: Mode,
    calls: AtomicUsize,
    release: Notify,
    requests: Mutex<Vec<StreamRequest>>,
}

impl FakeStreamer {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
            release: Notify::new(),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ResponseStreamer for FakeStreamer {
    async fn stream_response(
        &self,
        request: StreamRequest,
        _token: &TurnToken,
        on_activity: ActivityCallback,
    ) -> Result<StreamedResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        match self.mode {
            Mode::Hang => std::future::pending::<()>().await,
            Mode::Gated if call == 0 => self.release.notified().await,
            Mode::GatedAll => self.release.notified().await,
            Mode::FailOnce if call == 0 => {
                return Err(PipelineError::Provider("model overloaded".into()))
            }
            _ => {}
        }
        on_activity();
        Ok(StreamedResponse {
            message_id: MessageId::new(),
            content: format!("re: {}", request.content),
            created_at: Utc::now(),
            context_usage: None,
            continuity_id: Some("cont-1".into()),
            cost: Some(0.01),
            aborted: false,
        })
    }
}

#[derive(Default)]
struct FakeDelivery(Mutex<Vec<OutboundMessage>>);

#[async_trait]
impl OutboundDelivery for FakeDelivery {
    async fn deliver(&self, _s: &SessionId, messages: Vec<OutboundMessage>) -> Result<()> {
        self.0.lock().unwrap().extend(messages);
        Ok(())
    }
}

impl FakeDelivery {
    fn contents(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|m| m.content.clone()).collect()
    }
}

struct World {
    sink: Arc<RecordingSink>,
    context: Arc<FakeContext>,
    streamer: Arc<FakeStreamer>,
    delivery: Arc<FakeDelivery>,
    deps: Arc<PipelineDeps>,
    pipeline: Arc<MessagePipeline>,
}

fn world(mode: Mode) -> World {
    let sink = Arc::new(RecordingSink::default());
    let context = Arc::new(FakeContext::default());
    let streamer = Arc::new(FakeStreamer::new(mode));
    let delivery = Arc::new(FakeDelivery::default());
    let deps = Arc::new(PipelineDeps {
        store: Arc::new(SessionContextStore::new()),
        injection: Arc::new(ContextInjectionState::new()),
        queue: Arc::new(TaskMessageQueue::new(sink.clone())),
        context_builder: context.clone(),
        streamer: streamer.clone(),
        delivery: delivery.clone(),
        sink: sink.clone(),
        config: PipelineConfig::default(),
    });
    let pipeline = Arc::new(MessagePipeline::new(deps.clone()));
    World {
        sink,
        context,
        streamer,
        delivery,
        deps,
        pipeline,
    }
}

fn sid() -> SessionId {
    SessionId::from("session-1")
}

fn doc(id: &str) -> EditingTarget {
    EditingTarget {
        entity_type: "document".into(),
        entity_id: Some(id.into()),
    }
}

fn stage(w: &World, msg: InboundMessage) -> SessionHandle {
    let handle = w.deps.store.get_or_create(&sid());
    handle.lock().queue.inbound.push_back(msg);
    handle
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn new_session_without_editing_context() {
    let w = world(Mode::Echo);
    let ctx = stage(&w, InboundMessage::new("hello"));

    w.pipeline.execute(ctx.clone(), &TurnToken::new()).await.unwrap();

    assert_eq!(w.sink.statuses(), vec!["locked", "streaming", "finalizing", "idle"]);
    assert_eq!(w.delivery.contents(), vec!["re: hello"]);
    assert_eq!(w.context.calls.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.status(), SessionStatus::Idle);
}

#[tokio::test]
async fn first_message_for_entity_injects_full_context() {
    let w = world(Mode::Echo);
    let ctx = stage(&w, InboundMessage::new("tighten intro").with_editing(doc("doc-1")));

    w.pipeline.execute(ctx.clone(), &TurnToken::new()).await.unwrap();

    assert_eq!(
        w.sink.statuses(),
        vec!["locked", "context_injecting", "streaming", "finalizing", "idle"]
    );
    let injected: Vec<_> = w
        .sink
        .all()
        .into_iter()
        .filter_map(|n| match n {
            Notification::ContextInjected { mode, entity_id, .. } => Some((mode, entity_id)),
            _ => None,
        })
        .collect();
    assert_eq!(injected, vec![(InjectionMode::Full, Some("doc-1".to_string()))]);

    let snap = ctx.snapshot();
    assert!(snap.editing_context.unwrap().context_injected);
    assert_eq!(
        w.streamer.requests.lock().unwrap()[0].content,
        "[document doc-1]\ntighten intro"
    );
}

#[tokio::test]
async fn same_entity_second_message_skips_injection() {
    let w = world(Mode::Echo);
    let ctx = stage(&w, InboundMessage::new("one").with_editing(doc("doc-1")));
    w.pipeline.execute(ctx.clone(), &TurnToken::new()).await.unwrap();
    w.sink.reset();

    ctx.lock()
        .queue
        .inbound
        .push_back(InboundMessage::new("two").with_editing(doc("doc-1")));
    w.pipeline.execute(ctx.clone(), &TurnToken::new()).await.unwrap();

    assert_eq!(w.sink.statuses(), vec!["locked", "streaming", "finalizing", "idle"]);
    assert!(!w.sink.kinds().contains(&"context_injected"));
    assert_eq!(w.context.calls.load(Ordering::SeqCst), 1);
    assert_eq!(w.streamer.requests.lock().unwrap()[1].content, "two");
    // Continuity id from the first turn is resumed.
    assert_eq!(
        w.streamer.requests.lock().unwrap()[1].continuity_id.as_deref(),
        Some("cont-1")
    );
}

#[tokio::test]
async fn switching_entity_injects_again() {
    let w = world(Mode::Echo);
    let ctx = stage(&w, InboundMessage::new("one").with_editing(doc("doc-1")));
    w.pipeline.execute(ctx.clone(), &TurnToken::new()).await.unwrap();

    ctx.lock()
        .queue
        .inbound
        .push_back(InboundMessage::new("two").with_editing(doc("doc-2")));
    w.pipeline.execute(ctx.clone(), &TurnToken::new()).await.unwrap();

    assert_eq!(w.context.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        ctx.snapshot().editing_context.unwrap().entity_id.as_deref(),
        Some("doc-2")
    );
}

#[tokio::test(start_paused = true)]
async fn silent_stream_fails_with_idle_timeout() {
    let w = world(Mode::Hang);
    let ctx = stage(&w, InboundMessage::new("hello"));
    let token = TurnToken::new();
    let start = tokio::time::Instant::now();

    let err = w.pipeline.execute(ctx.clone(), &token).await.unwrap_err();

    assert!(matches!(err, PipelineError::IdleTimeout { window_ms: 60_000, .. }));
    assert_eq!(err.code(), "IDLE_TIMEOUT");
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(60_000));
    assert!(elapsed < Duration::from_millis(61_000));
    assert!(token.is_cancelled());
    assert_eq!(ctx.status(), SessionStatus::Error);
    assert!(!w.deps.queue.has_activity_callback(&sid()));
    assert!(w.delivery.contents().is_empty());
}

#[tokio::test]
async fn message_during_turn_is_queued_then_run() {
    let w = world(Mode::Gated);
    let dispatcher = TurnDispatcher::new(w.pipeline.clone());
    let handle = w.deps.store.get_or_create(&sid());

    assert_eq!(
        dispatcher.submit(&sid(), InboundMessage::new("first")),
        SubmitOutcome::Started
    );
    wait_until(|| handle.status() == SessionStatus::Streaming).await;

    assert_eq!(
        dispatcher.submit(&sid(), InboundMessage::new("second")),
        SubmitOutcome::Queued { position: 1 }
    );
    assert!(w.sink.kinds().contains(&"message_queued"));

    w.streamer.release.notify_one();
    wait_until(|| !dispatcher.is_active(&sid())).await;

    assert_eq!(w.delivery.contents(), vec!["re: first", "re: second"]);
    assert_eq!(handle.status(), SessionStatus::Idle);
    assert!(!w.deps.queue.has_queue(&sid()));
}

#[tokio::test]
async fn eleventh_queued_message_is_rejected() {
    let w = world(Mode::Gated);
    let dispatcher = TurnDispatcher::new(w.pipeline.clone());
    let handle = w.deps.store.get_or_create(&sid());

    dispatcher.submit(&sid(), InboundMessage::new("running"));
    wait_until(|| handle.status() == SessionStatus::Streaming).await;

    for i in 1..=10 {
        assert_eq!(
            dispatcher.submit(&sid(), InboundMessage::new(format!("m{i}"))),
            SubmitOutcome::Queued { position: i }
        );
    }
    let outcome = dispatcher.submit(&sid(), InboundMessage::new("overflow"));
    assert!(matches!(outcome, SubmitOutcome::Rejected { code: "QUEUE_FULL", .. }));
    assert_eq!(w.deps.queue.len(&sid()), 10);

    w.streamer.release.notify_one();
    wait_until(|| !dispatcher.is_active(&sid())).await;
    assert_eq!(w.delivery.contents().len(), 11);
}

#[tokio::test]
async fn backlog_stays_bounded_across_turns() {
    let w = world(Mode::GatedAll);
    let dispatcher = TurnDispatcher::new(w.pipeline.clone());
    let handle = w.deps.store.get_or_create(&sid());

    dispatcher.submit(&sid(), InboundMessage::new("running"));
    wait_until(|| handle.status() == SessionStatus::Streaming).await;
    for i in 1..=10 {
        dispatcher.submit(&sid(), InboundMessage::new(format!("m{i}")));
    }

    // Turn one ends; exactly one queued message moves up for turn two.
    w.streamer.release.notify_one();
    wait_until(|| w.streamer.calls.load(Ordering::SeqCst) == 2).await;
    assert_eq!(w.deps.queue.len(&sid()), 9);
    assert!(handle.lock().queue.inbound.is_empty());
    assert!(w.sink.kinds().contains(&"message_dequeued"));
    assert_eq!(
        w.streamer.requests.lock().unwrap()[1].content,
        "m1".to_string()
    );

    assert_eq!(
        dispatcher.submit(&sid(), InboundMessage::new("late")),
        SubmitOutcome::Queued { position: 10 }
    );
    let outcome = dispatcher.submit(&sid(), InboundMessage::new("overflow"));
    assert!(matches!(outcome, SubmitOutcome::Rejected { code: "QUEUE_FULL", .. }));

    wait_until(|| {
        w.streamer.release.notify_one();
        !dispatcher.is_active(&sid())
    })
    .await;
    let delivered = w.delivery.contents();
    assert_eq!(delivered.len(), 12);
    assert_eq!(delivered.last().map(String::as_str), Some("re: late"));
}

#[tokio::test]
async fn wait_idle_resolves_when_last_turn_ends() {
    let w = world(Mode::Gated);
    let dispatcher = TurnDispatcher::new(w.pipeline.clone());
    let handle = w.deps.store.get_or_create(&sid());

    dispatcher.wait_idle().await;

    dispatcher.submit(&sid(), InboundMessage::new("first"));
    wait_until(|| handle.status() == SessionStatus::Streaming).await;
    let pending = tokio::time::timeout(Duration::from_millis(50), dispatcher.wait_idle()).await;
    assert!(pending.is_err());

    w.streamer.release.notify_one();
    tokio::time::timeout(Duration::from_secs(5), dispatcher.wait_idle())
        .await
        .unwrap();
    assert_eq!(dispatcher.active_count(), 0);
    assert_eq!(w.delivery.contents(), vec!["re: first"]);
}

#[tokio::test]
async fn failure_emits_single_halt_sequence_and_recovers() {
    let w = world(Mode::FailOnce);
    let dispatcher = TurnDispatcher::new(w.pipeline.clone());
    let handle = w.deps.store.get_or_create(&sid());

    dispatcher.submit(&sid(), InboundMessage::new("first"));
    wait_until(|| !dispatcher.is_active(&sid())).await;

    assert_eq!(handle.status(), SessionStatus::Error);
    let kinds = w.sink.kinds();
    let halt: Vec<_> = kinds
        .iter()
        .copied()
        .filter(|k| matches!(*k, "turn_halted" | "system_message" | "busy_cleared"))
        .collect();
    assert_eq!(halt, vec!["turn_halted", "system_message", "busy_cleared"]);
    assert!(w.sink.all().iter().any(|n| matches!(
        n,
        Notification::TurnHalted { code, .. } if code == "PROVIDER_ERROR"
    )));

    dispatcher.submit(&sid(), InboundMessage::new("again"));
    wait_until(|| !dispatcher.is_active(&sid())).await;
    assert_eq!(handle.status(), SessionStatus::Idle);
    assert_eq!(w.delivery.contents(), vec!["re: again"]);
}

#[tokio::test]
async fn stop_cancels_turn_and_discards_queue() {
    let w = world(Mode::Gated);
    let dispatcher = TurnDispatcher::new(w.pipeline.clone());
    let handle = w.deps.store.get_or_create(&sid());

    dispatcher.submit(&sid(), InboundMessage::new("long job"));
    wait_until(|| handle.status() == SessionStatus::Streaming).await;
    dispatcher.submit(&sid(), InboundMessage::new("queued"));

    assert!(dispatcher.stop(&sid()));
    wait_until(|| !dispatcher.is_active(&sid())).await;

    assert_eq!(handle.status(), SessionStatus::Error);
    assert!(w.delivery.contents().is_empty());
    assert!(!w.deps.queue.has_queue(&sid()));
    assert!(w.sink.all().iter().any(|n| matches!(
        n,
        Notification::TurnHalted { code, .. } if code == "CANCELLED"
    )));
    assert!(!dispatcher.stop(&sid()));
}

#[tokio::test]
async fn sessions_run_independently() {
    let w = world(Mode::Echo);
    let dispatcher = TurnDispatcher::new(w.pipeline.clone());
    let ids: Vec<SessionId> = (0..5).map(|i| SessionId::from(format!("s{i}"))).collect();

    for id in &ids {
        assert_eq!(
            dispatcher.submit(id, InboundMessage::new(id.to_string())),
            SubmitOutcome::Started
        );
    }
    wait_until(|| dispatcher.active_count() == 0).await;

    assert_eq!(w.delivery.contents().len(), 5);
    for id in &ids {
        assert_eq!(
            w.deps.store.get(id).map(|h| h.status()),
            Some(SessionStatus::Idle)
        );
    }
}
