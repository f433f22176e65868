use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::view::{AwaitKind, InputFilter};
use tether_core::{
    Connection, HandleResult, Request, Route, Router, Services, Settings, StopReason, View,
    ViewError, ViewHandle, ViewResult, ViewRuntime, ViewRuntimeController, ViewState,
};
use tether_html::{tags, Method, Node, PROTOCOL_PREFIX};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// What test views report back to the test body.
#[derive(Debug)]
enum Report {
    Node(Node),
    Note(String),
}

struct Frame {
    raw: String,
    window_id: String,
    runtime_id: String,
    method: i64,
    payload: Value,
}

fn parse(raw: String) -> Frame {
    let body = raw.strip_prefix(PROTOCOL_PREFIX).expect("prefix");
    let value: Value = serde_json::from_str(body).expect("json frame");
    Frame {
        window_id: value[0].as_str().unwrap().to_string(),
        runtime_id: value[1].as_str().unwrap().to_string(),
        method: value[2].as_i64().unwrap(),
        payload: value[3].clone(),
        raw,
    }
}

async fn next_frame(rx: &mut UnboundedReceiver<String>) -> Frame {
    let raw = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("frame in time")
        .expect("connection open");
    parse(raw)
}

/// Skip frames until one with `method` arrives.
async fn frame_with(rx: &mut UnboundedReceiver<String>, method: Method) -> Frame {
    loop {
        let frame = next_frame(rx).await;
        if frame.method == method.code() {
            return frame;
        }
    }
}

async fn next_report(rx: &mut UnboundedReceiver<Report>) -> Report {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("report in time")
        .expect("reporter alive")
}

async fn next_node(rx: &mut UnboundedReceiver<Report>) -> Node {
    match next_report(rx).await {
        Report::Node(node) => node,
        other => panic!("expected a node, got {:?}", other),
    }
}

/// Next note, skipping node reports from views started meanwhile.
async fn next_note(rx: &mut UnboundedReceiver<Report>) -> String {
    loop {
        if let Report::Note(note) = next_report(rx).await {
            return note;
        }
    }
}

async fn wait_for_state(runtime: &ViewRuntime, state: ViewState) {
    let start = Instant::now();
    while runtime.state() != state {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "stuck in {:?}, wanted {:?}",
            runtime.state(),
            state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn view_frame(window_id: &str, url: &str) -> String {
    format!("{}{}", PROTOCOL_PREFIX, json!([window_id, "", 101, [url]]))
}

fn input_frame(window_id: &str, event_id: u64, kind: i64, node: &Node) -> String {
    format!(
        "{}{}",
        PROTOCOL_PREFIX,
        json!([window_id, "", 102, [event_id, kind, null, node.id().to_wire(), "BUTTON", "", ""]])
    )
}

const CLICK: i64 = 301;
const CHANGE: i64 = 302;

fn controller(router: Router) -> ViewRuntimeController {
    let settings = Settings {
        runtime_workers: 8,
        general_workers: 2,
        channel_workers: 2,
        ..Settings::default()
    };
    let services = Services::new(&settings, tokio::runtime::Handle::current());
    ViewRuntimeController::new(settings, router, services).unwrap()
}

fn route<V: View + 'static>(name: &str, pattern: &str, make: impl Fn() -> V + Send + Sync + 'static) -> Route {
    Route::new(name, pattern, move || Arc::new(make()) as Arc<dyn View>).unwrap()
}

/// Shows a button, reports it, then reports every click it sees.
struct ClickView {
    reports: UnboundedSender<Report>,
    daemon: bool,
}

impl View for ClickView {
    fn handle_request(&self, view: &ViewHandle, _request: &Request) -> ViewResult {
        if self.daemon {
            view.daemonize();
        }
        let count = tags::span().with_text("0");
        let button = tags::button().with_text("+1");
        let root = tags::div().with_child(&count)?.with_child(&button)?;
        view.set_title("Clicks");
        view.show(Some(&root))?;
        let _ = self.reports.send(Report::Node(button.clone()));

        let mut clicks = 0;
        loop {
            let event = view.await_click(&[button.clone()])?;
            clicks += 1;
            count.set_text(clicks.to_string())?;
            view.show(None)?;
            let _ = self.reports.send(Report::Note(format!("click {}", event.event_id)));
        }
    }

    fn handle_input_event_root(&self, view: &ViewHandle, event: tether_core::InputEvent) -> ViewResult {
        let outcome = match view.await_input(InputFilter::click()) {
            Err(ViewError::InputSlotOccupied(kind)) => format!("occupied {:?}", kind),
            other => format!("unexpected {:?}", other.map(|e| e.event_id)),
        };
        let _ = self.reports.send(Report::Note(format!("root {} {}", event.event_id, outcome)));
        Ok(())
    }

    fn on_stop(&self, reason: &StopReason) {
        let _ = self.reports.send(Report::Note(format!("stopped: {}", reason)));
    }
}

fn click_router(reports: &UnboundedSender<Report>) -> Router {
    let (a, b, c) = (reports.clone(), reports.clone(), reports.clone());
    let mut router = Router::new();
    router
        .add(route("clicks", "/clicks/", move || ClickView { reports: a.clone(), daemon: false }))
        .add(route("shared", "/shared/", move || ClickView { reports: b.clone(), daemon: false }).multi_user())
        .add(route("daemon", "/daemon/", move || ClickView { reports: c.clone(), daemon: true }));
    router
}

#[tokio::test]
async fn test_change_event_does_not_resolve_click_slot() {
    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let controller = controller(click_router(&reports_tx));
    let (conn, mut rx) = Connection::pair("alice");

    assert_eq!(controller.handle_incoming(&conn, &view_frame("w1", "/clicks/")).await, HandleResult::Handled);
    let start = next_frame(&mut rx).await;
    assert_eq!(start.method, Method::ViewStart.code());
    assert_eq!(start.window_id, "w1");

    let button = next_node(&mut reports).await;
    let runtime = controller.runtime_for(conn.id(), "w1").unwrap();
    wait_for_state(&runtime, ViewState::WaitingForInput).await;

    controller.handle_incoming(&conn, &input_frame("w1", 1, CHANGE, &button)).await;
    let ack = frame_with(&mut rx, Method::InputEventAck).await;
    assert_eq!(ack.payload, json!([1]));
    // the change went to the root hook, which found the click slot taken
    assert_eq!(next_note(&mut reports).await, "root 1 occupied Click");
    assert_eq!(runtime.state(), ViewState::WaitingForInput);
    assert_eq!(runtime.pending_slots(), vec![AwaitKind::Click]);

    controller.handle_incoming(&conn, &input_frame("w1", 2, CLICK, &button)).await;
    assert_eq!(next_note(&mut reports).await, "click 2");
    let update = frame_with(&mut rx, Method::Data).await;
    assert_eq!(update.payload[0], json!("Clicks"));
    assert_eq!(update.payload[1][0], json!(203));
}

#[tokio::test]
async fn test_multi_user_fan_out_sends_identical_frames() {
    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let controller = controller(click_router(&reports_tx));
    controller.start_multi_user_views();
    let button = next_node(&mut reports).await;
    let runtime = controller.runtimes().into_iter().next().unwrap();
    assert!(runtime.is_multi_user());
    wait_for_state(&runtime, ViewState::WaitingForInput).await;

    let (alice, mut alice_rx) = Connection::pair("alice");
    let (bob, mut bob_rx) = Connection::pair("bob");
    controller.handle_incoming(&alice, &view_frame("w1", "/shared/")).await;
    controller.handle_incoming(&bob, &view_frame("w1", "/shared/")).await;

    let alice_sync = frame_with(&mut alice_rx, Method::Data).await;
    let bob_sync = frame_with(&mut bob_rx, Method::Data).await;
    assert_eq!(alice_sync.payload[1][0], json!(202));
    assert_eq!(alice_sync.raw, bob_sync.raw);
    assert_eq!(alice_sync.runtime_id, runtime.id());

    controller.handle_incoming(&alice, &input_frame("w1", 7, CLICK, &button)).await;
    assert_eq!(next_note(&mut reports).await, "click 7");
    let alice_update = frame_with(&mut alice_rx, Method::Data).await;
    let bob_update = frame_with(&mut bob_rx, Method::Data).await;
    assert_eq!(alice_update.payload[1][0], json!(203));
    assert_eq!(alice_update.raw, bob_update.raw);

    // multi-user runtimes outlive their viewers
    controller.remove_connection(alice.id());
    controller.remove_connection(bob.id());
    assert!(!runtime.is_stopped());
}

#[tokio::test]
async fn test_daemon_view_survives_disconnect_and_reconnects() {
    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let controller = controller(click_router(&reports_tx));

    let (first, mut first_rx) = Connection::pair("alice");
    controller.handle_incoming(&first, &view_frame("w1", "/daemon/")).await;
    let start = frame_with(&mut first_rx, Method::ViewStart).await;
    next_node(&mut reports).await;
    let runtime = controller.runtime_for(first.id(), "w1").unwrap();
    wait_for_state(&runtime, ViewState::WaitingForInput).await;

    controller.remove_connection(first.id());
    assert!(!runtime.is_stopped());
    assert_eq!(runtime.connection_count(), 0);

    let (second, mut second_rx) = Connection::pair("alice");
    controller.handle_incoming(&second, &view_frame("w9", "/daemon/")).await;
    let restart = frame_with(&mut second_rx, Method::ViewStart).await;
    assert_eq!(restart.runtime_id, start.runtime_id);
    let sync = next_frame(&mut second_rx).await;
    assert_eq!(sync.method, Method::Data.code());
    assert_eq!(sync.payload[1][0], json!(202));
}

#[tokio::test]
async fn test_reopening_a_route_supersedes_the_old_runtime() {
    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let controller = controller(click_router(&reports_tx));

    let (conn, mut rx) = Connection::pair("alice");
    controller.handle_incoming(&conn, &view_frame("w1", "/clicks/")).await;
    next_node(&mut reports).await;
    let old = controller.runtime_for(conn.id(), "w1").unwrap();
    wait_for_state(&old, ViewState::WaitingForInput).await;

    let (other, _other_rx) = Connection::pair("alice");
    controller.handle_incoming(&other, &view_frame("w1", "/clicks/")).await;
    assert_eq!(next_note(&mut reports).await, "stopped: user aborted the view");
    assert_eq!(old.state(), ViewState::Stopped);
    frame_with(&mut rx, Method::ViewStop).await;

    let new = controller.runtime_for(other.id(), "w1").unwrap();
    assert!(new.id() != old.id());
}

/// Reports, then sleeps far longer than any test waits.
struct SleepyView {
    reports: UnboundedSender<Report>,
}

impl View for SleepyView {
    fn handle_request(&self, view: &ViewHandle, _request: &Request) -> ViewResult {
        view.show(Some(&tags::p().with_text("zzz")))?;
        let result = view.sleep(Duration::from_secs(300));
        let note = match &result {
            Err(ViewError::Stopped(reason)) => format!("woke: {}", reason),
            other => format!("unexpected {:?}", other),
        };
        let _ = self.reports.send(Report::Note(note));
        result
    }
}

#[tokio::test]
async fn test_stop_interrupts_sleep() {
    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let mut router = Router::new();
    router.add(route("sleepy", "/sleepy/", move || SleepyView { reports: reports_tx.clone() }));
    let controller = controller(router);

    let (conn, _rx) = Connection::pair("alice");
    controller.handle_incoming(&conn, &view_frame("w1", "/sleepy/")).await;
    let runtime = controller.runtime_for(conn.id(), "w1").unwrap();
    wait_for_state(&runtime, ViewState::Sleeping).await;

    let started = Instant::now();
    controller.remove_connection(conn.id());
    assert_eq!(next_note(&mut reports).await, "woke: user aborted the view");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(runtime.stop_reason(), Some(StopReason::UserAbort));
    assert!(controller.runtime_for(conn.id(), "w1").is_none());
}

#[tokio::test]
async fn test_shutdown_stops_views_with_server_stop() {
    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let mut router = Router::new();
    router.add(route("sleepy", "/sleepy/", move || SleepyView { reports: reports_tx.clone() }));
    let controller = controller(router);

    let (conn, mut rx) = Connection::pair("alice");
    controller.handle_incoming(&conn, &view_frame("w1", "/sleepy/")).await;
    let runtime = controller.runtime_for(conn.id(), "w1").unwrap();
    wait_for_state(&runtime, ViewState::Sleeping).await;

    controller.shutdown().await;
    assert_eq!(next_note(&mut reports).await, "woke: server is shutting down");
    frame_with(&mut rx, Method::ViewStop).await;
    assert!(controller.runtimes().is_empty());
}

#[tokio::test]
async fn test_unknown_route_renders_not_found() {
    let controller = controller(Router::new());
    let (conn, mut rx) = Connection::pair("alice");
    controller.handle_incoming(&conn, &view_frame("w1", "/missing/")).await;

    frame_with(&mut rx, Method::ViewStart).await;
    let data = frame_with(&mut rx, Method::Data).await;
    assert_eq!(data.payload[0], json!("404"));
    assert!(data.raw.contains("404 Not Found: /missing/"));
}

struct CrashingView {
    panic: bool,
}

impl View for CrashingView {
    fn handle_request(&self, view: &ViewHandle, _request: &Request) -> ViewResult {
        view.show(Some(&tags::div().with_text("about to fail")))?;
        if self.panic {
            panic!("view panicked");
        }
        Err(ViewError::custom("view failed"))
    }
}

#[tokio::test]
async fn test_crash_renders_internal_error() {
    let mut router = Router::new();
    router
        .add(route("fails", "/fails/", || CrashingView { panic: false }))
        .add(route("panics", "/panics/", || CrashingView { panic: true }));
    let controller = controller(router);

    for (window, url) in [("w1", "/fails/"), ("w2", "/panics/")] {
        let (conn, mut rx) = Connection::pair("alice");
        controller.handle_incoming(&conn, &view_frame(window, url)).await;
        let runtime = controller.runtime_for(conn.id(), window).unwrap();
        wait_for_state(&runtime, ViewState::Crashed).await;

        let error_page = loop {
            let frame = frame_with(&mut rx, Method::Data).await;
            if frame.payload[0] == json!("500") {
                break frame;
            }
        };
        assert!(error_page.raw.contains("500 Internal Error"), "{}", url);
    }
}

#[tokio::test]
async fn test_non_protocol_and_invalid_frames() {
    let controller = controller(Router::new());
    let (conn, _rx) = Connection::pair("alice");
    assert_eq!(controller.handle_incoming(&conn, "hello").await, HandleResult::NotHandled);
    assert_eq!(controller.handle_incoming(&conn, "tether:[1,2]").await, HandleResult::Invalid);
    assert_eq!(
        controller.handle_incoming(&conn, &format!("{}{}", PROTOCOL_PREFIX, json!(["w", "", 999, []]))).await,
        HandleResult::UnknownMethod(999)
    );
    // a known method with a bad payload is still invalid
    assert_eq!(
        controller.handle_incoming(&conn, &format!("{}{}", PROTOCOL_PREFIX, json!(["w", "", 101, [1]]))).await,
        HandleResult::Invalid
    );
}

#[tokio::test]
async fn test_input_event_for_unknown_window_is_acked() {
    let controller = controller(Router::new());
    let (conn, mut rx) = Connection::pair("alice");
    let stray = tags::button();
    controller.handle_incoming(&conn, &input_frame("nowhere", 42, CLICK, &stray)).await;
    let ack = next_frame(&mut rx).await;
    assert_eq!(ack.method, Method::InputEventAck.code());
    assert_eq!(ack.payload, json!([42]));
}

/// Waits on the event loop, either for a value or forever.
struct LoopWaitView {
    reports: UnboundedSender<Report>,
    forever: bool,
}

impl View for LoopWaitView {
    fn handle_request(&self, view: &ViewHandle, _request: &Request) -> ViewResult {
        if self.forever {
            let result = view.await_async(std::future::pending::<()>());
            let note = match &result {
                Err(ViewError::Stopped(reason)) => format!("woke: {}", reason),
                other => format!("unexpected {:?}", other),
            };
            let _ = self.reports.send(Report::Note(note));
            return result;
        }
        let value = view.await_async(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            41 + 1
        })?;
        let _ = self.reports.send(Report::Note(format!("value {}", value)));
        Ok(())
    }
}

fn loop_wait_router(reports: &UnboundedSender<Report>) -> Router {
    let (a, b) = (reports.clone(), reports.clone());
    let mut router = Router::new();
    router
        .add(route("value", "/value/", move || LoopWaitView { reports: a.clone(), forever: false }))
        .add(route("forever", "/forever/", move || LoopWaitView { reports: b.clone(), forever: true }));
    router
}

#[tokio::test]
async fn test_await_async_returns_value_and_view_finishes() {
    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let controller = controller(loop_wait_router(&reports_tx));
    let (conn, _rx) = Connection::pair("alice");
    controller.handle_incoming(&conn, &view_frame("w1", "/value/")).await;
    let runtime = controller.runtime_for(conn.id(), "w1").unwrap();

    assert_eq!(next_note(&mut reports).await, "value 42");
    wait_for_state(&runtime, ViewState::Finished).await;
    assert!(!runtime.is_stopped());

    // stopping a finished runtime keeps it finished
    controller.remove_connection(conn.id());
    assert_eq!(runtime.stop_reason(), Some(StopReason::UserAbort));
    assert_eq!(runtime.state(), ViewState::Finished);
}

#[tokio::test]
async fn test_stop_interrupts_await_async() {
    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let controller = controller(loop_wait_router(&reports_tx));
    let (conn, _rx) = Connection::pair("alice");
    controller.handle_incoming(&conn, &view_frame("w1", "/forever/")).await;
    let runtime = controller.runtime_for(conn.id(), "w1").unwrap();
    wait_for_state(&runtime, ViewState::WaitingForIoloop).await;

    let started = Instant::now();
    controller.remove_connection(conn.id());
    assert_eq!(next_note(&mut reports).await, "woke: user aborted the view");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(runtime.state(), ViewState::Stopped);
}
