//! `tether-server`: demo views over a line-delimited TCP transport.
//!
//! Every line a client sends is one text frame. The first line may be
//! `user <name>`; otherwise the connection belongs to `anonymous`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tether_core::{
    Connection, HandleResult, Request, Route, Router, Services, Settings, View, ViewHandle,
    ViewResult, ViewRuntimeController,
};
use tether_html::tags;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

const CLOCK_TOPIC: &str = "demo.clock";

/// Counts button clicks until the window goes away.
struct CounterView;

impl View for CounterView {
    fn handle_request(&self, view: &ViewHandle, _request: &Request) -> ViewResult {
        let count = tags::span().with_text("0");
        let button = tags::button().with_text("+1");
        let root = tags::div()
            .with_class("counter")?
            .with_child(&count)?
            .with_child(&button)?;
        view.set_title("Counter");
        view.show(Some(&root))?;

        let mut clicks = 0u64;
        loop {
            view.await_click(&[button.clone()])?;
            clicks += 1;
            count.set_text(clicks.to_string())?;
            view.show(None)?;
        }
    }
}

/// One clock shared by every viewer, ticked through a channel.
struct ClockView;

impl View for ClockView {
    fn handle_request(&self, view: &ViewHandle, _request: &Request) -> ViewResult {
        let time = tags::span().with_text("--:--:--");
        let root = tags::div().with_class("clock")?.with_child(&time)?;
        view.set_title("Clock");
        view.show(Some(&root))?;

        let ticks = view.broker().subscribe_queue(CLOCK_TOPIC);
        loop {
            view.check_stop()?;
            match ticks.receive(Duration::from_millis(500)) {
                Ok(Some(message)) => {
                    let now = message.data.as_str().unwrap_or_default().to_string();
                    time.set_text(now)?;
                    view.show(None)?;
                }
                Ok(None) => {}
                Err(e) => return Err(tether_core::ViewError::custom(e.to_string())),
            }
        }
    }
}

/// Shows a message, sleeps, then finishes.
struct SleepView;

impl View for SleepView {
    fn handle_request(&self, view: &ViewHandle, request: &Request) -> ViewResult {
        let seconds: u64 = request
            .match_info
            .args
            .get("seconds")
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);
        let status = tags::p().with_text(format!("sleeping {}s", seconds));
        view.show(Some(&status))?;
        view.sleep(Duration::from_secs(seconds))?;
        status.set_text("done")?;
        view.show(None)
    }
}

fn router() -> Result<Router, regex::Error> {
    let mut router = Router::new();
    router
        .add(Route::new("counter", "/", || Arc::new(CounterView) as Arc<dyn View>)?)
        .add(Route::new("clock", "/clock/", || Arc::new(ClockView) as Arc<dyn View>)?.multi_user())
        .add(Route::new("sleep", "/sleep/<seconds>/", || Arc::new(SleepView) as Arc<dyn View>)?);
    Ok(router)
}

fn main() {
    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("[tether] invalid settings: {}", e);
            std::process::exit(1);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&settings.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let event_loop = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(target: "server", error = %e, "failed to build event loop");
            std::process::exit(1);
        }
    };
    if let Err(e) = event_loop.block_on(serve(settings)) {
        tracing::error!(target: "server", error = %e, "server failed");
        std::process::exit(1);
    }
}

async fn serve(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let services = Services::new(&settings, tokio::runtime::Handle::current());
    let controller = Arc::new(ViewRuntimeController::new(settings.clone(), router()?, services)?);
    controller.start_multi_user_views();
    tokio::spawn(clock_ticker(controller.clone()));

    let listener = TcpListener::bind(settings.bind_addr()).await?;
    tracing::info!(target: "server", addr = %settings.bind_addr(), "listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::debug!(target: "server", %peer, "client connected");
                tokio::spawn(handle_client(controller.clone(), stream, settings.strict_protocol));
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(target: "server", "shutting down");
                controller.shutdown().await;
                return Ok(());
            }
        }
    }
}

async fn clock_ticker(controller: Arc<ViewRuntimeController>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        let now = chrono::Local::now().format("%H:%M:%S").to_string();
        controller.services().broker.send(CLOCK_TOPIC, json!(now));
    }
}

async fn handle_client(controller: Arc<ViewRuntimeController>, stream: TcpStream, strict: bool) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let mut first = match lines.next_line().await {
        Ok(Some(line)) => Some(line),
        _ => return,
    };
    let user = match first.as_deref().and_then(|l| l.strip_prefix("user ")) {
        Some(name) => {
            let name = name.trim().to_string();
            first = None;
            name
        }
        None => "anonymous".to_string(),
    };

    let (connection, mut outgoing) = Connection::pair(&user);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outgoing.recv().await {
            if writer.write_all(frame.as_bytes()).await.is_err() || writer.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let mut pending = first;
    loop {
        let line = match pending.take() {
            Some(line) => line,
            None => match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(target: "server", error = %e, "read failed");
                    break;
                }
            },
        };
        match controller.handle_incoming(&connection, &line).await {
            HandleResult::Invalid if strict => break,
            HandleResult::NotHandled => {
                tracing::debug!(target: "server", connection_id = %connection.id(), "ignoring non-protocol line");
            }
            _ => {}
        }
    }

    controller.remove_connection(connection.id());
    writer_task.abort();
    tracing::debug!(target: "server", user, "client disconnected");
}
