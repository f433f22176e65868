//! View runtime: one running instance of a view procedure.
//!
//! The procedure runs on a thread of the runtime pool and may block freely.
//! Its suspension points (`await_input`, `sleep`, `await_async` and lock
//! contention) never block the event loop: timers and futures run on the loop
//! and hand their result back through a oneshot the worker blocks on. Every
//! suspension point races the runtime's stop signal, so `stop` always
//! unblocks the worker promptly.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tether_html::{
    encode_server_message, Document, DocumentData, InputEventPayload, LockGuard, LoopTask, Node,
    ServerMethod, WorkerContext,
};
use tokio::sync::{oneshot, watch};

use super::errors::{fallback_internal_error, render_with_fallback, ErrorHandlers};
use super::input::{AwaitKind, InputEvent, InputFilter};
use super::{Request, View};
use crate::channels::Broker;
use crate::config::Settings;
use crate::connection::Connection;
use crate::error::{StopReason, ViewError, ViewResult};
use crate::routing::Route;
use crate::worker_pool::{panic_message, WorkerPools};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Starting,
    Running,
    WaitingForInput,
    Sleeping,
    WaitingForIoloop,
    Finished,
    Crashed,
    Stopped,
}

impl ViewState {
    /// `Finished`, `Crashed` and `Stopped` absorb every later transition. A
    /// finished runtime can still be stopped, but its state stays `Finished`.
    pub fn is_terminal(self) -> bool {
        matches!(self, ViewState::Finished | ViewState::Crashed | ViewState::Stopped)
    }
}

/// Shared collaborators every runtime needs.
#[derive(Clone)]
pub struct Services {
    pub broker: Broker,
    pub pools: WorkerPools,
    /// Handle of the event loop that owns timers and connections.
    pub event_loop: tokio::runtime::Handle,
    pub error_handlers: ErrorHandlers,
}

impl Services {
    /// Pools sized from `settings`, a broker delivering on the channel pool
    /// and the default error pages.
    pub fn new(settings: &Settings, event_loop: tokio::runtime::Handle) -> Self {
        let pools = WorkerPools::from_settings(settings);
        let broker = Broker::new(pools.channels.clone());
        Self {
            broker,
            pools,
            event_loop,
            error_handlers: ErrorHandlers::default(),
        }
    }
}

struct Attached {
    connection: Connection,
    window_id: String,
    url: String,
}

type SlotResult = Result<InputEvent, StopReason>;

struct Slot {
    filter: InputFilter,
    tx: oneshot::Sender<SlotResult>,
}

/// Stop reason and pending input slots share one mutex so a slot can never
/// be registered after `stop` has drained them.
#[derive(Default)]
struct Pending {
    stop: Option<StopReason>,
    slots: HashMap<AwaitKind, Slot>,
}

pub struct ViewRuntime {
    id: String,
    route: Arc<Route>,
    /// `None` for multi-user runtimes.
    user: Option<String>,
    view: Arc<dyn View>,
    request: Request,
    document: Document,
    title: Mutex<Option<String>>,
    state: Mutex<ViewState>,
    connections: Mutex<Vec<Attached>>,
    daemon: AtomicBool,
    multi_user: bool,
    pending: Mutex<Pending>,
    stop_tx: watch::Sender<Option<StopReason>>,
    procedure_done: AtomicBool,
    stop_hook_ran: AtomicBool,
    cleanup_ran: AtomicBool,
    services: Services,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once a stop reason is set.
async fn wait_stop(mut rx: watch::Receiver<Option<StopReason>>) -> StopReason {
    loop {
        if let Some(reason) = rx.borrow_and_update().clone() {
            return reason;
        }
        if rx.changed().await.is_err() {
            return StopReason::ServerStop;
        }
    }
}

impl ViewRuntime {
    pub fn new(
        route: Arc<Route>,
        user: Option<String>,
        view: Arc<dyn View>,
        request: Request,
        services: Services,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(None);
        let multi_user = user.is_none();
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            route,
            user,
            view,
            request,
            document: Document::new(),
            title: Mutex::new(None),
            state: Mutex::new(ViewState::Starting),
            connections: Mutex::new(Vec::new()),
            daemon: AtomicBool::new(false),
            multi_user,
            pending: Mutex::new(Pending::default()),
            stop_tx,
            procedure_done: AtomicBool::new(false),
            stop_hook_ran: AtomicBool::new(false),
            cleanup_ran: AtomicBool::new(false),
            services,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn route(&self) -> &Arc<Route> {
        &self.route
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn is_multi_user(&self) -> bool {
        self.multi_user
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ViewState {
        *lock(&self.state)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        lock(&self.pending).stop.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_reason().is_some()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn pending_slots(&self) -> Vec<AwaitKind> {
        lock(&self.pending).slots.keys().copied().collect()
    }

    fn set_state(&self, next: ViewState) {
        let mut state = lock(&self.state);
        if !state.is_terminal() {
            *state = next;
        }
    }

    /// Schedule the view procedure on the runtime pool.
    pub fn start(self: &Arc<Self>) -> ViewResult {
        let runtime = self.clone();
        self.services
            .pools
            .runtime
            .execute(move || runtime.run())
            .map_err(|e| ViewError::custom(e.to_string()))
    }

    fn run(self: Arc<Self>) {
        let ctx = match WorkerContext::current() {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!(target: "view", runtime_id = %self.id, error = %e, "view started on the event loop");
                return;
            }
        };
        self.set_state(ViewState::Running);
        tracing::debug!(target: "view", runtime_id = %self.id, route = %self.route.name, "view started");

        let handle = ViewHandle {
            runtime: self.clone(),
            ctx,
        };
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.view.handle_request(&handle, &self.request)
        }));
        match result {
            Ok(Ok(())) => {
                self.set_state(ViewState::Finished);
                tracing::debug!(target: "view", runtime_id = %self.id, "view finished");
            }
            Ok(Err(ViewError::Stopped(reason))) => {
                tracing::debug!(target: "view", runtime_id = %self.id, %reason, "view unwound after stop");
            }
            Ok(Err(e)) => self.crash(&handle.ctx, &e.to_string()),
            Err(panic) => self.crash(&handle.ctx, &panic_message(&*panic)),
        }
        self.procedure_done.store(true, Ordering::SeqCst);
        self.maybe_cleanup();
    }

    /// Mark crashed, log and render the 500 page to every connection.
    fn crash(&self, ctx: &WorkerContext, message: &str) {
        if self.is_stopped() {
            return;
        }
        // a root input hook may crash a runtime whose procedure already finished
        *lock(&self.state) = ViewState::Crashed;
        tracing::error!(target: "view", runtime_id = %self.id, route = %self.route.name, error = %message, "view crashed");
        let node = render_with_fallback(
            &self.services.error_handlers.internal_error,
            fallback_internal_error,
            &self.request,
            Some(message),
        );
        *lock(&self.title) = Some("500".to_string());
        self.show_node(ctx, Some(&node));
    }

    fn send_to(&self, attached: &Attached, method: &ServerMethod) {
        let frame = encode_server_message(&attached.window_id, &self.id, method);
        attached.connection.send_str(frame);
    }

    fn broadcast(&self, method: &ServerMethod) {
        for attached in lock(&self.connections).iter() {
            self.send_to(attached, method);
        }
    }

    fn data(&self, data: DocumentData) -> ServerMethod {
        ServerMethod::Data {
            title: lock(&self.title).clone(),
            data,
        }
    }

    /// Apply `node` under the document lock and push the result to every
    /// connection while still holding it, so frames leave in patch order.
    fn show_node(&self, ctx: &WorkerContext, node: Option<&Node>) {
        let _guard = self.document.lock().lock(ctx);
        if let Some(data) = self.document.apply(node) {
            self.broadcast(&self.data(data));
        }
    }

    fn show_html(&self, ctx: &WorkerContext, html: String) {
        let _guard = self.document.lock().lock(ctx);
        self.broadcast(&self.data(DocumentData::Html(html)));
    }

    /// Attach a connection: flush pending deltas to the existing connections,
    /// then send VIEW_START and a full sync to the new one.
    pub async fn add_connection(&self, connection: Connection, window_id: &str, url: &str) {
        let task = LoopTask::new();
        let _guard = self.document.lock().lock_async(&task).await;
        if let Some(update) = self.document.flush_update() {
            self.broadcast(&self.data(update));
        }
        let attached = Attached {
            connection,
            window_id: window_id.to_string(),
            url: url.to_string(),
        };
        self.send_to(&attached, &ServerMethod::ViewStart);
        if let Some(full) = self.document.full_sync() {
            self.send_to(&attached, &self.data(full));
        }
        tracing::debug!(
            target: "view",
            runtime_id = %self.id,
            connection_id = %attached.connection.id(),
            window_id,
            "connection attached"
        );
        lock(&self.connections).push(attached);
    }

    /// Detach every window of `connection_id`. Stops the runtime with
    /// `UserAbort` when nothing is left and it is neither daemon nor multi-user.
    pub fn remove_connection(self: &Arc<Self>, connection_id: &str) -> bool {
        self.detach(|a| a.connection.id() == connection_id)
    }

    pub fn remove_window(self: &Arc<Self>, connection_id: &str, window_id: &str) -> bool {
        self.detach(|a| a.connection.id() == connection_id && a.window_id == window_id)
    }

    fn detach(self: &Arc<Self>, remove: impl Fn(&Attached) -> bool) -> bool {
        let (removed, remaining) = {
            let mut connections = lock(&self.connections);
            let before = connections.len();
            connections.retain(|a| !remove(a));
            (before != connections.len(), connections.len())
        };
        if removed && remaining == 0 && !self.is_daemon() && !self.multi_user {
            self.stop(StopReason::UserAbort);
        }
        removed
    }

    /// Urls of the attached windows, by connection id.
    pub fn attached_urls(&self) -> Vec<(String, String)> {
        lock(&self.connections)
            .iter()
            .map(|a| (a.connection.id().to_string(), a.url.clone()))
            .collect()
    }

    /// Deliver a client input event (event-loop side). Fulfils a matching
    /// pending slot, specific kind first, then `Any`; otherwise hands the
    /// event to the view's root input hook. Always ACKs to the sender.
    pub async fn handle_input_event(
        self: &Arc<Self>,
        connection: &Connection,
        window_id: &str,
        payload: InputEventPayload,
    ) {
        let event_id = payload.event_id;
        let node = {
            let task = LoopTask::new();
            let _guard = self.document.lock().lock_async(&task).await;
            self.document.root().and_then(|root| root.find(payload.node_id))
        };
        let event = InputEvent::from_payload(payload, node, connection.id(), window_id);

        let unclaimed = self.resolve_slot(event);
        if let Some(event) = unclaimed {
            if !self.is_stopped() {
                self.run_root_hook(event);
            }
        }

        let ack = encode_server_message(window_id, &self.id, &ServerMethod::InputEventAck(event_id));
        connection.send_str(ack);
    }

    /// Returns the event back when no slot took it.
    fn resolve_slot(&self, mut event: InputEvent) -> Option<InputEvent> {
        let mut pending = lock(&self.pending);
        let candidates = AwaitKind::for_event(event.kind)
            .into_iter()
            .chain(std::iter::once(AwaitKind::Any));
        for kind in candidates {
            let matches = pending
                .slots
                .get(&kind)
                .is_some_and(|slot| slot.filter.matches(&event));
            if !matches {
                continue;
            }
            let Some(slot) = pending.slots.remove(&kind) else {
                continue;
            };
            match slot.tx.send(Ok(event)) {
                Ok(()) => return None,
                // waiter is gone, try the next slot
                Err(Ok(returned)) => event = returned,
                Err(Err(_)) => return None,
            }
        }
        Some(event)
    }

    fn run_root_hook(self: &Arc<Self>, event: InputEvent) {
        let runtime = self.clone();
        let scheduled = self.services.pools.runtime.execute(move || {
            let ctx = match WorkerContext::current() {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::error!(target: "view", error = %e, "input hook started on the event loop");
                    return;
                }
            };
            let handle = ViewHandle {
                runtime: runtime.clone(),
                ctx,
            };
            let result = catch_unwind(AssertUnwindSafe(|| {
                runtime.view.handle_input_event_root(&handle, event)
            }));
            match result {
                Ok(Ok(())) | Ok(Err(ViewError::Stopped(_))) => {}
                Ok(Err(e)) => runtime.crash(&handle.ctx, &e.to_string()),
                Err(panic) => runtime.crash(&handle.ctx, &panic_message(&*panic)),
            }
        });
        if let Err(e) = scheduled {
            tracing::warn!(target: "view", runtime_id = %self.id, error = %e, "input hook not scheduled");
        }
    }

    /// Stop the runtime. The first call wins; pending slots resolve with the
    /// reason, sleeps and async waits wake up, `on_stop` runs once.
    pub fn stop(self: &Arc<Self>, reason: StopReason) {
        let drained: Vec<Slot> = {
            let mut pending = lock(&self.pending);
            if pending.stop.is_some() {
                return;
            }
            pending.stop = Some(reason.clone());
            pending.slots.drain().map(|(_, slot)| slot).collect()
        };
        self.set_state(ViewState::Stopped);
        for slot in drained {
            let _ = slot.tx.send(Err(reason.clone()));
        }
        self.stop_tx.send_replace(Some(reason.clone()));
        tracing::info!(target: "view", runtime_id = %self.id, route = %self.route.name, %reason, "view stopped");

        self.broadcast(&ServerMethod::ViewStop);

        if !self.stop_hook_ran.swap(true, Ordering::SeqCst) {
            let runtime = self.clone();
            self.run_hook(move || runtime.view.on_stop(&reason));
        }
        self.maybe_cleanup();
    }

    /// `on_cleanup` runs once both the procedure has returned and the runtime is stopped.
    fn maybe_cleanup(self: &Arc<Self>) {
        if !self.procedure_done.load(Ordering::SeqCst) || !self.is_stopped() {
            return;
        }
        if self.cleanup_ran.swap(true, Ordering::SeqCst) {
            return;
        }
        let runtime = self.clone();
        self.run_hook(move || runtime.view.on_cleanup());
    }

    /// Hooks run on the general pool, inline when the pool is gone.
    fn run_hook(&self, hook: impl FnOnce() + Send + 'static) {
        let guarded = move || {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(hook)) {
                tracing::error!(target: "view", panic = %panic_message(&*panic), "view hook panicked");
            }
        };
        let pool = &self.services.pools.general;
        if pool.is_shut_down() {
            guarded();
        } else if let Err(e) = pool.execute(guarded) {
            tracing::warn!(target: "view", error = %e, "view hook dropped");
        }
    }

    fn stop_signal(&self) -> watch::Receiver<Option<StopReason>> {
        self.stop_tx.subscribe()
    }
}

impl std::fmt::Debug for ViewRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewRuntime")
            .field("id", &self.id)
            .field("route", &self.route.name)
            .field("user", &self.user)
            .field("state", &self.state())
            .finish()
    }
}

/// What a view procedure gets to drive its runtime. Lives on the worker
/// thread only: it is neither `Send` nor constructible on the event loop.
pub struct ViewHandle {
    runtime: Arc<ViewRuntime>,
    ctx: WorkerContext,
}

impl ViewHandle {
    pub fn runtime(&self) -> &Arc<ViewRuntime> {
        &self.runtime
    }

    pub fn id(&self) -> &str {
        self.runtime.id()
    }

    pub fn request(&self) -> &Request {
        &self.runtime.request
    }

    pub fn document(&self) -> &Document {
        &self.runtime.document
    }

    pub fn broker(&self) -> &Broker {
        &self.runtime.services.broker
    }

    /// Hold the document lock for a multi-step read-modify-write.
    pub fn lock(&self) -> LockGuard {
        self.runtime.document.lock().lock(&self.ctx)
    }

    /// `Err(Stopped)` once the runtime has been stopped.
    pub fn check_stop(&self) -> ViewResult {
        match self.runtime.stop_reason() {
            Some(reason) => Err(ViewError::Stopped(reason)),
            None => Ok(()),
        }
    }

    pub fn set_title(&self, title: &str) {
        *lock(&self.runtime.title) = Some(title.to_string());
    }

    /// Send changes since the last show (or the full tree for a new root) to
    /// every attached connection. Never suspends.
    pub fn show(&self, node: Option<&Node>) -> ViewResult {
        self.check_stop()?;
        self.runtime.show_node(&self.ctx, node);
        Ok(())
    }

    /// Send a pre-rendered HTML string.
    pub fn show_html(&self, html: impl Into<String>) -> ViewResult {
        self.check_stop()?;
        self.runtime.show_html(&self.ctx, html.into());
        Ok(())
    }

    pub fn redirect(&self, url: &str) -> ViewResult {
        self.check_stop()?;
        self.runtime.broadcast(&ServerMethod::Redirect(url.to_string()));
        Ok(())
    }

    pub fn http_redirect(&self, url: &str) -> ViewResult {
        self.check_stop()?;
        self.runtime.broadcast(&ServerMethod::HttpRedirect(url.to_string()));
        Ok(())
    }

    /// Keep running after the last connection detaches.
    pub fn daemonize(&self) {
        self.runtime.daemon.store(true, Ordering::SeqCst);
        tracing::debug!(target: "view", runtime_id = %self.runtime.id, "view daemonized");
    }

    /// Block until an input event matching `filter` arrives. Only one slot
    /// per kind may be pending.
    pub fn await_input(&self, filter: InputFilter) -> ViewResult<InputEvent> {
        let kind = filter.kind;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.runtime.pending);
            if let Some(reason) = &pending.stop {
                return Err(ViewError::Stopped(reason.clone()));
            }
            if pending.slots.contains_key(&kind) {
                return Err(ViewError::InputSlotOccupied(kind));
            }
            pending.slots.insert(kind, Slot { filter, tx });
        }
        self.runtime.set_state(ViewState::WaitingForInput);
        let result = rx.blocking_recv();
        self.runtime.set_state(ViewState::Running);
        match result {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(reason)) => Err(ViewError::Stopped(reason)),
            Err(_) => Err(ViewError::Stopped(
                self.runtime.stop_reason().unwrap_or(StopReason::ServerStop),
            )),
        }
    }

    pub fn await_click(&self, nodes: &[Node]) -> ViewResult<InputEvent> {
        self.await_input(InputFilter::click().on(nodes))
    }

    pub fn await_change(&self, nodes: &[Node]) -> ViewResult<InputEvent> {
        self.await_input(InputFilter::change().on(nodes))
    }

    /// Run `future` on the event loop and block this worker until it
    /// completes or the runtime is stopped.
    fn block_on_loop<T, F>(&self, state: ViewState, future: F) -> ViewResult<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.check_stop()?;
        let (tx, rx) = oneshot::channel();
        let stop = self.runtime.stop_signal();
        self.runtime.services.event_loop.spawn(async move {
            let result = tokio::select! {
                value = future => Ok(value),
                reason = wait_stop(stop) => Err(reason),
            };
            let _ = tx.send(result);
        });
        self.runtime.set_state(state);
        let result = rx.blocking_recv();
        self.runtime.set_state(ViewState::Running);
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(ViewError::Stopped(reason)),
            Err(_) => Err(ViewError::Stopped(
                self.runtime.stop_reason().unwrap_or(StopReason::ServerStop),
            )),
        }
    }

    /// Sleep on a loop timer; returns early with `Stopped` on stop.
    pub fn sleep(&self, duration: Duration) -> ViewResult {
        // the timer has to be created on the loop, this thread has no reactor
        self.block_on_loop(ViewState::Sleeping, async move {
            tokio::time::sleep(duration).await
        })
    }

    pub fn await_async<T, F>(&self, future: F) -> ViewResult<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.block_on_loop(ViewState::WaitingForIoloop, future)
    }
}
