//! View runtime controller: owns every runtime and routes client frames to them.
//!
//! Called from the event loop only. Single-user runtimes are keyed by
//! `(user, route)`, multi-user runtimes by route, and every attached window
//! by `(connection, window)`.

use std::sync::Arc;

use dashmap::DashMap;
use tether_html::{
    decode_client_message, encode_server_message, ClientMessage, InputEventPayload,
    ProtocolError, ServerMethod,
};

use super::errors::NotFoundView;
use super::runtime::{Services, ViewRuntime};
use super::Request;
use crate::config::Settings;
use crate::connection::Connection;
use crate::error::StopReason;
use crate::routing::{MatchInfo, Route, Router};

/// Outcome of [`ViewRuntimeController::handle_incoming`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    Handled,
    /// Not a protocol frame; another handler may own it.
    NotHandled,
    /// A protocol frame that could not be decoded.
    Invalid,
    /// A well-formed frame carrying a method this server does not handle.
    UnknownMethod(i64),
}

type WindowKey = (String, String);

pub struct ViewRuntimeController {
    settings: Settings,
    router: Router,
    services: Services,
    not_found_route: Arc<Route>,
    single: DashMap<(String, String), Arc<ViewRuntime>>,
    multi: DashMap<String, Arc<ViewRuntime>>,
    windows: DashMap<WindowKey, Arc<ViewRuntime>>,
}

impl ViewRuntimeController {
    pub fn new(settings: Settings, router: Router, services: Services) -> Result<Self, regex::Error> {
        let handlers = services.error_handlers.clone();
        let not_found_route = Arc::new(Route::new("404", "/404/", move || {
            Arc::new(NotFoundView {
                handlers: handlers.clone(),
            }) as Arc<dyn super::View>
        })?);
        Ok(Self {
            settings,
            router,
            services,
            not_found_route,
            single: DashMap::new(),
            multi: DashMap::new(),
            windows: DashMap::new(),
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Every live runtime, single- and multi-user.
    pub fn runtimes(&self) -> Vec<Arc<ViewRuntime>> {
        self.single
            .iter()
            .map(|e| e.value().clone())
            .chain(self.multi.iter().map(|e| e.value().clone()))
            .collect()
    }

    /// Runtime a window is attached to.
    pub fn runtime_for(&self, connection_id: &str, window_id: &str) -> Option<Arc<ViewRuntime>> {
        self.windows
            .get(&(connection_id.to_string(), window_id.to_string()))
            .map(|e| e.value().clone())
    }

    /// Start a runtime for every multi-user route without arguments.
    pub fn start_multi_user_views(&self) {
        for route in self.router.routes().iter().filter(|r| r.multi_user) {
            if route.pattern.contains('<') {
                continue;
            }
            let Some(info) = route.matches(&route.pattern) else {
                continue;
            };
            self.multi_user_runtime(route, info, &route.pattern);
        }
    }

    fn multi_user_runtime(&self, route: &Arc<Route>, info: MatchInfo, url: &str) -> Arc<ViewRuntime> {
        if let Some(existing) = self.multi.get(&route.name) {
            if !existing.is_stopped() {
                return existing.value().clone();
            }
        }
        let request = Request {
            url: url.to_string(),
            user: String::new(),
            post_data: None,
            match_info: info,
        };
        let runtime = ViewRuntime::new(
            route.clone(),
            None,
            route.build_view(),
            request,
            self.services.clone(),
        );
        self.launch(&runtime);
        self.multi.insert(route.name.clone(), runtime.clone());
        tracing::info!(target: "controller", route = %route.name, runtime_id = %runtime.id(), "multi-user view started");
        runtime
    }

    fn launch(&self, runtime: &Arc<ViewRuntime>) {
        if let Err(e) = runtime.start() {
            tracing::error!(target: "controller", runtime_id = %runtime.id(), error = %e, "failed to start view");
        }
    }

    /// Entry point for every text frame a connection receives.
    pub async fn handle_incoming(&self, connection: &Connection, frame: &str) -> HandleResult {
        let message = match decode_client_message(frame) {
            Ok(message) => message,
            Err(ProtocolError::NotAProtocolMessage) => return HandleResult::NotHandled,
            Err(ProtocolError::UnknownMethod(method)) => {
                tracing::debug!(target: "controller", connection_id = %connection.id(), method, "unknown method");
                return HandleResult::UnknownMethod(method);
            }
            Err(e) => {
                tracing::warn!(target: "controller", connection_id = %connection.id(), error = %e, "invalid frame");
                return HandleResult::Invalid;
            }
        };
        match message {
            ClientMessage::View {
                window_id,
                url,
                post_data,
                ..
            } => self.handle_view(connection, &window_id, &url, post_data).await,
            ClientMessage::InputEvent {
                window_id, event, ..
            } => self.handle_input_event(connection, &window_id, event).await,
        }
        HandleResult::Handled
    }

    async fn handle_view(
        &self,
        connection: &Connection,
        window_id: &str,
        url: &str,
        post_data: Option<serde_json::Value>,
    ) {
        let key = (connection.id().to_string(), window_id.to_string());
        if let Some((_, previous)) = self.windows.remove(&key) {
            previous.remove_window(connection.id(), window_id);
        }

        let runtime = match self.router.resolve(url) {
            Some((route, info)) if route.multi_user => self.multi_user_runtime(&route, info, url),
            Some((route, info)) => {
                match self.single_user_runtime(connection, route, info, url, post_data) {
                    Some(runtime) => runtime,
                    None => {
                        let stop = encode_server_message(window_id, "", &ServerMethod::ViewStop);
                        connection.send_str(stop);
                        return;
                    }
                }
            }
            None => {
                tracing::debug!(target: "controller", url, "no route matched");
                let info = MatchInfo {
                    route: self.not_found_route.name.clone(),
                    path: url.to_string(),
                    args: Default::default(),
                };
                self.single_user_runtime(connection, self.not_found_route.clone(), info, url, post_data)
                    .unwrap_or_else(|| self.fresh_runtime(connection, &self.not_found_route, url, None))
            }
        };

        runtime.add_connection(connection.clone(), window_id, url).await;
        self.windows.insert(key, runtime);
    }

    /// Reconnect to a daemonized runtime, else supersede whatever the user
    /// has on this route. `None` when the user is over the runtime limit.
    fn single_user_runtime(
        &self,
        connection: &Connection,
        route: Arc<Route>,
        info: MatchInfo,
        url: &str,
        post_data: Option<serde_json::Value>,
    ) -> Option<Arc<ViewRuntime>> {
        let key = (connection.user().to_string(), route.name.clone());
        if let Some((_, occupant)) = self.single.remove(&key) {
            if occupant.is_daemon() && !occupant.is_stopped() {
                tracing::debug!(target: "controller", runtime_id = %occupant.id(), "reconnecting to daemon view");
                self.single.insert(key, occupant.clone());
                return Some(occupant);
            }
            occupant.stop(StopReason::UserAbort);
        }

        let limit = self.settings.max_runtimes_per_user;
        if limit > 0 && self.user_runtime_count(connection.user()) >= limit {
            tracing::warn!(target: "controller", user = connection.user(), limit, "runtime limit reached");
            return None;
        }

        let request = Request {
            url: url.to_string(),
            user: connection.user().to_string(),
            post_data,
            match_info: info,
        };
        let runtime = ViewRuntime::new(
            route.clone(),
            Some(connection.user().to_string()),
            route.build_view(),
            request,
            self.services.clone(),
        );
        self.launch(&runtime);
        self.single.insert(key, runtime.clone());
        Some(runtime)
    }

    /// 404 page that bypasses the runtime limit.
    fn fresh_runtime(
        &self,
        connection: &Connection,
        route: &Arc<Route>,
        url: &str,
        post_data: Option<serde_json::Value>,
    ) -> Arc<ViewRuntime> {
        let request = Request {
            url: url.to_string(),
            user: connection.user().to_string(),
            post_data,
            match_info: MatchInfo {
                route: route.name.clone(),
                path: url.to_string(),
                args: Default::default(),
            },
        };
        let runtime = ViewRuntime::new(
            route.clone(),
            Some(connection.user().to_string()),
            route.build_view(),
            request,
            self.services.clone(),
        );
        self.launch(&runtime);
        runtime
    }

    fn user_runtime_count(&self, user: &str) -> usize {
        self.single
            .iter()
            .filter(|e| e.key().0 == user && !e.value().is_stopped())
            .count()
    }

    async fn handle_input_event(&self, connection: &Connection, window_id: &str, event: InputEventPayload) {
        match self.runtime_for(connection.id(), window_id) {
            Some(runtime) => runtime.handle_input_event(connection, window_id, event).await,
            None => {
                tracing::debug!(target: "controller", connection_id = %connection.id(), window_id, "input event for unknown window");
                // ACK anyway so the client does not wait on it
                let ack = encode_server_message(window_id, "", &ServerMethod::InputEventAck(event.event_id));
                connection.send_str(ack);
            }
        }
    }

    /// Detach every window of a closed connection.
    pub fn remove_connection(&self, connection_id: &str) {
        let keys: Vec<WindowKey> = self
            .windows
            .iter()
            .filter(|e| e.key().0 == connection_id)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, runtime)) = self.windows.remove(&key) {
                runtime.remove_connection(connection_id);
            }
        }
        self.single.retain(|_, runtime| !runtime.is_stopped());
        tracing::debug!(target: "controller", connection_id, "connection removed");
    }

    /// Stop every runtime with `ServerStop`, then the broker and the pools.
    pub async fn shutdown(&self) {
        tracing::info!(target: "controller", runtimes = self.single.len() + self.multi.len(), "shutting down views");
        for runtime in self.runtimes() {
            runtime.stop(StopReason::ServerStop);
        }
        self.single.clear();
        self.multi.clear();
        self.windows.clear();

        let services = self.services.clone();
        let joined = tokio::task::spawn_blocking(move || {
            services.broker.stop();
            services.pools.shutdown();
        })
        .await;
        if let Err(e) = joined {
            tracing::error!(target: "controller", error = %e, "shutdown task failed");
        }
    }
}
