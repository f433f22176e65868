//! Views: blocking procedures that drive a live document.
//!
//! A [`View`] is instantiated per runtime by its route's factory. Its
//! `handle_request` runs on a worker thread and talks to the runtime through
//! a [`ViewHandle`].

pub mod controller;
pub mod errors;
pub mod input;
pub mod runtime;

use serde_json::Value;

use crate::error::StopReason;
use crate::routing::MatchInfo;

pub use crate::error::{ViewError, ViewResult};
pub use controller::{HandleResult, ViewRuntimeController};
pub use errors::{ErrorHandler, ErrorHandlers};
pub use input::{AwaitKind, InputEvent, InputFilter};
pub use runtime::{Services, ViewHandle, ViewRuntime, ViewState};

/// The request a runtime was started for.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: String,
    pub user: String,
    pub post_data: Option<Value>,
    pub match_info: MatchInfo,
}

pub trait View: Send + Sync {
    /// The view procedure. Returning `Ok` finishes the view; any error other
    /// than `Stopped` crashes it.
    fn handle_request(&self, view: &ViewHandle, request: &Request) -> ViewResult;

    /// Input events no pending `await_input` slot took.
    fn handle_input_event_root(&self, _view: &ViewHandle, _event: InputEvent) -> ViewResult {
        Ok(())
    }

    /// Runs once when the runtime is stopped.
    fn on_stop(&self, _reason: &StopReason) {}

    /// Runs once after the procedure has returned and the runtime is stopped.
    fn on_cleanup(&self) {}
}
