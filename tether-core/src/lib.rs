//! # tether-core
//!
//! Runs view procedures on worker threads and keeps their live documents in
//! sync with every attached client window.
//!
//! - [`view`]: the view runtime, its worker-side handle and the controller
//!   that routes client frames.
//! - [`channels`]: in-process pub/sub with an optional bus bridge.
//! - [`worker_pool`]: the named thread pools views and channels run on.
//! - [`config`]: YAML settings with environment overrides.

pub mod channels;
pub mod config;
pub mod connection;
pub mod error;
pub mod routing;
pub mod view;
pub mod worker_pool;

pub use channels::{Broker, Channel, Message, SendOptions};
pub use config::Settings;
pub use connection::Connection;
pub use error::{BusError, ConfigError, PoolError, StopReason, ViewError, ViewResult};
pub use routing::{MatchInfo, Route, Router};
pub use view::{
    HandleResult, InputEvent, InputFilter, Request, Services, View, ViewHandle, ViewRuntime,
    ViewRuntimeController, ViewState,
};
pub use worker_pool::{WorkerPool, WorkerPools};
