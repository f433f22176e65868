//! In-process pub/sub with an optional bus bridge.

pub mod bridge;
pub mod broker;
pub mod message;
pub mod topic;

pub use bridge::BridgeSink;
pub use broker::{Broker, Channel, Handler, HandlerResult, SUBSCRIBE_TOPIC, UNSUBSCRIBE_TOPIC};
pub use message::{Expiry, Message, SendOptions};
