//! Handle to one transport connection.

use std::fmt;
use tokio::sync::mpsc;

/// A connected client as seen by the view layer. Frames are queued on an
/// unbounded channel drained by the transport task, so sending never blocks.
#[derive(Clone)]
pub struct Connection {
    id: String,
    user: String,
    sender: mpsc::UnboundedSender<String>,
}

impl Connection {
    pub fn new(user: &str, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user: user.to_string(),
            sender,
        }
    }

    /// A connection plus the receiving end of its frame queue.
    pub fn pair(user: &str) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(user, tx), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Queue a text frame. Returns false once the transport side is gone.
    pub fn send_str(&self, frame: String) -> bool {
        if self.sender.send(frame).is_err() {
            tracing::debug!(target: "connection", connection_id = %self.id, "send on closed connection");
            return false;
        }
        true
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user", &self.user)
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
