use std::time::Duration;

use tokio::sync::oneshot;

use crate::types::{CoqError, CoqTopSettings};

/// What to do when a call's deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Tear the session down and report the timeout.
    Fatal,
    /// Give up waiting; the caller carries on regardless.
    Swallow,
    /// Send an `Interrupt`, then wait the same deadline once more before
    /// treating the call as fatal.
    Interrupt,
}

/// Deadline policy wrapped around a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub deadline: Option<Duration>,
    pub on_expiry: Expiry,
}

impl Envelope {
    pub fn init(settings: &CoqTopSettings) -> Self {
        Self {
            deadline: Some(Duration::from_millis(settings.init_timeout_ms)),
            on_expiry: Expiry::Fatal,
        }
    }

    pub fn quit(settings: &CoqTopSettings) -> Self {
        Self {
            deadline: Some(Duration::from_millis(settings.quit_timeout_ms)),
            on_expiry: Expiry::Swallow,
        }
    }

    /// Envelope for every other call.
    pub fn call(settings: &CoqTopSettings) -> Self {
        Self {
            deadline: settings.call_timeout_ms.map(Duration::from_millis),
            on_expiry: Expiry::Interrupt,
        }
    }

    pub fn millis(&self) -> u64 {
        self.deadline.map_or(0, |d| d.as_millis() as u64)
    }
}

/// Outcome of waiting on a reply slot.
#[derive(Debug)]
pub enum Waited<T> {
    Done(Result<T, CoqError>),
    Expired,
}

/// Wait for `rx` within `deadline` (forever if `None`).
///
/// A dropped sender means the session went away and reads as
/// [`CoqError::Closed`]. The receiver is borrowed so the caller can keep
/// waiting on it after an expiry.
pub async fn wait<T>(
    deadline: Option<Duration>,
    rx: &mut oneshot::Receiver<Result<T, CoqError>>,
) -> Waited<T> {
    let received = match deadline {
        Some(d) => match tokio::time::timeout(d, rx).await {
            Ok(received) => received,
            Err(_) => return Waited::Expired,
        },
        None => rx.await,
    };
    Waited::Done(received.unwrap_or_else(|_| Err(CoqError::Closed("reply dropped".into()))))
}
