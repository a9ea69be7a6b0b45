use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use bytes::Bytes;
use fltport_wire::{Notification, NotificationReply, STATUS_UNSUCCESSFUL};
use tracing::warn;

/// A handler's refusal, reported to the extension as a reply status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler failed with status 0x{status:08X}: {message}")]
pub struct HandlerError {
    pub status: i32,
    pub message: String,
}

impl HandlerError {
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Failure reported as `STATUS_UNSUCCESSFUL`.
    pub fn unsuccessful(message: impl Into<String>) -> Self {
        Self::new(STATUS_UNSUCCESSFUL, message)
    }
}

/// Outcome of handling one notification: an optional reply payload.
pub type HandlerResult = std::result::Result<Option<Bytes>, HandlerError>;

/// Handles notifications of one type code.
///
/// Called concurrently from every monitor worker. The notification payload
/// borrows the worker's buffer and is only valid for the duration of the call.
pub trait NotificationHandler: Send + Sync + 'static {
    fn handle(&self, notification: &Notification<'_>) -> HandlerResult;
}

impl<F> NotificationHandler for F
where
    F: Fn(&Notification<'_>) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, notification: &Notification<'_>) -> HandlerResult {
        self(notification)
    }
}

/// Type code to handler map, frozen while monitor workers run.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<i32, Box<dyn NotificationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `type_code`, replacing any previous one.
    /// Returns whether a handler was replaced.
    pub fn register<H: NotificationHandler>(&mut self, type_code: i32, handler: H) -> bool {
        self.handlers
            .insert(type_code, Box::new(handler))
            .is_some()
    }

    pub fn contains(&self, type_code: i32) -> bool {
        self.handlers.contains_key(&type_code)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered type codes, ascending.
    pub fn type_codes(&self) -> Vec<i32> {
        let mut codes: Vec<i32> = self.handlers.keys().copied().collect();
        codes.sort_unstable();
        codes
    }

    /// Run the handler for `notification` and build its reply.
    ///
    /// Returns `None` when no handler is registered for the type. Handler
    /// errors and panics become a non-zero status reply.
    pub(crate) fn dispatch(&self, notification: &Notification<'_>) -> Option<NotificationReply> {
        let handler = self.handlers.get(&notification.type_code())?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(notification)));
        let reply = match outcome {
            Ok(Ok(payload)) => NotificationReply::success(payload.unwrap_or_default()),
            Ok(Err(err)) => {
                warn!(
                    type_code = notification.type_code(),
                    message_id = notification.message_id(),
                    %err,
                    "notification handler failed"
                );
                let status = if err.status == 0 {
                    STATUS_UNSUCCESSFUL
                } else {
                    err.status
                };
                NotificationReply::with_status(status)
            }
            Err(_) => {
                warn!(
                    type_code = notification.type_code(),
                    message_id = notification.message_id(),
                    "notification handler panicked"
                );
                NotificationReply::with_status(STATUS_UNSUCCESSFUL)
            }
        };
        Some(reply)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("type_codes", &self.type_codes())
            .finish()
    }
}
