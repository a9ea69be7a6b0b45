//! Notification monitor workers.
//!
//! Each worker owns one fetch request and one reply buffer for its whole
//! life and loops: post a fetch, wait for it in bounded slices so the
//! cancellation signal is observed, dispatch the message, answer it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use fltport_transport::{Buffer, CommunicationPort, CompletionPort, FetchRequest, WaitStatus};
use fltport_wire::{encode_reply, Notification};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::handler::HandlerRegistry;

/// How a monitor worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stopped on the cancellation signal.
    Cancelled,
    /// Stopped on an unrecoverable error.
    Faulted(String),
    /// The worker thread panicked.
    Panicked,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Cancelled => f.write_str("cancelled"),
            WorkerExit::Faulted(reason) => write!(f, "faulted: {reason}"),
            WorkerExit::Panicked => f.write_str("panicked"),
        }
    }
}

pub(crate) struct MonitorWorker<P, C> {
    slot: usize,
    port: Arc<P>,
    completion: Arc<C>,
    handlers: Arc<HandlerRegistry>,
    cancel: CancellationToken,
    poll_interval: Duration,
    max_payload: usize,
    request: FetchRequest,
    reply: BytesMut,
}

impl<P, C> MonitorWorker<P, C>
where
    P: CommunicationPort,
    C: CompletionPort,
{
    pub(crate) fn new(
        slot: usize,
        port: Arc<P>,
        completion: Arc<C>,
        handlers: Arc<HandlerRegistry>,
        cancel: CancellationToken,
        config: &ClientConfig,
    ) -> Self {
        Self {
            slot,
            port,
            completion,
            handlers,
            cancel,
            poll_interval: config.poll_interval,
            max_payload: config.max_notification_payload,
            request: FetchRequest::new(Buffer::with_capacity(config.fetch_buffer_size())),
            reply: BytesMut::new(),
        }
    }

    /// Run until cancelled or faulted. An outstanding fetch is cancelled on
    /// every exit path.
    pub(crate) fn run(mut self) -> Result<()> {
        debug!(slot = self.slot, "monitor worker started");
        let result = self.monitor();
        if self.request.is_pending() {
            if let Err(err) = self.port.cancel_io(&mut self.request) {
                warn!(slot = self.slot, %err, "failed to cancel outstanding fetch");
            }
        }
        debug!(slot = self.slot, ok = result.is_ok(), "monitor worker stopped");
        result
    }

    fn monitor(&mut self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            self.port.get_message(&mut self.request)?;
            if !self.await_message()? {
                return Ok(());
            }
            self.answer()?;
        }
    }

    /// Wait for the posted fetch. Returns `false` if cancelled first.
    fn await_message(&mut self) -> Result<bool> {
        loop {
            match self.completion.wait(&mut self.request, self.poll_interval)? {
                WaitStatus::Completed => return Ok(true),
                WaitStatus::TimedOut => {
                    if self.cancel.is_cancelled() {
                        self.port.cancel_io(&mut self.request)?;
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn answer(&mut self) -> Result<()> {
        let notification = Notification::parse(self.request.message(), self.max_payload)?;
        trace!(
            slot = self.slot,
            message_id = notification.message_id(),
            type_code = notification.type_code(),
            len = notification.payload().len(),
            "notification received"
        );

        let reply = self
            .handlers
            .dispatch(&notification)
            .ok_or(ClientError::UnhandledNotification(notification.type_code()))?;

        if !notification.expects_reply() {
            if !reply.payload.is_empty() {
                warn!(
                    slot = self.slot,
                    message_id = notification.message_id(),
                    dropped = reply.payload.len(),
                    "extension expects no reply; dropping handler payload"
                );
            }
            return Ok(());
        }

        self.reply.clear();
        encode_reply(
            notification.message_id(),
            &reply,
            notification.reply_capacity(),
            &mut self.reply,
        )?;
        self.port.reply_message(&self.request, &self.reply)?;
        Ok(())
    }
}
