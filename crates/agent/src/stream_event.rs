//! Run event delivery.
//!
//! A [`RunEventSink`] fans every [`RunEvent`] of one run out to the run's own
//! ordered channel and, optionally, to the process-wide [`EventBus`].
//! [`RunStream`] is the caller's end: an ordered `Stream` of events that ends
//! after `run:complete`, plus the run's final outcome.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use loopwright_core::error::{Error, Result};
use loopwright_core::event::{EventBus, RunEvent};
use loopwright_core::message::SessionId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::loop_runner::RunOutcome;

#[derive(Clone)]
pub struct RunEventSink {
    session_id: SessionId,
    tx: Option<mpsc::UnboundedSender<RunEvent>>,
    bus: Option<Arc<EventBus>>,
}

impl RunEventSink {
    /// A sink that only feeds the bus, if one is attached.
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            tx: None,
            bus: None,
        }
    }

    /// A sink plus the receiving end of its ordered channel.
    pub fn channel(session_id: SessionId) -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            session_id,
            tx: Some(tx),
            bus: None,
        };
        (sink, rx)
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(&self.session_id, event.clone());
        }
        if let Some(tx) = &self.tx {
            // The caller dropped its stream; the run carries on regardless.
            let _ = tx.send(event);
        }
    }
}

/// Events of a run in emission order, then its outcome via [`finish`](Self::finish).
pub struct RunStream {
    events: UnboundedReceiverStream<RunEvent>,
    handle: JoinHandle<Result<RunOutcome>>,
}

impl RunStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<RunEvent>,
        handle: JoinHandle<Result<RunOutcome>>,
    ) -> Self {
        Self {
            events: UnboundedReceiverStream::new(events),
            handle,
        }
    }

    /// Wait for the run to end and return its outcome. Events not yet read
    /// are discarded.
    pub async fn finish(self) -> Result<RunOutcome> {
        self.handle
            .await
            .map_err(|e| Error::Internal(format!("run task failed: {e}")))?
    }
}

impl Stream for RunStream {
    type Item = RunEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RunEvent>> {
        Pin::new(&mut self.get_mut().events).poll_next(cx)
    }
}
