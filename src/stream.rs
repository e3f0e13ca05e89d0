use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;

use crate::job::{JobEvent, JobHandle};

/// A job's events as a stream that ends after `Done`.
///
/// Dropping the stream before `Done` (the client went away) cancels the
/// job. Once `Done` has been yielded the job is finished and dropping is a
/// no-op.
pub struct EventStream {
    session: String,
    events: ReceiverStream<JobEvent>,
    cancel_on_drop: Option<DropGuard>,
    finished: bool,
}

impl EventStream {
    pub fn new(session: impl Into<String>, handle: JobHandle) -> Self {
        Self {
            session: session.into(),
            events: ReceiverStream::new(handle.events),
            cancel_on_drop: Some(handle.cancel.drop_guard()),
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(guard) = self.cancel_on_drop.take() {
            guard.disarm();
        }
    }
}

impl Stream for EventStream {
    type Item = JobEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<JobEvent>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.events).poll_next(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_done() {
                    self.finish();
                }
                Poll::Ready(Some(event))
            }
            // Job was cancelled from elsewhere (eviction, shutdown).
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if !self.finished {
            tracing::info!(session = %self.session, "event stream closed before completion, cancelling job");
        }
    }
}
