use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;

use crate::callback::{CallbackSink, SendEventRequest};
use crate::event::AnchorEvent;

use super::{EventHandler, HandlerOutcome};

/// Sends each event to the anchor's callback API.
///
/// A sink error or panic becomes [`HandlerOutcome::Failed`]; retrying is the
/// dispatch worker's job.
pub struct CallbackApiEventHandler<S> {
    sink: S,
}

impl<S: CallbackSink> CallbackApiEventHandler<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[async_trait]
impl<S: CallbackSink> EventHandler for CallbackApiEventHandler<S> {
    #[tracing::instrument(name = "callback_handle_event", skip(self, event), fields(event_id = %event.id()))]
    async fn handle_event(&self, event: &AnchorEvent) -> HandlerOutcome {
        tracing::info!("Sending event ({}) to callback API.", event.id());
        tracing::trace!(event = ?event, "Callback event");

        let request = SendEventRequest::from(event);

        match AssertUnwindSafe(self.sink.send_event(&request))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => HandlerOutcome::Delivered,
            Ok(Err(e)) => {
                tracing::warn!(event_id = %event.id(), error = %e, "Callback delivery failed");
                HandlerOutcome::Failed(e.to_string())
            }
            Err(_) => {
                tracing::error!(event_id = %event.id(), "Callback sink panicked");
                HandlerOutcome::Failed("callback sink panicked".to_string())
            }
        }
    }
}
