//! Messages carried by the control plane's `text/event-stream` feed.
//!
//! Framing is left to `eventsource-stream`. Unnamed frames carry a JSON
//! [`DistributionEvent`] in `data`; keep-alive comments never surface as
//! events. A frame named `server_shutdown` tells the consumer to reconnect.

use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::flag::DistributionEvent;

pub const SHUTDOWN_EVENT: &str = "server_shutdown";

#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Event(DistributionEvent),
    Shutdown,
}

/// Interprets one decoded frame. Frames without data or with data that is
/// not a distribution event are skipped.
pub fn decode(event: &Event) -> Option<StreamMessage> {
    if event.event == SHUTDOWN_EVENT {
        return Some(StreamMessage::Shutdown);
    }
    if event.data.is_empty() {
        return None;
    }
    match serde_json::from_str::<DistributionEvent>(&event.data) {
        Ok(event) => Some(StreamMessage::Event(event)),
        Err(err) => {
            debug!(error = %err, "skipping unrecognised stream frame");
            None
        }
    }
}

/// Decodes a streamed response body into messages. A read error is passed
/// through and the caller decides whether to reconnect.
pub fn message_stream<S, B, E>(
    body: S,
) -> impl Stream<Item = Result<StreamMessage, EventStreamError<E>>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    body.eventsource().filter_map(|frame| async move {
        match frame {
            Ok(event) => decode(&event).map(Ok),
            Err(err) => Some(Err(err)),
        }
    })
}
