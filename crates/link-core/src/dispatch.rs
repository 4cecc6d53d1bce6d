//! The uniform link contract and the shared dispatch loop.
//!
//! Every layer exposes `send` plus a subscribable channel of
//! `(sender, message)` deliveries. Layers above the Fair-Loss Link consume
//! the channel below them with [`handle_events`], which keeps running when
//! a handler fails so one bad event cannot stall a layer.

use crate::error::{LinkError, Result};
use crate::tasks::TaskGroup;
use crate::{Message, ProcessId};
use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// A message together with the process that sent it.
pub type Delivery = (ProcessId, Message);
pub type DeliverySender = mpsc::UnboundedSender<Delivery>;
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

/// Point-to-point link: fire-and-forget sends, channel-based deliveries.
pub trait Link: Send + Sync {
    /// Hand a message to the link. Never blocks and never fails; what
    /// happens to the message afterwards is the layer's guarantee.
    fn send(&self, destination: &ProcessId, message: Message);

    /// Subscribe to deliveries. Each layer accepts exactly one subscriber.
    fn deliver_events(&self) -> Result<DeliveryReceiver>;
}

/// Holder for the single subscriber of a delivery channel.
#[derive(Default)]
pub(crate) struct Subscriber {
    tx: Mutex<Option<DeliverySender>>,
}

impl Subscriber {
    pub(crate) fn subscribe(&self) -> Result<DeliveryReceiver> {
        let mut slot = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(LinkError::AlreadySubscribed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(tx);
        Ok(rx)
    }

    /// Publish to the subscriber. Returns false when there is nobody listening.
    pub(crate) fn publish(&self, delivery: Delivery) -> bool {
        let slot = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(tx) => tx.send(delivery).is_ok(),
            None => false,
        }
    }
}

/// Pull deliveries off `events` and run `handler` on each until the channel
/// closes or `cancel` fires.
///
/// Handler errors and panics are logged and the loop moves on to the next
/// event.
pub async fn handle_events<F, E>(
    mut events: DeliveryReceiver,
    cancel: CancellationToken,
    mut handler: F,
) where
    F: FnMut(ProcessId, Message) -> std::result::Result<(), E>,
    E: Display,
{
    loop {
        let (sender, message) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    debug!("Event channel closed");
                    break;
                }
            },
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler(sender, message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Event handler failed: {}", e),
            Err(payload) => error!("Event handler panicked: {}", panic_message(&payload)),
        }
    }
}

/// Spawn [`handle_events`] as a worker of `tasks`.
pub fn spawn_dispatch<F, E>(
    tasks: &TaskGroup,
    span: tracing::Span,
    events: DeliveryReceiver,
    handler: F,
) where
    F: FnMut(ProcessId, Message) -> std::result::Result<(), E> + Send + 'static,
    E: Display + 'static,
{
    let cancel = tasks.token();
    tasks.spawn(span, handle_events(events, cancel, handler));
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
