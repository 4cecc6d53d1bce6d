//! Stubborn Link: retransmit every message forever over a Fair-Loss Link.
//!
//! A sent message is handed to the Fair-Loss Link right away and also added
//! to the pending set. Every `retransmit_interval` the timer worker sends
//! the whole pending set again. As long as the destination is correct and
//! the Fair-Loss Link delivers some of infinitely many copies, every message
//! is eventually delivered, typically many times over. Deliveries from below
//! are passed up unchanged.
//!
//! The pending set is owned by the timer worker alone; `send` reaches it
//! through a channel. Retransmissions use the Fair-Loss Link's resend
//! queue, which waits for room, so no pending message is skipped on a pass
//! however large the set grows. Passes that overrun the interval delay the
//! next one.

use crate::config::StubbornConfig;
use crate::dispatch::{DeliveryReceiver, Link, Subscriber, spawn_dispatch};
use crate::error::Result;
use crate::fair_loss::FairLossLink;
use crate::retention::{KeepAll, Retention};
use crate::tasks::TaskGroup;
use crate::{Message, ProcessId};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span};

/// Messages still being retransmitted, with the number of passes each has
/// survived.
#[derive(Debug, Default)]
pub struct PendingSet {
    entries: HashMap<(ProcessId, Message), u32>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message. Adding one that is already pending keeps its age.
    pub fn insert(&mut self, destination: ProcessId, message: Message) {
        self.entries.entry((destination, message)).or_insert(0);
    }

    /// Run one retransmission pass: drop what `retention` rejects, age the
    /// rest and return them for sending.
    pub fn tick(&mut self, retention: &mut dyn Retention) -> Vec<(ProcessId, Message)> {
        self.entries
            .retain(|(destination, message), age| retention.retain(destination, message, *age));

        self.entries
            .iter_mut()
            .map(|(entry, age)| {
                *age = age.saturating_add(1);
                entry.clone()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Inner {
    fll: FairLossLink,
    config: StubbornConfig,
    pending: mpsc::UnboundedSender<(ProcessId, Message)>,
    pending_len: watch::Receiver<usize>,
    subscriber: Arc<Subscriber>,
}

/// Handle to a running Stubborn Link. Clones share the same link.
#[derive(Clone)]
pub struct StubbornLink {
    inner: Arc<Inner>,
}

impl StubbornLink {
    /// Stack a Stubborn Link on `fll`, retransmitting forever.
    ///
    /// Takes the Fair-Loss Link's delivery subscription.
    pub fn new(fll: FairLossLink, config: StubbornConfig, tasks: &TaskGroup) -> Result<Self> {
        Self::with_retention(fll, config, KeepAll, tasks)
    }

    /// Like [`StubbornLink::new`], but pending messages are forgotten once
    /// `retention` says so.
    pub fn with_retention(
        fll: FairLossLink,
        config: StubbornConfig,
        retention: impl Retention,
        tasks: &TaskGroup,
    ) -> Result<Self> {
        let events = fll.deliver_events()?;
        let pid = fll.pid().clone();
        let subscriber = Arc::new(Subscriber::default());

        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let (len_tx, len_rx) = watch::channel(0);

        tasks.spawn(
            info_span!("stubborn", %pid, worker = "retransmit"),
            retransmit_loop(
                fll.clone(),
                config.retransmit_interval(),
                Box::new(retention),
                pending_rx,
                len_tx,
                config.log_traffic,
                tasks.token(),
            ),
        );

        let upward = Arc::clone(&subscriber);
        let log_traffic = config.log_traffic;
        spawn_dispatch(
            tasks,
            info_span!("stubborn", %pid, worker = "dispatch"),
            events,
            move |sender, message| {
                if log_traffic {
                    info!("sl_deliver: delivered {} from {}", message, sender);
                }
                upward.publish((sender, message));
                Ok::<_, Infallible>(())
            },
        );

        Ok(Self {
            inner: Arc::new(Inner {
                fll,
                config,
                pending: pending_tx,
                pending_len: len_rx,
                subscriber,
            }),
        })
    }

    /// The Fair-Loss Link underneath.
    pub fn fair_loss(&self) -> &FairLossLink {
        &self.inner.fll
    }

    pub fn pid(&self) -> &ProcessId {
        self.inner.fll.pid()
    }

    /// Size of the pending set as of the timer worker's last update.
    pub fn pending_len(&self) -> usize {
        *self.inner.pending_len.borrow()
    }
}

impl Link for StubbornLink {
    fn send(&self, destination: &ProcessId, message: Message) {
        let inner = &self.inner;
        if !inner.fll.addresses().contains(destination) {
            debug!("Not retaining message for unknown destination {}", destination);
            inner.fll.send(destination, message);
            return;
        }

        if inner.config.log_traffic {
            info!("sl_send: sending {} to {}", message, destination);
        }

        inner.fll.send(destination, message.clone());
        if inner.pending.send((destination.clone(), message)).is_err() {
            debug!("Retransmit worker stopped, message to {} not retained", destination);
        }
    }

    fn deliver_events(&self) -> Result<DeliveryReceiver> {
        self.inner.subscriber.subscribe()
    }
}

async fn retransmit_loop(
    fll: FairLossLink,
    period: Duration,
    mut retention: Box<dyn Retention>,
    mut added: mpsc::UnboundedReceiver<(ProcessId, Message)>,
    len: watch::Sender<usize>,
    log_traffic: bool,
    cancel: CancellationToken,
) {
    let mut pending = PendingSet::new();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            entry = added.recv() => match entry {
                Some((destination, message)) => {
                    pending.insert(destination, message);
                    len.send_replace(pending.len());
                }
                None => break,
            },
            _ = ticker.tick() => {
                let resend = pending.tick(retention.as_mut());
                len.send_replace(pending.len());
                if log_traffic {
                    info!("sl_timeout: retransmitting {} message(s)", resend.len());
                } else {
                    debug!("Retransmitting {} message(s)", resend.len());
                }
                // Waits for the resend queue, so a pass larger than the
                // queue is paced rather than truncated
                for (destination, message) in resend {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = fll.resend(&destination, message) => {}
                    }
                }
            }
        }
    }
    debug!("Retransmit worker stopped");
}
