//! Perfect Failure Detector.
//!
//! Heartbeat exchange over a Perfect Link:
//! 1. Every period, each peer that has not replied since the previous sweep
//!    and is not yet crashed is declared crashed, once and for good
//! 2. Every peer still considered correct gets a `HeartbeatRequest`
//! 3. A `HeartbeatRequest` from q is answered right away with a
//!    `HeartbeatReply` to q
//! 4. A `HeartbeatReply` from p marks p alive for the current round
//!
//! The crashed set only grows. The period must exceed the worst-case round
//! trip through the Perfect Link, otherwise correct peers are suspected.

use crate::config::DetectorConfig;
use crate::dispatch::{Link, spawn_dispatch};
use crate::error::{LinkError, Result};
use crate::perfect::PerfectLink;
use crate::tasks::TaskGroup;
use crate::{Message, ProcessId, Tag};
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span};

/// Event emitted by a detector sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorEvent {
    /// Send a heartbeat request carrying `mid` to this peer
    SendHeartbeat { target: ProcessId, mid: u64 },
    /// Peer missed a whole round and is now crashed
    PeerCrashed { peer_id: ProcessId },
}

/// Detector bookkeeping, free of any I/O.
///
/// The caller is responsible for:
/// - Calling `sweep()` once per period
/// - Forwarding heartbeat replies to `on_reply()`
/// - Acting on emitted events
#[derive(Debug)]
pub struct DetectorState {
    peers: BTreeSet<ProcessId>,
    alive: HashSet<ProcessId>,
    crashed: BTreeSet<ProcessId>,
    next_mid: u64,
}

impl DetectorState {
    /// Watch `peers`, leaving out `self_id`. Every peer starts out alive so
    /// the first sweep only sends heartbeats.
    pub fn new(self_id: &ProcessId, peers: impl IntoIterator<Item = ProcessId>) -> Self {
        let peers: BTreeSet<_> = peers.into_iter().filter(|p| p != self_id).collect();
        Self {
            alive: peers.iter().cloned().collect(),
            peers,
            crashed: BTreeSet::new(),
            next_mid: 0,
        }
    }

    /// Record a heartbeat reply. Returns false for peers that are unknown or
    /// already crashed; those replies change nothing.
    pub fn on_reply(&mut self, from: &ProcessId) -> bool {
        if !self.peers.contains(from) || self.crashed.contains(from) {
            return false;
        }
        self.alive.insert(from.clone());
        true
    }

    /// Close the current round and open the next one.
    pub fn sweep(&mut self) -> Vec<DetectorEvent> {
        let mut events = Vec::new();

        for peer in &self.peers {
            if self.crashed.contains(peer) {
                continue;
            }
            if self.alive.contains(peer) {
                events.push(DetectorEvent::SendHeartbeat {
                    target: peer.clone(),
                    mid: self.next_mid,
                });
                self.next_mid += 1;
            } else {
                self.crashed.insert(peer.clone());
                events.push(DetectorEvent::PeerCrashed {
                    peer_id: peer.clone(),
                });
            }
        }

        self.alive.clear();
        events
    }

    pub fn crashed(&self) -> &BTreeSet<ProcessId> {
        &self.crashed
    }

    pub fn is_crashed(&self, peer: &ProcessId) -> bool {
        self.crashed.contains(peer)
    }

    /// Peers being watched, crashed ones included.
    pub fn peers(&self) -> &BTreeSet<ProcessId> {
        &self.peers
    }
}

/// Handle to a running detector.
#[derive(Clone)]
pub struct PerfectFailureDetector {
    crash_events: Arc<Mutex<Option<mpsc::UnboundedReceiver<ProcessId>>>>,
    crashed: watch::Receiver<BTreeSet<ProcessId>>,
}

impl PerfectFailureDetector {
    /// Start detecting crashes among `peers` over `pl`.
    ///
    /// Takes the `HeartbeatRequest` and `HeartbeatReply` subscriptions of
    /// the Perfect Link.
    pub fn start(
        pl: &PerfectLink,
        peers: impl IntoIterator<Item = ProcessId>,
        config: DetectorConfig,
        tasks: &TaskGroup,
    ) -> Result<Self> {
        let requests = pl.tagged_deliver_events(Tag::heartbeat_request())?;
        let replies = pl.tagged_deliver_events(Tag::heartbeat_reply())?;
        let pid = pl.pid().clone();
        let state = DetectorState::new(&pid, peers);
        let log_traffic = config.log_traffic;

        let (crash_tx, crash_rx) = mpsc::unbounded_channel();
        let (crashed_tx, crashed_rx) = watch::channel(BTreeSet::new());
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        // Answer requests right away
        let responder = pl.clone();
        let mut reply_mid: u64 = 0;
        spawn_dispatch(
            tasks,
            info_span!("detector", %pid, worker = "requests"),
            requests,
            move |sender, _message| {
                if log_traffic {
                    info!("P: delivered HeartbeatRequest from {}", sender);
                }
                let reply = Message::tagged(Tag::heartbeat_reply(), json!({ "mid": reply_mid }));
                reply_mid += 1;
                responder.send(&sender, reply);
                Ok::<_, Infallible>(())
            },
        );

        // Replies go to the sweep worker, which owns the state
        spawn_dispatch(
            tasks,
            info_span!("detector", %pid, worker = "replies"),
            replies,
            move |sender, _message| {
                if log_traffic {
                    info!("P: delivered HeartbeatReply from {}", sender);
                }
                reply_tx
                    .send(sender)
                    .map_err(|_| "sweep worker stopped")
            },
        );

        tasks.spawn(
            info_span!("detector", %pid, worker = "sweep"),
            sweep_loop(
                pl.clone(),
                state,
                config.period(),
                reply_rx,
                crash_tx,
                crashed_tx,
                log_traffic,
                tasks.token(),
            ),
        );

        Ok(Self {
            crash_events: Arc::new(Mutex::new(Some(crash_rx))),
            crashed: crashed_rx,
        })
    }

    /// Channel of crash notifications, each peer reported at most once.
    ///
    /// Notifications are buffered from the moment the detector starts, so
    /// none are missed by subscribing late. There is one such channel.
    pub fn crash_events(&self) -> Result<mpsc::UnboundedReceiver<ProcessId>> {
        self.crash_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(LinkError::AlreadySubscribed)
    }

    /// Snapshot of the crashed set.
    pub fn crashed(&self) -> BTreeSet<ProcessId> {
        self.crashed.borrow().clone()
    }

    pub fn is_crashed(&self, peer: &ProcessId) -> bool {
        self.crashed.borrow().contains(peer)
    }

    /// Receiver that changes whenever a peer is added to the crashed set.
    pub fn watch_crashed(&self) -> watch::Receiver<BTreeSet<ProcessId>> {
        self.crashed.clone()
    }
}

#[allow(clippy::too_many_arguments)]
async fn sweep_loop(
    pl: PerfectLink,
    mut state: DetectorState,
    period: Duration,
    mut replies: mpsc::UnboundedReceiver<ProcessId>,
    crash_events: mpsc::UnboundedSender<ProcessId>,
    crashed: watch::Sender<BTreeSet<ProcessId>>,
    log_traffic: bool,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(from) = replies.recv() => {
                if !state.on_reply(&from) {
                    debug!("Ignoring heartbeat reply from {}", from);
                }
            }
            _ = ticker.tick() => {
                if log_traffic {
                    info!("P: expired timeout");
                }
                for event in state.sweep() {
                    match event {
                        DetectorEvent::SendHeartbeat { target, mid } => {
                            let request = Message::tagged(Tag::heartbeat_request(), json!({ "mid": mid }));
                            pl.send(&target, request);
                        }
                        DetectorEvent::PeerCrashed { peer_id } => {
                            info!("Detected crash of {}", peer_id);
                            crashed.send_modify(|set| {
                                set.insert(peer_id.clone());
                            });
                            // Receiver may be gone; the snapshot still records it
                            let _ = crash_events.send(peer_id);
                        }
                    }
                }
            }
        }
    }
    debug!("Sweep worker stopped");
}
