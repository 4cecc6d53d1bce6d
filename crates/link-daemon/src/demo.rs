//! Demo application: periodically send `"msg<t>"` to a random peer.

use link_core::{Link, Message, PerfectLink, ProcessId};
use rand::Rng;
use rand::seq::IndexedRandom;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Pick the destination of the next demo message.
pub fn pick_destination<'a, R: Rng + ?Sized>(
    peers: &'a [ProcessId],
    rng: &mut R,
) -> Option<&'a ProcessId> {
    peers.choose(rng)
}

pub fn demo_message(t: u32) -> Message {
    Message::new(format!("msg{}", t))
}

/// Send `count` messages, one every `interval`, each to a uniformly random
/// peer. Stops early on cancellation.
pub async fn run(
    pl: PerfectLink,
    peers: Vec<ProcessId>,
    count: u32,
    interval: Duration,
    cancel: CancellationToken,
) {
    if peers.is_empty() {
        warn!("No peers configured, demo disabled");
        return;
    }

    for t in 0..count {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(destination) = pick_destination(&peers, &mut rand::rng()).cloned() else {
            return;
        };
        info!("Sending msg{} to {}", t, destination);
        pl.send(&destination, demo_message(t));
    }
    info!("Demo finished after {} message(s)", count);
}
