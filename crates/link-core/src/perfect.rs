//! Perfect Link: exactly-once delivery with per-tag demultiplexing.
//!
//! Deliveries from the Stubborn Link are checked against the set of
//! `(sender, message)` pairs already delivered. A pair seen before is
//! discarded; a new one is recorded and routed:
//!
//! - a tagged message whose tag has a subscriber goes to that tag's channel
//! - everything else goes to the default channel
//! - with no default subscriber the delivery is dropped (it stays recorded)
//!
//! The delivered set is owned by the delivery worker.

use crate::config::PerfectConfig;
use crate::dispatch::{Delivery, DeliveryReceiver, DeliverySender, Link, Subscriber};
use crate::error::{LinkError, Result};
use crate::retention::{KeepAll, Retention};
use crate::stubborn::StubbornLink;
use crate::tasks::TaskGroup;
use crate::{Message, ProcessId, Tag};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace};

/// The delivered set.
#[derive(Debug, Default)]
pub struct Deduplicator {
    delivered: HashMap<(ProcessId, Message), u32>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery. Returns true the first time a pair is seen.
    pub fn first_delivery(&mut self, sender: &ProcessId, message: &Message) -> bool {
        match self.delivered.entry((sender.clone(), message.clone())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(0);
                true
            }
        }
    }

    /// Forget the pairs `retention` rejects and age the rest. Returns how
    /// many were forgotten.
    pub fn prune(&mut self, retention: &mut dyn Retention) -> usize {
        let before = self.delivered.len();
        self.delivered.retain(|(sender, message), age| {
            let keep = retention.retain(sender, message, *age);
            *age = age.saturating_add(1);
            keep
        });
        before - self.delivered.len()
    }

    pub fn len(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty()
    }
}

/// Where a routed delivery ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Tagged(Tag),
    Default,
    Dropped,
}

/// Demultiplexes deliveries onto per-tag channels and the default channel.
///
/// The decoded tag of the message is both what makes it eligible for tagged
/// delivery and the key it is looked up under.
#[derive(Default)]
pub struct TagRouter {
    tagged: Mutex<HashMap<Tag, DeliverySender>>,
    default: Subscriber,
}

impl TagRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the untagged (and unclaimed) deliveries.
    pub fn subscribe_default(&self) -> Result<DeliveryReceiver> {
        self.default.subscribe()
    }

    /// Subscribe to the deliveries carrying `tag`. A tag takes one subscriber.
    pub fn subscribe(&self, tag: Tag) -> Result<DeliveryReceiver> {
        let mut tagged = self.tagged.lock().unwrap_or_else(|e| e.into_inner());
        match tagged.entry(tag) {
            Entry::Occupied(slot) => Err(LinkError::TagAlreadySubscribed(slot.key().clone())),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::unbounded_channel();
                slot.insert(tx);
                Ok(rx)
            }
        }
    }

    pub fn route(&self, delivery: Delivery) -> Route {
        let delivery = match delivery.1.tag() {
            Some(tag) => {
                let tagged = self.tagged.lock().unwrap_or_else(|e| e.into_inner());
                match tagged.get(tag) {
                    Some(tx) => {
                        let tag = tag.clone();
                        return match tx.send(delivery) {
                            Ok(()) => Route::Tagged(tag),
                            Err(_) => Route::Dropped,
                        };
                    }
                    None => delivery,
                }
            }
            None => delivery,
        };

        if self.default.publish(delivery) {
            Route::Default
        } else {
            Route::Dropped
        }
    }
}

struct Inner {
    sl: StubbornLink,
    config: PerfectConfig,
    router: Arc<TagRouter>,
}

/// Handle to a running Perfect Link. Clones share the same link.
#[derive(Clone)]
pub struct PerfectLink {
    inner: Arc<Inner>,
}

impl PerfectLink {
    /// Stack a Perfect Link on `sl`. Takes the Stubborn Link's delivery
    /// subscription.
    pub fn new(sl: StubbornLink, config: PerfectConfig, tasks: &TaskGroup) -> Result<Self> {
        Self::with_retention(sl, config, KeepAll, tasks)
    }

    /// Like [`PerfectLink::new`], with a retention hook applied to the
    /// delivered set every `prune_interval`. Without a prune interval the
    /// hook is never consulted.
    pub fn with_retention(
        sl: StubbornLink,
        config: PerfectConfig,
        retention: impl Retention,
        tasks: &TaskGroup,
    ) -> Result<Self> {
        let events = sl.deliver_events()?;
        let router = Arc::new(TagRouter::new());

        let pruning = config.prune_interval().map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            Pruning {
                ticker,
                retention: Box::new(retention),
            }
        });

        tasks.spawn(
            info_span!("perfect", pid = %sl.pid(), worker = "dispatch"),
            deliver_loop(
                events,
                Arc::clone(&router),
                pruning,
                config.log_traffic,
                tasks.token(),
            ),
        );

        Ok(Self {
            inner: Arc::new(Inner { sl, config, router }),
        })
    }

    /// Subscribe to deliveries tagged `tag`.
    pub fn tagged_deliver_events(&self, tag: Tag) -> Result<DeliveryReceiver> {
        self.inner.router.subscribe(tag)
    }

    /// The Stubborn Link underneath.
    pub fn stubborn(&self) -> &StubbornLink {
        &self.inner.sl
    }

    pub fn pid(&self) -> &ProcessId {
        self.inner.sl.pid()
    }
}

impl Link for PerfectLink {
    fn send(&self, destination: &ProcessId, message: Message) {
        if self.inner.config.log_traffic {
            info!("pl_send: sending {} to {}", message, destination);
        }
        self.inner.sl.send(destination, message);
    }

    fn deliver_events(&self) -> Result<DeliveryReceiver> {
        self.inner.router.subscribe_default()
    }
}

struct Pruning {
    ticker: Interval,
    retention: Box<dyn Retention>,
}

async fn deliver_loop(
    mut events: DeliveryReceiver,
    router: Arc<TagRouter>,
    mut pruning: Option<Pruning>,
    log_traffic: bool,
    cancel: CancellationToken,
) {
    let mut delivered = Deduplicator::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = next_prune(&mut pruning) => {
                if let Some(pruning) = pruning.as_mut() {
                    let forgotten = delivered.prune(pruning.retention.as_mut());
                    debug!("Pruned {} delivered message(s), {} remain", forgotten, delivered.len());
                }
            }
            event = events.recv() => {
                let Some((sender, message)) = event else {
                    debug!("Event channel closed");
                    break;
                };
                if !delivered.first_delivery(&sender, &message) {
                    trace!("Duplicate {} from {} discarded", message, sender);
                    continue;
                }
                if log_traffic {
                    info!("pl_deliver: delivered {} from {}", message, sender);
                }
                if router.route((sender, message)) == Route::Dropped {
                    trace!("No subscriber for delivery, dropped");
                }
            }
        }
    }
    debug!("Delivery worker stopped");
}

async fn next_prune(pruning: &mut Option<Pruning>) {
    match pruning {
        Some(pruning) => {
            pruning.ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retention::MaxAge;
    use serde_json::json;

    fn pid(s: &str) -> ProcessId {
        s.parse().unwrap()
    }

    fn tag(s: &str) -> Tag {
        Tag::new(s).unwrap()
    }

    // ==================== Deduplicator ====================

    #[test]
    fn test_identical_pair_delivered_once() {
        let mut dedup = Deduplicator::new();
        let message = Message::new(json!(["msg0"]));

        let firsts = (0..10)
            .filter(|_| dedup.first_delivery(&pid("1"), &message))
            .count();
        assert_eq!(firsts, 1);
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_same_message_from_two_senders() {
        let mut dedup = Deduplicator::new();
        let message = Message::new("hello");
        assert!(dedup.first_delivery(&pid("1"), &message));
        assert!(dedup.first_delivery(&pid("2"), &message));
    }

    #[test]
    fn test_distinct_sequence_numbers_are_distinct() {
        let mut dedup = Deduplicator::new();
        assert!(dedup.first_delivery(&pid("1"), &Message::new(json!(["op", "MID:1"]))));
        assert!(dedup.first_delivery(&pid("1"), &Message::new(json!(["op", "MID:2"]))));
    }

    #[test]
    fn test_prune_forgets_old_pairs() {
        let mut dedup = Deduplicator::new();
        dedup.first_delivery(&pid("1"), &Message::new("a"));

        assert_eq!(dedup.prune(&mut MaxAge(1)), 0);
        assert_eq!(dedup.prune(&mut MaxAge(1)), 1);
        assert!(dedup.is_empty());

        // Forgotten pairs are deliverable again
        assert!(dedup.first_delivery(&pid("1"), &Message::new("a")));
    }

    // ==================== TagRouter ====================

    #[test]
    fn test_tagged_message_goes_only_to_its_channel() {
        let router = TagRouter::new();
        let mut foo = router.subscribe(tag("Foo")).unwrap();
        let mut default = router.subscribe_default().unwrap();

        let message = Message::tagged(tag("Foo"), json!(["MT:Foo", 1]));
        assert_eq!(router.route((pid("1"), message.clone())), Route::Tagged(tag("Foo")));

        assert_eq!(foo.try_recv().unwrap(), (pid("1"), message));
        assert!(default.try_recv().is_err());
    }

    #[test]
    fn test_untagged_message_goes_only_to_default() {
        let router = TagRouter::new();
        let mut foo = router.subscribe(tag("Foo")).unwrap();
        let mut default = router.subscribe_default().unwrap();

        assert_eq!(router.route((pid("1"), Message::new("plain"))), Route::Default);

        assert!(foo.try_recv().is_err());
        assert_eq!(default.try_recv().unwrap().1, Message::new("plain"));
    }

    #[test]
    fn test_unclaimed_tag_falls_back_to_default() {
        let router = TagRouter::new();
        let mut default = router.subscribe_default().unwrap();

        let message = Message::tagged(tag("Bar"), json!(1));
        assert_eq!(router.route((pid("1"), message.clone())), Route::Default);
        assert_eq!(default.try_recv().unwrap().1, message);
    }

    #[test]
    fn test_nobody_listening_drops() {
        let router = TagRouter::new();
        assert_eq!(router.route((pid("1"), Message::new("x"))), Route::Dropped);
    }

    #[test]
    fn test_routing_key_is_the_decoded_tag() {
        // The explicit tag decides the channel even when the body carries a
        // different legacy marker.
        let router = TagRouter::new();
        let mut foo = router.subscribe(tag("Foo")).unwrap();
        let mut bar = router.subscribe(tag("Bar")).unwrap();

        let message = Message::tagged(tag("Foo"), json!(["MT:Bar"]));
        assert_eq!(router.route((pid("1"), message)), Route::Tagged(tag("Foo")));
        assert!(foo.try_recv().is_ok());
        assert!(bar.try_recv().is_err());
    }

    #[test]
    fn test_subscribe_tag_twice_errors() {
        let router = TagRouter::new();
        let _first = router.subscribe(tag("Foo")).unwrap();

        match router.subscribe(tag("Foo")) {
            Err(LinkError::TagAlreadySubscribed(t)) => assert_eq!(t, tag("Foo")),
            other => panic!("expected TagAlreadySubscribed, got {:?}", other.map(|_| ())),
        }
        // Other tags are unaffected
        assert!(router.subscribe(tag("Bar")).is_ok());
    }

    #[test]
    fn test_subscribe_default_twice_errors() {
        let router = TagRouter::new();
        let _first = router.subscribe_default().unwrap();
        assert!(matches!(
            router.subscribe_default(),
            Err(LinkError::AlreadySubscribed)
        ));
    }

    // ==================== Delivery worker ====================

    #[tokio::test]
    async fn test_deliver_loop_dedups_and_routes() {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Arc::new(TagRouter::new());
        let mut default = router.subscribe_default().unwrap();
        let mut heartbeats = router.subscribe(Tag::heartbeat_request()).unwrap();

        let heartbeat = Message::tagged(Tag::heartbeat_request(), json!({"mid": 0}));
        for _ in 0..5 {
            tx.send((pid("1"), Message::new("msg0"))).unwrap();
            tx.send((pid("1"), heartbeat.clone())).unwrap();
        }
        drop(tx);

        deliver_loop(rx, Arc::clone(&router), None, false, CancellationToken::new()).await;

        assert_eq!(default.try_recv().unwrap().1, Message::new("msg0"));
        assert!(default.try_recv().is_err());
        assert_eq!(heartbeats.try_recv().unwrap().1, heartbeat);
        assert!(heartbeats.try_recv().is_err());
    }
}
