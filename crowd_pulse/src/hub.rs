// THEORY:
// The hub is the publish/subscribe fan-out between the analysis side and every
// connected client. Each logical channel (global alerts, per-camera frames,
// emergency instructions, live map) has its own registry of subscriber queues.
//
// Key architectural principles:
// 1.  **Snapshot, then send**: a registry lock is held only long enough to copy
//     the current subscriber handles. Sends happen outside the lock, so a slow
//     client never blocks a subscribe or another channel's publish.
// 2.  **Concurrent, bounded delivery**: every subscriber is sent to concurrently
//     with its own timeout. A subscriber whose queue is closed or stays full past
//     the timeout is pruned after the round.
// 3.  **Lazy encoding**: `publish_with` takes a closure that builds the message.
//     With no subscribers the closure never runs, so nothing is encoded or
//     serialized for an empty audience.
// 4.  **One registry per connection**: subscribing moves a connection out of
//     whatever registry it was in before.

use crate::config::HubConfig;
use crate::error::DispatchError;
use crate::messages::OutboundMessage;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Serialized message as queued to a subscriber.
pub type Payload = Arc<str>;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Alerts,
    Frames(String),
    Instructions,
    LiveMap,
}

impl Channel {
    pub fn name(&self) -> String {
        match self {
            Channel::Alerts => "alerts".to_string(),
            Channel::Frames(camera_id) => format!("frames/{camera_id}"),
            Channel::Instructions => "instructions".to_string(),
            Channel::LiveMap => "live-map".to_string(),
        }
    }

    fn camera_id(&self) -> Option<String> {
        match self {
            Channel::Frames(camera_id) => Some(camera_id.clone()),
            _ => None,
        }
    }

    fn greeting(&self) -> String {
        match self {
            Channel::Alerts => "Connected to alerts stream".to_string(),
            Channel::Frames(camera_id) => format!("Connected to live frames for camera {camera_id}"),
            Channel::Instructions => "Connected to emergency instructions stream".to_string(),
            Channel::LiveMap => "Connected to live map stream".to_string(),
        }
    }
}

/// Sending half of one client connection.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Payload>,
}

impl Subscriber {
    /// A new connection with a queue of `buffer` messages.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Default)]
struct Registry {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Payload>>>,
}

impl Registry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<Payload>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<(u64, mpsc::Sender<Payload>)> {
        self.lock().iter().map(|(id, tx)| (*id, tx.clone())).collect()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Outcome of one publish round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub pruned: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub published: u64,
    pub delivered: u64,
    pub pruned: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionCounts {
    pub alerts: usize,
    pub instructions: usize,
    pub live_map: usize,
    pub frames: BTreeMap<String, usize>,
}

impl ConnectionCounts {
    pub fn total(&self) -> usize {
        self.alerts + self.instructions + self.live_map + self.frames.values().sum::<usize>()
    }
}

pub struct BroadcastHub {
    alerts: Arc<Registry>,
    instructions: Arc<Registry>,
    live_map: Arc<Registry>,
    frames: RwLock<HashMap<String, Arc<Registry>>>,
    membership: Mutex<HashMap<u64, Channel>>,
    send_timeout: Duration,
    buffer: usize,
    published: AtomicU64,
    delivered: AtomicU64,
    pruned: AtomicU64,
}

impl BroadcastHub {
    pub fn new(config: &HubConfig) -> Self {
        Self {
            alerts: Arc::default(),
            instructions: Arc::default(),
            live_map: Arc::default(),
            frames: RwLock::new(HashMap::new()),
            membership: Mutex::new(HashMap::new()),
            send_timeout: config.send_timeout(),
            buffer: config.subscriber_buffer,
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
        }
    }

    /// Queue capacity new connections should be created with.
    pub fn subscriber_buffer(&self) -> usize {
        self.buffer
    }

    fn registry(&self, channel: &Channel) -> Option<Arc<Registry>> {
        match channel {
            Channel::Alerts => Some(Arc::clone(&self.alerts)),
            Channel::Instructions => Some(Arc::clone(&self.instructions)),
            Channel::LiveMap => Some(Arc::clone(&self.live_map)),
            Channel::Frames(camera_id) => self
                .frames
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(camera_id)
                .cloned(),
        }
    }

    fn registry_or_create(&self, channel: &Channel) -> Arc<Registry> {
        if let Some(registry) = self.registry(channel) {
            return registry;
        }
        let Channel::Frames(camera_id) = channel else {
            return Arc::clone(&self.alerts);
        };
        let mut frames = self.frames.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(frames.entry(camera_id.clone()).or_default())
    }

    /// Registers a connection and greets it with CONNECTION_ESTABLISHED.
    ///
    /// The membership lock is held across the move so a connection is never in
    /// two registries at once.
    pub fn subscribe(&self, channel: Channel, subscriber: Subscriber) {
        let mut membership = self.membership.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = membership.insert(subscriber.id, channel.clone());
        if let Some(previous) = previous.filter(|p| *p != channel) {
            if let Some(registry) = self.registry(&previous) {
                registry.lock().remove(&subscriber.id);
            }
        }

        let greeting = OutboundMessage::connected(channel.greeting(), channel.camera_id(), Utc::now());
        if let Ok(json) = greeting.to_json() {
            let _ = subscriber.tx.try_send(Payload::from(json));
        }

        self.registry_or_create(&channel)
            .lock()
            .insert(subscriber.id, subscriber.tx);
        drop(membership);
        tracing::debug!(channel = %channel.name(), subscriber = subscriber.id, "subscribed");
    }

    pub fn unsubscribe(&self, channel: &Channel, subscriber_id: u64) -> bool {
        let mut membership = self.membership.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = self
            .registry(channel)
            .map(|r| r.lock().remove(&subscriber_id).is_some())
            .unwrap_or(false);
        if membership.get(&subscriber_id) == Some(channel) {
            membership.remove(&subscriber_id);
        }
        drop(membership);
        if removed {
            tracing::debug!(channel = %channel.name(), subscriber = subscriber_id, "unsubscribed");
        }
        removed
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.registry(channel).map(|r| r.len()).unwrap_or(0)
    }

    pub fn has_subscribers(&self, channel: &Channel) -> bool {
        self.subscriber_count(channel) > 0
    }

    pub async fn publish(&self, channel: &Channel, message: &OutboundMessage) -> Result<DeliveryReport, DispatchError> {
        self.publish_with(channel, || Ok(Some(message.clone()))).await
    }

    /// Publishes a lazily built message. `build` only runs when the channel has
    /// at least one subscriber; returning `None` skips the round.
    pub async fn publish_with<F>(&self, channel: &Channel, build: F) -> Result<DeliveryReport, DispatchError>
    where
        F: FnOnce() -> Result<Option<OutboundMessage>, DispatchError>,
    {
        let Some(registry) = self.registry(channel) else {
            return Ok(DeliveryReport::default());
        };
        let targets = registry.snapshot();
        if targets.is_empty() {
            return Ok(DeliveryReport::default());
        }
        let Some(message) = build()? else {
            return Ok(DeliveryReport::default());
        };
        let payload: Payload = Payload::from(message.to_json()?);
        self.published.fetch_add(1, Ordering::Relaxed);

        let timeout = self.send_timeout;
        let sends = targets.into_iter().map(|(id, tx)| {
            let payload = Arc::clone(&payload);
            async move { (id, tx.send_timeout(payload, timeout).await.is_ok()) }
        });
        let results = join_all(sends).await;

        let failed: Vec<u64> = results.iter().filter(|(_, ok)| !ok).map(|(id, _)| *id).collect();
        let report = DeliveryReport {
            delivered: results.len() - failed.len(),
            pruned: failed.len(),
        };
        if !failed.is_empty() {
            let mut subscribers = registry.lock();
            for id in &failed {
                subscribers.remove(id);
            }
            drop(subscribers);
            let mut membership = self.membership.lock().unwrap_or_else(PoisonError::into_inner);
            for id in &failed {
                membership.remove(id);
            }
            tracing::warn!(
                channel = %channel.name(),
                kind = message.type_name(),
                pruned = failed.len(),
                "pruned unresponsive subscribers"
            );
        }
        self.delivered.fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.pruned.fetch_add(report.pruned as u64, Ordering::Relaxed);
        Ok(report)
    }

    /// Every channel that currently exists, per-camera frames included.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels = vec![Channel::Alerts, Channel::Instructions, Channel::LiveMap];
        let frames = self.frames.read().unwrap_or_else(PoisonError::into_inner);
        let mut cameras: Vec<&String> = frames.keys().collect();
        cameras.sort();
        channels.extend(cameras.into_iter().map(|id| Channel::Frames(id.clone())));
        channels
    }

    /// Sends PING to every registry. Per-camera pings carry their camera id.
    pub async fn ping_all(&self) -> DeliveryReport {
        let mut total = DeliveryReport::default();
        for channel in self.channels() {
            let result = self
                .publish_with(&channel, || Ok(Some(OutboundMessage::ping(channel.camera_id(), Utc::now()))))
                .await;
            match result {
                Ok(report) => {
                    total.delivered += report.delivered;
                    total.pruned += report.pruned;
                }
                Err(err) => tracing::warn!(channel = %channel.name(), error = %err, "ping failed"),
            }
        }
        total
    }

    /// Runs `ping_all` every `interval` until the hub is dropped.
    pub fn spawn_keepalive(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else { break };
                let report = hub.ping_all().await;
                tracing::trace!(delivered = report.delivered, pruned = report.pruned, "keep-alive");
            }
        })
    }

    pub fn connection_counts(&self) -> ConnectionCounts {
        let frames = self
            .frames
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, r)| (id.clone(), r.len()))
            .filter(|(_, n)| *n > 0)
            .collect();
        ConnectionCounts {
            alerts: self.alerts.len(),
            instructions: self.instructions.len(),
            live_map: self.live_map.len(),
            frames,
        }
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    fn hub_with_timeout(ms: u64) -> BroadcastHub {
        BroadcastHub::new(&HubConfig {
            send_timeout_ms: ms,
            ..HubConfig::default()
        })
    }

    fn parse(payload: &Payload) -> Value {
        serde_json::from_str(payload).unwrap()
    }

    #[tokio::test]
    async fn zero_subscribers_never_encode() {
        let hub = hub_with_timeout(50);
        let calls = AtomicUsize::new(0);
        let report = hub
            .publish_with(&Channel::Frames("cam-1".into()), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(OutboundMessage::ping(None, Utc::now())))
            })
            .await
            .unwrap();
        assert_eq!(report, DeliveryReport::default());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(hub.stats().published, 0);
    }

    #[tokio::test]
    async fn subscriber_is_greeted_and_receives_publishes() {
        let hub = hub_with_timeout(50);
        let (sub, mut rx) = Subscriber::new(8);
        hub.subscribe(Channel::Frames("cam-9".into()), sub);

        let hello = parse(&rx.recv().await.unwrap());
        assert_eq!(hello["type"], "CONNECTION_ESTABLISHED");
        assert_eq!(hello["camera_id"], "cam-9");

        let report = hub
            .publish(&Channel::Frames("cam-9".into()), &OutboundMessage::ping(Some("cam-9".into()), Utc::now()))
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(parse(&rx.recv().await.unwrap())["type"], "PING");
    }

    #[tokio::test]
    async fn closed_and_stalled_subscribers_are_pruned() {
        let hub = hub_with_timeout(20);
        let (closed, closed_rx) = Subscriber::new(4);
        let (stalled, _stalled_rx) = Subscriber::new(1);
        let (healthy, mut healthy_rx) = Subscriber::new(8);
        hub.subscribe(Channel::Alerts, closed);
        hub.subscribe(Channel::Alerts, stalled);
        hub.subscribe(Channel::Alerts, healthy);
        drop(closed_rx);

        // stalled queue is already full with its greeting
        let report = hub
            .publish(&Channel::Alerts, &OutboundMessage::ping(None, Utc::now()))
            .await
            .unwrap();
        assert_eq!(report, DeliveryReport { delivered: 1, pruned: 2 });
        assert_eq!(hub.subscriber_count(&Channel::Alerts), 1);
        assert_eq!(hub.stats().pruned, 2);

        let _greeting = healthy_rx.recv().await.unwrap();
        assert_eq!(parse(&healthy_rx.recv().await.unwrap())["type"], "PING");
    }

    #[tokio::test]
    async fn resubscribing_moves_the_connection() {
        let hub = hub_with_timeout(50);
        let (sub, _rx) = Subscriber::new(8);
        let id = sub.id();
        hub.subscribe(Channel::Alerts, sub.clone());
        hub.subscribe(Channel::LiveMap, sub);
        assert_eq!(hub.subscriber_count(&Channel::Alerts), 0);
        assert_eq!(hub.subscriber_count(&Channel::LiveMap), 1);
        assert!(hub.unsubscribe(&Channel::LiveMap, id));
        assert_eq!(hub.connection_counts().total(), 0);
    }

    #[tokio::test]
    async fn ping_reaches_every_registry() {
        let hub = hub_with_timeout(50);
        let (a, mut a_rx) = Subscriber::new(8);
        let (f, mut f_rx) = Subscriber::new(8);
        hub.subscribe(Channel::Instructions, a);
        hub.subscribe(Channel::Frames("cam-2".into()), f);
        let report = hub.ping_all().await;
        assert_eq!(report.delivered, 2);

        let _ = a_rx.recv().await;
        let ping = parse(&a_rx.recv().await.unwrap());
        assert_eq!(ping["type"], "PING");
        assert!(ping.get("camera_id").is_none());

        let _ = f_rx.recv().await;
        assert_eq!(parse(&f_rx.recv().await.unwrap())["camera_id"], "cam-2");
    }

    #[test]
    fn concurrent_resubscribes_leave_one_registration() {
        let hub = hub_with_timeout(50);
        let (sub, _rx) = Subscriber::new(4);
        let id = sub.id();
        std::thread::scope(|scope| {
            for channel in [Channel::Alerts, Channel::LiveMap, Channel::Instructions, Channel::Frames("cam-3".into())] {
                let hub = &hub;
                let sub = sub.clone();
                scope.spawn(move || {
                    for _ in 0..200 {
                        hub.subscribe(channel.clone(), sub.clone());
                    }
                });
            }
        });
        assert_eq!(hub.connection_counts().total(), 1);
        let home = hub
            .channels()
            .into_iter()
            .find(|c| hub.subscriber_count(c) == 1)
            .unwrap();
        assert!(hub.unsubscribe(&home, id));
        assert_eq!(hub.connection_counts().total(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishers_deliver_every_message_once() {
        let hub = Arc::new(hub_with_timeout(500));
        let (sub, mut rx) = Subscriber::new(512);
        hub.subscribe(Channel::Alerts, sub);
        let _greeting = rx.recv().await.unwrap();

        let publisher = |prefix: &'static str| {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                for i in 0..100 {
                    let message = OutboundMessage::ping(Some(format!("{prefix}-{i}")), Utc::now());
                    let report = hub.publish(&Channel::Alerts, &message).await.unwrap();
                    assert_eq!(report, DeliveryReport { delivered: 1, pruned: 0 });
                }
            })
        };
        let (a, b) = tokio::join!(publisher("north"), publisher("south"));
        a.unwrap();
        b.unwrap();

        let mut seen = std::collections::HashSet::new();
        while let Ok(payload) = rx.try_recv() {
            let message = parse(&payload);
            assert_eq!(message["type"], "PING");
            assert!(seen.insert(message["camera_id"].as_str().unwrap().to_string()));
        }
        assert_eq!(seen.len(), 200);
        assert_eq!(hub.subscriber_count(&Channel::Alerts), 1);
        assert_eq!(hub.stats().pruned, 0);
        assert_eq!(hub.stats().delivered, 200);
    }
}
