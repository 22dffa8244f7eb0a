//! ==============================================================================
//! sensor_feed.rs - mqtt subscription holding the latest room temperatures
//! ==============================================================================
//!
//! purpose:
//!     keeps a persistent subscription to the home assistant mqtt broker,
//!     stores the last value per sensor key and notifies a listener whenever a
//!     value moves by at least the debounce threshold.
//!
//! relationships:
//!     - used by: orchestrator.rs (through the SensorSource trait)
//!     - uses: rumqttc (transport + automatic reconnect on the next poll)
//!     - reads: config.rs (MqttConfig: broker, credentials, topic -> key map)
//!
//! concurrency:
//!     the event loop runs on its own task. readings live behind a std mutex
//!     that is only held while a value is swapped; the listener is always
//!     invoked after the guard is dropped so it may call `readings()` itself.
//!
//! ==============================================================================

use crate::config::MqttConfig;
use crate::domain::{Readings, SensorReading};

use async_trait::async_trait;
use chrono::Local;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// minimum delta (degrees) that counts as a change worth re-rendering
pub const CHANGE_THRESHOLD: f64 = 0.1;

/// pause before polling again after a transport error (rumqttc reconnects on poll)
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// called with the full set of readings after a meaningful change
pub type ReadingsListener = Arc<dyn Fn(&Readings) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("payload on {topic} is not utf-8")]
    NotUtf8 { topic: String },
    #[error("payload {raw:?} for {key} is not a number")]
    NotANumber { key: String, raw: String },
    #[error("no sensor key is tracked under {0}")]
    UnknownKey(String),
}

/// what the orchestrator needs from a push-based temperature source
#[async_trait]
pub trait SensorSource: Send + Sync {
    /// register the change listener (replaces any previous one)
    fn set_listener(&self, listener: ReadingsListener);
    /// establish the subscription; false when the transport could not connect
    async fn connect(&self) -> bool;
    /// snapshot copy of every tracked key
    fn readings(&self) -> Readings;
    /// stop the event loop and close the transport; safe to call twice
    async fn disconnect(&self);
}

// ==============================================================================
// shared message-handling state
// ==============================================================================

struct FeedShared {
    /// topic -> sensor key
    topics: HashMap<String, String>,
    readings: Mutex<BTreeMap<String, SensorReading>>,
    listener: Mutex<Option<ReadingsListener>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking listener never runs under these guards, but stay usable anyway
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FeedShared {
    fn snapshot(&self) -> Readings {
        lock(&self.readings)
            .iter()
            .map(|(key, reading)| (key.clone(), reading.value))
            .collect()
    }

    fn handle_publish(&self, topic: &str, payload: &[u8]) {
        let Some(key) = self.topics.get(topic) else {
            tracing::debug!(topic, "ignoring message on untracked topic");
            return;
        };
        let Ok(raw) = std::str::from_utf8(payload) else {
            let err = FeedError::NotUtf8 { topic: topic.to_string() };
            tracing::warn!(error = %err, "discarding sensor message");
            return;
        };
        if let Err(err) = self.on_message(key, raw) {
            tracing::warn!(error = %err, "discarding sensor message");
        }
    }

    /// store a raw value for `key`; returns whether the listener fired
    fn on_message(&self, key: &str, raw: &str) -> Result<bool, FeedError> {
        let value = raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| FeedError::NotANumber { key: key.to_string(), raw: raw.to_string() })?;

        let changed = {
            let mut readings = lock(&self.readings);
            let reading = readings
                .get_mut(key)
                .ok_or_else(|| FeedError::UnknownKey(key.to_string()))?;
            let changed = match reading.value {
                None => true,
                Some(previous) => (value - previous).abs() >= CHANGE_THRESHOLD,
            };
            reading.value = Some(value);
            if changed {
                reading.changed_at = Some(Local::now());
            }
            changed
        };
        tracing::info!(key, value, changed, "sensor reading");

        if changed {
            self.notify();
        }
        Ok(changed)
    }

    fn notify(&self) {
        let Some(listener) = lock(&self.listener).clone() else {
            return;
        };
        let readings = self.snapshot();
        match catch_unwind(AssertUnwindSafe(|| listener(&readings))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %format!("{:#}", e), "readings listener failed"),
            Err(_) => tracing::error!("readings listener panicked"),
        }
    }
}

// ==============================================================================
// mqtt-backed sensor feed
// ==============================================================================

struct Link {
    client: AsyncClient,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct SensorFeed {
    config: MqttConfig,
    shared: Arc<FeedShared>,
    link: Mutex<Option<Link>>,
}

impl SensorFeed {
    pub fn new(config: &MqttConfig) -> Self {
        let topics: HashMap<String, String> = config
            .topics
            .iter()
            .map(|(topic, key)| (topic.clone(), key.clone()))
            .collect();
        let readings = topics
            .values()
            .map(|key| (key.clone(), SensorReading::new(key.clone())))
            .collect();

        Self {
            config: config.clone(),
            shared: Arc::new(FeedShared {
                topics,
                readings: Mutex::new(readings),
                listener: Mutex::new(None),
            }),
            link: Mutex::new(None),
        }
    }

    /// feed one raw payload for a sensor key, exactly as the transport would
    pub fn on_message(&self, key: &str, raw: &str) -> Result<bool, FeedError> {
        self.shared.on_message(key, raw)
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        if !self.config.username.is_empty() {
            options.set_credentials(&self.config.username, &self.config.password);
        }
        options
    }

    fn subscribe_all(client: &AsyncClient, shared: &FeedShared) {
        for topic in shared.topics.keys() {
            match client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                Ok(()) => tracing::info!(topic = %topic, "subscribed"),
                Err(e) => tracing::warn!(topic = %topic, error = %e, "subscribe failed"),
            }
        }
    }

    /// drive the event loop until told to stop
    async fn run_event_loop(
        client: AsyncClient,
        mut eventloop: EventLoop,
        shared: Arc<FeedShared>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        shared.handle_publish(&publish.topic, &publish.payload);
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("mqtt reconnected");
                        Self::subscribe_all(&client, &shared);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "mqtt connection lost, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                            changed = stop.changed() => if changed.is_err() { break },
                        }
                    }
                },
                changed = stop.changed() => if changed.is_err() { break },
            }
        }
        tracing::debug!("mqtt event loop stopped");
    }
}

#[async_trait]
impl SensorSource for SensorFeed {
    fn set_listener(&self, listener: ReadingsListener) {
        *lock(&self.shared.listener) = Some(listener);
    }

    async fn connect(&self) -> bool {
        if lock(&self.link).is_some() {
            return true;
        }

        tracing::info!(host = %self.config.host, port = self.config.port, "connecting to mqtt broker");
        let (client, mut eventloop) = AsyncClient::new(self.options(), 32);

        let timeout = Duration::from_secs(self.config.connect_timeout_secs.max(1));
        let handshake = tokio::time::timeout(timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(e),
                }
            }
        })
        .await;

        match handshake {
            Ok(Ok(())) => tracing::info!("mqtt connected"),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "mqtt connection failed");
                return false;
            }
            Err(_) => {
                tracing::error!(timeout_secs = timeout.as_secs(), "mqtt connection timed out");
                return false;
            }
        }

        Self::subscribe_all(&client, &self.shared);

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(Self::run_event_loop(
            client.clone(),
            eventloop,
            self.shared.clone(),
            stop_rx,
        ));
        *lock(&self.link) = Some(Link { client, stop, task });
        true
    }

    fn readings(&self) -> Readings {
        self.shared.snapshot()
    }

    async fn disconnect(&self) {
        let Some(link) = lock(&self.link).take() else {
            return;
        };
        tracing::info!("disconnecting from mqtt broker");
        let _ = link.stop.send(true);
        if let Err(e) = link.client.try_disconnect() {
            tracing::debug!(error = %e, "mqtt disconnect request not queued");
        }
        if tokio::time::timeout(Duration::from_secs(2), link.task).await.is_err() {
            tracing::warn!("mqtt event loop did not stop in time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn feed_with(pairs: &[(&str, &str)]) -> SensorFeed {
        let mut config = MqttConfig::default();
        config.topics = pairs.iter().map(|(t, k)| (t.to_string(), k.to_string())).collect();
        SensorFeed::new(&config)
    }

    fn counting_listener(feed: &SensorFeed) -> (Arc<AtomicUsize>, Arc<Mutex<Vec<Readings>>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (c, s) = (calls.clone(), seen.clone());
        feed.set_listener(Arc::new(move |readings: &Readings| -> anyhow::Result<()> {
            c.fetch_add(1, Ordering::SeqCst);
            s.lock().unwrap().push(readings.clone());
            Ok(())
        }));
        (calls, seen)
    }

    #[test]
    fn values_are_absent_until_first_message() {
        let feed = feed_with(&[("t/in", "interior"), ("t/out", "exterior")]);
        let readings = feed.readings();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings["interior"], None);
        assert_eq!(readings["exterior"], None);
    }

    #[test]
    fn debounces_small_changes() {
        let feed = feed_with(&[("t/balcony", "balcony")]);
        let (calls, _) = counting_listener(&feed);

        assert!(feed.on_message("balcony", "8.2").unwrap());
        assert!(!feed.on_message("balcony", "8.25").unwrap());
        assert!(feed.on_message("balcony", "9.0").unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(feed.readings()["balcony"], Some(9.0));
    }

    #[test]
    fn small_steps_still_update_the_stored_value() {
        let feed = feed_with(&[("t/balcony", "balcony")]);
        feed.on_message("balcony", "8.2").unwrap();
        feed.on_message("balcony", "8.25").unwrap();
        assert_eq!(feed.readings()["balcony"], Some(8.25));
        // the delta is measured against the stored value, not the last notified one
        assert!(!feed.on_message("balcony", "8.3").unwrap());
    }

    #[test]
    fn threshold_sized_step_counts_as_change() {
        let feed = feed_with(&[("t/in", "interior")]);
        feed.on_message("interior", "20.0").unwrap();
        assert!(feed.on_message("interior", "20.1").unwrap());
        assert!(feed.on_message("interior", "19.5").unwrap());
    }

    #[test]
    fn listener_receives_full_reading_set() {
        let feed = feed_with(&[("t/in", "interior"), ("t/out", "exterior")]);
        let (_, seen) = counting_listener(&feed);

        feed.on_message("interior", "21.5").unwrap();
        feed.on_message("exterior", " 8.2\n").unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["interior"], Some(21.5));
        assert_eq!(seen[0]["exterior"], None);
        assert_eq!(seen[1]["interior"], Some(21.5));
        assert_eq!(seen[1]["exterior"], Some(8.2));
    }

    #[test]
    fn malformed_payload_is_discarded() {
        let feed = feed_with(&[("t/in", "interior")]);
        let (calls, _) = counting_listener(&feed);

        feed.on_message("interior", "19.0").unwrap();
        assert!(matches!(feed.on_message("interior", "unavailable"), Err(FeedError::NotANumber { .. })));
        assert!(feed.on_message("interior", "nan").is_err());

        assert_eq!(feed.readings()["interior"], Some(19.0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_routing_uses_topic_map() {
        let feed = feed_with(&[("home/balcony/temp", "exterior")]);
        feed.shared.handle_publish("home/balcony/temp", b"4.5");
        feed.shared.handle_publish("home/attic/temp", b"30.0");
        feed.shared.handle_publish("home/balcony/temp", &[0xff, 0xfe]);

        let readings = feed.readings();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings["exterior"], Some(4.5));
    }

    #[test]
    fn unknown_key_is_reported() {
        let feed = feed_with(&[("t/in", "interior")]);
        assert!(matches!(feed.on_message("garage", "1.0"), Err(FeedError::UnknownKey(_))));
    }

    #[test]
    fn failing_listener_does_not_break_delivery() {
        let feed = feed_with(&[("t/in", "interior")]);
        feed.set_listener(Arc::new(|_: &Readings| -> anyhow::Result<()> { anyhow::bail!("render exploded") }));
        assert!(feed.on_message("interior", "20.0").unwrap());

        feed.set_listener(Arc::new(|_: &Readings| -> anyhow::Result<()> { panic!("listener bug") }));
        assert!(feed.on_message("interior", "25.0").unwrap());
        assert_eq!(feed.readings()["interior"], Some(25.0));
    }

    #[test]
    fn listener_may_read_back_without_deadlock() {
        let feed = Arc::new(feed_with(&[("t/in", "interior")]));
        let observed = Arc::new(Mutex::new(None));
        let (inner, slot) = (Arc::downgrade(&feed), observed.clone());
        feed.set_listener(Arc::new(move |_: &Readings| -> anyhow::Result<()> {
            if let Some(feed) = inner.upgrade() {
                *slot.lock().unwrap() = feed.readings().get("interior").copied().flatten();
            }
            Ok(())
        }));
        feed.on_message("interior", "18.5").unwrap();
        assert_eq!(*observed.lock().unwrap(), Some(18.5));
    }

    #[test]
    fn change_timestamp_only_moves_on_real_change() {
        let feed = feed_with(&[("t/in", "interior")]);
        feed.on_message("interior", "20.0").unwrap();
        let changed_at = |feed: &SensorFeed| lock(&feed.shared.readings)["interior"].changed_at;
        let first = changed_at(&feed);
        assert!(first.is_some());
        feed.on_message("interior", "20.05").unwrap();
        assert_eq!(changed_at(&feed), first);
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_a_noop() {
        let feed = feed_with(&[("t/in", "interior")]);
        feed.disconnect().await;
        feed.disconnect().await;
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let mut config = MqttConfig::default();
        config.host = "127.0.0.1".to_string();
        config.port = 9;
        config.connect_timeout_secs = 2;
        let feed = SensorFeed::new(&config);
        assert!(!feed.connect().await);
        feed.disconnect().await;
    }
}
