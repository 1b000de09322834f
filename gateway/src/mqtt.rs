//! MQTT publishing: topology documents, health, validation failures, and the
//! runtime command channel.
//!
//! ## Architecture
//! One `AsyncClient` publishes; its event loop runs in a background task that
//! also listens on `<topic>/cmd` for runtime commands. Topology publishes go
//! through a token-style rate limiter whose interval the command channel can
//! change live. Health and validation-failure publishes bypass the limiter.
//!
//! With `--disable-mqtt` the publisher is constructed without a client and
//! every publish becomes a log line, keeping the rest of the pipeline
//! identical in dry runs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::{debug, info, warn};

use crate::health::{HealthMonitor, HealthSnapshot};
use crate::validator::ValidationFailure;

// ── Rate limiting ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct RateState {
    /// Minimum seconds between topology publishes.
    interval_s: f64,
    last_publish: Option<f64>,
}

/// Minimum-interval limiter for the topology topic. `allow` and
/// `mark_published` are split so a failed broker write does not consume the
/// slot.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<RateState>,
}

impl RateLimiter {
    pub fn new(interval_s: f64) -> Self {
        Self {
            state: Mutex::new(RateState {
                interval_s,
                last_publish: None,
            }),
        }
    }

    pub fn allow(&self, now: f64) -> bool {
        let state = self.state.lock().expect("rate limiter lock poisoned");
        match state.last_publish {
            Some(last) => now - last >= state.interval_s,
            None => true,
        }
    }

    pub fn mark_published(&self, now: f64) {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        state.last_publish = Some(now);
    }

    /// Update the interval. Non-positive values are rejected.
    pub fn set_interval(&self, interval_s: f64) -> bool {
        if !interval_s.is_finite() || interval_s <= 0.0 {
            return false;
        }
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        state.interval_s = interval_s;
        true
    }

    pub fn interval(&self) -> f64 {
        self.state.lock().expect("rate limiter lock poisoned").interval_s
    }
}

/// Parse a command-channel message. Understood form: `set rate_limit <secs>`.
pub fn parse_rate_limit_command(msg: &str) -> Option<f64> {
    let mut parts = msg.split_whitespace();
    match (parts.next()?, parts.next()?, parts.next()?, parts.next()) {
        ("set", "rate_limit", value, None) => {
            let secs: f64 = value.parse().ok()?;
            (secs.is_finite() && secs > 0.0).then_some(secs)
        }
        _ => None,
    }
}

// ── Publisher ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PublishBrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
}

pub struct Publisher {
    /// `None` in dry-run mode: payloads are logged instead of sent.
    client: Option<AsyncClient>,
    topic: String,
    limiter: Arc<RateLimiter>,
    health: Arc<HealthMonitor>,
}

impl Publisher {
    /// Create a connected publisher plus its event loop. The caller must
    /// drive the loop via [`run_event_loop`].
    pub fn connect(
        cfg: &PublishBrokerConfig,
        limiter: Arc<RateLimiter>,
        health: Arc<HealthMonitor>,
    ) -> (Self, AsyncClient, EventLoop) {
        let mut options = MqttOptions::new("uwb-gateway", &cfg.host, cfg.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            options.set_credentials(user, pass);
        }
        let (client, eventloop) = AsyncClient::new(options, 64);
        info!("📡 MQTT publisher connecting to {}:{}", cfg.host, cfg.port);
        let publisher = Self {
            client: Some(client.clone()),
            topic: cfg.topic.clone(),
            limiter,
            health,
        };
        (publisher, client, eventloop)
    }

    /// Dry-run publisher for `--disable-mqtt`.
    pub fn disabled(topic: &str, limiter: Arc<RateLimiter>, health: Arc<HealthMonitor>) -> Self {
        health.set_publish_broker(true);
        Self {
            client: None,
            topic: topic.to_string(),
            limiter,
            health,
        }
    }

    async fn send(&self, topic: &str, payload: String) -> anyhow::Result<()> {
        match &self.client {
            Some(client) => client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
                .with_context(|| format!("publish to '{topic}' failed")),
            None => {
                info!("[dry-run] {topic}: {payload}");
                Ok(())
            }
        }
    }

    /// Publish the topology document, honoring the rate limit. Returns
    /// `Ok(false)` when the limiter suppressed the publish.
    pub async fn publish_topology(&self, payload: String, now: f64) -> anyhow::Result<bool> {
        if !self.limiter.allow(now) {
            debug!("Topology publish suppressed by rate limit");
            return Ok(false);
        }
        match self.send(&self.topic, payload).await {
            Ok(()) => {
                self.limiter.mark_published(now);
                self.health.record_publish(true);
                Ok(true)
            }
            Err(e) => {
                self.health.record_publish(false);
                Err(e)
            }
        }
    }

    pub async fn publish_health(&self, snapshot: &HealthSnapshot) -> anyhow::Result<()> {
        let payload = serde_json::to_string(snapshot)?;
        self.send(&format!("{}/health", self.topic), payload).await
    }

    pub async fn publish_failures(&self, failures: &[ValidationFailure]) -> anyhow::Result<()> {
        if failures.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_string(failures)?;
        self.send(&format!("{}/validation_failures", self.topic), payload)
            .await
    }
}

/// Drive the publisher's event loop: maintain the connection flag, subscribe
/// to the command topic, and apply rate-limit commands.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topic: String,
    limiter: Arc<RateLimiter>,
    health: Arc<HealthMonitor>,
) {
    let cmd_topic = format!("{topic}/cmd");
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                health.set_publish_broker(true);
                info!("MQTT broker connected, command topic '{cmd_topic}'");
                if let Err(e) = client.subscribe(&cmd_topic, QoS::AtLeastOnce).await {
                    warn!("Command topic subscribe failed: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic != cmd_topic {
                    continue;
                }
                let msg = String::from_utf8_lossy(&publish.payload);
                match parse_rate_limit_command(&msg) {
                    Some(secs) if limiter.set_interval(secs) => {
                        info!("Rate limit set to {secs}s via command channel");
                    }
                    _ => warn!("Ignoring malformed command: '{}'", msg.trim()),
                }
            }
            Ok(_) => {}
            Err(e) => {
                health.set_publish_broker(false);
                warn!("MQTT broker error: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
