//! # uwb-gateway
//!
//! Bridges a UWB ranging network to MQTT: reads the proprietary ranging
//! stream from a serial bridge node, decodes distance measurements, fuses
//! them with surveyed anchors and cached LoRa telemetry, and publishes
//! topology documents.
//!
//! ## Architecture
//! - serial reader thread → [`serial_link::SerialEvent`] channel
//! - main pipeline task: framing, decoding, validation, fusion, publishing
//! - background tasks: publish-broker event loop (command channel), LoRa
//!   telemetry subscriber, cache eviction, health reporter
//!
//! All cross-task state lives in `Arc`ed components handed out at startup;
//! the pipeline itself owns its decoder and recovery state machine.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use uwb_proto::{ActType, Edge, FrameDecoder, RangingRecord};

mod confidence;
mod config;
mod fusion;
mod health;
mod mqtt;
mod recovery;
mod serial_link;
mod telemetry_cache;
mod validator;

use config::{Args, NetworkFormat};
use confidence::ConfidenceScorer;
use fusion::{FusionConfig, FusionEngine};
use health::{unix_now, HealthMonitor};
use mqtt::{Publisher, RateLimiter};
use recovery::{ErrorCategory, ErrorRecovery};
use serial_link::{SerialCommand, SerialEvent, SerialLink};
use telemetry_cache::{CacheConfig, TelemetryCache};
use validator::{DataValidator, ValidationFailure, ValidatorConfig};

const HEALTH_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "uwb_gateway=info".into()),
        )
        .init();

    let args = Args::parse();
    let static_cfg =
        config::load_static_config(args.anchor_config.as_deref(), args.dev_eui_mapping.as_deref())?;
    info!(
        "🛰️  UWB gateway starting: uart={}, topic='{}', format={:?}, anchors={}",
        args.uart,
        args.mqtt_topic,
        args.network_format,
        static_cfg.anchors.len()
    );

    let health = Arc::new(HealthMonitor::new());
    let limiter = Arc::new(RateLimiter::new(args.mqtt_rate_limit));
    let cache = Arc::new(TelemetryCache::new());
    let validator = Arc::new(DataValidator::new(ValidatorConfig::default()));

    let publisher = if args.disable_mqtt {
        info!("MQTT disabled, payloads will be logged");
        Arc::new(Publisher::disabled(
            &args.mqtt_topic,
            Arc::clone(&limiter),
            Arc::clone(&health),
        ))
    } else {
        let broker_cfg = mqtt::PublishBrokerConfig {
            host: args.mqtt_broker.clone(),
            port: args.mqtt_port,
            username: args.mqtt_username.clone(),
            password: args.mqtt_password.clone(),
            topic: args.mqtt_topic.clone(),
        };
        let (publisher, client, eventloop) =
            Publisher::connect(&broker_cfg, Arc::clone(&limiter), Arc::clone(&health));
        tokio::spawn(mqtt::run_event_loop(
            eventloop,
            client,
            args.mqtt_topic.clone(),
            Arc::clone(&limiter),
            Arc::clone(&health),
        ));
        Arc::new(publisher)
    };

    if args.enable_lora_cache {
        if static_cfg.dev_eui_map.is_empty() {
            warn!("LoRa cache enabled but the dev-EUI mapping is empty");
        }
        let broker_cfg = telemetry_cache::TelemetryBrokerConfig {
            host: args.lora_broker.clone(),
            port: args.lora_port,
            username: args.lora_username.clone(),
            password: args.lora_password.clone(),
            topic: args.lora_topic.clone(),
        };
        tokio::spawn(telemetry_cache::run_subscriber(
            broker_cfg,
            Arc::clone(&cache),
            Arc::new(static_cfg.dev_eui_map.clone()),
            Arc::clone(&health),
        ));
        tokio::spawn(telemetry_cache::run_eviction(
            CacheConfig::default(),
            Arc::clone(&cache),
        ));
    }

    tokio::spawn(health::run_reporter(
        HEALTH_PERIOD,
        Arc::clone(&health),
        Arc::clone(&publisher),
    ));

    let link = serial_link::spawn(&serial_link::SerialConfig {
        path: args.uart.clone(),
        baud_rate: args.baud_rate,
    })?;
    health.set_serial(true);

    let fusion = FusionEngine::new(
        static_cfg.anchors,
        Arc::clone(&cache),
        Arc::clone(&validator),
        ConfidenceScorer::default(),
        FusionConfig {
            gps_max_age_s: args.gps_max_age,
            sensor_max_age_s: args.sensor_max_age,
        },
    );

    let mut pipeline = Pipeline {
        decoder: FrameDecoder::new(),
        recovery: ErrorRecovery::default(),
        fusion,
        publisher,
        health,
        validator,
        format: args.network_format,
        report_failures: args.report_validation_failures,
    };
    pipeline.run(link).await
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// Everything one ranging cycle needs, owned in one place.
struct Pipeline {
    decoder: FrameDecoder,
    recovery: ErrorRecovery,
    fusion: FusionEngine,
    publisher: Arc<Publisher>,
    health: Arc<HealthMonitor>,
    validator: Arc<DataValidator>,
    format: NetworkFormat,
    report_failures: bool,
}

impl Pipeline {
    async fn run(&mut self, mut link: SerialLink) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    let _ = link.commands.send(SerialCommand::Shutdown).await;
                    return Ok(());
                }
                event = link.events.recv() => match event {
                    Some(SerialEvent::Data(bytes)) => self.handle_data(&bytes, &link).await,
                    Some(SerialEvent::Error(msg)) => {
                        warn!("Serial transport error: {msg}");
                        self.health.record_connection_error();
                        self.recovery.record_error(ErrorCategory::Connection, unix_now());
                        self.maybe_reset(ErrorCategory::Connection, &link).await;
                    }
                    None => {
                        self.health.set_serial(false);
                        anyhow::bail!("serial reader thread stopped");
                    }
                }
            }
        }
    }

    async fn handle_data(&mut self, bytes: &[u8], link: &SerialLink) {
        self.decoder.extend(bytes);

        while let Some(frame) = self.decoder.next_frame() {
            match RangingRecord::parse(&frame) {
                Ok(record) => {
                    self.health.record_packet(true);
                    self.recovery.record_success(ErrorCategory::Parsing);
                    match record.act_type {
                        ActType::Assignment => {
                            debug!(
                                "Assignment: slot={} timeframe={} groups={:?}",
                                record.slot,
                                record.timeframe,
                                record.group_sizes()
                            );
                        }
                        ActType::Final => self.handle_final(&record).await,
                    }
                }
                Err(e) => {
                    warn!("Ranging record decode failed: {e}");
                    self.health.record_packet(false);
                    self.health.record_parsing_error();
                    self.recovery.record_error(ErrorCategory::Parsing, unix_now());
                }
            }
        }

        // Resync runs are framing corruption and feed the same parsing-error
        // accounting as decode failures.
        let resyncs = self.decoder.take_resync_events();
        if resyncs > 0 {
            debug!("Stream resynchronized {resyncs} time(s)");
            let now = unix_now();
            for _ in 0..resyncs {
                self.health.record_parsing_error();
                self.recovery.record_error(ErrorCategory::Parsing, now);
            }
        }

        self.maybe_reset(ErrorCategory::Parsing, link).await;
    }

    async fn handle_final(&mut self, record: &RangingRecord) {
        let now = unix_now();
        let mut failures: Vec<ValidationFailure> = Vec::new();
        let edges: Vec<Edge> = record
            .edges()
            .into_iter()
            .filter(|edge| match self.validator.check_distance(edge.distance_m) {
                Ok(()) => true,
                Err(rejection) => {
                    failures.push(rejection.into_failure(Some(edge.end0), now));
                    false
                }
            })
            .collect();

        if edges.is_empty() && failures.is_empty() {
            debug!("Final record carried no plausible measurements");
            return;
        }

        let payload = match self.format {
            NetworkFormat::Simple => Some(simple_payload(&edges)),
            NetworkFormat::Network => {
                let (doc, fusion_failures) = self.fusion.build(&edges, now);
                failures.extend(fusion_failures);
                network_payload(&doc)
            }
        };

        if !edges.is_empty() {
            if let Some(payload) = payload {
                match self.publisher.publish_topology(payload, now).await {
                    Ok(true) => debug!("Published topology with {} edges", edges.len()),
                    Ok(false) => {}
                    Err(e) => warn!("Topology publish failed: {e}"),
                }
            }
        }

        if self.report_failures && !failures.is_empty() {
            if let Err(e) = self.publisher.publish_failures(&failures).await {
                warn!("Validation-failure publish failed: {e}");
            }
        }
    }

    /// Reset the device if the recovery machine says so, waiting out the
    /// backoff delay first.
    async fn maybe_reset(&mut self, category: ErrorCategory, link: &SerialLink) {
        if !self.recovery.should_reset(category) {
            return;
        }
        let delay = self.recovery.trigger_reset(category);
        self.health.record_device_reset();
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        if link.commands.send(SerialCommand::Reset).await.is_err() {
            warn!("Serial reader gone, reset request dropped");
        }
        // Buffered bytes predate the reset and would only misparse.
        self.decoder.clear();
    }
}

/// Serialize the topology document, skipping the publish (never sending an
/// empty or partial payload) if serialization fails.
fn network_payload(doc: &fusion::NetworkDocument) -> Option<String> {
    match serde_json::to_string(doc) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!("Topology document serialization failed, publish skipped: {e}");
            None
        }
    }
}

/// Bare edge-list payload: `[["B4D3","B98A",5.0], ...]`.
fn simple_payload(edges: &[Edge]) -> String {
    let rows: Vec<serde_json::Value> = edges
        .iter()
        .map(|e| {
            serde_json::json!([
                e.end0.to_string(),
                e.end1.to_string(),
                (e.distance_m * 1000.0).round() / 1000.0
            ])
        })
        .collect();
    serde_json::Value::Array(rows).to_string()
}
