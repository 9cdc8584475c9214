use chrono::Utc;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use reqwest::{Client, Method};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{AttackError, DefinitionError};
use crate::models::{Attack, Hit, RunReport, TestDefinition};
use crate::report::ReportBuilder;

/// Hard ceiling on concurrently running requests, whatever the rate
const MAX_IN_FLIGHT: usize = 10_000;

/// Settings shared by every attack an [`Attacker`] runs
#[derive(Debug, Clone)]
pub struct AttackConfig {
    /// Timeout for each request
    pub timeout: Duration,
    /// Whether to keep connections alive
    pub keepalive: bool,
    /// Maximum number of idle connections per host
    pub connections: usize,
    /// Number of redirects to follow, negative to not follow any
    pub redirects: i32,
    /// Ignore invalid server TLS certificates
    pub insecure: bool,
    /// Send HTTP/2 requests without negotiating first
    pub http2: bool,
    /// Cap on in-flight requests; defaults to the number of planned requests
    pub max_in_flight: Option<usize>,
    /// How long in-flight requests may keep running once a run is cancelled
    pub cancel_grace: Duration,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            keepalive: true,
            connections: 10000,
            redirects: 10,
            insecure: false,
            http2: false,
            max_in_flight: None,
            cancel_grace: Duration::from_secs(2),
        }
    }
}

/// Rate-bound HTTP traffic generator
///
/// Requests are scheduled on a fixed-period ticker, one spawned task per tick,
/// so a slow response never delays the next scheduled request. Outcomes flow
/// back over a channel and are folded into a [`RunReport`].
pub struct Attacker {
    client: Client,
    config: AttackConfig,
    instruments: Instruments,
}

impl Attacker {
    pub fn new(config: AttackConfig) -> Result<Self, AttackError> {
        let mut client_builder = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.connections)
            .user_agent(concat!("arquebus/", env!("CARGO_PKG_VERSION")));

        if !config.keepalive {
            client_builder = client_builder.pool_max_idle_per_host(0);
        }

        if config.insecure {
            client_builder = client_builder.danger_accept_invalid_certs(true);
        }

        if config.http2 {
            client_builder = client_builder.http2_prior_knowledge();
        }

        // Set up redirects policy
        if config.redirects >= 0 {
            client_builder =
                client_builder.redirect(reqwest::redirect::Policy::limited(config.redirects as usize));
        } else {
            client_builder = client_builder.redirect(reqwest::redirect::Policy::none());
        }

        Ok(Self {
            client: client_builder.build()?,
            config,
            instruments: Instruments::new(),
        })
    }

    pub fn config(&self) -> &AttackConfig {
        &self.config
    }

    /// Validate a definition and run it right away
    pub async fn run_once(
        &self,
        definition: &TestDefinition,
        cancel: &CancellationToken,
    ) -> Result<RunReport, AttackError> {
        let attack = definition.validate()?;
        self.run(&attack, cancel).await
    }

    /// Run an attack to completion, or until `cancel` fires
    ///
    /// A cancelled run is not an error: the partial report comes back with
    /// `cancelled` set.
    pub async fn run(&self, attack: &Attack, cancel: &CancellationToken) -> Result<RunReport, AttackError> {
        if attack.rate == 0 {
            return Err(AttackError::InvalidRate);
        }
        let method = Method::from_bytes(attack.target.method.as_bytes())
            .map_err(|_| DefinitionError::InvalidMethod(attack.target.method.clone()))?;

        let mut report = ReportBuilder::new(attack);
        if attack.duration.is_zero() {
            debug!(name = %attack.name, "Zero duration, nothing to send");
            return Ok(report.finish());
        }

        let planned = (attack.rate as f64 * attack.duration.as_secs_f64()).ceil().max(1.0) as u64;
        let in_flight_cap = self
            .config
            .max_in_flight
            .unwrap_or(planned.min(MAX_IN_FLIGHT as u64) as usize)
            .clamp(1, MAX_IN_FLIGHT);

        info!(
            event = "attack_started",
            name = %attack.name,
            method = %method,
            url = %attack.target.url,
            rate = attack.rate,
            duration = ?attack.duration,
            planned,
            in_flight_cap,
            "Starting attack"
        );

        let permits = Arc::new(Semaphore::new(in_flight_cap));
        let (tx, mut rx) = mpsc::unbounded_channel::<Hit>();
        // Separate from `cancel`: in-flight requests get a grace period first
        let abandon = CancellationToken::new();

        let period = Duration::from_secs_f64(1.0 / attack.rate as f64).max(Duration::from_nanos(1));
        let start = Instant::now();
        let deadline = start + attack.duration;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let mut issued: u64 = 0;
        let mut cancelled = false;

        while issued < planned {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some(hit) = rx.recv() => {
                    self.instruments.record(&attack.name, &hit);
                    report.add(hit);
                }
                scheduled = ticker.tick() => {
                    if scheduled >= deadline || Instant::now() >= deadline {
                        break;
                    }

                    let Some(permit) = acquire(&permits, cancel, deadline).await else {
                        cancelled = cancel.is_cancelled();
                        break;
                    };
                    // The wait for a permit may have outlived the run
                    if Instant::now() >= deadline {
                        break;
                    }

                    let client = self.client.clone();
                    let method = method.clone();
                    let url = attack.target.url.clone();
                    let tx = tx.clone();
                    let abandon = abandon.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            hit = make_request(&client, method, url) => {
                                let _ = tx.send(hit);
                            }
                            _ = abandon.cancelled() => {}
                        }
                        drop(permit);
                    });

                    issued += 1;
                }
            }
        }
        drop(tx);

        // Wait for every in-flight request; each one is bounded by the client timeout
        let mut grace_deadline = cancelled.then(|| Instant::now() + self.config.cancel_grace);
        loop {
            let next = if let Some(grace_deadline) = grace_deadline {
                match tokio::time::timeout_at(grace_deadline, rx.recv()).await {
                    Ok(next) => next,
                    Err(_) => break,
                }
            } else {
                tokio::select! {
                    next = rx.recv() => next,
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        grace_deadline = Some(Instant::now() + self.config.cancel_grace);
                        continue;
                    }
                }
            };

            match next {
                Some(hit) => {
                    self.instruments.record(&attack.name, &hit);
                    report.add(hit);
                }
                None => break,
            }
        }
        abandon.cancel();

        let abandoned = issued.saturating_sub(report.requests());
        if abandoned > 0 {
            warn!(name = %attack.name, abandoned, "Abandoned in-flight requests after grace period");
            report.add_abandoned(abandoned, Utc::now());
        }
        if cancelled {
            report.mark_cancelled();
        }

        let report = report.finish();
        info!(
            event = "attack_completed",
            name = %report.name,
            requests = report.requests,
            success = report.success,
            errors = report.errors.len(),
            cancelled = report.cancelled,
            elapsed = ?start.elapsed(),
            "Attack completed"
        );
        Ok(report)
    }
}

/// Wait for an in-flight slot; `None` once cancelled or past `deadline`
async fn acquire(
    permits: &Arc<Semaphore>,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Option<OwnedSemaphorePermit> {
    // Fast path when below the cap
    if let Ok(permit) = permits.clone().try_acquire_owned() {
        return Some(permit);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        _ = tokio::time::sleep_until(deadline) => None,
        permit = permits.clone().acquire_owned() => permit.ok(),
    }
}

/// Make a single HTTP request
pub async fn make_request(client: &Client, method: Method, url: Url) -> Hit {
    let start_time = std::time::Instant::now();
    let timestamp = Utc::now();

    let hit = match client.request(method, url).send().await {
        Ok(response) => {
            let status_code = response.status().as_u16();

            match response.bytes().await {
                Ok(body) => Hit {
                    timestamp,
                    latency: start_time.elapsed(),
                    status_code,
                    error: None,
                    bytes_in: body.len() as u64,
                    bytes_out: 0,
                },
                Err(e) => Hit {
                    timestamp,
                    latency: start_time.elapsed(),
                    status_code,
                    error: Some(format!("Failed to read response body: {}", e)),
                    bytes_in: 0,
                    bytes_out: 0,
                },
            }
        }
        Err(e) => Hit {
            timestamp,
            latency: start_time.elapsed(),
            status_code: 0,
            error: Some(format!("Request failed: {}", e)),
            bytes_in: 0,
            bytes_out: 0,
        },
    };

    trace!(
        status_code = hit.status_code,
        latency_ms = hit.latency.as_millis() as u64,
        error = hit.error.as_deref(),
        "Request finished"
    );
    hit
}

/// OpenTelemetry instruments fed by every hit
struct Instruments {
    requests: Counter<u64>,
    success: Counter<u64>,
    failure: Counter<u64>,
    bytes_in: Counter<u64>,
    bytes_out: Counter<u64>,
    request_duration: Histogram<f64>,
}

impl Instruments {
    fn new() -> Self {
        let meter = global::meter("arquebus");

        Self {
            requests: meter
                .u64_counter("requests")
                .with_description("Total number of requests")
                .init(),
            success: meter
                .u64_counter("success_requests")
                .with_description("Number of successful requests")
                .init(),
            failure: meter
                .u64_counter("failure_requests")
                .with_description("Number of failed requests")
                .init(),
            bytes_in: meter
                .u64_counter("bytes_in")
                .with_description("Total bytes received")
                .init(),
            bytes_out: meter
                .u64_counter("bytes_out")
                .with_description("Total bytes sent")
                .init(),
            request_duration: meter
                .f64_histogram("request_duration")
                .with_description("Request duration in seconds")
                .init(),
        }
    }

    fn record(&self, attack: &str, hit: &Hit) {
        let attributes = [KeyValue::new("attack", attack.to_string())];

        self.requests.add(1, &attributes);
        if hit.is_success() {
            self.success.add(1, &attributes);
        } else {
            self.failure.add(1, &attributes);
        }
        self.bytes_in.add(hit.bytes_in, &attributes);
        self.bytes_out.add(hit.bytes_out, &attributes);
        self.request_duration.record(hit.latency.as_secs_f64(), &attributes);
    }
}
