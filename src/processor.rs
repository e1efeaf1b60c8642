//! Stream processor: the raw-reading consumer loop.
//!
//! Each cycle fetches one reading from the inbound stream, stores it, pulls
//! its recent window, runs the detector, and stores and republishes any
//! anomaly. Fetch failures back off exponentially; every other failure is
//! logged and abandons the current reading without retry.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::broker::{MessageSink, MessageSource};
use crate::detector::{self, WINDOW_HOURS};
use crate::models::{Anomaly, Reading};
use crate::store::{bounded, Store};

// ---

/// Time budgets for the processor's external calls.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    // ---
    pub fetch_timeout: Duration,
    pub publish_timeout: Duration,
    pub store_timeout: Duration,
    pub window_hours: u32,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        ProcessorSettings {
            fetch_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(5),
            store_timeout: Duration::from_secs(5),
            window_hours: WINDOW_HOURS,
        }
    }
}

/// What happened to a single reading.
#[derive(Debug)]
pub enum Outcome {
    /// Stored; no rule flagged it.
    Clean,
    /// Stored and flagged; the anomaly was stored too. `published` reports
    /// whether the alert reached the outbound stream.
    Flagged { anomaly: Anomaly, published: bool },
    /// The reading could not be stored; nothing else was attempted.
    ReadingNotStored,
    /// Stored, but the recent window could not be fetched.
    WindowUnavailable,
    /// Flagged, but the anomaly could not be stored and was not published.
    AnomalyNotStored(Anomaly),
}

pub struct StreamProcessor {
    source: Arc<dyn MessageSource>,
    sink: Arc<dyn MessageSink>,
    store: Arc<dyn Store>,
    settings: ProcessorSettings,
    backoff: Backoff,
}

impl StreamProcessor {
    // ---
    pub fn new(
        source: Arc<dyn MessageSource>,
        sink: Arc<dyn MessageSink>,
        store: Arc<dyn Store>,
        settings: ProcessorSettings,
    ) -> Self {
        StreamProcessor {
            source,
            sink,
            store,
            settings,
            backoff: Backoff::default(),
        }
    }

    /// Replace the default 1s / 30s / 500ms fetch backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Consume until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        // ---
        info!("stream processor started");
        let mut backoff = self.backoff.clone();

        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => break,
                fetched = tokio::time::timeout(self.settings.fetch_timeout, self.source.fetch()) => fetched,
            };

            let payload = match fetched {
                Ok(Ok(payload)) => {
                    backoff.reset();
                    payload
                }
                Ok(Err(e)) => {
                    warn!("Error consuming reading: {}", e);
                    if !pause(&mut backoff, &cancel).await {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    warn!(
                        "No reading within {:?}, backing off",
                        self.settings.fetch_timeout
                    );
                    if !pause(&mut backoff, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let reading: Reading = match serde_json::from_slice(&payload) {
                Ok(reading) => reading,
                Err(e) => {
                    warn!("Skipping malformed reading payload: {}", e);
                    continue;
                }
            };

            self.process(&reading).await;
        }

        info!("stream processor stopped");
    }

    /// Store, evaluate, and (if flagged) store and publish one reading.
    pub async fn process(&self, reading: &Reading) -> Outcome {
        // ---
        debug!(
            "Processing {} at [{:.4},{:.4}]: {}",
            reading.parameter, reading.latitude, reading.longitude, reading.value
        );
        let budget = self.settings.store_timeout;

        if let Err(e) = bounded(budget, self.store.insert_reading(reading)).await {
            error!("Failed to store reading {}: {}", reading.id, e);
            return Outcome::ReadingNotStored;
        }

        let window = match bounded(
            budget,
            self.store.query_window(
                &reading.parameter,
                reading.latitude,
                reading.longitude,
                self.settings.window_hours,
            ),
        )
        .await
        {
            Ok(window) => window,
            Err(e) => {
                error!("Failed to fetch window for reading {}: {}", reading.id, e);
                return Outcome::WindowUnavailable;
            }
        };

        let Some(anomaly) = detector::detect(reading, &window) else {
            return Outcome::Clean;
        };

        info!(
            "Anomaly detected: {} - {} - {}",
            anomaly.kind, anomaly.parameter, anomaly.value
        );

        if let Err(e) = bounded(budget, self.store.insert_anomaly(&anomaly)).await {
            error!("Failed to store anomaly {}: {}", anomaly.id, e);
            return Outcome::AnomalyNotStored(anomaly);
        }

        let published = self.publish(&anomaly).await;
        Outcome::Flagged { anomaly, published }
    }

    async fn publish(&self, anomaly: &Anomaly) -> bool {
        // ---
        let payload = match serde_json::to_vec(anomaly) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode anomaly {}: {}", anomaly.id, e);
                return false;
            }
        };

        match tokio::time::timeout(self.settings.publish_timeout, self.sink.publish(&payload)).await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Failed to publish anomaly {}: {}", anomaly.id, e);
                false
            }
            Err(_) => {
                error!(
                    "Publishing anomaly {} timed out after {:?}",
                    anomaly.id, self.settings.publish_timeout
                );
                false
            }
        }
    }
}

/// Sleep for the next backoff delay. Returns `false` if cancelled first.
async fn pause(backoff: &mut Backoff, cancel: &CancellationToken) -> bool {
    // ---
    let delay = backoff.next_delay();
    debug!("Retrying fetch in {:?}", delay);
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
