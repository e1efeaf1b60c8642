use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

use airwatch_pipeline::broker::{MemoryTopic, MessageSink};
use airwatch_pipeline::hub::{self, AlertConsumerSettings, Hub};
use airwatch_pipeline::processor::{ProcessorSettings, StreamProcessor};
use airwatch_pipeline::store::{MemoryStore, Store};
use airwatch_pipeline::{Alert, Anomaly, AnomalyKind, Reading};

const WAIT: Duration = Duration::from_secs(5);

/// A PM2.5 reading above the regulatory limit travels from the raw stream
/// through detection, storage and the alert stream to every subscriber.
#[tokio::test]
async fn pm25_exceedance_reaches_every_subscriber() -> Result<()> {
    // ---
    let store = MemoryStore::new();
    let now = Utc::now();
    for minutes in 1..=10 {
        let prior = Reading::new(
            41.0,
            29.0,
            "PM2.5",
            5.0,
            now - ChronoDuration::minutes(minutes * 10),
        );
        store.insert_reading(&prior).await?;
    }

    let raw = MemoryTopic::new();
    let alerts = MemoryTopic::new();
    let cancel = CancellationToken::new();

    let processor = StreamProcessor::new(
        Arc::new(raw.subscribe("processor-group")),
        Arc::new(alerts.publisher()),
        Arc::new(store.clone()),
        ProcessorSettings::default(),
    );
    let processor_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { processor.run(cancel).await }
    });

    let (coordinator, handle) = Hub::new(8);
    let hub_task = tokio::spawn(coordinator.run(cancel.clone()));
    let consumer_task = tokio::spawn(hub::consume_alerts(
        Arc::new(alerts.subscribe("notifier-group")),
        handle.clone(),
        AlertConsumerSettings::default(),
        cancel.clone(),
    ));

    let mut first = handle.register().await?;
    let mut second = handle.register().await?;

    let reading = Reading::new(41.0, 29.0, "PM2.5", 20.0, now);
    raw.publisher()
        .publish(&serde_json::to_vec(&reading)?)
        .await?;

    for subscription in [&mut first, &mut second] {
        let frame = tokio::time::timeout(WAIT, subscription.receiver.recv())
            .await?
            .expect("subscriber dropped before the alert arrived");
        let alert: Alert = serde_json::from_str(&frame)?;
        assert_eq!(alert.kind, AnomalyKind::ThresholdExceeded);
        assert_eq!(alert.parameter, "PM2.5");
        assert_eq!(alert.value, 20.0);
        assert_eq!(alert.location, [41.0, 29.0]);
    }

    let stored = store.anomalies();
    assert_eq!(stored.len(), 1);
    let anomaly = &stored[0];
    assert_eq!(anomaly.kind, AnomalyKind::ThresholdExceeded);
    let source = anomaly.source.expect("anomaly should reference its reading");
    assert_eq!(source.id, reading.id);

    assert_eq!(alerts.len(), 1);
    let published: Anomaly = serde_json::from_slice(&alerts.messages()[0])?;
    assert_eq!(&published, anomaly);

    assert_eq!(store.readings().len(), 11);

    cancel.cancel();
    tokio::time::timeout(WAIT, processor_task).await??;
    tokio::time::timeout(WAIT, consumer_task).await??;
    tokio::time::timeout(WAIT, hub_task).await??;

    // hub shutdown closes every subscriber buffer
    assert!(first.receiver.recv().await.is_none());
    assert!(second.receiver.recv().await.is_none());
    Ok(())
}

/// Normal readings are stored but produce nothing on the alert stream.
#[tokio::test]
async fn clean_readings_are_stored_without_alerts() -> Result<()> {
    // ---
    let store = MemoryStore::new();
    let raw = MemoryTopic::new();
    let alerts = MemoryTopic::new();
    let cancel = CancellationToken::new();

    let processor = StreamProcessor::new(
        Arc::new(raw.subscribe("processor-group")),
        Arc::new(alerts.publisher()),
        Arc::new(store.clone()),
        ProcessorSettings::default(),
    );
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move { processor.run(cancel).await }
    });

    let publisher = raw.publisher();
    for value in [8.0, 9.0, 10.0] {
        let reading = Reading::new(41.0, 29.0, "PM2.5", value, Utc::now());
        publisher.publish(&serde_json::to_vec(&reading)?).await?;
    }
    publisher.publish(b"not json").await?;

    tokio::time::timeout(WAIT, async {
        while store.readings().len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    cancel.cancel();
    tokio::time::timeout(WAIT, task).await??;

    assert_eq!(store.readings().len(), 3);
    assert!(store.anomalies().is_empty());
    assert!(alerts.is_empty());
    Ok(())
}
