use crate::{Error, Result, config::KafkaConfig};
use crate::broker::Ack;
use crate::envelope::Envelope;
use futures::future::join_all;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, warn};

pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = super::client_config(config)
            .set("enable.idempotence", "true")
            .set("partitioner", &config.partitioner)
            .set("compression.type", &config.compression)
            .set("acks", &config.acks)
            .set("linger.ms", config.linger_ms.to_string())
            .set("batch.size", config.batch_size.to_string())
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()
            .map_err(|e| Error::Kafka(e))?;

        Ok(Self { producer })
    }

    /// Enqueues every envelope in order with the same key, then waits for
    /// all delivery reports. Envelopes without a successful report are
    /// returned in the error.
    pub async fn send_batch(
        &self,
        aggregate: &str,
        topic: &str,
        key: Option<&str>,
        envelopes: &[Envelope],
    ) -> Result<Vec<Ack>> {
        let payloads = envelopes
            .iter()
            .map(Envelope::to_vec)
            .collect::<Result<Vec<_>>>()?;

        let mut deliveries = Vec::with_capacity(payloads.len());
        for (i, payload) in payloads.iter().enumerate() {
            let mut record: FutureRecord<'_, str, Vec<u8>> = FutureRecord::to(topic).payload(payload);
            if let Some(key) = key {
                record = record.key(key);
            }

            match self.producer.send_result(record) {
                Ok(delivery) => deliveries.push(delivery),
                Err((e, _)) => {
                    warn!("Failed to enqueue event {} of {} for {}: {}", i + 1, payloads.len(), topic, e);
                    // Records already enqueued are still delivered
                    let reports = join_all(deliveries).await;
                    let mut attempted: Vec<Envelope> = reports
                        .into_iter()
                        .zip(envelopes)
                        .filter(|(report, _)| !matches!(report, Ok(Ok(_))))
                        .map(|(_, envelope)| envelope.clone())
                        .collect();
                    attempted.extend_from_slice(&envelopes[i..]);
                    return Err(Error::publish(aggregate, attempted, e));
                }
            }
        }

        let reports = join_all(deliveries).await;
        let mut acks = Vec::with_capacity(reports.len());
        let mut failed = Vec::new();
        let mut first_error: Option<Error> = None;

        for (report, envelope) in reports.into_iter().zip(envelopes) {
            match report {
                Ok(Ok((partition, offset))) => {
                    acks.push(Ack::positioned(envelope, topic, partition, offset));
                }
                Ok(Err((e, _))) => {
                    failed.push(envelope.clone());
                    first_error.get_or_insert(Error::Kafka(e));
                }
                Err(_canceled) => {
                    failed.push(envelope.clone());
                    first_error.get_or_insert(Error::invalid_message("delivery report canceled"));
                }
            }
        }

        if let Some(e) = first_error {
            warn!(
                "{} of {} event(s) for {} were not acknowledged",
                failed.len(),
                envelopes.len(),
                topic
            );
            return Err(Error::publish(aggregate, failed, e));
        }

        debug!("Delivered {} event(s) to {}", acks.len(), topic);
        Ok(acks)
    }

    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| Error::Kafka(e))
    }
}
