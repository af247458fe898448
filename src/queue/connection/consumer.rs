//! The `get` state machine.
//!
//! Each call flushes due delayed messages, then:
//! 1. serves this consumer's own pending entries while it may have some,
//! 2. at most once per call, and no more often than `claim_interval`, tries to
//!    claim the oldest pending entry of the group if it has been idle for
//!    `redeliver_timeout`, re-reading its own pending entries on success,
//! 3. reads one new entry.
//!
//! A claim that comes back empty lost a race with another consumer and simply
//! falls through to step 3.

use std::collections::BTreeMap;

use crate::config::WireFormat;
use crate::error::Result;
use crate::metrics::{ClaimOutcome, QueueMetrics};
use crate::redis::{ReadFrom, StreamBackend, StreamEntry};

use super::super::models::{EntryId, Envelope, ReceivedMessage, MESSAGE_FIELD};
use super::{settle, Connection};

impl<B: StreamBackend> Connection<B> {
    /// Fetch at most one message for this consumer.
    pub async fn get(&mut self) -> Result<Option<ReceivedMessage>> {
        self.prepare().await?;

        let max_len = self.max_len();
        self.delay
            .flush_due(&mut self.backend, &self.config.options.stream, max_len)
            .await?;

        let mut claim_attempted = false;
        loop {
            if self.could_have_pending {
                if let Some(message) = self.read(ReadFrom::Pending).await? {
                    QueueMetrics::record_received_pending();
                    tracing::debug!(
                        id = %message.id,
                        consumer = %self.config.options.consumer,
                        "Serving own pending message"
                    );
                    return Ok(Some(message));
                }
                self.could_have_pending = false;
            }

            if claim_attempted || self.clock.now_ms() < self.next_claim_ms {
                break;
            }
            claim_attempted = true;
            if !self.claim_abandoned().await? {
                break;
            }
        }

        let message = self.read(ReadFrom::New).await?;
        if let Some(message) = &message {
            QueueMetrics::record_received_new();
            tracing::debug!(
                id = %message.id,
                consumer = %self.config.options.consumer,
                "Received new message"
            );
        }
        Ok(message)
    }

    /// Try to take over the oldest pending entry of the group.
    ///
    /// Returns whether this consumer now has pending entries worth re-reading.
    async fn claim_abandoned(&mut self) -> Result<bool> {
        let interval_ms =
            i64::try_from(self.config.options.claim_interval.as_millis()).unwrap_or(i64::MAX);
        self.next_claim_ms = self.clock.now_ms().saturating_add(interval_ms);

        let options = &self.config.options;
        let result = self
            .backend
            .pending_summary(&options.stream, &options.group, 1)
            .await;
        let pending = settle(&mut self.backend, "xpending", result, &options.stream)?;

        let Some(oldest) = pending.into_iter().next() else {
            return Ok(false);
        };

        if oldest.consumer == options.consumer {
            QueueMetrics::record_claim(ClaimOutcome::Own);
            self.could_have_pending = true;
            return Ok(true);
        }

        if u128::from(oldest.idle_ms) < options.redeliver_timeout.as_millis() {
            QueueMetrics::record_claim(ClaimOutcome::NotIdle);
            return Ok(false);
        }

        let ids = [oldest.id.clone()];
        let result = self
            .backend
            .claim(
                &options.stream,
                &options.group,
                &options.consumer,
                options.redeliver_timeout,
                &ids,
            )
            .await;
        let claimed = settle(&mut self.backend, "xclaim", result, &oldest.id)?;

        if claimed.is_empty() {
            QueueMetrics::record_claim(ClaimOutcome::Missed);
            tracing::debug!(
                id = %oldest.id,
                consumer = %options.consumer,
                "Pending message was taken by another consumer first"
            );
            return Ok(false);
        }

        QueueMetrics::record_claim(ClaimOutcome::Claimed);
        tracing::warn!(
            id = %oldest.id,
            previous_consumer = %oldest.consumer,
            consumer = %options.consumer,
            idle_ms = oldest.idle_ms,
            "Claimed abandoned pending message"
        );
        self.could_have_pending = true;
        Ok(true)
    }

    async fn read(&mut self, from: ReadFrom) -> Result<Option<ReceivedMessage>> {
        let options = &self.config.options;
        let block = match from {
            ReadFrom::New => options.block_timeout,
            ReadFrom::Pending => None,
        };

        let result = self
            .backend
            .group_read(&options.group, &options.consumer, &options.stream, from, 1, block)
            .await;
        let entries = settle(&mut self.backend, "xreadgroup", result, &options.stream)?;

        Ok(entries
            .into_iter()
            .next()
            .map(|entry| received(entry, options.serializer)))
    }
}

/// Present a stream entry with its envelope as JSON text.
fn received(entry: StreamEntry, format: WireFormat) -> ReceivedMessage {
    let raw = entry.fields.and_then(|mut fields| fields.remove(MESSAGE_FIELD));

    let text = raw.and_then(|raw| match format {
        WireFormat::Json => String::from_utf8(raw).ok(),
        WireFormat::Bincode => Envelope::decode(&raw, format)
            .and_then(|envelope| envelope.to_json())
            .ok(),
    });

    let mut data = BTreeMap::new();
    match text {
        Some(text) => {
            data.insert(MESSAGE_FIELD.to_string(), text);
        }
        None => {
            tracing::warn!(id = %entry.id, "Stream entry has no readable payload");
        }
    }

    ReceivedMessage {
        id: EntryId::new(entry.id),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_received_without_fields_has_empty_data() {
        let message = received(
            StreamEntry {
                id: "1-0".to_string(),
                fields: None,
            },
            WireFormat::Json,
        );
        assert_eq!(message.id.as_str(), "1-0");
        assert!(message.data.is_empty());
        assert!(message.message().is_none());
    }

    #[test]
    fn test_received_bincode_is_presented_as_json() {
        let envelope = Envelope::new("body", BTreeMap::from([("k".to_string(), "v".to_string())]));
        let raw = envelope.encode(WireFormat::Bincode).unwrap();
        let message = received(
            StreamEntry {
                id: "1-0".to_string(),
                fields: Some(BTreeMap::from([(MESSAGE_FIELD.to_string(), raw)])),
            },
            WireFormat::Bincode,
        );
        assert_eq!(message.message(), Some(r#"{"body":"body","headers":{"k":"v"}}"#));
    }
}
