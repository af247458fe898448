//! Setup, teardown and settlement.

use crate::error::{QueueError, Result};
use crate::metrics::QueueMetrics;
use crate::redis::StreamBackend;

use super::super::models::EntryId;
use super::{settle, Connection};

/// Entries counted per page when the server does not report group lag.
const COUNT_PAGE: usize = 1000;

impl<B: StreamBackend> Connection<B> {
    /// Create the stream and the consumer group. Safe to call repeatedly.
    ///
    /// Refuses to run when deleting after ack/reject is enabled and another
    /// group reads the same stream, since deletes would remove entries that
    /// group has not consumed yet.
    pub async fn setup(&mut self) -> Result<()> {
        self.establish().await?;

        let options = &self.config.options;
        let created = self
            .backend
            .create_group(&options.stream, &options.group)
            .await;
        match created {
            Err(e) if e.is_busy_group() => {
                self.backend.take_last_error();
                tracing::debug!(
                    stream = %options.stream,
                    group = %options.group,
                    "Consumer group already exists"
                );
            }
            other => settle(&mut self.backend, "xgroup", other, &options.stream)?,
        }

        if options.delete_after_ack || options.delete_after_reject {
            let result = self.backend.group_infos(&options.stream).await;
            let groups = settle(&mut self.backend, "xinfo", result, &options.stream)?;
            if groups.len() > 1 {
                return Err(QueueError::config(format!(
                    "More than one group exists for stream \"{}\", delete_after_ack and \
                     delete_after_reject cannot be enabled as it risks deleting messages \
                     before all groups could consume them.",
                    options.stream
                )));
            }
        }

        self.auto_setup = false;
        tracing::info!(
            stream = %options.stream,
            group = %options.group,
            "Stream and consumer group ready"
        );
        Ok(())
    }

    /// Delete the stream and the delay set.
    ///
    /// The next add/get runs setup again when auto-setup is enabled.
    pub async fn cleanup(&mut self) -> Result<()> {
        self.establish().await?;

        let keys = [self.config.options.stream.clone(), self.delay.key().to_string()];
        let result = self.backend.delete_keys(&keys).await;
        let removed = settle(&mut self.backend, "unlink", result, &keys[0])?;

        self.auto_setup = self.config.options.auto_setup;
        self.could_have_pending = true;
        self.next_claim_ms = 0;

        tracing::info!(
            stream = %self.config.options.stream,
            removed = removed,
            "Queue storage removed"
        );
        Ok(())
    }

    /// Acknowledge a message, then delete it when `delete_after_ack` is set.
    ///
    /// The ack is not undone if the delete fails; that case is reported as
    /// [`QueueError::Purge`].
    pub async fn ack(&mut self, id: &EntryId) -> Result<()> {
        self.establish().await?;

        let ids = [id.to_string()];
        let options = &self.config.options;
        let result = self.backend.ack(&options.stream, &options.group, &ids).await;
        let acked = settle(&mut self.backend, "xack", result, id.as_str())?;

        QueueMetrics::record_acked();
        tracing::debug!(id = %id, acked = acked, "Message acknowledged");

        if self.config.options.delete_after_ack {
            self.purge(id).await?;
        }
        Ok(())
    }

    /// Stop tracking a message, then delete it when `delete_after_reject` is set.
    ///
    /// Rejected messages are never requeued.
    pub async fn reject(&mut self, id: &EntryId) -> Result<()> {
        self.establish().await?;

        let ids = [id.to_string()];
        let options = &self.config.options;
        let result = self.backend.ack(&options.stream, &options.group, &ids).await;
        let settled = settle(&mut self.backend, "xack", result, id.as_str())?;

        QueueMetrics::record_rejected();
        tracing::debug!(id = %id, settled = settled, "Message rejected");

        if self.config.options.delete_after_reject {
            self.purge(id).await?;
        }
        Ok(())
    }

    async fn purge(&mut self, id: &EntryId) -> Result<()> {
        let ids = [id.to_string()];
        let result = self.backend.delete(&self.config.options.stream, &ids).await;
        match settle(&mut self.backend, "xdel", result, id.as_str()) {
            Ok(_) => Ok(()),
            Err(QueueError::Transport(reason)) => {
                QueueMetrics::record_purge_failure();
                tracing::warn!(id = %id, error = %reason, "Settled message could not be deleted");
                Err(QueueError::Purge {
                    id: id.to_string(),
                    reason,
                })
            }
            Err(other) => Err(other),
        }
    }

    /// Number of entries not yet delivered to this consumer group.
    pub async fn message_count(&mut self) -> Result<u64> {
        self.establish().await?;

        let options = &self.config.options;
        let infos = match self.backend.group_infos(&options.stream).await {
            Err(e) if e.is_missing() => {
                self.backend.take_last_error();
                return Ok(0);
            }
            other => settle(&mut self.backend, "xinfo", other, &options.stream)?,
        };

        let Some(group) = infos.into_iter().find(|g| g.name == options.group) else {
            return Ok(0);
        };
        if let Some(lag) = group.lag {
            return Ok(lag);
        }

        let mut count = 0u64;
        let mut cursor = group.last_delivered_id;
        loop {
            let result = self
                .backend
                .entries_after(&options.stream, &cursor, COUNT_PAGE)
                .await;
            let page = settle(&mut self.backend, "xrange", result, &options.stream)?;
            count += page.len() as u64;
            match page.last() {
                Some(last) if page.len() == COUNT_PAGE => cursor = last.clone(),
                _ => break,
            }
        }
        Ok(count)
    }
}
