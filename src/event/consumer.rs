//! Group consumer over an [`EventLog`].
//!
//! Offsets are committed only after the apply callback succeeds, so a crash
//! between apply and commit redelivers the event. Idempotency is the apply
//! side's job (see the dedup guard on the bucket and record scripts).

use super::{CounterEvent, EventLog, LogEntry};
use crate::config::MalformedEventPolicy;
use crate::error::Result;
use std::ops::AddAssign;
use std::sync::Arc;
use tracing::{debug, warn};

/// What the apply callback did with one well-formed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Already applied by an earlier delivery.
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub applied: u64,
    pub duplicates: u64,
    /// Malformed payloads committed past.
    pub skipped: u64,
    /// Events left uncommitted for redelivery.
    pub failed: u64,
}

impl ConsumeStats {
    /// Entries whose offset was committed.
    pub fn committed(&self) -> u64 {
        self.applied + self.duplicates + self.skipped
    }
}

impl AddAssign for ConsumeStats {
    fn add_assign(&mut self, rhs: Self) {
        self.applied += rhs.applied;
        self.duplicates += rhs.duplicates;
        self.skipped += rhs.skipped;
        self.failed += rhs.failed;
    }
}

pub struct EventConsumer {
    log: Arc<dyn EventLog>,
    group: String,
    policy: MalformedEventPolicy,
    batch: usize,
}

impl EventConsumer {
    pub fn new(
        log: Arc<dyn EventLog>,
        group: impl Into<String>,
        policy: MalformedEventPolicy,
        batch: usize,
    ) -> Self {
        Self {
            log,
            group: group.into(),
            policy,
            batch: batch.max(1),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// Fetch and apply at most one batch from every partition.
    pub fn poll_once<F>(&self, mut apply: F) -> Result<ConsumeStats>
    where
        F: FnMut(&CounterEvent) -> Result<Outcome>,
    {
        let mut stats = ConsumeStats::default();
        for partition in 0..self.log.partitions() {
            let entries = self.log.fetch(&self.group, partition, self.batch)?;
            if entries.is_empty() {
                continue;
            }
            stats += self.apply_entries(partition, &entries, &mut apply)?;
        }
        Ok(stats)
    }

    /// Poll until every partition is caught up or a round makes no progress.
    pub fn drain<F>(&self, mut apply: F) -> Result<ConsumeStats>
    where
        F: FnMut(&CounterEvent) -> Result<Outcome>,
    {
        let mut total = ConsumeStats::default();
        loop {
            let round = self.poll_once(&mut apply)?;
            total += round;
            if round.committed() == 0 || round.failed > 0 {
                return Ok(total);
            }
        }
    }

    fn apply_entries<F>(
        &self,
        partition: u32,
        entries: &[LogEntry],
        apply: &mut F,
    ) -> Result<ConsumeStats>
    where
        F: FnMut(&CounterEvent) -> Result<Outcome>,
    {
        let mut stats = ConsumeStats::default();
        let mut next = None;
        for entry in entries {
            let event = match CounterEvent::from_payload(&entry.payload) {
                Ok(event) => event,
                Err(e) => match self.policy {
                    MalformedEventPolicy::SkipAndCommit => {
                        warn!(
                            group = %self.group,
                            partition,
                            offset = entry.offset,
                            error = %e,
                            "skipping malformed counter event"
                        );
                        stats.skipped += 1;
                        next = Some(entry.offset + 1);
                        continue;
                    }
                    MalformedEventPolicy::Retry => {
                        warn!(
                            group = %self.group,
                            partition,
                            offset = entry.offset,
                            error = %e,
                            "malformed counter event left for redelivery"
                        );
                        stats.failed += 1;
                        break;
                    }
                },
            };
            match apply(&event) {
                Ok(Outcome::Applied) => stats.applied += 1,
                Ok(Outcome::Duplicate) => {
                    debug!(event_id = %event.event_id, group = %self.group, "duplicate delivery");
                    stats.duplicates += 1;
                }
                Err(e) => {
                    warn!(
                        group = %self.group,
                        partition,
                        offset = entry.offset,
                        entity_type = %event.entity_type,
                        entity_id = %event.entity_id,
                        error = %e,
                        "failed to apply counter event"
                    );
                    stats.failed += 1;
                    break;
                }
            }
            next = Some(entry.offset + 1);
        }
        if let Some(next) = next {
            self.log.commit(&self.group, partition, next)?;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CounterError;
    use crate::event::MemoryEventLog;
    use crate::schema::Metric;

    fn log_with(payloads: &[Vec<u8>]) -> Arc<dyn EventLog> {
        let log = Arc::new(MemoryEventLog::new(1));
        for payload in payloads {
            log.append("42", payload.clone()).unwrap();
        }
        log
    }

    fn like(user: u64) -> Vec<u8> {
        CounterEvent::new("post", "42", Metric::Like, user, true)
            .to_payload()
            .unwrap()
    }

    #[test]
    fn test_commits_after_apply() {
        let log = log_with(&[like(1), like(2)]);
        let consumer = EventConsumer::new(log.clone(), "g", MalformedEventPolicy::default(), 10);
        let mut seen = Vec::new();
        let stats = consumer
            .poll_once(|e| {
                seen.push(e.user_id);
                Ok(Outcome::Applied)
            })
            .unwrap();
        assert_eq!(stats.applied, 2);
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(log.committed("g", 0).unwrap(), 2);
    }

    #[test]
    fn test_failed_apply_is_redelivered() {
        let log = log_with(&[like(1), like(2), like(3)]);
        let consumer = EventConsumer::new(log.clone(), "g", MalformedEventPolicy::default(), 10);
        let stats = consumer
            .poll_once(|e| {
                if e.user_id == 2 {
                    Err(CounterError::Unavailable("down".into()))
                } else {
                    Ok(Outcome::Applied)
                }
            })
            .unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(log.committed("g", 0).unwrap(), 1);

        let mut seen = Vec::new();
        consumer
            .drain(|e| {
                seen.push(e.user_id);
                Ok(Outcome::Applied)
            })
            .unwrap();
        assert_eq!(seen, vec![2, 3]);
    }

    #[test]
    fn test_malformed_policy() {
        let payloads = [like(1), b"garbage".to_vec(), like(2)];

        let skip_log = log_with(&payloads);
        let skip = EventConsumer::new(skip_log.clone(), "g", MalformedEventPolicy::SkipAndCommit, 10);
        let stats = skip.drain(|_| Ok(Outcome::Applied)).unwrap();
        assert_eq!((stats.applied, stats.skipped), (2, 1));
        assert_eq!(skip_log.lag("g").unwrap(), 0);

        let retry_log = log_with(&payloads);
        let retry = EventConsumer::new(retry_log.clone(), "g", MalformedEventPolicy::Retry, 10);
        let stats = retry.drain(|_| Ok(Outcome::Applied)).unwrap();
        assert_eq!((stats.applied, stats.failed), (1, 1));
        assert_eq!(retry_log.committed("g", 0).unwrap(), 1);
    }
}
