#[path = "../src/test_support.rs"]
mod test_support;

use std::sync::Arc;

use tally::config::EventsConfig;
use tally::event::{EventLog, MemoryEventLog, AGGREGATION_GROUP};
use tally::schema::keys;
use tally::{AggregationConsumer, CounterEvent, KvStore, MalformedEventPolicy, MemoryStore, Metric};
use test_support::{memory_counters, settle};

#[test]
fn redelivered_events_are_counted_once() -> anyhow::Result<()> {
    let counters = memory_counters()?;
    counters.service.like("post", "42", 7)?;
    counters.aggregation_consumer().drain()?;

    // Rewind the aggregation group, as after a consumer crash before commit.
    counters.log.seek_to_earliest(AGGREGATION_GROUP)?;
    let stats = counters.aggregation_consumer().drain()?;
    assert_eq!(stats.applied, 0);
    assert_eq!(stats.duplicates, 1);

    counters.flusher().flush_once()?;
    assert_eq!(
        counters.service.get_counts("post", "42", &["like"])?[&Metric::Like],
        1
    );
    Ok(())
}

#[test]
fn per_entity_order_is_preserved() -> anyhow::Result<()> {
    let log = MemoryEventLog::new(4);
    let mut partitions = Vec::new();
    for (user, add) in [(1, true), (1, false), (1, true)] {
        let event = CounterEvent::new("post", "ordered", Metric::Like, user, add);
        partitions.push(log.append(&event.entity_id, event.to_payload()?)?);
    }
    assert!(partitions.windows(2).all(|w| w[0].0 == w[1].0 && w[0].1 < w[1].1));

    let deltas: Vec<i32> = log
        .fetch("reader", partitions[0].0, 10)?
        .iter()
        .map(|entry| CounterEvent::from_payload(&entry.payload).map(|e| e.delta))
        .collect::<Result<_, _>>()?;
    assert_eq!(deltas, vec![1, -1, 1]);
    Ok(())
}

fn log_with_garbage() -> anyhow::Result<Arc<dyn EventLog>> {
    let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new(1));
    let good = CounterEvent::new("post", "m", Metric::Fav, 1, true);
    log.append("m", good.to_payload()?)?;
    log.append("m", b"{\"entityType\":\"post\"".to_vec())?;
    let later = CounterEvent::new("post", "m", Metric::Fav, 2, true);
    log.append("m", later.to_payload()?)?;
    Ok(log)
}

#[test]
fn malformed_payloads_are_skipped_by_default() -> anyhow::Result<()> {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let log = log_with_garbage()?;
    let consumer = AggregationConsumer::new(store.clone(), log.clone(), &EventsConfig::default());
    let stats = consumer.drain()?;
    assert_eq!((stats.applied, stats.skipped, stats.failed), (2, 1, 0));
    assert_eq!(log.lag(AGGREGATION_GROUP)?, 0);
    assert_eq!(
        store.hash_get_all(&keys::bucket("post", "m"))?,
        vec![("1".to_string(), 2)]
    );
    Ok(())
}

#[test]
fn retry_policy_stalls_on_malformed_payload() -> anyhow::Result<()> {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let log = log_with_garbage()?;
    let consumer = AggregationConsumer::with_policy(
        store.clone(),
        log.clone(),
        &EventsConfig::default(),
        MalformedEventPolicy::Retry,
    );
    let stats = consumer.drain()?;
    assert_eq!((stats.applied, stats.failed), (1, 1));
    assert_eq!(log.lag(AGGREGATION_GROUP)?, 2);

    // Still stuck on the same payload next time.
    let stats = consumer.poll_once()?;
    assert_eq!((stats.applied, stats.failed), (0, 1));
    Ok(())
}

#[test]
fn replay_rebuilds_lost_records_from_the_log() -> anyhow::Result<()> {
    let counters = memory_counters()?;
    for user in 0..6 {
        counters.service.like("post", "r", user)?;
    }
    counters.service.unlike("post", "r", 0)?;
    counters.service.fav("post", "r", 3)?;
    settle(&counters)?;

    // Lose the record; replay folds every event straight back in.
    counters.store.delete(&keys::record("post", "r"))?;
    let stats = counters.replay().run_to_end()?;
    assert_eq!(stats.applied, 8);

    let batch = counters
        .service
        .get_counts_batch("post", &["r"], &["like", "fav"])?;
    assert_eq!(batch["r"][&Metric::Like], 5);
    assert_eq!(batch["r"][&Metric::Fav], 1);
    Ok(())
}

#[test]
fn listeners_see_exactly_the_published_events() -> anyhow::Result<()> {
    let counters = memory_counters()?;
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    counters
        .service
        .add_listener(Arc::new(move |event: &CounterEvent| {
            sink.lock().push((event.metric, event.delta));
        }));

    counters.service.like("post", "l", 1)?;
    counters.service.like("post", "l", 1)?;
    counters.service.unfav("post", "l", 1)?;
    counters.service.fav("post", "l", 1)?;
    counters.service.unlike("post", "l", 1)?;

    assert_eq!(
        *seen.lock(),
        vec![(Metric::Like, 1), (Metric::Fav, 1), (Metric::Like, -1)]
    );
    assert_eq!(counters.log.lag(AGGREGATION_GROUP)?, 3);
    Ok(())
}
