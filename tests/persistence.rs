#[path = "../src/test_support.rs"]
mod test_support;

use tally::event::AGGREGATION_GROUP;
use tally::schema::keys;
use tally::{Counters, Metric, TallyConfig};
use tempfile::tempdir;
use test_support::{persistent_counters, settle};

#[test]
fn facts_records_and_offsets_survive_restart() -> anyhow::Result<()> {
    let dir = tempdir()?;
    {
        let counters = persistent_counters(dir.path())?;
        counters.service.like("post", "42", 7)?;
        counters.service.like("post", "42", 8)?;
        counters.service.fav("post", "42", 8)?;
        settle(&counters)?;
        // Published after the last flush, so it is still pending on restart.
        counters.service.like("post", "42", 9)?;
    }

    let counters = persistent_counters(dir.path())?;
    assert!(counters.service.is_liked("post", "42", 7)?);
    assert!(counters.service.is_faved("post", "42", 8)?);
    assert_eq!(counters.log.lag(AGGREGATION_GROUP)?, 1);

    let batch = counters
        .service
        .get_counts_batch("post", &["42"], &["like", "fav"])?;
    assert_eq!(batch["42"][&Metric::Like], 2);
    assert_eq!(batch["42"][&Metric::Fav], 1);

    settle(&counters)?;
    let counts = counters.service.get_counts("post", "42", &["like"])?;
    assert_eq!(counts[&Metric::Like], 3);
    Ok(())
}

#[test]
fn pending_buckets_survive_restart() -> anyhow::Result<()> {
    let dir = tempdir()?;
    {
        let counters = persistent_counters(dir.path())?;
        for user in 0..10 {
            counters.service.like("video", "v1", user)?;
        }
        counters.aggregation_consumer().drain()?;
    }

    let counters = persistent_counters(dir.path())?;
    assert_eq!(counters.store.hash_len(&keys::bucket("video", "v1"))?, 1);
    let stats = counters.flusher().flush_once()?;
    assert_eq!(stats.folded, 1);
    assert_eq!(
        counters.service.get_counts("video", "v1", &["like"])?[&Metric::Like],
        10
    );
    Ok(())
}

#[test]
fn partition_count_change_is_rejected() -> anyhow::Result<()> {
    let dir = tempdir()?;
    drop(persistent_counters(dir.path())?);

    let mut config = TallyConfig::persistent(dir.path());
    config.events.partitions += 1;
    assert!(Counters::open(config).is_err());
    Ok(())
}
