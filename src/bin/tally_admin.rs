use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use tally::config::{ConfigOverrides, StoreBackend, StoreOverrides};
use tally::{Counters, Metric, TallyConfig};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: tally-admin <command> [options]

commands:
  get      --type T --id ID [--metrics like,fav]
  batch    --type T --ids ID,ID,... [--metrics like,fav]
  rebuild  --type T --id ID [--metrics like,fav]
  like | unlike | fav | unfav  --type T --id ID --user U
  flush    consume pending events, fold buckets and purge expired keys once
  replay   [--from-earliest]   fold the event log straight into records
  serve    run the consumer and flusher until ctrl-c

options:
  --config PATH     TOML config file
  --data-dir DIR    use the rocksdb backend rooted at DIR";

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn required(flag: &str) -> anyhow::Result<String> {
    parse_arg(flag).ok_or_else(|| anyhow!("{flag} is required\n\n{USAGE}"))
}

fn parse_metrics() -> Vec<Metric> {
    let names: Vec<String> = parse_arg("--metrics")
        .map(|raw| raw.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    Metric::parse_list(&names)
}

fn metric_names(metrics: &[Metric]) -> Vec<&'static str> {
    metrics.iter().map(|m| m.name()).collect()
}

fn load_config() -> anyhow::Result<TallyConfig> {
    let mut overrides = ConfigOverrides::default();
    if let Some(dir) = parse_arg("--data-dir") {
        overrides.store = Some(StoreOverrides {
            backend: Some(StoreBackend::Rocksdb),
            data_dir: Some(PathBuf::from(dir)),
        });
    }
    let config_path = parse_arg("--config");
    TallyConfig::load(config_path.as_deref(), overrides).context("failed to load configuration")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(command) = std::env::args().nth(1) else {
        bail!("{USAGE}");
    };
    let counters = Counters::open(load_config()?)?;

    match command.as_str() {
        "get" => {
            let entity_type = required("--type")?;
            let entity_id = required("--id")?;
            let metrics = parse_metrics();
            let names = metric_names(&metrics);
            let counts = counters
                .service
                .get_counts(&entity_type, &entity_id, names.as_slice())?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        "batch" => {
            let entity_type = required("--type")?;
            let ids: Vec<String> = required("--ids")?
                .split(',')
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
            let metrics = parse_metrics();
            let names = metric_names(&metrics);
            let counts = counters
                .service
                .get_counts_batch(&entity_type, ids.as_slice(), names.as_slice())?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        "rebuild" => {
            let entity_type = required("--type")?;
            let entity_id = required("--id")?;
            let counts = counters
                .service
                .rebuilder()
                .rebuild(&entity_type, &entity_id, &parse_metrics())?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        "like" | "unlike" | "fav" | "unfav" => {
            let entity_type = required("--type")?;
            let entity_id = required("--id")?;
            let user_id: u64 = required("--user")?
                .parse()
                .context("--user must be an unsigned integer")?;
            let metric = if command.ends_with("like") {
                Metric::Like
            } else {
                Metric::Fav
            };
            let add = !command.starts_with("un");
            let changed = counters
                .service
                .toggle(metric, &entity_type, &entity_id, user_id, add)?;
            println!("changed={changed}");
        }
        "flush" => {
            let consumed = counters.aggregation_consumer().drain()?;
            let flusher = counters.flusher();
            let flushed = flusher.flush_once()?;
            let purged = flusher.purge_expired()?;
            println!(
                "events applied={} duplicates={} skipped={} failed={}",
                consumed.applied, consumed.duplicates, consumed.skipped, consumed.failed
            );
            println!(
                "buckets={} folded={} cleared={} malformed={} skipped={} failures={}",
                flushed.buckets,
                flushed.folded,
                flushed.cleared,
                flushed.malformed,
                flushed.skipped,
                flushed.failures
            );
            println!("purged expired keys={purged}");
        }
        "replay" => {
            let replay = counters.replay();
            if has_flag("--from-earliest") {
                replay.reset()?;
            }
            let stats = replay.run_to_end()?;
            println!(
                "replayed applied={} duplicates={} skipped={} failed={} lag={}",
                stats.applied,
                stats.duplicates,
                stats.skipped,
                stats.failed,
                replay.lag()?
            );
        }
        "serve" => {
            let workers = counters.start_workers();
            tracing::info!(workers = workers.len(), "tally workers running, ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            workers.shutdown().await;
        }
        other => bail!("unknown command {other}\n\n{USAGE}"),
    }

    Ok(())
}
