use anyhow::{anyhow, Context};
use mongodb::bson::Bson;
use mongodb::Client;
use shardshift::metadata::MongoMetadataStore;
use shardshift::migration::{do_migration, MigrationRequest};
use shardshift::topology::Location;
use shardshift::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))
        .map_err(|reason| anyhow!("{}\n\n{}", reason, USAGE))?;

    let config = Config::load(args.config_path.as_deref())
        .await
        .map_err(|e| anyhow!("failed to load configuration: {}", e))?;

    init_tracing(&config)?;
    info!("Starting Shardshift v{}", shardshift::VERSION);

    let metadata_location = config.metadata_location();
    let metadata_cluster = config
        .clusters
        .get(&metadata_location.cluster)
        .ok_or_else(|| anyhow!("metadata cluster {} is not configured", metadata_location.cluster))?;
    let metadata_client = Client::with_uri_str(&metadata_cluster.uri)
        .await
        .context("connecting to the metadata cluster")?;
    let store = MongoMetadataStore::new(
        metadata_client.database(&metadata_location.database),
        Duration::from_millis(config.migration.caching_duration_ms),
    );

    let shard_key = parse_shard_key(&args.shard_key);
    let new_location: Location = args
        .new_location
        .parse()
        .context("parsing the new location")?;

    let mut request = MigrationRequest::new(args.collection, shard_key, new_location);
    request.insert_throttle = Duration::from_millis(
        args.insert_throttle_ms
            .unwrap_or(config.migration.insert_throttle_ms),
    );
    request.delete_throttle = Duration::from_millis(
        args.delete_throttle_ms
            .unwrap_or(config.migration.delete_throttle_ms),
    );
    request.insert_batch_size = args
        .insert_batch_size
        .unwrap_or(config.migration.insert_batch_size);
    request.delete_batch_size = args
        .delete_batch_size
        .unwrap_or(config.migration.delete_batch_size);

    let status_interval = Duration::from_secs(
        args.status_interval_secs
            .unwrap_or(config.migration.status_interval_secs),
    );

    let manager = do_migration(config.clusters.clone(), Arc::new(store), request).await?;
    manager.block_until_finished(status_interval).await?;
    manager.print_status();

    Ok(())
}

const USAGE: &str = "Usage: shardshift [OPTIONS] <collection> <shard_key> <new_location>

Moves the shard with the given key to <new_location> (cluster/database).

Options:
  --config <path>                Configuration file (default: config/default.toml)
  --insert-throttle-ms <ms>      Pause after each copy batch
  --delete-throttle-ms <ms>      Pause after each delete batch
  --insert-batch-size <n>        Documents per copy bulk write
  --delete-batch-size <n>        Documents per delete batch
  --status-interval-secs <secs>  Seconds between status lines";

struct CliArgs {
    config_path: Option<PathBuf>,
    collection: String,
    shard_key: String,
    new_location: String,
    insert_throttle_ms: Option<u64>,
    delete_throttle_ms: Option<u64>,
    insert_batch_size: Option<usize>,
    delete_batch_size: Option<usize>,
    status_interval_secs: Option<u64>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CliArgs, String> {
    let mut positional: Vec<String> = Vec::new();
    let mut config_path = None;
    let mut insert_throttle_ms = None;
    let mut delete_throttle_ms = None;
    let mut insert_batch_size = None;
    let mut delete_batch_size = None;
    let mut status_interval_secs = None;

    while let Some(arg) = args.next() {
        let mut flag_value = |name: &str| {
            args.next()
                .ok_or_else(|| format!("{} requires a value", name))
        };
        match arg.as_str() {
            "--config" => config_path = Some(PathBuf::from(flag_value("--config")?)),
            "--insert-throttle-ms" => {
                insert_throttle_ms = Some(parse_number(&flag_value("--insert-throttle-ms")?)?)
            }
            "--delete-throttle-ms" => {
                delete_throttle_ms = Some(parse_number(&flag_value("--delete-throttle-ms")?)?)
            }
            "--insert-batch-size" => {
                insert_batch_size = Some(parse_number(&flag_value("--insert-batch-size")?)? as usize)
            }
            "--delete-batch-size" => {
                delete_batch_size = Some(parse_number(&flag_value("--delete-batch-size")?)? as usize)
            }
            "--status-interval-secs" => {
                status_interval_secs = Some(parse_number(&flag_value("--status-interval-secs")?)?)
            }
            flag if flag.starts_with("--") => return Err(format!("unknown option {}", flag)),
            _ => positional.push(arg),
        }
    }

    if positional.len() != 3 {
        return Err("expected <collection> <shard_key> <new_location>".to_string());
    }
    let mut positional = positional.into_iter();

    Ok(CliArgs {
        config_path,
        collection: positional.next().unwrap_or_default(),
        shard_key: positional.next().unwrap_or_default(),
        new_location: positional.next().unwrap_or_default(),
        insert_throttle_ms,
        delete_throttle_ms,
        insert_batch_size,
        delete_batch_size,
        status_interval_secs,
    })
}

fn parse_number(raw: &str) -> Result<u64, String> {
    raw.parse::<u64>()
        .map_err(|_| format!("{} is not a number", raw))
}

/// Shard keys are usually integers or strings; anything non-numeric is taken
/// as a string key
fn parse_shard_key(raw: &str) -> Bson {
    match raw.parse::<i64>() {
        Ok(n) => Bson::Int64(n),
        Err(_) => Bson::String(raw.to_string()),
    }
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.format == "json" {
        let subscriber = fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = fmt().with_env_filter(filter).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args<'a>(raw: &'a [&'a str]) -> impl Iterator<Item = String> + 'a {
        raw.iter().map(|s| s.to_string())
    }

    #[test]
    fn test_parse_positional_args() {
        let parsed = parse_args(args(&["users", "7", "B/appdb"])).unwrap();
        assert_eq!(parsed.collection, "users");
        assert_eq!(parsed.shard_key, "7");
        assert_eq!(parsed.new_location, "B/appdb");
        assert!(parsed.insert_throttle_ms.is_none());
    }

    #[test]
    fn test_parse_flags() {
        let parsed = parse_args(args(&[
            "--insert-batch-size",
            "250",
            "users",
            "7",
            "B/appdb",
            "--delete-throttle-ms",
            "40",
        ]))
        .unwrap();
        assert_eq!(parsed.insert_batch_size, Some(250));
        assert_eq!(parsed.delete_throttle_ms, Some(40));
    }

    #[test]
    fn test_missing_positionals_rejected() {
        assert!(parse_args(args(&["users", "7"])).is_err());
        assert!(parse_args(args(&["users", "7", "B/appdb", "extra"])).is_err());
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(parse_args(args(&["--frobnicate", "users", "7", "B/appdb"])).is_err());
    }

    #[test]
    fn test_shard_key_parsing() {
        assert_eq!(parse_shard_key("7"), Bson::Int64(7));
        assert_eq!(parse_shard_key("tenant-a"), Bson::String("tenant-a".to_string()));
    }
}
