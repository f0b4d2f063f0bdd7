//! s3-cli - Parallel, resumable S3 transfers from the command line

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use s3_cli::config::{normalize_endpoint, parse_byte_size, Config, ConfigLoader};
use s3_cli::s3::{ObjectLocation, ObjectSummary, S3Client};
use s3_cli::transfer::session::PartErrorSummary;
use s3_cli::transfer::{
    Direction, FailureSummary, TransferControl, TransferCoordinator, TransferRequest,
    TransferResult, TransferSettings,
};
use s3_cli::transport::{RetryPolicy, Transport};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// s3-cli - Upload, download and inspect objects in S3-compatible storage
#[derive(Parser, Debug)]
#[command(name = "s3-cli")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "S3_CLI_CONFIG")]
    config: Option<PathBuf>,

    /// S3 endpoint (https:// is assumed when no scheme is given)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Signing region
    #[arg(long, global = true)]
    region: Option<String>,

    /// Default bucket for bare keys
    #[arg(short, long, global = true)]
    bucket: Option<String>,

    /// Log level or filter (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Default)]
struct TransferArgs {
    /// Part size, e.g. 8MiB
    #[arg(long, value_parser = parse_byte_size)]
    part_size: Option<u64>,

    /// Parts in flight at once
    #[arg(long)]
    parallel: Option<usize>,

    /// Objects below this size use a single request, e.g. 16MiB
    #[arg(long, value_parser = parse_byte_size)]
    threshold: Option<u64>,

    /// Attempts per request, including the first
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Ignore and do not write resume journals
    #[arg(long)]
    no_resume: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file
    Upload {
        /// Local file
        local: PathBuf,
        /// s3://bucket/key, s3://bucket/prefix/ or a key in the default bucket
        dest: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Download an object
    Download {
        /// s3://bucket/key or a key in the default bucket
        src: String,
        /// Local file or existing directory
        local: PathBuf,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Show object metadata
    Info {
        src: String,
    },
    /// Delete an object
    Delete {
        src: String,
    },
    /// List objects in the default bucket
    List {
        #[arg(long)]
        prefix: Option<String>,
        /// Include size, ETag and last-modified
        #[arg(long)]
        long: bool,
    },
    /// List objects whose key contains NAME
    Find {
        name: String,
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        long: bool,
    },
}

#[derive(Serialize)]
struct ObjectInfoOutput<'a> {
    bucket: &'a str,
    key: &'a str,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
}

#[derive(Serialize)]
struct TransferSummary {
    direction: String,
    source: String,
    destination: String,
    mode: String,
    state: String,
    size: u64,
    bytes_transferred: u64,
    #[serde(skip_serializing_if = "is_zero")]
    resumed_bytes: u64,
    duration_secs: f64,
    parts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<FailureSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    part_errors: Vec<PartErrorSummary>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl From<&TransferResult> for TransferSummary {
    fn from(result: &TransferResult) -> Self {
        let remote = ObjectLocation::new(&result.bucket, &result.key).to_string();
        let local = result.local_path.display().to_string();
        let (source, destination) = match result.direction {
            Direction::Upload => (local, remote),
            Direction::Download => (remote, local),
        };
        Self {
            direction: result.direction.to_string(),
            source,
            destination,
            mode: result.mode.as_str().to_string(),
            state: result.state.to_string(),
            size: result.object_size,
            bytes_transferred: result.bytes_transferred,
            resumed_bytes: result.resumed_bytes,
            duration_secs: (result.duration.as_secs_f64() * 1000.0).round() / 1000.0,
            parts: format!("{}/{}", result.parts_completed, result.parts_total),
            etag: result.etag.clone(),
            error: result.failure(),
            part_errors: result.part_errors.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;
    apply_global_overrides(&mut config, &cli);
    config.validate().context("Invalid configuration")?;

    s3_cli::logging::init_logging(&config.logging)?;
    info!("s3-cli v{}", s3_cli::VERSION);
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {:?}", path);
    }

    let transport = Arc::new(Transport::new(config.http.to_transport_config())?);
    let client = Arc::new(S3Client::from_config(&config.s3, transport)?);

    let outcome = run(cli.command, &config, client).await;

    if let Some(path) = &config.metrics.textfile {
        if let Err(e) = s3_cli::metrics::write_textfile(path) {
            warn!(path = %path.display(), error = %e, "Failed to write metrics textfile");
        }
    }
    outcome
}

fn apply_global_overrides(config: &mut Config, cli: &Cli) {
    if let Some(endpoint) = &cli.endpoint {
        config.s3.endpoint = Some(normalize_endpoint(endpoint));
    }
    if let Some(region) = &cli.region {
        config.s3.region = region.clone();
    }
    if let Some(bucket) = &cli.bucket {
        config.s3.bucket = Some(bucket.clone());
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }
}

fn apply_transfer_overrides(config: &Config, args: &TransferArgs) -> TransferSettings {
    let mut transfer = config.transfer.clone();
    let mut retry = config.retry.clone();
    if let Some(part_size) = args.part_size {
        transfer.part_size = part_size;
    }
    if let Some(parallel) = args.parallel {
        transfer.max_parallel_parts = parallel;
    }
    if let Some(threshold) = args.threshold {
        transfer.multipart_threshold = threshold;
    }
    if let Some(attempts) = args.max_attempts {
        retry.max_attempts = attempts;
    }
    if args.no_resume {
        transfer.resume = false;
    }
    TransferSettings::from_config(&transfer, &retry)
}

async fn run(command: Command, config: &Config, client: Arc<S3Client>) -> anyhow::Result<()> {
    let default_bucket = config.s3.bucket.as_deref();
    let policy = config.retry.to_policy();

    match command {
        Command::Upload {
            local,
            dest,
            transfer,
        } => {
            let name = local
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("'{}' has no file name", local.display()))?;
            let dest = ObjectLocation::parse(&dest, default_bucket)?.join_if_prefix(name);
            let settings = apply_transfer_overrides(config, &transfer);
            let request = TransferRequest::upload(dest.bucket, dest.key, local);
            run_transfer(client, settings, request).await
        }
        Command::Download {
            src,
            local,
            transfer,
        } => {
            let src = ObjectLocation::parse(&src, default_bucket)?;
            if src.is_prefix() {
                bail!("'{}' is a prefix, not an object", src);
            }
            let settings = apply_transfer_overrides(config, &transfer);
            let request = TransferRequest::download(src.bucket, src.key, local);
            run_transfer(client, settings, request).await
        }
        Command::Info { src } => {
            let src = object_location(&src, default_bucket)?;
            let info = policy
                .run("head_object", || client.head_object(&src.bucket, &src.key))
                .await
                .with_context(|| format!("Failed to read metadata of {}", src))?;
            print_yaml(&ObjectInfoOutput {
                bucket: &src.bucket,
                key: &src.key,
                size: info.size,
                etag: info.etag,
                last_modified: info.last_modified,
                content_type: info.content_type,
            })
        }
        Command::Delete { src } => {
            let src = object_location(&src, default_bucket)?;
            policy
                .run("delete_object", || client.delete_object(&src.bucket, &src.key))
                .await
                .with_context(|| format!("Failed to delete {}", src))?;
            info!(bucket = %src.bucket, key = %src.key, "Deleted object");
            Ok(())
        }
        Command::List { prefix, long } => {
            let objects = list(&client, default_bucket, prefix.as_deref(), &policy).await?;
            print_listing(objects, long)
        }
        Command::Find { name, prefix, long } => {
            let objects = list(&client, default_bucket, prefix.as_deref(), &policy)
                .await?
                .into_iter()
                .filter(|o| o.key.contains(&name))
                .collect();
            print_listing(objects, long)
        }
    }
}

fn object_location(input: &str, default_bucket: Option<&str>) -> anyhow::Result<ObjectLocation> {
    let location = ObjectLocation::parse(input, default_bucket)?;
    if location.key.is_empty() {
        bail!("'{}' does not name an object", input);
    }
    Ok(location)
}

async fn list(
    client: &S3Client,
    bucket: Option<&str>,
    prefix: Option<&str>,
    policy: &RetryPolicy,
) -> anyhow::Result<Vec<ObjectSummary>> {
    let bucket = bucket.context("No bucket configured (use --bucket or S3_BUCKET_NAME)")?;
    let objects = client
        .list_objects(bucket, prefix, policy)
        .await
        .with_context(|| format!("Failed to list bucket '{}'", bucket))?;
    Ok(objects)
}

fn print_listing(objects: Vec<ObjectSummary>, long: bool) -> anyhow::Result<()> {
    if long {
        print_yaml(&objects)
    } else {
        let keys: Vec<&str> = objects.iter().map(|o| o.key.as_str()).collect();
        print_yaml(&keys)
    }
}

fn print_yaml<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(value)?);
    Ok(())
}

async fn run_transfer(
    client: Arc<S3Client>,
    settings: TransferSettings,
    request: TransferRequest,
) -> anyhow::Result<()> {
    let coordinator = TransferCoordinator::new(client, settings);
    let handle = coordinator.start(request).await?;

    let progress = tokio::spawn(report_progress(handle.control()));
    let interrupt = {
        let control = handle.control();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling transfer");
                control.cancel();
            }
        })
    };

    let joined = handle.join().await;
    progress.abort();
    interrupt.abort();

    let result = joined?;
    print_yaml(&TransferSummary::from(&result))?;
    result.ensure_completed()?;
    Ok(())
}

async fn report_progress(control: TransferControl) {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let progress = control.progress();
        if progress.state.is_terminal() {
            break;
        }
        let percent = if progress.bytes_total == 0 {
            100.0
        } else {
            progress.bytes_completed as f64 * 100.0 / progress.bytes_total as f64
        };
        info!(
            parts = %format!("{}/{}", progress.parts_completed, progress.parts_total),
            bytes_completed = progress.bytes_completed,
            bytes_total = progress.bytes_total,
            percent = %format!("{:.1}", percent),
            "Transfer progress"
        );
    }
}
