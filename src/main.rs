use clap::Parser;
use gedisub::{
    failure_count, CatalogClient, Credentials, DownloadOutcome, DownloadScheduler, Filter,
    Granule, HttpSubsetFetcher, Product, ProductSpec, RetryPolicy, ShutdownCoordinator,
    SubsetError, TimeRange, TokenProvider,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "gedisub")]
#[command(about = "Acquire subset GEDI granules from the NASA LP.DAAC subsetter", long_about = None)]
#[command(disable_version_flag = true)]
struct Args {
    /// GEDI products to retrieve (GEDI01_B, GEDI02_A, GEDI02_B)
    #[arg(value_name = "PRODUCT", required = true)]
    products: Vec<Product>,

    /// Working data directory (created if absent)
    #[arg(short = 'D', long, default_value = ".")]
    directory: PathBuf,

    /// Username for NASA Earthdata Login
    #[arg(short = 'U', long, env = "EARTHDATA_USERNAME")]
    user: Option<String>,

    /// Path to .netrc file for authentication
    #[arg(short = 'N', long)]
    netrc: Option<PathBuf>,

    /// Number of concurrent download workers
    #[arg(short = 'P', long = "np", default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    np: u16,

    /// Version of the dataset to use
    #[arg(short = 'v', long, default_value = "002")]
    version: String,

    /// Bounding box as "min_lat,min_lon,max_lat,max_lon"
    #[arg(short = 'B', long, conflicts_with = "polygon")]
    bbox: Option<String>,

    /// GeoJSON file whose first feature's ring bounds the query
    #[arg(short = 'p', long)]
    polygon: Option<PathBuf>,

    /// Time range as "start,end" ISO-8601 timestamps
    #[arg(short = 'T', long)]
    time: Option<String>,

    /// Permissions mode of the output files (octal)
    #[arg(short = 'M', long, default_value = "775", value_parser = parse_octal)]
    mode: u32,

    /// Re-download granules even when the output file already exists
    #[arg(long)]
    force: bool,

    /// Verbose output of processing
    #[arg(short = 'V', long)]
    verbose: bool,
}

fn parse_octal(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s, 8).map_err(|_| format!("invalid octal mode: {s}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("gedisub={}", log_level))
        .with_writer(std::io::stderr)
        .init();

    if args.bbox.is_none() && args.polygon.is_none() && args.time.is_none() {
        eprintln!("Error: supply at least one of --bbox, --polygon or --time");
        std::process::exit(2);
    }

    // Spatial and temporal filters are validated up front, before any
    // credential or network work
    let filter = match (&args.bbox, &args.polygon) {
        (Some(bbox), _) => Some(Filter::parse_bbox(bbox)?),
        (None, Some(path)) => Some(Filter::polygon_from_path(path)?),
        (None, None) => None,
    };
    let time_range = args.time.as_deref().map(TimeRange::parse).transpose()?;

    let netrc_path = args.netrc.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".netrc")
    });

    if !args.directory.exists() {
        std::fs::create_dir_all(&args.directory)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&args.directory, std::fs::Permissions::from_mode(args.mode))?;
        }
    }

    // Shared HTTP client; the Earthdata login round-trips through a
    // redirect and a session cookie
    let client = reqwest::Client::builder()
        .cookie_store(true)
        .timeout(std::time::Duration::from_secs(600))
        .connect_timeout(std::time::Duration::from_secs(20))
        .build()?;
    let policy = RetryPolicy::default();

    let credentials = Credentials::resolve(args.user.clone(), &netrc_path)?;
    let tokens = TokenProvider::login(client.clone(), credentials).await?;

    let catalog = CatalogClient::new(client.clone(), policy);
    let mut granules: Vec<Granule> = Vec::new();
    for product in &args.products {
        let spec = ProductSpec::new(*product, args.version.clone());
        info!(product = %spec.product, version = %spec.version, "Querying catalog for granules");
        match catalog.plan(&spec, filter.as_ref(), time_range.as_ref()).await {
            Ok(found) => granules.extend(found),
            Err(SubsetError::PartialCatalogResult {
                granules: partial,
                reason,
            }) => {
                warn!(
                    product = %spec.product,
                    granules = partial.len(),
                    "Catalog listing incomplete ({reason}); continuing with partial list"
                );
                granules.extend(partial);
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!(granules = granules.len(), "Query returned granules");

    if granules.is_empty() {
        println!("No granules matched the query");
        return Ok(());
    }

    // Ctrl+C stops dispatching new granules; in-flight transfers finish
    let shutdown = ShutdownCoordinator::shared();
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; finishing in-flight downloads");
                shutdown.request_shutdown();
            }
        });
    }

    let progress = if atty::is(atty::Stream::Stderr) {
        indicatif::ProgressBar::new(granules.len() as u64)
    } else {
        indicatif::ProgressBar::hidden()
    };
    progress.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}")
            .unwrap()
            .progress_chars("█▓▒░ "),
    );
    progress.set_message(format!("Downloading {} granule(s)", granules.len()));

    let fetcher = Arc::new(HttpSubsetFetcher::new(
        client,
        tokens,
        filter.as_ref(),
        time_range.as_ref(),
        args.mode,
    ));
    let scheduler = DownloadScheduler::new(args.np as usize, policy, shutdown)
        .with_force(args.force)
        .with_progress(progress.clone());
    let results = scheduler.run(granules, fetcher, &args.directory).await;

    let mut succeeded = 0usize;
    let mut skipped = 0usize;
    for result in &results {
        match &result.outcome {
            DownloadOutcome::Succeeded { path, bytes, .. } => {
                succeeded += 1;
                info!(granule = %result.granule_id, bytes, path = %path.display(), "Downloaded");
            }
            DownloadOutcome::Skipped { reason } => {
                skipped += 1;
                info!(granule = %result.granule_id, "Skipped: {reason}");
            }
            DownloadOutcome::Failed { kind, attempts } => {
                warn!(granule = %result.granule_id, attempts, "Failed: {kind}");
            }
        }
    }

    let failed = failure_count(&results);
    progress.finish_with_message(format!(
        "{succeeded} downloaded, {skipped} skipped, {failed} failed"
    ));

    if failed > 0 {
        eprintln!("Error: {failed} granule(s) failed to download");
        std::process::exit(1);
    }
    Ok(())
}
