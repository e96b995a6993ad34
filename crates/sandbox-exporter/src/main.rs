use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use sandbox_bucket::{S3Config, S3SandboxStore};
use sandbox_core::exporter::Exporter;
use sandbox_core::types::{
    CountSummary, ExportRequest, OutputFormat, RunSummary, DEFAULT_MAX_ROWS_PER_FILE,
    DEFAULT_OUTPUT_CONVENTION,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Export ITS sandbox data from a date range to merged CSV or newline-JSON files",
    long_about = None
)]
struct Cli {
    /// Write progress to sandbox-exporter.log instead of stderr
    #[arg(long, global = true)]
    log: bool,

    /// Verbose progress and query cost reporting
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export matching records to local files
    Export(ExportArgs),
    /// Count matching records without writing any files
    Count(CountArgs),
}

#[derive(Args, Debug)]
struct ConnectionArgs {
    /// Name of the S3 bucket holding the sandbox data
    #[arg(long, default_value = "usdot-its-cvpilot-public-data")]
    bucket: String,

    /// AWS region of the bucket
    #[arg(long, default_value = "us-east-1")]
    region: String,

    /// AWS profile from the shared credentials file, if not the default
    #[arg(long)]
    aws_profile: Option<String>,

    /// Custom endpoint URL for S3-compatible stores
    #[arg(long)]
    endpoint_url: Option<String>,

    /// Per-request timeout in seconds for remote calls
    #[arg(long)]
    request_timeout: Option<u64>,
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// Pilot name (wydot, thea, nycdot)
    #[arg(long, default_value = "wydot")]
    pilot: String,

    /// Message type (bsm, tim, spat)
    #[arg(long, default_value = "tim")]
    message_type: String,

    /// Starting generatedAt date of the data, YYYY-MM-DD
    #[arg(long)]
    sdate: NaiveDate,

    /// Ending generatedAt date (exclusive), YYYY-MM-DD; defaults to one day
    /// after the start date
    #[arg(long)]
    edate: Option<NaiveDate>,

    /// Fields to retrieve, comma delimited, with the record bound to `s`
    /// (e.g. `s.metadata,s.payload.coreData`)
    #[arg(long)]
    output_fields: Option<String>,

    /// WHERE clause of the pushdown query, with the record bound to `s`
    /// (e.g. `s.metadata.bsmSource='RV'`)
    #[arg(long = "where")]
    where_clause: Option<String>,

    /// Maximum number of records to return across all objects
    #[arg(long)]
    limit: Option<u64>,

    /// Retries per object before it is skipped
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Treat a date range matching zero objects as an error
    #[arg(long)]
    fail_on_empty: bool,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(flatten)]
    query: QueryArgs,

    /// Naming convention for output files; {pilot}, {message_type}, {sdate}
    /// and {edate} are substituted and a file number is always appended
    #[arg(long, default_value = DEFAULT_OUTPUT_CONVENTION)]
    output_convention: String,

    /// Export newline-delimited JSON instead of flattened CSV
    #[arg(long)]
    json: bool,

    /// Directory for output files
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Maximum data rows per output file before splitting
    #[arg(long, default_value_t = DEFAULT_MAX_ROWS_PER_FILE)]
    max_rows_per_file: usize,

    /// Bundle the output files into a single zip archive
    #[arg(long)]
    zip: bool,
}

#[derive(Args, Debug)]
struct CountArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(flatten)]
    query: QueryArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log, cli.verbose)?;

    match cli.command {
        Command::Export(args) => run_export(args, cli.verbose).await,
        Command::Count(args) => run_count(args, cli.verbose).await,
    }
}

async fn run_export(args: ExportArgs, verbose: bool) -> Result<()> {
    let request = export_request(&args);
    info!(
        pilot = %request.pilot,
        message_type = %request.message_type,
        start = %request.start_date,
        end = %request.resolved_end_date(),
        "starting export"
    );

    let exporter = connect(&args.connection).await?;
    let summary = exporter
        .export(&request)
        .await
        .context("export did not complete")?;
    print_export_summary(&summary, verbose);
    Ok(())
}

async fn run_count(args: CountArgs, verbose: bool) -> Result<()> {
    let mut request = ExportRequest::new(&args.query.pilot, &args.query.message_type, args.query.sdate);
    apply_query_args(&mut request, &args.query);

    let exporter = connect(&args.connection).await?;
    let summary = exporter
        .count(&request)
        .await
        .context("count did not complete")?;
    print_count_summary(&summary, verbose);
    Ok(())
}

async fn connect(connection: &ConnectionArgs) -> Result<Exporter> {
    let config = S3Config {
        bucket: connection.bucket.clone(),
        region: connection.region.clone(),
        profile: connection.aws_profile.clone(),
        endpoint: connection.endpoint_url.clone(),
        request_timeout: connection.request_timeout.map(Duration::from_secs),
        ..S3Config::default()
    };
    let store = S3SandboxStore::new(config)
        .await
        .context("failed to initialize the S3 client")?;
    Ok(Exporter::new(Arc::new(store)))
}

fn export_request(args: &ExportArgs) -> ExportRequest {
    let mut request = ExportRequest::new(&args.query.pilot, &args.query.message_type, args.query.sdate);
    apply_query_args(&mut request, &args.query);
    request.format = if args.json {
        OutputFormat::JsonLines
    } else {
        OutputFormat::Csv
    };
    request.output_convention = args.output_convention.clone();
    request.output_dir = args.output_dir.clone();
    request.max_rows_per_file = args.max_rows_per_file;
    request.zip_output = args.zip;
    request
}

fn apply_query_args(request: &mut ExportRequest, query: &QueryArgs) {
    request.end_date = query.edate;
    request.where_clause = query.where_clause.clone();
    request.output_fields = query.output_fields.clone();
    request.limit = query.limit;
    request.max_retries = query.max_retries;
    request.fail_on_empty = query.fail_on_empty;
}

fn init_tracing(log_to_file: bool, verbose: bool) -> Result<()> {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if log_to_file {
        let file = std::fs::File::create("sandbox-exporter.log")
            .context("failed to create log file")?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn print_export_summary(summary: &RunSummary, verbose: bool) {
    println!("\n--- Export Summary ---");
    println!("  Objects enumerated: {}", summary.objects_listed);
    println!("  ✅ Objects queried: {}", summary.objects_queried);
    println!("  ⚠️  Objects failed: {}", summary.objects_failed);
    println!("  Records written: {}", summary.records_written);
    if let Some(archive) = &summary.archive {
        println!(
            "  Output zip file containing {} files:\n    {}",
            summary.files.len(),
            archive.display()
        );
    } else if summary.files.is_empty() {
        println!("  No output files produced");
    } else {
        println!("  Output files:");
        for file in &summary.files {
            println!("    {}", file.display());
        }
    }
    if verbose {
        print_cost_estimate(
            summary.bytes_scanned,
            summary.bytes_returned,
            summary.objects_queried + summary.objects_failed,
        );
    }
}

fn print_count_summary(summary: &CountSummary, verbose: bool) {
    println!("\n--- Count Summary ---");
    println!("  Objects enumerated: {}", summary.objects_listed);
    println!("  ✅ Objects queried: {}", summary.objects_queried);
    println!("  ⚠️  Objects failed: {}", summary.objects_failed);
    println!("  Records matched: {}", summary.total);
    if verbose {
        println!("  (count queries scan full objects; see --verbose export runs for byte totals)");
    }
}

// Published S3 SELECT pricing, per GB scanned/returned and per 1000 requests.
const SCAN_PRICE_PER_GIB: f64 = 0.002;
const RETURN_PRICE_PER_GIB: f64 = 0.0007;
const REQUEST_PRICE_PER_THOUSAND: f64 = 0.0004;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn print_cost_estimate(bytes_scanned: u64, bytes_returned: u64, requests: usize) {
    let scan_cost = SCAN_PRICE_PER_GIB * bytes_scanned as f64 / GIB;
    let return_cost = RETURN_PRICE_PER_GIB * bytes_returned as f64 / GIB;
    let request_cost = REQUEST_PRICE_PER_THOUSAND * requests as f64 / 1000.0;
    println!(
        "  Estimated query cost: ${:.4} (scan ${:.4}, return ${:.4}, requests ${:.4})",
        scan_cost + return_cost + request_cost,
        scan_cost,
        return_cost,
        request_cost
    );
}
