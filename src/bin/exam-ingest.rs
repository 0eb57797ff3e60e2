//! CLI binary for exam-ingest.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `IngestConfig` / `MatchConfig` and prints results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use exam_ingest::{
    load_classlist, match_papers, AnchorSet, ArchiveGateway, BundleState, ContentDigest,
    HttpGateway, IngestConfig, IngestProgressCallback, Ingestor, MatchConfig, MatchRequest,
    Method, PaperDigits, ProgressCallback, PushGateway, RouteCategory, TieBreak,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Renders one progress bar per bundle and a log line per page.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(spinner_style);
        bar.set_prefix("Splitting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }
}

impl IngestProgressCallback for CliProgressCallback {
    fn on_bundle_start(&self, bundle: &str, total_pages: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
        self.bar.reset();
        self.bar.set_length(total_pages as u64);
        self.bar.set_style(style);
        self.bar.set_prefix(bundle.to_string());
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{bundle}: routing {total_pages} pages…"))
        ));
    }

    fn on_page_routed(&self, _bundle: &str, page: u32, category: RouteCategory) {
        let mark = match category {
            RouteCategory::Valid => green("✓"),
            RouteCategory::Unknown => yellow("?"),
            RouteCategory::WrongTest => red("✗"),
            RouteCategory::Duplicate => dim("="),
        };
        self.bar
            .println(format!("  {} Page {:>3}  {}", mark, page, dim(&category.to_string())));
        self.bar.inc(1);
    }

    fn on_page_error(&self, _bundle: &str, page: u32, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg = if error.chars().count() > 100 {
            let cut: String = error.chars().take(99).collect();
            format!("{cut}\u{2026}")
        } else {
            error.to_string()
        };
        self.bar
            .println(format!("  {} Page {:>3}  {}", red("!"), page, red(&msg)));
    }

    fn on_bundle_complete(&self, bundle: &str, total_pages: usize, archived: bool) {
        self.bar.finish_and_clear();
        if archived {
            eprintln!("{} {} {} pages archived", green("✔"), bold(bundle), total_pages);
        } else {
            eprintln!(
                "{} {} {} pages, not yet archived ({} errors); re-run or resolve to finish",
                cyan("⚠"),
                bold(bundle),
                total_pages,
                self.errors.load(Ordering::SeqCst)
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Ingest scanned bundles into ./workspace
  exam-ingest ingest --magic midterm-2026 --anchors anchors.json scans/*.pdf

  # Push to a remote marking server instead of the local archive
  exam-ingest ingest --magic midterm-2026 --push-url https://marking.example/api/pages scan_01.pdf

  # Propose student ids for every identified paper
  exam-ingest match --roster classlist.csv > predictions.json

  # Bundle overview
  exam-ingest status

  # Confirm that page 3 of scan_01 belongs to another assessment
  exam-ingest discard scan_01 3

ENVIRONMENT VARIABLES:
  EXAM_INGEST_WORKSPACE   Workspace directory (default: ./workspace)
  EXAM_INGEST_MAGIC       Magic code of the active assessment
  EXAM_INGEST_ANCHORS     ID-box anchor JSON file
  PDFIUM_LIB_PATH         Path to libpdfium (else ./ then the system search path)
  RUST_LOG                Override the log filter (e.g. exam_ingest=debug)
"#;

/// Ingest scanned exam bundles and match papers to students.
#[derive(Parser, Debug)]
#[command(
    name = "exam-ingest",
    version,
    about = "Ingest scanned exam bundles and match papers to students",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Workspace directory.
    #[arg(short, long, global = true, env = "EXAM_INGEST_WORKSPACE", default_value = "workspace")]
    workspace: PathBuf,

    /// Output JSON instead of human-readable text.
    #[arg(long, global = true, env = "EXAM_INGEST_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "EXAM_INGEST_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "EXAM_INGEST_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "EXAM_INGEST_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split, route and push one or more scanned PDF bundles.
    Ingest(IngestArgs),
    /// Propose a student for every identified paper.
    Match(MatchArgs),
    /// Show every known bundle and its page categories.
    Status,
    /// Confirm the discard of a wrong-test or unknown page.
    Discard {
        /// Bundle name (the PDF file stem).
        bundle: String,
        /// 1-based page number within the bundle.
        page: u32,
    },
    /// Print the SHA-256 content digest of a file.
    Hash {
        file: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct IngestArgs {
    /// Scanned PDF bundles.
    #[arg(required = true)]
    bundles: Vec<PathBuf>,

    /// Magic code of the active assessment.
    #[arg(long, env = "EXAM_INGEST_MAGIC")]
    magic: String,

    /// JSON file with per-version ID-box anchors.
    #[arg(long, env = "EXAM_INGEST_ANCHORS")]
    anchors: Option<PathBuf>,

    /// Page number (within a paper) that carries the ID box.
    #[arg(long, env = "EXAM_INGEST_ID_PAGE", default_value_t = 1)]
    id_page: u32,

    /// Digits in a student id.
    #[arg(long, env = "EXAM_INGEST_ID_LENGTH", default_value_t = 8)]
    id_length: usize,

    /// Longest rendered page edge in pixels.
    #[arg(long, env = "EXAM_INGEST_MAX_PIXELS", default_value_t = 2000,
          value_parser = clap::value_parser!(u32).range(200..=8000))]
    max_pixels: u32,

    /// Pages decoded concurrently.
    #[arg(short, long, env = "EXAM_INGEST_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Push retries per page.
    #[arg(long, env = "EXAM_INGEST_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Initial push retry delay in milliseconds.
    #[arg(long, env = "EXAM_INGEST_RETRY_BACKOFF_MS", default_value_t = 250)]
    retry_backoff_ms: u64,

    /// Push pages to this HTTP endpoint instead of the workspace archive.
    #[arg(long, env = "EXAM_INGEST_PUSH_URL")]
    push_url: Option<String>,

    /// HTTP push timeout in seconds.
    #[arg(long, env = "EXAM_INGEST_PUSH_TIMEOUT", default_value_t = 30)]
    push_timeout: u64,
}

#[derive(clap::Args, Debug)]
struct MatchArgs {
    /// Classlist CSV with an `id,name` header.
    #[arg(long, env = "EXAM_INGEST_ROSTER")]
    roster: PathBuf,

    /// Classifier output JSON. Default: the workspace's id_likelihoods.json.
    #[arg(long, env = "EXAM_INGEST_LIKELIHOODS")]
    likelihoods: Option<PathBuf>,

    /// CSV of already-identified papers with a `paper,id` header.
    #[arg(long, env = "EXAM_INGEST_PRENAMED")]
    prenamed: Option<PathBuf>,

    /// Cost above which a prediction is marked for review.
    #[arg(long, env = "EXAM_INGEST_REVIEW_THRESHOLD", default_value_t = 5.0)]
    threshold: f64,

    /// What to do with equal-cost optimal assignments.
    #[arg(long, env = "EXAM_INGEST_TIE_BREAK", value_enum, default_value = "flag-for-review")]
    tie_break: TieBreakArg,

    /// Skip the secondary greedy predictions.
    #[arg(long)]
    no_greedy: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum TieBreakArg {
    SolverOrder,
    FlagForReview,
}

impl From<TieBreakArg> for TieBreak {
    fn from(v: TieBreakArg) -> Self {
        match v {
            TieBreakArg::SolverOrder => TieBreak::SolverOrder,
            TieBreakArg::FlagForReview => TieBreak::FlagForReview,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet
        && !cli.no_progress
        && !cli.json
        && matches!(cli.command, Command::Ingest(_));
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Command::Ingest(args) => run_ingest(&cli, args, show_progress).await,
        Command::Match(args) => run_match(&cli, args),
        Command::Status => run_status(&cli).await,
        Command::Discard { bundle, page } => run_discard(&cli, bundle, *page).await,
        Command::Hash { file } => {
            let digest = ContentDigest::of_file(file)
                .await
                .with_context(|| format!("Failed to hash {}", file.display()))?;
            println!("{digest}  {}", file.display());
            Ok(())
        }
    }
}

async fn run_ingest(cli: &Cli, args: &IngestArgs, show_progress: bool) -> Result<()> {
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn IngestProgressCallback>)
    } else {
        None
    };

    // Ctrl-C stops the run between stages; a re-run resumes it.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    let config = build_ingest_config(cli, args, progress_cb, cancel)?;
    let gateway: Arc<dyn PushGateway> = match &args.push_url {
        Some(url) => Arc::new(
            HttpGateway::new(url.clone(), args.push_timeout).context("Invalid push endpoint")?,
        ),
        None => Arc::new(
            ArchiveGateway::open(cli.workspace.join("archive"))
                .context("Failed to open archive")?,
        ),
    };
    let ingestor = Ingestor::new(config, gateway).context("Failed to open workspace")?;

    let mut failed = 0usize;
    let mut reports = Vec::new();
    for pdf in &args.bundles {
        match ingestor.ingest_bundle(pdf).await {
            Ok(report) => {
                if !cli.quiet && !cli.json && !show_progress {
                    print_report_line(&report.bundle, &report.category_counts(), report.archived);
                }
                for w in &report.order_warnings {
                    if !cli.quiet {
                        eprintln!("  {} {}: {}", yellow("⚠"), report.bundle, w);
                    }
                }
                reports.push(report);
            }
            Err(e) if e.is_benign() => {
                if !cli.quiet {
                    eprintln!("{} {}", dim("="), dim(&e.to_string()));
                }
            }
            Err(e) => {
                failed += 1;
                eprintln!("{} {}: {}", red("✘"), pdf.display(), e);
                if matches!(e, exam_ingest::IngestError::Cancelled { .. }) {
                    break;
                }
            }
        }
    }

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).context("Failed to serialise reports")?
        );
    }
    if failed > 0 {
        anyhow::bail!("{failed} bundle(s) failed");
    }
    Ok(())
}

fn run_match(cli: &Cli, args: &MatchArgs) -> Result<()> {
    let roster = load_classlist(&args.roster).context("Failed to load classlist")?;

    let likelihoods = args
        .likelihoods
        .clone()
        .unwrap_or_else(|| cli.workspace.join("id_likelihoods.json"));
    let bytes = std::fs::read(&likelihoods)
        .with_context(|| format!("Failed to read {}", likelihoods.display()))?;
    let papers: Vec<PaperDigits> = serde_json::from_slice(&bytes)
        .with_context(|| format!("Malformed likelihoods in {}", likelihoods.display()))?;

    let already_identified = match &args.prenamed {
        Some(path) => read_prenamed(path)?,
        None => BTreeMap::new(),
    };

    let request = MatchRequest {
        papers,
        roster,
        already_identified,
    };
    let config = MatchConfig {
        review_cost_threshold: args.threshold,
        tie_break: args.tie_break.clone().into(),
        run_greedy: !args.no_greedy,
    };
    let report = match_papers(&request, &config);

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise predictions")?
        );
        return Ok(());
    }

    for p in report.by_method(Method::Lap) {
        let flag = if p.needs_review { yellow("review") } else { green("ok") };
        println!(
            "{:>5}  {:<12} {:<30} {:>8.3}  {}",
            p.paper_number, p.predicted_student_id, p.student_name, p.confidence_cost, flag
        );
    }
    for e in &report.errors {
        eprintln!("{} {}", red("✘"), e);
    }
    if !cli.quiet {
        let review = report
            .by_method(Method::Lap)
            .filter(|p| p.needs_review)
            .count();
        eprintln!(
            "{} {} predictions, {} need review, {} unassignable  (total cost {:.3})",
            cyan("◆"),
            report.by_method(Method::Lap).count(),
            review,
            report.errors.len(),
            report.total_cost
        );
    }
    Ok(())
}

async fn run_status(cli: &Cli) -> Result<()> {
    let ingestor = open_existing(cli)?;
    let bundles = ingestor.bundles().await;
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&bundles).context("Failed to serialise bundles")?
        );
        return Ok(());
    }
    if bundles.is_empty() {
        eprintln!("{}", dim("No bundles in this workspace."));
        return Ok(());
    }
    for bundle in &bundles {
        let counts = ingestor
            .load_report(&bundle.name)
            .context("Failed to read bundle report")?
            .map(|r| r.category_counts())
            .unwrap_or_default();
        print_report_line(&bundle.name, &counts, bundle.state == BundleState::Archived);
    }
    eprintln!(
        "{} {} papers with ID likelihoods",
        cyan("◆"),
        ingestor.id_likelihoods().len()
    );
    Ok(())
}

async fn run_discard(cli: &Cli, bundle: &str, page: u32) -> Result<()> {
    let ingestor = open_existing(cli)?;
    let state = ingestor
        .confirm_discard(bundle, page)
        .await
        .with_context(|| format!("Cannot discard {bundle} page {page}"))?;
    if !cli.quiet {
        eprintln!("{} {} page {} → {}", green("✔"), bundle, page, state.name());
    }
    Ok(())
}

/// Map CLI args to `IngestConfig`.
fn build_ingest_config(
    cli: &Cli,
    args: &IngestArgs,
    progress: Option<ProgressCallback>,
    cancel: Arc<AtomicBool>,
) -> Result<IngestConfig> {
    let anchors = match &args.anchors {
        Some(path) => AnchorSet::load(path).context("Failed to load ID-box anchors")?,
        None => AnchorSet::default(),
    };

    let mut builder = IngestConfig::builder()
        .workspace_dir(&cli.workspace)
        .magic_code(&args.magic)
        .id_page(args.id_page)
        .id_length(args.id_length)
        .max_rendered_pixels(args.max_pixels)
        .concurrency(args.concurrency)
        .max_retries(args.max_retries)
        .retry_backoff_ms(args.retry_backoff_ms)
        .anchors(anchors)
        .cancel_flag(cancel);

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// An ingestor for workspace-only commands, which never decode pages.
fn open_existing(cli: &Cli) -> Result<Ingestor> {
    let config = IngestConfig {
        workspace_dir: cli.workspace.clone(),
        ..IngestConfig::default()
    };
    let gateway = ArchiveGateway::open(cli.workspace.join("archive"))
        .context("Failed to open archive")?;
    Ingestor::new(config, Arc::new(gateway)).context("Failed to open workspace")
}

#[derive(serde::Deserialize)]
struct PrenamedRow {
    paper: u32,
    id: String,
}

/// Parse a `paper,id` CSV of already-identified papers.
fn read_prenamed(path: &Path) -> Result<BTreeMap<u32, String>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut out = BTreeMap::new();
    for row in reader.deserialize() {
        let row: PrenamedRow = row.with_context(|| format!("Malformed row in {}", path.display()))?;
        out.insert(row.paper, row.id);
    }
    Ok(out)
}

fn print_report_line(bundle: &str, counts: &BTreeMap<RouteCategory, usize>, archived: bool) {
    let get = |c: RouteCategory| counts.get(&c).copied().unwrap_or(0);
    println!(
        "{} {:<24} valid {:>4}  unknown {:>3}  wrong-test {:>3}  duplicate {:>3}",
        if archived { green("✔") } else { cyan("…") },
        bundle,
        get(RouteCategory::Valid),
        get(RouteCategory::Unknown),
        get(RouteCategory::WrongTest),
        get(RouteCategory::Duplicate),
    );
}
