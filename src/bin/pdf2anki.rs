//! CLI binary for pdf2anki.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `WorkflowConfig` and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pdf2anki::services::anki::ExportQuery;
use pdf2anki::{
    AnkiConnect, GeminiClient, MediaOptions, NoteStore, PdfiumEngine, PipelineProgressCallback,
    ProgressCallback, Stage, Workflow, WorkflowConfig,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
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
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: [&str; 11] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar per stage, re-sized whenever a stage
/// announces how many units it will work through.
struct CliProgressCallback {
    bar: ProgressBar,
    file_errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&TICKS),
        );
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            file_errors: AtomicUsize::new(0),
        })
    }

    fn counting(&self, prefix: String, total: usize, unit: &str) {
        let style = ProgressStyle::with_template(&format!(
            "{{spinner:.cyan}} {{prefix:.bold}}  \
             [{{bar:42.green/238}}] {{pos:>3}}/{{len}} {unit}  \
             ⏱ {{elapsed_precise}}  ETA {{eta_precise}}"
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&TICKS);

        self.bar.set_style(style);
        self.bar.set_length(total as u64);
        self.bar.set_position(0);
        self.bar.set_prefix(prefix);
        self.bar.reset_eta();
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage, units: Option<usize>) {
        match (stage, units) {
            (Stage::TextExtraction, Some(n)) => self.counting(stage.to_string(), n, "chunks"),
            (Stage::Tagging(_), Some(n)) => self.counting(stage.to_string(), n, "batches"),
            _ => {
                self.bar.set_prefix(stage.to_string());
                self.bar.set_message("…");
            }
        }
    }

    fn on_chunk_complete(&self, chunk: usize, total: usize, items: usize) {
        self.bar.println(format!(
            "  {} Chunk {:>3}/{:<3}  {}",
            green("✓"),
            chunk,
            total,
            dim(&format!("{items} pairs")),
        ));
        self.bar.set_position(chunk as u64);
    }

    fn on_batch_complete(&self, _pass: usize, processed: usize, total: usize) {
        self.bar.set_message(format!(
            "{:.0}% of rows",
            pdf2anki::progress::percent(processed, total)
        ));
        self.bar.inc(1);
    }

    fn on_file_start(&self, index: usize, total: usize, name: &str) {
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("File {index}/{total}: {name}"))
        ));
    }

    fn on_file_error(&self, index: usize, total: usize, error: &str) {
        self.file_errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar
            .println(format!("  {} File {index}/{total}  {}", red("✗"), red(&msg)));
    }

    fn on_workflow_complete(&self, rows: usize) {
        self.bar.finish_and_clear();
        let failed = self.file_errors.load(Ordering::SeqCst);
        if failed == 0 {
            eprintln!("{} {} rows written", green("✔"), bold(&rows.to_string()));
        } else {
            eprintln!(
                "{} {} rows written  ({} files failed)",
                cyan("⚠"),
                bold(&rows.to_string()),
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Slide deck → tagged import file (+ page images)
  pdf2anki visual quiz.pdf

  # Save page images straight into Anki's media folder (AnkiConnect running)
  pdf2anki --anki-media visual quiz.pdf

  # Text PDF or .txt with a second tagging pass
  pdf2anki --second-pass text questions.txt

  # Many decks into one file, renaming failures to UP_<name>
  pdf2anki --rename-failed bulk decks/*.pdf

  # Re-tag an existing TSV
  pdf2anki tag old_export.tsv -o retagged.txt

  # Export a deck through AnkiConnect and tag it
  pdf2anki anki export --deck Quiz --field Front --field Back --tag

OUTPUT FILES (next to the input unless --output-dir is set):
  {base}_intermediate_visual.json      extracted records (visual)
  {base}_intermediate_text.json        extracted records (text)
  {base}_final_tagged_visual.txt       Anki import file (visual)
  {base}_final_tagged_text.txt         Anki import file (text)
  bulk_visual_{ts}_final_tagged.txt    Anki import file (bulk)

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key
  PDF2ANKI_MODEL          Extraction model ID
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
  RUST_LOG                Log filter, overrides -v / -q
"#;

/// Turn PDF slide decks and text into tagged Anki flashcards.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2anki",
    version,
    about = "Turn PDF slide decks and text into tagged Anki flashcards",
    long_about = "Extract question/answer pairs from quiz slide decks (PDF, read visually) or \
from text (PDF or .txt), classify them with a fixed hierarchical tag vocabulary, and write a \
tab-separated file ready for Anki's importer. Uses Google Gemini.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    opts: GlobalOpts,
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// Gemini API key.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    /// Model for extraction (and tagging, unless overridden).
    #[arg(long, env = "PDF2ANKI_MODEL", global = true)]
    model: Option<String>,

    /// Model for the first tagging pass.
    #[arg(long, env = "PDF2ANKI_TAGGING_MODEL", global = true)]
    tagging_model: Option<String>,

    /// Run the second tagging pass (subjects and modifiers).
    #[arg(long, env = "PDF2ANKI_SECOND_PASS", global = true)]
    second_pass: bool,

    /// Model for the second tagging pass.
    #[arg(long, env = "PDF2ANKI_SECOND_PASS_MODEL", global = true)]
    second_pass_model: Option<String>,

    /// File holding a replacement visual extraction prompt.
    #[arg(long, global = true)]
    visual_prompt_file: Option<PathBuf>,

    /// File holding a replacement text extraction prompt.
    #[arg(long, global = true)]
    text_prompt_file: Option<PathBuf>,

    /// File holding a replacement first-pass tagging prompt (and taxonomy).
    #[arg(long, global = true)]
    tagging_prompt_file: Option<PathBuf>,

    /// File holding a replacement second-pass tagging prompt (and taxonomy).
    #[arg(long, global = true)]
    second_pass_prompt_file: Option<PathBuf>,

    /// Characters per text chunk.
    #[arg(long, env = "PDF2ANKI_CHUNK_SIZE", default_value_t = 30_000, global = true)]
    chunk_size: usize,

    /// Seconds to wait between text chunks.
    #[arg(long, env = "PDF2ANKI_CHUNK_DELAY", default_value_t = 5.0, global = true)]
    chunk_delay: f64,

    /// Rows per tagging call.
    #[arg(long, env = "PDF2ANKI_BATCH_SIZE", default_value_t = 10, global = true)]
    batch_size: usize,

    /// Seconds to wait between tagging calls.
    #[arg(long, env = "PDF2ANKI_BATCH_DELAY", default_value_t = 10.0, global = true)]
    batch_delay: f64,

    /// Page image zoom (1.0 = 72 dpi).
    #[arg(long, env = "PDF2ANKI_ZOOM", default_value_t = 1.5, global = true)]
    zoom: f32,

    /// Save page images into this folder (overwriting) instead of a fresh
    /// timestamped folder next to the output.
    #[arg(long, env = "PDF2ANKI_MEDIA_DIR", global = true)]
    media_dir: Option<PathBuf>,

    /// Ask AnkiConnect for the profile's media folder and save images there.
    #[arg(long, global = true, conflicts_with = "media_dir")]
    anki_media: bool,

    /// Folder for intermediate and final files. Default: next to the input.
    #[arg(long, env = "PDF2ANKI_OUTPUT_DIR", global = true)]
    output_dir: Option<PathBuf>,

    /// Also show the primary question/answer pages in the media columns.
    #[arg(long, global = true)]
    include_primary_pages: bool,

    /// Bulk mode: rename a failed input to UP_<name>.
    #[arg(long, global = true)]
    rename_failed: bool,

    /// AnkiConnect URL.
    #[arg(long, env = "ANKICONNECT_URL", default_value = pdf2anki::services::anki::DEFAULT_ANKICONNECT_URL, global = true)]
    anki_url: String,

    /// Path to the pdfium library (file or directory).
    #[arg(long, env = "PDFIUM_LIB_PATH", global = true)]
    pdfium_lib: Option<PathBuf>,

    /// Disable progress bar.
    #[arg(long, env = "PDF2ANKI_NO_PROGRESS", global = true)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Slide deck PDF → tagged import file plus page images.
    Visual {
        pdf: PathBuf,
    },
    /// Text PDF or .txt → tagged import file.
    Text {
        input: PathBuf,
    },
    /// Several slide decks → one tagged import file.
    Bulk {
        #[arg(required = true)]
        pdfs: Vec<PathBuf>,
    },
    /// Tag an existing TSV (header line required).
    Tag {
        input: PathBuf,
        /// Output file. Default: {base}_final_tagged.txt
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Talk to a running Anki through AnkiConnect.
    Anki {
        #[command(subcommand)]
        action: AnkiAction,
    },
}

#[derive(Subcommand, Debug)]
enum AnkiAction {
    /// List deck names.
    Decks,
    /// List tags.
    Tags,
    /// List the fields of a note type.
    Fields { model: String },
    /// Print the profile's media folder.
    MediaDir,
    /// Export fields of a deck's notes as TSV.
    Export {
        #[arg(long)]
        deck: String,
        /// Field to export (repeatable, in column order).
        #[arg(long = "field", required = true)]
        fields: Vec<String>,
        /// Only notes with any of these tags ("untagged" for none).
        #[arg(long = "include-tag")]
        include_tags: Vec<String>,
        /// Leave out notes with any of these tags.
        #[arg(long = "exclude-tag")]
        exclude_tags: Vec<String>,
        /// Output file. Default: {deck}_export.tsv
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Run the tagging passes over the export afterwards.
        #[arg(long)]
        tag: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let opts = &cli.opts;

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless -v is given.
    let show_progress = !opts.quiet && !opts.no_progress;
    let filter = if opts.verbose {
        "debug"
    } else if opts.quiet || show_progress {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let anki = AnkiConnect::with_url(&opts.anki_url).context("Failed to create AnkiConnect client")?;

    if let Command::Anki { action } = &cli.command {
        return run_anki(action, &anki, opts).await;
    }

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let workflow = build_workflow(opts, &anki, progress).await?;

    // ── Run workflow ─────────────────────────────────────────────────────
    match &cli.command {
        Command::Visual { pdf } => {
            let out = workflow.run_visual(pdf).await.context("Visual workflow failed")?;
            if !opts.quiet {
                eprintln!(
                    "{}  {} rows  →  {}",
                    green("✔"),
                    out.rows,
                    bold(&out.final_path.display().to_string())
                );
                if let Some(dir) = &out.image_dir {
                    eprintln!("   images in {}", dim(&dir.display().to_string()));
                }
            }
        }
        Command::Text { input } => {
            let out = workflow.run_text(input).await.context("Text workflow failed")?;
            if !opts.quiet {
                eprintln!(
                    "{}  {} rows  →  {}",
                    green("✔"),
                    out.rows,
                    bold(&out.final_path.display().to_string())
                );
            }
        }
        Command::Bulk { pdfs } => {
            let report = workflow.run_bulk(pdfs).await.context("Bulk workflow failed")?;
            if !opts.quiet {
                eprintln!(
                    "{}  {} succeeded, {} failed, {} skipped  →  {}",
                    if report.failures.is_empty() {
                        green("✔")
                    } else {
                        cyan("⚠")
                    },
                    report.succeeded.len(),
                    report.failures.len(),
                    report.skipped.len(),
                    bold(&report.output.final_path.display().to_string()),
                );
                for failure in &report.failures {
                    eprintln!(
                        "   {} {}: {}",
                        red("✗"),
                        failure.path.display(),
                        dim(&failure.error)
                    );
                }
            }
        }
        Command::Tag { input, output } => {
            let out = workflow
                .tag_file(input, output.as_deref())
                .await
                .context("Tagging failed")?;
            if !opts.quiet {
                eprintln!(
                    "{}  {} rows  →  {}",
                    green("✔"),
                    out.rows,
                    bold(&out.final_path.display().to_string())
                );
            }
        }
        Command::Anki { .. } => {}
    }

    Ok(())
}

/// Map CLI args to a `Workflow`.
async fn build_workflow(
    opts: &GlobalOpts,
    anki: &AnkiConnect,
    progress: Option<ProgressCallback>,
) -> Result<Workflow> {
    let api_key = opts.api_key.clone().unwrap_or_default();

    let mut builder = WorkflowConfig::builder()
        .api_key(api_key.clone())
        .chunk_size(opts.chunk_size)
        .chunk_delay(secs(opts.chunk_delay)?)
        .batch_size(opts.batch_size)
        .batch_delay(secs(opts.batch_delay)?)
        .image_zoom(opts.zoom)
        .second_pass(opts.second_pass)
        .rename_failed(opts.rename_failed)
        .media_options(MediaOptions {
            include_primary_pages: opts.include_primary_pages,
        });

    if let Some(m) = &opts.model {
        builder = builder.extraction_model(m.clone());
    }
    if let Some(m) = &opts.tagging_model {
        builder = builder.tagging_model(m.clone());
    }
    if let Some(m) = &opts.second_pass_model {
        builder = builder.second_pass_model(m.clone());
    }
    if let Some(p) = read_prompt(opts.visual_prompt_file.as_deref()).await? {
        builder = builder.visual_prompt(p);
    }
    if let Some(p) = read_prompt(opts.text_prompt_file.as_deref()).await? {
        builder = builder.text_prompt(p);
    }
    if let Some(p) = read_prompt(opts.tagging_prompt_file.as_deref()).await? {
        builder = builder.tagging_prompt(p);
    }
    if let Some(p) = read_prompt(opts.second_pass_prompt_file.as_deref()).await? {
        builder = builder.second_pass_prompt(p);
    }
    if let Some(dir) = &opts.output_dir {
        builder = builder.output_dir(dir.clone());
    }
    if let Some(dir) = &opts.media_dir {
        builder = builder.media_dir(dir.clone());
    } else if opts.anki_media {
        let dir = anki
            .media_dir_path()
            .await
            .context("Could not get Anki's media folder (is Anki running with AnkiConnect?)")?;
        builder = builder.media_dir(dir);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    let config = builder.build().context("Invalid configuration")?;
    if !config.has_api_key() {
        anyhow::bail!("No API key: pass --api-key or set GEMINI_API_KEY");
    }

    let engine = match &opts.pdfium_lib {
        Some(path) => PdfiumEngine::with_library_path(path.clone()),
        None => PdfiumEngine::new(),
    };
    Ok(Workflow::new(
        Arc::new(GeminiClient::new(api_key)),
        Arc::new(engine),
        config,
    ))
}

async fn run_anki(action: &AnkiAction, anki: &AnkiConnect, opts: &GlobalOpts) -> Result<()> {
    match action {
        AnkiAction::Decks => print_lines(anki.deck_names().await?),
        AnkiAction::Tags => print_lines(anki.tags().await?),
        AnkiAction::Fields { model } => print_lines(anki.model_field_names(model).await?),
        AnkiAction::MediaDir => println!("{}", anki.media_dir_path().await?.display()),
        AnkiAction::Export {
            deck,
            fields,
            include_tags,
            exclude_tags,
            output,
            tag,
        } => {
            let query = ExportQuery {
                include_tags: include_tags.clone(),
                exclude_tags: exclude_tags.clone(),
                ..ExportQuery::new(deck.clone())
            };
            let table = anki
                .export_notes(&query, fields)
                .await
                .context("Export failed")?;

            let path = output.clone().unwrap_or_else(|| {
                let name = format!("{deck}_export.tsv");
                let base = pdf2anki::pipeline::input::sanitize_filename(Path::new(&name));
                PathBuf::from(format!("{base}.tsv"))
            });
            pdf2anki::pipeline::assemble::write_tsv(&path, &table)
                .await
                .context("Failed to write export")?;
            if !opts.quiet {
                eprintln!(
                    "{}  {} notes  →  {}",
                    green("✔"),
                    table.len(),
                    bold(&path.display().to_string())
                );
            }

            if *tag {
                let workflow = build_workflow(opts, anki, None).await?;
                let out = workflow
                    .tag_file(&path, None)
                    .await
                    .context("Tagging failed")?;
                if !opts.quiet {
                    eprintln!(
                        "{}  {} rows tagged  →  {}",
                        green("✔"),
                        out.rows,
                        bold(&out.final_path.display().to_string())
                    );
                }
            }
        }
    }
    Ok(())
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{line}");
    }
}

fn secs(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("Invalid delay: {value}"))
}

async fn read_prompt(path: Option<&Path>) -> Result<Option<String>> {
    match path {
        Some(path) => Ok(Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read prompt from {:?}", path))?,
        )),
        None => Ok(None),
    }
}
