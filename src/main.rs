use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use magpie::batch::{BatchConfig, BatchCoordinator, BatchEvent, BatchOutcome};
use magpie::decoder::CommandDecoder;
use magpie::descriptor::{self, FormatDescriptor};
use magpie::report::ExtractionReport;
use magpie::types::ExtractionRecord;

/// Bytes sampled from each file's head for format detection. A signature
/// deeper than this is only found under an explicit --format.
const DETECT_WINDOW: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "magpie")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Carve known asset formats out of packed archive containers")]
struct Cli {
    /// Source file or directory to scan (directories are walked recursively)
    input: Option<PathBuf>,

    /// Directory for carved output files
    #[arg(short, long, default_value = "./carved")]
    output: PathBuf,

    /// Carve only this format (see --list-formats). Without it each file's
    /// first 64 KiB is sampled to pick one; files whose earliest signature
    /// sits deeper are skipped unless a format is forced
    #[arg(short, long)]
    format: Option<String>,

    /// Worker threads (defaults to the CPU count)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Skip input files with these extensions (comma separated)
    #[arg(long, value_delimiter = ',')]
    skip_ext: Vec<String>,

    /// Only consider input files with these extensions (comma separated)
    #[arg(long, value_delimiter = ',', conflicts_with = "skip_ext")]
    only_ext: Vec<String>,

    /// Run this program on each carved segment of decoder-delegating formats
    #[arg(long)]
    decoder: Option<String>,

    /// Write a JSON report of everything extracted
    #[arg(long)]
    report: Option<PathBuf>,

    /// List known formats and exit
    #[arg(long)]
    list_formats: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let descriptors = descriptor::builtin_descriptors();

    if cli.list_formats {
        list_formats(&descriptors);
        return Ok(());
    }

    let Some(input) = cli.input else {
        bail!("no input given; pass a file or directory, or --list-formats");
    };

    let ext_filter = ExtFilter {
        skip: &cli.skip_ext,
        only: &cli.only_ext,
    };
    let sources = collect_sources(&input, &ext_filter)
        .with_context(|| format!("failed to enumerate {}", input.display()))?;
    if sources.is_empty() {
        bail!("no candidate files under {}", input.display());
    }

    fs::create_dir_all(&cli.output)
        .with_context(|| format!("failed to create output directory {}", cli.output.display()))?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            eprintln!("\ninterrupt received, finishing in-flight segments...");
            cancel.store(true, std::sync::atomic::Ordering::Relaxed);
        })
        .context("failed to install interrupt handler")?;
    }

    let groups = group_by_format(sources, cli.format.as_deref(), &descriptors)?;

    let decoder = cli
        .decoder
        .map(|program| CommandDecoder::new(program, vec![]));

    let mut all_records: Vec<ExtractionRecord> = Vec::new();
    let mut sources_scanned = 0u64;
    let mut sources_failed = 0u64;
    let mut cancelled = false;

    for (format_id, files) in groups {
        if cancelled {
            break;
        }
        let fmt = descriptor::find(&descriptors, format_id).expect("grouped by known id");
        println!(
            "Carving {} from {} file(s)...",
            format_id,
            files.len()
        );

        let mut config = BatchConfig::new(cli.output.clone());
        if let Some(jobs) = cli.jobs {
            config = config.workers(jobs);
        }
        let mut coordinator = BatchCoordinator::new(fmt, config, Arc::clone(&cancel));
        if let Some(decoder) = decoder.as_ref() {
            coordinator = coordinator.with_decoder(decoder);
        }

        let (event_tx, event_rx) = unbounded();
        let progress = thread::spawn(move || {
            let mut bar: Option<ProgressBar> = None;
            let mut segments = 0u64;
            for event in event_rx.iter() {
                match event {
                    BatchEvent::Started { total_sources } => {
                        let pb = ProgressBar::new(total_sources as u64);
                        pb.set_style(
                            ProgressStyle::default_bar()
                                .template("[{bar:40.cyan/blue}] {pos}/{len} files {msg}")
                                .expect("static template")
                                .progress_chars("=>-"),
                        );
                        bar = Some(pb);
                    }
                    BatchEvent::SegmentExtracted(_) => {
                        segments += 1;
                        if let Some(pb) = &bar {
                            pb.set_message(format!("{segments} segments"));
                        }
                    }
                    BatchEvent::SourceFinished { .. } | BatchEvent::SourceFailed { .. } => {
                        if let Some(pb) = &bar {
                            pb.inc(1);
                        }
                    }
                    BatchEvent::Completed { .. } | BatchEvent::Cancelled => {
                        if let Some(pb) = &bar {
                            pb.finish_and_clear();
                        }
                    }
                    BatchEvent::SourceStarted { .. } => {}
                }
            }
        });

        let summary = coordinator.run(files, &event_tx);
        drop(event_tx);
        progress.join().ok();

        sources_scanned += summary.sources_scanned;
        sources_failed += summary.sources_failed;
        all_records.extend(summary.records);
        if summary.outcome == BatchOutcome::Cancelled {
            cancelled = true;
        }
    }

    let total_bytes: u64 = all_records.iter().map(|r| r.byte_count).sum();
    println!();
    if cancelled {
        println!("Cancelled. Partial results are complete segments only.");
    }
    println!("Sources scanned:    {sources_scanned}");
    if sources_failed > 0 {
        println!("Sources failed:     {sources_failed}");
    }
    println!("Segments extracted: {}", all_records.len());
    println!("Bytes extracted:    {}", format_size(total_bytes, BINARY));
    println!("Output folder:      {}", cli.output.display());

    if let Some(report_path) = cli.report {
        let report = ExtractionReport::build(&all_records, sources_scanned)
            .context("failed to build extraction report")?;
        report
            .write(&report_path)
            .with_context(|| format!("failed to write report {}", report_path.display()))?;
        println!("Report:             {}", report_path.display());
    }

    if cancelled {
        std::process::exit(130);
    }
    Ok(())
}

fn list_formats(descriptors: &[FormatDescriptor]) {
    println!("{:<6} {:<5} {:<8} {}", "ID", "EXT", "DECODER", "SIGNATURES");
    for d in descriptors {
        let sigs: Vec<String> = d
            .signatures
            .iter()
            .map(|s| {
                s.bytes()
                    .iter()
                    .map(|b| {
                        if b.is_ascii_graphic() {
                            (*b as char).to_string()
                        } else {
                            format!("\\x{b:02x}")
                        }
                    })
                    .collect()
            })
            .collect();
        println!(
            "{:<6} {:<5} {:<8} {}",
            d.id,
            d.extension,
            if d.external_decoder { "yes" } else { "no" },
            sigs.join(", ")
        );
    }
}

struct ExtFilter<'a> {
    skip: &'a [String],
    only: &'a [String],
}

impl ExtFilter<'_> {
    fn admits(&self, path: &Path) -> bool {
        let ext = path.extension().and_then(|e| e.to_str());
        if !self.only.is_empty() {
            return ext.is_some_and(|e| self.only.iter().any(|s| s.eq_ignore_ascii_case(e)));
        }
        !ext.is_some_and(|e| self.skip.iter().any(|s| s.eq_ignore_ascii_case(e)))
    }
}

/// Walks `input` and returns every regular file the extension filter
/// admits, in sorted order so runs are reproducible.
fn collect_sources(input: &Path, filter: &ExtFilter<'_>) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![input.to_path_buf()];
    while let Some(path) = stack.pop() {
        let meta = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if meta.is_dir() {
            for entry in
                fs::read_dir(&path).with_context(|| format!("failed to read {}", path.display()))?
            {
                stack.push(entry?.path());
            }
        } else if meta.is_file() && filter.admits(&path) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Maps each source to the format that will carve it. A forced format puts
/// everything in one group; otherwise the file head is sampled and the
/// highest-priority matching descriptor wins. Undetected files are skipped
/// with a note.
fn group_by_format(
    sources: Vec<PathBuf>,
    forced: Option<&str>,
    descriptors: &[FormatDescriptor],
) -> Result<BTreeMap<&'static str, Vec<PathBuf>>> {
    let mut groups: BTreeMap<&'static str, Vec<PathBuf>> = BTreeMap::new();

    if let Some(id) = forced {
        let Some(fmt) = descriptor::find(descriptors, id) else {
            bail!("unknown format `{id}`; see --list-formats");
        };
        groups.insert(fmt.id, sources);
        return Ok(groups);
    }

    for path in sources {
        let head = read_head(&path, DETECT_WINDOW)
            .with_context(|| format!("failed to read {}", path.display()))?;
        match descriptor::detect(&head, descriptors).first() {
            Some(fmt) => groups.entry(fmt.id).or_default().push(path),
            None => {
                eprintln!(
                    "skipping {} (no known signature in the first {} KiB; pass --format to scan it anyway)",
                    path.display(),
                    DETECT_WINDOW / 1024
                );
            }
        }
    }
    Ok(groups)
}

fn read_head(path: &Path, len: usize) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    let mut file = fs::File::open(path)?;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
