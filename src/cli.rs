// ============================================================================
// EraseFE CLI: headless object removal via command-line arguments
// ============================================================================
//
// Usage examples:
//   EraseFE --input photo.png --strokes wire.json --output clean.png
//   EraseFE -i shots/*.jpg -s blemishes.json --output-dir cleaned/ --format png
//   EraseFE -i photo.png -s lamp.json -o out.png --remote-endpoint https://host/api/inpaint
//
// Every input image gets its own activation of one removal session, so the
// remote quota is shared across the batch. Processing is synchronous.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc::{self, Receiver};
use std::time::Instant;

use clap::Parser;

use erasefe::io::{SaveFormat, encode_and_write, load_image, load_strokes};
use erasefe::ops::stroke_mask::Stroke;
use erasefe::quota::{FileQuotaStore, SystemClock, UsageQuotaTracker};
use erasefe::removal::{RemovalError, RemovalPipeline, RemovalSession, StageEvent};
use erasefe::settings::{RemovalSettings, RemoteTier};

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// EraseFE headless object remover.
#[derive(Parser, Debug)]
#[command(
    name = "EraseFE",
    version,
    about = "Remove objects from photos using brush strokes recorded as JSON",
    long_about = "Apply clone, heal and content-aware removal strokes to image files\n\
                  without an editor. Strokes are read from a JSON file:\n\n  \
                  [{\"points\": [[x, y], ...], \"radius\": 20, \"feather\": 0.3,\n    \
                  \"opacity\": 1.0, \"mode\": \"content_aware\", \"source\": null}]\n\n\
                  Example:\n  \
                  EraseFE --input photo.png --strokes wire.json --output clean.png"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.png", "shots/*.jpg").
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// JSON stroke file applied to every input.
    #[arg(short, long, value_name = "STROKES.json")]
    pub strokes: PathBuf,

    /// Output file path. Only valid for single-file input.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch processing.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Output format: png, jpeg, webp, bmp, tga, tiff.
    /// When omitted, the format is inferred from --output's extension, defaulting to png.
    #[arg(short, long, value_name = "FORMAT")]
    pub format: Option<String>,

    /// JPEG quality (1-100, default 90).
    #[arg(short, long, default_value_t = 90, value_name = "1-100")]
    pub quality: u8,

    /// Settings file (key=value). Defaults to the per-user settings file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Remote inpainting endpoint. Enables remote removal for large masks.
    #[arg(long, value_name = "URL")]
    pub remote_endpoint: Option<String>,

    /// Remote quality tier: fast, standard, quality.
    #[arg(long, value_name = "TIER")]
    pub remote_tier: Option<String>,

    /// Daily quota record. Defaults to the per-user quota file.
    #[arg(long, value_name = "FILE")]
    pub quota_file: Option<PathBuf>,

    /// Print stage progress and per-file timing.
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run all CLI processing and return an OS exit code.
/// `0` = all files succeeded, `1` = one or more files failed.
pub fn run(args: CliArgs) -> ExitCode {
    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    if inputs.len() > 1 && args.output.is_some() && args.output_dir.is_none() {
        eprintln!(
            "error: {} input files given but --output only accepts a single file path.\n\
             Use --output-dir to specify a destination directory for batch processing.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }

    let save_format = match parse_format(args.format.as_deref(), args.output.as_deref()) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let settings = match build_settings(&args) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let strokes = match load_strokes(&args.strokes) {
        Ok(s) if s.is_empty() => {
            eprintln!("error: '{}' contains no strokes.", args.strokes.display());
            return ExitCode::FAILURE;
        }
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: could not read strokes '{}': {}", args.strokes.display(), e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(dir) = &args.output_dir
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!("error: could not create output directory '{}': {}", dir.display(), e);
        return ExitCode::FAILURE;
    }

    let (tx, rx) = mpsc::channel();
    let mut session = RemovalSession::new(build_pipeline(settings, args.quota_file.as_deref())).with_events(tx);

    let total = inputs.len();
    let multi = total > 1;
    let mut any_failure = false;

    for (idx, input_path) in inputs.iter().enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, input_path.display());
        }
        let file_start = Instant::now();

        let Some(output_path) = build_output_path(
            input_path,
            args.output.as_deref(),
            args.output_dir.as_deref(),
            save_format,
        ) else {
            eprintln!("  error: cannot determine output path for '{}'.", input_path.display());
            any_failure = true;
            continue;
        };

        let result = run_one(&mut session, &rx, input_path, &output_path, &strokes, save_format, &args);
        match result {
            Ok(()) => {
                if args.verbose || multi {
                    println!(
                        "  → {} ({:.0}ms)",
                        output_path.display(),
                        file_start.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                erasefe::log_err!("{}: {}", input_path.display(), e);
                eprintln!("  error: {}", e);
                any_failure = true;
            }
        }
    }

    if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

// ============================================================================
// Per-file processing pipeline
// ============================================================================

fn run_one(
    session: &mut RemovalSession,
    events: &Receiver<StageEvent>,
    input: &Path,
    output: &Path,
    strokes: &[Stroke],
    format: SaveFormat,
    args: &CliArgs,
) -> Result<(), String> {
    // -- Step 1: Load ----------------------------------------------------
    let image = load_image(input).map_err(|e| format!("load failed: {}", e))?;
    session.activate(image).map_err(|e| e.to_string())?;

    // -- Step 2: Remove --------------------------------------------------
    for stroke in strokes {
        session.add_stroke(stroke.clone()).map_err(|e| e.to_string())?;
    }
    let outcome = match session.commit() {
        Err(RemovalError::FastPathTimeout { elapsed_ms, budget_ms }) => {
            println!(
                "  spot removal exceeded {} ms ({} ms); retrying with the full pipeline",
                budget_ms, elapsed_ms
            );
            session.commit_general()
        }
        other => other,
    };
    report_events(events, args.verbose);
    let outcome = outcome.map_err(|e| e.to_string())?;

    if args.verbose {
        for (i, s) in outcome.strokes.iter().enumerate() {
            println!(
                "  stroke {}: {:?}, {} px filled, {} skipped",
                i + 1,
                s.path,
                s.report.filled,
                s.report.skipped
            );
        }
    }
    if outcome.is_partial() {
        println!("  note: some pixels had no usable source and were left unchanged");
    }

    // -- Step 3: Save ----------------------------------------------------
    let result = session.take_buffer().ok_or_else(|| "no image after removal".to_string())?;
    encode_and_write(&result, output, format, args.quality).map_err(|e| format!("save failed: {}", e))
}

/// Print status text always and stage changes when verbose.
fn report_events(events: &Receiver<StageEvent>, verbose: bool) {
    for event in events.try_iter() {
        match event {
            StageEvent::Status { message, .. } => println!("  {}", message),
            StageEvent::Stage { stroke, stage, .. } if verbose => {
                println!("  [stroke {}] {}", stroke + 1, stage.label());
            }
            StageEvent::Stage { .. } => {}
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn build_settings(args: &CliArgs) -> Result<RemovalSettings, String> {
    let mut settings = match &args.config {
        Some(path) => RemovalSettings::load_from(path)
            .map_err(|e| format!("could not read config '{}': {}", path.display(), e))?,
        None => RemovalSettings::load(),
    };
    if let Some(endpoint) = &args.remote_endpoint {
        settings.remote.enabled = true;
        settings.remote.endpoint = endpoint.clone();
    }
    if let Some(tier) = &args.remote_tier {
        settings.remote.tier = tier
            .parse::<RemoteTier>()
            .map_err(|_| format!("unknown remote tier '{}' (expected fast, standard or quality)", tier))?;
    }
    Ok(settings)
}

fn build_pipeline(settings: RemovalSettings, quota_file: Option<&Path>) -> RemovalPipeline {
    match quota_file {
        Some(path) => {
            let quota = UsageQuotaTracker::new(
                settings.remote.daily_limit,
                Box::new(FileQuotaStore::new(path)),
                Box::new(SystemClock),
            );
            RemovalPipeline::new(settings, quota).with_default_client()
        }
        None => RemovalPipeline::from_settings(settings),
    }
}

/// Expand each argument as an existing path or a glob, keeping first-seen
/// order and dropping duplicates.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut inputs: Vec<PathBuf> = Vec::new();
    for pattern in patterns {
        let matches: Vec<PathBuf> = if Path::new(pattern).exists() {
            vec![PathBuf::from(pattern)]
        } else {
            match glob::glob(pattern) {
                Ok(paths) => paths.flatten().filter(|p| p.is_file()).collect(),
                Err(e) => {
                    eprintln!("warning: invalid glob '{}': {}", pattern, e);
                    continue;
                }
            }
        };
        if matches.is_empty() {
            eprintln!("warning: '{}' matched no files.", pattern);
        }
        for path in matches {
            if !inputs.contains(&path) {
                inputs.push(path);
            }
        }
    }
    inputs
}

/// Choose the output format from `--format` or the output file extension.
fn parse_format(format_arg: Option<&str>, output: Option<&Path>) -> Result<SaveFormat, String> {
    if let Some(f) = format_arg {
        return SaveFormat::from_name(f).ok_or_else(|| format!("unsupported output format '{}'", f));
    }
    Ok(output.map(SaveFormat::from_path).unwrap_or_default())
}

/// `--output` as given, else `<dir>/<stem>.<ext>` under `--output-dir`, else
/// `<stem>_erased.<ext>` beside the input.
fn build_output_path(
    input: &Path,
    output: Option<&Path>,
    output_dir: Option<&Path>,
    format: SaveFormat,
) -> Option<PathBuf> {
    if let Some(out) = output {
        return Some(out.to_path_buf());
    }
    let stem = input.file_stem()?.to_string_lossy();
    let ext = format.extension();
    Some(match output_dir {
        Some(dir) => dir.join(format!("{}.{}", stem, ext)),
        None => input.with_file_name(format!("{}_erased.{}", stem, ext)),
    })
}
