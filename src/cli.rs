// ============================================================================
// rasterstack CLI - headless batch processing via command-line arguments
// ============================================================================
//
// Usage examples:
//   rasterstack -i photo.png --brightness 0.1 --contrast 0.2 -o out.png
//   rasterstack -i "shots/*.jpg" --invert --output-dir processed/
//   rasterstack -i scan.png --fill 0,0,FFFFFF00 --tolerance 12 -o cut.png
//   rasterstack -i face.png --heal 120,88,6 --heal 140,90,4 -o clean.png
//
// Every input becomes a one-layer project run through the same engine the
// interactive front end uses; the flattened result is written as PNG.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use image::Rgba;

use crate::engine::{Engine, EngineEvent};
use crate::io::{decode_rgba, encode_rgba_png};
use crate::project::{Adjustments, Project};
use crate::settings::EngineSettings;

const OUTPUT_EXT: &str = "png";
const WORKER_TIMEOUT: Duration = Duration::from_secs(120);

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// rasterstack headless image processor.
#[derive(Parser, Debug)]
#[command(
    name = "rasterstack",
    about = "rasterstack headless batch image processor",
    long_about = "Apply colour adjustments, bucket fills and spot heals to image files\n\
                  without an interactive front end. Reads PNG, JPEG, WEBP and BMP;\n\
                  always writes PNG.\n\n\
                  Example:\n  \
                  rasterstack -i photo.png --contrast 0.3 --heal 40,52,5 -o out.png\n  \
                  rasterstack -i \"*.jpg\" --saturation -1 --output-dir gray/"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.png", "shots/*.jpg").
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Output file path. Only valid for single-file input.
    /// For batch input use --output-dir instead.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch processing.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Brightness offset (-1..1).
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true, value_parser = unit_range)]
    pub brightness: f32,

    /// Contrast (-1..1).
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true, value_parser = unit_range)]
    pub contrast: f32,

    /// Saturation (-1..1, -1 = grayscale).
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true, value_parser = unit_range)]
    pub saturation: f32,

    /// Hue rotation in degrees (-180..180).
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true, value_parser = hue_range)]
    pub hue: f32,

    /// Invert colours.
    #[arg(long)]
    pub invert: bool,

    /// Bucket fill before adjusting: X,Y,RRGGBB or X,Y,RRGGBBAA. Repeatable.
    #[arg(long, value_name = "X,Y,COLOR", value_parser = parse_fill)]
    pub fill: Vec<FillSpec>,

    /// Fill tolerance (0-255). Defaults to the settings file value.
    #[arg(long, value_name = "0-255")]
    pub tolerance: Option<u8>,

    /// Spot heal at X,Y with radius R (R >= 2). Repeatable.
    #[arg(long, value_name = "X,Y,R", value_parser = parse_heal)]
    pub heal: Vec<HealSpec>,

    /// Settings file (defaults to the per-user settings location).
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Session log file (defaults to the per-user data directory).
    #[arg(long, value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Print per-file timing information.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FillSpec {
    pub x: i32,
    pub y: i32,
    pub color: Rgba<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HealSpec {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
}

impl CliArgs {
    fn adjustments(&self) -> Adjustments {
        Adjustments {
            brightness: self.brightness,
            contrast: self.contrast,
            saturation: self.saturation,
            hue: self.hue,
            invert: self.invert,
        }
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run all CLI processing and return an OS exit code.
/// `0` = all files succeeded, `1` = one or more files failed.
pub fn run(args: CliArgs) -> ExitCode {
    let settings = match &args.settings {
        Some(path) => EngineSettings::load_from(path),
        None => EngineSettings::load(),
    };
    if settings.log_to_file || args.log.is_some() {
        crate::logger::init(args.log.clone());
    }

    // Resolve glob patterns / literal paths → concrete PathBufs
    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    // Multiple inputs require --output-dir, not --output
    if inputs.len() > 1 && args.output.is_some() && args.output_dir.is_none() {
        eprintln!(
            "error: {} input files given but --output only accepts a single file path.\n\
             Use --output-dir to specify a destination directory for batch processing.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }

    if let Some(dir) = &args.output_dir
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!("error: could not create output directory '{}': {}", dir.display(), e);
        return ExitCode::FAILURE;
    }

    let total = inputs.len();
    let multi = total > 1;
    let mut any_failure = false;

    for (idx, input_path) in inputs.iter().enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, input_path.display());
        }
        let file_start = Instant::now();

        let Some(output_path) = build_output_path(input_path, args.output.as_deref(), args.output_dir.as_deref())
        else {
            eprintln!("  error: cannot determine output path for '{}'.", input_path.display());
            any_failure = true;
            continue;
        };

        match run_one(input_path, &output_path, &args, &settings) {
            Ok(()) => {
                crate::log_info!("{} -> {}", input_path.display(), output_path.display());
                if args.verbose || multi {
                    println!(
                        "  → {} ({:.0}ms)",
                        output_path.display(),
                        file_start.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                crate::log_err!("{}: {}", input_path.display(), e);
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

fn run_one(input: &Path, output: &Path, args: &CliArgs, settings: &EngineSettings) -> Result<(), String> {
    // -- Step 1: Load ----------------------------------------------------
    let bytes = std::fs::read(input).map_err(|e| format!("read failed: {}", e))?;
    let pixels = decode_rgba(&bytes).map_err(|e| format!("load failed: {}", e))?;
    let (w, h) = pixels.dimensions();

    let mut project = Project::new(w, h);
    project.background = [0, 0, 0, 0];
    let mut engine = Engine::with_settings(project, settings.clone());
    let layer = engine.add_raster_layer("Background");
    engine.attach_pixels(layer, pixels).map_err(|e| e.to_string())?;

    // -- Step 2: Fill / heal ---------------------------------------------
    for fill in &args.fill {
        let changed = engine
            .flood_fill(layer, fill.x, fill.y, fill.color, args.tolerance)
            .map_err(|e| format!("fill failed: {}", e))?;
        if args.verbose {
            println!("  fill ({}, {}): {} px", fill.x, fill.y, changed);
        }
    }

    // Heals run one at a time so each sees the previous result.
    for heal in &args.heal {
        engine
            .request_spot_heal(layer, heal.x, heal.y, heal.radius)
            .map_err(|e| format!("heal failed: {}", e))?;
        match engine.wait_worker(WORKER_TIMEOUT) {
            Some(EngineEvent::HealApplied { .. }) => {}
            Some(EngineEvent::Failed { reason, .. }) => return Err(format!("heal failed: {}", reason)),
            Some(other) => return Err(format!("unexpected worker event {:?}", other)),
            None => return Err("heal timed out".to_string()),
        }
    }

    // -- Step 3: Adjust + flatten ----------------------------------------
    engine.set_adjustments(layer, args.adjustments()).map_err(|e| e.to_string())?;
    let flat = engine.flatten(1.0).map_err(|e| format!("render failed: {}", e))?;

    // -- Step 4: Save ----------------------------------------------------
    let png = encode_rgba_png(&flat).map_err(|e| format!("encode failed: {}", e))?;
    std::fs::write(output, png).map_err(|e| format!("save failed: {}", e))?;
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn unit_range(s: &str) -> Result<f32, String> {
    let v: f32 = s.trim().parse().map_err(|_| format!("'{}' is not a number", s))?;
    if (-1.0..=1.0).contains(&v) {
        Ok(v)
    } else {
        Err(format!("{} is outside -1..1", v))
    }
}

fn hue_range(s: &str) -> Result<f32, String> {
    let v: f32 = s.trim().parse().map_err(|_| format!("'{}' is not a number", s))?;
    if (-180.0..=180.0).contains(&v) {
        Ok(v)
    } else {
        Err(format!("{} is outside -180..180", v))
    }
}

/// `RRGGBB` or `RRGGBBAA`, optional leading `#`.
pub fn parse_hex_color(s: &str) -> Result<Rgba<u8>, String> {
    let hex = s.trim().trim_start_matches('#');
    if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
        return Err(format!("'{}' is not RRGGBB or RRGGBBAA", s));
    }
    let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| format!("bad hex colour '{}'", s));
    let a = if hex.len() == 8 { byte(6)? } else { 255 };
    Ok(Rgba([byte(0)?, byte(2)?, byte(4)?, a]))
}

pub fn parse_fill(s: &str) -> Result<FillSpec, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [x, y, color] = parts.as_slice() else {
        return Err(format!("expected X,Y,COLOR, got '{}'", s));
    };
    Ok(FillSpec {
        x: x.parse().map_err(|_| format!("bad x '{}'", x))?,
        y: y.parse().map_err(|_| format!("bad y '{}'", y))?,
        color: parse_hex_color(color)?,
    })
}

pub fn parse_heal(s: &str) -> Result<HealSpec, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [x, y, r] = parts.as_slice() else {
        return Err(format!("expected X,Y,R, got '{}'", s));
    };
    Ok(HealSpec {
        x: x.parse().map_err(|_| format!("bad x '{}'", x))?,
        y: y.parse().map_err(|_| format!("bad y '{}'", y))?,
        radius: r.parse().map_err(|_| format!("bad radius '{}'", r))?,
    })
}

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

/// Compute the output path for a single input file.
///
/// Priority:
/// 1. `--output` (explicit path, used for single-file input)
/// 2. `--output-dir` (batch directory, derives filename from input stem)
/// 3. Fallback: next to the input with a `.png` extension
///    (appends `_out` to the stem if that would overwrite the input)
fn build_output_path(input: &Path, output: Option<&Path>, output_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(out) = output {
        return Some(out.to_path_buf());
    }

    let stem = input.file_stem()?.to_string_lossy().into_owned();

    if let Some(dir) = output_dir {
        return Some(dir.join(format!("{}.{}", stem, OUTPUT_EXT)));
    }

    let parent = input.parent().unwrap_or(Path::new("."));
    let candidate = parent.join(format!("{}.{}", stem, OUTPUT_EXT));
    if candidate == input {
        Some(parent.join(format!("{}_out.{}", stem, OUTPUT_EXT)))
    } else {
        Some(candidate)
    }
}
