//! PDF Shrinker CLI
//!
//! Command-line interface for shrinking PDFs.

use anyhow::{Context, Result};
use clap::Parser;
use shrink_pdf::report::{human_size, reduction_percent};
use shrink_pdf::{default_output_path, engine, CompressError, CompressOptions, Engine, Quality};
use std::fs;
use std::path::PathBuf;

/// Shrink a PDF by downsampling and re-encoding its images
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input PDF file path
    input: PathBuf,

    /// Output PDF file path (default: <input>_compressed.pdf)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Compression quality: high = larger, medium = balanced, low = smallest
    #[arg(short, long, value_enum, default_value_t = Quality::Medium)]
    quality: Quality,

    /// Target image DPI (overrides the quality preset)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    dpi: Option<u32>,

    /// Compression engine
    #[arg(long, value_enum, default_value_t = Engine::Auto)]
    engine: Engine,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .parse_default_env()
        .init();

    if !args.input.is_file() {
        return Err(CompressError::InputNotFound(args.input).into());
    }
    let input = fs::canonicalize(&args.input)
        .with_context(|| format!("Failed to resolve input path: {}", args.input.display()))?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&input));

    let options = CompressOptions::new(args.quality, args.dpi);
    let original_size = fs::metadata(&input)?.len();

    println!("Input:   {}", input.display());
    println!("Size:    {}", human_size(original_size));
    println!(
        "Quality: {} | Target DPI: {}",
        args.quality, options.preset.target_dpi
    );
    println!();

    let selected = engine::select(args.engine)?;
    println!("Engine:  {}", selected);
    println!("Compressing...");

    let summary = engine::run(&selected, &input, &output, &options)?;

    if let Some(reason) = &summary.fallback {
        println!("Ghostscript failed ({}), used the built-in engine instead", reason);
    }
    if let Some(report) = &summary.report {
        println!("  Compressed {} images", report.compressed);
        if report.skipped() > 0 {
            println!("  Skipped {} images", report.skipped());
        }
    }

    let compressed_size = fs::metadata(&output)
        .with_context(|| format!("Failed to read output file: {}", output.display()))?
        .len();
    let ratio = reduction_percent(original_size, compressed_size);

    println!();
    println!("Output:  {}", output.display());
    println!("Size:    {}", human_size(compressed_size));
    if ratio > 0.0 {
        println!("Reduced by {:.1}%", ratio);
    } else {
        println!("Note: the output is not smaller; the input may already be well compressed.");
    }

    Ok(())
}
