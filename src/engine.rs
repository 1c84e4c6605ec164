//! Engine selection: Ghostscript when available or requested, the
//! built-in rewriter otherwise, with one fallback from the former to the
//! latter.

use clap::ValueEnum;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use thiserror::Error;

use crate::error::CompressError;
use crate::output;
use crate::quality::QualityPreset;
use crate::rewrite::{RewriteReport, Rewriter};
use crate::CompressOptions;

#[cfg(windows)]
const GHOSTSCRIPT_BINARIES: &[&str] = &["gswin64c.exe", "gswin32c.exe", "gs.exe"];
#[cfg(not(windows))]
const GHOSTSCRIPT_BINARIES: &[&str] = &["gs"];

const GHOSTSCRIPT_NAME: &str = "Ghostscript (gs)";

/// Engine requested on the command line.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Engine {
    /// Ghostscript if installed, otherwise built-in
    #[default]
    Auto,
    /// Ghostscript only
    #[value(name = "gs", alias = "ghostscript")]
    Ghostscript,
    /// Built-in image recompression
    #[value(name = "pikepdf", alias = "builtin")]
    Builtin,
}

/// Engine resolved against what is installed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectedEngine {
    Ghostscript(PathBuf),
    Builtin,
}

impl fmt::Display for SelectedEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectedEngine::Ghostscript(_) => f.write_str("Ghostscript"),
            SelectedEngine::Builtin => f.write_str("built-in (lopdf + image)"),
        }
    }
}

/// Ghostscript run failures; these trigger the built-in fallback.
#[derive(Error, Debug)]
pub enum GhostscriptError {
    #[error("failed to run Ghostscript: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ghostscript exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },

    #[error("Ghostscript produced no output")]
    NoOutput,
}

/// Outcome of a full compression run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub engine: SelectedEngine,
    /// Set when Ghostscript failed and the built-in engine took over
    pub fallback: Option<String>,
    /// Only present when the built-in engine produced the output
    pub report: Option<RewriteReport>,
}

/// Locate a Ghostscript executable on `PATH`.
pub fn find_ghostscript() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    find_in_path(&path, GHOSTSCRIPT_BINARIES)
}

fn find_in_path(path: &OsString, names: &[&str]) -> Option<PathBuf> {
    std::env::split_paths(path)
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Resolve the requested engine.
///
/// An explicit Ghostscript request fails when it is not installed; `auto`
/// quietly picks the built-in engine instead.
pub fn select(engine: Engine) -> Result<SelectedEngine, CompressError> {
    select_with(engine, find_ghostscript())
}

fn select_with(
    engine: Engine,
    ghostscript: Option<PathBuf>,
) -> Result<SelectedEngine, CompressError> {
    match (engine, ghostscript) {
        (Engine::Builtin, _) => Ok(SelectedEngine::Builtin),
        (Engine::Ghostscript | Engine::Auto, Some(gs)) => Ok(SelectedEngine::Ghostscript(gs)),
        (Engine::Ghostscript, None) => Err(CompressError::ToolMissing {
            tool: GHOSTSCRIPT_NAME,
        }),
        (Engine::Auto, None) => Ok(SelectedEngine::Builtin),
    }
}

/// Ghostscript arguments for a `pdfwrite` pass at the given preset.
pub fn ghostscript_args(input: &Path, output: &Path, preset: &QualityPreset) -> Vec<OsString> {
    let dpi = preset.target_dpi;
    let mut args: Vec<OsString> = [
        "-sDEVICE=pdfwrite".to_string(),
        "-dCompatibilityLevel=1.5".to_string(),
        format!("-dPDFSETTINGS=/{}", preset.ghostscript_preset),
        "-dNOPAUSE".to_string(),
        "-dQUIET".to_string(),
        "-dBATCH".to_string(),
        "-dColorImageDownsampleType=/Bicubic".to_string(),
        format!("-dColorImageResolution={dpi}"),
        "-dGrayImageDownsampleType=/Bicubic".to_string(),
        format!("-dGrayImageResolution={dpi}"),
        format!("-dMonoImageResolution={dpi}"),
        "-dAutoRotatePages=/None".to_string(),
    ]
    .into_iter()
    .map(OsString::from)
    .collect();

    let mut output_arg = OsString::from("-sOutputFile=");
    output_arg.push(output);
    args.push(output_arg);
    args.push(input.as_os_str().to_owned());
    args
}

/// Run Ghostscript, writing to `output` only if it succeeds.
pub fn compress_with_ghostscript(
    gs: &Path,
    input: &Path,
    output: &Path,
    preset: &QualityPreset,
) -> Result<(), GhostscriptError> {
    let staged = output::staging_path(output)?;
    let args = ghostscript_args(input, &staged, preset);
    log::debug!("running {} {:?}", gs.display(), args);

    let result = Command::new(gs).args(&args).output()?;
    if !result.status.success() {
        return Err(GhostscriptError::Failed {
            status: result.status,
            stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
        });
    }
    if std::fs::metadata(&staged).map_or(true, |m| m.len() == 0) {
        return Err(GhostscriptError::NoOutput);
    }

    output::persist(staged, output)?;
    Ok(())
}

/// Compress `input` into `output` with the selected engine.
pub fn run(
    engine: &SelectedEngine,
    input: &Path,
    output: &Path,
    options: &CompressOptions,
) -> Result<RunSummary, CompressError> {
    if !input.is_file() {
        return Err(CompressError::InputNotFound(input.to_path_buf()));
    }

    let mut fallback = None;
    if let SelectedEngine::Ghostscript(gs) = engine {
        match compress_with_ghostscript(gs, input, output, &options.preset) {
            Ok(()) => {
                let summary = RunSummary {
                    engine: engine.clone(),
                    fallback: None,
                    report: None,
                };
                return finish(summary, output);
            }
            Err(e) => {
                log::warn!("{}, falling back to the built-in engine", e);
                fallback = Some(e.to_string());
            }
        }
    }

    let mut rewriter = Rewriter::open(input, *options)?;
    let report = rewriter.rewrite_images();
    rewriter.save(output)?;

    finish(
        RunSummary {
            engine: engine.clone(),
            fallback,
            report: Some(report),
        },
        output,
    )
}

fn finish(summary: RunSummary, output: &Path) -> Result<RunSummary, CompressError> {
    if output.is_file() {
        Ok(summary)
    } else {
        Err(CompressError::OutputMissing(output.to_path_buf()))
    }
}
