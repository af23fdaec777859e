use std::io::Write;
use std::path::Path;

use owo_colors::OwoColorize;
use pdftext_core::{ConversionResult, ConversionStatus, RunSummary};

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

/// One line for a directory the walk could not read.
pub fn format_discovery_error(path: &Path, message: &str, color: ColorMode) -> String {
    if color.enabled() {
        format!("{} {}: {}", "WARNING:".yellow(), path.display(), message)
    } else {
        format!("WARNING: {}: {}", path.display(), message)
    }
}

/// List failed files and files that converted with warnings.
pub fn print_problems(
    w: &mut dyn Write,
    results: &[ConversionResult],
    color: ColorMode,
) -> std::io::Result<()> {
    if results.is_empty() {
        return Ok(());
    }

    for result in results {
        let input = result.candidate.input_path.display();
        if result.status == ConversionStatus::Failed {
            let error = result.error.as_deref().unwrap_or("unknown error");
            if color.enabled() {
                writeln!(w, "{} {}: {}", "FAILED".red().bold(), input, error)?;
            } else {
                writeln!(w, "FAILED {}: {}", input, error)?;
            }
        }
        for warning in &result.warnings {
            if color.enabled() {
                writeln!(w, "{} {}: {}", "WARNING".yellow(), input, warning.dimmed())?;
            } else {
                writeln!(w, "WARNING {}: {}", input, warning)?;
            }
        }
    }
    writeln!(w)?;
    Ok(())
}

/// Print the end-of-run summary.
pub fn print_summary(
    w: &mut dyn Write,
    summary: &RunSummary,
    dry_run: bool,
    color: ColorMode,
) -> std::io::Result<()> {
    if dry_run {
        writeln!(w, "Would process {} PDF files", summary.dry_run)?;
    }

    if color.enabled() {
        write!(
            w,
            "{} files: {} converted, {} skipped, {} failed",
            summary.total_candidates.bold(),
            summary.converted.green(),
            summary.skipped.dimmed(),
            if summary.failed > 0 {
                summary.failed.red().to_string()
            } else {
                summary.failed.to_string()
            }
        )?;
        if summary.with_warnings > 0 {
            write!(w, ", {} with warnings", summary.with_warnings.yellow())?;
        }
        if summary.ignored > 0 {
            write!(w, ", {} ignored", summary.ignored)?;
        }
        writeln!(w, " in {:.1?}", summary.elapsed)?;
    } else {
        writeln!(w, "{summary}")?;
    }

    if summary.discovery_errors > 0 {
        writeln!(
            w,
            "{} directories could not be read (see log)",
            summary.discovery_errors
        )?;
    }
    if summary.interrupted {
        let msg = format!(
            "Interrupted: {} files not started; rerun to resume",
            summary.not_started
        );
        if color.enabled() {
            writeln!(w, "{}", msg.yellow())?;
        } else {
            writeln!(w, "{}", msg)?;
        }
    }
    if let Some(error) = &summary.hash_store_error {
        let msg = format!("Hash store was not saved: {error}");
        if color.enabled() {
            writeln!(w, "{}", msg.red())?;
        } else {
            writeln!(w, "{}", msg)?;
        }
    }
    Ok(())
}
