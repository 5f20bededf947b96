//! The "never make it worse" safety net.
//!
//! After the container is closed we compare sizes. If the transcoded file is not smaller than the
//! source, we replace it with a verbatim copy of the source. The copy is staged in a temp file
//! next to the output and persisted over it, so at no point is there a half-written file at the
//! output path.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tempfile::NamedTempFile;

use crate::error::Result;

/// What the guard left at the output path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardOutcome {
    pub input_bytes: u64,
    /// Size of the file now at the output path.
    pub output_bytes: u64,
    /// Size the transcoded file had before the guard looked at it.
    pub transcoded_bytes: u64,
    /// `true` if the output is a copy of the input.
    pub kept_original: bool,
}

impl GuardOutcome {
    /// Final size relative to the input (`1.0` = no reduction).
    pub fn ratio(&self) -> f64 {
        if self.input_bytes == 0 {
            return 1.0;
        }
        self.output_bytes as f64 / self.input_bytes as f64
    }
}

/// Compare sizes and fall back to a copy of `input` when `output` is not smaller.
pub fn enforce(input: &Path, output: &Path) -> Result<GuardOutcome> {
    let input_bytes = file_len(input)?;
    let transcoded_bytes = file_len(output)?;

    if transcoded_bytes < input_bytes {
        return Ok(GuardOutcome {
            input_bytes,
            output_bytes: transcoded_bytes,
            transcoded_bytes,
            kept_original: false,
        });
    }

    tracing::warn!(
        input_bytes,
        transcoded_bytes,
        "transcoded output is not smaller than the source; keeping the original"
    );

    replace_with_copy(input, output)?;
    let output_bytes = file_len(output)?;

    Ok(GuardOutcome {
        input_bytes,
        output_bytes,
        transcoded_bytes,
        kept_original: true,
    })
}

fn file_len(path: &Path) -> Result<u64> {
    let meta = fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    Ok(meta.len())
}

fn replace_with_copy(input: &Path, output: &Path) -> Result<()> {
    let dir = staging_dir(output);
    let mut staged = NamedTempFile::new_in(&dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;

    let mut src =
        File::open(input).with_context(|| format!("failed to open {}", input.display()))?;
    io::copy(&mut src, staged.as_file_mut())
        .with_context(|| format!("failed to copy {}", input.display()))?;
    staged.as_file_mut().flush().context("failed to flush copy")?;

    staged
        .persist(output)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to replace {}", output.display()))?;
    Ok(())
}

fn staging_dir(output: &Path) -> PathBuf {
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
