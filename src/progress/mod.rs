//! Transfer progress reporting
//!
//! [`ProgressView`] is a pure projection of an `$implementation/ota/status`
//! payload. Sinks implementing [`Progress`] decide where it is shown.

use crate::protocol::{OtaStatus, StatusCode, TransferProgress};
use std::fmt;
use std::io::{self, Write};
use tracing::debug;

/// Number of cells in the rendered progress bar
pub const BAR_WIDTH: usize = 30;

/// Rendered state of an in-progress transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressView {
    pub written: u64,
    pub total: u64,
    /// Filled cells out of [`BAR_WIDTH`]
    pub filled: usize,
    /// True when the device reports every byte written
    pub complete: bool,
}

impl ProgressView {
    pub fn from_progress(progress: TransferProgress) -> Self {
        let filled = if progress.total == 0 {
            0
        } else {
            let written = progress.written.min(progress.total) as u128;
            (written * BAR_WIDTH as u128 / progress.total as u128) as usize
        };

        Self {
            written: progress.written,
            total: progress.total,
            filled,
            complete: progress.total > 0 && progress.is_complete(),
        }
    }

    /// Project a parsed status; only `206` carries a view
    pub fn from_status(status: &OtaStatus) -> Option<Self> {
        match (status.code, status.progress) {
            (StatusCode::InProgress, Some(progress)) => Some(Self::from_progress(progress)),
            _ => None,
        }
    }

    /// Project a raw `"<code> <written>/<total>"` payload
    pub fn parse(payload: &str) -> Option<Self> {
        OtaStatus::parse(payload)
            .ok()
            .and_then(|status| Self::from_status(&status))
    }

    /// Fraction written in `[0.0, 1.0]`; zero when the total is unknown
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.written.min(self.total) as f64) / (self.total as f64)
        }
    }
}

impl fmt::Display for ProgressView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}{}] {}/{}",
            "+".repeat(self.filled),
            " ".repeat(BAR_WIDTH - self.filled),
            self.written,
            self.total
        )
    }
}

/// Destination for operator-facing transfer progress
pub trait Progress: Send {
    fn report_transfer(&mut self, view: &ProgressView);

    /// One-line status message such as the flashing banner
    fn report_notice(&mut self, _notice: &str) {}
}

/// Discards every report
#[derive(Debug, Default)]
pub struct NoOpProgress;

impl Progress for NoOpProgress {
    fn report_transfer(&mut self, _view: &ProgressView) {}
}

/// Redraws a single progress line on a terminal
pub struct TerminalProgress<W: Write + Send> {
    out: W,
    completed: bool,
    /// A progress line is drawn without a trailing newline
    mid_line: bool,
    write_failed: bool,
}

impl TerminalProgress<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> TerminalProgress<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            completed: false,
            mid_line: false,
            write_failed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Output is best effort; only the first failure is logged
    fn check_write(&mut self, result: io::Result<()>) {
        if let Err(e) = result {
            if !self.write_failed {
                debug!(error = %e, "Progress output failed, further errors suppressed");
                self.write_failed = true;
            }
        }
    }
}

impl<W: Write + Send> Progress for TerminalProgress<W> {
    fn report_transfer(&mut self, view: &ProgressView) {
        let result = write!(self.out, "\r{view}");
        self.check_write(result);
        self.mid_line = true;
        if view.complete && !self.completed {
            let result = writeln!(self.out, "\nOTA completed. Waiting for reboot");
            self.check_write(result);
            self.completed = true;
            self.mid_line = false;
        }
        let result = self.out.flush();
        self.check_write(result);
    }

    fn report_notice(&mut self, notice: &str) {
        if self.mid_line {
            let result = writeln!(self.out);
            self.check_write(result);
            self.mid_line = false;
        }
        let result = writeln!(self.out, "{notice}");
        self.check_write(result);
        let result = self.out.flush();
        self.check_write(result);
    }
}
