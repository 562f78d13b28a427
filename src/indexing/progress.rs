use crate::core::error::{Error, Result};
use std::io::Write;
use std::str::FromStr;

/// Receiver of indexing progress
pub trait ProgressBar {
    /// Called with the running count of processed files
    fn update(&mut self, processed: usize);
    /// Called once when the update completes
    fn finish(&mut self);
}

/// Which progress bar an update should drive
#[derive(Default)]
pub enum Progress<'a> {
    /// Built-in console bar on stderr
    #[default]
    Default,
    /// No progress output at all
    Disabled,
    Custom(&'a mut dyn ProgressBar),
}

impl<'a> Progress<'a> {
    pub fn custom(bar: &'a mut dyn ProgressBar) -> Self {
        Self::Custom(bar)
    }
}

impl From<bool> for Progress<'_> {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::Default
        } else {
            Self::Disabled
        }
    }
}

impl FromStr for Progress<'static> {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "true" | "default" | "on" => Ok(Self::Default),
            "false" | "off" | "none" => Ok(Self::Disabled),
            other => Err(Error::InvalidProgress(other.to_string())),
        }
    }
}

/// Console progress bar written to stderr
pub struct ConsoleBar {
    label: String,
    total: usize,
}

impl ConsoleBar {
    pub fn new(label: impl Into<String>, total: usize) -> Self {
        let label = label.into();
        eprintln!("{}", label);
        Self { label, total }
    }
}

impl ProgressBar for ConsoleBar {
    fn update(&mut self, processed: usize) {
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r  {}/{} files", processed.min(self.total), self.total);
        let _ = stderr.flush();
    }

    fn finish(&mut self) {
        eprintln!("\r  {}/{} files: {} done", self.total, self.total, self.label);
    }
}

/// Drives a bar every `interval` processed files, but only once `total`
/// reaches the configured minimum
pub(crate) struct ProgressTracker<'a> {
    bar: Option<Box<dyn ProgressBar + 'a>>,
    interval: usize,
    processed: usize,
    last_reported: usize,
}

struct Borrowed<'b>(&'b mut dyn ProgressBar);

impl ProgressBar for Borrowed<'_> {
    fn update(&mut self, processed: usize) {
        self.0.update(processed);
    }

    fn finish(&mut self) {
        self.0.finish();
    }
}

impl<'a> ProgressTracker<'a> {
    pub(crate) fn new(
        progress: Progress<'a>,
        label: &str,
        total: usize,
        interval: usize,
        min_files: usize,
    ) -> Self {
        let bar: Option<Box<dyn ProgressBar + 'a>> = if total < min_files || total == 0 {
            tracing::debug!("Skipping progress for {} files (minimum {})", total, min_files);
            None
        } else {
            match progress {
                Progress::Default => Some(Box::new(ConsoleBar::new(label, total))),
                Progress::Disabled => None,
                Progress::Custom(bar) => Some(Box::new(Borrowed(bar))),
            }
        };
        Self {
            bar,
            interval: interval.max(1),
            processed: 0,
            last_reported: 0,
        }
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.processed += n;
        if self.processed - self.last_reported >= self.interval {
            self.last_reported = self.processed;
            if let Some(bar) = self.bar.as_mut() {
                bar.update(self.processed);
            }
        }
    }

    pub(crate) fn finish(mut self) {
        if let Some(bar) = self.bar.as_mut() {
            if self.processed != self.last_reported {
                bar.update(self.processed);
            }
            bar.finish();
        }
    }
}
