//! Toolkit-independent state behind the window: inputs are validated here,
//! at most one download runs at a time, and every outcome ends up in the log.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::command::CommandBuilder;
use crate::config::{ConfigStore, Configuration};
use crate::model::{DownloadMode, DownloadRequest, ValidationError};
use crate::progress::parse_progress_from_line;
use crate::runner::{ProcessHandle, ProcessRunner, RunObserver, RunStatus};

/// Oldest log lines are dropped past this
pub const MAX_LOG_LINES: usize = 5000;

/// Lines shown in the output panel
#[derive(Debug, Default)]
pub struct LogPanel {
    lines: VecDeque<String>,
}

impl LogPanel {
    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == MAX_LOG_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn lines(&self) -> &VecDeque<String> {
        &self.lines
    }
}

/// Feeds run output into the log and the progress bar.
struct RunSink<'a> {
    log: &'a mut LogPanel,
    progress: &'a mut Option<f32>,
    tool: &'a str,
}

impl RunObserver for RunSink<'_> {
    fn on_line(&mut self, line: &str) {
        if let Some(fraction) = parse_progress_from_line(line) {
            *self.progress = Some(fraction);
        }
        self.log.push(line);
    }

    fn on_complete(&mut self, status: &RunStatus) {
        let message = match status {
            RunStatus::Success => "\n✅ Done!".to_owned(),
            RunStatus::Failure(Some(code)) => format!("\n❌ Error during download (exit code {code})."),
            RunStatus::Failure(None) => "\n❌ Error during download.".to_owned(),
            RunStatus::LaunchError(msg) => format!("\n❌ Could not start {}: {msg}", self.tool),
            RunStatus::Cancelled => "\n⏹ Download cancelled.".to_owned(),
        };
        self.log.push(message);
    }
}

pub struct DownloadController {
    store: ConfigStore,
    config: Configuration,
    builder: CommandBuilder,
    runner: ProcessRunner,
    active: Option<ProcessHandle>,
    log: LogPanel,
    progress: Option<f32>,
}

impl DownloadController {
    /// Loads the persisted configuration from `store`.
    pub fn new(store: ConfigStore, builder: CommandBuilder, runner: ProcessRunner) -> Self {
        let config = store.load();
        Self {
            store,
            config,
            builder,
            runner,
            active: None,
            log: LogPanel::default(),
            progress: None,
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn log(&self) -> &LogPanel {
        &self.log
    }

    /// Fraction of the current file downloaded, once yt-dlp has reported any.
    pub fn progress(&self) -> Option<f32> {
        self.progress
    }

    /// While true the Download action must stay disabled.
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    /// A folder picked in the browse dialog.
    pub fn choose_folder(&mut self, folder: &str) {
        self.config.remember_folder(folder);
        self.persist();
    }

    /// Validates the inputs and launches yt-dlp. Validation failures are
    /// also written to the log.
    pub fn start_download(&mut self, url: &str, folder: &str, mode: DownloadMode) -> Result<(), ValidationError> {
        if self.is_busy() {
            return Err(ValidationError::DownloadInProgress);
        }
        let request = match DownloadRequest::new(url, folder, mode) {
            Ok(request) => request,
            Err(err) => {
                self.log.push(format!("❌ {err}"));
                return Err(err);
            }
        };

        let folder = request.destination_folder.to_string_lossy().into_owned();
        self.config.remember_folder(&folder);
        self.persist();

        let argv = self.builder.build(&request);
        self.log.push(format!("▶ Starting download: {}\n", request.url));
        self.progress = None;

        let handle = self.runner.start(argv);
        debug!(argv = ?handle.argv(), ?mode, "Download started");
        self.active = Some(handle);
        Ok(())
    }

    /// Drains pending output; call once per frame on the UI thread.
    pub fn poll(&mut self) {
        let Some(handle) = self.active.as_mut() else {
            return;
        };
        let mut sink = RunSink {
            log: &mut self.log,
            progress: &mut self.progress,
            tool: self.builder.binary(),
        };
        if handle.dispatch(&mut sink) {
            debug!(status = ?handle.status(), "Download finished");
            self.active = None;
        }
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.active.as_mut() {
            self.runner.cancel(handle);
        }
    }

    fn persist(&mut self) {
        if let Err(err) = self.store.save(&self.config) {
            warn!(error = %err, "Failed to save config");
            self.log.push(format!("⚠ Error saving config: {err}"));
        }
    }
}
