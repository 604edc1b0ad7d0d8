use std::path::PathBuf;

use thiserror::Error;

/// Output configuration passed to yt-dlp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadMode {
    /// Extract the audio track and transcode it to MP3
    #[default]
    AudioOnly,
    /// Best video and best audio merged into one file
    VideoPlusAudio,
}

impl DownloadMode {
    /// Label shown next to the mode toggle
    pub fn label(self) -> &'static str {
        match self {
            DownloadMode::AudioOnly => "Audio (MP3)",
            DownloadMode::VideoPlusAudio => "Video + Audio",
        }
    }
}

/// Reasons a download is refused before any process is started.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please enter a YouTube link.")]
    EmptyUrl,
    #[error("Please select a download folder.")]
    EmptyFolder,
    #[error("A download is already running.")]
    DownloadInProgress,
}

/// One validated download action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Video link, trimmed
    pub url: String,
    /// Destination folder, trimmed but otherwise as typed
    pub destination_folder: PathBuf,
    pub mode: DownloadMode,
}

impl DownloadRequest {
    /// Trims both inputs and rejects empty ones. The URL is checked first.
    pub fn new(url: &str, folder: &str, mode: DownloadMode) -> Result<Self, ValidationError> {
        let url = url.trim();
        let folder = folder.trim();
        if url.is_empty() {
            return Err(ValidationError::EmptyUrl);
        }
        if folder.is_empty() {
            return Err(ValidationError::EmptyFolder);
        }
        Ok(Self {
            url: url.to_owned(),
            destination_folder: PathBuf::from(folder),
            mode,
        })
    }
}
