use std::path::Path;

use crate::model::{DownloadMode, DownloadRequest};

/// Environment variable that overrides the yt-dlp executable
pub const BINARY_ENV: &str = "YTDLP_BIN";

/// File name template handed to yt-dlp; it fills in title and extension itself
const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

/// Format selector for merged downloads, falling back to the best single stream
const VIDEO_FORMAT: &str = "bestvideo+bestaudio/best";

/// Maps a [`DownloadRequest`] to the yt-dlp argument vector.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    binary: String,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        let bin = if cfg!(target_os = "windows") { "yt-dlp.exe" } else { "yt-dlp" };
        Self::new(bin)
    }
}

impl CommandBuilder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Uses `$YTDLP_BIN` when set and non-empty, the platform default otherwise.
    pub fn from_env() -> Self {
        match std::env::var(BINARY_ENV) {
            Ok(bin) if !bin.trim().is_empty() => Self::new(bin.trim()),
            _ => Self::default(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Full argument vector, executable first and URL last.
    pub fn build(&self, request: &DownloadRequest) -> Vec<String> {
        let mut args = vec![self.binary.clone()];

        match request.mode {
            DownloadMode::AudioOnly => {
                args.extend(["-x", "--audio-format", "mp3"].map(String::from));
            }
            DownloadMode::VideoPlusAudio => {
                args.extend(["-f", VIDEO_FORMAT].map(String::from));
            }
        }

        args.extend(
            [
                "--embed-thumbnail",
                "--add-metadata",
                "--metadata-from-title",
                "%(title)s",
                "--parse-metadata",
                "title:%(title)s",
                "--parse-metadata",
                "uploader:%(artist)s",
            ]
            .map(String::from),
        );

        args.push("-o".to_owned());
        args.push(output_template(&request.destination_folder));
        args.push(request.url.clone());
        args
    }
}

/// `<folder>/%(title)s.%(ext)s`, with the folder kept as given.
pub fn output_template(folder: &Path) -> String {
    folder.join(OUTPUT_TEMPLATE).to_string_lossy().into_owned()
}
