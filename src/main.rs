//! Desktop front-end for yt-dlp: fetches a video as MP3 or as merged
//! video+audio into a chosen folder, streaming the tool's console output
//! into a log panel.

// egui window and input handling
mod app;
// yt-dlp argument vectors
mod command;
// config.json persistence
mod config;
// Validation, run gating and log state behind the window
mod controller;
// Download mode and request types
mod model;
// Progress parsing utilities
mod progress;
// Background process execution
mod runner;

use std::error::Error;

use eframe::egui::{self, Visuals};
use once_cell::sync::OnceCell;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

use app::DownloaderApp;
use command::CommandBuilder;
use config::ConfigStore;
use controller::DownloadController;
use runner::ProcessRunner;

const APP_TITLE: &str = "YouTube to MP3 Downloader";

// Global Tokio runtime; worker tasks must outlive the window closure
static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Program entry point: initializes logging and the runtime, then launches the GUI
fn main() -> Result<(), Box<dyn Error>> {
    // RUST_LOG wins over the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = RUNTIME.get_or_try_init(Runtime::new)?;

    let store = ConfigStore::default();
    let builder = CommandBuilder::from_env();
    info!(config = %store.path().display(), tool = builder.binary(), "Starting downloader");
    let controller = DownloadController::new(store, builder, ProcessRunner::new(rt.handle().clone()));

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(APP_TITLE)
            .with_inner_size([600.0, 650.0]),
        ..Default::default()
    };
    eframe::run_native(
        APP_TITLE,
        options,
        Box::new(|cc| {
            cc.egui_ctx.set_visuals(Visuals::dark());
            Box::new(DownloaderApp::new(controller))
        }),
    )?;
    Ok(())
}
