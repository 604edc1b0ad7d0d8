use std::time::Duration;

use eframe::{App, Frame, egui};
use rfd::FileDialog;
use tracing::debug;

use crate::controller::DownloadController;
use crate::model::DownloadMode;

/// Window state; everything that outlives a frame besides the text fields
/// lives in the controller.
pub struct DownloaderApp {
    controller: DownloadController,
    /// Input field for the video URL
    url_input: String,
    /// Destination folder, prefilled with the last one used
    folder_input: String,
    mode: DownloadMode,
    /// Pointer was over the recent-folder list last frame
    recent_hovered: bool,
    /// Folder text was typed into, so the recent list is filtered by it
    filter_recent: bool,
}

impl DownloaderApp {
    pub fn new(controller: DownloadController) -> Self {
        let folder_input = controller.config().last_folder.clone().unwrap_or_default();
        Self {
            controller,
            url_input: String::new(),
            folder_input,
            mode: DownloadMode::default(),
            recent_hovered: false,
            filter_recent: false,
        }
    }

    fn folder_row(&mut self, ui: &mut egui::Ui) {
        ui.label("Download Folder:");
        let field = ui
            .horizontal(|ui| {
                let field = ui.add(
                    egui::TextEdit::singleline(&mut self.folder_input)
                        .desired_width(ui.available_width() - 80.0),
                );
                if ui.button("Browse").clicked() {
                    let mut dialog = FileDialog::new();
                    let current = self.folder_input.trim().to_owned();
                    if !current.is_empty() {
                        dialog = dialog.set_directory(&current);
                    }
                    if let Some(folder) = dialog.pick_folder() {
                        self.folder_input = folder.display().to_string();
                        self.filter_recent = false;
                        self.controller.choose_folder(&self.folder_input);
                    }
                }
                field
            })
            .inner;

        if field.changed() {
            self.filter_recent = true;
        } else if field.lost_focus() {
            self.filter_recent = false;
        }

        let open = field.has_focus() || field.hovered() || self.recent_hovered;
        let filter = if self.filter_recent { self.folder_input.as_str() } else { "" };
        let matches: Vec<String> = self
            .controller
            .config()
            .recent_matching(filter)
            .map(str::to_owned)
            .collect();

        self.recent_hovered = false;
        if open && !matches.is_empty() {
            let list = ui.group(|ui| {
                for path in &matches {
                    let current = *path == self.folder_input;
                    if ui.selectable_label(current, path).clicked() {
                        self.folder_input = path.clone();
                        self.filter_recent = false;
                    }
                }
            });
            self.recent_hovered = ui.rect_contains_pointer(list.response.rect);
        }
    }

    fn action_row(&mut self, ui: &mut egui::Ui) {
        let busy = self.controller.is_busy();
        ui.horizontal(|ui| {
            for mode in [DownloadMode::AudioOnly, DownloadMode::VideoPlusAudio] {
                ui.add_enabled_ui(!busy, |ui| {
                    ui.radio_value(&mut self.mode, mode, mode.label());
                });
            }
        });
        ui.horizontal(|ui| {
            if ui.add_enabled(!busy, egui::Button::new("Download")).clicked() {
                if let Err(err) = self
                    .controller
                    .start_download(&self.url_input, &self.folder_input, self.mode)
                {
                    debug!(%err, "Download not started");
                }
            }
            if ui.add_enabled(busy, egui::Button::new("Cancel")).clicked() {
                self.controller.cancel();
            }
        });
        if let Some(fraction) = self.controller.progress().filter(|_| busy) {
            ui.add(egui::ProgressBar::new(fraction).show_percentage());
        }
    }

    fn log_view(&self, ui: &mut egui::Ui) {
        let lines = self.controller.log().lines();
        let row_height = ui.text_style_height(&egui::TextStyle::Monospace);
        egui::ScrollArea::vertical()
            .auto_shrink([false; 2])
            .stick_to_bottom(true)
            .show_rows(ui, row_height, lines.len(), |ui, rows| {
                for line in lines.range(rows) {
                    ui.label(egui::RichText::new(line.as_str()).monospace());
                }
            });
    }
}

impl App for DownloaderApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut Frame) {
        // Pull whatever the worker produced since the last frame
        self.controller.poll();

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.label("YouTube Link:");
            ui.add_enabled(
                !self.controller.is_busy(),
                egui::TextEdit::singleline(&mut self.url_input)
                    .hint_text("Paste YouTube link here...")
                    .desired_width(f32::INFINITY),
            );

            self.folder_row(ui);
            self.action_row(ui);
            ui.separator();
            self.log_view(ui);
        });

        if self.controller.is_busy() {
            ctx.request_repaint_after(Duration::from_millis(100));
        }
    }
}
