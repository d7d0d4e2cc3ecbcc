//! The viewer window: window selection, then the replicated bitmap with a
//! frame-rate overlay.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use eframe::egui::{self, Color32, RichText, TextureHandle, TextureOptions};
use tokio::runtime::Handle;
use tracing::{error, info};

use replicator_core::config::{Isolation, ReplicatorConfig};
use replicator_core::display::{DisplayLoop, HostSurface};
use replicator_core::registry::WindowRegistry;
use replicator_core::slot::SharedFrameSlot;
use replicator_core::worker::CaptureContext;
use replicator_platform::screen::{CaptureBackend, CaptureError};
use replicator_platform::window::WindowHandle;

pub const WINDOW_TITLE: &str = "Screen Replicator";

pub type BackendOpener = fn(WindowHandle) -> Result<Box<dyn CaptureBackend>, CaptureError>;

/// Poll interval while no frame has arrived yet.
const WAIT_POLL: Duration = Duration::from_millis(10);

enum Phase {
    Selecting {
        titles: Vec<String>,
        selected: Option<usize>,
    },
    Waiting {
        title: String,
    },
    Streaming(DisplayLoop),
    Failed(String),
}

enum Choice {
    Window(String),
    Declined,
    Quit,
}

/// [`HostSurface`] backed by an egui texture.
struct EguiSurface {
    ctx: egui::Context,
    texture: Option<TextureHandle>,
    label: String,
}

impl HostSurface for EguiSurface {
    fn set_size(&mut self, width: u32, height: u32) {
        let ppp = self.ctx.pixels_per_point();
        self.ctx.send_viewport_cmd(egui::ViewportCommand::InnerSize(egui::vec2(
            width as f32 / ppp,
            height as f32 / ppp,
        )));
    }

    fn set_bitmap(&mut self, pixels: &[u8], width: u32, height: u32) {
        let image = egui::ColorImage::from_rgb([width as usize, height as usize], pixels);
        self.texture = Some(self.ctx.load_texture("replica", image, TextureOptions::NEAREST));
    }

    fn update_bitmap_in_place(&mut self, pixels: &[u8]) {
        if let Some(texture) = &mut self.texture {
            let image = egui::ColorImage::from_rgb(texture.size(), pixels);
            texture.set(image, TextureOptions::NEAREST);
        }
    }

    fn set_rate_label(&mut self, text: &str) {
        self.label = text.to_string();
    }

    fn request_repaint(&mut self) {
        self.ctx.request_repaint();
    }
}

pub struct ReplicatorApp {
    config: ReplicatorConfig,
    registry: WindowRegistry,
    open_backend: BackendOpener,
    rt: Handle,
    slot: Arc<SharedFrameSlot>,
    context: Option<CaptureContext>,
    phase: Phase,
    surface: EguiSurface,
    next_tick: Instant,
    failure: Arc<Mutex<Option<String>>>,
}

impl ReplicatorApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        config: ReplicatorConfig,
        registry: WindowRegistry,
        open_backend: BackendOpener,
        rt: Handle,
        failure: Arc<Mutex<Option<String>>>,
    ) -> Self {
        let mut app = Self {
            surface: EguiSurface {
                ctx: cc.egui_ctx.clone(),
                texture: None,
                label: String::new(),
            },
            config,
            registry,
            open_backend,
            rt,
            slot: Arc::new(SharedFrameSlot::new()),
            context: None,
            phase: Phase::Failed(String::new()),
            next_tick: Instant::now(),
            failure,
        };

        match app.config.window_title.clone() {
            Some(title) => app.start(title),
            None => match app.registry.list_visible_windows() {
                Ok(titles) => {
                    info!("{} visible windows", titles.len());
                    app.phase = Phase::Selecting {
                        titles,
                        selected: None,
                    };
                }
                Err(e) => app.fail(format!("cannot list windows: {}", e)),
            },
        }
        app
    }

    /// Resolve `title` and start the capture context for it.
    fn start(&mut self, title: String) {
        let handle = match self.registry.resolve_handle(&title) {
            Ok(handle) => handle,
            Err(e) => return self.fail(e.to_string()),
        };
        info!(
            "replicating \"{}\" (window {}, isolation={})",
            title, handle, self.config.isolation
        );

        let region = self.config.region;
        let slot = Arc::clone(&self.slot);
        let context = {
            let _guard = self.rt.enter();
            match self.config.isolation {
                Isolation::Process => std::env::current_exe()
                    .context("cannot locate own executable")
                    .and_then(|exe| CaptureContext::spawn_process(&exe, handle, region, slot)),
                Isolation::Thread => {
                    CaptureContext::spawn_thread(handle, region, Box::new(self.open_backend), slot)
                }
            }
        };

        match context {
            Ok(context) => {
                self.context = Some(context);
                self.phase = Phase::Waiting { title };
            }
            Err(e) => self.fail(format!("{:#}", e)),
        }
    }

    fn fail(&mut self, message: String) {
        error!("{}", message);
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert_with(|| message.clone());
        }
        self.phase = Phase::Failed(message);
    }

    /// Run a display tick if one is due and schedule the next repaint.
    fn drive_display(&mut self, ctx: &egui::Context) {
        let now = Instant::now();

        if matches!(self.phase, Phase::Waiting { .. }) {
            match self.slot.read_latest() {
                Some(first) => {
                    let display = DisplayLoop::start(
                        Arc::clone(&self.slot),
                        self.config.display_settings(),
                        &first,
                        &mut self.surface,
                        now,
                    );
                    self.phase = Phase::Streaming(display);
                    self.next_tick = now;
                }
                None => {
                    ctx.request_repaint_after(WAIT_POLL);
                    return;
                }
            }
        }

        if let Phase::Streaming(display) = &mut self.phase {
            if now >= self.next_tick {
                let delay = display.tick(&mut self.surface, now);
                self.next_tick = now + delay;
            }
            ctx.request_repaint_after(self.next_tick.saturating_duration_since(now));
        }
    }

    fn show_selection(&mut self, ctx: &egui::Context) -> Option<Choice> {
        let Phase::Selecting { titles, selected } = &mut self.phase else {
            return None;
        };

        let mut choice = None;
        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("Select a window to replicate");
            ui.separator();

            egui::ScrollArea::vertical()
                .max_height((ui.available_height() - 40.0).max(80.0))
                .show(ui, |ui| {
                    for (i, title) in titles.iter().enumerate() {
                        let text = if title.is_empty() { "(untitled)" } else { title.as_str() };
                        if ui.selectable_label(*selected == Some(i), text).clicked() {
                            *selected = Some(i);
                        }
                    }
                });

            ui.separator();
            ui.horizontal(|ui| {
                if ui
                    .add_enabled(selected.is_some(), egui::Button::new("Okay"))
                    .clicked()
                {
                    choice = selected
                        .and_then(|i| titles.get(i).cloned())
                        .map(Choice::Window);
                }
                if ui.button("Quit").clicked() {
                    choice = Some(Choice::Declined);
                }
            });
        });
        choice
    }

    fn show_waiting(&self, ctx: &egui::Context) {
        let Phase::Waiting { title } = &self.phase else {
            return;
        };
        egui::CentralPanel::default().show(ctx, |ui| {
            ui.centered_and_justified(|ui| {
                ui.horizontal(|ui| {
                    ui.spinner();
                    ui.label(format!("Waiting for the first frame of \"{}\"", title));
                });
            });
        });
    }

    fn show_stream(&self, ctx: &egui::Context) {
        egui::CentralPanel::default()
            .frame(egui::Frame::none())
            .show(ctx, |ui| {
                let Some(texture) = &self.surface.texture else {
                    return;
                };
                let image = egui::Image::from_texture(egui::load::SizedTexture::from_handle(texture))
                    .fit_to_exact_size(ui.available_size());
                let rect = ui.add(image).rect;
                ui.painter().text(
                    rect.left_top() + egui::vec2(6.0, 4.0),
                    egui::Align2::LEFT_TOP,
                    &self.surface.label,
                    egui::FontId::proportional(14.0),
                    Color32::YELLOW,
                );
            });
    }

    fn show_failure(&self, ctx: &egui::Context) -> Option<Choice> {
        let Phase::Failed(message) = &self.phase else {
            return None;
        };
        let mut choice = None;
        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("Cannot replicate window");
            ui.separator();
            ui.label(RichText::new(message).color(Color32::from_rgb(220, 80, 80)));
            ui.add_space(12.0);
            if ui.button("Quit").clicked() {
                choice = Some(Choice::Quit);
            }
        });
        choice
    }
}

impl eframe::App for ReplicatorApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if let Some(fault) = self.slot.take_fault() {
            self.fail(fault);
        }

        let choice = match self.phase {
            Phase::Selecting { .. } => self.show_selection(ctx),
            Phase::Waiting { .. } | Phase::Streaming(_) => {
                self.drive_display(ctx);
                if matches!(self.phase, Phase::Streaming(_)) {
                    self.show_stream(ctx);
                } else {
                    self.show_waiting(ctx);
                }
                None
            }
            Phase::Failed(_) => self.show_failure(ctx),
        };

        match choice {
            Some(Choice::Window(title)) => self.start(title),
            Some(Choice::Declined) => {
                info!("no window selected");
                ctx.send_viewport_cmd(egui::ViewportCommand::Close);
            }
            Some(Choice::Quit) => ctx.send_viewport_cmd(egui::ViewportCommand::Close),
            None => {}
        }
    }

    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        // Ticking has ended; shutdown raises the stop flag before waiting.
        if let Phase::Streaming(display_loop) = &self.phase {
            let (width, height) = display_loop.displayed_size();
            info!(
                "closing after {} ticks at {:.1} fps ({}x{})",
                display_loop.ticks(),
                display_loop.rate(),
                width,
                height
            );
        }

        if let Some(context) = self.context.take() {
            let timeout = self.config.stop_timeout();
            self.rt.block_on(context.shutdown(&self.slot, timeout));
        } else {
            self.slot.request_stop();
        }
        self.surface.texture = None;
    }
}
