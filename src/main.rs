// =============================================================================
// HELLO TRIANGLE - one textured triangle through an explicit graphics API
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (App)                                         │
// │    └── FrameLoop (frame)            API-independent state       │
// │          └── VulkanRenderer (backend)                           │
// │                └── Device, Swapchain, Pipeline, Upload, Fence   │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Recreate the swapchain if the window changed size
// 2. Acquire a back buffer
// 3. Record: one-time upload, clear, draw 3 vertices
// 4. Submit + present
// 5. Signal the fence and block until the GPU caught up
//
// =============================================================================

mod backend;
mod config;
mod error;
mod frame;
mod geometry;
mod hot_reload;

use anyhow::{Context, Result};
use backend::device::MIN_API_VERSION;
use backend::{VulkanDevice, VulkanRenderer};
use config::Config;
use error::RenderError;
use frame::{FrameLoop, FrameOutcome, WindowState};
use hot_reload::ShaderWatcher;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml; the outcome is logged once the
    // logger (configured by that file) exists
    let (config, source) = Config::load();

    init_logging(&config)?;
    source.log();
    log::debug!("Config: {:?}", config);
    log::info!("Starting {}", config.window.title);
    log::info!("Window: {}x{}", config.window.width, config.window.height);
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize logging, optionally into a file instead of stderr
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    if config.debug.log_to_file {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {:?}", config.debug.log_file))?;

        writeln!(file, "=== {} Log ===", config.window.title)?;
        writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
        writeln!(file)?;

        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.try_init()?;
    Ok(())
}

/// Map a key name from the config onto a physical key.
fn parse_key(name: &str) -> Option<KeyCode> {
    let key = match name.to_ascii_lowercase().as_str() {
        "escape" | "esc" => KeyCode::Escape,
        "q" => KeyCode::KeyQ,
        "x" => KeyCode::KeyX,
        "space" => KeyCode::Space,
        "enter" | "return" => KeyCode::Enter,
        "backspace" => KeyCode::Backspace,
        "f4" => KeyCode::F4,
        "f10" => KeyCode::F10,
        "f12" => KeyCode::F12,
        _ => return None,
    };
    Some(key)
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer owns the surface, which has to
/// go before the window it was created from.
struct App {
    config: Config,
    quit_key: Option<KeyCode>,
    window_state: Arc<WindowState>,

    frames: Option<FrameLoop<VulkanRenderer>>,
    shader_watcher: Option<ShaderWatcher>,
    window: Option<Arc<Window>>,

    /// First fatal error, handed back to `main`
    failure: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        let quit_key = parse_key(&config.controls.quit_key);
        if quit_key.is_none() {
            log::warn!("Unknown quit key '{}', quitting only via the window", config.controls.quit_key);
        }
        let window_state = Arc::new(WindowState::new(config.window.width, config.window.height));

        Self {
            config,
            quit_key,
            window_state,
            frames: None,
            shader_watcher: None,
            window: None,
            failure: None,
        }
    }

    /// Device, swapchain manager, pipeline and upload resources. The swap
    /// chain itself is created by the first frame, since the window starts
    /// with its resize flag raised.
    fn init_renderer(&mut self, window: &Window) -> Result<FrameLoop<VulkanRenderer>> {
        log::info!("Initializing Vulkan...");

        // Validation only in debug builds, and only if the config wants it
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(
            &self.config.window.title,
            enable_validation,
            MIN_API_VERSION,
            window.raw_display_handle(),
            window.raw_window_handle(),
        )?;

        let renderer = VulkanRenderer::new(device, &self.config)?;

        if self.config.debug.hot_reload_shaders {
            match ShaderWatcher::new(renderer.shader_path()) {
                Ok(watcher) => self.shader_watcher = Some(watcher),
                Err(e) => log::warn!("Shader hot reload disabled: {:#}", e),
            }
        }

        let size = window.inner_size();
        self.window_state.notify_resize(size.width, size.height);

        log::info!("Vulkan initialized successfully!");

        Ok(FrameLoop::new(
            renderer,
            self.window_state.clone(),
            self.config.graphics.clear_color,
            geometry::TRIANGLE.len() as u32,
            Instant::now(),
        ))
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        if RenderError::is_device_lost(&error) {
            log::error!("GPU device lost: {:#}", error);
        } else {
            log::error!("{:#}", error);
        }
        if self.failure.is_none() {
            self.failure = Some(error);
        }
        event_loop.exit();
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(frames) = self.frames.as_mut() else {
            return;
        };

        // Every frame ends with the GPU idle, so swapping the pipeline here
        // never races in-flight work
        if self.shader_watcher.as_ref().is_some_and(|w| w.take_change()) {
            if let Err(e) = frames.backend_mut().reload_shaders() {
                log::error!("Shader reload failed, keeping previous pipeline: {:#}", e);
            }
        }

        match frames.render_frame(Instant::now()) {
            Ok(FrameOutcome::Rendered(Some(report))) => {
                if self.config.debug.show_fps {
                    if let Some(window) = &self.window {
                        window.set_title(&report.title(&self.config.window.title));
                    }
                }
            }
            Ok(_) => {}
            Err(e) => self.fail(event_loop, e.context("Frame failed")),
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::anyhow!("Failed to create window: {}", e));
                return;
            }
        };

        match self.init_renderer(&window) {
            Ok(frames) => self.frames = Some(frames),
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.window_state.notify_resize(size.width, size.height);
            }

            WindowEvent::RedrawRequested => self.redraw(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                let quit = match (event.physical_key, self.quit_key) {
                    (PhysicalKey::Code(code), Some(quit_key)) => code == quit_key,
                    _ => false,
                };
                if event.state.is_pressed() && quit {
                    log::info!("Quit key pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // GPU objects go before the window they present to
        self.shader_watcher = None;
        self.frames = None;
        log::info!("Cleanup complete");
    }
}
