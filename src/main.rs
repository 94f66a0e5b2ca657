//! area-present
//!
//! Headless presentation demo: drives an animated scene onto in-memory
//! outputs (optionally mirrored) through the frame scheduler, the same path a
//! display backend would take.

use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use area_present::backend::headless::{HeadlessConfig, HeadlessHandle, HeadlessOutput, MemoryAllocator};
use area_present::backend::{Fourcc, Mode, PlaneKind};
use area_present::compositor::fps::FrameStats;
use area_present::compositor::layer::Layer;
use area_present::config::{Config, OutputConfig};
use area_present::render::{ItemId, RasterRenderer, Scene, SceneRenderer};
use area_present::shared::{Point, Rect, Size};
use area_present::{FrameScheduler, OutputEvent, OutputHelper, OutputId, OutputOptions};

const CURSOR_SIZE: Size = Size::new(24, 24);
const ANIMATION_INTERVAL: Duration = Duration::from_millis(33);

/// Command line options
struct Args {
    frames: Option<u64>,
    config: Option<PathBuf>,
    json: bool,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = Args {
            frames: None,
            config: None,
            json: false,
        };
        let mut iter = std::env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--frames" | "-n" => {
                    let value = iter.next().context("--frames needs a value")?;
                    args.frames = Some(value.parse().context("--frames must be a number")?);
                }
                "--config" | "-c" => {
                    args.config = Some(iter.next().context("--config needs a path")?.into());
                }
                "--json" => args.json = true,
                other => bail!("unknown argument {:?}", other),
            }
        }
        Ok(args)
    }
}

/// Moving rectangle of the demo scene
struct Mover {
    item: ItemId,
    rect: Rect,
    velocity: Point,
}

/// Main application state
struct PresentApp {
    scheduler: FrameScheduler<RasterRenderer>,
    handles: Vec<(OutputId, HeadlessHandle)>,
    movers: Vec<Mover>,
    cursor: Option<Layer>,
    /// Scene area the animation bounces in
    arena: Rect,
    tick: u64,
}

impl PresentApp {
    fn new(config: &Config) -> Result<Self> {
        let outputs = if config.outputs.is_empty() {
            default_outputs()
        } else {
            config.outputs.clone()
        };

        let renderer = RasterRenderer::new(Scene::new(config.render.clear_color), config.render.path);
        let mut scheduler = FrameScheduler::new(renderer, config.render.preferred_format);
        let allocator = Rc::new(MemoryAllocator::new());
        let options = OutputOptions::from(config);

        let mut handles = Vec::new();
        let mut by_name = HashMap::new();
        for output in &outputs {
            let (backend, handle) = HeadlessOutput::new(headless_config(output));
            let mut helper = OutputHelper::new(Box::new(backend), allocator.clone(), options.clone());
            let viewport = helper.viewport().with_origin(Point::new(output.x, output.y));
            helper.set_viewport(viewport);
            let id = scheduler.attach(helper);
            by_name.insert(output.name.clone(), id);
            handles.push((id, handle));
        }

        for output in &outputs {
            let Some(primary) = &output.mirror_of else {
                continue;
            };
            let (Some(primary), Some(mirror)) = (by_name.get(primary), by_name.get(&output.name)) else {
                bail!("output {:?} mirrors unknown output {:?}", output.name, primary);
            };
            scheduler.add_mirror(*primary, *mirror);
        }

        let primary = outputs
            .iter()
            .find(|output| output.mirror_of.is_none())
            .context("no primary output configured")?;
        let arena = Rect::new(primary.x, primary.y, primary.width, primary.height);

        let mut app = Self {
            scheduler,
            handles,
            movers: Vec::new(),
            cursor: None,
            arena,
            tick: 0,
        };
        app.populate_scene();
        if let Some(id) = by_name.get(&primary.name) {
            app.setup_cursor(*id);
        }
        Ok(app)
    }

    fn populate_scene(&mut self) {
        let colors = [0xffe0_6c75, 0xff98_c379, 0xff61_afef, 0xc0e5_c07b];
        let scene = self.scheduler.renderer_mut().scene_mut();
        for (index, color) in colors.into_iter().enumerate() {
            let offset = index as i32 * 90;
            let rect = Rect::new(self.arena.x + 40 + offset, self.arena.y + 30 + offset, 120, 80);
            let item = scene.add_item(rect, color, index as i32);
            self.movers.push(Mover {
                item,
                rect,
                velocity: Point::new(3 + index as i32, 2 + index as i32 % 2),
            });
        }
    }

    /// Put a pointer on a cursor plane of `primary`; mirrors pick it up
    /// through the layer router.
    fn setup_cursor(&mut self, primary: OutputId) {
        let formats = self.scheduler.renderer().formats();
        let Some(helper) = self.scheduler.output(primary) else {
            return;
        };
        let mut swapchain =
            match helper.create_plane_swapchain(PlaneKind::Cursor, CURSOR_SIZE, Fourcc::Argb8888, &formats) {
                Ok(swapchain) => swapchain,
                Err(e) => {
                    warn!("No cursor plane on {}: {}", helper.name(), e);
                    return;
                }
            };
        let slot = match swapchain.acquire() {
            Ok(Some(slot)) => slot,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to allocate cursor buffer: {}", e);
                return;
            }
        };
        {
            let mut buffer = slot.buffer_mut();
            for row in 0..CURSOR_SIZE.height {
                buffer.fill_rect(&Rect::new(0, row as i32, row + 1, 1), 0xffff_ffff);
            }
        }

        let layer = Layer::new(PlaneKind::Cursor, CURSOR_SIZE);
        layer.set_buffer(slot);
        layer.set_position(Point::new(self.arena.x + 200, self.arena.y + 200));
        self.scheduler.set_primary_layers(primary, vec![layer.clone()]);
        self.cursor = Some(layer);
    }

    fn animate(&mut self) {
        self.tick += 1;
        let arena = self.arena;
        let scene = self.scheduler.renderer_mut().scene_mut();
        for mover in &mut self.movers {
            let mut next = mover.rect.translate(mover.velocity.x, mover.velocity.y);
            if next.x < arena.x || next.right() > arena.right() {
                mover.velocity.x = -mover.velocity.x;
                next = mover.rect.translate(mover.velocity.x, 0);
            }
            if next.y < arena.y || next.bottom() > arena.bottom() {
                mover.velocity.y = -mover.velocity.y;
                next = Rect::new(next.x, mover.rect.y + mover.velocity.y, next.width, next.height);
            }
            mover.rect = next;
            scene.move_item(mover.item, next.loc());
        }

        if let Some(cursor) = &self.cursor {
            let phase = self.tick as f64 / 20.0;
            let x = arena.x + (arena.width as f64 * (0.5 + 0.4 * phase.cos())) as i32;
            let y = arena.y + (arena.height as f64 * (0.5 + 0.4 * phase.sin())) as i32;
            cursor.set_position(Point::new(x, y));
        }
        self.scheduler.update();
    }

    /// Turn completed page flips into frame events
    fn vblank(&mut self) {
        for (id, handle) in &self.handles {
            if handle.take_page_flip() {
                self.scheduler.handle_output_event(*id, OutputEvent::Frame);
            }
        }
    }

    fn stats(&self) -> Vec<FrameStats> {
        self.scheduler.outputs().iter().map(OutputHelper::stats).collect()
    }
}

fn default_outputs() -> Vec<OutputConfig> {
    vec![
        OutputConfig::default(),
        OutputConfig {
            name: "HEADLESS-2".to_string(),
            width: 640,
            height: 360,
            overlay_planes: 0,
            mirror_of: Some("HEADLESS-1".to_string()),
            ..Default::default()
        },
    ]
}

fn headless_config(output: &OutputConfig) -> HeadlessConfig {
    let mut config = HeadlessConfig::new(output.name.clone(), Size::new(output.width, output.height));
    config.mode = Mode::new(config.mode.size, output.refresh_mhz);
    config.scale = output.scale;
    config.transform = output.transform;
    config.overlay_planes = output.overlay_planes;
    config.reject_modifiers = output.reject_modifiers;
    config
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "area_present=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting Area presentation runtime");

    let args = Args::parse()?;
    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // Setup signal handlers for graceful shutdown
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    let _ = tx.send(()).await;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    let _ = tx.send(()).await;
                }
            }
        });
    }

    let mut app = PresentApp::new(&config)?;
    let wake = app.scheduler.wake_handle();
    let mut frames_rx = app.scheduler.subscribe();
    app.scheduler
        .initialize()
        .context("Failed to initialize renderer")?;

    let refresh = app
        .scheduler
        .outputs()
        .iter()
        .map(|helper| helper.mode().frame_interval())
        .min()
        .filter(|interval| !interval.is_zero())
        .unwrap_or(Duration::from_millis(config.scheduler.fallback_interval_ms));
    let mut vblank = tokio::time::interval(refresh);
    let mut animation = tokio::time::interval(ANIMATION_INTERVAL);
    let stats_enabled = config.scheduler.stats_interval_ms > 0;
    let mut stats = tokio::time::interval(Duration::from_millis(config.scheduler.stats_interval_ms.max(1)));

    let mut frames = 0u64;
    loop {
        tokio::select! {
            _ = wake.notified() => {
                let committed = app.scheduler.render();
                debug!("Render pass committed {} frames", committed);
            }
            _ = vblank.tick() => app.vblank(),
            _ = animation.tick() => app.animate(),
            Some(done) = frames_rx.recv() => {
                frames += 1;
                debug!("{} frame {} done ({} px damaged)", done.output, done.sequence, done.damage.area());
                if args.frames.is_some_and(|limit| frames >= limit) {
                    info!("Presented {} frames, exiting", frames);
                    break;
                }
            }
            _ = stats.tick(), if stats_enabled => {
                for stat in app.stats() {
                    info!(
                        "{}: {} commits, {} skipped, {} failures, {:.1} fps",
                        stat.output, stat.commits, stat.skipped, stat.commit_failures, stat.fps
                    );
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, cleaning up...");
                break;
            }
        }
    }

    if args.json {
        let report = serde_json::to_string_pretty(&app.stats()).context("Failed to encode stats")?;
        println!("{}", report);
    } else if app.stats().iter().all(|stat| stat.commits == 0) {
        error!("No frames were presented");
    }

    Ok(())
}
