// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{bail, Context, Result};
use calloop::{
    timer::{TimeoutAction, Timer},
    EventLoop, LoopSignal,
};
use clap_lex::RawArgs;
use mirror_comp::{
    backend::{
        render::Canvas,
        render_thread::RenderThread,
        virtual_screen::surface::{ProducerSurface, SurfaceBuffer},
        RenderServices,
    },
    config::{test_pattern, Config},
    logger,
    state::RenderSnapshot,
    utils::geometry::{empty_rect, rect_from_xywh, RectI},
};
use std::{
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tiny_skia::Color;
use tracing::{debug, error, info, warn};

#[cfg(feature = "profile-with-tracy")]
#[global_allocator]
static GLOBAL: profiling::tracy_client::ProfiledAllocator<std::alloc::System> =
    profiling::tracy_client::ProfiledAllocator::new(std::alloc::System, 10);

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    frames: Option<u64>,
    dump: Option<PathBuf>,
}

/// Consumer writing every queued virtual frame to a PNG file.
struct PngDumpProducer {
    id: u64,
    name: String,
    dir: Option<PathBuf>,
    queued: AtomicU64,
}

impl ProducerSurface for PngDumpProducer {
    fn unique_id(&self) -> u64 {
        self.id
    }

    fn queue_buffer(&self, buffer: SurfaceBuffer) {
        let queued = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            screen = %self.name,
            seq = buffer.seq,
            queued,
            damage = buffer.damage.len(),
            "Virtual frame queued"
        );
        let Some(dir) = self.dir.as_ref() else {
            return;
        };
        let path = dir.join(format!("{}-{:05}.png", self.name, buffer.seq));
        if let Err(err) = buffer.pixmap.save_png(&path) {
            warn!(?err, path = %path.display(), "Failed to dump frame");
        }
    }
}

struct DriverState {
    thread: RenderThread,
    snapshot: RenderSnapshot,
    sequence: u64,
    frames: Option<u64>,
    signal: LoopSignal,
    bars: Vec<(u64, RectI)>,
}

impl DriverState {
    /// Moves a bar across every source screen and reports the damage.
    fn animate_sources(&mut self) {
        let sequence = self.sequence;
        for (id, bar) in self.bars.iter_mut() {
            let Some(screen) = self.snapshot.nodes.screen_mut(*id) else {
                continue;
            };
            let (width, height) = (screen.property.width, screen.property.height);
            let Some(pattern) = test_pattern(width, height) else {
                continue;
            };
            let x = ((sequence * 8) % width.max(1) as u64) as i32;
            let next = rect_from_xywh(x, 0, 16, height as i32);
            let mut canvas = Canvas::from_pixmap(pattern);
            canvas.fill_rect(x as f32, 0.0, x as f32 + 16.0, height as f32, Color::WHITE);
            let pixmap = Arc::new(canvas.into_pixmap());
            if screen.cache_image.is_some() {
                screen.cache_image = Some(pixmap.clone());
            }
            screen.buffer = Some(pixmap);
            screen.dirty.add_to_current([*bar, next]);
            *bar = next;
        }
    }

    fn vsync(&mut self) -> bool {
        if self.frames.is_some_and(|frames| self.sequence >= frames) {
            info!(frames = self.sequence, "Frame limit reached");
            self.signal.stop();
            self.signal.wakeup();
            return false;
        }
        if self.sequence > 0 {
            self.animate_sources();
        }
        self.thread.sync_params(self.snapshot.clone());
        self.thread.vsync(self.sequence);
        self.snapshot.consume_frame_flags();
        self.sequence += 1;
        true
    }
}

fn main() {
    if let Err(err) = main_inner() {
        error!("Error occured in main(): {:?}", err);
        process::exit(1);
    }
}

fn parse_args() -> Result<Option<Args>> {
    let raw_args = RawArgs::from_args();
    let mut cursor = raw_args.cursor();
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let mut args = Args::default();

    while let Some(arg) = raw_args.next_os(&mut cursor) {
        match arg.to_str() {
            Some("--help") | Some("-h") => {
                print_help(env!("CARGO_PKG_VERSION"), git_hash);
                return Ok(None);
            }
            Some("--version") | Some("-V") => {
                println!(
                    "mirror-comp {} (git commit {})",
                    env!("CARGO_PKG_VERSION"),
                    git_hash
                );
                return Ok(None);
            }
            Some("--config") => {
                let path = raw_args
                    .next_os(&mut cursor)
                    .context("--config expects a path")?;
                args.config = Some(PathBuf::from(path));
            }
            Some("--frames") => {
                let frames = raw_args
                    .next_os(&mut cursor)
                    .and_then(|value| value.to_str())
                    .context("--frames expects a number")?;
                args.frames = Some(frames.parse().context("--frames expects a number")?);
            }
            Some("--dump") => {
                let dir = raw_args
                    .next_os(&mut cursor)
                    .context("--dump expects a directory")?;
                args.dump = Some(PathBuf::from(dir));
            }
            _ => bail!("Unknown argument {:?}", arg),
        }
    }
    Ok(Some(args))
}

fn main_inner() -> Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    logger::init_logger()?;
    info!("Mirror compositor starting up!");

    profiling::register_thread!("Main Thread");
    #[cfg(feature = "profile-with-tracy")]
    tracy_client::Client::start();

    if let Some(dir) = args.dump.as_ref() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create dump directory {}", dir.display()))?;
    }

    let config = Config::load(args.config);
    let snapshot = config.build_scene(|conf| {
        let name = if conf.name.is_empty() {
            format!("screen-{}", conf.id)
        } else {
            conf.name.clone()
        };
        Some(Arc::new(PngDumpProducer {
            id: conf.id,
            name,
            dir: args.dump.clone(),
            queued: AtomicU64::new(0),
        }) as Arc<dyn ProducerSurface>)
    });
    let bars = snapshot
        .nodes
        .screens()
        .filter(|screen| screen.buffer.is_some())
        .map(|screen| (screen.id, empty_rect()))
        .collect();

    let services = RenderServices::software();
    let thread = RenderThread::spawn(services).context("Failed to start render thread")?;

    let mut event_loop: EventLoop<'static, DriverState> =
        EventLoop::try_new().context("Failed to initialize event loop")?;
    let refresh_rate = config.mirror.refresh_rate.max(1);
    let interval = Duration::from_secs_f64(1.0 / refresh_rate as f64);
    info!(refresh_rate, screens = config.mirror.screens.len(), "Driving vsync");

    let mut state = DriverState {
        thread,
        snapshot,
        sequence: 0,
        frames: args.frames,
        signal: event_loop.get_signal(),
        bars,
    };

    event_loop
        .handle()
        .insert_source(Timer::immediate(), move |_, _, state| {
            if state.vsync() {
                TimeoutAction::ToDuration(interval)
            } else {
                TimeoutAction::Drop
            }
        })
        .map_err(|insert_error| insert_error.error)
        .context("Failed to schedule vsync")?;

    event_loop
        .run(None, &mut state, |_| {})
        .context("Event loop failed")?;

    info!(frames = state.sequence, "Shutting down");
    Ok(())
}

fn print_help(version: &str, git_rev: &str) {
    println!(
        r#"mirror-comp {version}
{git_rev}

Composes mirrored and extended virtual screens.

Options:
  -h, --help           Show this message
  -V, --version        Show the version of mirror-comp
      --config <path>  Read the configuration from <path>
      --frames <n>     Stop after <n> vsyncs
      --dump <dir>     Write every virtual frame as PNG into <dir>"#
    );
}
