//! Darkroom headless driver.
//!
//! Loads a synthetic raw into the develop engine, applies a scripted edit
//! list, drives all three pipelines through the render scheduler, and writes
//! the sidecar. Exists to exercise the whole stack outside a GUI: the
//! develop controller is the only surface it touches.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use core_config::Config;
use core_develop::{Develop, DevelopSignal, EditTarget, Env, ImageSource};
use core_image::{
    CaptureMeta, ColorSpace, DevResult, ImageId, PixelBuffer, SharedBuffer,
};
use core_module::Registry;
use core_module::builtin::ExposureParams;
use core_pipeline::{PipeKind, RunOutcome, ViewportRequest};
use core_presets::Preset;
use core_schedule::{RenderRequest, RenderScheduler};
use core_store::MemoryCatalog;

mod script;
use script::Command;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "darkroom", version, about = "Darkroom develop engine headless driver")]
struct Args {
    /// Synthetic sensor width.
    #[arg(long, default_value_t = 1024)]
    width: u32,
    /// Synthetic sensor height.
    #[arg(long, default_value_t = 683)]
    height: u32,
    /// Optional configuration file path (overrides discovery of `darkroom.toml`).
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Edit script to apply; a small default session runs when omitted.
    #[arg(long = "script")]
    script: Option<PathBuf>,
    /// Sidecar output path.
    #[arg(long = "sidecar", default_value = "darkroom.dks")]
    sidecar: PathBuf,
}

/// Deterministic gradient decoder standing in for the raw loader and the
/// mipmap cache.
struct SyntheticRaw {
    width: u32,
    height: u32,
}

impl SyntheticRaw {
    fn buffer(&self, divisor: u32) -> SharedBuffer {
        let w = (self.width / divisor).max(1);
        let h = (self.height / divisor).max(1);
        let mut b = PixelBuffer::new(w, h, 1.0 / divisor as f32, ColorSpace::Raw);
        for y in 0..h {
            for x in 0..w {
                let i = (y as usize * w as usize + x as usize) * 4;
                let fx = x as f32 / w as f32;
                let fy = y as f32 / h as f32;
                b.data_mut()[i] = 0.1 + 0.8 * fx;
                b.data_mut()[i + 1] = 0.1 + 0.8 * fy;
                b.data_mut()[i + 2] = 0.1 + 0.4 * (fx + fy);
                b.data_mut()[i + 3] = 1.0;
            }
        }
        Arc::new(b)
    }
}

impl ImageSource for SyntheticRaw {
    fn load_full(&self, _id: ImageId) -> DevResult<SharedBuffer> {
        Ok(self.buffer(1))
    }

    fn load_preview(&self, _id: ImageId, downsample: u32) -> DevResult<Option<SharedBuffer>> {
        Ok(Some(self.buffer(downsample.max(1))))
    }
}

fn configure_logging() -> Option<WorkerGuard> {
    let log_dir = Path::new(".");
    let file_appender = tracing_appender::rolling::never(log_dir, "darkroom.log");
    let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
    match tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(nb_writer)
        .try_init()
    {
        Ok(()) => Some(guard),
        Err(_) => {
            // Global subscriber already installed; drop the guard so the
            // writer shuts down.
            None
        }
    }
}

fn install_panic_hook() {
    let default = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(target: "runtime", %info, "panic");
        default(info);
    }));
}

fn builtin_presets() -> Vec<Preset> {
    // A mild brightening preset for every raw; the resolver decides whether
    // it actually applies.
    let mut base = Preset::auto(
        "raw starting point",
        "exposure",
        2,
        ExposureParams { ev: 0.3, black: 0.0 }.to_bytes(),
    );
    base.format = core_image::format_mask::RAW;
    vec![base]
}

fn capture_meta() -> CaptureMeta {
    CaptureMeta {
        maker: "Synthetic".into(),
        model: "Gradient Mk I".into(),
        camera_alias: "Gradient".into(),
        lens: "Pinhole 35mm".into(),
        iso: 200.0,
        exposure: 1.0 / 125.0,
        aperture: 5.6,
        focal_length: 35.0,
        is_raw: true,
        is_hdr: false,
        is_ldr: false,
        is_monochrome: false,
        change_timestamp: 0,
    }
}

fn render_all(dev: &Arc<Develop>, sched: &RenderScheduler) {
    for kind in PipeKind::ALL {
        if let Err(e) = sched.request(kind, dev.timestamp()) {
            warn!(target: "runtime", error = %e, "render request dropped");
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config = core_config::load_from(args.config.clone()).context("load configuration")?;

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.seed_presets(builtin_presets());
    let imgid = catalog.insert_image(args.width, args.height, capture_meta());

    let env = Env::new(
        Arc::new(Registry::builtin()),
        catalog,
        Arc::new(SyntheticRaw {
            width: args.width,
            height: args.height,
        }),
        Arc::new(config),
    );

    let dev = Arc::new(Develop::load_image(&env, imgid).context("load image")?);
    dev.set_sidecar_path(Some(args.sidecar.clone()));
    let signals = dev.signals();
    let viewport = ViewportRequest::default();
    let fit_scale = core_image::zoom::zoom_scale(
        dev.image().dims,
        viewport.window_w,
        viewport.window_h,
        core_image::zoom::ZoomMode::Fit,
        0,
    );
    info!(
        target: "runtime.startup",
        imgid = %dev.image().id,
        width = args.width,
        height = args.height,
        history = dev.history_len(),
        fit_scale,
        "session ready"
    );

    let commands = match &args.script {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read script {}", path.display()))?;
            script::parse_script(&text)?
        }
        None => script::parse_script("exposure 0.7\nsharpen 0.6\nrender\nundo\nrender\nredo\n")?,
    };

    let sched = {
        let dev = Arc::clone(&dev);
        let job = move |req: RenderRequest| {
            let outcome = dev.process(req.pipe, ViewportRequest::default());
            if outcome == RunOutcome::Dirty {
                warn!(target: "runtime", pipe = req.pipe.as_str(), "source not ready");
            }
        };
        RenderScheduler::spawn(Arc::new(job), env.config.file.schedule.queue_cap)
    };

    for (i, command) in commands.iter().enumerate() {
        match command {
            Command::Edit { op, params } => {
                dev.commit_params(op, 0, params.clone(), true, EditTarget(i as u64 + 1))
                    .with_context(|| format!("apply `{op}`"))?;
                render_all(&dev, &sched);
            }
            Command::Undo => {
                dev.undo();
                render_all(&dev, &sched);
            }
            Command::Redo => {
                dev.redo();
                render_all(&dev, &sched);
            }
            Command::Render => render_all(&dev, &sched),
        }
    }
    sched.shutdown();

    dev.save().context("persist history")?;

    let mut finished = 0;
    while let Ok(signal) = signals.try_recv() {
        if matches!(signal, DevelopSignal::PipeFinished(_)) {
            finished += 1;
        }
    }
    for kind in PipeKind::ALL {
        let pipe = dev.pipe(kind);
        let back = pipe.backbuffer();
        println!(
            "{:<9} status={:?} avg={:.2}ms out={}",
            kind.as_str(),
            pipe.status(),
            pipe.avg_ms(),
            back.map(|b| format!("{}x{}", b.buffer.width(), b.buffer.height()))
                .unwrap_or_else(|| "-".into()),
        );
    }
    println!(
        "history {}/{} hash {:016x} renders {}",
        dev.history_cursor(),
        dev.history_len(),
        dev.content_hash(),
        finished
    );
    println!("sidecar: {}", args.sidecar.display());

    dev.close();
    Ok(())
}

fn main() -> Result<()> {
    let _log_guard = configure_logging();
    install_panic_hook();
    run()
}
