#![warn(clippy::pedantic)]

use std::sync::Arc;

pub mod editing;
pub mod global;
pub mod host;
pub mod renderer;

#[cfg(feature = "dhat_heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

use anyhow::Result as AnyResult;
use layerpipe_core::{
    compositor::RenderError,
    img::{PropsOutcome, PropsUpdate},
    source::{ImageSource, ManifestSource},
    Quality,
};

/// Forwards frames and failures to whoever is waiting on the other end.
struct ChannelSink(crossbeam::channel::Sender<Result<renderer::RenderOutput, RenderError>>);
impl renderer::RenderSink for ChannelSink {
    fn deliver(&self, output: renderer::RenderOutput) {
        let _ = self.0.send(Ok(output));
    }
    fn failed(&self, generation: u64, error: RenderError) {
        log::error!("render {generation} failed: {error}");
        let _ = self.0.send(Err(error));
    }
}

struct Args {
    scale: f32,
    manifests: Vec<String>,
}
impl Args {
    fn parse() -> AnyResult<Self> {
        let mut scale: f32 = 1.0;
        let mut manifests = Vec::new();
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "--scale" {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--scale needs a value"))?;
                scale = value
                    .parse()
                    .map_err(|err| anyhow::anyhow!("bad --scale {value:?}: {err}"))?;
            } else {
                manifests.push(arg);
            }
        }
        if manifests.is_empty() {
            anyhow::bail!("usage: layerpipe [--scale S] <manifest>...");
        }
        Ok(Self {
            scale: scale.clamp(layerpipe_core::img::MIN_SCALE, 1.0),
            manifests,
        })
    }
}

fn main() -> AnyResult<()> {
    let settings = global::settings();
    let level = settings.log_level_filter();
    let has_term = std::io::IsTerminal::is_terminal(&std::io::stdin());
    // Log to a terminal, if available. Else, log to "log.out" in the working directory.
    if has_term {
        env_logger::builder().filter_level(level).init();
    } else {
        let _ = simple_logging::log_to_file("log.out", level);
    }
    #[cfg(feature = "dhat_heap")]
    let _profiler = {
        log::trace!("Installed dhat");
        dhat::Profiler::new_heap()
    };
    if settings.did_fail_to_load() {
        log::warn!("settings could not be read, writing defaults");
        if let Err(err) = settings.save() {
            log::warn!("failed to save default settings: {err:#}");
        }
    }

    let args = Args::parse()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> AnyResult<()> {
    let settings = global::settings();
    let source: Arc<dyn ImageSource> = Arc::new(ManifestSource);
    let on_change: editing::ChangeListener = Box::new(|snapshot: editing::Snapshot| {
        log::debug!(
            "{} images open, {} selected",
            snapshot.items.len(),
            snapshot.selected
        );
    });
    let (editing, actor) = editing::Editing::spawn(
        source.clone(),
        editing::EditingConfig::from_settings(settings),
        Some(on_change),
    )?;

    for path in &args.manifests {
        match editing.add_file(path, 0).await {
            Ok(outcome) => log::info!("opened {path:?} at {}", outcome.index()),
            Err(err) => log::error!("failed to open {path:?}: {err}"),
        }
    }

    let host = Arc::new(host::Host::new(
        source,
        global::result_cache().clone(),
        Some(editing.clone()),
    ));
    let gc = host.spawn_gc(settings.gc_interval());

    if let Some(selected) = editing.selected_image().await? {
        let path = selected.image.lock().path().to_owned();
        let frame = preview(&selected, args.scale).await?;

        let preview_path = format!("{path}.preview.png");
        let save_frame = frame.clone();
        let saved_to = preview_path.clone();
        tokio::task::spawn_blocking(move || save_frame.save(saved_to)).await??;
        log::info!("wrote {preview_path:?}");

        let mut thumbnailer = editing.thumbnailer(selected.id);
        thumbnailer.update(frame);
        thumbnailer.settle().await;

        let outcome = host.set_props(
            0,
            &path,
            0,
            PropsUpdate {
                scale: Some(args.scale),
                ..PropsUpdate::default()
            },
        )?;
        // Program output, not a diagnostic.
        println!("{}", result_line(&path, &outcome));
    }

    let document = editing.serialize().await?;
    match global::settings::preferences_dir() {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            let session = dir.join("session.json");
            std::fs::write(&session, document)?;
            log::info!("session saved to {session:?}");
        }
        None => log::warn!("no preferences dir, session not saved"),
    }

    gc.abort();
    drop(host);
    drop(editing);
    if tokio::task::spawn_blocking(move || actor.join()).await?.is_err() {
        log::error!("editing actor panicked");
    }
    Ok(())
}

/// The single line written to stdout: the host cache key and frame size for `path`.
fn result_line(path: &str, outcome: &PropsOutcome) -> String {
    format!(
        "{path}: {:016x} ({}x{})",
        outcome.cache_key, outcome.width, outcome.height
    )
}

/// Progressive render of the selected image, returning the final frame.
async fn preview(
    selected: &editing::SelectedImage,
    scale: f32,
) -> AnyResult<Arc<image::RgbaImage>> {
    let (send, recv) = crossbeam::channel::unbounded();
    let scheduler = renderer::ProgressiveRenderer::spawn(Arc::new(ChannelSink(send)))?;
    scheduler.enqueue(renderer::RenderJob {
        image: selected.image.clone(),
        scale,
        mode: renderer::RenderMode::FastThenBeautiful,
    });
    let frame = tokio::task::spawn_blocking(move || -> AnyResult<_> {
        loop {
            let output = recv.recv()??;
            log::debug!(
                "{} frame, {}x{}",
                output.quality.as_ref(),
                output.frame.width(),
                output.frame.height()
            );
            if output.quality == Quality::Beautiful {
                return Ok(output.frame);
            }
        }
    })
    .await??;
    Ok(frame)
}
