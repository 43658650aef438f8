//! # Progressive rendering
//!
//! Renders run on a single background worker, one job at a time. Each new job cancels whatever
//! was running, and anything still waiting is skipped in favor of the newest, so the most recent
//! request is the only one ever live.
//!
//! A job is one or two passes over the same image. [`RenderMode::FastThenBeautiful`] delivers a
//! nearest-neighbor frame as soon as possible and then follows up with the gamma-correct one,
//! unless a newer job arrived in between. A frame once delivered is never retracted.

use std::sync::Arc;

use image::RgbaImage;
use layerpipe_core::{compositor::RenderError, CancelToken, Quality};

use crate::editing::ImageHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::AsRefStr)]
pub enum RenderMode {
    /// While a control is being dragged.
    Fast,
    /// Once interaction settles.
    Beautiful,
    FastThenBeautiful,
}
impl RenderMode {
    #[must_use]
    pub fn passes(self) -> &'static [Quality] {
        match self {
            Self::Fast => &[Quality::Fast],
            Self::Beautiful => &[Quality::Beautiful],
            Self::FastThenBeautiful => &[Quality::Fast, Quality::Beautiful],
        }
    }
}

/// Render scale for a view zoom, in powers of two. Magnification is left to the display.
#[must_use]
pub fn scale_for_zoom(zoom: f64) -> f32 {
    if zoom < 0.0 {
        2f64.powf(zoom) as f32
    } else {
        1.0
    }
}

pub struct RenderJob {
    pub image: ImageHandle,
    pub scale: f32,
    pub mode: RenderMode,
}

#[derive(Clone, Debug)]
pub struct RenderOutput {
    /// As returned by [`ProgressiveRenderer::enqueue`].
    pub generation: u64,
    pub quality: Quality,
    pub frame: Arc<RgbaImage>,
}

/// Receives the frames. Called from the render worker thread.
pub trait RenderSink: Send + Sync + 'static {
    fn deliver(&self, output: RenderOutput);
    fn failed(&self, generation: u64, error: RenderError) {
        log::error!("render {generation} failed: {error}");
    }
}

struct Queued {
    generation: u64,
    job: RenderJob,
    cancel: CancelToken,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    running: Option<CancelToken>,
}

pub struct ProgressiveRenderer {
    jobs: Option<crossbeam::channel::Sender<Queued>>,
    slot: parking_lot::Mutex<Slot>,
    worker: Option<std::thread::JoinHandle<()>>,
}
impl ProgressiveRenderer {
    /// # Errors
    /// The worker thread could not be spawned.
    pub fn spawn(sink: Arc<dyn RenderSink>) -> std::io::Result<Self> {
        let (send, recv) = crossbeam::channel::unbounded();
        let worker = std::thread::Builder::new()
            .name("Progressive render worker".to_owned())
            .spawn(move || render_worker(&recv, &*sink))?;
        Ok(Self {
            jobs: Some(send),
            slot: parking_lot::Mutex::default(),
            worker: Some(worker),
        })
    }
    /// Replace whatever is running or waiting with `job`. Returns its generation, which tags every
    /// frame it produces. Generations only ever increase.
    pub fn enqueue(&self, job: RenderJob) -> u64 {
        let cancel = CancelToken::new();
        let generation = {
            let mut slot = self.slot.lock();
            if let Some(previous) = slot.running.replace(cancel.clone()) {
                previous.cancel();
            }
            slot.generation += 1;
            slot.generation
        };
        log::trace!(
            "render {generation} queued, {} at scale {}",
            job.mode.as_ref(),
            job.scale
        );
        if let Some(jobs) = &self.jobs {
            // Only fails if the worker died, in which case there's nobody to tell.
            let _ = jobs.send(Queued {
                generation,
                job,
                cancel,
            });
        }
        generation
    }
    /// Cancel the live job, if any, without queuing another.
    pub fn cancel_all(&self) {
        if let Some(running) = self.slot.lock().running.take() {
            running.cancel();
        }
    }
}
impl Drop for ProgressiveRenderer {
    fn drop(&mut self) {
        self.cancel_all();
        // Closing the channel ends the worker loop.
        self.jobs = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("render worker panicked");
            }
        }
    }
}

fn render_worker(jobs: &crossbeam::channel::Receiver<Queued>, sink: &dyn RenderSink) {
    while let Ok(mut queued) = jobs.recv() {
        // Everything older is already cancelled, skip straight to the newest.
        while let Ok(newer) = jobs.try_recv() {
            queued = newer;
        }
        run_job(&queued, sink);
    }
    log::debug!("render worker exiting");
}

fn run_job(queued: &Queued, sink: &dyn RenderSink) {
    let Queued {
        generation,
        job,
        cancel,
    } = queued;
    for &quality in job.mode.passes() {
        if cancel.is_cancelled() {
            log::debug!(
                "render {generation} superseded before its {} pass",
                quality.as_ref()
            );
            return;
        }
        let start = std::time::Instant::now();
        let result = job
            .image
            .lock()
            .render_with_scale(job.scale, quality, true, cancel);
        match result {
            Ok(frame) => {
                log::trace!(
                    "render {generation} {} pass, {}ms",
                    quality.as_ref(),
                    start.elapsed().as_millis()
                );
                sink.deliver(RenderOutput {
                    generation: *generation,
                    quality,
                    frame,
                });
            }
            Err(RenderError::Cancelled) => {
                log::debug!("render {generation} cancelled mid {} pass", quality.as_ref());
                return;
            }
            Err(err) => {
                sink.failed(*generation, err);
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use super::*;
    use layerpipe_core::{
        compositor::{Compositor, Layer, LayerCompositor, LayerInfo, TilePos},
        img::Image,
    };

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, PartialEq)]
    enum Event {
        Frame(u64, Quality, (u32, u32)),
        Failed(u64),
    }

    /// Forwards every event, optionally holding the worker inside the first delivery until told
    /// to continue.
    struct GatedSink {
        events: crossbeam::channel::Sender<Event>,
        hold_first: AtomicBool,
        gate: crossbeam::channel::Receiver<()>,
    }
    impl RenderSink for GatedSink {
        fn deliver(&self, output: RenderOutput) {
            let _ = self.events.send(Event::Frame(
                output.generation,
                output.quality,
                output.frame.dimensions(),
            ));
            if self.hold_first.swap(false, Ordering::SeqCst) {
                let _ = self.gate.recv_timeout(WAIT);
            }
        }
        fn failed(&self, generation: u64, _: RenderError) {
            let _ = self.events.send(Event::Failed(generation));
        }
    }

    fn renderer(
        hold_first: bool,
    ) -> (
        ProgressiveRenderer,
        crossbeam::channel::Receiver<Event>,
        crossbeam::channel::Sender<()>,
    ) {
        let (events, events_recv) = crossbeam::channel::unbounded();
        let (gate_send, gate) = crossbeam::channel::bounded(1);
        let sink = GatedSink {
            events,
            hold_first: AtomicBool::new(hold_first),
            gate,
        };
        (
            ProgressiveRenderer::spawn(Arc::new(sink)).unwrap(),
            events_recv,
            gate_send,
        )
    }

    fn image() -> ImageHandle {
        let compositor = LayerCompositor::new(
            [32, 16],
            8,
            vec![Layer::solid("bg", [32, 16], [0, 0], [50, 60, 70, 255])],
        );
        Arc::new(parking_lot::Mutex::new(Image::new("job.psd", Box::new(compositor))))
    }

    fn job(image: &ImageHandle, mode: RenderMode) -> RenderJob {
        RenderJob {
            image: image.clone(),
            scale: 0.5,
            mode,
        }
    }

    #[test]
    fn zoom_to_scale() {
        assert_eq!(scale_for_zoom(0.0), 1.0);
        assert_eq!(scale_for_zoom(2.5), 1.0);
        assert_eq!(scale_for_zoom(-1.0), 0.5);
        assert_eq!(scale_for_zoom(-3.0), 0.125);
    }
    #[test]
    fn modes_run_their_passes() {
        let (renderer, events, _gate) = renderer(false);
        let image = image();
        let fast = renderer.enqueue(job(&image, RenderMode::Fast));
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            Event::Frame(fast, Quality::Fast, (16, 8))
        );
        let both = renderer.enqueue(job(&image, RenderMode::FastThenBeautiful));
        assert!(both > fast);
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            Event::Frame(both, Quality::Fast, (16, 8))
        );
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            Event::Frame(both, Quality::Beautiful, (16, 8))
        );
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }
    #[test]
    fn superseded_job_keeps_fast_frame_only() {
        let (renderer, events, gate) = renderer(true);
        let image = image();
        let first = renderer.enqueue(job(&image, RenderMode::FastThenBeautiful));
        // Worker is now parked inside the first delivery.
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            Event::Frame(first, Quality::Fast, (16, 8))
        );
        let second = renderer.enqueue(job(&image, RenderMode::FastThenBeautiful));
        let third = renderer.enqueue(job(&image, RenderMode::Beautiful));
        gate.send(()).unwrap();

        // Neither the first job's beautiful pass nor the second job ever run.
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            Event::Frame(third, Quality::Beautiful, (16, 8))
        );
        assert!(second < third);
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }
    #[test]
    fn cancel_all_stops_pending_passes() {
        let (renderer, events, gate) = renderer(true);
        let image = image();
        let first = renderer.enqueue(job(&image, RenderMode::FastThenBeautiful));
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            Event::Frame(first, Quality::Fast, (16, 8))
        );
        renderer.cancel_all();
        gate.send(()).unwrap();
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    struct Broken;
    impl Compositor for Broken {
        fn canvas_size(&self) -> [u32; 2] {
            [4, 4]
        }
        fn tile_size(&self) -> u32 {
            4
        }
        fn layers(&self) -> &[LayerInfo] {
            &[]
        }
        fn render_full(
            &mut self,
            _: &mut RgbaImage,
            _: &[bool],
            _: &CancelToken,
        ) -> Result<(), RenderError> {
            Err(RenderError::Compositor("broken".to_owned()))
        }
        fn render_diff(
            &mut self,
            _: &mut RgbaImage,
            _: &[bool],
            _: &CancelToken,
        ) -> Result<Vec<TilePos>, RenderError> {
            Err(RenderError::Compositor("broken".to_owned()))
        }
    }

    #[test]
    fn failure_reported_and_job_abandoned() {
        let (renderer, events, _gate) = renderer(false);
        let broken: ImageHandle = Arc::new(parking_lot::Mutex::new(Image::new(
            "broken.psd",
            Box::new(Broken),
        )));
        let generation = renderer.enqueue(job(&broken, RenderMode::FastThenBeautiful));
        assert_eq!(events.recv_timeout(WAIT).unwrap(), Event::Failed(generation));
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
        // Worker survives to render the next one.
        let image = image();
        let next = renderer.enqueue(job(&image, RenderMode::Fast));
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            Event::Frame(next, Quality::Fast, (16, 8))
        );
    }
}
