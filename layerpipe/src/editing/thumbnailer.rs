//! # Thumbnails
//!
//! Rendering a thumbnail on every change would waste most of the work, since changes tend to
//! arrive in bursts. A [`Thumbnailer`] waits until its item has been quiet for a moment, then
//! fits the last frame it was given into a small square and hands it to the editing actor.

use std::{sync::Arc, time::Duration};

use image::RgbaImage;
use tokio::sync::mpsc;

use super::{ItemId, Request};

/// Debounced thumbnail generator for a single item. Must be used from within a tokio runtime.
pub struct Thumbnailer {
    id: ItemId,
    requests: mpsc::Sender<Request>,
    delay: Duration,
    size: u32,
    pending: Option<tokio::task::JoinHandle<()>>,
}
impl Thumbnailer {
    pub(super) fn new(
        id: ItemId,
        requests: mpsc::Sender<Request>,
        delay: Duration,
        size: u32,
    ) -> Self {
        Self {
            id,
            requests,
            delay,
            size,
            pending: None,
        }
    }
    #[must_use]
    pub fn id(&self) -> ItemId {
        self.id
    }
    /// The item now looks like `frame`. Supersedes any update still waiting out its delay.
    pub fn update(&mut self, frame: Arc<RgbaImage>) {
        if let Some(previous) = self.pending.take() {
            previous.abort();
        }
        let (id, requests, delay, size) = (self.id, self.requests.clone(), self.delay, self.size);
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let thumbnail = match tokio::task::spawn_blocking(move || {
                layerpipe_core::downscale::fit_within(&frame, size)
            })
            .await
            {
                Ok(Ok(thumbnail)) => thumbnail,
                Ok(Err(err)) => {
                    log::warn!("thumbnail for {id:?} failed: {err}");
                    return;
                }
                Err(err) => {
                    log::warn!("thumbnail task for {id:?} failed: {err}");
                    return;
                }
            };
            log::trace!(
                "thumbnail for {id:?}, {}x{}",
                thumbnail.width(),
                thumbnail.height()
            );
            // Actor gone means nobody wants it anymore.
            let _ = requests
                .send(Request::UpdateThumbnail {
                    id,
                    thumbnail: Arc::new(thumbnail),
                })
                .await;
        }));
    }
    /// Wait for the latest update to be delivered, if one is pending.
    pub async fn settle(&mut self) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.await;
        }
    }
}
impl Drop for Thumbnailer {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bursts_produce_one_thumbnail() {
        let (send, mut recv) = mpsc::channel(8);
        let mut thumbnailer = Thumbnailer::new(ItemId(7), send, Duration::from_millis(500), 48);
        let start = tokio::time::Instant::now();

        let frame = |shade: u8| Arc::new(RgbaImage::from_pixel(200, 100, image::Rgba([shade; 4])));
        thumbnailer.update(frame(10));
        tokio::time::sleep(Duration::from_millis(300)).await;
        thumbnailer.update(frame(200));

        tokio::time::sleep_until(start + Duration::from_millis(600)).await;
        assert!(recv.try_recv().is_err());

        let Some(Request::UpdateThumbnail { id, thumbnail }) = recv.recv().await else {
            panic!("expected a thumbnail");
        };
        assert_eq!(id, ItemId(7));
        assert_eq!(thumbnail.dimensions(), (48, 24));
        // Built from the later frame.
        assert!((199..=201).contains(&thumbnail.get_pixel(10, 10).0[3]));
        assert!(start.elapsed() >= Duration::from_millis(800));

        assert!(
            tokio::time::timeout(Duration::from_secs(5), recv.recv())
                .await
                .is_err()
        );
    }
    #[tokio::test(start_paused = true)]
    async fn drop_cancels_pending() {
        let (send, mut recv) = mpsc::channel(8);
        let mut thumbnailer = Thumbnailer::new(ItemId(1), send.clone(), Duration::from_millis(500), 48);
        thumbnailer.update(Arc::new(RgbaImage::new(4, 4)));
        drop(thumbnailer);
        assert!(
            tokio::time::timeout(Duration::from_secs(5), recv.recv())
                .await
                .is_err()
        );
        drop(send);
    }
}
