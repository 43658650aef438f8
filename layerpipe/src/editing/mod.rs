//! # Editing
//!
//! The list of images open for editing, which one is selected, and the little bits of view state
//! that go with them. All of it is owned by a single actor running on its own thread, and is only
//! ever touched from there. Everyone else holds an [`Editing`] handle and talks to the actor
//! through its mailbox, one request at a time, in the order they were sent.
//!
//! Requests that return something are awaited through a oneshot reply. The rest are fire and
//! forget. After any request that changes the list or the selection, the actor hands a fresh
//! [`Snapshot`] to the change listener, if one is registered.

pub mod requests;
pub mod thumbnailer;

use std::sync::Arc;

use image::RgbaImage;
use layerpipe_core::{
    img::{Image, Toucher},
    project::{self, DocumentEntry, DocumentRoot, ViewState},
    source::ImageSource,
};
use tokio::sync::{mpsc, oneshot};

pub use requests::{AddFileOutcome, CapacityError, EditingError, Request, SelectedImage};
pub use thumbnailer::Thumbnailer;

use requests::RequestResponse;

/// Images are shared with renderers, which lock them for the duration of a render.
pub type ImageHandle = Arc<parking_lot::Mutex<Image>>;

/// Identity of an item for as long as it stays open. Never reused within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u64);

/// One open image.
#[derive(Clone, Debug)]
pub struct Item {
    pub id: ItemId,
    pub display_name: String,
    pub image: ImageHandle,
    /// Last-access time of `image`, readable while it is locked for a render.
    pub toucher: Toucher,
    /// Caller supplied identity, 0 for none. Non-zero tags are unique among open items.
    pub tag: i32,
    /// Last layer state the host reported for this item.
    pub latest_state: String,
    pub thumbnail: Option<Arc<RgbaImage>>,
    pub view_state: Option<ViewState>,
}

/// Point-in-time copy of the editing state. Images are shared, the list is not.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub items: Vec<Item>,
    pub selected: usize,
    /// 0 when never set.
    pub splitter_width: f32,
}

pub type ChangeListener = Box<dyn Fn(Snapshot) + Send>;

#[derive(Clone, Copy, Debug)]
pub struct EditingConfig {
    /// Maximum open items.
    pub capacity: usize,
    pub thumbnail_size: u32,
    pub thumbnail_delay: std::time::Duration,
}
impl Default for EditingConfig {
    fn default() -> Self {
        Self::from_settings(&crate::global::Settings::default())
    }
}
impl EditingConfig {
    #[must_use]
    pub fn from_settings(settings: &crate::global::Settings) -> Self {
        Self {
            capacity: settings.capacity,
            thumbnail_size: settings.thumbnail_size,
            thumbnail_delay: settings.thumbnail_delay(),
        }
    }
}

const MAILBOX_SIZE: usize = 64;

/// Handle to the editing actor. Cheap to clone, every clone talks to the same actor.
#[derive(Clone)]
pub struct Editing {
    requests: mpsc::Sender<Request>,
    config: EditingConfig,
}
impl Editing {
    /// Start the actor on a thread of its own. It runs until every handle is dropped.
    /// # Errors
    /// The thread could not be spawned.
    pub fn spawn(
        source: Arc<dyn ImageSource>,
        config: EditingConfig,
        on_change: Option<ChangeListener>,
    ) -> std::io::Result<(Self, std::thread::JoinHandle<()>)> {
        let (send, recv) = mpsc::channel(MAILBOX_SIZE);
        let actor = Actor {
            source,
            capacity: config.capacity,
            items: Vec::new(),
            selected: 0,
            splitter_width: 0.0,
            next_id: 0,
            on_change,
        };
        let thread = std::thread::Builder::new()
            .name("Editing actor".to_owned())
            .spawn(move || actor.run(recv))?;
        Ok((
            Self {
                requests: send,
                config,
            },
            thread,
        ))
    }
    async fn post(&self, request: Request) -> Result<(), EditingError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| EditingError::Closed)
    }
    async fn ask<T>(
        &self,
        request: impl FnOnce(RequestResponse<T>) -> Request,
    ) -> Result<T, EditingError> {
        let (reply, response) = oneshot::channel();
        self.post(request(reply)).await?;
        response.await.map_err(|_| EditingError::Closed)
    }
    /// Open `path`, or find the open item with the same non-zero `tag`.
    /// # Errors
    /// Capacity reached, or the image failed to load.
    pub async fn add_file(&self, path: &str, tag: i32) -> Result<AddFileOutcome, EditingError> {
        let path = path.to_owned();
        self.ask(|reply| Request::AddFile { path, tag, reply })
            .await?
    }
    /// The whole editing state as a project document.
    /// # Errors
    /// Serialization failure.
    pub async fn serialize(&self) -> Result<String, EditingError> {
        self.ask(|reply| Request::Serialize { reply }).await?
    }
    /// Replace every open item with those of `document`. An empty document clears everything.
    /// Items that fail to load are skipped, and reported back as warnings.
    /// # Errors
    /// The document is malformed or holds more images than allowed. Nothing changes.
    pub async fn deserialize(&self, document: &str) -> Result<Vec<String>, EditingError> {
        let document = document.to_owned();
        self.ask(|reply| Request::Deserialize { document, reply })
            .await?
    }
    /// Record the host's latest `state` for the item tagged `tag`, opening `path` if there is no
    /// such item. A new item gets `state` applied when it parses, and is opened as loaded when it
    /// doesn't. Returns whether an item was opened.
    /// # Errors
    /// The list is full or `path` could not be opened. Nothing changes.
    pub async fn update_tag_state(
        &self,
        path: &str,
        tag: i32,
        state: &str,
    ) -> Result<bool, EditingError> {
        let (path, state) = (path.to_owned(), state.to_owned());
        self.ask(|reply| Request::UpdateTagState {
            path,
            tag,
            state,
            reply,
        })
        .await?
    }
    /// # Errors
    /// The actor is gone.
    pub async fn snapshot(&self) -> Result<Snapshot, EditingError> {
        self.ask(|reply| Request::GetSnapshot { reply }).await
    }
    /// # Errors
    /// The actor is gone.
    pub async fn selected_image(&self) -> Result<Option<SelectedImage>, EditingError> {
        self.ask(|reply| Request::GetSelectedImage { reply }).await
    }
    /// # Errors
    /// The actor is gone.
    pub async fn splitter_width(&self) -> Result<f32, EditingError> {
        self.ask(|reply| Request::GetSplitterWidth { reply }).await
    }
    /// # Errors
    /// The actor is gone.
    pub async fn delete(&self, index: usize) -> Result<(), EditingError> {
        self.post(Request::Delete { index }).await
    }
    /// # Errors
    /// The actor is gone.
    pub async fn clear(&self) -> Result<(), EditingError> {
        self.post(Request::Clear).await
    }
    /// # Errors
    /// The actor is gone.
    pub async fn select(&self, index: usize) -> Result<(), EditingError> {
        self.post(Request::Select { index }).await
    }
    /// # Errors
    /// The actor is gone.
    pub async fn touch(&self) -> Result<(), EditingError> {
        self.post(Request::Touch).await
    }
    /// # Errors
    /// The actor is gone.
    pub async fn update_thumbnail(
        &self,
        id: ItemId,
        thumbnail: Arc<RgbaImage>,
    ) -> Result<(), EditingError> {
        self.post(Request::UpdateThumbnail { id, thumbnail }).await
    }
    /// # Errors
    /// The actor is gone.
    pub async fn update_view_state(
        &self,
        index: usize,
        view_state: Option<ViewState>,
    ) -> Result<(), EditingError> {
        self.post(Request::UpdateViewState { index, view_state })
            .await
    }
    /// # Errors
    /// The actor is gone.
    pub async fn set_splitter_width(&self, width: f32) -> Result<(), EditingError> {
        self.post(Request::SetSplitterWidth { width }).await
    }
    /// Debounced thumbnail generator feeding the item `id`.
    #[must_use]
    pub fn thumbnailer(&self, id: ItemId) -> Thumbnailer {
        Thumbnailer::new(
            id,
            self.requests.clone(),
            self.config.thumbnail_delay,
            self.config.thumbnail_size,
        )
    }
}

struct Actor {
    source: Arc<dyn ImageSource>,
    capacity: usize,
    items: Vec<Item>,
    selected: usize,
    splitter_width: f32,
    next_id: u64,
    on_change: Option<ChangeListener>,
}
impl Actor {
    fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        while let Some(request) = requests.blocking_recv() {
            log::trace!("editing: {request:?}");
            self.handle(request);
        }
        log::debug!("editing actor exiting, every handle dropped");
    }
    fn handle(&mut self, request: Request) {
        match request {
            Request::AddFile { path, tag, reply } => {
                let result = self.add_file(&path, tag);
                let added = matches!(result, Ok(AddFileOutcome::Added(_)));
                let _ = reply.send(result);
                if added {
                    self.notify_change();
                }
            }
            Request::Serialize { reply } => {
                let _ = reply.send(self.serialize());
            }
            Request::Deserialize { document, reply } => {
                let result = self.deserialize(&document);
                let ok = result.is_ok();
                let _ = reply.send(result);
                if ok {
                    self.notify_change();
                }
            }
            Request::UpdateTagState {
                path,
                tag,
                state,
                reply,
            } => {
                let result = self.update_tag_state(&path, tag, state);
                let refresh = matches!(result, Ok(true));
                let _ = reply.send(result);
                if refresh {
                    self.notify_change();
                }
            }
            Request::GetSnapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Request::GetSelectedImage { reply } => {
                let _ = reply.send(self.selected_image());
            }
            Request::GetSplitterWidth { reply } => {
                let _ = reply.send(self.splitter_width);
            }
            Request::Delete { index } => {
                if self.delete(index) {
                    self.notify_change();
                }
            }
            Request::Clear => {
                self.clear();
                self.notify_change();
            }
            Request::Select { index } => {
                if index != self.selected && index < self.items.len() {
                    self.selected = index;
                    self.notify_change();
                }
            }
            Request::Touch => {
                for item in &self.items {
                    item.toucher.touch();
                }
            }
            Request::UpdateThumbnail { id, thumbnail } => {
                // The item may have been closed while its thumbnail was in flight.
                if let Some(item) = self.items.iter_mut().find(|item| item.id == id) {
                    item.thumbnail = Some(thumbnail);
                    self.notify_change();
                }
            }
            Request::UpdateViewState { index, view_state } => {
                if let Some(item) = self.items.get_mut(index) {
                    item.view_state = view_state;
                }
            }
            Request::SetSplitterWidth { width } => self.splitter_width = width,
        }
    }
    fn notify_change(&self) {
        if let Some(on_change) = &self.on_change {
            on_change(self.snapshot());
        }
    }
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            items: self.items.clone(),
            selected: self.selected,
            splitter_width: self.splitter_width,
        }
    }
    fn find_tag(&self, tag: i32) -> Option<usize> {
        if tag == 0 {
            return None;
        }
        self.items.iter().position(|item| item.tag == tag)
    }
    fn make_item(&mut self, image: Image, tag: i32) -> Item {
        let display_name = std::path::Path::new(image.path())
            .file_name()
            .map_or_else(|| image.path().to_owned(), |name| name.to_string_lossy().into_owned());
        self.next_id += 1;
        let toucher = image.toucher();
        Item {
            id: ItemId(self.next_id),
            display_name,
            image: Arc::new(parking_lot::Mutex::new(image)),
            toucher,
            tag,
            latest_state: String::new(),
            thumbnail: None,
            view_state: None,
        }
    }
    fn check_capacity(&self) -> Result<(), CapacityError> {
        if self.items.len() >= self.capacity {
            log::warn!("editing: refusing to open more than {} images", self.capacity);
            return Err(CapacityError::Full {
                limit: self.capacity,
            });
        }
        Ok(())
    }
    fn push_selected(&mut self, item: Item) -> usize {
        self.items.push(item);
        self.selected = self.items.len() - 1;
        self.selected
    }
    fn add_file(&mut self, path: &str, tag: i32) -> Result<AddFileOutcome, EditingError> {
        if let Some(idx) = self.find_tag(tag) {
            return Ok(AddFileOutcome::Existing(idx));
        }
        self.check_capacity()?;
        let image = self.source.load(path)?;
        let item = self.make_item(image, tag);
        Ok(AddFileOutcome::Added(self.push_selected(item)))
    }
    fn update_tag_state(
        &mut self,
        path: &str,
        tag: i32,
        state: String,
    ) -> Result<bool, EditingError> {
        if let Some(idx) = self.find_tag(tag) {
            self.items[idx].latest_state = state;
            return Ok(false);
        }
        self.check_capacity()?;
        let mut image = self.source.load(path)?;
        // The host's state string is kept either way, the image just opens as loaded.
        if !state.is_empty() {
            if let Err(err) = image.deserialize(&state) {
                log::warn!("editing: tag {tag} state {state:?} not applied to {path:?}: {err}");
            }
        }
        let mut item = self.make_item(image, tag);
        item.latest_state = state;
        self.push_selected(item);
        Ok(true)
    }
    /// Returns false if `index` was out of range.
    fn delete(&mut self, index: usize) -> bool {
        if index >= self.items.len() {
            return false;
        }
        self.items.remove(index);
        if index < self.selected || (index == self.selected && self.selected > 0) {
            self.selected -= 1;
        }
        self.selected = self.selected.min(self.items.len().saturating_sub(1));
        true
    }
    fn clear(&mut self) {
        self.items.clear();
        self.selected = 0;
    }
    fn selected_image(&self) -> Option<SelectedImage> {
        self.items.get(self.selected).map(|item| SelectedImage {
            id: item.id,
            image: item.image.clone(),
            display_name: item.display_name.clone(),
            latest_state: item.latest_state.clone(),
        })
    }
    fn serialize(&self) -> Result<String, EditingError> {
        let images = self
            .items
            .iter()
            .map(|item| {
                let mut image = item.image.lock().serialize_project();
                image.view_state = item.view_state;
                // A thumbnail is a nicety, losing one is not worth failing the save over.
                let thumbnail = item.thumbnail.as_deref().and_then(|thumbnail| {
                    project::encode_thumbnail(thumbnail)
                        .map_err(|err| log::warn!("editing: dropping thumbnail of {}: {err}", item.display_name))
                        .ok()
                });
                DocumentEntry {
                    image,
                    tag: item.tag,
                    thumbnail,
                }
            })
            .collect();
        let root = DocumentRoot {
            version: project::CURRENT_VERSION,
            splitter_width: self.splitter_width,
            images,
        };
        Ok(root.to_json()?)
    }
    fn deserialize(&mut self, document: &str) -> Result<Vec<String>, EditingError> {
        if document.trim().is_empty() {
            self.clear();
            return Ok(Vec::new());
        }
        let parsed = project::parse_document(document)?;
        if parsed.images.len() > self.capacity {
            return Err(CapacityError::TooMany {
                count: parsed.images.len(),
                limit: self.capacity,
            }
            .into());
        }
        // Legacy documents carry no width, keep ours.
        if let Some(width) = parsed.splitter_width {
            self.splitter_width = width;
        }

        self.clear();
        let mut warnings = Vec::new();
        for entry in parsed.images {
            let path = &entry.image.file_path;
            let mut image = match self.source.load(path) {
                Ok(image) => image,
                Err(err) => {
                    warnings.push(format!("cannot load {path:?}: {err}"));
                    continue;
                }
            };
            warnings.extend(
                image
                    .deserialize_project(&entry.image)
                    .into_iter()
                    .map(|warning| format!("{path:?}: {warning}")),
            );
            let mut item = self.make_item(image, entry.tag);
            item.view_state = entry.image.view_state;
            item.thumbnail = entry
                .thumbnail
                .as_deref()
                .and_then(|png| project::decode_thumbnail(png).ok())
                .map(Arc::new);
            self.items.push(item);
        }
        self.selected = self.items.len().saturating_sub(1);

        for warning in &warnings {
            log::warn!("editing: {warning}");
        }
        Ok(warnings)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use layerpipe_core::{compositor::Layer, source::MemorySource};

    fn source(paths: &[&str]) -> Arc<MemorySource> {
        let source = MemorySource::new();
        for path in paths {
            source.insert(
                *path,
                [16, 16],
                8,
                vec![
                    Layer::solid("bg", [16, 16], [0, 0], [200, 200, 200, 255]),
                    Layer::solid("mark", [4, 4], [2, 2], [10, 20, 30, 255]),
                ],
            );
        }
        Arc::new(source)
    }

    fn config(capacity: usize) -> EditingConfig {
        EditingConfig {
            capacity,
            ..EditingConfig::default()
        }
    }

    fn spawn(paths: &[&str], capacity: usize) -> Editing {
        Editing::spawn(source(paths), config(capacity), None).unwrap().0
    }

    #[tokio::test]
    async fn readding_tag_returns_existing() {
        let editing = spawn(&["/a.psd", "/b.psd"], 8);
        assert_eq!(
            editing.add_file("/a.psd", 5).await.unwrap(),
            AddFileOutcome::Added(0)
        );
        assert_eq!(
            editing.add_file("/b.psd", 0).await.unwrap(),
            AddFileOutcome::Added(1)
        );
        for _ in 0..2 {
            assert_eq!(
                editing.add_file("/a.psd", 5).await.unwrap(),
                AddFileOutcome::Existing(0)
            );
        }
        // Untagged files are never deduplicated.
        assert_eq!(editing.add_file("/b.psd", 0).await.unwrap().index(), 2);
        let snapshot = editing.snapshot().await.unwrap();
        assert_eq!(snapshot.items.len(), 3);
        assert_eq!(snapshot.selected, 2);
        assert_eq!(snapshot.items[0].display_name, "a.psd");
    }
    #[tokio::test]
    async fn capacity_and_load_errors_leave_state() {
        let editing = spawn(&["/a.psd"], 1);
        editing.add_file("/a.psd", 1).await.unwrap();
        assert!(matches!(
            editing.add_file("/a.psd", 2).await,
            Err(EditingError::Capacity(CapacityError::Full { limit: 1 }))
        ));
        // Still found by tag even when full.
        assert_eq!(
            editing.add_file("/a.psd", 1).await.unwrap(),
            AddFileOutcome::Existing(0)
        );
        editing.clear().await.unwrap();
        assert!(matches!(
            editing.add_file("/missing.psd", 0).await,
            Err(EditingError::Load(_))
        ));
        assert!(editing.snapshot().await.unwrap().items.is_empty());
    }
    async fn refill(editing: &Editing, paths: &[&str]) {
        editing.clear().await.unwrap();
        for path in paths {
            editing.add_file(path, 0).await.unwrap();
        }
    }
    async fn selected_after(editing: &Editing, select: usize, delete: usize) -> usize {
        refill(editing, &["/0", "/1", "/2", "/3"]).await;
        editing.select(select).await.unwrap();
        editing.delete(delete).await.unwrap();
        editing.snapshot().await.unwrap().selected
    }
    #[tokio::test]
    async fn delete_keeps_selection_in_range() {
        let editing = spawn(&["/0", "/1", "/2", "/3"], 8);
        // Before the selection shifts it down.
        assert_eq!(selected_after(&editing, 2, 0).await, 1);
        assert_eq!(selected_after(&editing, 2, 1).await, 1);
        // After the selection leaves it.
        assert_eq!(selected_after(&editing, 1, 3).await, 1);
        // The selection itself.
        assert_eq!(selected_after(&editing, 2, 2).await, 1);
        assert_eq!(selected_after(&editing, 0, 0).await, 0);
        assert_eq!(selected_after(&editing, 3, 3).await, 2);
        // Out of range is ignored.
        assert_eq!(selected_after(&editing, 3, 9).await, 3);

        refill(&editing, &["/0"]).await;
        editing.delete(0).await.unwrap();
        let snapshot = editing.snapshot().await.unwrap();
        assert!(snapshot.items.is_empty());
        assert_eq!(snapshot.selected, 0);
    }
    #[tokio::test]
    async fn update_tag_state_scenario() {
        let editing = spawn(&["A", "B", "C"], 8);
        editing.add_file("A", 0).await.unwrap();
        editing.add_file("B", 5).await.unwrap();
        assert_eq!(editing.snapshot().await.unwrap().selected, 1);

        let refresh = editing.update_tag_state("B", 5, "X").await.unwrap();
        assert!(!refresh);
        let snapshot = editing.snapshot().await.unwrap();
        assert_eq!(snapshot.items.len(), 2);
        assert_eq!(snapshot.items[1].latest_state, "X");

        // Opaque to the image, but the item is opened and the state recorded all the same.
        let refresh = editing.update_tag_state("C", 7, "Y").await.unwrap();
        assert!(refresh);
        let snapshot = editing.snapshot().await.unwrap();
        assert_eq!(snapshot.items.len(), 3);
        assert_eq!(snapshot.selected, 2);
        assert_eq!(snapshot.items[2].tag, 7);
        assert_eq!(snapshot.items[2].latest_state, "Y");
        assert_eq!(snapshot.items[2].image.lock().serialize(), "L.0 V.11");

        // A state that parses is applied to the new image.
        let refresh = editing.update_tag_state("A", 9, "H.1").await.unwrap();
        assert!(refresh);
        let snapshot = editing.snapshot().await.unwrap();
        assert_eq!(snapshot.items.len(), 4);
        assert_eq!(snapshot.selected, 3);
        assert_eq!(snapshot.items[3].latest_state, "H.1");
        assert_eq!(snapshot.items[3].image.lock().serialize(), "L.0 V.10");
    }
    #[tokio::test]
    async fn touch_skips_locked_images() {
        let editing = spawn(&["/a.psd"], 8);
        editing.add_file("/a.psd", 0).await.unwrap();
        let item = editing.snapshot().await.unwrap().items.remove(0);
        let before = item.toucher.last_access();
        std::thread::sleep(std::time::Duration::from_millis(2));

        // As a render would.
        let busy = item.image.lock();
        let wait = std::time::Duration::from_secs(5);
        tokio::time::timeout(wait, editing.touch())
            .await
            .unwrap()
            .unwrap();
        let snapshot = tokio::time::timeout(wait, editing.snapshot())
            .await
            .unwrap()
            .unwrap();
        drop(busy);
        assert_eq!(snapshot.items.len(), 1);
        assert!(item.toucher.last_access() > before);
    }
    #[tokio::test]
    async fn legacy_document_keeps_splitter() {
        let editing = spawn(&["/a.psd", "/b.psd"], 8);
        editing.set_splitter_width(321.0).await.unwrap();
        let legacy = r#"[
            {"image": {"version": 1, "filePath": "/a.psd", "layer": {}, "pfv": null}, "tag": 1},
            {"image": {"version": 1, "filePath": "/b.psd", "layer": {"mark": {"visible": false}}, "pfv": null}, "tag": 2}
        ]"#;
        let warnings = editing.deserialize(legacy).await.unwrap();
        assert!(warnings.is_empty());
        let snapshot = editing.snapshot().await.unwrap();
        assert_eq!(snapshot.items.len(), 2);
        assert_eq!(snapshot.selected, 1);
        assert_eq!(snapshot.splitter_width, 321.0);
        assert_eq!(editing.splitter_width().await.unwrap(), 321.0);
        assert_eq!(snapshot.items[1].image.lock().serialize(), "L.0 V.10");
        assert!(snapshot.items[0].view_state.is_none());
    }
    #[tokio::test]
    async fn document_roundtrip_skips_missing() {
        let source = source(&["/a.psd", "/b.psd"]);
        let (editing, _) = Editing::spawn(source.clone(), config(8), None).unwrap();
        editing.add_file("/a.psd", 3).await.unwrap();
        editing.add_file("/b.psd", 4).await.unwrap();
        let snapshot = editing.snapshot().await.unwrap();
        editing
            .update_thumbnail(
                snapshot.items[0].id,
                Arc::new(RgbaImage::from_pixel(4, 2, image::Rgba([1, 2, 3, 255]))),
            )
            .await
            .unwrap();
        let view = ViewState {
            zoom: -1.0,
            scroll_x: 0.25,
            scroll_y: 0.75,
        };
        editing.update_view_state(1, Some(view)).await.unwrap();
        editing.set_splitter_width(250.0).await.unwrap();
        let document = editing.serialize().await.unwrap();

        source.remove("/a.psd");
        editing.set_splitter_width(10.0).await.unwrap();
        let warnings = editing.deserialize(&document).await.unwrap();
        assert_eq!(warnings.len(), 1);
        let snapshot = editing.snapshot().await.unwrap();
        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(snapshot.items[0].tag, 4);
        assert_eq!(snapshot.items[0].view_state, Some(view));
        assert_eq!(snapshot.splitter_width, 250.0);
        assert_eq!(snapshot.selected, 0);

        // Thumbnail survives too.
        source.insert("/a.psd", [4, 4], 4, Vec::new());
        editing.deserialize(&document).await.unwrap();
        let snapshot = editing.snapshot().await.unwrap();
        let thumbnail = snapshot.items[0].thumbnail.as_ref().unwrap();
        assert_eq!(thumbnail.get_pixel(3, 1).0, [1, 2, 3, 255]);

        // Too many images for the capacity is refused outright.
        let (small, _) = Editing::spawn(source, config(1), None).unwrap();
        assert!(matches!(
            small.deserialize(&document).await,
            Err(EditingError::Capacity(CapacityError::TooMany { count: 2, limit: 1 }))
        ));
    }
    #[tokio::test]
    async fn listener_sees_completed_mutations() {
        let (send, recv) = std::sync::mpsc::channel();
        let listener: ChangeListener = Box::new(move |snapshot: Snapshot| {
            let _ = send.send((snapshot.items.len(), snapshot.selected));
        });
        let (editing, _) = Editing::spawn(source(&["/a", "/b"]), config(8), Some(listener)).unwrap();
        editing.add_file("/a", 1).await.unwrap();
        editing.add_file("/b", 2).await.unwrap();
        // Re-add, view state and splitter are silent.
        editing.add_file("/a", 1).await.unwrap();
        editing.update_view_state(0, None).await.unwrap();
        editing.set_splitter_width(1.0).await.unwrap();
        editing.select(0).await.unwrap();
        editing.delete(1).await.unwrap();
        // Round trip to be sure everything before it was handled.
        editing.snapshot().await.unwrap();

        let seen: Vec<_> = recv.try_iter().collect();
        assert_eq!(seen, vec![(1, 0), (2, 1), (2, 0), (1, 0)]);
    }
    #[test]
    fn actor_exits_with_last_handle() {
        let (editing, thread) = Editing::spawn(source(&[]), config(1), None).unwrap();
        let other = editing.clone();
        drop(editing);
        drop(other);
        thread.join().unwrap();
    }
}
