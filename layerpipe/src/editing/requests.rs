use std::sync::Arc;

use image::RgbaImage;
use layerpipe_core::{
    layers::StateError, project::SerializationError, project::ViewState, source::LoadError,
};

use super::{ImageHandle, ItemId, Snapshot};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityError {
    #[error("too many images, at most {limit} may be open")]
    Full { limit: usize },
    #[error("document holds {count} images, at most {limit} may be open")]
    TooMany { count: usize, limit: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum EditingError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    State(#[from] StateError),
    /// The actor is gone, the process is shutting down.
    #[error("editing has shut down")]
    Closed,
}

/// Where an added file ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddFileOutcome {
    /// An item with the same tag was already open, nothing was loaded.
    Existing(usize),
    /// Newly loaded, appended and selected.
    Added(usize),
}
impl AddFileOutcome {
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Existing(idx) | Self::Added(idx) => idx,
        }
    }
}

#[derive(Clone)]
pub struct SelectedImage {
    pub id: ItemId,
    pub image: ImageHandle,
    pub display_name: String,
    pub latest_state: String,
}

pub(super) use tokio::sync::oneshot::Sender as RequestResponse;
type Fallible<T> = RequestResponse<Result<T, EditingError>>;

pub enum Request {
    // Synchronous, answered through `reply`.
    AddFile {
        path: String,
        tag: i32,
        reply: Fallible<AddFileOutcome>,
    },
    Serialize {
        reply: Fallible<String>,
    },
    /// Replace every item with those of a document. Replies with non-fatal warnings.
    Deserialize {
        document: String,
        reply: Fallible<Vec<String>>,
    },
    /// Replies whether a new item was opened, and so whether the display needs a refresh.
    UpdateTagState {
        path: String,
        tag: i32,
        state: String,
        reply: Fallible<bool>,
    },
    GetSnapshot {
        reply: RequestResponse<Snapshot>,
    },
    GetSelectedImage {
        reply: RequestResponse<Option<SelectedImage>>,
    },
    GetSplitterWidth {
        reply: RequestResponse<f32>,
    },

    // Asynchronous.
    Delete {
        index: usize,
    },
    Clear,
    Select {
        index: usize,
    },
    /// Mark every open image as recently used.
    Touch,
    UpdateThumbnail {
        id: ItemId,
        thumbnail: Arc<RgbaImage>,
    },
    UpdateViewState {
        index: usize,
        view_state: Option<ViewState>,
    },
    SetSplitterWidth {
        width: f32,
    },
}
impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AddFile { .. } => "AddFile",
            Self::Serialize { .. } => "Serialize",
            Self::Deserialize { .. } => "Deserialize",
            Self::UpdateTagState { .. } => "UpdateTagState",
            Self::GetSnapshot { .. } => "GetSnapshot",
            Self::GetSelectedImage { .. } => "GetSelectedImage",
            Self::GetSplitterWidth { .. } => "GetSplitterWidth",
            Self::Delete { .. } => "Delete",
            Self::Clear => "Clear",
            Self::Select { .. } => "Select",
            Self::Touch => "Touch",
            Self::UpdateThumbnail { .. } => "UpdateThumbnail",
            Self::UpdateViewState { .. } => "UpdateViewState",
            Self::SetSplitterWidth { .. } => "SetSplitterWidth",
        };
        f.write_str(name)
    }
}
