//! `NDImage` and the image manager: the four-dimensional `(channel, z, t)`
//! image container (design §3) and the single-slot live-view frame.
//!
//! The TIFF writer and image analysis stay out of the core's scope;
//! `ImageManager` owns only the in-memory container and the
//! `NDImageCreated`/`NDImageChanged` events that an external writer would
//! subscribe to.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::hub::DeviceHub;

/// One captured frame, copied out of a camera driver's device-memory ring.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u16,
    pub data: Vec<u8>,
}

/// One `(channel, z, t)` cell of an `NDImage`: a frame plus its metadata blob.
#[derive(Debug, Clone)]
pub struct NDImageCell {
    pub frame: Frame,
    pub metadata: JsonValue,
}

/// A four-axis image container. Dimensions grow monotonically as cells are
/// added; nothing is ever removed.
#[derive(Debug, Default)]
pub struct NDImage {
    name: String,
    n_channels: usize,
    cells: BTreeMap<(usize, usize, usize), NDImageCell>,
}

impl NDImage {
    pub fn new(name: impl Into<String>, n_channels: usize) -> Self {
        NDImage {
            name: name.into(),
            n_channels,
            cells: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_ch(&self) -> usize {
        self.n_channels
    }

    pub fn n_z(&self) -> usize {
        self.cells.keys().map(|(_, z, _)| *z + 1).max().unwrap_or(0)
    }

    pub fn n_t(&self) -> usize {
        self.cells.keys().map(|(_, _, t)| *t + 1).max().unwrap_or(0)
    }

    pub fn cell(&self, i_ch: usize, i_z: usize, i_t: usize) -> Option<&NDImageCell> {
        self.cells.get(&(i_ch, i_z, i_t))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn insert(&mut self, i_ch: usize, i_z: usize, i_t: usize, cell: NDImageCell) -> CoreResult<()> {
        if i_ch >= self.n_channels {
            return Err(CoreError::InvalidArgument(format!(
                "channel index {i_ch} out of range for ndimage '{}' with {} channels",
                self.name, self.n_channels
            )));
        }
        self.cells.insert((i_ch, i_z, i_t), cell);
        Ok(())
    }
}

/// Owns every in-flight and completed `NDImage`, plus the single-slot live
/// view frame. Publishes `NDImageCreated`/`NDImageChanged` through the hub so
/// external collaborators (UI, file writer) can react without being wired in
/// directly.
pub struct ImageManager {
    hub: Arc<DeviceHub>,
    images: RwLock<BTreeMap<String, NDImage>>,
    live_frame: RwLock<Option<Frame>>,
}

impl ImageManager {
    pub fn new(hub: Arc<DeviceHub>) -> Arc<Self> {
        Arc::new(ImageManager {
            hub,
            images: RwLock::new(BTreeMap::new()),
            live_frame: RwLock::new(None),
        })
    }

    /// Creates the named `NDImage` with `n_channels` channel slots if it does
    /// not already exist; reuses it (and ignores `n_channels`) otherwise.
    pub async fn ensure_ndimage(&self, name: &str, n_channels: usize) -> CoreResult<()> {
        let mut images = self.images.write().await;
        if !images.contains_key(name) {
            images.insert(name.to_string(), NDImage::new(name, n_channels));
            drop(images);
            self.hub.publish(crate::events::Event::ndimage_created(name));
        }
        Ok(())
    }

    pub async fn add_image(
        &self,
        name: &str,
        i_ch: usize,
        i_z: usize,
        i_t: usize,
        frame: Frame,
        metadata: JsonValue,
    ) -> CoreResult<()> {
        let mut images = self.images.write().await;
        let image = images
            .get_mut(name)
            .ok_or_else(|| CoreError::NotFound(format!("ndimage '{name}' does not exist")))?;
        image.insert(i_ch, i_z, i_t, NDImageCell { frame, metadata })?;
        drop(images);
        self.hub.publish(crate::events::Event::ndimage_changed(name));
        Ok(())
    }

    pub async fn dimensions(&self, name: &str) -> Option<(usize, usize, usize)> {
        self.images
            .read()
            .await
            .get(name)
            .map(|image| (image.n_ch(), image.n_z(), image.n_t()))
    }

    pub async fn len(&self, name: &str) -> Option<usize> {
        self.images.read().await.get(name).map(|image| image.len())
    }

    /// Returns a `(channel, z, t)` cell's metadata blob, the way an external
    /// TIFF writer would read it back out before serializing it into the
    /// frame's `ImageDescription` tag.
    pub async fn cell_metadata(&self, name: &str, i_ch: usize, i_z: usize, i_t: usize) -> Option<JsonValue> {
        self.images
            .read()
            .await
            .get(name)?
            .cell(i_ch, i_z, i_t)
            .map(|cell| cell.metadata.clone())
    }

    pub async fn set_live_frame(&self, frame: Frame) {
        *self.live_frame.write().await = Some(frame);
    }

    pub async fn clear_live_frame(&self) {
        *self.live_frame.write().await = None;
    }

    pub async fn live_frame(&self) -> Option<Frame> {
        self.live_frame.read().await.clone()
    }
}
