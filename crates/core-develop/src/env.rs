//! The explicit environment record.
//!
//! Everything the controller needs from the outside world — module registry,
//! catalog, image sources, configuration — is threaded through this value at
//! construction time. No ambient globals: two test environments coexist in
//! one process without seeing each other.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use core_config::Config;
use core_image::{DevResult, ImageId, SharedBuffer};
use core_module::Registry;
use core_store::Catalog;

/// Decoded image access; the raw loader and the mipmap cache behind one
/// seam. The preview path is best-effort (a missing mip never stalls the
/// preview pipeline — it reports not-ready and the loader re-triggers); the
/// full path blocks until pixels exist.
pub trait ImageSource: Send + Sync {
    /// Full-resolution source buffer. Blocks while the raw decodes.
    fn load_full(&self, id: ImageId) -> DevResult<SharedBuffer>;

    /// Downsampled source for the preview pipeline, `Ok(None)` when the mip
    /// is still being produced.
    fn load_preview(&self, id: ImageId, downsample: u32) -> DevResult<Option<SharedBuffer>>;
}

/// Shared services for every [`crate::Develop`] in the process.
#[derive(Clone)]
pub struct Env {
    pub registry: Arc<Registry>,
    pub catalog: Arc<dyn Catalog>,
    pub source: Arc<dyn ImageSource>,
    pub config: Arc<Config>,
    /// Process-wide initialisation lock: held across image load and unload
    /// so module-list reshaping never races a second load.
    pub(crate) load_lock: Arc<Mutex<()>>,
    /// Count of images that failed to load (unknown id, unreadable raw).
    /// Read by UI messaging.
    pub invalid_images: Arc<AtomicU64>,
}

impl Env {
    pub fn new(
        registry: Arc<Registry>,
        catalog: Arc<dyn Catalog>,
        source: Arc<dyn ImageSource>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            catalog,
            source,
            config,
            load_lock: Arc::new(Mutex::new(())),
            invalid_images: Arc::new(AtomicU64::new(0)),
        }
    }
}
