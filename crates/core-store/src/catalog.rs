//! The catalog interface and its in-memory implementation.
//!
//! Row shapes mirror the relational schema: `images`, `history` keyed by
//! `(imgid, num)`, `masks_history` in parallel, and `presets`. The trait is
//! the entire surface the engine consumes; a database-backed implementation
//! plugs in behind it without touching any other crate.

use std::collections::HashMap;
use std::sync::Mutex;

use core_history::MaskForm;
use core_image::{CaptureMeta, DevError, DevResult, ImageFlags, ImageId};
use core_presets::Preset;

/// One row of the images table.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRow {
    pub id: ImageId,
    pub width: u32,
    pub height: u32,
    pub history_end: usize,
    pub change_timestamp: i64,
    pub flags: ImageFlags,
    pub meta: CaptureMeta,
    /// Serialized per-image ordering override, when present.
    pub order_blob: Option<String>,
    pub content_hash: Option<u64>,
}

/// One row of the history table; composite key `(imgid, num)`.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub imgid: ImageId,
    pub num: u32,
    pub operation: String,
    pub op_params: Vec<u8>,
    /// Schema version the parameters were stored at.
    pub module_version: i32,
    pub enabled: bool,
    pub blendop_params: Vec<u8>,
    pub blendop_version: i32,
    pub multi_priority: u32,
    pub multi_name: String,
    pub multi_name_hand_edited: bool,
}

/// One row of the parallel mask table: entry `num` references `form`.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskRow {
    pub imgid: ImageId,
    pub num: u32,
    pub form: MaskForm,
}

/// The persistence surface the develop engine consumes.
pub trait Catalog: Send + Sync {
    fn image(&self, id: ImageId) -> DevResult<ImageRow>;
    /// History rows for `id` in `num` order.
    fn history_rows(&self, id: ImageId) -> DevResult<Vec<HistoryRow>>;
    fn mask_rows(&self, id: ImageId) -> DevResult<Vec<MaskRow>>;
    fn presets(&self) -> DevResult<Vec<Preset>>;

    /// Transactionally replace the image's history: delete existing rows,
    /// insert `rows` and `masks`, update `history_end`, the ordering blob,
    /// and the content hash on the image row. All or nothing.
    fn replace_history(
        &self,
        id: ImageId,
        rows: Vec<HistoryRow>,
        masks: Vec<MaskRow>,
        history_end: usize,
        order_blob: String,
        content_hash: u64,
    ) -> DevResult<()>;

    fn set_flags(&self, id: ImageId, flags: ImageFlags) -> DevResult<()>;
    fn set_history_end(&self, id: ImageId, history_end: usize) -> DevResult<()>;
    fn touch_change_timestamp(&self, id: ImageId, timestamp: i64) -> DevResult<()>;
}

#[derive(Default)]
struct MemoryTables {
    images: HashMap<ImageId, ImageRow>,
    history: HashMap<ImageId, Vec<HistoryRow>>,
    masks: HashMap<ImageId, Vec<MaskRow>>,
    presets: Vec<Preset>,
    next_id: u32,
    /// Test hook: refuse the next write transaction.
    write_locked: bool,
}

/// In-memory catalog used by tests and the headless driver.
#[derive(Default)]
pub struct MemoryCatalog {
    tables: Mutex<MemoryTables>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image and return its id.
    pub fn insert_image(&self, width: u32, height: u32, meta: CaptureMeta) -> ImageId {
        let mut t = self.tables.lock().unwrap();
        t.next_id += 1;
        let id = ImageId(t.next_id);
        t.images.insert(
            id,
            ImageRow {
                id,
                width,
                height,
                history_end: 0,
                change_timestamp: meta.change_timestamp,
                flags: ImageFlags::empty(),
                meta,
                order_blob: None,
                content_hash: None,
            },
        );
        id
    }

    pub fn seed_presets(&self, presets: Vec<Preset>) {
        self.tables.lock().unwrap().presets.extend(presets);
    }

    /// Seed a raw history row, bypassing the engine (legacy-image fixtures).
    pub fn seed_history_row(&self, row: HistoryRow) {
        let mut t = self.tables.lock().unwrap();
        t.history.entry(row.imgid).or_default().push(row);
    }

    /// Refuse (or accept again) write transactions; models a busy store.
    pub fn set_write_locked(&self, locked: bool) {
        self.tables.lock().unwrap().write_locked = locked;
    }
}

impl Catalog for MemoryCatalog {
    fn image(&self, id: ImageId) -> DevResult<ImageRow> {
        self.tables
            .lock()
            .unwrap()
            .images
            .get(&id)
            .cloned()
            .ok_or(DevError::InvalidImage(id))
    }

    fn history_rows(&self, id: ImageId) -> DevResult<Vec<HistoryRow>> {
        let t = self.tables.lock().unwrap();
        if !t.images.contains_key(&id) {
            return Err(DevError::InvalidImage(id));
        }
        let mut rows = t.history.get(&id).cloned().unwrap_or_default();
        rows.sort_by_key(|r| r.num);
        Ok(rows)
    }

    fn mask_rows(&self, id: ImageId) -> DevResult<Vec<MaskRow>> {
        let t = self.tables.lock().unwrap();
        if !t.images.contains_key(&id) {
            return Err(DevError::InvalidImage(id));
        }
        Ok(t.masks.get(&id).cloned().unwrap_or_default())
    }

    fn presets(&self) -> DevResult<Vec<Preset>> {
        Ok(self.tables.lock().unwrap().presets.clone())
    }

    fn replace_history(
        &self,
        id: ImageId,
        rows: Vec<HistoryRow>,
        masks: Vec<MaskRow>,
        history_end: usize,
        order_blob: String,
        content_hash: u64,
    ) -> DevResult<()> {
        let mut t = self.tables.lock().unwrap();
        if t.write_locked {
            return Err(DevError::PersistenceConflict("store is write-locked".into()));
        }
        let image = t.images.get_mut(&id).ok_or(DevError::InvalidImage(id))?;
        image.history_end = history_end;
        image.order_blob = Some(order_blob);
        image.content_hash = Some(content_hash);
        t.history.insert(id, rows);
        t.masks.insert(id, masks);
        Ok(())
    }

    fn set_flags(&self, id: ImageId, flags: ImageFlags) -> DevResult<()> {
        let mut t = self.tables.lock().unwrap();
        let image = t.images.get_mut(&id).ok_or(DevError::InvalidImage(id))?;
        image.flags = flags;
        Ok(())
    }

    fn set_history_end(&self, id: ImageId, history_end: usize) -> DevResult<()> {
        let mut t = self.tables.lock().unwrap();
        let image = t.images.get_mut(&id).ok_or(DevError::InvalidImage(id))?;
        image.history_end = history_end;
        Ok(())
    }

    fn touch_change_timestamp(&self, id: ImageId, timestamp: i64) -> DevResult<()> {
        let mut t = self.tables.lock().unwrap();
        let image = t.images.get_mut(&id).ok_or(DevError::InvalidImage(id))?;
        image.change_timestamp = timestamp;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> CaptureMeta {
        CaptureMeta {
            maker: "m".into(),
            model: "m".into(),
            camera_alias: "m".into(),
            lens: "l".into(),
            iso: 100.0,
            exposure: 0.01,
            aperture: 4.0,
            focal_length: 35.0,
            is_raw: true,
            is_hdr: false,
            is_ldr: false,
            is_monochrome: false,
            change_timestamp: 0,
        }
    }

    #[test]
    fn unknown_image_is_invalid() {
        let cat = MemoryCatalog::new();
        assert!(matches!(
            cat.image(ImageId(99)),
            Err(DevError::InvalidImage(_))
        ));
    }

    #[test]
    fn replace_history_is_all_or_nothing_when_locked() {
        let cat = MemoryCatalog::new();
        let id = cat.insert_image(100, 80, meta());
        cat.set_write_locked(true);
        let err = cat.replace_history(id, vec![], vec![], 0, "{}".into(), 1);
        assert!(matches!(err, Err(DevError::PersistenceConflict(_))));
        assert_eq!(cat.image(id).unwrap().content_hash, None, "nothing written");
        cat.set_write_locked(false);
        cat.replace_history(id, vec![], vec![], 0, "{}".into(), 1)
            .unwrap();
        assert_eq!(cat.image(id).unwrap().content_hash, Some(1));
    }

    #[test]
    fn history_rows_come_back_in_num_order() {
        let cat = MemoryCatalog::new();
        let id = cat.insert_image(10, 10, meta());
        for num in [2u32, 0, 1] {
            cat.seed_history_row(HistoryRow {
                imgid: id,
                num,
                operation: "exposure".into(),
                op_params: vec![],
                module_version: 2,
                enabled: true,
                blendop_params: vec![],
                blendop_version: 1,
                multi_priority: 0,
                multi_name: String::new(),
                multi_name_hand_edited: false,
            });
        }
        let rows = cat.history_rows(id).unwrap();
        let nums: Vec<u32> = rows.iter().map(|r| r.num).collect();
        assert_eq!(nums, vec![0, 1, 2]);
    }
}
