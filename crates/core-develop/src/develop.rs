//! The per-image develop state and its controller methods.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use core_history::{
    AppendRequest, CheckpointGate, CheckpointWindows, HistoryStack, MaskForm, StackChange,
};
use core_image::{DevError, DevResult, ImageHandle, ImageId};
use core_module::instance::InstanceList;
use core_order::{OrderList, Workflow};
use core_pipeline::{
    ChangeFlags, HashWaitDirection, HashWaitOutcome, PipeKind, PipeStatus, Pipeline, RunCtx,
    RunOutcome, ViewportRequest, WaitHashConfig, node_specs, wait_hash,
};
use core_store::{Sidecar, export_sidecar, read_history, write_history};

use crate::env::Env;
use crate::signal::{DevelopSignal, SignalBus};

/// Opaque token naming the widget (or scripted actor) driving an edit.
/// Successive edits with the same target group into one undo checkpoint;
/// the history stack itself only coalesces byte-identical snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditTarget(pub u64);

/// State guarded by the history mutex.
struct HistoryState {
    instances: InstanceList,
    stack: HistoryStack,
    order: OrderList,
    gate: CheckpointGate,
    content_hash: u64,
}

struct AutosaveState {
    last: Option<Instant>,
    disabled: bool,
}

/// Autosave writes slower than this disable autosave for the session.
const AUTOSAVE_SLOW_LIMIT: Duration = Duration::from_millis(500);

pub struct Develop {
    env: Env,
    image: ImageHandle,
    history: Mutex<HistoryState>,
    full: Arc<Pipeline>,
    preview: Arc<Pipeline>,
    secondary: Arc<Pipeline>,
    /// Monotonic develop clock; every invalidation bumps it.
    timestamp: AtomicU64,
    gui_leaving: AtomicBool,
    autosave: Mutex<AutosaveState>,
    sidecar_path: Mutex<Option<PathBuf>>,
    signals: SignalBus,
}

impl Develop {
    /// Load an image into a fresh develop state: blocking raw decode,
    /// instance list, persisted history (presets auto-apply on first load),
    /// three pipelines. Holds the process-wide load lock throughout.
    pub fn load_image(env: &Env, imgid: ImageId) -> DevResult<Develop> {
        let _guard = env.load_lock.lock().unwrap();

        let row = match env.catalog.image(imgid) {
            Ok(row) => row,
            Err(e) => {
                env.invalid_images.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        let raw = match env.source.load_full(imgid) {
            Ok(raw) => raw,
            Err(e) => {
                env.invalid_images.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let workflow = env
            .config
            .file
            .workflow
            .default
            .as_deref()
            .and_then(Workflow::parse)
            .unwrap_or_default();
        let mut instances = InstanceList::from_registry(&env.registry);
        let loaded = read_history(
            env.catalog.as_ref(),
            &env.registry,
            &mut instances,
            imgid,
            workflow,
        )?;

        let cache_cap = env.config.file.cache.max_entries_per_pipe;
        let full = Arc::new(Pipeline::new(PipeKind::Full, cache_cap));
        let preview = Arc::new(Pipeline::new(PipeKind::Preview, cache_cap));
        let secondary = Arc::new(Pipeline::new(PipeKind::Secondary, cache_cap));
        full.set_source(Arc::clone(&raw));
        secondary.set_source(raw);
        // Best-effort: a missing mip leaves the preview Dirty, never blocked.
        if let Some(mip) = env
            .source
            .load_preview(imgid, env.config.effective_downsample)?
        {
            preview.set_source(mip);
        }

        // Flags may have changed during read_history (preset application).
        let row = env.catalog.image(imgid)?;
        let image = ImageHandle {
            id: imgid,
            dims: core_image::Dimensions::new(row.width, row.height),
            meta: row.meta.clone(),
            flags: row.flags,
        };
        info!(
            target: "develop",
            imgid = %imgid,
            history = loaded.stack.len(),
            cursor = loaded.stack.history_end(),
            auto_applied = loaded.auto_applied,
            "image loaded"
        );

        Ok(Develop {
            env: env.clone(),
            image,
            history: Mutex::new(HistoryState {
                instances,
                stack: loaded.stack,
                order: loaded.order,
                gate: CheckpointGate::new(),
                content_hash: loaded.content_hash,
            }),
            full,
            preview,
            secondary,
            timestamp: AtomicU64::new(1),
            gui_leaving: AtomicBool::new(false),
            autosave: Mutex::new(AutosaveState {
                last: None,
                disabled: false,
            }),
            sidecar_path: Mutex::new(None),
            signals: SignalBus::new(),
        })
    }

    pub fn image(&self) -> &ImageHandle {
        &self.image
    }

    pub fn signals(&self) -> crossbeam_channel::Receiver<DevelopSignal> {
        self.signals.receiver()
    }

    pub fn pipe(&self, kind: PipeKind) -> &Arc<Pipeline> {
        match kind {
            PipeKind::Full => &self.full,
            PipeKind::Preview => &self.preview,
            PipeKind::Secondary => &self.secondary,
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Where autosave mirrors the sidecar, when set.
    pub fn set_sidecar_path(&self, path: Option<PathBuf>) {
        *self.sidecar_path.lock().unwrap() = path;
    }

    // --- history inspection (GUI/test surface) -----------------------------

    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap().stack.len()
    }

    pub fn history_cursor(&self) -> usize {
        self.history.lock().unwrap().stack.history_end()
    }

    pub fn content_hash(&self) -> u64 {
        self.history.lock().unwrap().content_hash
    }

    pub fn instance_params(&self, op: &str, multi_priority: u32) -> Option<Vec<u8>> {
        self.history
            .lock()
            .unwrap()
            .instances
            .find(op, multi_priority)
            .map(|m| m.params.clone())
    }

    // --- edit intents ------------------------------------------------------

    /// Commit a parameter record to an instance and append the snapshot to
    /// history. The target token drives undo coalescing and the append's
    /// focus gate.
    pub fn commit_params(
        &self,
        op: &str,
        multi_priority: u32,
        params: Vec<u8>,
        enable: bool,
        target: EditTarget,
    ) -> DevResult<()> {
        let operation = self
            .env
            .registry
            .get(op)
            .ok_or_else(|| DevError::ModuleMismatch {
                imgid: self.image.id,
                op: op.to_string(),
            })?;
        operation.commit_params(&params)?;

        let change = {
            let mut guard = self.history.lock().unwrap();
            let hs = &mut *guard;
            // A freshly opened checkpoint forces a new history item; a
            // merged edit may still only coalesce when the stack finds the
            // snapshot byte-identical to the tail entry.
            let new_item = hs
                .gate
                .observe(target.0, Instant::now(), self.checkpoint_windows());
            let Some(instance) =
                hs.instances
                    .find_or_create(&self.env.registry, op, multi_priority)
            else {
                return Err(DevError::ModuleMismatch {
                    imgid: self.image.id,
                    op: op.to_string(),
                });
            };
            instance.params = params;
            instance.enabled = enable;
            let snapshot = instance.clone();
            hs.stack.append(
                &self.env.registry,
                &snapshot,
                AppendRequest {
                    enable,
                    new_item,
                    include_masks: false,
                    masks: None,
                    focus_hash: target.0,
                },
            )
        };
        self.after_history_edit(change);
        Ok(())
    }

    /// As [`Develop::commit_params`], but the entry records a deep copy of
    /// the currently edited mask form set.
    pub fn commit_params_with_masks(
        &self,
        op: &str,
        multi_priority: u32,
        params: Vec<u8>,
        masks: &[MaskForm],
        enable: bool,
        target: EditTarget,
    ) -> DevResult<()> {
        let operation = self
            .env
            .registry
            .get(op)
            .ok_or_else(|| DevError::ModuleMismatch {
                imgid: self.image.id,
                op: op.to_string(),
            })?;
        operation.commit_params(&params)?;

        let change = {
            let mut guard = self.history.lock().unwrap();
            let hs = &mut *guard;
            let opened = hs
                .gate
                .observe(target.0, Instant::now(), self.checkpoint_windows());
            let Some(instance) =
                hs.instances
                    .find_or_create(&self.env.registry, op, multi_priority)
            else {
                return Err(DevError::ModuleMismatch {
                    imgid: self.image.id,
                    op: op.to_string(),
                });
            };
            instance.params = params;
            instance.enabled = enable;
            let snapshot = instance.clone();
            hs.stack.append(
                &self.env.registry,
                &snapshot,
                AppendRequest {
                    enable,
                    new_item: opened,
                    include_masks: true,
                    masks: Some(masks),
                    focus_hash: target.0,
                },
            )
        };
        self.after_history_edit(change);
        Ok(())
    }

    /// Toggle an instance's enable bit and record it.
    pub fn set_enabled(
        &self,
        op: &str,
        multi_priority: u32,
        enable: bool,
        target: EditTarget,
    ) -> DevResult<()> {
        let params = self
            .instance_params(op, multi_priority)
            .ok_or_else(|| DevError::ModuleMismatch {
                imgid: self.image.id,
                op: op.to_string(),
            })?;
        self.commit_params(op, multi_priority, params, enable, target)
    }

    /// Duplicate an instance of `op`: new instance priority, rank inserted
    /// immediately after the base instance, full pipeline rebuild.
    pub fn duplicate_instance(&self, op: &str, base_priority: u32) -> DevResult<u32> {
        let operation = self
            .env
            .registry
            .get(op)
            .ok_or_else(|| DevError::ModuleMismatch {
                imgid: self.image.id,
                op: op.to_string(),
            })?;
        if operation
            .descriptor()
            .flags
            .contains(core_module::OpFlags::ONE_INSTANCE)
        {
            return Err(DevError::Malformed {
                what: "instance",
                detail: format!("`{op}` allows a single instance"),
            });
        }
        let new_priority = {
            let mut guard = self.history.lock().unwrap();
            let hs = &mut *guard;
            let new_priority = hs
                .instances
                .iter()
                .filter(|m| m.op == op)
                .map(|m| m.multi_priority + 1)
                .max()
                .unwrap_or(0);
            hs.order
                .insert_duplicate_after(op, base_priority, new_priority)?;
            let _ = hs
                .instances
                .find_or_create(&self.env.registry, op, new_priority);
            hs.order.seed_instances(&mut hs.instances);
            new_priority
        };
        self.after_history_edit(StackChange::REMOVE);
        Ok(new_priority)
    }

    /// Rewind/replay the history to cursor `n`.
    pub fn pop_history(&self, n: usize) {
        let change = {
            let mut guard = self.history.lock().unwrap();
            let hs = &mut *guard;
            hs.gate.reset();
            let out = hs
                .stack
                .pop_to(&self.env.registry, &mut hs.instances, n);
            if out.masks_changed {
                debug!(target: "develop", imgid = %self.image.id, "mask list changed by replay");
            }
            out.change
        };
        self.after_history_move(change);
    }

    pub fn undo(&self) {
        let cursor = self.history_cursor();
        if cursor > 0 {
            self.pop_history(cursor - 1);
        }
    }

    pub fn redo(&self) {
        let cursor = self.history_cursor();
        if cursor < self.history_len() {
            self.pop_history(cursor + 1);
        }
    }

    /// Discard in-memory edits and re-read everything persisted: ordering,
    /// history, instances. Pipelines rebuild or resync depending on whether
    /// the module topology survived.
    pub fn reload_history(&self) -> DevResult<()> {
        let workflow = self
            .env
            .config
            .file
            .workflow
            .default
            .as_deref()
            .and_then(Workflow::parse)
            .unwrap_or_default();
        let mut fresh_instances = InstanceList::from_registry(&self.env.registry);
        let loaded = read_history(
            self.env.catalog.as_ref(),
            &self.env.registry,
            &mut fresh_instances,
            self.image.id,
            workflow,
        )?;
        let topo_changed = {
            let mut guard = self.history.lock().unwrap();
            let hs = &mut *guard;
            hs.gate.reset();
            let topo_changed = hs.instances.topology_key() != fresh_instances.topology_key();
            hs.instances = fresh_instances;
            hs.stack = loaded.stack;
            hs.order = loaded.order;
            hs.content_hash = loaded.content_hash;
            topo_changed
        };
        self.after_history_move(if topo_changed {
            StackChange::REMOVE
        } else {
            StackChange::SYNCH
        });
        Ok(())
    }

    // --- rendering ---------------------------------------------------------

    /// Run one pipeline to completion (or interruption) against the current
    /// history. This is what scheduler workers call.
    pub fn process(&self, kind: PipeKind, viewport: ViewportRequest) -> RunOutcome {
        let sync = || {
            let guard = self.history.lock().unwrap();
            node_specs(&self.env.registry, &guard.instances)
        };
        let ctx = RunCtx {
            registry: &self.env.registry,
            sync_nodes: &sync,
            gui_leaving: &self.gui_leaving,
            timestamp: &self.timestamp,
            viewport,
            force_reload: false,
        };
        let outcome = self.pipe(kind).process(&ctx);
        if outcome == RunOutcome::Valid {
            self.signals.emit(DevelopSignal::PipeFinished(kind));
        }
        outcome
    }

    /// Mark one pipeline outdated and move the develop clock.
    pub fn invalidate(&self, kind: PipeKind) {
        self.timestamp.fetch_add(1, Ordering::AcqRel);
        self.pipe(kind).set_status(PipeStatus::Dirty);
    }

    pub fn invalidate_all(&self) {
        self.timestamp.fetch_add(1, Ordering::AcqRel);
        for kind in PipeKind::ALL {
            self.pipe(kind).set_status(PipeStatus::Dirty);
        }
    }

    /// Preview-source invalidation: the preview goes dirty, the other two
    /// record the new input version so their next run observes it.
    pub fn invalidate_preview(&self) {
        let ts = self.timestamp.fetch_add(1, Ordering::AcqRel) + 1;
        self.preview.set_status(PipeStatus::Dirty);
        self.full.bump_input_timestamp(ts);
        self.secondary.bump_input_timestamp(ts);
    }

    /// Hash-wait against one pipeline; a reprocess request raised by history
    /// flags dirties the pipeline as a side effect.
    pub fn wait_hash(
        &self,
        kind: PipeKind,
        iop_order: u32,
        direction: HashWaitDirection,
        expected: u64,
    ) -> HashWaitOutcome {
        let cfg = WaitHashConfig {
            period: Duration::from_millis(self.env.config.file.waithash.period_ms),
            timeout: Duration::from_millis(self.env.config.file.waithash.timeout_ms),
        };
        let outcome = wait_hash(self.pipe(kind), iop_order, direction, expected, cfg);
        if outcome == HashWaitOutcome::ReprocessRequested {
            self.invalidate(kind);
        }
        outcome
    }

    // --- persistence -------------------------------------------------------

    /// Persist history and the sidecar now, regardless of autosave cadence.
    pub fn save(&self) -> DevResult<u64> {
        let hash = {
            let mut guard = self.history.lock().unwrap();
            let hs = &mut *guard;
            let hash = write_history(self.env.catalog.as_ref(), self.image.id, &hs.stack, &hs.order)?;
            hs.content_hash = hash;
            hash
        };
        self.write_sidecar()?;
        Ok(hash)
    }

    /// Export the sidecar to `path` (or the configured path when `None`).
    pub fn export_sidecar_to(&self, path: Option<&std::path::Path>) -> DevResult<()> {
        let configured = self.sidecar_path.lock().unwrap().clone();
        let Some(path) = path.map(PathBuf::from).or(configured) else {
            return Ok(());
        };
        let guard = self.history.lock().unwrap();
        let sidecar = Sidecar::capture(
            self.image.id,
            &guard.stack,
            &guard.order,
            guard.content_hash,
        );
        drop(guard);
        export_sidecar(&path, &sidecar)
    }

    fn write_sidecar(&self) -> DevResult<()> {
        self.export_sidecar_to(None)
    }

    // --- teardown ----------------------------------------------------------

    /// Begin unload: every in-flight run observes the kill switch at its
    /// next suspension point and exits without publishing.
    pub fn close(&self) {
        self.gui_leaving.store(true, Ordering::Release);
        for kind in PipeKind::ALL {
            let pipe = self.pipe(kind);
            pipe.request_shutdown();
            pipe.set_status(PipeStatus::Invalid);
        }
        info!(target: "develop", imgid = %self.image.id, "leaving");
    }

    pub fn is_closing(&self) -> bool {
        self.gui_leaving.load(Ordering::Acquire)
    }

    // --- internals ---------------------------------------------------------

    fn checkpoint_windows(&self) -> CheckpointWindows {
        CheckpointWindows {
            merge_same_secs: self.env.config.file.undo.merge_same_secs,
            review_secs: self.env.config.file.undo.review_secs,
        }
    }

    fn stack_to_pipe_flags(change: StackChange) -> ChangeFlags {
        let mut flags = ChangeFlags::empty();
        if change.contains(StackChange::TOP_CHANGED) {
            flags |= ChangeFlags::TOP_CHANGED;
        }
        if change.contains(StackChange::SYNCH) {
            flags |= ChangeFlags::SYNCH;
        }
        if change.contains(StackChange::REMOVE) {
            flags |= ChangeFlags::REMOVE;
        }
        flags
    }

    fn raise_on_all(&self, flags: ChangeFlags) {
        self.timestamp.fetch_add(1, Ordering::AcqRel);
        for kind in PipeKind::ALL {
            let pipe = self.pipe(kind);
            pipe.add_change(flags);
            pipe.set_status(PipeStatus::Dirty);
        }
    }

    /// Shared tail of every history mutation that counts as a user edit.
    fn after_history_edit(&self, change: StackChange) {
        if change.is_empty() {
            return;
        }
        self.raise_on_all(Self::stack_to_pipe_flags(change));
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        if let Err(e) = self.env.catalog.touch_change_timestamp(self.image.id, now) {
            warn!(target: "develop", imgid = %self.image.id, error = %e, "change timestamp update failed");
        }
        self.signals.emit(DevelopSignal::HistoryChange);
        self.signals.emit(DevelopSignal::ImageChanged);
        self.autosave_tick();
    }

    /// Tail of cursor moves (undo/redo/reload): no autosave, no timestamp
    /// touch, but pipelines and listeners must know.
    fn after_history_move(&self, change: StackChange) {
        self.raise_on_all(Self::stack_to_pipe_flags(change));
        self.signals.emit(DevelopSignal::HistoryChange);
    }

    fn autosave_tick(&self) {
        if !self.env.config.file.autosave.enabled {
            return;
        }
        {
            let mut a = self.autosave.lock().unwrap();
            if a.disabled {
                return;
            }
            let delay = Duration::from_secs_f32(self.env.config.file.autosave.delay_secs.max(0.0));
            let now = Instant::now();
            if let Some(last) = a.last
                && now.saturating_duration_since(last) < delay
            {
                return;
            }
            a.last = Some(now);
        }

        let started = Instant::now();
        let result = self.save();
        let elapsed = started.elapsed();
        match result {
            Ok(_) if elapsed > AUTOSAVE_SLOW_LIMIT => {
                self.autosave.lock().unwrap().disabled = true;
                let e = DevError::AutosaveSlowDriveDetected {
                    elapsed_ms: elapsed.as_millis() as u64,
                };
                warn!(target: "develop.autosave", imgid = %self.image.id, elapsed_ms = elapsed.as_millis() as u64, "autosave disabled for this session");
                self.signals.emit(DevelopSignal::Toast(e.to_string()));
            }
            Ok(_) => {
                debug!(target: "develop.autosave", imgid = %self.image.id, elapsed_ms = elapsed.as_millis() as u64, "autosaved");
            }
            Err(e) => {
                // A refused transaction is soft here: memory state is intact
                // and the next autosave retries.
                warn!(target: "develop.autosave", imgid = %self.image.id, error = %e, "autosave failed");
            }
        }
    }
}
