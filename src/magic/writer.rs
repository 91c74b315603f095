//! Persistent, file-level patch registrar.
//!
//! Where the processor makes a single live execution observe a modification
//! set, the writer applies the set to the spell-definition file itself, in
//! memory, every time the engine loads or reloads it. A registration
//! outlives any number of reloads and needs no re-arming.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::magic::builder::MagicBuilder;
use crate::magic::file::MagicFile;
use crate::magic::model::{MagicId, Modification};

/// Identifies a resource in the engine's resource subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub usize);

/// Resource collaborator: buffer access for loaded files.
pub trait ResourcePort: Send + Sync + 'static {
    /// The resource for a canonical path, when it is already resident.
    fn resident(&self, path: &str) -> Option<ResourceHandle>;

    /// Whether the resource's underlying buffer is populated. Load events
    /// fire before the buffer is ready; the writer polls this.
    fn buffer_ready(&self, resource: ResourceHandle) -> bool;

    fn read(&self, resource: ResourceHandle) -> Option<Vec<u8>>;

    /// Swap the resource's in-memory buffer. One-shot, no locking against
    /// concurrent engine reads; callers time this for right after load.
    fn replace(&self, resource: ResourceHandle, data: Vec<u8>) -> bool;
}

/// Handle to one registration, for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationHandle(u64);

struct Registration {
    owner: String,
    magic_id: MagicId,
    mods: Vec<Modification>,
    path: String,
}

/// How often and how long to poll for a resource buffer after its load
/// event, before giving up on that load.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { attempts: 10, delay: Duration::from_millis(100) }
    }
}

struct WriterInner {
    resources: Arc<dyn ResourcePort>,
    registrations: Mutex<HashMap<RegistrationHandle, Registration>>,
    next_handle: AtomicU64,
    retry: RetryPolicy,
}

/// Registers modification sets against spell files and patches the files'
/// in-memory buffers whenever they load. Cheap to clone; clones share the
/// registration table.
#[derive(Clone)]
pub struct MagicWriter {
    inner: Arc<WriterInner>,
}

/// The suffix the resource-load filter accepts.
const MAGIC_SUFFIX: &str = ".magic";

/// Canonical per-character spell file path.
fn canonical_spell_path(character: u32, file_name: Option<&str>) -> String {
    match file_name {
        Some(name) => format!("chr/c{character:04}/{}", normalize(name)),
        None => format!("chr/c{character:04}/c{character:04}.magic"),
    }
}

/// Observed load paths come with scheme prefixes and platform separators;
/// registered paths are compared in this normalized form.
fn normalize(path: &str) -> String {
    path.replace('\\', "/").to_ascii_lowercase()
}

impl MagicWriter {
    pub fn new(resources: Arc<dyn ResourcePort>) -> Self {
        Self::with_retry(resources, RetryPolicy::default())
    }

    pub fn with_retry(resources: Arc<dyn ResourcePort>, retry: RetryPolicy) -> Self {
        MagicWriter {
            inner: Arc::new(WriterInner {
                resources,
                registrations: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                retry,
            }),
        }
    }

    /// Register a builder's modification set against a character's spell
    /// file. When the file is already resident the set applies right away
    /// instead of waiting for the next load.
    pub fn register(
        &self,
        owner: &str,
        builder: &MagicBuilder,
        character: u32,
        file_name: Option<&str>,
    ) -> RegistrationHandle {
        self.register_mods(
            owner,
            builder.magic_id(),
            builder.modifications().to_vec(),
            character,
            file_name,
        )
    }

    pub fn register_mods(
        &self,
        owner: &str,
        magic_id: MagicId,
        mods: Vec<Modification>,
        character: u32,
        file_name: Option<&str>,
    ) -> RegistrationHandle {
        let path = canonical_spell_path(character, file_name);
        let handle = RegistrationHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));

        debug!(
            "registering {} modifications for spell {magic_id} against {path} (owner {owner})",
            mods.len()
        );
        self.inner.registrations.lock().insert(
            handle,
            Registration { owner: owner.to_owned(), magic_id, mods, path: path.clone() },
        );

        if let Some(resource) = self.inner.resources.resident(&path) {
            trace!("{path} already resident, applying immediately");
            self.schedule_apply(path, resource);
        }

        handle
    }

    /// Remove one registration. Already-applied in-memory changes stay in
    /// place until the engine reloads the file from disk.
    pub fn unregister(&self, handle: RegistrationHandle) {
        self.inner.registrations.lock().remove(&handle);
    }

    /// Remove every registration made under `owner`.
    pub fn unregister_all(&self, owner: &str) {
        self.inner.registrations.lock().retain(|_, r| r.owner != owner);
    }

    pub fn registration_count(&self) -> usize {
        self.inner.registrations.lock().len()
    }

    pub fn handles_for_owner(&self, owner: &str) -> Vec<RegistrationHandle> {
        self.inner
            .registrations
            .lock()
            .iter()
            .filter(|(_, r)| r.owner == owner)
            .map(|(h, _)| *h)
            .collect()
    }

    /// Feed from the resource subsystem on every file load.
    pub fn on_resource_loaded(&self, path: &str, resource: ResourceHandle) {
        let observed = normalize(path);
        if !observed.ends_with(MAGIC_SUFFIX) {
            return;
        }

        if self.matches_registration(&observed) {
            debug!("registered spell file loaded: {path}");
            self.schedule_apply(observed, resource);
        }
    }

    /// Whether any registration targets the observed path. Suffix and
    /// substring containment both count, since the observed path may carry
    /// a scheme prefix or archive mount; an unrelated file with a
    /// colliding suffix would also match.
    fn matches_registration(&self, observed: &str) -> bool {
        self.inner
            .registrations
            .lock()
            .values()
            .any(|r| observed.ends_with(&r.path) || observed.contains(&r.path))
    }

    fn schedule_apply(&self, observed: String, resource: ResourceHandle) {
        let writer = self.clone();
        thread::Builder::new()
            .name("magic-writer-apply".into())
            .spawn(move || {
                writer.apply_to(&observed, resource);
            })
            .ok();
    }

    /// The worker the background task runs: wait for the buffer, parse,
    /// apply every matching registration, write the buffer back. Returns
    /// whether a patched buffer was installed.
    pub fn apply_to(&self, observed: &str, resource: ResourceHandle) -> bool {
        let retry = self.inner.retry;
        let mut ready = false;
        for attempt in 0..retry.attempts {
            if self.inner.resources.buffer_ready(resource) {
                ready = true;
                break;
            }
            trace!("buffer for {observed} not ready (attempt {attempt})");
            thread::sleep(retry.delay);
        }
        if !ready {
            error!("gave up waiting for buffer of {observed}");
            return false;
        }

        let Some(data) = self.inner.resources.read(resource) else {
            error!("couldn't read buffer of {observed}");
            return false;
        };

        let mut doc = match MagicFile::parse(&data) {
            Ok(doc) => doc,
            Err(e) => {
                error!("couldn't parse {observed}: {e}");
                return false;
            },
        };

        // Merge every registration hitting this path, grouped by spell id,
        // preserving registration order within a spell.
        let mut by_magic: Vec<(MagicId, Vec<Modification>)> = Vec::new();
        {
            let registrations = self.inner.registrations.lock();
            let mut handles: Vec<&RegistrationHandle> = registrations
                .iter()
                .filter(|(_, r)| observed.ends_with(&r.path) || observed.contains(&r.path))
                .map(|(h, _)| h)
                .collect();
            handles.sort_by_key(|h| h.0);

            for h in handles {
                let r = &registrations[h];
                match by_magic.iter_mut().find(|(id, _)| *id == r.magic_id) {
                    Some((_, mods)) => mods.extend(r.mods.iter().cloned()),
                    None => by_magic.push((r.magic_id, r.mods.clone())),
                }
            }
        }

        if by_magic.is_empty() {
            return false;
        }

        let mut touched = false;
        for (magic_id, mods) in &by_magic {
            touched |= doc.apply(*magic_id, mods);
        }
        if !touched {
            warn!("no registered spell found in {observed}, leaving buffer untouched");
            return false;
        }

        let patched = doc.serialize();
        if !self.inner.resources.replace(resource, patched) {
            error!("couldn't replace buffer of {observed}");
            return false;
        }

        debug!("patched {observed} for {} spells", by_magic.len());
        true
    }
}
