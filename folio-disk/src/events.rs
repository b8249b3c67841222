//! Change notifications emitted by a [`Disk`](crate::disk::Disk).
//!
//! Observers (a rendered file tree, an open editor, a search indexer)
//! register a listener and reconcile from the structured payload instead of
//! re-scanning the disk.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};

use crate::path::AbsPath;

// ── Payloads ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePaths {
    pub file_paths: Vec<AbsPath>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameDetail {
    pub old_path: AbsPath,
    pub new_path: AbsPath,
}

/// Serialized as `{"type": "create", "details": {"filePaths": [...]}}` or
/// `{"type": "rename", "details": [{"oldPath": .., "newPath": ..}]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details", rename_all = "lowercase")]
pub enum DiskEvent {
    Create(FilePaths),
    Delete(FilePaths),
    Rename(Vec<RenameDetail>),
}

impl DiskEvent {
    pub fn create(paths: Vec<AbsPath>) -> Self {
        Self::Create(FilePaths { file_paths: paths })
    }

    pub fn delete(paths: Vec<AbsPath>) -> Self {
        Self::Delete(FilePaths { file_paths: paths })
    }

    pub fn rename(old_path: AbsPath, new_path: AbsPath) -> Self {
        Self::Rename(vec![RenameDetail { old_path, new_path }])
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Create(_) => EventKind::Create,
            Self::Delete(_) => EventKind::Delete,
            Self::Rename(_) => EventKind::Rename,
        }
    }

    /// Every path the event touches, old and new sides of renames included.
    pub fn paths(&self) -> Vec<&AbsPath> {
        match self {
            Self::Create(d) | Self::Delete(d) => d.file_paths.iter().collect(),
            Self::Rename(pairs) => pairs
                .iter()
                .flat_map(|r| [&r.old_path, &r.new_path])
                .collect(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Create(d) | Self::Delete(d) => d.file_paths.is_empty(),
            Self::Rename(pairs) => pairs.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Delete,
    Rename,
}

// ── Listener registry ───────────────────────────────────────────────────────

type Listener = Arc<dyn Fn(&DiskEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: BTreeMap<u64, (Option<EventKind>, Listener)>,
}

/// Listener registry owned by one disk.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `listener` for all events, or only those of `filter`'s kind.
    pub fn subscribe<F>(&self, filter: Option<EventKind>, listener: F) -> Unsubscribe
    where
        F: Fn(&DiskEvent) + Send + Sync + 'static,
    {
        let mut reg = self.registry();
        let id = reg.next_id;
        reg.next_id += 1;
        reg.listeners.insert(id, (filter, Arc::new(listener)));
        Unsubscribe {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to matching listeners. Listeners run outside the
    /// registry lock so they may subscribe or unsubscribe re-entrantly.
    pub fn emit(&self, event: DiskEvent) {
        if event.is_empty() {
            return;
        }
        let kind = event.kind();
        let targets: Vec<Listener> = self
            .registry()
            .listeners
            .values()
            .filter(|(filter, _)| filter.is_none_or(|k| k == kind))
            .map(|(_, l)| l.clone())
            .collect();
        tracing::trace!(?kind, listeners = targets.len(), "emitting disk event");
        for listener in targets {
            listener(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry().listeners.len()
    }

    pub fn clear(&self) {
        self.registry().listeners.clear();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it keeps the
/// listener registered; call [`Unsubscribe::unsubscribe`] to remove it.
#[must_use = "dropping the handle leaves the listener registered"]
pub struct Unsubscribe {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(reg) = self.registry.upgrade() {
            reg.lock()
                .unwrap_or_else(|e| e.into_inner())
                .listeners
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn p(s: &str) -> AbsPath {
        crate::path::normalize(s).unwrap()
    }

    #[test]
    fn event_json_shape() {
        let ev = DiskEvent::create(vec![p("/a.md")]);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "create", "details": {"filePaths": ["/a.md"]}})
        );

        let ev = DiskEvent::rename(p("/a"), p("/b"));
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "rename", "details": [{"oldPath": "/a", "newPath": "/b"}]})
        );
        let back: DiskEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn listeners_receive_matching_events() {
        let bus = EventBus::new();
        let all = Arc::new(AtomicUsize::new(0));
        let renames = Arc::new(AtomicUsize::new(0));

        let a = all.clone();
        let _h1 = bus.subscribe(None, move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let r = renames.clone();
        let _h2 = bus.subscribe(Some(EventKind::Rename), move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(DiskEvent::create(vec![p("/x")]));
        bus.emit(DiskEvent::rename(p("/x"), p("/y")));

        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(renames.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = bus.subscribe(None, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(DiskEvent::delete(vec![p("/x")]));
        handle.unsubscribe();
        bus.emit(DiskEvent::delete(vec![p("/y")]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn empty_events_are_not_delivered() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _handle = bus.subscribe(None, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(DiskEvent::create(Vec::new()));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
