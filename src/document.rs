//! The document contract consumed by the replication protocol.
//!
//! The merge algorithm itself lives outside this crate. Whatever implements
//! [`Document`] must guarantee that `apply_update` is commutative and
//! idempotent, and that all replicas converge once they have seen the same
//! set of updates. The transport is at-least-once and unordered on purpose;
//! correctness rests entirely on those guarantees.
//!
//! [`MemoryDocument`] is the reference implementation used by this crate's
//! own tests: a grow-only set of opaque chunks, which is trivially
//! commutative, idempotent, and convergent.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

/// Marker naming who caused a document mutation.
///
/// Each provider applies remote updates under its own tag so that the
/// resulting mutation events can be told apart from genuine local edits
/// and are not rebroadcast (the loop breaker).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginTag(Arc<str>);

impl OriginTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(Arc::from(tag.into().into_boxed_str()))
    }

    /// The tag a provider instance applies remote updates under.
    pub fn provider(client_id: crate::protocol::ClientId) -> Self {
        Self::new(format!("provider-{client_id}"))
    }

    /// Conventional tag for edits made by the local UI.
    pub fn local() -> Self {
        Self::new("local")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OriginTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Callback invoked for every document mutation with the encoded delta
/// and the origin tag of whoever caused it.
pub type UpdateCallback = Box<dyn Fn(&[u8], &OriginTag) + Send + Sync>;

/// Errors surfaced by a document implementation.
#[derive(Debug, Clone)]
pub enum DocumentError {
    /// The update payload could not be decoded.
    MalformedUpdate(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedUpdate(e) => write!(f, "Malformed update: {e}"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// A conflict-free shared document, treated as opaque by this crate.
pub trait Document: Send + Sync {
    /// Encode the complete current state as an update that any replica
    /// can apply to catch up.
    fn encode_full_state(&self) -> Vec<u8>;

    /// Apply an update produced by `encode_full_state` or emitted through
    /// an update callback on any replica. Must be idempotent and
    /// commutative.
    fn apply_update(&self, update: &[u8], origin: &OriginTag) -> Result<(), DocumentError>;

    /// Register a callback fired after every mutation, whether it came
    /// from a local edit or from `apply_update`. The callback runs with
    /// the origin tag the mutator supplied.
    fn subscribe_updates(&self, callback: UpdateCallback) -> DocumentSubscription;
}

/// Detach-on-drop handle for an update callback.
pub struct DocumentSubscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl DocumentSubscription {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// Detach immediately instead of waiting for drop.
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for DocumentSubscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

struct MemoryDocInner {
    /// Grow-only set of opaque chunks. Union merge: commutative,
    /// idempotent, convergent.
    chunks: BTreeSet<Vec<u8>>,
    callbacks: HashMap<u64, Arc<UpdateCallback>>,
    next_callback_id: u64,
}

/// In-memory convergent document.
///
/// State is a grow-only set of byte chunks; an update is a bincode-encoded
/// set of chunks and applying one takes the union. `encode_full_state`
/// serializes the whole (ordered) set, so two replicas that have seen the
/// same chunks encode byte-identical state.
#[derive(Clone)]
pub struct MemoryDocument {
    inner: Arc<Mutex<MemoryDocInner>>,
}

impl MemoryDocument {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryDocInner {
                chunks: BTreeSet::new(),
                callbacks: HashMap::new(),
                next_callback_id: 0,
            })),
        }
    }

    /// Make a local edit: insert one chunk and emit the corresponding
    /// delta to subscribers under the given origin.
    pub fn insert(&self, chunk: impl Into<Vec<u8>>, origin: &OriginTag) {
        let chunk = chunk.into();
        let (added, callbacks) = {
            let mut inner = self.inner.lock().expect("document lock poisoned");
            let added = inner.chunks.insert(chunk.clone());
            (added, Self::snapshot_callbacks(&inner))
        };
        if added {
            let delta = encode_chunks(std::iter::once(chunk));
            for cb in callbacks {
                cb(&delta, origin);
            }
        }
    }

    /// Number of distinct chunks.
    pub fn chunk_count(&self) -> usize {
        self.inner.lock().expect("document lock poisoned").chunks.len()
    }

    // Callbacks are invoked outside the lock so a subscriber may call
    // back into the document without deadlocking.
    fn snapshot_callbacks(inner: &MemoryDocInner) -> Vec<Arc<UpdateCallback>> {
        inner.callbacks.values().cloned().collect()
    }
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_chunks(chunks: impl IntoIterator<Item = Vec<u8>>) -> Vec<u8> {
    let set: BTreeSet<Vec<u8>> = chunks.into_iter().collect();
    bincode::serde::encode_to_vec(&set, bincode::config::standard())
        .unwrap_or_default()
}

impl Document for MemoryDocument {
    fn encode_full_state(&self) -> Vec<u8> {
        let inner = self.inner.lock().expect("document lock poisoned");
        bincode::serde::encode_to_vec(&inner.chunks, bincode::config::standard())
            .unwrap_or_default()
    }

    fn apply_update(&self, update: &[u8], origin: &OriginTag) -> Result<(), DocumentError> {
        let incoming: BTreeSet<Vec<u8>> =
            bincode::serde::decode_from_slice(update, bincode::config::standard())
                .map(|(set, _)| set)
                .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;

        let (added, callbacks) = {
            let mut inner = self.inner.lock().expect("document lock poisoned");
            let added: Vec<Vec<u8>> = incoming
                .into_iter()
                .filter(|chunk| inner.chunks.insert(chunk.clone()))
                .collect();
            (added, Self::snapshot_callbacks(&inner))
        };

        // Redundant delivery is a no-op: nothing new, no event.
        if !added.is_empty() {
            let delta = encode_chunks(added);
            for cb in callbacks {
                cb(&delta, origin);
            }
        }
        Ok(())
    }

    fn subscribe_updates(&self, callback: UpdateCallback) -> DocumentSubscription {
        let id = {
            let mut inner = self.inner.lock().expect("document lock poisoned");
            let id = inner.next_callback_id;
            inner.next_callback_id += 1;
            inner.callbacks.insert(id, Arc::new(callback));
            id
        };

        let weak: Weak<Mutex<MemoryDocInner>> = Arc::downgrade(&self.inner);
        DocumentSubscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                if let Ok(mut inner) = inner.lock() {
                    inner.callbacks.remove(&id);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_insert_emits_delta_with_origin() {
        let doc = MemoryDocument::new();
        let seen: Arc<Mutex<Vec<(Vec<u8>, OriginTag)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = doc.subscribe_updates(Box::new(move |update, origin| {
            seen2.lock().unwrap().push((update.to_vec(), origin.clone()));
        }));

        doc.insert(b"chunk-a".to_vec(), &OriginTag::local());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, OriginTag::local());
    }

    #[test]
    fn test_apply_update_merges() {
        let a = MemoryDocument::new();
        let b = MemoryDocument::new();

        a.insert(b"one".to_vec(), &OriginTag::local());
        b.apply_update(&a.encode_full_state(), &OriginTag::new("remote"))
            .unwrap();

        assert_eq!(a.encode_full_state(), b.encode_full_state());
        assert_eq!(b.chunk_count(), 1);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let a = MemoryDocument::new();
        let b = MemoryDocument::new();

        a.insert(b"one".to_vec(), &OriginTag::local());
        let state = a.encode_full_state();

        b.apply_update(&state, &OriginTag::new("remote")).unwrap();
        let once = b.encode_full_state();
        b.apply_update(&state, &OriginTag::new("remote")).unwrap();
        let twice = b.encode_full_state();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_apply_is_commutative() {
        let a = MemoryDocument::new();
        a.insert(b"x".to_vec(), &OriginTag::local());
        let update_x = a.encode_full_state();

        let b = MemoryDocument::new();
        b.insert(b"y".to_vec(), &OriginTag::local());
        let update_y = b.encode_full_state();

        let forward = MemoryDocument::new();
        forward.apply_update(&update_x, &OriginTag::local()).unwrap();
        forward.apply_update(&update_y, &OriginTag::local()).unwrap();

        let backward = MemoryDocument::new();
        backward.apply_update(&update_y, &OriginTag::local()).unwrap();
        backward.apply_update(&update_x, &OriginTag::local()).unwrap();

        assert_eq!(forward.encode_full_state(), backward.encode_full_state());
    }

    #[test]
    fn test_redundant_apply_emits_nothing() {
        let doc = MemoryDocument::new();
        doc.insert(b"one".to_vec(), &OriginTag::local());
        let state = doc.encode_full_state();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let _sub = doc.subscribe_updates(Box::new(move |_, _| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        doc.apply_update(&state, &OriginTag::new("remote")).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_malformed_update_rejected() {
        let doc = MemoryDocument::new();
        let err = doc.apply_update(&[0xFF, 0x01, 0x02], &OriginTag::local());
        assert!(matches!(err, Err(DocumentError::MalformedUpdate(_))));
        assert_eq!(doc.chunk_count(), 0);
    }

    #[test]
    fn test_subscription_detaches_on_drop() {
        let doc = MemoryDocument::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let sub = doc.subscribe_updates(Box::new(move |_, _| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        doc.insert(b"a".to_vec(), &OriginTag::local());
        drop(sub);
        doc.insert(b"b".to_vec(), &OriginTag::local());

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_origin_tag_equality() {
        let id = crate::protocol::ClientId::new(9);
        assert_eq!(OriginTag::provider(id), OriginTag::provider(id));
        assert_ne!(OriginTag::provider(id), OriginTag::local());
    }
}
