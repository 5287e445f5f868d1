use crate::network::NodeId;
use crate::ops::SampleLayout;
use log::error;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BufferPoolError {
    #[error("Buffer for {0} requested twice without an intervening release")]
    DoubleRequest(BufferKey),
    #[error("Buffer for {0} released without a prior request")]
    ReleaseWithoutRequest(BufferKey),
    #[error("No buffer has been assigned to {0}")]
    NotAssigned(BufferKey),
}

#[derive(
    Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize, strum_macros::Display,
)]
pub enum BufferRole {
    Value,
    Gradient,
    /// One-time-step scratch output of a loop member.
    Step,
}

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct BufferKey {
    pub node: NodeId,
    pub role: BufferRole,
}

impl BufferKey {
    pub fn value(node: NodeId) -> Self {
        Self {
            node,
            role: BufferRole::Value,
        }
    }

    pub fn gradient(node: NodeId) -> Self {
        Self {
            node,
            role: BufferRole::Gradient,
        }
    }

    pub fn step(node: NodeId) -> Self {
        Self {
            node,
            role: BufferRole::Step,
        }
    }
}

impl std::fmt::Display for BufferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node, self.role)
    }
}

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct BufferId(pub(crate) usize);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// Buffers are only shared within one size class. `cols: None` means "one column per minibatch column".
#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct SizeClass {
    pub rows: usize,
    pub cols: Option<usize>,
}

impl SizeClass {
    pub fn of_layout(layout: SampleLayout) -> Self {
        match layout {
            SampleLayout::Minibatch { rows } => Self { rows, cols: None },
            SampleLayout::Fixed { rows, cols } => Self {
                rows,
                cols: Some(cols),
            },
        }
    }

    pub fn step(rows: usize, num_parallel_sequences: usize) -> Self {
        Self {
            rows,
            cols: Some(num_parallel_sequences),
        }
    }
}

impl std::fmt::Display for SizeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.cols {
            Some(cols) => write!(f, "[{} x {}]", self.rows, cols),
            None => write!(f, "[{} x *]", self.rows),
        }
    }
}

#[derive(Debug, Clone)]
struct BufferSlot {
    data: Array2<f32>,
    class: SizeClass,
    shareable: bool,
    content_owner: Option<BufferKey>,
}

/// One request/release window, recorded when auditing is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferWindow {
    pub key: BufferKey,
    pub buffer: BufferId,
    pub opened: u64,
    pub closed: Option<u64>,
}

impl BufferWindow {
    fn overlaps(&self, other: &BufferWindow) -> bool {
        let (first, second) = if self.opened <= other.opened {
            (self, other)
        } else {
            (other, self)
        };
        first.closed.is_none_or(|closed| closed > second.opened)
    }
}

/// Two holders were given the same buffer while both windows were open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferViolation {
    pub buffer: BufferId,
    pub first: BufferKey,
    pub second: BufferKey,
}

/// Scoped request/release pool with per-size-class free lists.
///
/// A key owns its buffer exclusively between `request` and `release`. After
/// release, a shareable buffer goes back to the free list of its size class;
/// a dedicated buffer never does. The last buffer handed to each key is kept
/// in `assignments`, which is what execution reads from.
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    slots: Vec<BufferSlot>,
    free: BTreeMap<SizeClass, Vec<BufferId>>,
    held: HashMap<BufferKey, BufferId>,
    assignments: HashMap<BufferKey, BufferId>,
    audit: Option<Vec<BufferWindow>>,
    tick: u64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A pool that records every window so `violations` can check it afterwards.
    pub fn with_audit() -> Self {
        Self {
            audit: Some(Vec::new()),
            ..Self::default()
        }
    }

    pub fn is_audited(&self) -> bool {
        self.audit.is_some()
    }

    pub fn request(
        &mut self,
        key: BufferKey,
        class: SizeClass,
        shareable: bool,
    ) -> Result<BufferId, BufferPoolError> {
        if self.held.contains_key(&key) {
            error!("Buffer pool: {key} requested twice");
            return Err(BufferPoolError::DoubleRequest(key));
        }
        let reused = if shareable {
            self.free.get_mut(&class).and_then(|x| x.pop())
        } else {
            None
        };
        let id = match reused {
            Some(id) => id,
            None => {
                self.slots.push(BufferSlot {
                    data: Array2::zeros((0, 0)),
                    class,
                    shareable,
                    content_owner: None,
                });
                BufferId(self.slots.len() - 1)
            }
        };
        self.held.insert(key, id);
        self.assignments.insert(key, id);
        self.tick += 1;
        if let Some(audit) = &mut self.audit {
            audit.push(BufferWindow {
                key,
                buffer: id,
                opened: self.tick,
                closed: None,
            });
        }
        Ok(id)
    }

    pub fn release(&mut self, key: BufferKey) -> Result<BufferId, BufferPoolError> {
        let Some(id) = self.held.remove(&key) else {
            error!("Buffer pool: {key} released without a request");
            return Err(BufferPoolError::ReleaseWithoutRequest(key));
        };
        let slot = &self.slots[id.0];
        if slot.shareable {
            self.free.entry(slot.class).or_default().push(id);
        }
        self.tick += 1;
        if let Some(audit) = &mut self.audit {
            if let Some(window) = audit
                .iter_mut()
                .rev()
                .find(|x| x.key == key && x.closed.is_none())
            {
                window.closed = Some(self.tick);
            }
        }
        Ok(id)
    }

    pub fn is_held(&self, key: &BufferKey) -> bool {
        self.held.contains_key(key)
    }

    pub fn num_held(&self) -> usize {
        self.held.len()
    }

    pub fn assignment(&self, key: &BufferKey) -> Result<BufferId, BufferPoolError> {
        self.assignments
            .get(key)
            .copied()
            .ok_or(BufferPoolError::NotAssigned(*key))
    }

    /// Every key that has ever been given a buffer, sorted by key.
    pub fn assignments(&self) -> Vec<(BufferKey, BufferId)> {
        let mut result: Vec<_> = self.assignments.iter().map(|(k, v)| (*k, *v)).collect();
        result.sort();
        result
    }

    pub fn num_buffers(&self) -> usize {
        self.slots.len()
    }

    pub fn size_class(&self, id: BufferId) -> SizeClass {
        self.slots[id.0].class
    }

    pub fn is_shareable(&self, id: BufferId) -> bool {
        self.slots[id.0].shareable
    }

    pub fn buffer(&self, id: BufferId) -> &Array2<f32> {
        &self.slots[id.0].data
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> &mut Array2<f32> {
        &mut self.slots[id.0].data
    }

    /// Moves the storage out so it can be written while other buffers are read.
    /// Must be paired with `restore`.
    pub fn take(&mut self, id: BufferId) -> Array2<f32> {
        std::mem::take(&mut self.slots[id.0].data)
    }

    pub fn restore(&mut self, id: BufferId, data: Array2<f32>) {
        self.slots[id.0].data = data;
    }

    /// Reallocates the storage (zero-filled) if its shape differs. Returns whether it did.
    pub fn ensure_shape(&mut self, id: BufferId, shape: (usize, usize)) -> bool {
        let slot = &mut self.slots[id.0];
        if slot.data.dim() != shape {
            slot.data = Array2::zeros(shape);
            slot.content_owner = None;
            true
        } else {
            false
        }
    }

    /// Key whose data currently sits in the buffer.
    pub fn content_owner(&self, id: BufferId) -> Option<BufferKey> {
        self.slots[id.0].content_owner
    }

    pub fn set_content_owner(&mut self, id: BufferId, key: BufferKey) {
        self.slots[id.0].content_owner = Some(key);
    }

    pub fn windows(&self) -> &[BufferWindow] {
        self.audit.as_deref().unwrap_or(&[])
    }

    /// Pairs of windows that shared a buffer while both were open.
    pub fn violations(&self) -> Vec<BufferViolation> {
        let mut by_buffer: BTreeMap<BufferId, Vec<&BufferWindow>> = BTreeMap::new();
        for window in self.windows() {
            by_buffer.entry(window.buffer).or_default().push(window);
        }
        let mut violations = Vec::new();
        for (buffer, windows) in by_buffer {
            for (i, a) in windows.iter().enumerate() {
                for b in &windows[i + 1..] {
                    if a.overlaps(b) {
                        violations.push(BufferViolation {
                            buffer,
                            first: a.key,
                            second: b.key,
                        });
                    }
                }
            }
        }
        violations
    }

    /// Drops every buffer and window but keeps the audit setting.
    pub fn reset(&mut self) {
        let audited = self.audit.is_some();
        *self = Self::default();
        if audited {
            self.audit = Some(Vec::new());
        }
    }
}
