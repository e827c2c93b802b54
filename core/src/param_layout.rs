/// Named parameter tensors packed into flat weight vectors.
///
/// A memory network's weights are one contiguous `Vec<f32>` per head so the
/// update recurrences can scan them as a single state. `ParamLayout` keeps
/// the name → (offset, shape) mapping so individual tensors stay addressable
/// (gradient norm clamping, per-tensor learning-rate modulation, inspection).

use serde::{Serialize, Deserialize};
use crate::error::MemoryError;

/// One named tensor inside a flat weight vector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub offset: usize,
}

impl ParamEntry {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.numel()
    }
}

/// Ordered list of named tensors and their placement.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamLayout {
    entries: Vec<ParamEntry>,
    numel: usize,
}

impl ParamLayout {
    pub fn new() -> Self {
        ParamLayout::default()
    }

    /// Append a tensor and return its offset.
    pub fn push(&mut self, name: impl Into<String>, shape: &[usize]) -> usize {
        let offset = self.numel;
        let entry = ParamEntry { name: name.into(), shape: shape.to_vec(), offset };
        self.numel += entry.numel();
        self.entries.push(entry);
        offset
    }

    /// Append every entry of `other` (offsets shifted to follow ours).
    pub fn extend(&mut self, other: &ParamLayout) {
        for e in &other.entries {
            self.push(e.name.clone(), &e.shape);
        }
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    /// Number of named tensors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total scalar count.
    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn entry(&self, name: &str) -> Option<&ParamEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Borrow the named tensor out of a flat weight vector.
    pub fn get<'a>(&self, name: &str, flat: &'a [f32]) -> Option<&'a [f32]> {
        self.entry(name).map(|e| &flat[e.range()])
    }
}

/// Memory-network weights for every head: `data` is `[heads, per_head]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryWeights {
    pub heads: usize,
    pub per_head: usize,
    pub data: Vec<f32>,
}

impl MemoryWeights {
    pub fn zeros(heads: usize, per_head: usize) -> Self {
        MemoryWeights { heads, per_head, data: vec![0.0; heads * per_head] }
    }

    pub fn from_heads(heads: Vec<Vec<f32>>) -> Self {
        let per_head = heads.first().map_or(0, |h| h.len());
        debug_assert!(heads.iter().all(|h| h.len() == per_head));
        let n = heads.len();
        MemoryWeights { heads: n, per_head, data: heads.concat() }
    }

    pub fn head(&self, h: usize) -> &[f32] {
        &self.data[h * self.per_head..(h + 1) * self.per_head]
    }

    pub fn head_mut(&mut self, h: usize) -> &mut [f32] {
        &mut self.data[h * self.per_head..(h + 1) * self.per_head]
    }

    /// Named tensor of one head.
    pub fn tensor<'a>(&'a self, layout: &ParamLayout, head: usize, name: &str) -> Option<&'a [f32]> {
        layout.get(name, self.head(head))
    }

    /// Ensure this bundle matches the engine's shape.
    pub fn check_shape(&self, what: &'static str, heads: usize, per_head: usize) -> Result<(), MemoryError> {
        if self.heads != heads {
            return Err(MemoryError::ShapeMismatch { what, expected: heads, found: self.heads });
        }
        if self.per_head != per_head {
            return Err(MemoryError::ShapeMismatch { what, expected: per_head, found: self.per_head });
        }
        if self.data.len() != heads * per_head {
            return Err(MemoryError::ShapeMismatch {
                what,
                expected: heads * per_head,
                found: self.data.len(),
            });
        }
        Ok(())
    }
}

/// Weight snapshots indexed by absolute chunk count.
///
/// `snapshots[j]` holds the weights after `start_chunk + j` committed chunks,
/// i.e. the weights in effect while chunk `start_chunk + j` is being written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightTrajectory {
    pub start_chunk: usize,
    pub snapshots: Vec<MemoryWeights>,
}

impl WeightTrajectory {
    /// One past the last chunk index covered.
    pub fn end_chunk(&self) -> usize {
        self.start_chunk + self.snapshots.len()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Weights in effect for the given absolute chunk index.
    pub fn snapshot(&self, chunk: usize) -> Result<&MemoryWeights, MemoryError> {
        if chunk < self.start_chunk || chunk >= self.end_chunk() {
            return Err(MemoryError::TrajectoryOutOfRange {
                chunk,
                start: self.start_chunk,
                end: self.end_chunk(),
            });
        }
        Ok(&self.snapshots[chunk - self.start_chunk])
    }

    pub fn last(&self) -> Option<&MemoryWeights> {
        self.snapshots.last()
    }
}
