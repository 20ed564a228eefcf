//! Labeled sample buckets.
//!
//! A `SampleStore` holds the classes being taught, in creation order. Each
//! class keeps its captured frames and their feature vectors index-aligned;
//! the only way to add to either sequence is `push_sample`, which appends a
//! frame and its vector together.
//!
//! Labels come from a monotonic counter and are never reused, even after the
//! class that held them is deleted or the store is reset.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::extract::FeatureVector;
use crate::frame::RasterFrame;

/// Stable identity of a class, used as its training target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassLabel(pub u32);

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One named bucket of captured samples.
#[derive(Debug)]
pub struct SampleClass {
    name: String,
    label: ClassLabel,
    frames: Vec<Arc<RasterFrame>>,
    features: Vec<FeatureVector>,
}

impl SampleClass {
    fn new(label: ClassLabel, name: String) -> Self {
        Self {
            name,
            label,
            frames: Vec::new(),
            features: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> ClassLabel {
        self.label
    }

    /// Captured frames in capture order.
    pub fn frames(&self) -> &[Arc<RasterFrame>] {
        &self.frames
    }

    /// Feature vectors, index-aligned with `frames()`.
    pub fn features(&self) -> &[FeatureVector] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The most recently captured frame.
    pub fn latest_frame(&self) -> Option<&Arc<RasterFrame>> {
        self.frames.last()
    }

    /// Frame at `index` wrapped around the frame count.
    pub fn frame_modulo(&self, index: usize) -> Option<&Arc<RasterFrame>> {
        if self.frames.is_empty() {
            return None;
        }
        self.frames.get(index % self.frames.len())
    }

    fn push_sample(&mut self, frame: Arc<RasterFrame>, vector: FeatureVector) {
        self.frames.push(frame);
        self.features.push(vector);
        debug_assert_eq!(self.frames.len(), self.features.len());
    }

    fn clear(&mut self) {
        self.frames = Vec::new();
        self.features = Vec::new();
    }

    fn memory_bytes(&self) -> usize {
        let pixels: usize = self.frames.iter().map(|f| f.byte_len()).sum();
        let vectors: usize = self
            .features
            .iter()
            .map(|v| v.len() * std::mem::size_of::<f32>())
            .sum();
        pixels + vectors
    }
}

/// Ordered collection of classes keyed by label.
#[derive(Debug, Default)]
pub struct SampleStore {
    classes: Vec<SampleClass>,
    next_label: u32,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty class. Without a name it is called `class N`, where N
    /// counts classes created so far (1-based).
    pub fn add_class(&mut self, name: Option<&str>) -> ClassLabel {
        let label = ClassLabel(self.next_label);
        self.next_label += 1;
        let name = match name.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("class {}", label.0 + 1),
        };
        self.classes.push(SampleClass::new(label, name));
        label
    }

    pub fn rename_class(&mut self, label: ClassLabel, name: &str) -> Result<()> {
        self.class_mut(label)?.name = name.to_string();
        Ok(())
    }

    /// Remove a class entirely. Other labels are untouched.
    pub fn delete_class(&mut self, label: ClassLabel) -> Result<()> {
        let index = self.index_of(label)?;
        self.classes.remove(index);
        Ok(())
    }

    /// Drop every sample of one class, keeping the class itself.
    pub fn clear_class(&mut self, label: ClassLabel) -> Result<()> {
        self.class_mut(label)?.clear();
        Ok(())
    }

    /// Append one captured sample to a class.
    pub fn push_sample(
        &mut self,
        label: ClassLabel,
        frame: Arc<RasterFrame>,
        vector: FeatureVector,
    ) -> Result<usize> {
        let class = self.class_mut(label)?;
        class.push_sample(frame, vector);
        Ok(class.len())
    }

    /// Destroy every class. The label counter keeps counting.
    pub fn clear(&mut self) {
        self.classes.clear();
    }

    pub fn class(&self, label: ClassLabel) -> Option<&SampleClass> {
        self.classes.iter().find(|c| c.label == label)
    }

    pub fn classes(&self) -> &[SampleClass] {
        &self.classes
    }

    pub fn labels(&self) -> Vec<ClassLabel> {
        self.classes.iter().map(|c| c.label).collect()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn total_samples(&self) -> usize {
        self.classes.iter().map(SampleClass::len).sum()
    }

    /// Approximate bytes held by frames and vectors.
    pub fn memory_bytes(&self) -> usize {
        self.classes.iter().map(SampleClass::memory_bytes).sum()
    }

    fn index_of(&self, label: ClassLabel) -> Result<usize> {
        self.classes
            .iter()
            .position(|c| c.label == label)
            .ok_or(KernelError::UnknownClass(label))
    }

    fn class_mut(&mut self, label: ClassLabel) -> Result<&mut SampleClass> {
        let index = self.index_of(label)?;
        Ok(&mut self.classes[index])
    }
}

/// Store shared between the session and its periodic tasks.
pub(crate) type SharedStore = Arc<RwLock<SampleStore>>;

pub(crate) fn write_store(store: &SharedStore) -> Result<RwLockWriteGuard<'_, SampleStore>> {
    store
        .write()
        .map_err(|_| KernelError::LockPoisoned("sample store"))
}

/// Read-only handle to the sample store.
///
/// Handed to the predictor and to outside observers. It exposes no way to
/// mutate the store; all mutation goes through the owning `Session`.
#[derive(Clone)]
pub struct StoreReader {
    store: SharedStore,
}

impl StoreReader {
    pub(crate) fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Borrow the store for reading.
    pub fn read(&self) -> Result<RwLockReadGuard<'_, SampleStore>> {
        self.store
            .read()
            .map_err(|_| KernelError::LockPoisoned("sample store"))
    }

    pub fn labels(&self) -> Result<Vec<ClassLabel>> {
        Ok(self.read()?.labels())
    }

    pub fn sample_count(&self, label: ClassLabel) -> Result<usize> {
        let store = self.read()?;
        store
            .class(label)
            .map(SampleClass::len)
            .ok_or(KernelError::UnknownClass(label))
    }

    pub fn class_name(&self, label: ClassLabel) -> Result<String> {
        let store = self.read()?;
        store
            .class(label)
            .map(|c| c.name().to_string())
            .ok_or(KernelError::UnknownClass(label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn frame() -> Arc<RasterFrame> {
        Arc::new(RasterFrame::solid(2, 2, [1, 2, 3]).expect("frame"))
    }

    #[test]
    fn default_names_follow_creation_count() {
        let mut store = SampleStore::new();
        let first = store.add_class(None);
        let second = store.add_class(Some("  "));
        let named = store.add_class(Some("dog"));
        assert_eq!(store.class(first).map(|c| c.name()), Some("class 1"));
        assert_eq!(store.class(second).map(|c| c.name()), Some("class 2"));
        assert_eq!(store.class(named).map(|c| c.name()), Some("dog"));
    }

    #[test]
    fn deleting_keeps_other_labels_stable() -> Result<()> {
        let mut store = SampleStore::new();
        let a = store.add_class(Some("a"));
        let b = store.add_class(Some("b"));
        let c = store.add_class(Some("c"));

        store.delete_class(b)?;
        assert_eq!(store.labels(), vec![a, c]);

        let d = store.add_class(Some("d"));
        assert_eq!(d, ClassLabel(3), "labels are never reused");
        assert!(matches!(
            store.delete_class(b),
            Err(KernelError::UnknownClass(label)) if label == b
        ));
        Ok(())
    }

    #[test]
    fn samples_stay_index_aligned() -> Result<()> {
        let mut store = SampleStore::new();
        let label = store.add_class(Some("cat"));
        for i in 0..4 {
            let count = store.push_sample(label, frame(), array![i as f32, 1.0])?;
            assert_eq!(count, i + 1);
            let class = store.class(label).expect("class");
            assert_eq!(class.frames().len(), class.features().len());
        }
        assert_eq!(store.total_samples(), 4);

        store.clear_class(label)?;
        assert!(store.class(label).expect("class").is_empty());
        Ok(())
    }

    #[test]
    fn reset_keeps_label_counter() {
        let mut store = SampleStore::new();
        store.add_class(None);
        store.add_class(None);
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.add_class(None), ClassLabel(2));
    }

    #[test]
    fn frame_lookup_wraps_and_tracks_latest() -> Result<()> {
        let mut store = SampleStore::new();
        let label = store.add_class(None);
        assert!(store.class(label).expect("class").frame_modulo(5).is_none());

        let first = frame();
        let last = frame();
        store.push_sample(label, first.clone(), array![0.0])?;
        store.push_sample(label, last.clone(), array![1.0])?;

        let class = store.class(label).expect("class");
        assert!(Arc::ptr_eq(class.latest_frame().expect("frame"), &last));
        assert!(Arc::ptr_eq(class.frame_modulo(4).expect("frame"), &first));
        Ok(())
    }
}
