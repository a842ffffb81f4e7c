//! Decompressed sample matrix

use serde::Serialize;

/// `sample_count × register_count` readings stored row-major.
///
/// Created fresh for every decoded frame and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleMatrix {
    sample_count: usize,
    register_count: usize,
    values: Vec<u16>,
}

impl SampleMatrix {
    /// Transpose per-register columns into a row-major matrix.
    ///
    /// Returns `None` when there are no columns, the columns are empty, or
    /// their lengths differ.
    pub fn from_columns(columns: &[Vec<u16>]) -> Option<Self> {
        let sample_count = columns.first()?.len();
        if sample_count == 0 || columns.iter().any(|column| column.len() != sample_count) {
            return None;
        }

        let register_count = columns.len();
        let mut values = Vec::with_capacity(sample_count * register_count);
        for sample in 0..sample_count {
            values.extend(columns.iter().map(|column| column[sample]));
        }

        Some(Self { sample_count, register_count, values })
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn register_count(&self) -> usize {
        self.register_count
    }

    /// Total number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value of `register` in `sample`, if both are in range.
    pub fn get(&self, sample: usize, register: usize) -> Option<u16> {
        if sample >= self.sample_count || register >= self.register_count {
            return None;
        }
        self.values.get(sample * self.register_count + register).copied()
    }

    /// All registers of one sample.
    ///
    /// # Panics
    ///
    /// Panics if `sample` is out of range.
    pub fn row(&self, sample: usize) -> &[u16] {
        let start = sample * self.register_count;
        &self.values[start..start + self.register_count]
    }

    /// Iterate over samples in order.
    pub fn rows(&self) -> impl Iterator<Item = &[u16]> {
        self.values.chunks_exact(self.register_count)
    }

    /// Copy out the values of one register across all samples.
    pub fn column(&self, register: usize) -> Vec<u16> {
        self.rows().map(|row| row[register]).collect()
    }

    /// Flattened row-major view.
    pub fn as_slice(&self) -> &[u16] {
        &self.values
    }

    pub fn into_vec(self) -> Vec<u16> {
        self.values
    }
}
