//! Batched state containers shared by the model, environment and walkers layers.
//!
//! A [`BatchState`] maps field names to arrays whose leading dimension is the
//! number of walkers. All fields in one container share that leading dimension
//! for the lifetime of a run; shapes are fixed when a field is declared.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Well-known field names used across the pipeline.
pub mod fields {
    /// Environment-internal state rows.
    pub const STATES: &str = "states";
    /// Observation rows fed to the model.
    pub const OBSERVS: &str = "observs";
    /// Cumulative reward, one scalar per walker.
    pub const REWARDS: &str = "rewards";
    /// Out-of-bounds flags.
    pub const OOBS: &str = "oobs";
    /// Terminal flags.
    pub const TERMINALS: &str = "terminals";
    /// Action rows produced by the model.
    pub const ACTIONS: &str = "actions";
    /// Per-action duration, one scalar per walker.
    pub const DT: &str = "dt";
}

/// Structural failures: shape or kind mismatches between pipeline stages.
///
/// These are fatal and surfaced before any numeric step runs.
#[derive(Debug, thiserror::Error)]
pub enum StructuralError {
    #[error("field '{0}' is not declared")]
    MissingField(String),
    #[error("field '{name}' holds {found} data, expected {expected}")]
    FieldKind {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("field '{name}' expects {expected} values per walker, got {found}")]
    FieldWidth {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("batch size mismatch on '{name}': expected {expected} walkers, got {found}")]
    BatchSize {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("field '{name}' is already declared with a different shape")]
    Redeclared { name: String },
    #[error("walker index {index} out of range for batch of {n_walkers}")]
    WalkerIndex { index: usize, n_walkers: usize },
    #[error("incompatible states: {0}")]
    Incompatible(String),
}

/// A single named array in a [`BatchState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Field {
    /// Row-major `n_walkers x width` matrix.
    F32 { width: usize, data: Vec<f32> },
    /// One flag per walker.
    Bool { data: Vec<bool> },
}

impl Field {
    fn kind(&self) -> &'static str {
        match self {
            Field::F32 { .. } => "f32",
            Field::Bool { .. } => "bool",
        }
    }
}

/// Versioned, fixed-batch-size container of named arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    n_walkers: usize,
    version: u64,
    fields: BTreeMap<String, Field>,
}

impl BatchState {
    /// Create an empty container for `n_walkers` walkers.
    pub fn new(n_walkers: usize) -> Self {
        Self {
            n_walkers,
            version: 0,
            fields: BTreeMap::new(),
        }
    }

    /// Number of walkers (the leading dimension of every field).
    #[inline]
    pub fn n_walkers(&self) -> usize {
        self.n_walkers
    }

    /// Mutation counter, bumped on every write.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether a field has been declared.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Names of all declared fields, in deterministic order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Declare a zero-filled numeric field of `width` values per walker.
    pub fn declare_f32(&mut self, name: &str, width: usize) -> Result<(), StructuralError> {
        match self.fields.get(name) {
            Some(Field::F32 { width: w, .. }) if *w == width => Ok(()),
            Some(_) => Err(StructuralError::Redeclared { name: name.into() }),
            None => {
                self.fields.insert(
                    name.into(),
                    Field::F32 {
                        width,
                        data: vec![0.0; self.n_walkers * width],
                    },
                );
                self.version += 1;
                Ok(())
            }
        }
    }

    /// Declare a false-filled flag field.
    pub fn declare_bool(&mut self, name: &str) -> Result<(), StructuralError> {
        match self.fields.get(name) {
            Some(Field::Bool { .. }) => Ok(()),
            Some(_) => Err(StructuralError::Redeclared { name: name.into() }),
            None => {
                self.fields.insert(
                    name.into(),
                    Field::Bool {
                        data: vec![false; self.n_walkers],
                    },
                );
                self.version += 1;
                Ok(())
            }
        }
    }

    /// Replace (declaring on first use) a numeric field with `data` laid out
    /// row-major as `n_walkers x width`.
    pub fn set_f32(
        &mut self,
        name: &str,
        width: usize,
        data: Vec<f32>,
    ) -> Result<(), StructuralError> {
        if data.len() != self.n_walkers * width {
            return Err(StructuralError::BatchSize {
                name: name.into(),
                expected: self.n_walkers,
                found: if width == 0 { 0 } else { data.len() / width },
            });
        }
        match self.fields.get_mut(name) {
            Some(Field::F32 { width: w, data: d }) => {
                if *w != width {
                    return Err(StructuralError::FieldWidth {
                        name: name.into(),
                        expected: *w,
                        found: width,
                    });
                }
                *d = data;
            }
            Some(other) => {
                return Err(StructuralError::FieldKind {
                    name: name.into(),
                    expected: "f32",
                    found: other.kind(),
                });
            }
            None => {
                self.fields.insert(name.into(), Field::F32 { width, data });
            }
        }
        self.version += 1;
        Ok(())
    }

    /// Replace (declaring on first use) a flag field.
    pub fn set_bool(&mut self, name: &str, data: Vec<bool>) -> Result<(), StructuralError> {
        if data.len() != self.n_walkers {
            return Err(StructuralError::BatchSize {
                name: name.into(),
                expected: self.n_walkers,
                found: data.len(),
            });
        }
        match self.fields.get_mut(name) {
            Some(Field::Bool { data: d }) => *d = data,
            Some(other) => {
                return Err(StructuralError::FieldKind {
                    name: name.into(),
                    expected: "bool",
                    found: other.kind(),
                });
            }
            None => {
                self.fields.insert(name.into(), Field::Bool { data });
            }
        }
        self.version += 1;
        Ok(())
    }

    /// Full backing slice of a numeric field.
    pub fn f32_data(&self, name: &str) -> Result<&[f32], StructuralError> {
        match self.fields.get(name) {
            Some(Field::F32 { data, .. }) => Ok(data),
            Some(other) => Err(StructuralError::FieldKind {
                name: name.into(),
                expected: "f32",
                found: other.kind(),
            }),
            None => Err(StructuralError::MissingField(name.into())),
        }
    }

    /// Per-walker width of a numeric field.
    pub fn f32_width(&self, name: &str) -> Result<usize, StructuralError> {
        match self.fields.get(name) {
            Some(Field::F32 { width, .. }) => Ok(*width),
            Some(other) => Err(StructuralError::FieldKind {
                name: name.into(),
                expected: "f32",
                found: other.kind(),
            }),
            None => Err(StructuralError::MissingField(name.into())),
        }
    }

    /// Backing slice of a flag field.
    pub fn bool_data(&self, name: &str) -> Result<&[bool], StructuralError> {
        match self.fields.get(name) {
            Some(Field::Bool { data }) => Ok(data),
            Some(other) => Err(StructuralError::FieldKind {
                name: name.into(),
                expected: "bool",
                found: other.kind(),
            }),
            None => Err(StructuralError::MissingField(name.into())),
        }
    }

    /// One walker's row of a numeric field.
    pub fn row(&self, name: &str, index: usize) -> Result<&[f32], StructuralError> {
        self.check_index(index)?;
        match self.fields.get(name) {
            Some(Field::F32 { width, data }) => Ok(&data[index * width..(index + 1) * width]),
            Some(other) => Err(StructuralError::FieldKind {
                name: name.into(),
                expected: "f32",
                found: other.kind(),
            }),
            None => Err(StructuralError::MissingField(name.into())),
        }
    }

    /// One walker's value of a width-1 numeric field.
    pub fn scalar(&self, name: &str, index: usize) -> Result<f32, StructuralError> {
        let width = self.f32_width(name)?;
        if width != 1 {
            return Err(StructuralError::FieldWidth {
                name: name.into(),
                expected: 1,
                found: width,
            });
        }
        Ok(self.row(name, index)?[0])
    }

    /// Overwrite one walker's row of a numeric field.
    pub fn set_row(
        &mut self,
        name: &str,
        index: usize,
        values: &[f32],
    ) -> Result<(), StructuralError> {
        self.check_index(index)?;
        match self.fields.get_mut(name) {
            Some(Field::F32 { width, data }) => {
                if values.len() != *width {
                    return Err(StructuralError::FieldWidth {
                        name: name.into(),
                        expected: *width,
                        found: values.len(),
                    });
                }
                data[index * *width..(index + 1) * *width].copy_from_slice(values);
                self.version += 1;
                Ok(())
            }
            Some(other) => Err(StructuralError::FieldKind {
                name: name.into(),
                expected: "f32",
                found: other.kind(),
            }),
            None => Err(StructuralError::MissingField(name.into())),
        }
    }

    /// Overwrite one walker's value of a flag field.
    pub fn set_flag(
        &mut self,
        name: &str,
        index: usize,
        value: bool,
    ) -> Result<(), StructuralError> {
        self.check_index(index)?;
        match self.fields.get_mut(name) {
            Some(Field::Bool { data }) => {
                data[index] = value;
                self.version += 1;
                Ok(())
            }
            Some(other) => Err(StructuralError::FieldKind {
                name: name.into(),
                expected: "bool",
                found: other.kind(),
            }),
            None => Err(StructuralError::MissingField(name.into())),
        }
    }

    /// Copy every field of walker `src` onto walker `dst`.
    pub fn copy_row_within(&mut self, src: usize, dst: usize) -> Result<(), StructuralError> {
        self.check_index(src)?;
        self.check_index(dst)?;
        if src == dst {
            return Ok(());
        }
        for field in self.fields.values_mut() {
            match field {
                Field::F32 { width, data } => {
                    let w = *width;
                    let (from, to) = (src * w, dst * w);
                    for k in 0..w {
                        data[to + k] = data[from + k];
                    }
                }
                Field::Bool { data } => data[dst] = data[src],
            }
        }
        self.version += 1;
        Ok(())
    }

    /// Apply a balancing decision: every cloned walker becomes an exact copy
    /// of its companion, across every field.
    ///
    /// Writes are resolved as a parallel assignment: all companion rows are
    /// gathered before any destination row is written, so a walker that is
    /// simultaneously a clone source and target is copied from its
    /// pre-balance data.
    pub fn apply_clones(&mut self, record: &CloneRecord) -> Result<(), StructuralError> {
        if record.len() != self.n_walkers {
            return Err(StructuralError::BatchSize {
                name: "clone record".into(),
                expected: self.n_walkers,
                found: record.len(),
            });
        }
        let pairs = record.pairs();
        if pairs.is_empty() {
            return Ok(());
        }
        for field in self.fields.values_mut() {
            match field {
                Field::F32 { width, data } => {
                    let w = *width;
                    let gathered: Vec<f32> = pairs
                        .iter()
                        .flat_map(|&(_, src)| data[src * w..(src + 1) * w].iter().copied())
                        .collect();
                    for (k, &(dst, _)) in pairs.iter().enumerate() {
                        data[dst * w..(dst + 1) * w].copy_from_slice(&gathered[k * w..(k + 1) * w]);
                    }
                }
                Field::Bool { data } => {
                    let gathered: Vec<bool> = pairs.iter().map(|&(_, src)| data[src]).collect();
                    for (k, &(dst, _)) in pairs.iter().enumerate() {
                        data[dst] = gathered[k];
                    }
                }
            }
        }
        self.version += 1;
        Ok(())
    }

    /// Check that `other` carries the same number of walkers.
    pub fn ensure_batch_size(&self, other: &BatchState) -> Result<(), StructuralError> {
        if self.n_walkers != other.n_walkers {
            return Err(StructuralError::Incompatible(format!(
                "batch of {} walkers passed alongside batch of {}",
                other.n_walkers, self.n_walkers
            )));
        }
        Ok(())
    }

    /// Check that a numeric field exists, optionally with a fixed width.
    pub fn require_f32(&self, name: &str, width: Option<usize>) -> Result<(), StructuralError> {
        let found = self.f32_width(name)?;
        if let Some(expected) = width
            && found != expected
        {
            return Err(StructuralError::FieldWidth {
                name: name.into(),
                expected,
                found,
            });
        }
        Ok(())
    }

    /// Check that a flag field exists.
    pub fn require_bool(&self, name: &str) -> Result<(), StructuralError> {
        self.bool_data(name).map(|_| ())
    }

    fn check_index(&self, index: usize) -> Result<(), StructuralError> {
        if index >= self.n_walkers {
            return Err(StructuralError::WalkerIndex {
                index,
                n_walkers: self.n_walkers,
            });
        }
        Ok(())
    }
}

/// Per-epoch output of the balancing algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneRecord {
    will_clone: Vec<bool>,
    companions: Vec<usize>,
}

impl CloneRecord {
    /// A record that clones nothing.
    pub fn no_op(n_walkers: usize) -> Self {
        Self {
            will_clone: vec![false; n_walkers],
            companions: (0..n_walkers).collect(),
        }
    }

    /// Build a record, checking that a cloning walker never points at itself
    /// and every companion index is in range.
    pub fn new(will_clone: Vec<bool>, companions: Vec<usize>) -> Result<Self, StructuralError> {
        let n = will_clone.len();
        if companions.len() != n {
            return Err(StructuralError::Incompatible(format!(
                "clone record holds {} decisions but {} companions",
                n,
                companions.len()
            )));
        }
        for (i, (&clone, &companion)) in will_clone.iter().zip(&companions).enumerate() {
            if companion >= n {
                return Err(StructuralError::WalkerIndex {
                    index: companion,
                    n_walkers: n,
                });
            }
            if clone && companion == i {
                return Err(StructuralError::Incompatible(format!(
                    "walker {i} marked for cloning onto itself"
                )));
            }
        }
        Ok(Self {
            will_clone,
            companions,
        })
    }

    /// Number of walkers covered by this record.
    pub fn len(&self) -> usize {
        self.will_clone.len()
    }

    /// Whether the record covers an empty batch.
    pub fn is_empty(&self) -> bool {
        self.will_clone.is_empty()
    }

    /// Cloning decisions per walker.
    pub fn will_clone(&self) -> &[bool] {
        &self.will_clone
    }

    /// Companion index per walker.
    pub fn companions(&self) -> &[usize] {
        &self.companions
    }

    /// Whether walker `i` was cloned over.
    pub fn cloned(&self, i: usize) -> bool {
        self.will_clone[i]
    }

    /// Companion drawn for walker `i`.
    pub fn companion(&self, i: usize) -> usize {
        self.companions[i]
    }

    /// Number of walkers that will be overwritten.
    pub fn num_clones(&self) -> usize {
        self.will_clone.iter().filter(|&&c| c).count()
    }

    /// `(destination, source)` pairs for the walkers that clone.
    pub fn pairs(&self) -> Vec<(usize, usize)> {
        self.will_clone
            .iter()
            .enumerate()
            .filter(|&(_, &clone)| clone)
            .map(|(i, _)| (i, self.companions[i]))
            .collect()
    }
}
