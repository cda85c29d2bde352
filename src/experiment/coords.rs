//! Linear index ↔ N-dimensional coordinate mapping.
//!
//! An acquisition visits the Cartesian product of its axes. The same mapping is used to
//! drive acquisition order and to address images inside a stored dataset, so both
//! directions live here as pure functions.
//!
//! Two iteration orders are supported, both mixed-radix decompositions:
//!
//! - [`IterationOrder::Sequential`]: axis 0 varies slowest, matching nested loops
//!   `for p { for t { for c { .. } } }`.
//! - [`IterationOrder::Reverse`]: axis 0 varies fastest. Used for non-sequential
//!   access when validating a stored dataset.
//!
//! ```text
//! shape [2, 3, 1]     index 4
//!   Sequential  ->  (1, 1, 0)
//!   Reverse     ->  (0, 2, 0)
//! ```
//!
//! Shapes never contain the two trailing pixel-plane dimensions. Sinks expect them, so
//! [`Coordinate::with_plane_axes`] appends them explicitly as zeros.

use serde::{Deserialize, Serialize};

use crate::error::{AcqError, AcqResult};

/// Number of trailing pixel-plane entries (row, column) in a sink coordinate.
pub const PLANE_AXES: usize = 2;

/// Order in which linear indices walk the coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOrder {
    /// Axis 0 slowest-varying (nested-loop order)
    #[default]
    Sequential,
    /// Axis 0 fastest-varying
    Reverse,
}

impl std::fmt::Display for IterationOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IterationOrder::Sequential => write!(f, "sequential"),
            IterationOrder::Reverse => write!(f, "reverse"),
        }
    }
}

/// Ordered axis sizes, excluding the pixel plane. Every entry is at least 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u64>", into = "Vec<u64>")]
pub struct Shape(Vec<u64>);

impl Shape {
    /// Build a shape, rejecting zero-sized axes and element counts that overflow `u64`.
    pub fn new(dims: impl Into<Vec<u64>>) -> AcqResult<Self> {
        let dims = dims.into();
        if dims.is_empty() {
            return Err(AcqError::InvalidParameters(
                "shape must have at least one axis".into(),
            ));
        }
        if let Some(axis) = dims.iter().position(|&d| d == 0) {
            return Err(AcqError::InvalidParameters(format!(
                "axis {} has size 0",
                axis
            )));
        }
        dims.iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| AcqError::InvalidParameters("shape element count overflows".into()))?;
        Ok(Self(dims))
    }

    /// Axis lengths, outer to inner.
    pub fn dims(&self) -> &[u64] {
        &self.0
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of coordinates (product of the axis sizes).
    pub fn len(&self) -> u64 {
        self.0.iter().product()
    }

    /// Always false: a valid shape has at least one coordinate.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate every coordinate in the given order.
    pub fn coordinates(&self, order: IterationOrder) -> Coordinates<'_> {
        Coordinates {
            shape: self,
            order,
            next: 0,
            len: self.len(),
        }
    }

    /// Radix of axis `j` under `order`: the product of the sizes of every axis that
    /// varies faster than `j`.
    fn radix(&self, j: usize, order: IterationOrder) -> u64 {
        match order {
            IterationOrder::Sequential => self.0[j + 1..].iter().product(),
            IterationOrder::Reverse => self.0[..j].iter().product(),
        }
    }
}

impl TryFrom<Vec<u64>> for Shape {
    type Error = AcqError;

    fn try_from(dims: Vec<u64>) -> AcqResult<Self> {
        Shape::new(dims)
    }
}

impl From<Shape> for Vec<u64> {
    fn from(shape: Shape) -> Self {
        shape.0
    }
}

/// One point of a shape's Cartesian product, outer-to-inner axis order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate(Vec<u64>);

impl Coordinate {
    /// Wrap raw components. No shape check happens here; see [`unmap_coordinate`].
    pub fn new(components: impl Into<Vec<u64>>) -> Self {
        Self(components.into())
    }

    /// Per-axis indices, outer to inner.
    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    /// Index along `axis`, if the axis exists.
    pub fn get(&self, axis: usize) -> Option<u64> {
        self.0.get(axis).copied()
    }

    /// Components followed by [`PLANE_AXES`] zeros, the form sinks address images by.
    pub fn with_plane_axes(&self) -> Vec<u64> {
        let mut full = Vec::with_capacity(self.0.len() + PLANE_AXES);
        full.extend_from_slice(&self.0);
        full.extend(std::iter::repeat(0).take(PLANE_AXES));
        full
    }

    /// True when every axis after `axis` sits at its last index.
    ///
    /// With `axis` = the time axis this marks the final step of a timepoint.
    pub fn inner_axes_exhausted(&self, shape: &Shape, axis: usize) -> bool {
        self.0
            .iter()
            .zip(shape.dims())
            .skip(axis + 1)
            .all(|(&c, &d)| c + 1 == d)
    }

    fn fits(&self, shape: &Shape) -> bool {
        self.0.len() == shape.rank() && self.0.iter().zip(shape.dims()).all(|(&c, &d)| c < d)
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, ")")
    }
}

/// Map a linear index to its coordinate.
///
/// Fails with `OutOfRange` unless `0 <= index < shape.len()`.
pub fn map_index(index: u64, shape: &Shape, order: IterationOrder) -> AcqResult<Coordinate> {
    let len = shape.len();
    if index >= len {
        return Err(AcqError::OutOfRange { index, len });
    }

    let n = shape.rank();
    let mut coord = vec![0u64; n];
    let mut consumed = 0u64;
    let mut decompose = |j: usize| {
        let radix = shape.radix(j, order);
        let c = (index - consumed) / radix;
        coord[j] = c;
        consumed += c * radix;
    };

    match order {
        IterationOrder::Sequential => (0..n).for_each(&mut decompose),
        IterationOrder::Reverse => (0..n).rev().for_each(&mut decompose),
    }

    Ok(Coordinate(coord))
}

/// Map a coordinate back to its linear index under the same order's radix convention.
pub fn unmap_coordinate(coord: &Coordinate, shape: &Shape, order: IterationOrder) -> AcqResult<u64> {
    if !coord.fits(shape) {
        return Err(AcqError::CoordinateOutOfRange {
            coordinate: coord.0.clone(),
            shape: shape.0.clone(),
        });
    }

    Ok(coord
        .0
        .iter()
        .enumerate()
        .map(|(j, &c)| c * shape.radix(j, order))
        .sum())
}

/// Iterator over every coordinate of a shape, see [`Shape::coordinates`].
pub struct Coordinates<'a> {
    shape: &'a Shape,
    order: IterationOrder,
    next: u64,
    len: u64,
}

impl Iterator for Coordinates<'_> {
    type Item = Coordinate;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.len {
            return None;
        }
        let coord = map_index(self.next, self.shape, self.order).ok()?;
        self.next += 1;
        Some(coord)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.len - self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Coordinates<'_> {}
