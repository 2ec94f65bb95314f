//! Shapes, strides, and the layout arithmetic over them

use crate::datatypes::Datatype;
use smallvec::SmallVec;

/// Tensor shape; most shapes have at most four dimensions
pub type Shape = SmallVec<[usize; 4]>;

/// Element strides; same cardinality as the shape they describe
pub type Strides = SmallVec<[usize; 4]>;

/// Number of elements described by a shape (1 for scalars)
pub fn num_elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major strides for a shape
pub fn default_strides(shape: &[usize]) -> Strides {
    let mut strides = Strides::from_elem(0, shape.len());
    let mut acc = 1;
    for i in (0..shape.len()).rev() {
        strides[i] = acc;
        acc *= shape[i];
    }
    strides
}

/// Whether strides are exactly the row-major strides of the shape
pub fn is_contiguous(shape: &[usize], strides: &[usize]) -> bool {
    debug_assert_eq!(shape.len(), strides.len());
    let mut acc = 1;
    for i in (0..shape.len()).rev() {
        if strides[i] != acc {
            return false;
        }
        acc *= shape[i];
    }
    true
}

/// Number of elements a strided view can address.
///
/// Size-1 dimensions contribute no span regardless of their stride. An empty
/// shape (scalar) addresses one element; any zero-sized dimension addresses
/// none.
pub fn max_addressable(shape: &[usize], strides: &[usize]) -> usize {
    debug_assert_eq!(shape.len(), strides.len());
    if shape.iter().any(|&d| d == 0) {
        return 0;
    }
    let mut last = 0;
    for (&dim, &stride) in shape.iter().zip(strides) {
        if dim > 1 {
            last += (dim - 1) * stride;
        }
    }
    last + 1
}

/// Bytes needed for a contiguous tensor of the given datatype and shape
pub fn bytes_of(dt: Datatype, shape: &[usize]) -> usize {
    num_elements(shape) * dt.size_bytes()
}

/// Bytes needed to back a strided view of the given datatype and shape
pub fn bytes_of_strided(dt: Datatype, shape: &[usize], strides: &[usize]) -> usize {
    max_addressable(shape, strides) * dt.size_bytes()
}
