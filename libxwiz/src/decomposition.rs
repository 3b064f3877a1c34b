//! Conversion between boolean pixel masks and lists of rectangles.
//!
//! [`decompose`] covers the masked pixels of a 2D mask with non-overlapping
//! rectangles by a greedy row scan: each run of masked pixels in a row is
//! extended downwards as long as the rows below are masked over the whole run.
//! [`compose`] is the inverse.
use ndarray::{s, Array2, ArrayView2, ArrayViewD, Ix2};

use super::error::DecompositionError;

/// Rectangular block of pixels; `x` runs along columns (fast scan), `y` along
/// rows (slow scan). The upper bounds are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaskRectangle {
    pub x_min: usize,
    pub x_max: usize,
    pub y_min: usize,
    pub y_max: usize,
}

impl MaskRectangle {
    pub fn new(x_min: usize, x_max: usize, y_min: usize, y_max: usize) -> Self {
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    pub fn width(&self) -> usize {
        self.x_max.saturating_sub(self.x_min)
    }

    pub fn height(&self) -> usize {
        self.y_max.saturating_sub(self.y_min)
    }

    pub fn area(&self) -> usize {
        self.width() * self.height()
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.x_min < other.x_max
            && other.x_min < self.x_max
            && self.y_min < other.y_max
            && other.y_min < self.y_max
    }

    /// Shift by a row and column offset
    pub fn offset(&self, dy: usize, dx: usize) -> Self {
        Self::new(self.x_min + dx, self.x_max + dx, self.y_min + dy, self.y_max + dy)
    }
}

/// Cover the `true` pixels of `mask` with non-overlapping rectangles.
///
/// Rectangles are emitted in row-scan order of their top left corner. The input
/// is not modified.
pub fn decompose(mask: ArrayView2<bool>) -> Vec<MaskRectangle> {
    let mut work = mask.to_owned();
    let (height, width) = work.dim();
    let mut remaining = work.iter().filter(|&&masked| masked).count();
    let mut rectangles = Vec::new();

    let mut row = 0;
    while remaining > 0 {
        assert!(
            row < height,
            "Mask decomposition passed the last row with {remaining} pixels left"
        );
        let mut col = 0;
        while col < width {
            if !work[[row, col]] {
                col += 1;
                continue;
            }
            let x_min = col;
            while col < width && work[[row, col]] {
                col += 1;
            }
            let x_max = col;

            let mut y_max = row + 1;
            while y_max < height && (x_min..x_max).all(|x| work[[y_max, x]]) {
                y_max += 1;
            }

            work.slice_mut(s![row..y_max, x_min..x_max]).fill(false);
            let rectangle = MaskRectangle::new(x_min, x_max, row, y_max);
            remaining -= rectangle.area();
            rectangles.push(rectangle);
        }
        row += 1;
    }
    rectangles
}

/// [`decompose`] for a mask of unchecked dimensionality
pub fn decompose_dyn(mask: ArrayViewD<bool>) -> Result<Vec<MaskRectangle>, DecompositionError> {
    let ndim = mask.ndim();
    let mask = mask
        .into_dimensionality::<Ix2>()
        .map_err(|_| DecompositionError::NotTwoDimensional(ndim))?;
    Ok(decompose(mask))
}

/// Build a `(height, width)` mask which is `true` inside any of the rectangles
pub fn compose(
    rectangles: &[MaskRectangle],
    shape: (usize, usize),
) -> Result<Array2<bool>, DecompositionError> {
    let (height, width) = shape;
    let mut mask = Array2::from_elem(shape, false);
    for rectangle in rectangles {
        if rectangle.x_min > rectangle.x_max
            || rectangle.y_min > rectangle.y_max
            || rectangle.x_max > width
            || rectangle.y_max > height
        {
            return Err(DecompositionError::RectangleOutOfBounds {
                x_min: rectangle.x_min,
                x_max: rectangle.x_max,
                y_min: rectangle.y_min,
                y_max: rectangle.y_max,
                height,
                width,
            });
        }
        mask.slice_mut(s![
            rectangle.y_min..rectangle.y_max,
            rectangle.x_min..rectangle.x_max
        ])
        .fill(true);
    }
    Ok(mask)
}
