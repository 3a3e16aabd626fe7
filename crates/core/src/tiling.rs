use std::ops::Range;

use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4, Axis};

use crate::error::{PipelineError, Result};

pub const QUADRANT_ROWS: usize = 2;
pub const QUADRANT_COLS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRegion {
    pub index: usize,
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl TileRegion {
    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.cols.len()
    }
}

/// Fixed grid of sub-regions, ordered row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLayout {
    height: usize,
    width: usize,
    grid_rows: usize,
    grid_cols: usize,
    regions: Vec<TileRegion>,
}

impl TileLayout {
    /// Partition a `height x width` plane into `grid_rows x grid_cols`
    /// equally sized, non-overlapping regions.
    pub fn grid(height: usize, width: usize, grid_rows: usize, grid_cols: usize) -> Result<Self> {
        if grid_rows == 0 || grid_cols == 0 {
            return Err(PipelineError::Shape(format!(
                "tile grid must be non-empty, got {grid_rows}x{grid_cols}"
            )));
        }
        if height == 0 || width == 0 || height % grid_rows != 0 || width % grid_cols != 0 {
            return Err(PipelineError::Shape(format!(
                "{height}x{width} cannot be split evenly into a {grid_rows}x{grid_cols} tile grid"
            )));
        }

        let tile_h = height / grid_rows;
        let tile_w = width / grid_cols;
        let regions = (0..grid_rows)
            .flat_map(|r| (0..grid_cols).map(move |c| (r, c)))
            .enumerate()
            .map(|(index, (r, c))| TileRegion {
                index,
                rows: r * tile_h..(r + 1) * tile_h,
                cols: c * tile_w..(c + 1) * tile_w,
            })
            .collect();

        Ok(Self {
            height,
            width,
            grid_rows,
            grid_cols,
            regions,
        })
    }

    pub fn quadrants(height: usize, width: usize) -> Result<Self> {
        Self::grid(height, width, QUADRANT_ROWS, QUADRANT_COLS)
    }

    pub fn regions(&self) -> &[TileRegion] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn tile_shape(&self) -> (usize, usize) {
        (self.height / self.grid_rows, self.width / self.grid_cols)
    }

    /// Split an HWC frame into an NHWC tile batch, tile index on axis 0.
    pub fn split<T: Clone + Default>(&self, frame: ArrayView3<'_, T>) -> Result<Array4<T>> {
        let (h, w, channels) = frame.dim();
        if (h, w) != (self.height, self.width) {
            return Err(PipelineError::Shape(format!(
                "frame is {h}x{w}, tile layout expects {}x{}",
                self.height, self.width
            )));
        }

        let (tile_h, tile_w) = self.tile_shape();
        let mut batch = Array4::from_elem((self.len(), tile_h, tile_w, channels), T::default());
        for region in &self.regions {
            let tile = frame.slice(s![region.rows.clone(), region.cols.clone(), ..]);
            batch.index_axis_mut(Axis(0), region.index).assign(&tile);
        }
        Ok(batch)
    }

    /// Inverse of [`TileLayout::split`].
    pub fn assemble<T: Clone + Default>(&self, tiles: ArrayView4<'_, T>) -> Result<Array3<T>> {
        let (n, tile_h, tile_w, channels) = tiles.dim();
        self.check_tile_batch(n, tile_h, tile_w)?;

        let mut frame = Array3::from_elem((self.height, self.width, channels), T::default());
        for region in &self.regions {
            frame
                .slice_mut(s![region.rows.clone(), region.cols.clone(), ..])
                .assign(&tiles.index_axis(Axis(0), region.index));
        }
        Ok(frame)
    }

    fn check_tile_batch(&self, n: usize, tile_h: usize, tile_w: usize) -> Result<()> {
        if n != self.len() || (tile_h, tile_w) != self.tile_shape() {
            let (expected_h, expected_w) = self.tile_shape();
            return Err(PipelineError::Shape(format!(
                "tile batch is {n}x{tile_h}x{tile_w}, layout expects {}x{expected_h}x{expected_w}",
                self.len()
            )));
        }
        Ok(())
    }
}
