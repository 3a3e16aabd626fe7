//! Pure-Rust bilinear resampling for f32 tensors.
//!
//! Resizing uses the half-pixel-center convention: destination pixel `d`
//! maps to source coordinate `(d + 0.5) * in / out - 0.5`. Resizing never
//! reads outside the source plane; coordinates past an edge repeat the edge
//! sample. Point sampling for warps takes an explicit [`BoundaryPolicy`].

use std::fmt;

use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, ArrayViewMut2, Axis};
use serde::{Deserialize, Serialize};

/// How a bilinear tap that falls outside the source plane is resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryPolicy {
    /// Out-of-range taps read the nearest edge sample.
    #[default]
    Clamp,
    /// Out-of-range taps read 0.0.
    Zero,
}

impl BoundaryPolicy {
    /// Parse from string (case-insensitive). Returns `Clamp` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "zero" | "zeros" | "zero-fill" | "constant" => Self::Zero,
            _ => Self::Clamp,
        }
    }
}

impl fmt::Display for BoundaryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clamp => write!(f, "clamp"),
            Self::Zero => write!(f, "zero"),
        }
    }
}

/// Bilinear sample of `plane` at fractional pixel-index coordinates `(y, x)`.
pub fn sample_bilinear(plane: ArrayView2<'_, f32>, y: f32, x: f32, policy: BoundaryPolicy) -> f32 {
    let (h, w) = plane.dim();
    if h == 0 || w == 0 {
        return 0.0;
    }

    let y_floor = y.floor();
    let x_floor = x.floor();
    let fy = y - y_floor;
    let fx = x - x_floor;
    let y0 = y_floor as isize;
    let x0 = x_floor as isize;
    let y1 = y0.saturating_add(1);
    let x1 = x0.saturating_add(1);

    let fetch = |yy: isize, xx: isize| -> f32 {
        match policy {
            BoundaryPolicy::Clamp => {
                let yy = yy.clamp(0, h as isize - 1) as usize;
                let xx = xx.clamp(0, w as isize - 1) as usize;
                plane[[yy, xx]]
            }
            BoundaryPolicy::Zero => {
                if yy < 0 || xx < 0 || yy >= h as isize || xx >= w as isize {
                    0.0
                } else {
                    plane[[yy as usize, xx as usize]]
                }
            }
        }
    };

    let top = lerp(fetch(y0, x0), fetch(y0, x1), fx);
    let bot = lerp(fetch(y1, x0), fetch(y1, x1), fx);
    lerp(top, bot, fy)
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    if t == 0.0 {
        a
    } else {
        a * (1.0 - t) + b * t
    }
}

/// Precomputed source taps along one axis of a resize.
struct AxisTaps {
    lo: Vec<usize>,
    hi: Vec<usize>,
    frac: Vec<f32>,
}

impl AxisTaps {
    fn new(src: usize, dst: usize) -> Self {
        let scale = src as f64 / dst as f64;
        let mut lo = Vec::with_capacity(dst);
        let mut hi = Vec::with_capacity(dst);
        let mut frac = Vec::with_capacity(dst);
        for d in 0..dst {
            let s = (d as f64 + 0.5) * scale - 0.5;
            let s0 = s.floor().max(0.0) as usize;
            let s0 = s0.min(src - 1);
            lo.push(s0);
            hi.push((s0 + 1).min(src - 1));
            frac.push((s - s0 as f64).clamp(0.0, 1.0) as f32);
        }
        Self { lo, hi, frac }
    }
}

fn resize_plane_into(
    src: ArrayView2<'_, f32>,
    mut dst: ArrayViewMut2<'_, f32>,
    rows: &AxisTaps,
    cols: &AxisTaps,
) {
    let (dst_h, dst_w) = dst.dim();
    for y in 0..dst_h {
        let (y0, y1, fy) = (rows.lo[y], rows.hi[y], rows.frac[y]);
        for x in 0..dst_w {
            let (x0, x1, fx) = (cols.lo[x], cols.hi[x], cols.frac[x]);
            let top = lerp(src[[y0, x0]], src[[y0, x1]], fx);
            let bot = lerp(src[[y1, x0]], src[[y1, x1]], fx);
            dst[[y, x]] = lerp(top, bot, fy);
        }
    }
}

/// Bilinear resize of a single plane.
pub fn resize_plane(src: ArrayView2<'_, f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (h, w) = src.dim();
    let mut dst = Array2::zeros((out_h, out_w));
    if h == 0 || w == 0 {
        return dst;
    }
    let rows = AxisTaps::new(h, out_h);
    let cols = AxisTaps::new(w, out_w);
    resize_plane_into(src, dst.view_mut(), &rows, &cols);
    dst
}

/// Bilinear resize of every `[n, c]` plane of an NCHW batch.
pub fn resize_nchw(src: ArrayView4<'_, f32>, out_h: usize, out_w: usize) -> Array4<f32> {
    let (n, c, h, w) = src.dim();
    if (h, w) == (out_h, out_w) {
        return src.to_owned();
    }
    let mut dst = Array4::zeros((n, c, out_h, out_w));
    if h == 0 || w == 0 {
        return dst;
    }
    let rows = AxisTaps::new(h, out_h);
    let cols = AxisTaps::new(w, out_w);
    for (src_item, mut dst_item) in src.outer_iter().zip(dst.outer_iter_mut()) {
        for (src_plane, dst_plane) in src_item.outer_iter().zip(dst_item.outer_iter_mut()) {
            resize_plane_into(src_plane, dst_plane, &rows, &cols);
        }
    }
    dst
}

/// Bilinear resize of an HWC image.
pub fn resize_hwc(src: ArrayView3<'_, f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (h, w, c) = src.dim();
    if (h, w) == (out_h, out_w) {
        return src.to_owned();
    }
    let mut dst = Array3::zeros((out_h, out_w, c));
    if h == 0 || w == 0 {
        return dst;
    }
    let rows = AxisTaps::new(h, out_h);
    let cols = AxisTaps::new(w, out_w);
    for ch in 0..c {
        resize_plane_into(
            src.index_axis(Axis(2), ch),
            dst.index_axis_mut(Axis(2), ch),
            &rows,
            &cols,
        );
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn boundary_policy_from_str() {
        let parse = BoundaryPolicy::from_str_lossy;
        assert_eq!(parse("zero"), BoundaryPolicy::Zero);
        assert_eq!(parse("ZERO-FILL"), BoundaryPolicy::Zero);
        assert_eq!(parse("clamp"), BoundaryPolicy::Clamp);
        assert_eq!(parse("wrap"), BoundaryPolicy::Clamp);
        assert_eq!(BoundaryPolicy::Zero.to_string(), "zero");
    }

    #[test]
    fn sample_at_integer_coordinates_is_exact() {
        let plane = array![[1.0f32, 2.0], [3.0, 4.0]];
        for policy in [BoundaryPolicy::Clamp, BoundaryPolicy::Zero] {
            assert_eq!(sample_bilinear(plane.view(), 0.0, 0.0, policy), 1.0);
            assert_eq!(sample_bilinear(plane.view(), 0.0, 1.0, policy), 2.0);
            assert_eq!(sample_bilinear(plane.view(), 1.0, 0.0, policy), 3.0);
            assert_eq!(sample_bilinear(plane.view(), 1.0, 1.0, policy), 4.0);
        }
    }

    #[test]
    fn sample_interpolates_between_taps() {
        let plane = array![[0.0f32, 10.0], [20.0, 30.0]];
        let v = sample_bilinear(plane.view(), 0.5, 0.5, BoundaryPolicy::Clamp);
        assert!((v - 15.0).abs() < 1e-6);
        let v = sample_bilinear(plane.view(), 0.0, 0.25, BoundaryPolicy::Clamp);
        assert!((v - 2.5).abs() < 1e-6);
    }

    #[test]
    fn out_of_bounds_follows_policy() {
        let plane = array![[5.0f32, 5.0], [5.0, 5.0]];
        let above = sample_bilinear(plane.view(), -3.0, 0.0, BoundaryPolicy::Clamp);
        assert_eq!(above, 5.0);
        let above = sample_bilinear(plane.view(), -3.0, 0.0, BoundaryPolicy::Zero);
        assert_eq!(above, 0.0);
        let right = sample_bilinear(plane.view(), 0.0, 9.0, BoundaryPolicy::Zero);
        assert_eq!(right, 0.0);

        // Half a pixel past the right edge: one tap inside, one outside.
        let v = sample_bilinear(plane.view(), 0.0, 1.5, BoundaryPolicy::Zero);
        assert!((v - 2.5).abs() < 1e-6);
        let v = sample_bilinear(plane.view(), 0.0, 1.5, BoundaryPolicy::Clamp);
        assert!((v - 5.0).abs() < 1e-6);
    }

    #[test]
    fn resize_identity_is_exact() {
        let src = Array4::from_shape_fn((2, 3, 4, 5), |(n, c, y, x)| {
            (n * 100 + c * 10 + y * 5 + x) as f32
        });
        let out = resize_nchw(src.view(), 4, 5);
        assert_eq!(out, src);
    }

    #[test]
    fn resize_constant_stays_constant() {
        let src = Array2::from_elem((3, 5), 7.5f32);
        let out = resize_plane(src.view(), 8, 11);
        assert!(out.iter().all(|&v| (v - 7.5).abs() < 1e-6));
    }

    #[test]
    fn upscale_2x_uses_half_pixel_centers() {
        let src = array![[0.0f32, 4.0]];
        let out = resize_plane(src.view(), 1, 4);
        // Destination centers map to -0.25, 0.25, 0.75, 1.25.
        let expected = [0.0f32, 1.0, 3.0, 4.0];
        for (got, want) in out.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
        }
    }

    #[test]
    fn downscale_2x_averages_pairs() {
        let src = array![[0.0f32, 2.0, 4.0, 6.0]];
        let out = resize_plane(src.view(), 1, 2);
        assert!((out[[0, 0]] - 1.0).abs() < 1e-6);
        assert!((out[[0, 1]] - 5.0).abs() < 1e-6);
    }

    #[test]
    fn resize_hwc_keeps_channels_independent() {
        let src = Array3::from_shape_fn((2, 2, 3), |(_, _, c)| c as f32);
        let out = resize_hwc(src.view(), 4, 6);
        assert_eq!(out.dim(), (4, 6, 3));
        for ((_, _, c), v) in out.indexed_iter() {
            assert!((v - c as f32).abs() < 1e-6);
        }
    }
}
