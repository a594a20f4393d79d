//! Dimension estimation and rectangle tolerance math (spec.md §4.2.1).

use crate::error::{AllocatorError, Result};
use crate::types::JobId;

/// Result of estimating a `(width, height)` footprint for a `numBoards`
/// request, clamped to a machine's extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DimensionEstimate {
    pub width: i32,
    pub height: i32,
    pub tolerance: i32,
}

fn ceil_div(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

fn isqrt_ceil(n: i64) -> i64 {
    if n <= 0 {
        return 0;
    }
    let mut lo = 0i64;
    let mut hi = n;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if mid * mid >= n {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}

/// Estimate a rectangle of triads for `num_boards`, clamped to
/// `(max_w, max_h)`. Fails `BadRequest` if the clamped rectangle can't fit
/// `num_boards` at all, or if either dimension collapses to zero.
pub fn estimate_dimensions(
    job_id: JobId,
    num_boards: i32,
    max_w: i32,
    max_h: i32,
) -> Result<DimensionEstimate> {
    let num_triads = ceil_div(num_boards as i64, 3);
    let width = (isqrt_ceil(num_triads) as i32).min(max_w);
    let height = (ceil_div(num_triads, width.max(1) as i64) as i32).min(max_h);
    let tolerance = width as i64 * height as i64 * 3 - num_boards as i64;

    if width < 1 || height < 1 || tolerance < 0 {
        return Err(AllocatorError::BadRequest {
            job_id,
            reason: format!(
                "cannot fit {num_boards} boards on a {max_w}x{max_h} machine \
                 (estimated {width}x{height}, tolerance {tolerance})"
            ),
        });
    }

    Ok(DimensionEstimate {
        width,
        height,
        tolerance: tolerance as i32,
    })
}

/// Tolerance for an explicit `(w, h)` request, after clamping to the
/// machine. Fails `BadRequest` if negative.
pub fn explicit_tolerance(
    job_id: JobId,
    width: i32,
    height: i32,
    max_w: i32,
    max_h: i32,
) -> Result<i32> {
    let clamped_w = width.min(max_w);
    let clamped_h = height.min(max_h);
    let tolerance = clamped_w as i64 * clamped_h as i64 * 3 - width as i64 * height as i64 * 3;

    if tolerance < 0 {
        return Err(AllocatorError::BadRequest {
            job_id,
            reason: format!(
                "{width}x{height} does not fit on a {max_w}x{max_h} machine"
            ),
        });
    }

    Ok(tolerance as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_triad_for_small_request() {
        let est = estimate_dimensions(1, 2, 10, 10).unwrap();
        assert_eq!(est.width, 1);
        assert_eq!(est.height, 1);
        assert_eq!(est.tolerance, 1);
    }

    #[test]
    fn exact_fit_has_zero_tolerance() {
        let est = estimate_dimensions(1, 3, 10, 10).unwrap();
        assert_eq!(est.width, 1);
        assert_eq!(est.height, 1);
        assert_eq!(est.tolerance, 0);
    }

    #[test]
    fn clamps_to_machine_extent() {
        // 100 boards -> 34 triads -> sqrt ceil 6x6, clamped to a 2x2 machine.
        let err = estimate_dimensions(1, 100, 2, 2).unwrap_err();
        assert!(matches!(err, AllocatorError::BadRequest { .. }));
    }

    #[test]
    fn explicit_rectangle_negative_tolerance_is_bad_request() {
        let err = explicit_tolerance(1, 4, 4, 2, 2).unwrap_err();
        assert!(matches!(err, AllocatorError::BadRequest { .. }));
    }

    #[test]
    fn explicit_rectangle_within_machine_ok() {
        let tolerance = explicit_tolerance(1, 2, 2, 4, 4).unwrap();
        assert_eq!(tolerance, 0);
    }
}
