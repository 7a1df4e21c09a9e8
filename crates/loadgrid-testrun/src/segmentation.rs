//! Execution segment calculation
//!
//! Runner `i` of `n` owns the fractional range `(i-1)/n : i/n` of the total
//! load. Every runner computes its own boundaries independently, so the
//! output depends on nothing but `(i, n)`. Fractions are written in lowest
//! terms, with the outer boundaries spelled `0` and `1`.

/// Errors from segment calculation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentError {
    /// Index outside `1..=total`
    #[error("node index {index} exceeds configured parallelism {total}")]
    IndexOutOfRange {
        /// Requested runner index
        index: u32,
        /// Configured parallelism
        total: u32,
    },
}

/// Boundary `k` of `total`, in lowest terms
fn boundary(k: u32, total: u32) -> String {
    if k == 0 {
        return "0".to_string();
    }
    if k == total {
        return "1".to_string();
    }
    let g = gcd(k, total);
    format!("{}/{}", k / g, total / g)
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Segment owned by runner `index` of `total`, as `lower:upper`.
///
/// Runner indices start at 1.
pub fn execution_segment(index: u32, total: u32) -> Result<String, SegmentError> {
    if index == 0 || index > total {
        return Err(SegmentError::IndexOutOfRange { index, total });
    }
    Ok(format!(
        "{}:{}",
        boundary(index - 1, total),
        boundary(index, total)
    ))
}

/// Runner command line flag selecting the segment for `index` of `total`
pub fn segment_flag(index: u32, total: u32) -> Result<String, SegmentError> {
    execution_segment(index, total).map(|segment| format!("--execution-segment={}", segment))
}

/// Full ordered boundary list shared by all runners, `None` when a single
/// runner owns the whole range.
pub fn segment_sequence(total: u32) -> Option<String> {
    if total <= 1 {
        return None;
    }
    let sequence = (0..=total)
        .map(|k| boundary(k, total))
        .collect::<Vec<_>>()
        .join(",");
    Some(sequence)
}
