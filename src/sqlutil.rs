//! # Bulk Statement Utilities
//!
//! Postgres caps the number of bind parameters in a single statement at
//! 65,535. Most queries in this crate stay far below that by binding arrays
//! (`= ANY($1)` counts as one parameter regardless of array length), but the
//! bulk `UNNEST` insert on the event table materializes one array element per
//! row and column, so very large upstream chunks are split into bounded
//! batches here.

use std::ops::Range;

use crate::error::{Error, Result};

/// Max number of parameters in a single SQL statement.
pub const MAX_POSTGRES_PARAMETERS: usize = 65_535;

/// Splits `total_rows` rows into contiguous index ranges such that each
/// range's rows consume at most `max_params` parameters, at
/// `params_per_row` parameters per row.
///
/// Returns a single full range when everything fits in one statement, which
/// is the common case.
///
/// # Errors
///
/// `BadQuery` if `params_per_row` is zero or exceeds `max_params`; both
/// indicate a malformed bulk query at the call site.
pub fn chunkify(
    params_per_row: usize,
    max_params: usize,
    total_rows: usize,
) -> Result<Vec<Range<usize>>> {
    if params_per_row == 0 {
        return Err(Error::BadQuery("params_per_row must be non-zero".to_string()));
    }
    if params_per_row > max_params {
        return Err(Error::BadQuery(format!(
            "a single row takes {params_per_row} parameters, over the {max_params} statement cap"
        )));
    }
    let rows_per_chunk = max_params / params_per_row;
    if total_rows == 0 {
        return Ok(Vec::new());
    }
    let mut chunks = Vec::with_capacity(total_rows.div_ceil(rows_per_chunk));
    let mut start = 0;
    while start < total_rows {
        let end = (start + rows_per_chunk).min(total_rows);
        chunks.push(start..end);
        start = end;
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunkify_fits_in_one() {
        let chunks = chunkify(8, MAX_POSTGRES_PARAMETERS, 100).unwrap();
        assert_eq!(chunks, vec![0..100]);
    }

    #[test]
    fn test_chunkify_empty() {
        assert!(chunkify(8, MAX_POSTGRES_PARAMETERS, 0).unwrap().is_empty());
    }

    #[test]
    fn test_chunkify_splits_on_boundary() {
        // 3 params per row, 9 params max -> 3 rows per chunk
        let chunks = chunkify(3, 9, 7).unwrap();
        assert_eq!(chunks, vec![0..3, 3..6, 6..7]);
    }

    #[test]
    fn test_chunkify_exact_multiple() {
        let chunks = chunkify(2, 4, 4).unwrap();
        assert_eq!(chunks, vec![0..2, 2..4]);
    }

    #[test]
    fn test_chunkify_zero_params_per_row() {
        let err = chunkify(0, 9, 1).unwrap_err();
        assert!(matches!(err, Error::BadQuery(_)));
    }

    #[test]
    fn test_chunkify_row_too_wide() {
        let err = chunkify(10, 9, 1).unwrap_err();
        assert!(matches!(err, Error::BadQuery(_)));
        assert!(err.to_string().contains("statement cap"));
    }
}
