//! Vgs index expressions selecting which sweep points get AC measurements.
//!
//! Grammar: comma separated items, each either an index `i` or a range
//! `start:stop[:step]` with half-open `range` semantics. The resulting set is
//! sorted, deduplicated and clipped to `0 <= i < n`.

use crate::error::{AppResult, CharactError};
use tracing::warn;

/// Expression selecting every fourth Vgs point, used when none is configured.
pub fn default_expression(n_vgs: usize) -> String {
    format!("0:{n_vgs}:4")
}

/// Parse `expr` into sorted unique indices below `n`.
pub fn parse_indices(expr: &str, n: usize) -> AppResult<Vec<usize>> {
    let invalid = |reason: String| CharactError::InvalidSelection {
        expr: expr.to_string(),
        reason,
    };

    let mut out: Vec<i64> = Vec::new();
    for part in expr.split(',') {
        let fields: Vec<&str> = part.split(':').map(str::trim).collect();
        let nums = fields
            .iter()
            .map(|f| f.parse::<i64>().map_err(|_| invalid(format!("'{f}' is not an integer"))))
            .collect::<AppResult<Vec<i64>>>()?;
        match nums.as_slice() {
            [i] => out.push(*i),
            [start, stop] => out.extend(*start..*stop),
            [start, stop, step] => {
                if *step == 0 {
                    return Err(invalid("range step must not be zero".into()));
                }
                let mut i = *start;
                while (*step > 0 && i < *stop) || (*step < 0 && i > *stop) {
                    out.push(i);
                    i += step;
                }
            }
            _ => return Err(invalid(format!("'{part}' has too many ':' fields"))),
        }
    }

    out.sort_unstable();
    out.dedup();
    Ok(out
        .into_iter()
        .filter(|&i| i >= 0 && (i as usize) < n)
        .map(|i| i as usize)
        .collect())
}

/// Current AC selection; a malformed update keeps the previous valid one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcSelection {
    expr: String,
    indices: Vec<usize>,
    n_vgs: usize,
}

impl AcSelection {
    /// Selection for `n_vgs` points from `expr`, or the default expression.
    pub fn new(expr: Option<&str>, n_vgs: usize) -> AppResult<Self> {
        let expr = expr
            .map(str::to_string)
            .unwrap_or_else(|| default_expression(n_vgs));
        let indices = parse_indices(&expr, n_vgs)?;
        Ok(Self {
            expr,
            indices,
            n_vgs,
        })
    }

    /// Try a new expression. Returns `false` and keeps the old selection if it does not parse.
    pub fn update(&mut self, expr: &str) -> bool {
        match parse_indices(expr, self.n_vgs) {
            Ok(indices) => {
                self.expr = expr.to_string();
                self.indices = indices;
                true
            }
            Err(e) => {
                warn!(error = %e, kept = %self.expr, "Invalid AC selection, keeping previous");
                false
            }
        }
    }

    /// Selected Vgs indices, ascending.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Expression the selection was built from.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Position of `i_vg` inside the selection.
    pub fn position(&self, i_vg: usize) -> Option<usize> {
        self.indices.binary_search(&i_vg).ok()
    }
}
