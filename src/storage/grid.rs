//! Write-once result grids.

use crate::error::{AppResult, CharactError};
use num_complex::Complex64;
use serde::ser::{Serialize, SerializeSeq, Serializer};

/// A value type that has a "not measured" marker.
pub trait Cell: Copy + Serialize {
    /// Marker for a cell nobody has written.
    fn missing() -> Self;
}

impl Cell for f64 {
    fn missing() -> Self {
        f64::NAN
    }
}

impl Cell for Complex64 {
    fn missing() -> Self {
        Complex64::new(f64::NAN, f64::NAN)
    }
}

/// Row-major 2-D table whose cells start missing and accept exactly one write.
#[derive(Debug, Clone)]
pub struct Grid<T> {
    name: String,
    rows: usize,
    cols: usize,
    data: Vec<T>,
    written: Vec<bool>,
}

impl<T: Cell> Grid<T> {
    /// `rows x cols` grid of missing cells; `name` appears in errors.
    pub fn new(name: impl Into<String>, rows: usize, cols: usize) -> Self {
        Self {
            name: name.into(),
            rows,
            cols,
            data: vec![T::missing(); rows * cols],
            written: vec![false; rows * cols],
        }
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    fn offset(&self, row: usize, col: usize) -> AppResult<usize> {
        if row >= self.rows {
            return Err(CharactError::IndexOutOfRange {
                what: format!("{} row", self.name),
                index: row,
                len: self.rows,
            });
        }
        if col >= self.cols {
            return Err(CharactError::IndexOutOfRange {
                what: format!("{} column", self.name),
                index: col,
                len: self.cols,
            });
        }
        Ok(row * self.cols + col)
    }

    fn check_free(&self, row: usize, col: usize, offset: usize) -> AppResult<()> {
        if self.written[offset] {
            return Err(CharactError::CellAlreadyWritten {
                table: self.name.clone(),
                row,
                col,
            });
        }
        Ok(())
    }

    /// Value of a cell.
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        self.offset(row, col).ok().map(|o| self.data[o])
    }

    /// One row as a slice.
    pub fn row(&self, row: usize) -> Option<&[T]> {
        (row < self.rows).then(|| &self.data[row * self.cols..(row + 1) * self.cols])
    }

    /// Write one cell.
    pub fn set(&mut self, row: usize, col: usize, value: T) -> AppResult<()> {
        let o = self.offset(row, col)?;
        self.check_free(row, col, o)?;
        self.data[o] = value;
        self.written[o] = true;
        Ok(())
    }

    /// Write a whole row; nothing is written if any of its cells is taken.
    pub fn set_row(&mut self, row: usize, values: &[T]) -> AppResult<()> {
        if values.len() != self.cols {
            return Err(CharactError::ShapeMismatch {
                what: format!("{} row", self.name),
                expected: self.cols,
                actual: values.len(),
            });
        }
        let start = self.offset(row, 0)?;
        for col in 0..self.cols {
            self.check_free(row, col, start + col)?;
        }
        self.data[start..start + self.cols].copy_from_slice(values);
        self.written[start..start + self.cols].fill(true);
        Ok(())
    }

    /// Cells not written yet.
    pub fn unwritten(&self) -> usize {
        self.written.iter().filter(|w| !**w).count()
    }
}

impl<T: Cell> Serialize for Grid<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.rows))?;
        for r in 0..self.rows {
            seq.serialize_element(&self.data[r * self.cols..(r + 1) * self.cols])?;
        }
        seq.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_start_missing() {
        let g: Grid<f64> = Grid::new("Ids", 2, 3);
        assert_eq!(g.unwritten(), 6);
        assert!(g.get(1, 2).unwrap().is_nan());
        assert!(g.get(2, 0).is_none());
    }

    #[test]
    fn second_write_is_rejected() {
        let mut g: Grid<f64> = Grid::new("Ids", 2, 2);
        g.set(0, 1, 1.5).unwrap();
        let e = g.set(0, 1, 2.5).unwrap_err();
        assert!(matches!(e, CharactError::CellAlreadyWritten { row: 0, col: 1, .. }));
        assert_eq!(g.get(0, 1), Some(1.5));
    }

    #[test]
    fn partial_overlap_keeps_row_untouched() {
        let mut g: Grid<f64> = Grid::new("PSD", 2, 3);
        g.set(1, 2, 9.0).unwrap();
        assert!(g.set_row(1, &[1.0, 2.0, 3.0]).is_err());
        assert!(g.get(1, 0).unwrap().is_nan());
        g.set_row(0, &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(g.row(0).unwrap(), &[1.0, 2.0, 3.0]);
        assert!(g.set_row(0, &[1.0]).is_err());
    }

    #[test]
    fn serializes_rows_with_null_for_missing() {
        let mut g: Grid<Complex64> = Grid::new("gm", 1, 2);
        g.set(0, 0, Complex64::new(1.0, -2.0)).unwrap();
        let json = serde_json::to_string(&g).unwrap();
        assert_eq!(json, "[[[1.0,-2.0],[null,null]]]");
    }
}
