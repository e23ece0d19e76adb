use serde::{Deserialize, Serialize};

use crate::value::Value;

/// One tuple on an axis, identified by the unique names of its members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub members: Vec<String>,
}

impl Position {
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSetAxis {
    pub positions: Vec<Position>,
}

impl CellSetAxis {
    pub fn new(positions: Vec<Position>) -> Self {
        Self { positions }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// A cell value plus the driver's own formatted rendering, if it supplied one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub value: Value,
    pub formatted: Option<String>,
}

impl Cell {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            formatted: None,
        }
    }

    /// An empty cell.
    pub fn empty() -> Self {
        Self::new(Value::Null)
    }

    #[must_use]
    pub fn with_formatted(mut self, formatted: impl Into<String>) -> Self {
        self.formatted = Some(formatted.into());
        self
    }
}

/// Result of a multidimensional query.
///
/// `cells` is stored in row-major order with axis 0 varying fastest, so the
/// ordinal of coordinates `[c0, c1, ..]` is `c0 + c1 * len(axis0) + ..`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellSet {
    /// Slicer axis; an unsliced query has one position with no members.
    pub filter_axis: CellSetAxis,
    pub axes: Vec<CellSetAxis>,
    pub cells: Vec<Cell>,
}

impl CellSet {
    /// Number of cells implied by the axis sizes.
    pub fn cell_count(&self) -> usize {
        self.axes.iter().map(CellSetAxis::len).product()
    }

    /// Ordinal of a coordinate vector, or `None` when out of range.
    pub fn ordinal(&self, coords: &[usize]) -> Option<usize> {
        if coords.len() != self.axes.len() {
            return None;
        }
        let mut ordinal = 0;
        let mut stride = 1;
        for (axis, &coord) in self.axes.iter().zip(coords) {
            if coord >= axis.len() {
                return None;
            }
            ordinal += coord * stride;
            stride *= axis.len();
        }
        Some(ordinal)
    }

    /// Cell at `coords`; missing trailing cells read as empty.
    pub fn cell(&self, coords: &[usize]) -> Option<&Cell> {
        self.ordinal(coords).and_then(|o| self.cells.get(o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> CellSet {
        CellSet {
            filter_axis: CellSetAxis::new(vec![Position::default()]),
            axes: vec![
                CellSetAxis::new(vec![
                    Position::new(["[Measures].[Unit Sales]"]),
                    Position::new(["[Measures].[Store Cost]"]),
                ]),
                CellSetAxis::new(vec![
                    Position::new(["[Store].[CA]"]),
                    Position::new(["[Store].[OR]"]),
                    Position::new(["[Store].[WA]"]),
                ]),
            ],
            cells: (0..6_i64).map(Cell::new).collect(),
        }
    }

    #[test]
    fn ordinal_varies_axis_zero_fastest() {
        let cs = grid();
        assert_eq!(cs.cell_count(), 6);
        assert_eq!(cs.ordinal(&[0, 0]), Some(0));
        assert_eq!(cs.ordinal(&[1, 0]), Some(1));
        assert_eq!(cs.ordinal(&[0, 1]), Some(2));
        assert_eq!(cs.ordinal(&[1, 2]), Some(5));
        assert_eq!(cs.cell(&[1, 2]).map(|c| &c.value), Some(&Value::BigInt(5)));
    }

    #[test]
    fn out_of_range_coordinates() {
        let cs = grid();
        assert_eq!(cs.ordinal(&[2, 0]), None);
        assert_eq!(cs.ordinal(&[0]), None);
        assert_eq!(cs.ordinal(&[0, 3]), None);
    }

    #[test]
    fn zero_axes_has_single_cell() {
        let cs = CellSet {
            filter_axis: CellSetAxis::new(vec![Position::default()]),
            axes: Vec::new(),
            cells: vec![Cell::new(266_773_i64)],
        };
        assert_eq!(cs.cell_count(), 1);
        assert_eq!(cs.ordinal(&[]), Some(0));
        assert!(cs.cell(&[]).is_some());
    }
}
