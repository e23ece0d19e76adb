//! Value model shared by drivers and the compliance harness.
//!
//! Drivers hand back [`RowSet`]s for tabular queries and [`CellSet`]s for
//! multidimensional ones; every cell is a [`Value`] whose runtime class
//! ([`ValueKind`]) can be checked against the declared [`SqlType`].

pub mod cellset;
pub mod rowset;
pub mod sql_type;
pub mod value;

pub use cellset::{Cell, CellSet, CellSetAxis, Position};
pub use rowset::{ColumnMeta, RowSet};
pub use sql_type::SqlType;
pub use value::{Value, ValueKind};
