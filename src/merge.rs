//! Reconciliation of the training, archive and real-time series.

use crate::table::TimeSeriesTable;

/// Merges `newer` tables over `base`, later inputs taking priority.
///
/// - Rows are keyed by hour; the result is sorted by timestamp.
/// - For a timestamp present in several inputs, each observed cell from the
///   most recently supplied input wins. A missing cell in a newer row does
///   not erase an older observation.
/// - Columns are the union of all inputs, in first-seen order.
/// - Empty newer tables leave the base unchanged, and merging a table with
///   itself returns the same table.
pub fn merge_tables<'a, I>(base: &TimeSeriesTable, newer: I) -> TimeSeriesTable
where
    I: IntoIterator<Item = &'a TimeSeriesTable>,
{
    let mut merged = base.clone();

    for table in newer {
        if table.is_empty() {
            continue;
        }
        for name in table.columns() {
            merged.ensure_column(name);
        }

        for (ts, row) in table.iter() {
            // Unseen hours are registered even when empty so gaps stay visible.
            let known = merged.row(ts).is_some();
            for (name, value) in table.columns().iter().zip(row) {
                if value.is_some() || !known {
                    merged.set(ts, name, *value);
                }
            }
        }
    }

    merged
}
