//! Materialized result sets.

use crate::{DatabaseError, DatabaseValue, Row};

/// A fully materialized query result.
///
/// The cursor owns its rows for its lifetime; nothing is re-fetched.
/// Iteration comes in two modes that share one position: the
/// [`Iterator`] impl (and [`Iterator::next`]) yields associative
/// [`Row`]s, while [`SqlitCursor::next_raw`] yields positional value
/// sequences.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlitCursor {
    columns: Vec<String>,
    rows: Vec<Vec<DatabaseValue>>,
    position: usize,
}

impl SqlitCursor {
    #[must_use]
    pub const fn new(columns: Vec<String>, rows: Vec<Vec<DatabaseValue>>) -> Self {
        Self {
            columns,
            rows,
            position: 0,
        }
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// The next row as a positional value sequence, advancing the
    /// shared iteration position.
    pub fn next_raw(&mut self) -> Option<Vec<DatabaseValue>> {
        let row = self.rows.get(self.position)?.clone();
        self.position += 1;
        Some(row)
    }

    /// Every row in associative form, independent of the iteration
    /// position.
    #[must_use]
    pub fn to_array(&self) -> Vec<Row> {
        (0..self.rows.len()).map(|i| self.assoc_row(i)).collect()
    }

    /// The single row of a result expected to have exactly one.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::ExpectedOneRow`] if the result holds zero or
    ///   more than one row
    pub fn one(&self) -> Result<Row, DatabaseError> {
        if self.rows.len() == 1 {
            Ok(self.assoc_row(0))
        } else {
            Err(DatabaseError::ExpectedOneRow(self.rows.len()))
        }
    }

    fn assoc_row(&self, index: usize) -> Row {
        Row {
            columns: self
                .columns
                .iter()
                .cloned()
                .zip(self.rows[index].iter().cloned())
                .collect(),
        }
    }
}

impl Iterator for SqlitCursor {
    type Item = Row;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.rows.len() {
            return None;
        }
        let row = self.assoc_row(self.position);
        self.position += 1;
        Some(row)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn cursor() -> SqlitCursor {
        SqlitCursor::new(
            vec!["id".to_string(), "name".to_string()],
            vec![
                vec![DatabaseValue::Int64(1), DatabaseValue::String("a".to_string())],
                vec![DatabaseValue::Int64(2), DatabaseValue::String("b".to_string())],
            ],
        )
    }

    #[test]
    fn associative_iteration() {
        let mut cursor = cursor();
        assert_eq!(cursor.row_count(), 2);
        assert_eq!(cursor.column_names(), ["id", "name"]);

        let first = cursor.next().unwrap();
        assert_eq!(first.get("id"), Some(DatabaseValue::Int64(1)));
        assert_eq!(
            first.get("name"),
            Some(DatabaseValue::String("a".to_string()))
        );

        let second = cursor.next().unwrap();
        assert_eq!(second.get("id"), Some(DatabaseValue::Int64(2)));
        assert!(cursor.next().is_none());
    }

    #[test]
    fn raw_iteration() {
        let mut cursor = cursor();
        assert_eq!(
            cursor.next_raw().unwrap(),
            vec![DatabaseValue::Int64(1), DatabaseValue::String("a".to_string())]
        );
        assert_eq!(
            cursor.next_raw().unwrap(),
            vec![DatabaseValue::Int64(2), DatabaseValue::String("b".to_string())]
        );
        assert!(cursor.next_raw().is_none());
    }

    #[test]
    fn the_two_modes_share_one_position() {
        let mut cursor = cursor();
        cursor.next().unwrap();
        let second = cursor.next_raw().unwrap();
        assert_eq!(second[0], DatabaseValue::Int64(2));
        assert!(cursor.next().is_none());
    }

    #[test]
    fn to_array_ignores_the_position() {
        let mut cursor = cursor();
        cursor.next().unwrap();
        assert_eq!(cursor.to_array().len(), 2);
    }

    #[test]
    fn one_requires_exactly_one_row() {
        assert!(matches!(
            cursor().one(),
            Err(DatabaseError::ExpectedOneRow(2))
        ));

        let empty = SqlitCursor::new(vec!["id".to_string()], Vec::new());
        assert!(matches!(empty.one(), Err(DatabaseError::ExpectedOneRow(0))));

        let single = SqlitCursor::new(
            vec!["id".to_string()],
            vec![vec![DatabaseValue::Int64(7)]],
        );
        assert_eq!(
            single.one().unwrap().get("id"),
            Some(DatabaseValue::Int64(7))
        );
    }
}
