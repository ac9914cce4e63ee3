//! Query result assembler: turns a sequence of packets into one logical
//! [`QueryResult`], per §4.2. Owned by exactly one backend connection's
//! read path — not `Sync`, never shared across threads.

use crate::error::{Error, Result};
use crate::protocol::column::ColumnDefinition;
use crate::protocol::response::{EofPacket, ErrPayload, OkPayload};
use crate::protocol::row::TextRow;

/// The generic-response terminal form of a [`QueryResult`]: the semantics
/// of an OK or ERR packet.
#[derive(Debug, Clone)]
pub enum GenericResponse {
    Ok(OkPayload),
    Err(ErrPayload),
}

/// Assembler phase, per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResultPhase {
    AwaitFirst,
    Columns,
    Rows,
    Done,
}

/// Per-connection, per-in-flight-request accumulator (§3 `QueryResult`).
///
/// Buffer-then-complete (§9 Design Note, Open Question 1 resolved): the
/// response state machine only hands this to a waiting caller once `phase`
/// reaches `Done` — callers never observe a partially-populated result.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub generic: Option<GenericResponse>,
    pub column_count: usize,
    pub columns: Vec<ColumnDefinition>,
    pub rows: Vec<TextRow>,
    pub phase: QueryResultPhase,
}

impl Default for QueryResultPhase {
    fn default() -> Self {
        QueryResultPhase::AwaitFirst
    }
}

impl QueryResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff still collecting column definitions (§8 property 4).
    pub fn needs_column_definition(&self) -> bool {
        self.phase == QueryResultPhase::Columns && self.columns.len() < self.column_count
    }

    pub fn feed_generic(&mut self, response: GenericResponse) -> Result<()> {
        self.generic = Some(response);
        self.phase = QueryResultPhase::Done;
        Ok(())
    }

    pub fn feed_column_count(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(Error::protocol("column count must be > 0"));
        }
        if self.phase != QueryResultPhase::AwaitFirst {
            return Err(Error::protocol(format!(
                "feed_column_count in phase {:?}",
                self.phase
            )));
        }
        self.column_count = n;
        self.columns = Vec::with_capacity(n);
        self.phase = QueryResultPhase::Columns;
        Ok(())
    }

    pub fn feed_column_definition(&mut self, def: ColumnDefinition) -> Result<()> {
        if self.phase != QueryResultPhase::Columns || !self.needs_column_definition() {
            return Err(Error::protocol(format!(
                "unexpected column definition in phase {:?} ({}/{})",
                self.phase,
                self.columns.len(),
                self.column_count
            )));
        }
        self.columns.push(def);
        Ok(())
    }

    pub fn feed_columns_eof(&mut self, _eof: &EofPacket) -> Result<()> {
        if self.phase != QueryResultPhase::Columns || self.needs_column_definition() {
            return Err(Error::protocol(
                "columns EOF before all column definitions were received",
            ));
        }
        self.phase = QueryResultPhase::Rows;
        Ok(())
    }

    pub fn feed_row(&mut self, row: TextRow) -> Result<()> {
        if self.phase != QueryResultPhase::Rows {
            return Err(Error::protocol(format!("feed_row in phase {:?}", self.phase)));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn feed_rows_eof(&mut self, _eof: &EofPacket) -> Result<()> {
        if self.phase != QueryResultPhase::Rows {
            return Err(Error::protocol(format!("feed_rows_eof in phase {:?}", self.phase)));
        }
        self.phase = QueryResultPhase::Done;
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.phase == QueryResultPhase::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::{ColumnFlags, ColumnType};

    fn eof() -> EofPacket {
        use crate::protocol::response::read_eof_packet;
        let payload = [crate::constant::HEADER_EOF, 0, 0, 0, 0];
        *read_eof_packet(&payload).unwrap()
    }

    fn dummy_column(name: &str) -> ColumnDefinition {
        ColumnDefinition {
            catalog: "def".into(),
            schema: "test".into(),
            table: "t".into(),
            org_table: "t".into(),
            name: name.into(),
            org_name: name.into(),
            charset: 33,
            column_length: 11,
            column_type: ColumnType::MYSQL_TYPE_VAR_STRING,
            flags: ColumnFlags::empty(),
            decimals: 0,
        }
    }

    #[test]
    fn generic_response_completes_immediately() {
        let mut qr = QueryResult::new();
        assert!(qr.needs_column_definition().eq(&false));
        qr.feed_generic(GenericResponse::Ok(OkPayload {
            affected_rows: 1,
            last_insert_id: 0,
            status_flags: Default::default(),
            warnings: 0,
        }))
        .unwrap();
        assert!(qr.is_done());
    }

    #[test]
    fn two_columns_three_rows_scenario() {
        // §8 scenario (b).
        let mut qr = QueryResult::new();
        qr.feed_column_count(2).unwrap();
        assert!(qr.needs_column_definition());

        qr.feed_column_definition(dummy_column("c1")).unwrap();
        assert!(qr.needs_column_definition());
        qr.feed_column_definition(dummy_column("c2")).unwrap();
        assert!(!qr.needs_column_definition());

        qr.feed_columns_eof(&eof()).unwrap();
        assert_eq!(qr.phase, QueryResultPhase::Rows);

        qr.feed_row(vec![Some(b"a".to_vec()), Some(b"1".to_vec())]).unwrap();
        qr.feed_row(vec![Some(b"b".to_vec()), Some(b"2".to_vec())]).unwrap();
        qr.feed_row(vec![Some(b"c".to_vec()), Some(b"3".to_vec())]).unwrap();

        qr.feed_rows_eof(&eof()).unwrap();

        assert!(qr.is_done());
        assert_eq!(qr.columns.len(), 2);
        assert_eq!(qr.rows.len(), 3);
        assert_eq!(qr.rows[0][0], Some(b"a".to_vec()));
        assert_eq!(qr.rows[2][1], Some(b"3".to_vec()));
    }

    #[test]
    fn column_definition_before_column_count_is_an_error() {
        let mut qr = QueryResult::new();
        assert!(qr.feed_column_definition(dummy_column("c1")).is_err());
    }

    #[test]
    fn columns_eof_before_all_definitions_is_an_error() {
        let mut qr = QueryResult::new();
        qr.feed_column_count(2).unwrap();
        qr.feed_column_definition(dummy_column("c1")).unwrap();
        assert!(qr.feed_columns_eof(&eof()).is_err());
    }

    #[test]
    fn row_before_rows_phase_is_an_error() {
        let mut qr = QueryResult::new();
        qr.feed_column_count(1).unwrap();
        qr.feed_column_definition(dummy_column("c1")).unwrap();
        assert!(qr.feed_row(vec![Some(b"x".to_vec())]).is_err());
    }
}
