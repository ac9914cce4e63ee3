//! Text protocol result-set rows, per §3 `TextRow`.

use crate::error::Result;
use crate::protocol::primitive::read_int_lenenc;

/// One row of a text-protocol result set: one value per column, `None` for
/// SQL NULL. Owned, so it can be held inside an assembled
/// [`crate::protocol::QueryResult`] past the lifetime of the packet buffer.
pub type TextRow = Vec<Option<Vec<u8>>>;

/// The NULL marker for a length-encoded *string* field (distinct from the
/// lenenc-int encoding, where 0xFB is never valid).
const LENENC_STRING_NULL: u8 = 0xFB;

/// Parse one text-protocol row packet's payload into `column_count` values.
pub fn read_text_row(payload: &[u8], column_count: usize) -> Result<TextRow> {
    let mut data = payload;
    let mut row = Vec::with_capacity(column_count);

    for _ in 0..column_count {
        if data.first() == Some(&LENENC_STRING_NULL) {
            row.push(None);
            data = &data[1..];
            continue;
        }

        let (len, rest) = read_int_lenenc(data)?;
        let len = len as usize;
        if rest.len() < len {
            return Err(crate::error::Error::ShortFrame {
                expected: len,
                got: rest.len(),
            });
        }
        row.push(Some(rest[..len].to_vec()));
        data = &rest[len..];
    }

    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::primitive::write_string_lenenc;

    #[test]
    fn parses_row_with_mixed_null_and_values() {
        let mut payload = Vec::new();
        write_string_lenenc(&mut payload, "1");
        payload.push(LENENC_STRING_NULL);
        write_string_lenenc(&mut payload, "hello");

        let row = read_text_row(&payload, 3).unwrap();
        assert_eq!(row[0], Some(b"1".to_vec()));
        assert_eq!(row[1], None);
        assert_eq!(row[2], Some(b"hello".to_vec()));
    }

    #[test]
    fn parses_all_null_row() {
        let payload = vec![LENENC_STRING_NULL; 4];
        let row = read_text_row(&payload, 4).unwrap();
        assert!(row.iter().all(Option::is_none));
    }

    #[test]
    fn rejects_truncated_value() {
        let mut payload = Vec::new();
        payload.push(10); // claims a 10-byte value
        payload.extend_from_slice(b"short");
        assert!(read_text_row(&payload, 1).is_err());
    }
}
