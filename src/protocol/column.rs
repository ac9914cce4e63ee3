//! Column definition packets (result-set metadata), per §3 `ColumnDefinition`.

use crate::constant::{ColumnFlags, ColumnType};
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// A column definition, fully owned so it can outlive the packet buffer it
/// was parsed from and sit inside an assembled [`crate::protocol::QueryResult`].
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: ColumnType,
    pub flags: ColumnFlags,
    pub decimals: u8,
}

/// Fixed-size tail of a Column Definition packet (12 bytes), following the
/// lenenc `0x0c` fixed-fields-length marker.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
struct ColumnDefinitionTail {
    charset: U16LE,
    column_length: U32LE,
    column_type: u8,
    flags: U16LE,
    decimals: u8,
    reserved: U16LE,
}

/// Parse one column definition packet's payload.
pub fn read_column_definition(payload: &[u8]) -> Result<ColumnDefinition> {
    let (catalog_bytes, data) = read_string_lenenc(payload)?;
    let (schema_bytes, data) = read_string_lenenc(data)?;
    let (table_bytes, data) = read_string_lenenc(data)?;
    let (org_table_bytes, data) = read_string_lenenc(data)?;
    let (name_bytes, data) = read_string_lenenc(data)?;
    let (org_name_bytes, data) = read_string_lenenc(data)?;

    // length of fixed fields, always 0x0c; the value itself is uninteresting.
    let (_fixed_len, data) = read_int_lenenc(data)?;

    if data.len() < 12 {
        return Err(Error::ShortFrame {
            expected: 12,
            got: data.len(),
        });
    }
    let tail = ColumnDefinitionTail::ref_from_bytes(&data[..12])?;

    let column_type = ColumnType::from_u8(tail.column_type)
        .ok_or_else(|| Error::protocol(format!("unknown column type 0x{:02X}", tail.column_type)))?;
    let flags = ColumnFlags::from_bits(tail.flags.get())
        .ok_or_else(|| Error::protocol(format!("invalid column flags 0x{:04X}", tail.flags.get())))?;

    Ok(ColumnDefinition {
        catalog: String::from_utf8_lossy(catalog_bytes).to_string(),
        schema: String::from_utf8_lossy(schema_bytes).to_string(),
        table: String::from_utf8_lossy(table_bytes).to_string(),
        org_table: String::from_utf8_lossy(org_table_bytes).to_string(),
        name: String::from_utf8_lossy(name_bytes).to_string(),
        org_name: String::from_utf8_lossy(org_name_bytes).to_string(),
        charset: tail.charset.get(),
        column_length: tail.column_length.get(),
        column_type,
        flags,
        decimals: tail.decimals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Vec<u8> {
        let mut packet = Vec::new();
        write_string_lenenc(&mut packet, "def");
        write_string_lenenc(&mut packet, "test");
        write_string_lenenc(&mut packet, "users");
        write_string_lenenc(&mut packet, "users");
        write_string_lenenc(&mut packet, "id");
        write_string_lenenc(&mut packet, "id");
        write_int_lenenc(&mut packet, 12);
        packet.extend_from_slice(&[
            0x21, 0x00, // charset = 33 (utf8)
            0x0B, 0x00, 0x00, 0x00, // column_length = 11
            0x03, // column_type = 3 (LONG)
            0x03, 0x00, // flags = NOT_NULL | PRI_KEY
            0x00, // decimals
            0x00, 0x00, // reserved
        ]);
        packet
    }

    #[test]
    fn parses_column_definition() {
        let def = read_column_definition(&sample_packet()).unwrap();
        assert_eq!(def.catalog, "def");
        assert_eq!(def.schema, "test");
        assert_eq!(def.table, "users");
        assert_eq!(def.org_table, "users");
        assert_eq!(def.name, "id");
        assert_eq!(def.org_name, "id");
        assert_eq!(def.charset, 33);
        assert_eq!(def.column_length, 11);
        assert_eq!(def.column_type, ColumnType::MYSQL_TYPE_LONG);
        assert!(def.flags.contains(ColumnFlags::NOT_NULL_FLAG));
        assert!(def.flags.contains(ColumnFlags::PRI_KEY_FLAG));
        assert_eq!(def.decimals, 0);
    }

    #[test]
    fn rejects_truncated_tail() {
        let mut packet = sample_packet();
        packet.truncate(packet.len() - 4);
        assert!(read_column_definition(&packet).is_err());
    }

    #[test]
    fn rejects_unknown_column_type() {
        let mut packet = sample_packet();
        let len = packet.len();
        packet[len - 7] = 0x50; // column_type byte, in the unassigned gap
        assert!(read_column_definition(&packet).is_err());
    }
}
