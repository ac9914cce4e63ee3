use crate::constant::{HEADER_ERR, HEADER_OK, ServerStatusFlags};
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use zerocopy::byteorder::little_endian::U16 as U16LE;
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// The payload part of an OK packet, before it has been parsed.
#[derive(Debug, Clone, Copy)]
pub struct OkPayloadBytes<'a>(pub &'a [u8]);

impl<'a> OkPayloadBytes<'a> {
    pub fn bytes(&self) -> &[u8] {
        self.0
    }
}

/// The generic-response OK packet, parsed from [`OkPayloadBytes`].
#[derive(Debug, Clone)]
pub struct OkPayload {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: ServerStatusFlags,
    pub warnings: u16,
}

impl TryFrom<OkPayloadBytes<'_>> for OkPayload {
    type Error = Error;

    fn try_from(bytes: OkPayloadBytes<'_>) -> Result<Self> {
        let (header, data) = read_int_1(bytes.bytes())?;
        if header != HEADER_OK {
            return Err(Error::protocol(format!(
                "expected OK header 0x{HEADER_OK:02X}, got 0x{header:02X}"
            )));
        }

        let (affected_rows, data) = read_int_lenenc(data)?;
        let (last_insert_id, data) = read_int_lenenc(data)?;
        let (status_flags, data) = read_int_2(data)?;
        let (warnings, _data) = read_int_2(data)?;

        Ok(OkPayload {
            affected_rows,
            last_insert_id,
            status_flags: ServerStatusFlags::from_bits_truncate(status_flags),
            warnings,
        })
    }
}

/// The payload part of an ERR packet, before it has been parsed.
#[derive(Debug, Clone, Copy)]
pub struct ErrPayloadBytes<'a>(pub &'a [u8]);

impl<'a> ErrPayloadBytes<'a> {
    /// Build from a full packet payload, asserting the header byte.
    pub fn from_payload(payload: &'a [u8]) -> Option<Self> {
        if payload.first() == Some(&HEADER_ERR) {
            Some(Self(payload))
        } else {
            None
        }
    }
}

/// The ERR packet, parsed from [`ErrPayloadBytes`]. Carries the SQL error
/// the backend reported during the COMMAND phase, or an auth failure
/// during AUTHENTICATING.
#[derive(Debug, Clone, thiserror::Error)]
#[error("ERROR {} ({}): {}", self.error_code, self.sql_state, self.message)]
pub struct ErrPayload {
    pub error_code: u16,
    pub sql_state: String,
    pub message: String,
}

impl TryFrom<ErrPayloadBytes<'_>> for ErrPayload {
    type Error = Error;

    fn try_from(bytes: ErrPayloadBytes<'_>) -> Result<Self> {
        let (header, data) = read_int_1(bytes.0)?;
        if header != HEADER_ERR {
            return Err(Error::protocol(format!(
                "expected ERR header 0x{HEADER_ERR:02X}, got 0x{header:02X}"
            )));
        }

        let (error_code, data) = read_int_2(data)?;

        // '#' sql-state marker
        let (_sql_state_marker, data) = read_string_fix(data, 1)?;
        let (sql_state, data) = read_string_fix(data, 5)?;

        Ok(ErrPayload {
            error_code,
            sql_state: String::from_utf8_lossy(sql_state).to_string(),
            message: String::from_utf8_lossy(data).to_string(),
        })
    }
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub struct EofPacket {
    warnings: U16LE,
    status_flags: U16LE,
}

impl EofPacket {
    pub fn warnings(&self) -> u16 {
        self.warnings.get()
    }

    pub fn status_flags(&self) -> ServerStatusFlags {
        ServerStatusFlags::from_bits_truncate(self.status_flags.get())
    }
}

/// Read an EOF packet (header byte 0xFE, total payload length < 9).
pub fn read_eof_packet(payload: &[u8]) -> Result<&EofPacket> {
    let (header, data) = read_int_1(payload)?;
    if header != crate::constant::HEADER_EOF {
        return Err(Error::protocol(format!(
            "expected EOF header 0x{:02X}, got 0x{header:02X}",
            crate::constant::HEADER_EOF
        )));
    }
    if data.len() < 4 {
        return Err(Error::ShortFrame {
            expected: 4,
            got: data.len(),
        });
    }
    Ok(EofPacket::ref_from_bytes(&data[..4])?)
}

/// True iff `payload`'s header byte and length identify it as an EOF
/// packet rather than a (possibly large) length-encoded column count.
pub fn looks_like_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&crate::constant::HEADER_EOF)
        && payload.len() < crate::constant::EOF_PACKET_MAX_LENGTH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ok_payload() {
        let mut payload = vec![HEADER_OK];
        write_int_lenenc(&mut payload, 7); // affected_rows
        write_int_lenenc(&mut payload, 42); // last_insert_id
        write_int_2(&mut payload, 0x0002); // SERVER_STATUS_AUTOCOMMIT
        write_int_2(&mut payload, 0); // warnings

        let ok = OkPayload::try_from(OkPayloadBytes(&payload)).unwrap();
        assert_eq!(ok.affected_rows, 7);
        assert_eq!(ok.last_insert_id, 42);
        assert!(ok.status_flags.contains(ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT));
        assert_eq!(ok.warnings, 0);
    }

    #[test]
    fn parses_err_payload() {
        let mut payload = vec![HEADER_ERR];
        write_int_2(&mut payload, 1046);
        payload.push(b'#');
        payload.extend_from_slice(b"3D000");
        payload.extend_from_slice(b"No database selected");

        let err = ErrPayload::try_from(ErrPayloadBytes(&payload)).unwrap();
        assert_eq!(err.error_code, 1046);
        assert_eq!(err.sql_state, "3D000");
        assert_eq!(err.message, "No database selected");
    }

    #[test]
    fn eof_detection_distinguishes_from_large_column_count() {
        let eof_payload = [crate::constant::HEADER_EOF, 0, 0, 0, 0];
        assert!(looks_like_eof(&eof_payload));

        // 0xFE prefix but >= 9 bytes means a lenenc-int column count, not EOF.
        let mut big_count_payload = vec![0xFE];
        big_count_payload.extend_from_slice(&1_000_000u64.to_le_bytes());
        assert!(!looks_like_eof(&big_count_payload));
    }
}
