//! Initial handshake parsing, handshake response encoding, and the
//! authentication plugins needed to compute an auth response (§4.3.1, §6).

use crate::constant::CapabilityFlags;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use crate::protocol::response::ErrPayloadBytes;

// ============================================================================
// Initial Handshake Packet (Server -> Client)
// ============================================================================

/// Initial handshake packet from the backend (Protocol::HandshakeV10).
///
/// This is the first packet a backend sends after the transport connects.
/// The proxy reads [`InitialHandshake::connection_id`] to populate the
/// channel → ConnectionId mapping (§4.4) and `auth_plugin_data` as the
/// salt for §4.3.1.
///
/// Packet layout:
/// ```text
/// 1   [0a] protocol version (always 10)
/// n   server version (null-terminated string)
/// 4   connection id
/// 8   auth-plugin-data-part-1 (first 8 bytes of challenge)
/// 1   [00] filler
/// 2   capability flags (lower 2 bytes)
/// 1   character set
/// 2   status flags
/// 2   capability flags (upper 2 bytes)
/// 1   auth plugin data length
/// 10  reserved (all 0x00)
/// n   auth-plugin-data-part-2 (remaining challenge bytes)
/// n   auth plugin name (null-terminated)
/// ```
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data: Vec<u8>,
    pub capability_flags: CapabilityFlags,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

/// Read the initial handshake packet sent by the backend.
pub fn read_initial_handshake(payload: &[u8]) -> Result<InitialHandshake> {
    let (protocol_version, mut data) = read_int_1(payload)?;

    if protocol_version == 0xFF {
        let err_bytes = ErrPayloadBytes::from_payload(payload)
            .ok_or_else(|| Error::protocol("handshake ERR packet malformed"))?;
        let err = crate::protocol::response::ErrPayload::try_from(err_bytes)?;
        return Err(Error::Sql(err));
    }

    let (server_version_bytes, rest) = read_string_null(data)?;
    let server_version = String::from_utf8_lossy(server_version_bytes).to_string();
    data = rest;

    let (connection_id, rest) = read_int_4(data)?;
    data = rest;

    let (auth_data_1, rest) = read_string_fix(data, 8)?;
    data = rest;

    let (_filler, rest) = read_int_1(data)?;
    data = rest;

    let (cap_lower, rest) = read_int_2(data)?;
    data = rest;

    let (charset, rest) = read_int_1(data)?;
    data = rest;

    let (status_flags, rest) = read_int_2(data)?;
    data = rest;

    let (cap_upper, rest) = read_int_2(data)?;
    data = rest;

    let cap_bits = (u32::from(cap_upper) << 16) | u32::from(cap_lower);
    let capability_flags =
        CapabilityFlags::from_bits(cap_bits).unwrap_or_else(|| CapabilityFlags::from_bits_truncate(cap_bits));

    let (auth_data_len, rest) = read_int_1(data)?;
    data = rest;

    let (_reserved, rest) = read_string_fix(data, 10)?;
    data = rest;

    // Part 2 is fixed-length (padded with trailing NULs if the plugin's
    // challenge is shorter), per §6: "salt part 2 (>= 13 bytes, last byte null)".
    let auth_data_2_len = (auth_data_len as usize).saturating_sub(8).max(13);
    let (auth_data_2, rest) = read_string_fix(data, auth_data_2_len)?;
    data = rest;

    let (auth_plugin_name_bytes, rest) = read_string_null(data)?;
    if !rest.is_empty() {
        return Err(Error::protocol("trailing bytes after handshake packet"));
    }

    let mut auth_plugin_data = Vec::with_capacity(auth_data_1.len() + auth_data_2.len());
    auth_plugin_data.extend_from_slice(auth_data_1);
    auth_plugin_data.extend_from_slice(auth_data_2);
    // the protocol pads auth-plugin-data-part-2 with a trailing NUL which
    // isn't part of the challenge itself.
    if auth_plugin_data.last() == Some(&0) {
        auth_plugin_data.pop();
    }

    Ok(InitialHandshake {
        protocol_version,
        server_version,
        connection_id,
        auth_plugin_data,
        capability_flags,
        charset,
        status_flags,
        auth_plugin_name: String::from_utf8_lossy(auth_plugin_name_bytes).to_string(),
    })
}

// ============================================================================
// Handshake Response Packet (Client -> Server)
// ============================================================================

/// Handshake response (HandshakeResponse41) sent by the proxy after
/// computing the auth response.
#[derive(Debug, Clone)]
pub struct HandshakeResponse41<'a> {
    pub capability_flags: CapabilityFlags,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin_name: Option<&'a str>,
}

/// Per §6: max packet size is fixed at 16MiB - 1.
pub const MAX_PACKET_SIZE: u32 = 16_777_215;

/// Write the handshake response packet (HandshakeResponse41).
pub fn write_handshake_response(out: &mut Vec<u8>, response: &HandshakeResponse41<'_>) {
    write_int_4(out, response.capability_flags.bits());
    write_int_4(out, response.max_packet_size);
    write_int_1(out, response.charset);
    out.extend_from_slice(&[0u8; 23]);

    write_string_null(out, response.username);

    if response
        .capability_flags
        .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA)
    {
        write_bytes_lenenc(out, response.auth_response);
    } else {
        write_int_1(out, response.auth_response.len() as u8);
        out.extend_from_slice(response.auth_response);
    }

    if let Some(db) = response.database {
        write_string_null(out, db);
    }

    if let Some(plugin) = response.auth_plugin_name {
        if response
            .capability_flags
            .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH)
        {
            write_string_null(out, plugin);
        }
    }
}

// ============================================================================
// Authentication Plugins (§4.3.1, §6)
// ============================================================================

/// `mysql_native_password` authentication.
///
/// `response = SHA1(password) XOR SHA1(salt || SHA1(SHA1(password)))`.
/// An empty password yields an empty response (§4.3.1).
pub fn auth_mysql_native_password(password: &[u8], salt: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};

    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let token = hasher.finalize();

    stage1
        .iter()
        .zip(token.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// `caching_sha2_password` initial response (MySQL 8.0+ default plugin).
///
/// `response = SHA256(password) XOR SHA256(SHA256(SHA256(password)) || salt)`.
pub fn auth_caching_sha2_password(password: &[u8], salt: &[u8]) -> Vec<u8> {
    use sha2::{Digest, Sha256};

    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha256::digest(password);
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(salt);
    let scramble = hasher.finalize();

    stage1
        .iter()
        .zip(scramble.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// `caching_sha2_password` fast-auth-result byte, sent after the initial
/// response. Full auth (RSA/cleartext fallback) is out of scope — see
/// DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingSha2FastAuthResult {
    Success,
    FullAuthRequired,
}

pub fn read_caching_sha2_fast_auth_result(payload: &[u8]) -> Result<CachingSha2FastAuthResult> {
    let (marker, _) = read_int_1(payload)?;
    match marker {
        0x03 => Ok(CachingSha2FastAuthResult::Success),
        0x04 => Ok(CachingSha2FastAuthResult::FullAuthRequired),
        other => Err(Error::protocol(format!(
            "unrecognized caching_sha2_password fast-auth marker 0x{other:02X}"
        ))),
    }
}

/// Dispatch on the plugin name advertised by the handshake.
pub fn compute_auth_response(plugin_name: &str, password: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
    match plugin_name {
        "mysql_native_password" => Ok(auth_mysql_native_password(password, salt)),
        "caching_sha2_password" => Ok(auth_caching_sha2_password(password, salt)),
        other => Err(Error::Crypto(format!("unsupported auth plugin: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    #[test]
    fn mysql_native_password_empty_password_yields_empty_response() {
        assert!(auth_mysql_native_password(b"", &[0u8; 20]).is_empty());
    }

    #[test]
    fn mysql_native_password_matches_worked_example() {
        // §8 scenario (c): password "secret", salt = 20 zero bytes.
        let password = b"secret";
        let salt = [0u8; 20];

        let response = auth_mysql_native_password(password, &salt);

        let stage1 = Sha1::digest(password);
        let stage2 = Sha1::digest(stage1);
        let mut hasher = Sha1::new();
        hasher.update(salt);
        hasher.update(stage2);
        let token = hasher.finalize();
        let expected: Vec<u8> = stage1.iter().zip(token.iter()).map(|(a, b)| a ^ b).collect();

        assert_eq!(response, expected);

        // response XOR SHA1(password) == SHA1(salt || SHA1(SHA1(password)))
        let recovered: Vec<u8> = response.iter().zip(stage1.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(recovered.as_slice(), token.as_slice());
    }

    #[test]
    fn caching_sha2_password_empty_password_yields_empty_response() {
        assert!(auth_caching_sha2_password(b"", &[0u8; 20]).is_empty());
    }

    #[test]
    fn fast_auth_result_recognizes_both_markers() {
        assert_eq!(
            read_caching_sha2_fast_auth_result(&[0x03]).unwrap(),
            CachingSha2FastAuthResult::Success
        );
        assert_eq!(
            read_caching_sha2_fast_auth_result(&[0x04]).unwrap(),
            CachingSha2FastAuthResult::FullAuthRequired
        );
        assert!(read_caching_sha2_fast_auth_result(&[0x99]).is_err());
    }

    #[test]
    fn compute_auth_response_rejects_unknown_plugin() {
        let err = compute_auth_response("sspi", b"pw", &[0u8; 20]).unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }
}
