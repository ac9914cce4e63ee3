//! Per-backend-connection response state machine, per §4.3.
//!
//! Drives (phase, header byte) → action. Never blocks: it is fed packets
//! by a single I/O thread in arrival order and only ever mutates its own
//! state and the [`QueryResult`] it is assembling (§5).

use crate::constant::{HEADER_EOF, HEADER_ERR, HEADER_OK};
use crate::error::{Error, Result};
use crate::protocol::assembler::{GenericResponse, QueryResult, QueryResultPhase};
use crate::protocol::column::read_column_definition;
use crate::protocol::handshake::{
    self, HandshakeResponse41, InitialHandshake, MAX_PACKET_SIZE,
};
use crate::protocol::primitive::read_int_lenenc;
use crate::protocol::response::{looks_like_eof, read_eof_packet, ErrPayload, OkPayload};
use crate::protocol::row::read_text_row;

/// Per-connection phase, per §3 `ConnectionPhase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Handshaking,
    Authenticating,
    Command,
}

/// What the caller driving the state machine should do next.
#[derive(Debug)]
pub enum StateMachineAction {
    /// Send this fully-framed packet payload (handshake response) and keep
    /// reading.
    SendBytes(Vec<u8>),
    /// A logical response completed; hand it to the waiting caller and
    /// clear the slot.
    CompleteFuture(QueryResult),
    /// A logical response completed but the backend connection is no
    /// longer usable (auth failure, protocol corruption).
    CompleteFutureAndCloseConnection(QueryResult),
    /// No caller-visible event yet; keep reading.
    Continue,
}

/// Credentials the state machine needs to answer the handshake.
#[derive(Debug, Clone)]
pub struct HandshakeCredentials {
    pub username: String,
    pub password: Vec<u8>,
    pub database: Option<String>,
}

/// Drives one backend connection's packet stream through handshake,
/// authentication, and the command/response cycle.
pub struct ResponseStateMachine {
    phase: ConnectionPhase,
    credentials: HandshakeCredentials,
    connection_id: Option<u32>,
    assembler: Option<QueryResult>,
}

impl ResponseStateMachine {
    pub fn new(credentials: HandshakeCredentials) -> Self {
        Self {
            phase: ConnectionPhase::Handshaking,
            credentials,
            connection_id: None,
            assembler: None,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn connection_id(&self) -> Option<u32> {
        self.connection_id
    }

    /// Feed one fully-framed packet's payload (header byte not yet
    /// consumed). Returns what the caller should do next.
    pub fn on_packet(&mut self, payload: &[u8]) -> Result<StateMachineAction> {
        match self.phase {
            ConnectionPhase::Handshaking => self.on_handshake_packet(payload),
            ConnectionPhase::Authenticating => self.on_authenticating_packet(payload),
            ConnectionPhase::Command => self.on_command_packet(payload),
        }
    }

    fn on_handshake_packet(&mut self, payload: &[u8]) -> Result<StateMachineAction> {
        let initial = handshake::read_initial_handshake(payload)?;
        self.connection_id = Some(initial.connection_id);

        let auth_response = handshake::compute_auth_response(
            &initial.auth_plugin_name,
            &self.credentials.password,
            &initial.auth_plugin_data,
        )?;

        let capability_flags = response_capability_flags(&initial, self.credentials.database.is_some());
        let response = HandshakeResponse41 {
            capability_flags,
            max_packet_size: MAX_PACKET_SIZE,
            charset: initial.charset,
            username: &self.credentials.username,
            auth_response: &auth_response,
            database: self.credentials.database.as_deref(),
            auth_plugin_name: Some(initial.auth_plugin_name.as_str()),
        };

        let mut out = Vec::new();
        handshake::write_handshake_response(&mut out, &response);

        self.phase = ConnectionPhase::Authenticating;
        Ok(StateMachineAction::SendBytes(out))
    }

    fn on_authenticating_packet(&mut self, payload: &[u8]) -> Result<StateMachineAction> {
        let header = *payload
            .first()
            .ok_or_else(|| Error::protocol("empty packet during authentication"))?;

        match header {
            HEADER_OK => {
                let ok = OkPayload::try_from(crate::protocol::response::OkPayloadBytes(payload))?;
                let mut result = QueryResult::new();
                result.feed_generic(GenericResponse::Ok(ok))?;
                self.phase = ConnectionPhase::Command;
                Ok(StateMachineAction::CompleteFuture(result))
            }
            HEADER_ERR => {
                let err_bytes = crate::protocol::response::ErrPayloadBytes::from_payload(payload)
                    .ok_or_else(|| Error::protocol("malformed ERR packet during authentication"))?;
                let err = ErrPayload::try_from(err_bytes)?;
                let mut result = QueryResult::new();
                result.feed_generic(GenericResponse::Err(err))?;
                Ok(StateMachineAction::CompleteFutureAndCloseConnection(result))
            }
            other => Err(Error::protocol(format!(
                "unexpected header 0x{other:02X} during authentication"
            ))),
        }
    }

    fn on_command_packet(&mut self, payload: &[u8]) -> Result<StateMachineAction> {
        let header = *payload
            .first()
            .ok_or_else(|| Error::protocol("empty packet during command phase"))?;

        match header {
            HEADER_ERR => {
                let err_bytes = crate::protocol::response::ErrPayloadBytes::from_payload(payload)
                    .ok_or_else(|| Error::protocol("malformed ERR packet"))?;
                let err = ErrPayload::try_from(err_bytes)?;
                self.assembler = None;
                let mut result = QueryResult::new();
                result.feed_generic(GenericResponse::Err(err))?;
                Ok(StateMachineAction::CompleteFuture(result))
            }
            HEADER_OK if self.assembler.is_none() => {
                let ok = OkPayload::try_from(crate::protocol::response::OkPayloadBytes(payload))?;
                let mut result = QueryResult::new();
                result.feed_generic(GenericResponse::Ok(ok))?;
                Ok(StateMachineAction::CompleteFuture(result))
            }
            HEADER_EOF if self.assembler.is_some() && looks_like_eof(payload) => {
                self.on_eof_packet(payload)
            }
            _ => self.on_column_or_row_packet(payload),
        }
    }

    fn on_eof_packet(&mut self, payload: &[u8]) -> Result<StateMachineAction> {
        let eof = *read_eof_packet(payload)?;
        let assembler = self
            .assembler
            .as_mut()
            .ok_or_else(|| Error::protocol("EOF packet with no in-progress result"))?;

        match assembler.phase {
            QueryResultPhase::Columns => {
                assembler.feed_columns_eof(&eof)?;
                // buffer-then-complete (§9): keep reading rows, don't
                // surface the result yet.
                Ok(StateMachineAction::Continue)
            }
            QueryResultPhase::Rows => {
                assembler.feed_rows_eof(&eof)?;
                let result = self.assembler.take().expect("checked Some above");
                Ok(StateMachineAction::CompleteFuture(result))
            }
            other => Err(Error::protocol(format!("EOF packet in phase {other:?}"))),
        }
    }

    fn on_column_or_row_packet(&mut self, payload: &[u8]) -> Result<StateMachineAction> {
        if self.assembler.is_none() {
            let (column_count, _) = read_int_lenenc(payload)?;
            let mut result = QueryResult::new();
            result.feed_column_count(column_count as usize)?;
            self.assembler = Some(result);
            return Ok(StateMachineAction::Continue);
        }

        let assembler = self.assembler.as_mut().expect("checked Some above");
        if assembler.needs_column_definition() {
            let def = read_column_definition(payload)?;
            assembler.feed_column_definition(def)?;
        } else {
            let row = read_text_row(payload, assembler.column_count)?;
            assembler.feed_row(row)?;
        }
        Ok(StateMachineAction::Continue)
    }
}

fn response_capability_flags(initial: &InitialHandshake, with_database: bool) -> crate::constant::CapabilityFlags {
    use crate::constant::{CapabilityFlags, CAPABILITIES_ALWAYS_DISABLED, CAPABILITIES_ALWAYS_ENABLED};
    let mut flags = (initial.capability_flags | CAPABILITIES_ALWAYS_ENABLED) & !CAPABILITIES_ALWAYS_DISABLED;
    if with_database {
        flags |= CapabilityFlags::CLIENT_CONNECT_WITH_DB;
    }
    flags
}
