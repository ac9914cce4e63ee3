pub mod assembler;
pub mod column;
pub mod handshake;
pub mod packet;
pub mod primitive;
pub mod response;
pub mod row;
pub mod statemachine;

pub use assembler::{GenericResponse, QueryResult, QueryResultPhase};
pub use column::ColumnDefinition;
pub use row::TextRow;
pub use statemachine::{ConnectionPhase, HandshakeCredentials, ResponseStateMachine, StateMachineAction};
