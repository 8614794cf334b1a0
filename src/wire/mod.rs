//! Wire framing: primitive readers/writers, envelopes, the write lock and
//! the opcode table.

pub mod envelope;
pub mod frame;
