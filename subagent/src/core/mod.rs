//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects and shared state. They
//! operate on in-memory values and return deterministic outputs suitable for
//! tests.

pub mod budget;
pub mod conditions;
pub mod deep_copy;
pub mod naming;
pub mod template;
pub mod types;
