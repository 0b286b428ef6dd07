//! The `utils` module provides shared building blocks used across the
//! `wsbroadcast` application: the error types every layer returns and the
//! tracing subscriber setup used by the binary and by tests.

pub mod error;
pub mod logging;
