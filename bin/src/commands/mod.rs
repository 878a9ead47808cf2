//! CLI command implementations.

pub(crate) mod boundary;
pub(crate) mod watch;
