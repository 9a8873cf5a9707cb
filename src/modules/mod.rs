//! Third-party nginx modules: the preset registry and on-disk resolution.

pub mod registry;
pub mod resolver;
