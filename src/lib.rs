pub mod config;
pub mod errors;
pub mod http;
pub mod job;
pub mod modules;
pub mod parser;
