//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `serve`    | `Serve` (default) |
//! | `parse`    | `Parse`          |
//! | `modules`  | `Modules`        |
//! | `history`  | `History`        |
//! | `config`   | `Config`         |

pub mod config;
pub mod history;
pub mod modules;
pub mod parse;
pub mod serve;

pub use config::cmd_config;
pub use history::cmd_history;
pub use modules::cmd_modules;
pub use parse::cmd_parse;
pub use serve::cmd_serve;
