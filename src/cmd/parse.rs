//! Offline parsing of an `nginx -V` dump.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use nginx_automake::parser::parse_nginx_v;

/// Parse `input` (a file, or `-` for stdin) and print the result as JSON.
pub fn cmd_parse(input: &Path) -> Result<()> {
    let output = if input == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read stdin")?;
        buf
    } else {
        std::fs::read_to_string(input)
            .with_context(|| format!("failed to read {}", input.display()))?
    };

    let result = parse_nginx_v(&output)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
