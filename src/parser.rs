//! Parser for a captured `nginx -V` dump.
//!
//! Pulls the version, the raw configure-argument string and the informational
//! builder/toolchain lines out of the text, then splits the configure
//! arguments with shell-like quoting rules.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::ParseError;

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"nginx/([0-9]+\.[0-9.]+)").expect("valid version regex"));

static PLAIN_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+$").expect("valid plain version regex"));

const VERSION_MARKER: &str = "nginx version:";
const CONFIGURE_MARKER: &str = "configure arguments:";

/// Structured fields extracted from an `nginx -V` dump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseResult {
    pub version: String,
    /// The configure arguments exactly as printed, before tokenization.
    pub configure_arguments: String,
    pub arguments: Vec<String>,
    /// `--with-*`, `--without-*` and add-module flags, de-duplicated in first-seen order.
    pub modules: Vec<String>,
    pub built_by: String,
    pub built_with: String,
    pub compiler: String,
}

/// Parse the text printed by `nginx -V`.
///
/// Both the `nginx version:` and the `configure arguments:` lines are
/// required. Blank lines, surrounding whitespace and the order of the other
/// informational lines do not matter.
pub fn parse_nginx_v(output: &str) -> Result<ParseResult, ParseError> {
    let mut result = ParseResult::default();

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.contains(VERSION_MARKER) {
            if let Some(caps) = VERSION_RE.captures(trimmed) {
                result.version = caps[1].to_string();
            }
            continue;
        }
        if let Some(idx) = trimmed.find(CONFIGURE_MARKER) {
            result.configure_arguments = trimmed[idx + CONFIGURE_MARKER.len()..].trim().to_string();
            continue;
        }
        if trimmed.contains("built by") {
            result.built_by = trimmed.to_string();
            continue;
        }
        if trimmed.contains("built with") {
            result.built_with = trimmed.to_string();
            continue;
        }
        if (trimmed.contains("gcc") || trimmed.contains("clang")) && result.compiler.is_empty() {
            result.compiler = trimmed.to_string();
        }
    }

    if result.version.is_empty() {
        return Err(ParseError::MissingVersion);
    }
    if result.configure_arguments.is_empty() {
        return Err(ParseError::MissingConfigureArguments);
    }

    result.arguments = split_shell_args(&result.configure_arguments);
    result.modules = extract_module_flags(&result.arguments);
    Ok(result)
}

/// Whether `version` (after trimming) is a plain dotted release like `1.24.0`.
pub fn is_valid_version(version: &str) -> bool {
    PLAIN_VERSION_RE.is_match(version.trim())
}

fn extract_module_flags(args: &[String]) -> Vec<String> {
    let mut modules: Vec<String> = Vec::new();
    for arg in args {
        let is_module_flag = arg.starts_with("--with-")
            || arg.starts_with("--without-")
            || arg.starts_with("--add-module=")
            || arg.starts_with("--add-dynamic-module=");
        if is_module_flag && !modules.contains(arg) {
            modules.push(arg.clone());
        }
    }
    modules
}

/// Split a command line the way a POSIX shell would for plain words:
/// single and double quotes group, a backslash escapes the next character,
/// and unquoted whitespace separates tokens.
pub fn split_shell_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes: Option<char> = None;
    let mut escaped = false;

    for c in input.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match (c, in_quotes) {
            ('\\', _) => escaped = true,
            (c, Some(quote)) if c == quote => in_quotes = None,
            (c, Some(_)) => current.push(c),
            ('\'' | '"', None) => in_quotes = Some(c),
            (' ' | '\t' | '\n' | '\r', None) => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            (c, None) => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "nginx version: nginx/1.24.0
built by gcc 12.2.0 (Debian 12.2.0-14)
built with OpenSSL 3.0.11 19 Sep 2023
TLS SNI support enabled
configure arguments: --prefix=/etc/nginx --with-http_ssl_module --with-cc-opt='-g -O2 -fstack-protector-strong' --add-module=/opt/old
";

    #[test]
    fn test_parse_version_and_arguments() {
        let output = "nginx version: nginx/1.24.0\nconfigure arguments: --prefix=/etc/nginx --with-http_ssl_module";
        let result = parse_nginx_v(output).expect("should parse");
        assert_eq!(result.version, "1.24.0");
        assert!(result.arguments.contains(&"--prefix=/etc/nginx".to_string()));
        assert!(result.arguments.contains(&"--with-http_ssl_module".to_string()));
    }

    #[test]
    fn test_parse_full_dump() {
        let result = parse_nginx_v(SAMPLE).unwrap();
        assert_eq!(result.version, "1.24.0");
        assert_eq!(result.built_by, "built by gcc 12.2.0 (Debian 12.2.0-14)");
        assert_eq!(result.built_with, "built with OpenSSL 3.0.11 19 Sep 2023");
        assert_eq!(
            result.arguments,
            vec![
                "--prefix=/etc/nginx",
                "--with-http_ssl_module",
                "--with-cc-opt=-g -O2 -fstack-protector-strong",
                "--add-module=/opt/old",
            ]
        );
        assert_eq!(
            result.modules,
            vec![
                "--with-http_ssl_module",
                "--with-cc-opt=-g -O2 -fstack-protector-strong",
                "--add-module=/opt/old",
            ]
        );
    }

    #[test]
    fn test_parse_ignores_whitespace_and_line_order() {
        let shuffled = "

              configure arguments: --prefix=/etc/nginx --with-http_ssl_module
            TLS SNI support enabled
         built with OpenSSL 3.0.11 19 Sep 2023
        nginx version: nginx/1.24.0
        built by gcc 12.2.0 (Debian 12.2.0-14)

        ";
        let a = parse_nginx_v(shuffled).unwrap();
        let b = parse_nginx_v("nginx version: nginx/1.24.0\nbuilt by gcc 12.2.0 (Debian 12.2.0-14)\nbuilt with OpenSSL 3.0.11 19 Sep 2023\nconfigure arguments: --prefix=/etc/nginx --with-http_ssl_module").unwrap();
        assert_eq!(a.version, b.version);
        assert_eq!(a.arguments, b.arguments);
        assert_eq!(a.built_by, b.built_by);
        assert_eq!(a.built_with, b.built_with);
    }

    #[test]
    fn test_parse_compiler_line_without_built_by() {
        let output = "nginx version: nginx/1.25.3\ngcc version 12.2.0\nclang version 16\nconfigure arguments: --prefix=/usr";
        let result = parse_nginx_v(output).unwrap();
        assert_eq!(result.compiler, "gcc version 12.2.0");
    }

    #[test]
    fn test_parse_missing_version() {
        let err = parse_nginx_v("configure arguments: --prefix=/etc/nginx").unwrap_err();
        assert_eq!(err, ParseError::MissingVersion);
    }

    #[test]
    fn test_parse_missing_configure_arguments() {
        let err = parse_nginx_v("nginx version: nginx/1.24.0").unwrap_err();
        assert_eq!(err, ParseError::MissingConfigureArguments);
    }

    #[test]
    fn test_parse_empty_input() {
        assert!(parse_nginx_v("").is_err());
        assert!(parse_nginx_v("   \n\t ").is_err());
    }

    #[test]
    fn test_split_preserves_quoted_spaces() {
        let args = split_shell_args(r#"--with-cc-opt="-O2 -g" --with-ld-opt='-Wl,-z,relro -pie' --prefix=/x"#);
        assert_eq!(args, vec!["--with-cc-opt=-O2 -g", "--with-ld-opt=-Wl,-z,relro -pie", "--prefix=/x"]);
    }

    #[test]
    fn test_split_backslash_escapes_are_literal() {
        let args = split_shell_args(r#"--a=one\ two --b=\"q\" --c=back\\slash"#);
        assert_eq!(args, vec!["--a=one two", r#"--b="q""#, r"--c=back\slash"]);
    }

    #[test]
    fn test_split_collapses_whitespace() {
        let args = split_shell_args("  a \t b\n\nc  ");
        assert_eq!(args, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_split_other_quote_inside_quotes() {
        let args = split_shell_args(r#"--x="it's" --y='say "hi"'"#);
        assert_eq!(args, vec!["--x=it's", r#"--y=say "hi""#]);
    }

    #[test]
    fn test_module_flags_are_deduplicated() {
        let output = "nginx version: nginx/1.24.0\nconfigure arguments: --with-http_v2_module --with-http_v2_module --without-mail_pop3_module --prefix=/x";
        let result = parse_nginx_v(output).unwrap();
        assert_eq!(result.modules, vec!["--with-http_v2_module", "--without-mail_pop3_module"]);
    }

    #[test]
    fn test_is_valid_version() {
        assert!(is_valid_version("1.24.0"));
        assert!(is_valid_version(" 1.25.10 "));
        assert!(!is_valid_version("1.24"));
        assert!(!is_valid_version("1.24.0-rc1"));
        assert!(!is_valid_version("v1.24.0"));
        assert!(!is_valid_version(""));
    }
}
