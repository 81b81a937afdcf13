//! Pre-execution static screening of submitted code.
//!
//! Two checks run before any container is launched:
//!
//! 1. **Path policy** — absolute paths appearing in write/open/path-building
//!    contexts must stay inside the sandbox mounts (`/workspace`, `/outputs`,
//!    and the read-only `/skill`).
//! 2. **Quote balance** — a light per-line Python scan that catches the most
//!    common paste error (an unterminated string) with a line number, instead
//!    of a cryptic container traceback.

use std::sync::OnceLock;

use regex::Regex;

use super::{Language, SandboxError};

/// Mount prefixes user code may touch with absolute paths.
const ALLOWED_PREFIXES: &[&str] = &["/workspace", "/outputs", "/skill", "/dev/null"];

fn path_context_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            open\s*\( | io\.open | pathlib\.Path | Path\s*\( | os\.path | os\.open |
            os\.makedirs | os\.mkdir | os\.remove | os\.rename | shutil\. |
            sys\.path | write | read_text | read_bytes |
            >>?\s*/ | \b(?:cp|mv|rm|tee|dd|touch|mkdir|cat|ln)\b
            ",
        )
        .unwrap()
    })
}

fn quoted_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"["'](/[^"']*)["']"#).unwrap())
}

fn redirect_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#">>?\s*(/[^\s"';|&]+)"#).unwrap())
}

fn shell_command_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\b(?:cp|mv|rm|tee|dd|touch|mkdir|cat|ln)\b\s+(?:-\S+\s+)*(/[^\s"';|&]+)"#)
            .unwrap()
    })
}

/// Run every static check appropriate for `language`.
pub fn validate(code: &str, language: Language) -> Result<(), SandboxError> {
    check_paths(code)?;
    if language == Language::Python {
        check_quotes(code)?;
    }
    Ok(())
}

fn path_allowed(path: &str) -> bool {
    ALLOWED_PREFIXES
        .iter()
        .any(|prefix| path == *prefix || path.starts_with(&format!("{}/", prefix)))
}

fn check_paths(code: &str) -> Result<(), SandboxError> {
    for (idx, line) in code.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            continue;
        }
        if !path_context_re().is_match(line) {
            continue;
        }
        for caps in quoted_path_re().captures_iter(line) {
            let path = &caps[1];
            if !path_allowed(path) {
                return Err(SandboxError::PathPolicy {
                    line: idx + 1,
                    path: path.to_string(),
                    text: line.trim().to_string(),
                });
            }
        }
        for re in [redirect_path_re(), shell_command_path_re()] {
            for caps in re.captures_iter(line) {
                let path = &caps[1];
                if !path_allowed(path) {
                    return Err(SandboxError::PathPolicy {
                        line: idx + 1,
                        path: path.to_string(),
                        text: line.trim().to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Per-line quote scanner. Tracks single/double quote state with escape
/// handling and ignores trailing comments; lines containing triple quotes
/// are skipped entirely.
fn check_quotes(code: &str) -> Result<(), SandboxError> {
    for (idx, line) in code.lines().enumerate() {
        if line.contains("'''") || line.contains("\"\"\"") {
            continue;
        }

        let mut in_single = false;
        let mut in_double = false;
        let mut escaped = false;
        for ch in line.chars() {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' if in_single || in_double => escaped = true,
                '\'' if !in_double => in_single = !in_single,
                '"' if !in_single => in_double = !in_double,
                '#' if !in_single && !in_double => break,
                _ => {}
            }
        }

        if in_single || in_double {
            let which = if in_single { "'" } else { "\"" };
            return Err(SandboxError::SyntaxRejected {
                line: idx + 1,
                reason: format!(
                    "unbalanced {} quote; check for an unterminated string",
                    which
                ),
            });
        }
    }
    Ok(())
}
