//! Quoting of path arguments for the sftp command line.
//!
//! sftp tokenises its input itself (not through a shell). Whitespace splits
//! arguments and double quotes group them. Inside double quotes a backslash
//! only unescapes `"`; before any other character it is kept as typed.
//!
//! Some commands run their argument through glob(3) afterwards (`ls`, `rm`,
//! the source of `get` and `put`), which removes one more level of
//! backslashes and expands `*`, `?` and `[`. Those arguments go through
//! [`quote_glob`]; everything else uses [`quote_path`].

use crate::sftp_pty::error::{SftpError, SftpResult};

fn validate(path: &str) -> SftpResult<()> {
    if path.is_empty() {
        return Err(SftpError::protocol("empty path argument"));
    }
    if let Some(c) = path.chars().find(|c| c.is_control()) {
        return Err(SftpError::protocol(format!(
            "path contains control character U+{:04X}",
            c as u32
        )));
    }
    Ok(())
}

/// Quote `path` as an argument sftp uses verbatim: `mkdir`, `rmdir`, `cd`,
/// `rename` and the destination of `get` / `put`.
///
/// A backslash that ends the path or precedes `"`, `*`, `?` or `[` has no
/// spelling sftp would pass through unchanged and is rejected, as are
/// control characters (CR/LF would end the command line).
pub fn quote_path(path: &str) -> SftpResult<String> {
    validate(path)?;

    let mut out = String::with_capacity(path.len() + 2);
    out.push('"');
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => match chars.next() {
                Some(n) if !matches!(n, '"' | '*' | '?' | '[') => {
                    out.push('\\');
                    out.push(n);
                }
                _ => {
                    return Err(SftpError::protocol(format!(
                        "path {:?} has a backslash sftp cannot pass through",
                        path
                    )))
                }
            },
            c => out.push(c),
        }
    }
    out.push('"');
    Ok(out)
}

/// Quote `path` for an argument sftp expands as a glob, so that it matches
/// exactly one name. Glob characters are escaped outside the quotes, where
/// sftp hands the escape on to glob(3).
pub fn quote_glob(path: &str) -> SftpResult<String> {
    validate(path)?;

    let mut out = String::with_capacity(path.len() + 2);
    out.push('"');
    for c in path.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '*' | '?' | '[' => {
                out.push('"');
                out.push('\\');
                out.push(c);
                out.push('"');
            }
            c => out.push(c),
        }
    }
    out.push('"');
    Ok(out)
}
