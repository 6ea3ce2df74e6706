//!
//! deplex wire protocol
//! --------------------
//! Line-based request decoder plus the reply tokens. One request per line:
//!
//! ```text
//! <command>|<package>|<deps>\n
//! ```
//!
//! Where `<command>` is one of `INDEX`, `REMOVE` or `QUERY` (case sensitive),
//! `<package>` is a non-empty package name, and `<deps>` is either empty or a
//! comma-separated list of package names. Both `|` separators are mandatory
//! even when `<deps>` is empty. Sample lines:
//!
//! ```text
//! INDEX|cloog|gmp,isl,pkg-config
//! INDEX|ceylon|
//! REMOVE|cloog|
//! QUERY|cloog|
//! ```
//!
//! Decoding is pure and stateless; it never touches the store. Empty names
//! (package or any dependency) are rejected here so the store layer only ever
//! sees well-formed identifiers. `REMOVE`/`QUERY` lines may carry a deps field
//! on the wire; it is decoded and then ignored by the dispatcher.

use thiserror::Error;

/// The three operations a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Index,
    Remove,
    Query,
}

impl Command {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "INDEX" => Some(Command::Index),
            "REMOVE" => Some(Command::Remove),
            "QUERY" => Some(Command::Query),
            _ => None,
        }
    }
}

/// A decoded request, owned by the handling task until its reply is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub package: String,
    pub deps: Vec<String>,
}

/// Why a wire line was refused. All variants map to the `ERROR` reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed request, expected <command>|<package>|<deps>")]
    Shape,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("empty package name")]
    EmptyName,
}

/// Decode one wire line (terminator already stripped) into a [`Request`].
///
/// The line must contain exactly two `|` separators; since `|` and `,` are
/// excluded from names by the grammar, any other count is malformed rather
/// than an exotic package name. An empty `<deps>` field decodes to an empty
/// list, not a list holding the empty string.
pub fn decode(line: &str) -> Result<Request, DecodeError> {
    let mut parts = line.split('|');
    let (cmd, pkg, deps_raw) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(c), Some(p), Some(d), None) => (c, p, d),
        _ => return Err(DecodeError::Shape),
    };

    let command = Command::parse(cmd).ok_or_else(|| DecodeError::UnknownCommand(cmd.to_string()))?;

    if pkg.is_empty() {
        return Err(DecodeError::EmptyName);
    }

    let deps = if deps_raw.is_empty() {
        Vec::new()
    } else {
        let mut out: Vec<String> = Vec::new();
        for name in deps_raw.split(',') {
            if name.is_empty() {
                return Err(DecodeError::EmptyName);
            }
            out.push(name.to_string());
        }
        out
    };

    Ok(Request { command, package: pkg.to_string(), deps })
}
