//! Protocol adapters (§4.E): one `ProtocolAdapter` impl per URL scheme,
//! behind a single capability-set trait so `worker` never matches on
//! scheme itself. Resolution from a recipient/source URL to the adapter
//! that handles it is a static longest-specific-match table (§9 Open
//! Question 2), not a generic scheme-prefix split — `sftp://` must win
//! over a looser `ssh://` alias, for example.

pub mod exec;
pub mod ftp;
pub mod http;
pub mod loc;
pub mod misc;
pub mod net;
pub mod smtp;
pub mod sftp_ssh;

use crate::error::ProtocolError;
use crate::state::pwb::Credential;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    pub is_dir: bool,
}

/// A resolved recipient/source endpoint (§3 "recipient URL").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: &'static str,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

/// Capability set named in SPEC_FULL.md §4.E: `connect, login, change_dir,
/// list, stat_remote, open_read, read, close_read, open_write, write,
/// close_write, delete_remote, rename_remote, noop, quit`. Collapsed here
/// into whole-file `get`/`put` plus the directory/lifecycle operations,
/// since every adapter implemented against this trait streams a complete
/// file in one call rather than exposing a byte-range read/write surface
/// to callers outside this module.
pub trait ProtocolAdapter: Send {
    fn connect(&mut self, target: &Target, creds: Option<&Credential>) -> Result<(), ProtocolError>;
    fn change_dir(&mut self, path: &str) -> Result<(), ProtocolError>;
    fn list(&mut self, remote_path: &str) -> Result<Vec<RemoteEntry>, ProtocolError>;
    fn stat_remote(&mut self, remote_path: &str) -> Result<RemoteEntry, ProtocolError>;
    fn get(&mut self, remote_path: &str, local_path: &std::path::Path) -> Result<u64, ProtocolError>;
    fn put(&mut self, local_path: &std::path::Path, remote_path: &str) -> Result<u64, ProtocolError>;
    fn delete_remote(&mut self, remote_path: &str) -> Result<(), ProtocolError>;
    fn rename_remote(&mut self, from: &str, to: &str) -> Result<(), ProtocolError>;
    fn noop(&mut self) -> Result<(), ProtocolError>;
    fn quit(&mut self);
}

/// Parse a recipient/source URL into scheme + host + port + path. Minimal
/// on purpose: DIR_CONFIG URLs are never percent-encoded or query-bearing
/// in this system, so a full `url` crate dependency buys nothing a teacher
/// repo anywhere in the pack already reaches for.
pub fn parse_target(url: &str) -> Result<Target, ProtocolError> {
    let (scheme_token, rest) = url.split_once("://").ok_or_else(|| ProtocolError::UnknownScheme(url.to_string()))?;
    let scheme = resolve_scheme(scheme_token).ok_or_else(|| ProtocolError::UnknownScheme(scheme_token.to_string()))?;

    let (authority, path) = match rest.split_once('/') {
        Some((a, p)) => (a, format!("/{p}")),
        None => (rest, "/".to_string()),
    };
    let (user, hostport) = match authority.rsplit_once('@') {
        Some((u, hp)) => (Some(u.to_string()), hp),
        None => (None, authority),
    };
    let (host, port) = match hostport.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse::<u16>().ok()),
        None => (hostport.to_string(), None),
    };
    Ok(Target { scheme, user, host, port, path })
}

/// Longest-specific-match scheme table (§9 Open Question 2). Ordered most-
/// specific first so e.g. `sftp` is never shadowed by a hypothetical looser
/// `ssh` alias sharing a prefix.
const SCHEME_TABLE: &[(&str, &'static str)] = &[
    ("sftp", "sftp"),
    ("scp", "scp"),
    ("ftps", "ftps"),
    ("ftp", "ftp"),
    ("https", "https"),
    ("http", "http"),
    ("smtps", "smtps"),
    ("smtp", "smtp"),
    ("loc", "loc"),
    ("exec", "exec"),
    ("wmo", "wmo"),
    ("map", "map"),
    ("dfax", "dfax"),
    ("demail", "demail"),
];

pub fn resolve_scheme(token: &str) -> Option<&'static str> {
    let token = token.to_ascii_lowercase();
    SCHEME_TABLE.iter().filter(|(prefix, _)| token == *prefix).map(|(_, canonical)| *canonical).next()
}

/// Construct the adapter for a resolved target's scheme. Each adapter
/// owns its connection state and is a fresh object per job (workers do not
/// share adapters across hosts); burst/session reuse (§4.C) re-dispatches
/// to the same live worker thread, which keeps its adapter instance across
/// jobs instead of reconnecting here.
pub fn adapter_for(scheme: &str) -> Box<dyn ProtocolAdapter> {
    match scheme {
        "ftp" => Box::new(ftp::FtpAdapter::new(false)),
        "ftps" => Box::new(ftp::FtpAdapter::new(true)),
        "sftp" | "scp" => Box::new(sftp_ssh::SshAdapter::new(scheme == "scp")),
        "http" => Box::new(http::HttpAdapter::new(false)),
        "https" => Box::new(http::HttpAdapter::new(true)),
        "smtp" => Box::new(smtp::SmtpAdapter::new(false)),
        "smtps" => Box::new(smtp::SmtpAdapter::new(true)),
        "loc" => Box::new(loc::LocAdapter::new()),
        "exec" => Box::new(exec::ExecAdapter::new()),
        other => Box::new(misc::StubAdapter::new(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_sftp_over_generic_prefix() {
        assert_eq!(resolve_scheme("sftp"), Some("sftp"));
        assert_eq!(resolve_scheme("SFTP"), Some("sftp"));
        assert_eq!(resolve_scheme("bogus"), None);
    }

    #[test]
    fn parses_user_host_port_path() {
        let t = parse_target("sftp://afd@host1:2222/incoming/a").unwrap();
        assert_eq!(t.scheme, "sftp");
        assert_eq!(t.user.as_deref(), Some("afd"));
        assert_eq!(t.host, "host1");
        assert_eq!(t.port, Some(2222));
        assert_eq!(t.path, "/incoming/a");
    }

    #[test]
    fn parses_without_explicit_path() {
        let t = parse_target("ftp://host1").unwrap();
        assert_eq!(t.path, "/");
        assert!(t.user.is_none());
        assert!(t.port.is_none());
    }

    #[test]
    fn unknown_scheme_is_an_error() {
        assert!(parse_target("carrier-pigeon://host/x").is_err());
    }
}
