//! Per-subsystem error enums, hand-rolled in the style of a small crate that
//! does not pull in `thiserror`: each variant carries just enough context to
//! log or format a diagnostic, and a couple of `is_retriable_*` predicates
//! classify variants for the scheduler/worker retry policy.

use std::path::PathBuf;

/// Errors from attaching to or publishing a shared, memory-mapped state area
/// (FSA/FRA/JID/DNB/FMD — see `state`).
#[derive(Debug)]
pub enum StateAreaError {
    Missing(PathBuf),
    Truncated(PathBuf),
    IncompatibleVersion { path: PathBuf, expected: u8, found: u8 },
    TypesizeMismatch { area: &'static str, expected: usize, found: usize },
    Stale(PathBuf),
    Io(PathBuf, std::io::Error),
}

impl std::fmt::Display for StateAreaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use StateAreaError::*;
        match self {
            Missing(p) => write!(f, "state area missing: {}", p.display()),
            Truncated(p) => write!(f, "state area truncated: {}", p.display()),
            IncompatibleVersion { path, expected, found } => write!(
                f,
                "state area {} has schema version {} but runtime expects {}",
                path.display(),
                found,
                expected
            ),
            TypesizeMismatch { area, expected, found } => write!(
                f,
                "typesize self-test failed for {area}: on-disk record size {found} does not match runtime size {expected}"
            ),
            Stale(p) => write!(f, "state area stale, re-attach required: {}", p.display()),
            Io(p, e) => write!(f, "state area io error at {}: {}", p.display(), e),
        }
    }
}

impl std::error::Error for StateAreaError {}

impl StateAreaError {
    /// Stale is not a failure, it's a protocol signal callers must act on by
    /// re-attaching; everything else here is fatal to the calling process.
    pub fn is_stale(&self) -> bool {
        matches!(self, StateAreaError::Stale(_))
    }
}

/// Errors from the DIR_CONFIG recursive-descent parser and the staged
/// publish sequence (config loader / AMG role, `dirconfig`).
#[derive(Debug)]
pub enum DirConfigError {
    ParseError { file: PathBuf, line: usize, msg: String },
    MissingWorkDir(PathBuf),
    PermissionDenied(PathBuf),
    Io(PathBuf, std::io::Error),
}

impl std::fmt::Display for DirConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use DirConfigError::*;
        match self {
            ParseError { file, line, msg } => {
                write!(f, "{}:{}: {}", file.display(), line, msg)
            }
            MissingWorkDir(p) => write!(f, "work directory missing: {}", p.display()),
            PermissionDenied(p) => write!(f, "permission denied: {}", p.display()),
            Io(p, e) => write!(f, "io error at {}: {}", p.display(), e),
        }
    }
}

impl std::error::Error for DirConfigError {}

impl DirConfigError {
    /// Per spec.md §4.B: parse errors leave the old generation in force and
    /// are only logged; only I/O-class failures are fatal to the loader.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DirConfigError::MissingWorkDir(_) | DirConfigError::PermissionDenied(_) | DirConfigError::Io(_, _)
        )
    }
}

/// Errors surfaced by a transfer worker (§4.D), classified the way the
/// scheduler needs them: pre-transfer (session/login/list) vs during-transfer
/// (read/write/rename), each retriable or not.
#[derive(Debug, Clone)]
pub enum TransferError {
    ConnectRefused(String),
    ConnectTimeout(String),
    ConnectReset(String),
    AuthFailed(String),
    HostKeyMismatch(String),
    ListFailed(String),
    OpenRemoteFailed(String),
    WriteRemoteFailed(String),
    CloseRemoteFailed(String),
    SizeMismatch { expected: u64, actual: u64 },
    FileBusy(String),
    LocalIo(String),
    DiskFull,
    ArchiveFull,
    StateAreaCorrupt(String),
    UnknownPrompt(String),
    ProtocolBug(String),
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use TransferError::*;
        match self {
            ConnectRefused(h) => write!(f, "connect refused: {h}"),
            ConnectTimeout(h) => write!(f, "connect timed out: {h}"),
            ConnectReset(h) => write!(f, "connection reset: {h}"),
            AuthFailed(h) => write!(f, "authentication failed: {h}"),
            HostKeyMismatch(h) => write!(f, "host key mismatch: {h}"),
            ListFailed(m) => write!(f, "remote list failed: {m}"),
            OpenRemoteFailed(m) => write!(f, "open remote failed: {m}"),
            WriteRemoteFailed(m) => write!(f, "write remote failed: {m}"),
            CloseRemoteFailed(m) => write!(f, "close remote failed: {m}"),
            SizeMismatch { expected, actual } => {
                write!(f, "size mismatch: expected {expected}, got {actual}")
            }
            FileBusy(n) => write!(f, "remote file busy: {n}"),
            LocalIo(m) => write!(f, "local io error: {m}"),
            DiskFull => write!(f, "local disk full"),
            ArchiveFull => write!(f, "archive filesystem full"),
            StateAreaCorrupt(m) => write!(f, "state area corruption: {m}"),
            UnknownPrompt(p) => write!(f, "unrecognized ssh prompt: {p}"),
            ProtocolBug(m) => write!(f, "protocol violation: {m}"),
        }
    }
}

impl std::error::Error for TransferError {}

impl TransferError {
    /// Transient transport errors are retriable and feed the host-toggle
    /// error counter; auth/semantic/local/corruption errors are not.
    pub fn is_retriable_pre_transfer(&self) -> bool {
        use TransferError::*;
        matches!(self, ConnectRefused(_) | ConnectTimeout(_) | ConnectReset(_) | ListFailed(_))
    }

    pub fn is_retriable_during_transfer(&self) -> bool {
        use TransferError::*;
        matches!(self, ConnectReset(_) | FileBusy(_) | CloseRemoteFailed(_) | SizeMismatch { .. })
    }

    /// Authentication and state corruption never count toward the
    /// host-toggle threshold — they need operator intervention, not retries.
    pub fn counts_toward_host_toggle(&self) -> bool {
        use TransferError::*;
        matches!(self, ConnectRefused(_) | ConnectTimeout(_) | ConnectReset(_))
    }

    /// Dense exit-code enumeration for the cross-process FIN-fifo contract
    /// (§6, §7): the only boundary where "exit code as error kind" is kept.
    pub fn exit_code(&self) -> i32 {
        use TransferError::*;
        match self {
            ConnectRefused(_) => 10,
            ConnectTimeout(_) => 11,
            ConnectReset(_) => 12,
            AuthFailed(_) => 20,
            HostKeyMismatch(_) => 21,
            ListFailed(_) => 30,
            OpenRemoteFailed(_) => 31,
            WriteRemoteFailed(_) => 32,
            CloseRemoteFailed(_) => 33,
            SizeMismatch { .. } => 34,
            FileBusy(_) => 35,
            LocalIo(_) => 40,
            DiskFull => 41,
            ArchiveFull => 42,
            StateAreaCorrupt(_) => 50,
            UnknownPrompt(_) => 60,
            ProtocolBug(_) => 61,
        }
    }
}

/// Errors specific to driving the `ssh` subprocess over a pty (§4.E(2)).
#[derive(Debug)]
pub enum SshDriverError {
    Spawn(std::io::Error),
    Pty(String),
    ChildExitedEarly(std::process::ExitStatus),
    AuthFailed,
    HostKeyRejected(String),
    UnknownPrompt(String),
    Timeout,
}

impl std::fmt::Display for SshDriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use SshDriverError::*;
        match self {
            Spawn(e) => write!(f, "failed to spawn ssh: {e}"),
            Pty(m) => write!(f, "pty error: {m}"),
            ChildExitedEarly(status) => write!(f, "ssh child exited early: {status}"),
            AuthFailed => write!(f, "ssh authentication failed"),
            HostKeyRejected(fp) => write!(f, "host key rejected: {fp}"),
            UnknownPrompt(line) => write!(f, "unrecognized prompt line: {line}"),
            Timeout => write!(f, "timed out waiting on pty"),
        }
    }
}

impl std::error::Error for SshDriverError {}

/// Errors from protocol adapters not otherwise covered by `TransferError`
/// (adapter-construction failures, unsupported operations).
#[derive(Debug)]
pub enum ProtocolError {
    NotImplemented { scheme: &'static str, op: &'static str },
    UnknownScheme(String),
    Transfer(TransferError),
    Ssh(SshDriverError),
    Tls(String),
    Io(std::io::Error),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ProtocolError::*;
        match self {
            NotImplemented { scheme, op } => write!(f, "{scheme}: {op} not implemented"),
            UnknownScheme(s) => write!(f, "unknown url scheme: {s}"),
            Transfer(e) => write!(f, "{e}"),
            Ssh(e) => write!(f, "{e}"),
            Tls(m) => write!(f, "tls error: {m}"),
            Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<TransferError> for ProtocolError {
    fn from(e: TransferError) -> Self {
        ProtocolError::Transfer(e)
    }
}

impl From<SshDriverError> for ProtocolError {
    fn from(e: SshDriverError) -> Self {
        ProtocolError::Ssh(e)
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

/// Errors from the supervisor's startup/fifo-command surface (§4.I, §6).
#[derive(Debug)]
pub enum SupervisorError {
    NoRunningInstance,
    WorkDirUnwritable(PathBuf),
    FifoCreate(PathBuf, std::io::Error),
    ComponentFailed(&'static str),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use SupervisorError::*;
        match self {
            NoRunningInstance => write!(f, "no running instance detected"),
            WorkDirUnwritable(p) => write!(f, "work directory not writable: {}", p.display()),
            FifoCreate(p, e) => write!(f, "failed to create fifo {}: {}", p.display(), e),
            ComponentFailed(name) => write!(f, "component failed to start: {name}"),
        }
    }
}

impl std::error::Error for SupervisorError {}

impl SupervisorError {
    /// Exit code contract from spec.md §4.I/§6: 0 success, 2 no running
    /// instance, otherwise a non-zero failure kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorError::NoRunningInstance => 2,
            _ => 1,
        }
    }
}
