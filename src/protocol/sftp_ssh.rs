//! `SFTP`/`SCP` adapter (§4.E(2)), the hardest-to-get-right protocol in this
//! crate. Two paths share one `ProtocolAdapter`:
//!
//! - the common case, a host whose key is already in `known_hosts` and
//!   which accepts agent or password authentication, goes straight through
//!   `ssh2`'s binary protocol — the same crate and session shape the
//!   teacher crate drove for `scp_send`/`scp_recv`.
//! - a host seen for the first time, or one whose password needs
//!   confirming, is bootstrapped once through a pty-driven `ssh` subprocess
//!   (mirroring the teacher's `Command::new("ssh")` launch in
//!   `commands::handle_go`) that answers only the two prompts this system
//!   may answer unattended — the host-key "yes/no" question and a password
//!   prompt — and refuses to proceed past anything else, per spec.md
//!   §4.E(2): never leak the child, never block indefinitely, never
//!   proceed past an unrecognized prompt, never print the password in a
//!   diagnostic.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::openpty;
use nix::unistd::setsid;
use ssh2::{CheckResult, KnownHostFileKind, Session};

use super::{ProtocolAdapter, RemoteEntry, Target, net};
use crate::error::{ProtocolError, SshDriverError, TransferError};
use crate::state::pwb::Credential;

const PTY_TIMEOUT: Duration = Duration::from_secs(20);
const PTY_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct SshAdapter {
    scp: bool,
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    session: Option<Session>,
}

impl SshAdapter {
    pub fn new(scp: bool) -> Self {
        SshAdapter { scp, host: String::new(), port: 22, user: "afd".to_string(), password: None, session: None }
    }

    fn known_hosts_path() -> std::path::PathBuf {
        dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from(".")).join(".ssh").join("known_hosts")
    }

    fn session(&mut self) -> Result<&mut Session, ProtocolError> {
        self.session.as_mut().ok_or_else(|| ProtocolError::Transfer(TransferError::ProtocolBug("ssh operation before connect".into())))
    }

    fn sftp(&mut self) -> Result<ssh2::Sftp, ProtocolError> {
        self.session()?.sftp().map_err(|e| ProtocolError::Transfer(TransferError::OpenRemoteFailed(e.to_string())))
    }

    /// Handshake, verify the host key against `known_hosts`, and
    /// authenticate via agent or stored password. Returns
    /// `HostKeyMismatch`/`AuthFailed` rather than prompting, so the caller
    /// decides whether the interactive bootstrap is worth running.
    fn try_direct(&self, tcp: TcpStream) -> Result<Session, ProtocolError> {
        let mut session = Session::new().map_err(|e| ProtocolError::Ssh(SshDriverError::Pty(e.to_string())))?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| ProtocolError::Transfer(TransferError::ConnectReset(e.to_string())))?;

        {
            let mut known_hosts = session.known_hosts().map_err(|e| ProtocolError::Ssh(SshDriverError::Pty(e.to_string())))?;
            let _ = known_hosts.read_file(&Self::known_hosts_path(), KnownHostFileKind::OpenSSH);
            let (key, _) = session.host_key().ok_or_else(|| ProtocolError::Transfer(TransferError::HostKeyMismatch("server presented no host key".into())))?;
            match known_hosts.check(&self.host, key) {
                CheckResult::Match => {}
                CheckResult::NotFound | CheckResult::Mismatch | CheckResult::Failure => {
                    return Err(ProtocolError::Transfer(TransferError::HostKeyMismatch(format!("{} not trusted", self.host))));
                }
            }
        }

        if let Ok(mut agent) = session.agent() {
            if agent.connect().is_ok() && agent.list_identities().is_ok() {
                for identity in agent.identities().unwrap_or_default() {
                    if agent.userauth(&self.user, &identity).is_ok() {
                        return Ok(session);
                    }
                }
            }
        }
        if let Some(password) = &self.password {
            session.userauth_password(&self.user, password).map_err(|e| ProtocolError::Transfer(TransferError::AuthFailed(e.to_string())))?;
            return Ok(session);
        }
        Err(ProtocolError::Transfer(TransferError::AuthFailed("no agent identity and no stored password".into())))
    }

    /// Bootstrap trust for a host seen for the first time or whose password
    /// has never been confirmed: drive a real `ssh` subprocess over a pty,
    /// answering the host-key confirmation and/or password prompt, then
    /// hand the connection back to `try_direct` on the next attempt (which
    /// will now find the key in `known_hosts` and reuse the confirmed
    /// password).
    fn bootstrap_trust(&self) -> Result<(), SshDriverError> {
        let pty = openpty(None, None).map_err(|e| SshDriverError::Pty(e.to_string()))?;
        let master: OwnedFd = pty.master;
        let slave: OwnedFd = pty.slave;

        let master_fd = master.as_raw_fd();
        set_nonblocking(master_fd).map_err(|e| SshDriverError::Pty(e.to_string()))?;

        let target = format!("{}@{}", self.user, self.host);
        let mut cmd = Command::new("ssh");
        cmd.arg("-p").arg(self.port.to_string()).arg("-o").arg("NumberOfPasswordPrompts=1").arg(&target).arg("exit");

        let slave_fd = slave.into_raw_fd();
        // Safety: `slave_fd` is a valid, open fd for the lifetime of this
        // spawn call; three independent `from_raw_fd` calls each take
        // ownership of a dup'd copy via `Stdio`, never the same fd twice.
        unsafe {
            cmd.stdin(Stdio::from_raw_fd(dup_fd(slave_fd)?));
            cmd.stdout(Stdio::from_raw_fd(dup_fd(slave_fd)?));
            cmd.stderr(Stdio::from_raw_fd(dup_fd(slave_fd)?));
            cmd.pre_exec(|| {
                setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }
        let mut child: Child = cmd.spawn().map_err(SshDriverError::Spawn)?;
        let _ = nix::unistd::close(slave_fd);

        // Safety: `master_fd` is owned by `master` above and stays valid
        // for the read loop below; wrapped once, dropped once.
        let mut master_file = unsafe { std::fs::File::from_raw_fd(master.into_raw_fd()) };

        let start = Instant::now();
        let mut transcript = String::new();
        let mut answered_host_key = false;
        let mut answered_password = false;

        loop {
            if let Some(status) = child.try_wait().map_err(SshDriverError::Spawn)? {
                return if status.success() { Ok(()) } else { Err(SshDriverError::ChildExitedEarly(status)) };
            }
            if start.elapsed() > PTY_TIMEOUT {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SshDriverError::Timeout);
            }

            let mut buf = [0u8; 512];
            match master_file.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => transcript.push_str(&String::from_utf8_lossy(&buf[..n])),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(PTY_POLL_INTERVAL);
                    continue;
                }
                Err(e) => {
                    let _ = child.kill();
                    return Err(SshDriverError::Pty(e.to_string()));
                }
            }

            let lower = transcript.to_ascii_lowercase();
            if !answered_host_key && lower.contains("(yes/no") {
                master_file.write_all(b"yes\n").map_err(|e| SshDriverError::Pty(e.to_string()))?;
                answered_host_key = true;
                transcript.clear();
                continue;
            }
            if !answered_password && lower.contains("password:") {
                let password = self.password.as_deref().unwrap_or("");
                master_file.write_all(password.as_bytes()).map_err(|e| SshDriverError::Pty(e.to_string()))?;
                master_file.write_all(b"\n").map_err(|e| SshDriverError::Pty(e.to_string()))?;
                answered_password = true;
                transcript.clear();
                continue;
            }
            if lower.contains("permission denied") {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SshDriverError::AuthFailed);
            }
            if lower.contains("host key verification failed") {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SshDriverError::HostKeyRejected(self.host.clone()));
            }
            // Long stretches of unrecognized output (banners, motd) are
            // expected; only a line that looks like a fresh, unhandled
            // prompt after both known prompts are already answered is
            // treated as unsafe to proceed past.
            if answered_host_key && answered_password && lower.trim_end().ends_with('?') {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SshDriverError::UnknownPrompt(transcript.trim().to_string()));
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(std::io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(std::io::Error::from)?;
    Ok(())
}

fn dup_fd(fd: RawFd) -> Result<RawFd, SshDriverError> {
    nix::unistd::dup(fd).map_err(|e| SshDriverError::Pty(e.to_string()))
}

impl ProtocolAdapter for SshAdapter {
    fn connect(&mut self, target: &Target, creds: Option<&Credential>) -> Result<(), ProtocolError> {
        self.host = target.host.clone();
        self.port = target.port.unwrap_or(22);
        self.user = target.user.clone().or_else(|| creds.map(|c| c.user.clone())).unwrap_or_else(|| "afd".to_string());
        self.password = creds.map(|c| c.password.clone());

        let tcp = net::connect_timeout(&self.host, self.port)?;
        match self.try_direct(tcp) {
            Ok(session) => {
                self.session = Some(session);
                return Ok(());
            }
            Err(ProtocolError::Transfer(TransferError::HostKeyMismatch(_))) | Err(ProtocolError::Transfer(TransferError::AuthFailed(_))) => {
                self.bootstrap_trust().map_err(ProtocolError::Ssh)?;
            }
            Err(e) => return Err(e),
        }

        let tcp = net::connect_timeout(&self.host, self.port)?;
        let session = self.try_direct(tcp)?;
        self.session = Some(session);
        Ok(())
    }

    fn change_dir(&mut self, _path: &str) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn list(&mut self, remote_path: &str) -> Result<Vec<RemoteEntry>, ProtocolError> {
        if self.scp {
            return Err(ProtocolError::NotImplemented { scheme: "scp", op: "list" });
        }
        let sftp = self.sftp()?;
        let entries = sftp.readdir(Path::new(remote_path)).map_err(|e| ProtocolError::Transfer(TransferError::ListFailed(e.to_string())))?;
        Ok(entries
            .into_iter()
            .map(|(path, stat)| RemoteEntry {
                name: path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
                size: stat.size.unwrap_or(0),
                mtime: stat.mtime.unwrap_or(0) as i64,
                is_dir: stat.is_dir(),
            })
            .collect())
    }

    fn stat_remote(&mut self, remote_path: &str) -> Result<RemoteEntry, ProtocolError> {
        let sftp = self.sftp()?;
        let stat = sftp.stat(Path::new(remote_path)).map_err(|e| ProtocolError::Transfer(TransferError::ListFailed(e.to_string())))?;
        let name = remote_path.rsplit('/').next().unwrap_or(remote_path).to_string();
        Ok(RemoteEntry { name, size: stat.size.unwrap_or(0), mtime: stat.mtime.unwrap_or(0) as i64, is_dir: stat.is_dir() })
    }

    fn get(&mut self, remote_path: &str, local_path: &Path) -> Result<u64, ProtocolError> {
        let mut file = std::fs::File::create(local_path).map_err(ProtocolError::Io)?;
        if self.scp {
            let session = self.session()?;
            let (mut channel, stat) = session.scp_recv(Path::new(remote_path)).map_err(|e| ProtocolError::Transfer(TransferError::OpenRemoteFailed(e.to_string())))?;
            let bytes = std::io::copy(&mut channel, &mut file).map_err(ProtocolError::Io)?;
            channel.send_eof().ok();
            channel.wait_eof().ok();
            channel.close().ok();
            channel.wait_close().ok();
            if bytes != stat.size() {
                return Err(ProtocolError::Transfer(TransferError::SizeMismatch { expected: stat.size(), actual: bytes }));
            }
            Ok(bytes)
        } else {
            let sftp = self.sftp()?;
            let mut remote = sftp.open(Path::new(remote_path)).map_err(|e| ProtocolError::Transfer(TransferError::OpenRemoteFailed(e.to_string())))?;
            std::io::copy(&mut remote, &mut file).map_err(ProtocolError::Io)
        }
    }

    fn put(&mut self, local_path: &Path, remote_path: &str) -> Result<u64, ProtocolError> {
        let mut local = std::fs::File::open(local_path).map_err(ProtocolError::Io)?;
        let meta = local.metadata().map_err(ProtocolError::Io)?;
        if self.scp {
            let session = self.session()?;
            let mut channel = session.scp_send(Path::new(remote_path), 0o644, meta.len(), None).map_err(|e| ProtocolError::Transfer(TransferError::OpenRemoteFailed(e.to_string())))?;
            let bytes = std::io::copy(&mut local, &mut channel).map_err(ProtocolError::Io)?;
            channel.send_eof().ok();
            channel.wait_eof().ok();
            channel.close().ok();
            channel.wait_close().ok();
            Ok(bytes)
        } else {
            let sftp = self.sftp()?;
            let tmp_path = format!("{remote_path}.afdtmp");
            {
                let mut remote = sftp.create(Path::new(&tmp_path)).map_err(|e| ProtocolError::Transfer(TransferError::OpenRemoteFailed(e.to_string())))?;
                std::io::copy(&mut local, &mut remote).map_err(ProtocolError::Io)?;
            }
            sftp.rename(Path::new(&tmp_path), Path::new(remote_path), None).map_err(|e| ProtocolError::Transfer(TransferError::CloseRemoteFailed(e.to_string())))?;
            Ok(meta.len())
        }
    }

    fn delete_remote(&mut self, remote_path: &str) -> Result<(), ProtocolError> {
        if self.scp {
            return Err(ProtocolError::NotImplemented { scheme: "scp", op: "delete_remote" });
        }
        let sftp = self.sftp()?;
        sftp.unlink(Path::new(remote_path)).map_err(|e| ProtocolError::Transfer(TransferError::WriteRemoteFailed(e.to_string())))
    }

    fn rename_remote(&mut self, from: &str, to: &str) -> Result<(), ProtocolError> {
        if self.scp {
            return Err(ProtocolError::NotImplemented { scheme: "scp", op: "rename_remote" });
        }
        let sftp = self.sftp()?;
        sftp.rename(Path::new(from), Path::new(to), None).map_err(|e| ProtocolError::Transfer(TransferError::WriteRemoteFailed(e.to_string())))
    }

    fn noop(&mut self) -> Result<(), ProtocolError> {
        self.session()?;
        Ok(())
    }

    fn quit(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "afd transfer complete", None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scp_scheme_rejects_directory_style_operations() {
        let mut adapter = SshAdapter::new(true);
        let err = adapter.list(".").unwrap_err();
        assert!(matches!(err, ProtocolError::NotImplemented { scheme: "scp", op: "list" }));
    }

    #[test]
    fn sftp_scheme_requires_connect_before_stat() {
        let mut adapter = SshAdapter::new(false);
        let err = adapter.stat_remote("/x").unwrap_err();
        assert!(matches!(err, ProtocolError::Transfer(TransferError::ProtocolBug(_))));
    }
}
