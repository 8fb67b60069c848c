//! `EXEC` adapter (§4.E): pipe the file to/from an arbitrary local command
//! instead of a network transport, matching the subprocess-piping style
//! `commands::handle_link` used for `ssh-copy-id` in the teacher crate.
//! The "remote path" is the command line; `put` feeds the local file to the
//! command's stdin, `get` reads the command's stdout into the local file.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use super::{ProtocolAdapter, RemoteEntry, Target};
use crate::error::{ProtocolError, TransferError};
use crate::state::pwb::Credential;

pub struct ExecAdapter {
    shell_prefix: String,
}

impl ExecAdapter {
    pub fn new() -> Self {
        ExecAdapter { shell_prefix: String::new() }
    }
}

impl Default for ExecAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolAdapter for ExecAdapter {
    fn connect(&mut self, target: &Target, _creds: Option<&Credential>) -> Result<(), ProtocolError> {
        self.shell_prefix = target.path.clone();
        Ok(())
    }

    fn change_dir(&mut self, _path: &str) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn list(&mut self, _remote_path: &str) -> Result<Vec<RemoteEntry>, ProtocolError> {
        Err(ProtocolError::NotImplemented { scheme: "exec", op: "list" })
    }

    fn stat_remote(&mut self, _remote_path: &str) -> Result<RemoteEntry, ProtocolError> {
        Err(ProtocolError::NotImplemented { scheme: "exec", op: "stat_remote" })
    }

    fn get(&mut self, remote_path: &str, local_path: &Path) -> Result<u64, ProtocolError> {
        let output = Command::new("sh").arg("-c").arg(remote_path).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).output().map_err(ProtocolError::Io)?;
        if !output.status.success() {
            return Err(ProtocolError::Transfer(TransferError::OpenRemoteFailed(String::from_utf8_lossy(&output.stderr).into_owned())));
        }
        std::fs::write(local_path, &output.stdout).map_err(ProtocolError::Io)?;
        Ok(output.stdout.len() as u64)
    }

    /// Spawn `remote_path` as a shell command and pipe `local_path`'s bytes
    /// into its stdin, exactly the shape `EXEC` jobs describe in DIR_CONFIG
    /// (the recipient URL's path component is the command line).
    fn put(&mut self, local_path: &Path, remote_path: &str) -> Result<u64, ProtocolError> {
        let data = std::fs::read(local_path).map_err(ProtocolError::Io)?;
        let mut child = Command::new("sh").arg("-c").arg(remote_path).stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped()).spawn().map_err(ProtocolError::Io)?;
        {
            let stdin = child.stdin.as_mut().ok_or_else(|| ProtocolError::Transfer(TransferError::ProtocolBug("exec: no stdin handle".into())))?;
            stdin.write_all(&data).map_err(ProtocolError::Io)?;
        }
        let output = child.wait_with_output().map_err(ProtocolError::Io)?;
        if !output.status.success() {
            return Err(ProtocolError::Transfer(TransferError::WriteRemoteFailed(String::from_utf8_lossy(&output.stderr).into_owned())));
        }
        Ok(data.len() as u64)
    }

    fn delete_remote(&mut self, _remote_path: &str) -> Result<(), ProtocolError> {
        Err(ProtocolError::NotImplemented { scheme: "exec", op: "delete_remote" })
    }

    fn rename_remote(&mut self, _from: &str, _to: &str) -> Result<(), ProtocolError> {
        Err(ProtocolError::NotImplemented { scheme: "exec", op: "rename_remote" })
    }

    fn noop(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn quit(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_pipes_file_contents_into_command_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.dat");
        std::fs::write(&src, b"payload").unwrap();
        let out = dir.path().join("out.dat");
        let mut adapter = ExecAdapter::new();
        let cmd = format!("cat > {}", out.display());
        let written = adapter.put(&src, &cmd).unwrap();
        assert_eq!(written, 7);
        assert_eq!(std::fs::read(&out).unwrap(), b"payload");
    }

    #[test]
    fn put_surfaces_nonzero_exit_as_write_remote_failed() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.dat");
        std::fs::write(&src, b"x").unwrap();
        let mut adapter = ExecAdapter::new();
        let err = adapter.put(&src, "exit 7").unwrap_err();
        assert!(matches!(err, ProtocolError::Transfer(TransferError::WriteRemoteFailed(_))));
    }
}
