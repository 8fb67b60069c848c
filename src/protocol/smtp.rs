//! `SMTP`/`SMTPS` adapter (§4.E): `lettre`, the standard Rust SMTP crate.
//! A "put" is an outbound message with the local file as an attachment;
//! SMTP has no notion of get/list/delete, so those return `NotImplemented`
//! per the "only the interfaces the core consumes/exposes" rule for the
//! protocols outside this crate's hard-engineering scope.

use std::path::Path;

use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{Message, SmtpTransport, Transport};

use super::{ProtocolAdapter, RemoteEntry, Target};
use crate::error::{ProtocolError, TransferError};
use crate::state::pwb::Credential;

pub struct SmtpAdapter {
    tls: bool,
    host: String,
    port: u16,
    from: String,
    creds: Option<SmtpCredentials>,
}

impl SmtpAdapter {
    pub fn new(tls: bool) -> Self {
        SmtpAdapter { tls, host: String::new(), port: if tls { 465 } else { 25 }, from: "afd@localhost".to_string(), creds: None }
    }

    fn transport(&self) -> Result<SmtpTransport, ProtocolError> {
        let builder = if self.tls {
            SmtpTransport::relay(&self.host).map_err(|e| ProtocolError::Tls(e.to_string()))?
        } else {
            SmtpTransport::builder_dangerous(&self.host)
        };
        let builder = builder.port(self.port);
        let builder = if let Some(creds) = &self.creds { builder.credentials(creds.clone()) } else { builder };
        Ok(builder.build())
    }
}

impl ProtocolAdapter for SmtpAdapter {
    fn connect(&mut self, target: &Target, creds: Option<&Credential>) -> Result<(), ProtocolError> {
        self.host = target.host.clone();
        self.port = target.port.unwrap_or(self.port);
        if let Some(c) = creds {
            self.from = format!("{}@{}", c.user, self.host);
            self.creds = Some(SmtpCredentials::new(c.user.clone(), c.password.clone()));
        }
        let transport = self.transport()?;
        transport.test_connection().map_err(|e| ProtocolError::Transfer(TransferError::ConnectRefused(e.to_string())))?;
        Ok(())
    }

    fn change_dir(&mut self, _path: &str) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn list(&mut self, _remote_path: &str) -> Result<Vec<RemoteEntry>, ProtocolError> {
        Err(ProtocolError::NotImplemented { scheme: "smtp", op: "list" })
    }

    fn stat_remote(&mut self, _remote_path: &str) -> Result<RemoteEntry, ProtocolError> {
        Err(ProtocolError::NotImplemented { scheme: "smtp", op: "stat_remote" })
    }

    fn get(&mut self, _remote_path: &str, _local_path: &Path) -> Result<u64, ProtocolError> {
        Err(ProtocolError::NotImplemented { scheme: "smtp", op: "get" })
    }

    /// `remote_path` is the recipient address; `local_path` becomes a
    /// single attachment on an otherwise empty-bodied message, the DE-Mail-
    /// adjacent delivery shape this adapter exists for (§4.E).
    fn put(&mut self, local_path: &Path, remote_path: &str) -> Result<u64, ProtocolError> {
        let data = std::fs::read(local_path).map_err(ProtocolError::Io)?;
        let len = data.len() as u64;
        let filename = local_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "attachment".to_string());
        let attachment = Attachment::new(filename).body(data, "application/octet-stream".parse().unwrap());
        let email = Message::builder()
            .from(self.from.parse().map_err(|_| ProtocolError::Transfer(TransferError::ProtocolBug("invalid from address".into())))?)
            .to(remote_path.parse().map_err(|_| ProtocolError::Transfer(TransferError::ProtocolBug(format!("invalid recipient: {remote_path}"))))?)
            .subject("AFD transfer")
            .multipart(MultiPart::mixed().singlepart(SinglePart::plain(String::new())).singlepart(attachment))
            .map_err(|e| ProtocolError::Transfer(TransferError::ProtocolBug(e.to_string())))?;
        let transport = self.transport()?;
        transport.send(&email).map_err(|e| ProtocolError::Transfer(TransferError::WriteRemoteFailed(e.to_string())))?;
        Ok(len)
    }

    fn delete_remote(&mut self, _remote_path: &str) -> Result<(), ProtocolError> {
        Err(ProtocolError::NotImplemented { scheme: "smtp", op: "delete_remote" })
    }

    fn rename_remote(&mut self, _from: &str, _to: &str) -> Result<(), ProtocolError> {
        Err(ProtocolError::NotImplemented { scheme: "smtp", op: "rename_remote" })
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
    fn get_is_not_implemented() {
        let mut adapter = SmtpAdapter::new(false);
        let err = adapter.get("x", Path::new("/tmp/x")).unwrap_err();
        assert!(matches!(err, ProtocolError::NotImplemented { scheme: "smtp", op: "get" }));
    }

    #[test]
    fn default_port_matches_tls_setting() {
        assert_eq!(SmtpAdapter::new(true).port, 465);
        assert_eq!(SmtpAdapter::new(false).port, 25);
    }
}
