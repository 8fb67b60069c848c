//! Thin stub adapters for the bit-level wire protocols spec.md §1 declares
//! out of scope (`WMO`, `MAP`, `DFAX`, `DE-Mail`): only the
//! `ProtocolAdapter` interface is implemented here, each operation beyond
//! `connect`/`noop`/`quit` returning `NotImplemented`, per "only the
//! interfaces the core consumes/exposes are specified" (§1).

use std::path::Path;

use super::{ProtocolAdapter, RemoteEntry, Target};
use crate::error::ProtocolError;
use crate::state::pwb::Credential;

pub struct StubAdapter {
    scheme: &'static str,
}

impl StubAdapter {
    pub fn new(scheme: &str) -> Self {
        let scheme = match scheme {
            "wmo" => "wmo",
            "map" => "map",
            "dfax" => "dfax",
            "demail" => "demail",
            _ => "unknown",
        };
        StubAdapter { scheme }
    }
}

impl ProtocolAdapter for StubAdapter {
    fn connect(&mut self, _target: &Target, _creds: Option<&Credential>) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn change_dir(&mut self, _path: &str) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn list(&mut self, _remote_path: &str) -> Result<Vec<RemoteEntry>, ProtocolError> {
        Err(ProtocolError::NotImplemented { scheme: self.scheme, op: "list" })
    }

    fn stat_remote(&mut self, _remote_path: &str) -> Result<RemoteEntry, ProtocolError> {
        Err(ProtocolError::NotImplemented { scheme: self.scheme, op: "stat_remote" })
    }

    fn get(&mut self, _remote_path: &str, _local_path: &Path) -> Result<u64, ProtocolError> {
        Err(ProtocolError::NotImplemented { scheme: self.scheme, op: "get" })
    }

    fn put(&mut self, _local_path: &Path, _remote_path: &str) -> Result<u64, ProtocolError> {
        Err(ProtocolError::NotImplemented { scheme: self.scheme, op: "put" })
    }

    fn delete_remote(&mut self, _remote_path: &str) -> Result<(), ProtocolError> {
        Err(ProtocolError::NotImplemented { scheme: self.scheme, op: "delete_remote" })
    }

    fn rename_remote(&mut self, _from: &str, _to: &str) -> Result<(), ProtocolError> {
        Err(ProtocolError::NotImplemented { scheme: self.scheme, op: "rename_remote" })
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
    fn stub_connect_and_noop_succeed_but_transfers_are_not_implemented() {
        let mut adapter = StubAdapter::new("wmo");
        let target = super::super::parse_target("wmo://host/x").unwrap();
        adapter.connect(&target, None).unwrap();
        adapter.noop().unwrap();
        assert!(adapter.put(Path::new("/tmp/a"), "x").is_err());
    }
}
