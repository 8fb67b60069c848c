//! Hand-rolled FTP/FTPS adapter (§4.E): no ecosystem FTP client appears
//! anywhere in the retrieval pack, so the control-channel protocol is
//! driven directly over the `net::connect_timeout` socket, with
//! `native-tls` wrapping it for the FTPS `AUTH TLS` upgrade.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::Path;

use native_tls::{TlsConnector, TlsStream};

use super::{ProtocolAdapter, RemoteEntry, Target, net};
use crate::error::{ProtocolError, TransferError};
use crate::state::pwb::Credential;

enum Control {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl Control {
    fn reader(&self) -> Result<BufReader<TcpStream>, ProtocolError> {
        let stream = match self {
            Control::Plain(s) => s.try_clone().map_err(ProtocolError::Io)?,
            Control::Tls(s) => s.get_ref().try_clone().map_err(ProtocolError::Io)?,
        };
        Ok(BufReader::new(stream))
    }
}

impl Write for Control {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Control::Plain(s) => s.write(buf),
            Control::Tls(s) => s.write(buf),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Control::Plain(s) => s.flush(),
            Control::Tls(s) => s.flush(),
        }
    }
}

pub struct FtpAdapter {
    explicit_tls: bool,
    control: Option<Control>,
    cwd: String,
}

impl FtpAdapter {
    pub fn new(explicit_tls: bool) -> Self {
        FtpAdapter { explicit_tls, control: None, cwd: "/".to_string() }
    }

    fn send(&mut self, line: &str) -> Result<(u32, String), ProtocolError> {
        let control = self.control.as_mut().ok_or_else(|| ProtocolError::Transfer(TransferError::ProtocolBug("ftp command before connect".into())))?;
        control.write_all(line.as_bytes()).map_err(ProtocolError::Io)?;
        control.write_all(b"\r\n").map_err(ProtocolError::Io)?;
        control.flush().map_err(ProtocolError::Io)?;
        read_reply(&mut control.reader()?)
    }

    fn enter_passive(&mut self) -> Result<TcpStream, ProtocolError> {
        let (code, text) = self.send("PASV")?;
        if code != 227 {
            return Err(ProtocolError::Transfer(TransferError::ListFailed(format!("PASV failed: {text}"))));
        }
        let (host, port) = parse_pasv(&text).ok_or_else(|| ProtocolError::Transfer(TransferError::ListFailed(format!("unparseable PASV reply: {text}"))))?;
        net::connect_timeout(&host, port)
    }
}

fn parse_pasv(text: &str) -> Option<(String, u16)> {
    let start = text.find('(')?;
    let end = text.find(')')?;
    let nums: Vec<u16> = text[start + 1..end].split(',').filter_map(|n| n.trim().parse().ok()).collect();
    if nums.len() != 6 {
        return None;
    }
    let host = format!("{}.{}.{}.{}", nums[0], nums[1], nums[2], nums[3]);
    let port = (nums[4] << 8) | nums[5];
    Some((host, port))
}

fn read_reply(reader: &mut BufReader<TcpStream>) -> Result<(u32, String), ProtocolError> {
    let mut line = String::new();
    reader.read_line(&mut line).map_err(ProtocolError::Io)?;
    let code: u32 = line.get(0..3).and_then(|s| s.parse().ok()).ok_or_else(|| ProtocolError::Transfer(TransferError::ProtocolBug(format!("unparseable ftp reply: {line}"))))?;
    // multi-line replies continue until a line with the same code followed by a space
    if line.as_bytes().get(3) == Some(&b'-') {
        loop {
            let mut cont = String::new();
            reader.read_line(&mut cont).map_err(ProtocolError::Io)?;
            if cont.starts_with(&format!("{code} ")) {
                break;
            }
        }
    }
    Ok((code, line.trim().to_string()))
}

fn parse_list_line(line: &str) -> Option<RemoteEntry> {
    // unix-style `ls -l` line, the de-facto LIST format most FTP daemons emit
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 9 {
        return None;
    }
    let is_dir = parts[0].starts_with('d');
    let size: u64 = parts[4].parse().ok()?;
    let name = parts[8..].join(" ");
    Some(RemoteEntry { name, size, mtime: 0, is_dir })
}

impl ProtocolAdapter for FtpAdapter {
    fn connect(&mut self, target: &Target, creds: Option<&Credential>) -> Result<(), ProtocolError> {
        let port = target.port.unwrap_or(21);
        let stream = net::connect_timeout(&target.host, port)?;
        let mut control = Control::Plain(stream);
        let _ = read_reply(&mut control.reader()?)?;
        self.control = Some(control);

        if self.explicit_tls {
            let (code, _) = self.send("AUTH TLS")?;
            if code != 234 {
                return Err(ProtocolError::Tls("server rejected AUTH TLS".into()));
            }
            let plain = match self.control.take().unwrap() {
                Control::Plain(s) => s,
                Control::Tls(_) => unreachable!("AUTH TLS already negotiated"),
            };
            let connector = TlsConnector::new().map_err(|e| ProtocolError::Tls(e.to_string()))?;
            let tls = connector.connect(&target.host, plain).map_err(|e| ProtocolError::Tls(e.to_string()))?;
            self.control = Some(Control::Tls(tls));
        }

        let user = target.user.as_deref().or(creds.map(|c| c.user.as_str())).unwrap_or("anonymous");
        let (code, text) = self.send(&format!("USER {user}"))?;
        if code == 331 {
            let password = creds.map(|c| c.password.as_str()).unwrap_or("anonymous@");
            let (code, text) = self.send(&format!("PASS {password}"))?;
            if code != 230 {
                return Err(ProtocolError::Transfer(TransferError::AuthFailed(text)));
            }
        } else if code != 230 {
            return Err(ProtocolError::Transfer(TransferError::AuthFailed(text)));
        }
        self.cwd = target.path.clone();
        Ok(())
    }

    fn change_dir(&mut self, path: &str) -> Result<(), ProtocolError> {
        let (code, text) = self.send(&format!("CWD {path}"))?;
        if code != 250 {
            return Err(ProtocolError::Transfer(TransferError::ListFailed(text)));
        }
        self.cwd = path.to_string();
        Ok(())
    }

    fn list(&mut self, remote_path: &str) -> Result<Vec<RemoteEntry>, ProtocolError> {
        let mut data = self.enter_passive()?;
        let (code, text) = self.send(&format!("LIST {remote_path}"))?;
        if code != 150 && code != 125 {
            return Err(ProtocolError::Transfer(TransferError::ListFailed(text)));
        }
        let mut buf = String::new();
        data.read_to_string(&mut buf).map_err(ProtocolError::Io)?;
        let (code, text) = read_reply(&mut self.control.as_ref().unwrap().reader()?)?;
        if code != 226 && code != 250 {
            return Err(ProtocolError::Transfer(TransferError::ListFailed(text)));
        }
        Ok(buf.lines().filter_map(parse_list_line).collect())
    }

    fn stat_remote(&mut self, remote_path: &str) -> Result<RemoteEntry, ProtocolError> {
        let dir = self.list(remote_path)?;
        let name = remote_path.rsplit('/').next().unwrap_or(remote_path);
        dir.into_iter().find(|e| e.name == name).ok_or_else(|| ProtocolError::Transfer(TransferError::ListFailed(format!("{remote_path} not found"))))
    }

    fn get(&mut self, remote_path: &str, local_path: &Path) -> Result<u64, ProtocolError> {
        let mut data = self.enter_passive()?;
        let (code, text) = self.send(&format!("RETR {remote_path}"))?;
        if code != 150 && code != 125 {
            return Err(ProtocolError::Transfer(TransferError::OpenRemoteFailed(text)));
        }
        let mut file = std::fs::File::create(local_path).map_err(ProtocolError::Io)?;
        let bytes = std::io::copy(&mut data, &mut file).map_err(ProtocolError::Io)?;
        let (code, text) = read_reply(&mut self.control.as_ref().unwrap().reader()?)?;
        if code != 226 && code != 250 {
            return Err(ProtocolError::Transfer(TransferError::CloseRemoteFailed(text)));
        }
        Ok(bytes)
    }

    fn put(&mut self, local_path: &Path, remote_path: &str) -> Result<u64, ProtocolError> {
        let mut data = self.enter_passive()?;
        let (code, text) = self.send(&format!("STOR {remote_path}"))?;
        if code != 150 && code != 125 {
            return Err(ProtocolError::Transfer(TransferError::OpenRemoteFailed(text)));
        }
        let mut file = std::fs::File::open(local_path).map_err(ProtocolError::Io)?;
        let bytes = std::io::copy(&mut file, &mut data).map_err(ProtocolError::Io)?;
        let (code, text) = read_reply(&mut self.control.as_ref().unwrap().reader()?)?;
        if code != 226 && code != 250 {
            return Err(ProtocolError::Transfer(TransferError::CloseRemoteFailed(text)));
        }
        Ok(bytes)
    }

    fn delete_remote(&mut self, remote_path: &str) -> Result<(), ProtocolError> {
        let (code, text) = self.send(&format!("DELE {remote_path}"))?;
        if code != 250 {
            return Err(ProtocolError::Transfer(TransferError::WriteRemoteFailed(text)));
        }
        Ok(())
    }

    fn rename_remote(&mut self, from: &str, to: &str) -> Result<(), ProtocolError> {
        let (code, text) = self.send(&format!("RNFR {from}"))?;
        if code != 350 {
            return Err(ProtocolError::Transfer(TransferError::WriteRemoteFailed(text)));
        }
        let (code, text) = self.send(&format!("RNTO {to}"))?;
        if code != 250 {
            return Err(ProtocolError::Transfer(TransferError::WriteRemoteFailed(text)));
        }
        Ok(())
    }

    fn noop(&mut self) -> Result<(), ProtocolError> {
        self.send("NOOP").map(|_| ())
    }

    fn quit(&mut self) {
        let _ = self.send("QUIT");
        self.control = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pasv_reply() {
        let (host, port) = parse_pasv("227 Entering Passive Mode (192,168,1,10,200,15)").unwrap();
        assert_eq!(host, "192.168.1.10");
        assert_eq!(port, 200 * 256 + 15);
    }

    #[test]
    fn parses_unix_style_list_line() {
        let entry = parse_list_line("-rw-r--r--   1 afd      afd          1024 Jan 01 00:00 data.dat").unwrap();
        assert_eq!(entry.name, "data.dat");
        assert_eq!(entry.size, 1024);
        assert!(!entry.is_dir);
    }

    #[test]
    fn parses_directory_list_line() {
        let entry = parse_list_line("drwxr-xr-x   2 afd      afd          4096 Jan 01 00:00 subdir").unwrap();
        assert!(entry.is_dir);
    }
}
