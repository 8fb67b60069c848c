//! PWB — the credential store. A `rusqlite` table rather than a mmap'd area:
//! credentials are a naturally queryable, small, rarely-iterated set, the
//! same shape the teacher crate used `rusqlite` for (`ServerCollection`).

use rusqlite::{Connection, OptionalExtension, params};

pub struct CredentialStore {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub host: String,
    pub protocol: String,
    pub password: String,
}

impl CredentialStore {
    pub fn open(path: &std::path::Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS credentials (
                user TEXT NOT NULL,
                host TEXT NOT NULL,
                protocol TEXT NOT NULL,
                password TEXT NOT NULL,
                PRIMARY KEY (user, host, protocol)
            )",
            [],
        )?;
        Ok(CredentialStore { conn })
    }

    pub fn put(&self, cred: &Credential) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO credentials (user, host, protocol, password) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user, host, protocol) DO UPDATE SET password = excluded.password",
            params![cred.user, cred.host, cred.protocol, cred.password],
        )?;
        Ok(())
    }

    /// Only ever called from a code path gated on the caller having the
    /// `view_passwd` capability (§4.E); the store itself does not enforce
    /// that gate since it has no notion of caller identity.
    pub fn get(&self, user: &str, host: &str, protocol: &str) -> rusqlite::Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT password FROM credentials WHERE user = ?1 AND host = ?2 AND protocol = ?3",
                params![user, host, protocol],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn remove(&self, user: &str, host: &str, protocol: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "DELETE FROM credentials WHERE user = ?1 AND host = ?2 AND protocol = ?3",
            params![user, host, protocol],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let store = CredentialStore::open(std::path::Path::new(":memory:")).unwrap();
        let cred = Credential { user: "afd".into(), host: "h1".into(), protocol: "sftp".into(), password: "s3cr3t".into() };
        store.put(&cred).unwrap();
        assert_eq!(store.get("afd", "h1", "sftp").unwrap(), Some("s3cr3t".to_string()));
        assert_eq!(store.get("afd", "h1", "ftp").unwrap(), None);
    }

    #[test]
    fn put_overwrites_existing() {
        let store = CredentialStore::open(std::path::Path::new(":memory:")).unwrap();
        let mut cred = Credential { user: "afd".into(), host: "h1".into(), protocol: "sftp".into(), password: "old".into() };
        store.put(&cred).unwrap();
        cred.password = "new".into();
        store.put(&cred).unwrap();
        assert_eq!(store.get("afd", "h1", "sftp").unwrap(), Some("new".to_string()));
    }
}
