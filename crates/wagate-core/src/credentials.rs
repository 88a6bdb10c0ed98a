//! Persisted credential storage, one slot per identity.

use crate::Credentials;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use wagate_types::Identity;

const CREDS_FILE: &str = "creds.json";
const CREDS_TMP_FILE: &str = "creds.json.tmp";

/// Durable store for the library's credential blobs.
pub trait CredentialStore: Send + Sync + 'static {
    fn load(&self, identity: &Identity) -> io::Result<Option<Credentials>>;

    fn save(&self, identity: &Identity, credentials: &Credentials) -> io::Result<()>;

    /// Remove everything stored for `identity`. Erasing an absent slot succeeds.
    fn erase(&self, identity: &Identity) -> io::Result<()>;

    fn exists(&self, identity: &Identity) -> bool;

    /// Identities that currently have stored credentials.
    fn list(&self) -> io::Result<Vec<Identity>>;
}

/// Filesystem store: `<root>/<identity>/creds.json`.
pub struct FsCredentialStore {
    root: PathBuf,
}

impl FsCredentialStore {
    /// Open the store, creating the root directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything persisted for `identity`.
    pub fn session_dir(&self, identity: &Identity) -> PathBuf {
        self.root.join(identity.as_str())
    }

    fn creds_path(&self, identity: &Identity) -> PathBuf {
        self.session_dir(identity).join(CREDS_FILE)
    }
}

impl CredentialStore for FsCredentialStore {
    fn load(&self, identity: &Identity) -> io::Result<Option<Credentials>> {
        match std::fs::read(self.creds_path(identity)) {
            Ok(bytes) => Ok(Some(Credentials::new(bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, identity: &Identity, credentials: &Credentials) -> io::Result<()> {
        let dir = self.session_dir(identity);
        std::fs::create_dir_all(&dir)?;

        // Write-then-rename so a crash never leaves a torn creds file.
        let tmp = dir.join(CREDS_TMP_FILE);
        std::fs::write(&tmp, credentials.as_bytes())?;
        std::fs::rename(&tmp, dir.join(CREDS_FILE))?;

        debug!(target: "wagate::credentials", "Saved {} bytes of credentials for {}", credentials.len(), identity);
        Ok(())
    }

    fn erase(&self, identity: &Identity) -> io::Result<()> {
        match std::fs::remove_dir_all(self.session_dir(identity)) {
            Ok(()) => {
                debug!(target: "wagate::credentials", "Erased session directory for {}", identity);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn exists(&self, identity: &Identity) -> bool {
        self.session_dir(identity).exists()
    }

    fn list(&self) -> io::Result<Vec<Identity>> {
        let mut identities = Vec::new();

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            match Identity::parse(name) {
                Ok(identity) if identity.as_str() == name => {
                    if entry.path().join(CREDS_FILE).exists() {
                        identities.push(identity);
                    }
                }
                _ => {
                    warn!(target: "wagate::credentials", "Ignoring unexpected entry in credentials dir: {}", name);
                }
            }
        }

        identities.sort();
        Ok(identities)
    }
}
