//! Credential persistence backends.
//!
//! A process identity owns exactly one credential record. The file backend
//! keeps it as `creds.json` inside the session directory, next to the raw
//! pairing token kept for audit (`session_id.txt`).

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use courier_core::Credential;
use thiserror::Error;

const CREDENTIAL_FILENAME: &str = "creds.json";
const PAIRING_TOKEN_FILENAME: &str = "session_id.txt";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialStoreError {
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    #[error("credential record is corrupt: {0}")]
    Corrupt(String),
    #[error("credential store backend failure: {0}")]
    Backend(String),
}

pub trait CredentialStore: Send + Sync {
    /// Load the persisted credential, `None` when nothing was stored yet.
    fn load(&self) -> Result<Option<Credential>, CredentialStoreError>;

    fn save(&self, credential: &Credential) -> Result<(), CredentialStoreError>;

    /// Keep an opaque pairing token verbatim for audit.
    fn save_pairing_token(&self, token: &str) -> Result<(), CredentialStoreError>;

    /// Destroy the credential (explicit logout).
    fn clear(&self) -> Result<(), CredentialStoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    credential: Option<Credential>,
    pairing_token: Option<String>,
}

#[derive(Clone, Default)]
pub struct InMemoryCredentialStore {
    data: Arc<RwLock<MemoryState>>,
}

impl InMemoryCredentialStore {
    pub fn with_credential(credential: Credential) -> Self {
        let store = Self::default();
        if let Ok(mut data) = store.data.write() {
            data.credential = Some(credential);
        }
        store
    }

    pub fn pairing_token(&self) -> Option<String> {
        self.data
            .read()
            .ok()
            .and_then(|data| data.pairing_token.clone())
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn load(&self) -> Result<Option<Credential>, CredentialStoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        Ok(data.credential.clone())
    }

    fn save(&self, credential: &Credential) -> Result<(), CredentialStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        data.credential = Some(credential.clone());
        Ok(())
    }

    fn save_pairing_token(&self, token: &str) -> Result<(), CredentialStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        data.pairing_token = Some(token.to_owned());
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        data.credential = None;
        Ok(())
    }
}

/// Credential store backed by a session directory on disk.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn credential_path(&self) -> PathBuf {
        self.dir.join(CREDENTIAL_FILENAME)
    }

    pub fn pairing_token_path(&self) -> PathBuf {
        self.dir.join(PAIRING_TOKEN_FILENAME)
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credential>, CredentialStoreError> {
        let path = self.credential_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(CredentialStoreError::Unavailable(format!(
                    "failed reading credential {}: {err}",
                    path.display()
                )));
            }
        };

        Credential::from_json_bytes(&raw).map(Some).ok_or_else(|| {
            CredentialStoreError::Corrupt(format!(
                "{} does not hold a JSON object",
                path.display()
            ))
        })
    }

    fn save(&self, credential: &Credential) -> Result<(), CredentialStoreError> {
        let encoded = serde_json::to_vec(credential)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))?;
        write_atomically(&self.credential_path(), &encoded)
    }

    fn save_pairing_token(&self, token: &str) -> Result<(), CredentialStoreError> {
        write_atomically(&self.pairing_token_path(), token.as_bytes())
    }

    fn clear(&self) -> Result<(), CredentialStoreError> {
        let path = self.credential_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CredentialStoreError::Backend(format!(
                "failed deleting credential {}: {err}",
                path.display()
            ))),
        }
    }
}

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Write a sibling temp file, then move it over `path`.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), CredentialStoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|err| {
        CredentialStoreError::Unavailable(format!(
            "failed creating session directory {}: {err}",
            dir.display()
        ))
    })?;

    let temp_path = sibling_temp_path(path);
    fs::write(&temp_path, contents)
        .and_then(|()| replace_file(&temp_path, path))
        .map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            CredentialStoreError::Unavailable(format!(
                "failed storing {}: {err}",
                path.display()
            ))
        })
}

/// Some platforms refuse to rename over an existing file; retry with it removed.
fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    match fs::remove_file(to) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
        _ => {}
    }
    fs::rename(from, to)
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "record".to_owned());
    let sequence = TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{name}.{}.{sequence}.tmp", std::process::id()))
}
