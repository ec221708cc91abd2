//! On-disk persisted state, one TOML file per certificate.
//!
//! # Storage format
//!
//! ```text
//! $XDG_DATA_HOME/sshcert/state/<key-id>.toml   (default: ~/.local/share/…)
//! ```
//!
//! Files hold private keys and are written with mode `0600` using a
//! write-then-rename so a reader never sees a partially written file.
//!
//! A [`StateFile`] is the [`StateSink`] handed to the workflow: setting the
//! identity writes through to disk immediately (so an accepted request is
//! never lost), while field updates stay in memory until [`StateFile::commit`].

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::record::{ResourceState, StateSink};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("cannot determine data directory (neither XDG_DATA_HOME nor HOME is set)")]
    NoDataDir,
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialise state: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at `$XDG_DATA_HOME/sshcert/state`.
    pub fn from_env() -> Result<Self, StoreError> {
        default_dir().map(Self::new).ok_or(StoreError::NoDataDir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the state file for `key_id`.
    ///
    /// Bytes outside `[A-Za-z0-9_-]` are written as `%XX`, so distinct ids
    /// always map to distinct single filename components.
    pub fn path_for(&self, key_id: &str) -> PathBuf {
        let mut safe_id = String::with_capacity(key_id.len());
        for b in key_id.bytes() {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
                safe_id.push(char::from(b));
            } else {
                safe_id.push_str(&format!("%{b:02X}"));
            }
        }
        self.dir.join(format!("{safe_id}.toml"))
    }

    /// Load the state for `key_id`.  A missing file is an empty state.
    pub fn load(&self, key_id: &str) -> Result<ResourceState, StoreError> {
        let path = self.path_for(key_id);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ResourceState::default());
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        toml::from_str(&contents).map_err(|source| StoreError::Parse { path, source })
    }

    pub fn save(&self, key_id: &str, state: &ResourceState) -> Result<(), StoreError> {
        let path = self.path_for(key_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let toml_str = toml::to_string(state)?;
        write_secret_file(&path, toml_str.as_bytes())
            .map_err(|source| StoreError::Io { path: path.clone(), source })?;
        debug!(path = %path.display(), "state saved");
        Ok(())
    }

    /// Delete the state for `key_id`.
    ///
    /// Returns `true` if a file was removed, `false` if nothing existed.
    pub fn remove(&self, key_id: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    /// Start a fresh state for `key_id`, discarding whatever is on disk once
    /// the first write happens.
    pub fn create(&self, key_id: &str) -> StateFile {
        StateFile {
            store: self.clone(),
            key_id: key_id.to_string(),
            state: ResourceState::default(),
        }
    }

    /// Open the existing state for `key_id`.
    pub fn open(&self, key_id: &str) -> Result<StateFile, StoreError> {
        Ok(StateFile {
            store: self.clone(),
            key_id: key_id.to_string(),
            state: self.load(key_id)?,
        })
    }
}

/// Return the default state directory.
///
/// `$XDG_DATA_HOME/sshcert/state` (default: `~/.local/share/sshcert/state`)
pub fn default_dir() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))?;
    Some(base.join("sshcert").join("state"))
}

/// State of one certificate, bound to its file.
#[derive(Debug)]
pub struct StateFile {
    store: StateStore,
    key_id: String,
    state: ResourceState,
}

impl StateFile {
    pub fn state(&self) -> &ResourceState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ResourceState {
        &mut self.state
    }

    /// Write the in-memory state to disk.
    pub fn commit(&self) -> Result<(), StoreError> {
        self.store.save(&self.key_id, &self.state)
    }
}

impl StateSink for StateFile {
    fn set_id(&mut self, id: &str) -> Result<(), String> {
        if self.state.id == id {
            return Ok(());
        }
        self.state.set_id(id)?;
        self.commit().map_err(|e| e.to_string())
    }

    fn set(&mut self, field: &str, value: &str) -> Result<(), String> {
        self.state.set(field, value)
    }
}

/// Write `data` to `path` with Unix mode `0600`, replacing any existing file.
fn write_secret_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let tmp_path = path.with_extension("toml.tmp");

    {
        // Mode is set at creation so the file is never briefly world-readable.
        #[cfg(unix)]
        let mut f = {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp_path)?
        };
        #[cfg(not(unix))]
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        f.write_all(data)?;
        f.sync_all()?;
    }

    std::fs::rename(&tmp_path, path)
}
