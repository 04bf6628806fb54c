use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::RaftError;

/// Election state that must survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub term: u64,
    pub vote: Option<String>,
}

/// JSON file holding the node's [`PersistentState`].
pub struct StateFile {
    path: PathBuf,
    state: PersistentState,
}

impl StateFile {
    /// Opens the state file at `path`, creating parent directories and a
    /// fresh state if it does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RaftError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = Self {
            path,
            state: PersistentState::default(),
        };

        if file.path.exists() {
            file.load_from_disk()?;
        } else {
            file.save_to_disk()?;
        }

        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &PersistentState {
        &self.state
    }

    pub fn term(&self) -> u64 {
        self.state.term
    }

    pub fn vote(&self) -> Option<&str> {
        self.state.vote.as_deref()
    }

    /// Records `term` and `vote` and flushes them to disk. The in-memory copy
    /// is updated even if the write fails so the engine keeps its view of the
    /// current term.
    pub fn store(&mut self, term: u64, vote: Option<String>) -> Result<(), RaftError> {
        self.state = PersistentState { term, vote };
        self.save_to_disk()
    }

    fn load_from_disk(&mut self) -> Result<(), RaftError> {
        let mut file = File::open(&self.path)?;
        let mut buffer = String::new();
        file.read_to_string(&mut buffer)?;

        if buffer.trim().is_empty() {
            return Ok(());
        }

        self.state = serde_json::from_str(&buffer)?;
        Ok(())
    }

    fn save_to_disk(&self) -> Result<(), RaftError> {
        let encoded = serde_json::to_vec(&self.state)?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }
}
