//! Persisted session state: the key-value store that lets tokens, user ids
//! and avatars survive process restarts. Clearing it forces a fresh
//! anonymous bootstrap on the next session start.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use super::AuthError;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Avatar {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct StoredSession {
    #[serde(default)]
    pub user_token: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub avatar: Option<Avatar>,
    #[serde(default)]
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn open_default() -> Result<Self, AuthError> {
        let base = BaseDirs::new()
            .ok_or_else(|| AuthError::Storage("unable to determine home directory".into()))?;
        let path = base.home_dir().join(".skiff").join("session.toml");
        Ok(Self { path })
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<StoredSession, AuthError> {
        if !self.path.exists() {
            return Ok(StoredSession::default());
        }
        let raw = fs::read_to_string(&self.path)
            .map_err(|err| AuthError::Storage(err.to_string()))?;
        toml::from_str(&raw).map_err(|err| AuthError::Storage(err.to_string()))
    }

    pub fn save(&self, session: &StoredSession) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| AuthError::Storage(err.to_string()))?;
        }

        let serialized =
            toml::to_string_pretty(session).map_err(|err| AuthError::Storage(err.to_string()))?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.path)
            .map_err(|err| AuthError::Storage(err.to_string()))?;
        file.write_all(serialized.as_bytes())
            .map_err(|err| AuthError::Storage(err.to_string()))?;
        Ok(())
    }

    /// Load-modify-save in one step.
    pub fn update(
        &self,
        apply: impl FnOnce(&mut StoredSession),
    ) -> Result<StoredSession, AuthError> {
        let mut session = self.load()?;
        apply(&mut session);
        self.save(&session)?;
        Ok(session)
    }

    pub fn clear(&self) -> Result<(), AuthError> {
        self.save(&StoredSession::default())
    }
}
