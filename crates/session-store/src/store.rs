use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::error::SessionError;
use crate::session::Session;

/// A short description of a stored session, for listings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: Uuid,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub favorite: bool,
    pub tags: BTreeSet<String>,
    pub model: Option<String>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            title: session.title.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            message_count: session.len(),
            favorite: session.metadata.favorite,
            tags: session.metadata.tags.clone(),
            model: session.model.clone(),
        }
    }
}

/// Stores sessions as `<root>/<id>.json`.
#[derive(Clone, Debug)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    #[inline]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns `<data_dir>/sessions` of the current platform.
    pub fn default_root() -> Option<PathBuf> {
        ProjectDirs::from("", "", "supercli")
            .map(|dirs| dirs.data_dir().join("sessions"))
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn save(&self, session: &Session) -> Result<(), SessionError> {
        let data = serde_json::to_vec_pretty(session)?;
        write_atomic(&self.session_path(session.id), &data)?;
        trace!(id = %session.id, messages = session.len(), "session saved");
        Ok(())
    }

    pub fn load(&self, id: Uuid) -> Result<Session, SessionError> {
        let path = self.session_path(id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(id));
            }
            Err(err) => return Err(SessionError::io("reading", path, err)),
        };
        parse_session(&path, &data)
    }

    /// Lists stored sessions, most recently updated first.
    ///
    /// Files that cannot be parsed are skipped with a warning.
    pub fn list(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let mut summaries = vec![];
        for session in self.scan()? {
            summaries.push(SessionSummary::from(&session));
        }
        summaries.sort_by_key(|summary| Reverse(summary.updated_at));
        Ok(summaries)
    }

    /// Returns the most recently updated session, if any.
    pub fn latest(&self) -> Result<Option<Session>, SessionError> {
        Ok(self
            .scan()?
            .into_iter()
            .max_by_key(|session| session.updated_at))
    }

    /// Deletes a session. Returns `false` if it did not exist.
    pub fn delete(&self, id: Uuid) -> Result<bool, SessionError> {
        let path = self.session_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(SessionError::io("deleting", path, err)),
        }
    }

    fn scan(&self) -> Result<Vec<Session>, SessionError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(vec![]);
            }
            Err(err) => {
                return Err(SessionError::io("listing", &self.root, err));
            }
        };

        let mut sessions = vec![];
        for entry in entries {
            let path = entry
                .map_err(|err| SessionError::io("listing", &self.root, err))?
                .path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let loaded = fs::read(&path)
                .map_err(|err| SessionError::io("reading", &path, err))
                .and_then(|data| parse_session(&path, &data));
            match loaded {
                Ok(session) => sessions.push(session),
                Err(err) => warn!("skipping session file: {err}"),
            }
        }
        Ok(sessions)
    }

    fn session_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }
}

fn parse_session(path: &Path, data: &[u8]) -> Result<Session, SessionError> {
    serde_json::from_slice(data).map_err(|err| SessionError::Corrupted {
        path: path.to_owned(),
        reason: err.to_string(),
    })
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), SessionError> {
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir)
        .map_err(|err| SessionError::io("creating directory", dir, err))?;
    let mut file = NamedTempFile::new_in(dir)
        .map_err(|err| SessionError::io("creating temp file", dir, err))?;
    file.write_all(data)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|err| SessionError::io("writing", file.path(), err))?;
    file.persist(path)
        .map_err(|err| SessionError::io("renaming", path, err.error))?;
    Ok(())
}
