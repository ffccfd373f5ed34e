use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::credential::Credential;
use crate::error::AuthError;

const API_KEYS_FILE: &str = "api_keys.json";

/// On-disk storage for credentials.
///
/// Layout under the root directory:
///
/// - `<provider>.json`: OAuth credential of a provider.
/// - `api_keys.json`: API keys entered with `/key`, keyed by provider id.
///
/// Every write goes to a temporary file in the same directory which is then
/// renamed over the target, so readers never observe a partial file.
#[derive(Clone, Debug)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    #[inline]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Loads the OAuth credential of `provider`, if any.
    pub fn load(
        &self,
        provider: &str,
    ) -> Result<Option<Credential>, AuthError> {
        let path = self.credential_path(provider)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(err) => return Err(AuthError::io("reading", path, err)),
        };
        let mut credential: Credential = serde_json::from_slice(&data)
            .map_err(|err| AuthError::Corrupted {
                path: path.clone(),
                reason: err.to_string(),
            })?;
        credential.provider = provider.to_owned();
        Ok(Some(credential))
    }

    pub fn save(&self, credential: &Credential) -> Result<(), AuthError> {
        let path = self.credential_path(&credential.provider)?;
        let data = serde_json::to_vec_pretty(credential).map_err(|err| {
            AuthError::Corrupted {
                path: path.clone(),
                reason: err.to_string(),
            }
        })?;
        write_atomic(&path, &data)?;
        debug!(provider = %credential.provider, "credential saved");
        Ok(())
    }

    /// Deletes the OAuth credential of `provider`. Returns `false` if there
    /// was nothing to delete.
    pub fn delete(&self, provider: &str) -> Result<bool, AuthError> {
        let path = self.credential_path(provider)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(AuthError::io("deleting", path, err)),
        }
    }

    /// Resolves the API key of `provider`.
    ///
    /// A key stored with [`set_api_key`](Self::set_api_key) wins; otherwise
    /// the environment variable `env_var` is consulted.
    pub fn api_key(
        &self,
        provider: &str,
        env_var: Option<&str>,
    ) -> Result<Option<String>, AuthError> {
        if let Some(key) = self.load_api_keys()?.remove(provider) {
            return Ok(Some(key));
        }
        Ok(env_var
            .and_then(|name| env::var(name).ok())
            .filter(|key| !key.trim().is_empty()))
    }

    pub fn set_api_key(
        &self,
        provider: &str,
        key: &str,
    ) -> Result<(), AuthError> {
        validate_provider_id(provider)?;
        let mut keys = self.load_api_keys()?;
        keys.insert(provider.to_owned(), key.trim().to_owned());
        self.save_api_keys(&keys)
    }

    pub fn remove_api_key(&self, provider: &str) -> Result<bool, AuthError> {
        let mut keys = self.load_api_keys()?;
        if keys.remove(provider).is_none() {
            return Ok(false);
        }
        self.save_api_keys(&keys)?;
        Ok(true)
    }

    fn load_api_keys(&self) -> Result<BTreeMap<String, String>, AuthError> {
        let path = self.root.join(API_KEYS_FILE);
        match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|err| {
                AuthError::Corrupted {
                    path,
                    reason: err.to_string(),
                }
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Ok(BTreeMap::new())
            }
            Err(err) => Err(AuthError::io("reading", path, err)),
        }
    }

    fn save_api_keys(
        &self,
        keys: &BTreeMap<String, String>,
    ) -> Result<(), AuthError> {
        let path = self.root.join(API_KEYS_FILE);
        let data = serde_json::to_vec_pretty(keys).map_err(|err| {
            AuthError::Corrupted {
                path: path.clone(),
                reason: err.to_string(),
            }
        })?;
        write_atomic(&path, &data)
    }

    fn credential_path(&self, provider: &str) -> Result<PathBuf, AuthError> {
        validate_provider_id(provider)?;
        Ok(self.root.join(format!("{provider}.json")))
    }
}

fn validate_provider_id(provider: &str) -> Result<(), AuthError> {
    let valid = !provider.is_empty()
        && provider != "api_keys"
        && provider
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AuthError::InvalidProvider(provider.to_owned()))
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), AuthError> {
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir)
        .map_err(|err| AuthError::io("creating directory", dir, err))?;
    let mut file = NamedTempFile::new_in(dir)
        .map_err(|err| AuthError::io("creating temp file", dir, err))?;
    file.write_all(data)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|err| AuthError::io("writing", file.path(), err))?;
    file.persist(path)
        .map_err(|err| AuthError::io("renaming", path, err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(provider: &str) -> Credential {
        Credential {
            provider: provider.to_owned(),
            access_token: "at".to_owned(),
            refresh_token: Some("rt".to_owned()),
            expiry: 1_700_000_000,
            scope: None,
        }
    }

    #[test]
    fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials"));

        assert_eq!(store.load("gemini").unwrap(), None);
        store.save(&sample("gemini")).unwrap();
        assert_eq!(store.load("gemini").unwrap(), Some(sample("gemini")));

        let raw: serde_json::Value = serde_json::from_slice(
            &fs::read(dir.path().join("credentials/gemini.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(raw["access_token"], "at");
        assert_eq!(raw["expiry"], 1_700_000_000);
        assert!(raw.get("scope").is_none());
        assert!(raw.get("provider").is_none());

        assert!(store.delete("gemini").unwrap());
        assert!(!store.delete("gemini").unwrap());
        assert_eq!(store.load("gemini").unwrap(), None);
    }

    #[test]
    fn test_corrupted_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        fs::write(dir.path().join("qwen.json"), b"{ not json").unwrap();
        assert!(matches!(
            store.load("qwen"),
            Err(AuthError::Corrupted { .. })
        ));
        // The file is left alone.
        assert_eq!(
            fs::read(dir.path().join("qwen.json")).unwrap(),
            b"{ not json"
        );
    }

    #[test]
    fn test_rejects_path_like_provider_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        assert!(matches!(
            store.load("../etc/passwd"),
            Err(AuthError::InvalidProvider(_))
        ));
        assert!(matches!(
            store.set_api_key("api_keys", "x"),
            Err(AuthError::InvalidProvider(_))
        ));
    }

    #[test]
    fn test_stored_api_key_overrides_env() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        // PATH is always present, which makes it a convenient stand-in for
        // an API key variable.
        let from_env = store.api_key("groq", Some("PATH")).unwrap();
        assert_eq!(from_env, env::var("PATH").ok());

        store.set_api_key("groq", " gsk-123 ").unwrap();
        assert_eq!(
            store.api_key("groq", Some("PATH")).unwrap().as_deref(),
            Some("gsk-123")
        );

        assert!(store.remove_api_key("groq").unwrap());
        assert_eq!(
            store
                .api_key("groq", Some("SUPERCLI_TEST_UNSET_VARIABLE"))
                .unwrap(),
            None
        );
    }
}
