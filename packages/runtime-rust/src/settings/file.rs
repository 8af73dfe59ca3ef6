//! Settings backend loaded from a JSON or TOML document.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hearth_core::{SettingKey, SettingValue, SettingsTree};
use parking_lot::RwLock;

use super::backend::SettingsBackend;
use super::BackendError;

/// Supported document formats, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Toml,
}

impl FileFormat {
    /// Format for `path`, or `None` for an unsupported extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }

    /// Parses `text` into a settings value.
    ///
    /// # Errors
    ///
    /// [`BackendError::Parse`] if the document is malformed or its root is not
    /// a mapping.
    pub fn parse(self, text: &str) -> Result<SettingValue, BackendError> {
        let value: SettingValue = match self {
            Self::Json => {
                serde_json::from_str(text).map_err(|e| BackendError::Parse(e.to_string()))?
            }
            Self::Toml => toml::from_str(text).map_err(|e| BackendError::Parse(e.to_string()))?,
        };
        if !value.is_map() {
            return Err(BackendError::Parse(
                "settings document root must be a mapping".to_string(),
            ));
        }
        Ok(value)
    }
}

/// Backend serving a settings document read once at open time.
///
/// Writes are applied in memory only. Change notification is not supported.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    tree: RwLock<SettingsTree>,
}

impl FileBackend {
    /// Reads and parses the document at `path`.
    ///
    /// # Errors
    ///
    /// [`BackendError::Unsupported`] for an unknown extension,
    /// [`BackendError::Io`] if the file cannot be read and
    /// [`BackendError::Parse`] if it does not parse.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let path = path.into();
        let format = FileFormat::from_path(&path)
            .ok_or(BackendError::Unsupported("settings file extension"))?;
        let text = std::fs::read_to_string(&path)?;
        let tree = SettingsTree::from_value(format.parse(&text)?);
        tracing::info!(path = %path.display(), "loaded settings file");
        Ok(Self {
            path,
            tree: RwLock::new(tree),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SettingsBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &SettingKey) -> Result<Option<SettingValue>, BackendError> {
        let tree = self.tree.read();
        if key.is_root() {
            return Ok(Some(tree.to_value()));
        }
        Ok(tree.get(key).cloned())
    }

    async fn set(
        &self,
        key: &SettingKey,
        value: SettingValue,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        if ttl.is_some() {
            tracing::debug!(key = %key, "file backend ignores ttl");
        }
        self.tree.write().set(key, value);
        Ok(())
    }

    async fn delete(&self, key: &SettingKey) -> Result<(), BackendError> {
        self.tree
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_temp(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn loads_json_document() {
        let file = write_temp(
            ".json",
            r#"{"system": {"deploy_name": "staging", "resources": {"http": {"port": 8080}}}}"#,
        );
        let backend = FileBackend::open(file.path()).unwrap();
        assert_eq!(
            backend
                .get(&SettingKey::new("system.resources.http.port"))
                .await
                .unwrap(),
            Some(8080.into())
        );
        assert!(!backend.supports_watch());
    }

    #[tokio::test]
    async fn loads_toml_document() {
        let file = write_temp(
            ".toml",
            "[system]\ndeploy_name = \"prod\"\n\n[system.resources.http]\nport = 9000\nhosts = [\"a\", \"b\"]\n",
        );
        let backend = FileBackend::open(file.path()).unwrap();
        let deploy = backend.get(&SettingKey::new("system.deploy_name")).await.unwrap();
        assert_eq!(deploy, Some("prod".into()));
        let hosts = backend
            .get(&SettingKey::new("system.resources.http.hosts"))
            .await
            .unwrap();
        assert_eq!(hosts, Some(vec!["a", "b"].into()));
    }

    #[tokio::test]
    async fn writes_and_deletes_in_memory() {
        let file = write_temp(".json", r#"{"a": 1}"#);
        let backend = FileBackend::open(file.path()).unwrap();
        backend.set(&SettingKey::new("b"), true.into(), None).await.unwrap();
        assert_eq!(backend.get(&SettingKey::new("b")).await.unwrap(), Some(true.into()));
        backend.delete(&SettingKey::new("a")).await.unwrap();
        assert!(matches!(
            backend.delete(&SettingKey::new("a")).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[test]
    fn rejects_bad_documents() {
        let file = write_temp(".yaml", "a: 1");
        assert!(matches!(
            FileBackend::open(file.path()),
            Err(BackendError::Unsupported(_))
        ));

        let file = write_temp(".json", "[1, 2]");
        assert!(matches!(FileBackend::open(file.path()), Err(BackendError::Parse(_))));

        let file = write_temp(".toml", "not = [valid");
        assert!(matches!(FileBackend::open(file.path()), Err(BackendError::Parse(_))));

        assert!(matches!(
            FileBackend::open("/nonexistent/hearth/settings.json"),
            Err(BackendError::Io(_))
        ));
    }
}
