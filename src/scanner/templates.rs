/// Template Store
///
/// Flat directory of user-supplied nuclei templates, managed through the
/// template tools and the `templates://{name}` resource. Names are plain file
/// names inside the directory; nothing is cached or validated beyond that.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::error::TemplateError;

#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    /// Open the store, creating the directory if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, TemplateError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a template, replacing any existing file with the same name.
    pub async fn add_template(&self, name: &str, content: &[u8]) -> Result<(), TemplateError> {
        let path = self.path_for(name)?;
        tokio::fs::write(&path, content).await?;
        debug!(path = %path.display(), bytes = content.len(), "template stored");
        Ok(())
    }

    /// Names of all regular files in the store, sorted.
    pub async fn list_templates(&self) -> Result<Vec<String>, TemplateError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn get_template(&self, name: &str) -> Result<Vec<u8>, TemplateError> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TemplateError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, TemplateError> {
        if !is_plain_file_name(name) {
            return Err(TemplateError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(name))
    }
}

/// A single normal path component: no separators, no `.` or `..`.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    ) && !name.contains('/')
        && !name.contains('\\')
}
