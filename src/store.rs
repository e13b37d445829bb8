use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Result;
use parking_lot::Mutex;

use crate::config::SessionConfig;

/// Where the manager keeps its session list between runs.
pub trait Store: Send + Sync {
    fn read(&self) -> Result<Vec<SessionConfig>>;

    fn write(&self, sessions: &[SessionConfig]) -> Result<()>;
}

/// Session list kept for the lifetime of the process only.
#[derive(Default)]
pub struct MemoryStore(Mutex<Vec<SessionConfig>>);

impl MemoryStore {
    pub fn new(sessions: Vec<SessionConfig>) -> Self {
        Self(Mutex::new(sessions))
    }
}

impl Store for MemoryStore {
    fn read(&self) -> Result<Vec<SessionConfig>> {
        Ok(self.0.lock().clone())
    }

    fn write(&self, sessions: &[SessionConfig]) -> Result<()> {
        *self.0.lock() = sessions.to_vec();
        Ok(())
    }
}

/// Session list kept as a JSON array in a file.
///
/// A missing file reads as an empty list.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl Store for FileStore {
    fn read(&self) -> Result<Vec<SessionConfig>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json5::from_str(&text)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, sessions: &[SessionConfig]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&self.path, serde_json::to_string_pretty(sessions)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store() -> Result<()> {
        let store = MemoryStore::new(vec![SessionConfig::new("a", 5004)]);
        assert_eq!(store.read()?.len(), 1);

        store.write(&[SessionConfig::new("b", 5006), SessionConfig::new("c", 5008)])?;

        let names = store.read()?.into_iter().map(|it| it.local_name).collect::<Vec<_>>();
        assert_eq!(names, vec!["b", "c"]);

        Ok(())
    }

    #[test]
    fn file_store() -> Result<()> {
        let path = std::env::temp_dir()
            .join(format!("rtpmidi-store-{}", rand::random::<u32>()))
            .join("sessions.json");

        let store = FileStore::new(&path);
        assert!(store.read()?.is_empty());

        let mut session = SessionConfig::new("studio", 5006);
        session.ssrc = Some(42);
        session.bundle = false;

        store.write(&[session.clone()])?;
        assert_eq!(store.read()?, vec![session]);

        if let Some(parent) = path.parent() {
            fs::remove_dir_all(parent)?;
        }

        Ok(())
    }
}
