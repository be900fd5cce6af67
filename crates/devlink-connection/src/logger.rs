use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDataType {
    Text,
    Logcat,
    KernelLog,
    Tombstone,
    Bugreportz,
    CuttlefishLog,
    Dir,
}

impl LogDataType {
    pub fn extension(self) -> &'static str {
        match self {
            LogDataType::Bugreportz => "zip",
            LogDataType::Dir => "",
            _ => "txt",
        }
    }
}

/// Receives artifacts produced while a connection is set up or torn down.
pub trait TestLogger: Send + Sync {
    fn test_log(&self, name: &str, data_type: LogDataType, path: &Path);
}

/// Copies every logged artifact into a directory.
#[derive(Debug)]
pub struct DirectoryLogger {
    root: PathBuf,
    logged: Mutex<Vec<PathBuf>>,
}

impl DirectoryLogger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            logged: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logged(&self) -> Vec<PathBuf> {
        self.logged
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn copy_into(&self, name: &str, data_type: LogDataType, path: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let ext = data_type.extension();
        let file_name = if ext.is_empty() || name.ends_with(&format!(".{ext}")) {
            name.to_string()
        } else {
            format!("{name}.{ext}")
        };
        let dest = self.root.join(file_name);
        if path.is_dir() {
            copy_dir(path, &dest)?;
        } else {
            fs::copy(path, &dest)?;
        }
        Ok(dest)
    }
}

impl TestLogger for DirectoryLogger {
    fn test_log(&self, name: &str, data_type: LogDataType, path: &Path) {
        match self.copy_into(name, data_type, path) {
            Ok(dest) => {
                if let Ok(mut guard) = self.logged.lock() {
                    guard.push(dest);
                }
            }
            Err(err) => warn!("failed to log {name} from {}: {err}", path.display()),
        }
    }
}

fn copy_dir(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogger;

impl TestLogger for NullLogger {
    fn test_log(&self, _name: &str, _data_type: LogDataType, _path: &Path) {}
}
