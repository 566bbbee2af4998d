// Shader hot reload
//
// Watches the directory holding the shader file and raises a flag when the
// file is written or replaced. The render thread polls the flag once per
// frame, so no GPU work ever happens on the watcher thread.

use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct ShaderWatcher {
    dirty: Arc<AtomicBool>,
    // Dropping the watcher stops the watch
    _watcher: RecommendedWatcher,
}

impl ShaderWatcher {
    pub fn new(shader_path: &Path) -> Result<Self> {
        let dirty = Arc::new(AtomicBool::new(false));
        let file_name = shader_path
            .file_name()
            .context("Shader path has no file name")?
            .to_os_string();
        let dir = match shader_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };

        let flag = dirty.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if touches_file(&event, &file_name) {
                    flag.store(true, Ordering::Release);
                }
            }
            Err(e) => log::warn!("Shader watch error: {}", e),
        })
        .context("Failed to create file watcher")?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", dir))?;

        log::info!("Watching {:?} for shader changes", shader_path);

        Ok(Self {
            dirty,
            _watcher: watcher,
        })
    }

    /// True once per batch of changes.
    pub fn take_change(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

fn touches_file(event: &Event, file_name: &OsString) -> bool {
    (event.kind.is_modify() || event.kind.is_create())
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}
