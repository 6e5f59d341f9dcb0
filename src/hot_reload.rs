// Shader hot reload
//
// Watches the shader directory and reports when compiled SPIR-V or a
// manifest changes. Events are debounced so a compiler writing a file in
// several chunks produces one reload once the writes have settled. The app
// polls once per frame and rebuilds the pipeline when something changed.

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::Duration;

/// Quiet period a file must reach before it counts as changed
pub const DEBOUNCE_TIMEOUT: Duration = Duration::from_millis(250);

pub struct ShaderWatcher {
    // Dropping the debouncer stops the notifications
    _debouncer: Debouncer<RecommendedWatcher>,
    events: Receiver<DebounceEventResult>,
}

impl ShaderWatcher {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let (tx, events) = mpsc::channel();

        let mut debouncer = new_debouncer(DEBOUNCE_TIMEOUT, tx).context("Failed to create file watcher")?;
        debouncer
            .watcher()
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch shader directory: {}", dir.display()))?;

        log::info!("Watching {} for shader changes", dir.display());

        Ok(Self {
            _debouncer: debouncer,
            events,
        })
    }

    /// Drain pending events; true if any of them touched a shader file
    pub fn poll(&self) -> bool {
        let mut changed = false;
        loop {
            match self.events.try_recv() {
                Ok(Ok(events)) => {
                    for event in events {
                        // Removed files have nothing to reload
                        if is_shader_file(&event.path) && event.path.is_file() {
                            log::debug!("Shader change: {}", event.path.display());
                            changed = true;
                        }
                    }
                }
                Ok(Err(e)) => log::warn!("File watcher error: {}", e),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        changed
    }
}

/// Compiled SPIR-V or a shader manifest
pub fn is_shader_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "spv" || ext == "toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_and_manifests_are_shader_files() {
        assert!(is_shader_file(Path::new("shaders/mesh.frag.spv")));
        assert!(is_shader_file(Path::new("shaders/mesh.toml")));
    }

    #[test]
    fn sources_and_other_files_are_ignored() {
        assert!(!is_shader_file(Path::new("shaders/mesh.frag")));
        assert!(!is_shader_file(Path::new("shaders/mesh.vert.spv.tmp")));
        assert!(!is_shader_file(Path::new("shaders")));
    }

    #[test]
    fn burst_of_writes_reloads_once_after_settling() {
        let dir = std::env::temp_dir().join(format!("vkdev-watch-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let watcher = ShaderWatcher::new(&dir).unwrap();

        let path = dir.join("mesh.vert.spv");
        for chunk in 0..5u8 {
            std::fs::write(&path, [chunk; 16]).unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut changed = false;
        while !changed && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
            changed = watcher.poll();
        }
        assert!(changed);

        // The whole burst collapsed into that one change
        std::thread::sleep(DEBOUNCE_TIMEOUT * 3);
        assert!(!watcher.poll());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
