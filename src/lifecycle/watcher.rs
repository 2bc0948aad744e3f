//! Source watcher: code changes reload the workers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Watches application sources and requests a worker reload on change.
pub struct CodeWatcher {
    paths: Vec<PathBuf>,
    reload_tx: mpsc::Sender<()>,
}

impl CodeWatcher {
    pub fn new(paths: Vec<PathBuf>, reload_tx: mpsc::Sender<()>) -> Self {
        Self { paths, reload_tx }
    }

    /// Start watching in notify's background thread.
    ///
    /// Watching stops when the returned watcher is dropped.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.reload_tx.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_code_change(&event) => {
                    tracing::info!(paths = ?event.paths, "Code change detected, reloading workers");
                    // A full channel already holds a pending reload.
                    let _ = tx.try_send(());
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        for path in &self.paths {
            watcher.watch(path, RecursiveMode::Recursive)?;
        }

        tracing::info!(paths = ?self.paths, "Code watcher started");
        Ok(watcher)
    }
}

/// Editor droppings and dotfiles do not count as code.
fn is_ignored(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with('.') || name.ends_with('~') || name.ends_with(".swp") || name.ends_with(".tmp")
}

/// Whether `event` changed at least one file worth reloading for.
pub fn is_code_change(event: &Event) -> bool {
    let kind = &event.kind;
    (kind.is_modify() || kind.is_create() || kind.is_remove())
        && event.paths.iter().any(|path| !is_ignored(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, EventKind, ModifyKind};

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn edits_to_sources_count() {
        let modify = EventKind::Modify(ModifyKind::Data(DataChange::Content));
        assert!(is_code_change(&event(modify, "/app/src/Kernel.php")));
        assert!(is_code_change(&event(
            EventKind::Create(CreateKind::File),
            "/app/config/routes.yaml"
        )));
    }

    #[test]
    fn reads_and_editor_files_do_not() {
        assert!(!is_code_change(&event(
            EventKind::Access(AccessKind::Read),
            "/app/src/Kernel.php"
        )));
        let modify = EventKind::Modify(ModifyKind::Data(DataChange::Content));
        assert!(!is_code_change(&event(modify, "/app/src/.Kernel.php.swp")));
        assert!(!is_code_change(&event(modify, "/app/src/Kernel.php~")));
    }
}
