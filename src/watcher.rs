// src/watcher.rs
use crate::config::AppConfig;
use crate::event::Event;
use anyhow::Result;
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::Watcher as NotifyWatcherTrait; // To use .watcher() and .cache()
use notify_debouncer_full::{new_debouncer, DebouncedEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tracing::{debug, error, info, warn};

/// Runs the file system watcher in a background thread.
///
/// Spawns a thread that sets up a debounced, recursive watcher for every folder in
/// `AppConfig::folders_to_watch` and sends one [`Event`] per created or deleted
/// file through `event_tx`. Folders that do not exist or are not directories are
/// skipped with a warning.
///
/// Returns as soon as the thread is spawned. The thread exits when the receiving
/// side of `event_tx` is dropped.
pub async fn run_watcher(app_config: Arc<AppConfig>, event_tx: Sender<Event>) -> Result<()> {
    std::thread::Builder::new()
        .name("filehub-watcher".to_string())
        .spawn(move || watch_folders(&app_config, event_tx))?;
    Ok(())
}

fn watch_folders(app_config: &AppConfig, event_tx: Sender<Event>) {
    let (debouncer_internal_tx, debouncer_internal_rx) = std::sync::mpsc::channel();

    let mut debouncer = match new_debouncer(app_config.watch_debounce, None, debouncer_internal_tx)
    {
        Ok(d) => d,
        Err(e) => {
            error!("[WatcherThread] Failed to create debouncer: {}", e);
            return;
        }
    };

    let mut roots = Vec::new();
    for folder_str in &app_config.folders_to_watch {
        let path = Path::new(folder_str);
        if !path.exists() {
            warn!(
                "[WatcherThread] Path does not exist, skipping: {}",
                folder_str
            );
            continue;
        }
        if !path.is_dir() {
            warn!(
                "[WatcherThread] Path is not a directory, skipping: {}",
                folder_str
            );
            continue;
        }
        match debouncer
            .watcher()
            .watch(path, notify::RecursiveMode::Recursive)
        {
            Ok(_) => info!("[WatcherThread] Watching folder: {}", folder_str),
            Err(e) => {
                error!(
                    "[WatcherThread] Failed to watch folder {}: {}",
                    folder_str, e
                );
                continue;
            }
        }
        debouncer
            .cache()
            .add_root(path, notify::RecursiveMode::Recursive);
        // Notifications carry canonical paths on some platforms.
        roots.push(path.canonicalize().unwrap_or_else(|_| path.to_path_buf()));
        roots.push(path.to_path_buf());
    }

    if roots.is_empty() {
        warn!("[WatcherThread] No folders could be watched. Watcher thread exiting.");
        return;
    }

    info!(
        "[WatcherThread] File system watcher thread started for {:?}",
        app_config.folders_to_watch
    );

    for debouncer_result in debouncer_internal_rx {
        match debouncer_result {
            Ok(events) => {
                for debounced_event in events {
                    if !forward(&debounced_event, &roots, &event_tx) {
                        info!("[WatcherThread] Event receiver dropped. Watcher thread exiting.");
                        return;
                    }
                }
            }
            Err(errors) => {
                for error in errors {
                    error!("[WatcherThread] Debouncer reported error: {:?}", error);
                }
            }
        }
    }
    info!("[WatcherThread] Debouncer channel closed. Watcher thread exiting.");
}

/// Sends the events derived from one notification. Returns `false` once the
/// receiver is gone.
fn forward(debounced_event: &DebouncedEvent, roots: &[PathBuf], event_tx: &Sender<Event>) -> bool {
    let events = translate(&debounced_event.kind, &debounced_event.paths, roots);
    if events.is_empty() {
        debug!(
            "[WatcherThread] Ignored event kind {:?} for {:?}",
            debounced_event.kind, debounced_event.paths
        );
    }
    for event in events {
        debug!("[WatcherThread] Produced event: {}", event);
        // Blocking send: this runs on a plain thread, outside the runtime.
        if event_tx.blocking_send(event).is_err() {
            return false;
        }
    }
    true
}

/// Maps a notification onto create/delete events. Everything but creations,
/// removals and renames is ignored.
pub fn translate(kind: &EventKind, paths: &[PathBuf], roots: &[PathBuf]) -> Vec<Event> {
    let name = |path: &PathBuf| relative_name(path, roots);
    match kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.first().map(|p| vec![Event::Create(name(p))]).unwrap_or_default()
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.first().map(|p| vec![Event::Delete(name(p))]).unwrap_or_default()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths {
            [from, to, ..] => vec![Event::Delete(name(from)), Event::Create(name(to))],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// The path relative to the first watched root containing it, or the full path.
fn relative_name(path: &Path, roots: &[PathBuf]) -> String {
    roots
        .iter()
        .find_map(|root| path.strip_prefix(root).ok())
        .filter(|relative| !relative.as_os_str().is_empty())
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn roots() -> Vec<PathBuf> {
        vec![PathBuf::from("/watched")]
    }

    #[test]
    fn creations_and_removals_become_events() {
        let paths = vec![PathBuf::from("/watched/foo.txt")];
        assert_eq!(
            translate(&EventKind::Create(CreateKind::File), &paths, &roots()),
            vec![Event::Create("foo.txt".to_string())]
        );
        assert_eq!(
            translate(&EventKind::Remove(RemoveKind::Any), &paths, &roots()),
            vec![Event::Delete("foo.txt".to_string())]
        );
    }

    #[test]
    fn renames_map_to_delete_then_create() {
        let paths = vec![
            PathBuf::from("/watched/old.txt"),
            PathBuf::from("/watched/sub/new.txt"),
        ];
        let expected_new = Path::new("sub").join("new.txt").to_string_lossy().to_string();
        assert_eq!(
            translate(
                &EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &paths,
                &roots()
            ),
            vec![
                Event::Delete("old.txt".to_string()),
                Event::Create(expected_new)
            ]
        );
        assert_eq!(
            translate(
                &EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                &paths[..1],
                &roots()
            ),
            vec![Event::Delete("old.txt".to_string())]
        );
    }

    #[test]
    fn writes_are_ignored() {
        let paths = vec![PathBuf::from("/watched/foo.txt")];
        assert!(translate(
            &EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &paths,
            &roots()
        )
        .is_empty());
        assert!(translate(&EventKind::Create(CreateKind::File), &[], &roots()).is_empty());
    }

    #[test]
    fn paths_outside_roots_are_kept_whole() {
        let paths = vec![PathBuf::from("/elsewhere/foo.txt")];
        assert_eq!(
            translate(&EventKind::Create(CreateKind::File), &paths, &roots()),
            vec![Event::Create("/elsewhere/foo.txt".to_string())]
        );
    }
}
