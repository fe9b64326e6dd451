//! Watch facility seam and the notify-based implementation.
//!
//! A [`WatchBackend`] turns a directory into a live [`WatchHandle`]. Raw
//! notifications never touch stream state directly: the backend hands them to
//! a [`NotificationSink`], which queues them for the stream's own task.

use std::path::{Path, PathBuf};

use notify::event::ModifyKind;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::event::RawChange;

/// A raw report from the watch facility.
#[derive(Debug)]
pub enum Notification {
    /// A file changed.
    Change(RawChange),

    /// The facility failed.
    Error(notify::Error),
}

/// Hands notifications from arbitrary threads to the stream's task.
///
/// Sending never blocks. Once the stream has stopped, sends are refused and
/// the notification is dropped.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a change. Returns `false` if the stream has stopped.
    pub fn change(&self, change: RawChange) -> bool {
        self.tx.send(Notification::Change(change)).is_ok()
    }

    /// Queue a facility error. Returns `false` if the stream has stopped.
    pub fn error(&self, error: notify::Error) -> bool {
        self.tx.send(Notification::Error(error)).is_ok()
    }

    /// Whether the receiving stream has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Something that can watch a single directory.
pub trait WatchBackend: Send + 'static {
    /// The live subscription.
    type Handle: WatchHandle;

    /// Subscribe to changes in `directory`.
    ///
    /// Notifications must go to `sink`, and none may be delivered before
    /// [`WatchHandle::set_enabled`] is called with `true`.
    fn subscribe(&self, directory: &Path, sink: NotificationSink) -> Result<Self::Handle>;
}

/// A live subscription. Dropping the handle disposes it.
pub trait WatchHandle: Send + 'static {
    /// Start or stop raising notifications.
    fn set_enabled(&mut self, enabled: bool) -> Result<()>;
}

/// Watches a directory (non-recursively) with the platform's native facility.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyBackend;

impl WatchBackend for NotifyBackend {
    type Handle = NotifyHandle;

    fn subscribe(&self, directory: &Path, sink: NotificationSink) -> Result<NotifyHandle> {
        let watched = directory.to_path_buf();
        let watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(e) = facility_failure(&event, &watched) {
                        sink.error(e);
                        return;
                    }
                    for change in RawChange::from_notify(event) {
                        if !sink.change(change) {
                            trace!("Dropping notification for stopped stream");
                            break;
                        }
                    }
                }
                Err(e) => {
                    sink.error(e);
                }
            },
        )?;

        Ok(NotifyHandle {
            watcher,
            directory: directory.to_path_buf(),
            enabled: false,
        })
    }
}

/// Events that mean the watch can no longer be trusted.
///
/// A rescan request means the facility's queue overran and changes were
/// lost. Removing or moving the watched directory itself invalidates the
/// watch.
pub(crate) fn facility_failure(event: &notify::Event, directory: &Path) -> Option<notify::Error> {
    if event.need_rescan() {
        return Some(
            notify::Error::generic("event queue overflowed, changes were lost")
                .add_path(directory.to_path_buf()),
        );
    }

    let invalidates = matches!(
        event.kind,
        notify::EventKind::Remove(_) | notify::EventKind::Modify(ModifyKind::Name(_))
    );
    if invalidates && event.paths.iter().any(|path| path == directory) {
        return Some(
            notify::Error::generic("watched directory was removed or moved")
                .add_path(directory.to_path_buf()),
        );
    }

    None
}

/// A notify watcher bound to one directory.
pub struct NotifyHandle {
    watcher: RecommendedWatcher,
    directory: PathBuf,
    enabled: bool,
}

impl WatchHandle for NotifyHandle {
    fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        if enabled == self.enabled {
            return Ok(());
        }

        if enabled {
            self.watcher
                .watch(&self.directory, RecursiveMode::NonRecursive)?;
        } else {
            self.watcher.unwatch(&self.directory)?;
        }

        self.enabled = enabled;
        Ok(())
    }
}

/// The stream's single live watch, disposed at most once.
pub(crate) struct ActiveWatch<H: WatchHandle> {
    handle: Option<H>,
    directory: PathBuf,
}

impl<H: WatchHandle> ActiveWatch<H> {
    /// Subscribe and enable delivery. The sink is wired before delivery starts.
    pub(crate) fn start<B>(backend: &B, directory: &Path, sink: NotificationSink) -> Result<Self>
    where
        B: WatchBackend<Handle = H>,
    {
        let mut handle = backend.subscribe(directory, sink)?;
        handle.set_enabled(true)?;
        debug!("Started watching: {}", directory.display());

        Ok(Self {
            handle: Some(handle),
            directory: directory.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub(crate) fn is_live(&self) -> bool {
        self.handle.is_some()
    }

    /// Disable and drop the handle. Later calls do nothing.
    pub(crate) fn dispose(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        if let Err(e) = handle.set_enabled(false) {
            warn!("Failed to disable watch for {}: {e}", self.directory.display());
        }
        drop(handle);

        debug!("Disposed watch for {}", self.directory.display());
    }
}

impl<H: WatchHandle> Drop for ActiveWatch<H> {
    fn drop(&mut self) {
        self.dispose();
    }
}
