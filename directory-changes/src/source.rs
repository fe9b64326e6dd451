//! Demand-driven stream of changes in a watched directory.
//!
//! [`DirectoryChangesSource`] validates its configuration up front and, once
//! spawned, runs a single task that owns the watch, the event buffer and the
//! consumer's outstanding demand. The consumer side, [`DirectoryChanges`],
//! asks for one element per poll and never receives more than it asked for.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::Stream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace};

use crate::config::DirectoryChangesConfig;
use crate::error::{DirectoryChangesError, Result};
use crate::event::{ChangeEvent, ChangeKind, RawChange};
use crate::watch::{
    ActiveWatch, Notification, NotificationSink, NotifyBackend, WatchBackend, WatchHandle,
};

/// Combiner used when none is supplied.
pub type DefaultCombiner = fn(PathBuf, ChangeKind) -> ChangeEvent;

/// Lifecycle of a running stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageState {
    /// Not yet watching.
    Unstarted,

    /// Watching and delivering changes.
    Running,

    /// Cancelled by the consumer.
    Completed,

    /// Stopped by a buffer overflow or a watch error.
    Failed(String),
}

impl StageState {
    /// Whether the stream has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

/// Watches a directory and streams its changes.
pub struct DirectoryChangesSource<F = DefaultCombiner, B = NotifyBackend> {
    config: DirectoryChangesConfig,
    combiner: F,
    backend: B,
}

impl DirectoryChangesSource {
    /// Watch `directory`, failing the stream once more than
    /// `max_buffer_size` changes are waiting to be pulled.
    ///
    /// Fails immediately if the directory does not exist.
    pub fn new(directory: impl Into<PathBuf>, max_buffer_size: usize) -> Result<Self> {
        Self::from_config(
            DirectoryChangesConfig::new(directory).with_max_buffer_size(max_buffer_size),
        )
    }

    /// Create a source from a config, validating it first.
    pub fn from_config(config: DirectoryChangesConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            combiner: ChangeEvent::new,
            backend: NotifyBackend,
        })
    }
}

impl<F, B> DirectoryChangesSource<F, B> {
    /// Map each `(path, kind)` into a custom element.
    pub fn with_combiner<G, T>(self, combiner: G) -> DirectoryChangesSource<G, B>
    where
        G: FnMut(PathBuf, ChangeKind) -> T,
    {
        DirectoryChangesSource {
            config: self.config,
            combiner,
            backend: self.backend,
        }
    }

    /// Use a different watch facility.
    pub fn with_backend<C: WatchBackend>(self, backend: C) -> DirectoryChangesSource<F, C> {
        DirectoryChangesSource {
            config: self.config,
            combiner: self.combiner,
            backend,
        }
    }

    /// The watched directory.
    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Maximum number of undelivered changes.
    pub fn max_buffer_size(&self) -> usize {
        self.config.max_buffer_size
    }
}

impl<F, B, T> DirectoryChangesSource<F, B>
where
    F: FnMut(PathBuf, ChangeKind) -> T + Send + 'static,
    B: WatchBackend,
    T: Send + 'static,
{
    /// Start watching and return the consumer side of the stream.
    ///
    /// Must be called from within a Tokio runtime. When this returns `Ok`,
    /// the watch is already delivering changes.
    pub fn spawn(self) -> Result<DirectoryChanges<T>> {
        let runtime = Handle::try_current()
            .map_err(|e| DirectoryChangesError::Config(format!("no tokio runtime: {e}")))?;

        let (state_tx, state_rx) = watch::channel(StageState::Unstarted);
        let (sink, notifications) = NotificationSink::channel();
        let watch = ActiveWatch::start(&self.backend, &self.config.directory, sink)?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        state_tx.send_replace(StageState::Running);
        info!(
            "Streaming changes for {} (max buffer size {})",
            self.config.directory.display(),
            self.config.max_buffer_size
        );

        let stage = Stage {
            directory: self.config.directory.clone(),
            max_buffer_size: self.config.max_buffer_size,
            combiner: self.combiner,
            watch,
            buffer: VecDeque::new(),
            demand: false,
            notifications,
            commands: commands_rx,
            signals: signals_tx,
            state: state_tx,
        };
        runtime.spawn(stage.run());

        Ok(DirectoryChanges {
            directory: self.config.directory,
            commands: commands_tx,
            signals: signals_rx,
            state: state_rx,
            pull_in_flight: false,
            done: false,
        })
    }
}

impl<F, B> fmt::Debug for DirectoryChangesSource<F, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryChangesSource")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<F, B> fmt::Display for DirectoryChangesSource<F, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirectoryChangesSource({})", self.config.directory.display())
    }
}

enum Command {
    Pull,
    Cancel,
}

enum Signal<T> {
    Push(T),
    Fail(DirectoryChangesError),
}

enum Termination {
    Cancelled,
    Failed(DirectoryChangesError),
}

/// Everything the stream's task owns. Only [`Stage::run`] touches it.
struct Stage<F, H: WatchHandle, T> {
    directory: PathBuf,
    max_buffer_size: usize,
    combiner: F,
    watch: ActiveWatch<H>,
    buffer: VecDeque<T>,
    demand: bool,
    notifications: mpsc::UnboundedReceiver<Notification>,
    commands: mpsc::UnboundedReceiver<Command>,
    signals: mpsc::UnboundedSender<Signal<T>>,
    state: watch::Sender<StageState>,
}

impl<F, H, T> Stage<F, H, T>
where
    F: FnMut(PathBuf, ChangeKind) -> T,
    H: WatchHandle,
{
    async fn run(mut self) {
        let termination = loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Pull) => self.on_pull(),
                    Some(Command::Cancel) | None => break Termination::Cancelled,
                },

                notification = self.notifications.recv() => match notification {
                    Some(Notification::Change(change)) => {
                        if let Err(e) = self.on_change(change) {
                            break Termination::Failed(e);
                        }
                    }
                    Some(Notification::Error(e)) => {
                        break Termination::Failed(DirectoryChangesError::Watch(e));
                    }
                    None => {
                        break Termination::Failed(DirectoryChangesError::Watch(
                            notify::Error::generic("watch facility closed"),
                        ));
                    }
                },
            }
        };

        self.finish(termination);
    }

    fn on_change(&mut self, change: RawChange) -> Result<()> {
        trace!(
            "{} {} (observed {})",
            change.kind,
            change.path.display(),
            change.observed_at
        );

        let element = (self.combiner)(change.path, change.kind);
        self.buffer.push_back(element);

        if self.buffer.len() > self.max_buffer_size {
            return Err(DirectoryChangesError::buffer_overflow(
                self.max_buffer_size,
                &self.directory,
            ));
        }

        if self.demand {
            if let Some(element) = self.buffer.pop_front() {
                self.demand = false;
                self.push(element);
            }
        }

        Ok(())
    }

    fn on_pull(&mut self) {
        match self.buffer.pop_front() {
            Some(element) => self.push(element),
            None => self.demand = true,
        }
    }

    fn push(&self, element: T) {
        debug!("Delivering change for {}", self.directory.display());
        let _ = self.signals.send(Signal::Push(element));
    }

    fn finish(mut self, termination: Termination) {
        self.notifications.close();
        self.watch.dispose();

        let discarded = self.buffer.len();
        self.buffer.clear();

        match termination {
            Termination::Cancelled => {
                info!(
                    "Change stream for {} cancelled ({discarded} undelivered)",
                    self.directory.display()
                );
                self.state.send_replace(StageState::Completed);
            }
            Termination::Failed(e) => {
                error!("Change stream for {} failed: {e}", self.directory.display());
                self.state.send_replace(StageState::Failed(e.to_string()));
                let _ = self.signals.send(Signal::Fail(e));
            }
        }
    }
}

/// Consumer side of a directory change stream.
///
/// Each poll with no request outstanding asks the stream for exactly one
/// element. A failure is yielded once as `Err`, after which the stream ends.
/// Dropping this handle cancels the stream.
pub struct DirectoryChanges<T> {
    directory: PathBuf,
    commands: mpsc::UnboundedSender<Command>,
    signals: mpsc::UnboundedReceiver<Signal<T>>,
    state: watch::Receiver<StageState>,
    pull_in_flight: bool,
    done: bool,
}

impl<T> DirectoryChanges<T> {
    /// The watched directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StageState {
        self.state.borrow().clone()
    }

    /// Wait until the stream has completed or failed.
    pub async fn terminated(&self) -> StageState {
        let mut state = self.state.clone();
        let result = state
            .wait_for(StageState::is_terminal)
            .await
            .map(|current| (*current).clone());
        result.unwrap_or_else(|_| state.borrow().clone())
    }

    /// Stop watching and discard anything not yet delivered.
    pub fn cancel(&mut self) {
        if self.done {
            return;
        }
        let _ = self.commands.send(Command::Cancel);
        self.done = true;
    }
}

impl<T> Stream for DirectoryChanges<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if !this.pull_in_flight {
            // A stopped stream still has its terminal signal queued.
            let _ = this.commands.send(Command::Pull);
            this.pull_in_flight = true;
        }

        match ready!(this.signals.poll_recv(cx)) {
            Some(Signal::Push(element)) => {
                this.pull_in_flight = false;
                Poll::Ready(Some(Ok(element)))
            }
            Some(Signal::Fail(e)) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl<T> fmt::Debug for DirectoryChanges<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryChanges")
            .field("directory", &self.directory)
            .field("state", &*self.state.borrow())
            .field("pull_in_flight", &self.pull_in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_test::{assert_pending, assert_ready};

    #[derive(Default)]
    struct FakeState {
        sink: Option<NotificationSink>,
        subscriptions: usize,
        enabled: bool,
        disposals: usize,
        fail_subscribe: bool,
    }

    /// Watch facility driven by the test.
    #[derive(Clone, Default)]
    struct FakeBackend(Arc<Mutex<FakeState>>);

    impl FakeBackend {
        fn failing() -> Self {
            let backend = Self::default();
            backend.0.lock().unwrap().fail_subscribe = true;
            backend
        }

        fn emit(&self, path: &str, kind: ChangeKind) -> bool {
            let state = self.0.lock().unwrap();
            match &state.sink {
                Some(sink) if state.enabled => sink.change(RawChange::new(path, kind)),
                _ => false,
            }
        }

        fn fail(&self, message: &str) -> bool {
            let state = self.0.lock().unwrap();
            match &state.sink {
                Some(sink) => sink.error(notify::Error::generic(message)),
                None => false,
            }
        }

        fn subscriptions(&self) -> usize {
            self.0.lock().unwrap().subscriptions
        }

        fn disposals(&self) -> usize {
            self.0.lock().unwrap().disposals
        }
    }

    impl WatchBackend for FakeBackend {
        type Handle = FakeHandle;

        fn subscribe(&self, _directory: &Path, sink: NotificationSink) -> Result<FakeHandle> {
            let mut state = self.0.lock().unwrap();
            if state.fail_subscribe {
                return Err(notify::Error::generic("subscribe refused").into());
            }
            state.subscriptions += 1;
            state.sink = Some(sink);
            Ok(FakeHandle(self.0.clone()))
        }
    }

    struct FakeHandle(Arc<Mutex<FakeState>>);

    impl WatchHandle for FakeHandle {
        fn set_enabled(&mut self, enabled: bool) -> Result<()> {
            self.0.lock().unwrap().enabled = enabled;
            Ok(())
        }
    }

    impl Drop for FakeHandle {
        fn drop(&mut self) {
            let mut state = self.0.lock().unwrap();
            state.disposals += 1;
            state.sink = None;
        }
    }

    fn spawn_fake(
        dir: &TempDir,
        max_buffer_size: usize,
    ) -> (FakeBackend, DirectoryChanges<ChangeEvent>) {
        let backend = FakeBackend::default();
        let changes = DirectoryChangesSource::new(dir.path(), max_buffer_size)
            .unwrap()
            .with_backend(backend.clone())
            .spawn()
            .unwrap();
        (backend, changes)
    }

    /// Let the stream's task drain everything queued for it.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn event(path: &str, kind: ChangeKind) -> ChangeEvent {
        ChangeEvent::new(PathBuf::from(path), kind)
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_enables_watch() {
        let dir = TempDir::new().unwrap();
        let (backend, changes) = spawn_fake(&dir, 4);

        assert_eq!(changes.state(), StageState::Running);
        assert_eq!(changes.directory(), dir.path());
        assert_eq!(backend.subscriptions(), 1);
        assert!(backend.0.lock().unwrap().enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_in_arrival_order() {
        let dir = TempDir::new().unwrap();
        let (backend, mut changes) = spawn_fake(&dir, 8);

        let names = ["/w/a", "/w/b", "/w/c", "/w/d", "/w/e"];
        for name in names {
            assert!(backend.emit(name, ChangeKind::Created));
        }

        for name in names {
            let next = changes.next().await.unwrap().unwrap();
            assert_eq!(next, event(name, ChangeKind::Created));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_outstanding_pull_is_satisfied_by_next_arrival() {
        let dir = TempDir::new().unwrap();
        let (backend, mut changes) = spawn_fake(&dir, 4);

        let mut next = tokio_test::task::spawn(changes.next());
        assert_pending!(next.poll());
        settle().await;
        assert_pending!(next.poll());

        backend.emit("/w/late", ChangeKind::Changed);
        settle().await;

        assert!(next.is_woken());
        let delivered = assert_ready!(next.poll()).unwrap().unwrap();
        assert_eq!(delivered, event("/w/late", ChangeKind::Changed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_element_per_pull() {
        let dir = TempDir::new().unwrap();
        let (backend, mut changes) = spawn_fake(&dir, 8);

        backend.emit("/w/a", ChangeKind::Created);
        backend.emit("/w/b", ChangeKind::Created);
        backend.emit("/w/c", ChangeKind::Created);

        let first = changes.next().await.unwrap().unwrap();
        assert_eq!(first, event("/w/a", ChangeKind::Created));

        settle().await;
        assert!(changes.signals.try_recv().is_err());
        assert!(!changes.pull_in_flight);

        let second = changes.next().await.unwrap().unwrap();
        assert_eq!(second, event("/w/b", ChangeKind::Created));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_fails_and_disposes() {
        let dir = TempDir::new().unwrap();
        let (backend, mut changes) = spawn_fake(&dir, 3);

        for i in 0..4 {
            assert!(backend.emit(&format!("/w/{i}"), ChangeKind::Created));
        }

        let state = changes.terminated().await;
        assert!(matches!(state, StageState::Failed(_)));
        assert_eq!(backend.disposals(), 1);
        assert!(!backend.emit("/w/extra", ChangeKind::Created));

        match changes.next().await {
            Some(Err(DirectoryChangesError::BufferOverflow {
                max_buffer_size,
                directory,
            })) => {
                assert_eq!(max_buffer_size, 3);
                assert_eq!(directory, dir.path().display().to_string());
            }
            other => panic!("expected overflow, got {other:?}"),
        }
        assert!(changes.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_at_limit_does_not_fail() {
        let dir = TempDir::new().unwrap();
        let (backend, mut changes) = spawn_fake(&dir, 3);

        for i in 0..3 {
            backend.emit(&format!("/w/{i}"), ChangeKind::Created);
        }
        settle().await;
        assert_eq!(changes.state(), StageState::Running);

        for i in 0..3 {
            let next = changes.next().await.unwrap().unwrap();
            assert_eq!(next, event(&format!("/w/{i}"), ChangeKind::Created));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_overflow_disposes_once() {
        let dir = TempDir::new().unwrap();
        let (backend, mut changes) = spawn_fake(&dir, 1);

        backend.emit("/w/a", ChangeKind::Created);
        backend.emit("/w/b", ChangeKind::Created);
        changes.terminated().await;

        changes.cancel();
        changes.cancel();
        settle().await;

        assert_eq!(backend.disposals(), 1);
        assert_eq!(backend.subscriptions(), 1);
        assert!(changes.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_error_fails_stream() {
        let dir = TempDir::new().unwrap();
        let (backend, mut changes) = spawn_fake(&dir, 4);

        assert!(backend.fail("event queue overflowed"));

        let state = changes.terminated().await;
        assert!(
            matches!(&state, StageState::Failed(message) if message.contains("event queue overflowed")),
            "{state:?}"
        );
        assert_eq!(backend.disposals(), 1);

        let err = changes.next().await.unwrap().unwrap_err();
        assert!(matches!(err, DirectoryChangesError::Watch(_)));
        assert!(changes.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_completes_and_discards_backlog() {
        let dir = TempDir::new().unwrap();
        let (backend, mut changes) = spawn_fake(&dir, 4);

        backend.emit("/w/a", ChangeKind::Created);
        backend.emit("/w/b", ChangeKind::Changed);
        changes.cancel();

        assert_eq!(changes.terminated().await, StageState::Completed);
        assert_eq!(backend.disposals(), 1);
        assert!(!backend.emit("/w/c", ChangeKind::Deleted));
        assert!(changes.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let dir = TempDir::new().unwrap();
        let (backend, changes) = spawn_fake(&dir, 4);

        let mut state = changes.state.clone();
        drop(changes);

        state.wait_for(StageState::is_terminal).await.unwrap();
        assert_eq!(*state.borrow(), StageState::Completed);
        assert_eq!(backend.disposals(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_combiner() {
        let dir = TempDir::new().unwrap();
        let backend = FakeBackend::default();
        let mut changes = DirectoryChangesSource::new(dir.path(), 4)
            .unwrap()
            .with_backend(backend.clone())
            .with_combiner(|path: PathBuf, kind| format!("{kind}:{}", path.display()))
            .spawn()
            .unwrap();

        backend.emit("/w/notes.md", ChangeKind::Renamed);

        let next = changes.next().await.unwrap().unwrap();
        assert_eq!(next, "renamed:/w/notes.md");
    }

    #[test]
    fn test_missing_directory_fails_construction() {
        let err = DirectoryChangesSource::new("/nonexistent/path/12345", 4).unwrap_err();
        assert!(matches!(err, DirectoryChangesError::DirectoryNotFound(_)));
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_returned() {
        let dir = TempDir::new().unwrap();
        let backend = FakeBackend::failing();

        let err = DirectoryChangesSource::new(dir.path(), 4)
            .unwrap()
            .with_backend(backend.clone())
            .spawn()
            .unwrap_err();

        assert!(matches!(err, DirectoryChangesError::Watch(_)));
        assert_eq!(backend.subscriptions(), 0);
    }

    #[test]
    fn test_spawn_outside_runtime() {
        let dir = TempDir::new().unwrap();
        let backend = FakeBackend::default();

        let err = DirectoryChangesSource::new(dir.path(), 4)
            .unwrap()
            .with_backend(backend.clone())
            .spawn()
            .unwrap_err();

        assert!(matches!(err, DirectoryChangesError::Config(_)));
        assert_eq!(backend.subscriptions(), 0);
    }

    #[test]
    fn test_debug_shows_config() {
        let dir = TempDir::new().unwrap();
        let source = DirectoryChangesSource::new(dir.path(), 7)
            .unwrap()
            .with_combiner(|path: PathBuf, _kind| path);

        let debug = format!("{source:?}");
        assert!(debug.starts_with("DirectoryChangesSource"), "{debug}");
        assert!(debug.contains("max_buffer_size: 7"), "{debug}");
    }

    #[test]
    fn test_handle_is_unpin_for_any_element() {
        fn assert_unpin<S: Unpin>() {}

        assert_unpin::<DirectoryChanges<ChangeEvent>>();
        assert_unpin::<DirectoryChanges<std::marker::PhantomPinned>>();
    }

    #[test]
    fn test_display() {
        let dir = TempDir::new().unwrap();
        let source = DirectoryChangesSource::new(dir.path(), 4).unwrap();

        assert_eq!(
            source.to_string(),
            format!("DirectoryChangesSource({})", dir.path().display())
        );
        assert_eq!(source.max_buffer_size(), 4);
    }
}
