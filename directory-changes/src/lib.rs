//! # Directory Changes
//!
//! This crate turns file system notifications for a single directory into a
//! demand-driven stream. The watch facility pushes notifications whenever it
//! likes; the consumer pulls one change at a time.
//!
//! ## Features
//!
//! - **Pull-based delivery**: one change per request, in arrival order
//! - **Bounded backlog**: the stream fails once too many changes go unpulled
//! - **Clean teardown**: the watch is disposed exactly once on every exit path
//! - **Custom elements**: map each `(path, kind)` with a combiner closure
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Directory Changes                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  WatchBackend ──► NotificationSink ──► Stage task ──► Stream    │
//! │       │                                   │             │       │
//! │       ▼                                   ▼             ▼       │
//! │  WatchHandle                       buffer + demand   pull/cancel│
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use codex_directory_changes::DirectoryChangesSource;
//! use futures::StreamExt;
//!
//! # async fn run() -> codex_directory_changes::Result<()> {
//! let mut changes = DirectoryChangesSource::new("/tmp/inbox", 200)?.spawn()?;
//! while let Some(change) = changes.next().await {
//!     let change = change?;
//!     println!("{} {}", change.kind, change.path.display());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod source;
pub mod watch;

pub use config::{DEFAULT_MAX_BUFFER_SIZE, DirectoryChangesConfig};
pub use error::{DirectoryChangesError, Result};
pub use event::{ChangeEvent, ChangeKind, RawChange};
pub use source::{DefaultCombiner, DirectoryChanges, DirectoryChangesSource, StageState};
pub use watch::{Notification, NotificationSink, NotifyBackend, NotifyHandle, WatchBackend, WatchHandle};
