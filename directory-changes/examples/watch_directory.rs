//! Print changes in a directory as JSON lines.
//!
//! Usage: cargo run -p codex-directory-changes --example watch_directory -- <dir> [max-buffer-size]

use anyhow::Context;
use codex_directory_changes::{DEFAULT_MAX_BUFFER_SIZE, DirectoryChangesConfig, DirectoryChangesSource};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let directory = args.next().context("usage: watch_directory <dir> [max-buffer-size]")?;
    let max_buffer_size = match args.next() {
        Some(value) => value.parse().context("max buffer size must be a number")?,
        None => DEFAULT_MAX_BUFFER_SIZE,
    };

    let config = DirectoryChangesConfig::new(directory).with_max_buffer_size(max_buffer_size);
    let source = DirectoryChangesSource::from_config(config)?;
    eprintln!("Watching with {source}, Ctrl-C to stop");

    let mut changes = source.spawn()?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                changes.cancel();
                break;
            }
            next = changes.next() => match next {
                Some(change) => println!("{}", serde_json::to_string(&change?)?),
                None => break,
            },
        }
    }

    eprintln!("Stopped: {:?}", changes.terminated().await);
    Ok(())
}
