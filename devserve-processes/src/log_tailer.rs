//! Log following for `devserve logs -f`.

use miette::{IntoDiagnostic, Result};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Follow a log file, passing each line to `sink`, until cancelled.
///
/// Behaves like `tail -f`: at EOF the file is re-opened so truncation (a
/// flush or restart) resets the read position. Cancellation returns cleanly;
/// file-system errors after the initial open terminate the follow.
pub async fn follow(
    path: &Path,
    cancel: CancellationToken,
    mut sink: impl FnMut(&str),
) -> Result<()> {
    let file = tokio::fs::File::open(path).await.into_diagnostic()?;
    let mut position: u64 = 0;
    let mut reader = BufReader::new(file).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = reader.next_line() => match line {
                Ok(Some(line)) => {
                    position += line.len() as u64 + 1;
                    sink(&line);
                }
                Ok(None) => {
                    // EOF: wait briefly, re-open, and pick up where we were
                    // unless the file shrank underneath us.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let Ok(file) = tokio::fs::File::open(path).await else {
                        return Ok(());
                    };
                    let Ok(metadata) = file.metadata().await else {
                        return Ok(());
                    };
                    if metadata.len() < position {
                        position = 0;
                    }
                    let mut file = file;
                    if let Err(e) = file.seek(std::io::SeekFrom::Start(position)).await {
                        debug!("Failed to seek in {}: {}", path.display(), e);
                        return Ok(());
                    }
                    reader = BufReader::new(file).lines();
                }
                Err(e) => {
                    debug!("Error reading {}: {}", path.display(), e);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn follows_appended_lines_until_cancelled() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        tokio::fs::write(&path, "first\n").await.unwrap();

        let cancel = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let follower = {
            let path = path.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                follow(&path, cancel, move |line| {
                    let _ = tx.send(line.to_string());
                })
                .await
            })
        };

        assert_eq!(rx.recv().await.as_deref(), Some("first"));

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        use tokio::io::AsyncWriteExt;
        file.write_all(b"second\n").await.unwrap();
        file.flush().await.unwrap();

        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(second.as_deref(), Some("second"));

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), follower)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let result = follow(&dir.path().join("absent.log"), cancel, |_| {}).await;
        assert!(result.is_err());
    }
}
