//! Per-app child output sinks
//!
//! Each instance's stdout/stderr pipe is pumped line-by-line into the app's
//! configured log file by a background task. Rotation and retention are
//! outside the supervisor; these sinks only append.

use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tracing::warn;

/// Pump one child output stream into a log file until the stream closes.
///
/// The pipe is drained even when the sink cannot be opened; a child blocked
/// on a full stdout pipe would otherwise never exit.
pub fn spawn_line_pump<R>(reader: R, path: PathBuf, app_name: String, instance_id: u32)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();

        let mut sink = match OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(app = %app_name, instance = instance_id, path = %path.display(), error = %e,
                    "Cannot open log sink, discarding instance output");
                None
            }
        };

        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(file) = sink.as_mut() {
                let mut buf = line.into_bytes();
                buf.push(b'\n');
                if let Err(e) = file.write_all(&buf).await {
                    warn!(app = %app_name, instance = instance_id, error = %e,
                        "Log sink write failed, discarding further output");
                    sink = None;
                }
            }
        }
    });
}
