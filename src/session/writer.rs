//! Dedicated writer task for the session's send path.
//!
//! The session serializes outbound frames into its `pending` buffer; when
//! no write is in flight the buffers swap and the full `writing` buffer is
//! handed to this task. The task reports completion so the session can
//! credit its metrics, recycle the emptied buffer and swap again.
//!
//! ```text
//! session task ── mpsc(1): Vec<u8> ──► writer task ──► socket
//!      ▲                                   │
//!      └──── mpsc(1): (bytes, buffer) ─────┘
//! ```
//!
//! At most one buffer is ever in flight, which is exactly the session's
//! "one outstanding write" invariant.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Completion notice: bytes written plus the emptied buffer for reuse, or
/// the error that killed the write side.
pub(crate) type WriteDone = std::io::Result<(usize, Vec<u8>)>;

/// Channel ends the session keeps to drive its writer task.
pub(crate) struct WriterChannels {
    /// Hands a full buffer to the writer. Capacity 1: a send only succeeds
    /// while no write is in flight.
    pub tx: mpsc::Sender<Vec<u8>>,
    /// Receives one completion notice per buffer.
    pub done: mpsc::Receiver<WriteDone>,
    /// The running task, aborted on session close.
    pub task: JoinHandle<()>,
}

/// Spawn the writer task owning the stream's write half.
pub(crate) fn spawn_writer<W>(writer: W) -> WriterChannels
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let (done_tx, done_rx) = mpsc::channel(1);
    let task = tokio::spawn(writer_loop(writer, rx, done_tx));
    WriterChannels {
        tx,
        done: done_rx,
        task,
    }
}

/// Main writer loop: write each buffer fully, flush, report back.
async fn writer_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Vec<u8>>,
    done: mpsc::Sender<WriteDone>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(mut buf) = rx.recv().await {
        let result = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                let written = buf.len();
                buf.clear();
                if done.send(Ok((written, buf))).await.is_err() {
                    return; // Session gone, nothing left to report to.
                }
            }
            Err(err) => {
                let _ = done.send(Err(err)).await;
                return;
            }
        }
    }
}
