use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_channel::Receiver;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use cmdrelay_protocol::InvocationEvent;
use cmdrelay_protocol::InvocationId;
use cmdrelay_protocol::OutputStream;

use crate::correlation::FeedEvent;
use crate::correlation::InvocationSnapshot;
use crate::correlation::run_correlator;
use crate::error::RelayErr;
use crate::error::Result;
use crate::invocation::DispatchParams;
use crate::spawn::exit_code_of;
use crate::spawn::spawn_invocation_child;

const FEED_CHANNEL_CAPACITY: usize = 128;

// I/O buffer sizing
const READ_CHUNK_SIZE: usize = 8192; // bytes per read

/// Entry point for dispatching invocations and observing their output.
///
/// The manager holds no shared mutable state itself: the active pointer, the
/// result buffers and the status registry all live inside the coordinating
/// task, and the manager only talks to it through the feed channel.
#[derive(Debug, Clone)]
pub struct InvocationManager {
    feed_tx: mpsc::Sender<FeedEvent>,
    next_invocation_id: Arc<AtomicU64>,
}

impl InvocationManager {
    /// Returns the manager together with the observer event stream.
    ///
    /// The coordinating task keeps running until the manager and every reader
    /// task it spawned have been dropped.
    pub fn new() -> (Self, Receiver<InvocationEvent>) {
        let (feed_tx, feed_rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = async_channel::unbounded();
        tokio::spawn(run_correlator(feed_rx, events_tx));
        (
            Self {
                feed_tx,
                next_invocation_id: Arc::new(AtomicU64::new(0)),
            },
            events_rx,
        )
    }

    /// Spawns the external command described by `params` and makes it the
    /// active invocation, superseding any invocation still running.
    ///
    /// Returns the invocation id once the process handle exists. A spawn
    /// failure surfaces synchronously as [`RelayErr::Spawn`]; the invocation
    /// is marked Failed, the active pointer is cleared and no output chunk for
    /// it is ever accepted.
    pub async fn dispatch(&self, params: DispatchParams) -> Result<InvocationId> {
        let tokens = params.parse_command()?;
        let (program, args) = tokens.split_first().ok_or(RelayErr::EmptyCommandLine)?;

        let DispatchParams {
            working_dir,
            env,
            invocation_id,
            ..
        } = params;
        let invocation_id = invocation_id.unwrap_or_else(|| self.generate_invocation_id());

        let (ack_tx, ack_rx) = oneshot::channel();
        self.feed(FeedEvent::Activate {
            invocation_id: invocation_id.clone(),
            ack: ack_tx,
        })
        .await?;
        ack_rx.await.map_err(|_| RelayErr::CorrelatorClosed)??;

        let child = match spawn_invocation_child(program, args, working_dir.as_ref(), &env) {
            Ok(child) => child,
            Err(err) => {
                self.feed(FeedEvent::SpawnFailed {
                    invocation_id: invocation_id.clone(),
                })
                .await?;
                return Err(err);
            }
        };

        self.feed(FeedEvent::Started {
            invocation_id: invocation_id.clone(),
        })
        .await?;
        self.supervise(invocation_id.clone(), child)?;
        Ok(invocation_id)
    }

    /// Clears the active pointer and both result buffers. Idempotent: calling
    /// this on an already-cleared core has no observable effect.
    pub async fn reset(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.feed(FeedEvent::Reset { ack: ack_tx }).await?;
        ack_rx.await.map_err(|_| RelayErr::CorrelatorClosed)
    }

    /// Id of the invocation whose output is currently being surfaced, if any.
    pub async fn active_invocation(&self) -> Result<Option<InvocationId>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.feed(FeedEvent::ActiveQuery { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| RelayErr::CorrelatorClosed)
    }

    pub async fn status(&self, invocation_id: &InvocationId) -> Result<Option<InvocationSnapshot>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.feed(FeedEvent::StatusQuery {
            invocation_id: invocation_id.clone(),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| RelayErr::CorrelatorClosed)
    }

    /// Wires the child's output pipes and exit status into the feed.
    fn supervise(&self, invocation_id: InvocationId, mut child: Child) -> Result<()> {
        // Both pipes were configured with `Stdio::piped()`, so `take()` should
        // normally return `Some`; anything else is an exceptional I/O error.
        let stdout = child.stdout.take().ok_or_else(|| {
            RelayErr::Io(std::io::Error::other(
                "stdout pipe was unexpectedly not available",
            ))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            RelayErr::Io(std::io::Error::other(
                "stderr pipe was unexpectedly not available",
            ))
        })?;

        let stdout_task = tokio::spawn(stream_output(
            BufReader::new(stdout),
            OutputStream::Stdout,
            invocation_id.clone(),
            self.feed_tx.clone(),
        ));
        let stderr_task = tokio::spawn(stream_output(
            BufReader::new(stderr),
            OutputStream::Stderr,
            invocation_id.clone(),
            self.feed_tx.clone(),
        ));

        let feed_tx = self.feed_tx.clone();
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(err) => {
                    tracing::error!(%invocation_id, "failed to await child exit: {err}");
                    -1
                }
            };
            // Drain both readers before reporting the exit, so every chunk is
            // enqueued ahead of the exit event and the terminal result cannot
            // miss a tail fragment.
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let _ = feed_tx
                .send(FeedEvent::Exited {
                    invocation_id,
                    exit_code,
                })
                .await;
        });
        Ok(())
    }

    async fn feed(&self, event: FeedEvent) -> Result<()> {
        self.feed_tx
            .send(event)
            .await
            .map_err(|_| RelayErr::CorrelatorClosed)
    }

    fn generate_invocation_id(&self) -> InvocationId {
        let seq = self.next_invocation_id.fetch_add(1, Ordering::SeqCst);
        InvocationId::new(format!("inv-{seq}"))
    }
}

/// Streams one pipe of the child process into the feed in 8 KiB chunks until
/// EOF. Chunks of a superseded invocation still flow through here; the
/// correlator is the one that drops them.
async fn stream_output<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: OutputStream,
    invocation_id: InvocationId,
    feed_tx: mpsc::Sender<FeedEvent>,
) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let event = FeedEvent::Chunk {
                    invocation_id: invocation_id.clone(),
                    stream,
                    payload: buf[..n].to_vec(),
                };
                if feed_tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(%invocation_id, ?stream, "output stream read failed: {err}");
                break;
            }
        }
    }
}
