//! Single-writer correlation of output chunks against the active invocation.
//!
//! All mutable state — the active pointer, the two result buffers and the
//! status registry — is owned exclusively by the coordinating task running
//! [`run_correlator`]. Readers, the dispatcher and callers communicate with it
//! only through the [`FeedEvent`] channel, so the identity-filter invariant is
//! enforced structurally rather than by convention.

use std::collections::HashMap;

use async_channel::Sender;
use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use cmdrelay_protocol::InvocationEvent;
use cmdrelay_protocol::InvocationId;
use cmdrelay_protocol::InvocationResult;
use cmdrelay_protocol::InvocationStatus;
use cmdrelay_protocol::OutputChunkEvent;
use cmdrelay_protocol::OutputStream;

use crate::error::RelayErr;
use crate::error::Result;

/// Point-in-time view of an invocation's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationSnapshot {
    pub status: InvocationStatus,
    pub started_at: DateTime<Utc>,
}

/// Messages carried by the single-consumer feed into the coordinating task.
#[derive(Debug)]
pub(crate) enum FeedEvent {
    /// A new invocation becomes the active one; any invocation still Created
    /// or Running is superseded and both buffers reset.
    Activate {
        invocation_id: InvocationId,
        ack: oneshot::Sender<Result<()>>,
    },
    /// The process handle for the invocation exists.
    Started { invocation_id: InvocationId },
    /// One raw output fragment from a reader task. Evaluated against the
    /// active pointer at delivery time, not at production time.
    Chunk {
        invocation_id: InvocationId,
        stream: OutputStream,
        payload: Vec<u8>,
    },
    /// The process exited. Readers are drained before this is sent, so every
    /// accepted chunk precedes it in the feed.
    Exited {
        invocation_id: InvocationId,
        exit_code: i32,
    },
    /// The process never started; the invocation is failed and, if it was the
    /// active one, the pointer and buffers are cleared.
    SpawnFailed { invocation_id: InvocationId },
    /// Explicit reset: the detached invocation (if still Created or Running)
    /// is superseded, then the pointer and both buffers clear. Idempotent.
    Reset { ack: oneshot::Sender<()> },
    ActiveQuery {
        reply: oneshot::Sender<Option<InvocationId>>,
    },
    StatusQuery {
        invocation_id: InvocationId,
        reply: oneshot::Sender<Option<InvocationSnapshot>>,
    },
}

#[derive(Debug)]
struct InvocationRecord {
    status: InvocationStatus,
    started_at: DateTime<Utc>,
}

/// Incremental UTF-8 decoder for one output stream.
///
/// Reader tasks cut the byte stream at arbitrary boundaries, so a multibyte
/// character may straddle two fragments. An incomplete trailing sequence is
/// carried over to the next fragment; only bytes that can never form a valid
/// sequence are skipped.
#[derive(Debug, Default)]
struct StreamDecoder {
    pending: Vec<u8>,
}

impl StreamDecoder {
    /// Returns the decoded text together with whether any truly invalid
    /// bytes had to be skipped.
    fn decode(&mut self, payload: &[u8]) -> (String, bool) {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(payload);
        let mut decoded = String::with_capacity(bytes.len());
        let mut skipped = false;
        let mut input = bytes.as_slice();
        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    decoded.push_str(text);
                    break;
                }
                Err(err) => {
                    let (valid, rest) = input.split_at(err.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        decoded.push_str(text);
                    }
                    match err.error_len() {
                        Some(len) => {
                            skipped = true;
                            input = &rest[len..];
                        }
                        None => {
                            // Incomplete tail; the next fragment may finish it.
                            self.pending = rest.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        (decoded, skipped)
    }

    fn clear(&mut self) -> bool {
        let had_pending = !self.pending.is_empty();
        self.pending.clear();
        had_pending
    }
}

#[derive(Debug, Default)]
struct CorrelationState {
    active: Option<InvocationId>,
    stdout: String,
    stderr: String,
    stdout_decoder: StreamDecoder,
    stderr_decoder: StreamDecoder,
    records: HashMap<InvocationId, InvocationRecord>,
}

impl CorrelationState {
    fn activate(&mut self, invocation_id: InvocationId) -> Result<()> {
        if self.records.contains_key(&invocation_id) {
            return Err(RelayErr::DuplicateInvocationId(invocation_id));
        }
        self.supersede_active();
        self.clear_buffers();
        self.records.insert(
            invocation_id.clone(),
            InvocationRecord {
                status: InvocationStatus::Created,
                started_at: Utc::now(),
            },
        );
        self.active = Some(invocation_id);
        Ok(())
    }

    fn mark_running(&mut self, invocation_id: &InvocationId) {
        if let Some(record) = self.records.get_mut(invocation_id)
            && record.status == InvocationStatus::Created
        {
            record.status = InvocationStatus::Running;
        }
    }

    /// Identity filter plus aggregation: admits the chunk only when it
    /// belongs to the active invocation at delivery time, and returns the
    /// decoded text for forwarding to observers.
    fn accept_chunk(
        &mut self,
        invocation_id: &InvocationId,
        stream: OutputStream,
        payload: &[u8],
    ) -> Option<String> {
        if self.active.as_ref() != Some(invocation_id) {
            tracing::debug!(%invocation_id, "dropping chunk from non-active invocation");
            return None;
        }
        let decoder = match stream {
            OutputStream::Stdout => &mut self.stdout_decoder,
            OutputStream::Stderr => &mut self.stderr_decoder,
        };
        let (chunk, skipped) = decoder.decode(payload);
        if skipped {
            // Local recovery: invalid bytes are skipped, the stream continues
            // and the invocation is not failed.
            tracing::warn!(%invocation_id, "skipping undecodable bytes in output fragment");
        }
        if chunk.is_empty() {
            return None;
        }
        match stream {
            OutputStream::Stdout => self.stdout.push_str(&chunk),
            OutputStream::Stderr => self.stderr.push_str(&chunk),
        }
        Some(chunk)
    }

    /// Freezes the buffers into a terminal result and clears the active
    /// pointer. The exit of a non-active invocation produces no result.
    fn finish(&mut self, invocation_id: &InvocationId, exit_code: i32) -> Option<InvocationResult> {
        if self.active.as_ref() != Some(invocation_id) {
            tracing::debug!(%invocation_id, exit_code, "ignoring exit of non-active invocation");
            return None;
        }
        self.active = None;
        if self.stdout_decoder.clear() | self.stderr_decoder.clear() {
            tracing::warn!(%invocation_id, "discarding incomplete trailing bytes at exit");
        }
        if let Some(record) = self.records.get_mut(invocation_id) {
            record.status = InvocationStatus::Completed;
        }
        Some(InvocationResult {
            stdout: std::mem::take(&mut self.stdout),
            stderr: std::mem::take(&mut self.stderr),
            exit_code,
        })
    }

    fn fail(&mut self, invocation_id: &InvocationId) {
        if let Some(record) = self.records.get_mut(invocation_id) {
            record.status = InvocationStatus::Failed;
        }
        if self.active.as_ref() == Some(invocation_id) {
            self.reset();
        }
    }

    /// Marks the invocation the pointer still references as superseded and
    /// clears the pointer. A record already in a terminal state is left alone.
    fn supersede_active(&mut self) {
        if let Some(previous) = self.active.take()
            && let Some(record) = self.records.get_mut(&previous)
            && matches!(
                record.status,
                InvocationStatus::Created | InvocationStatus::Running
            )
        {
            tracing::debug!(%previous, "superseding running invocation");
            record.status = InvocationStatus::Superseded;
        }
    }

    fn clear_buffers(&mut self) {
        self.stdout.clear();
        self.stderr.clear();
        self.stdout_decoder.clear();
        self.stderr_decoder.clear();
    }

    fn reset(&mut self) {
        self.supersede_active();
        self.clear_buffers();
    }

    fn active(&self) -> Option<InvocationId> {
        self.active.clone()
    }

    fn snapshot(&self, invocation_id: &InvocationId) -> Option<InvocationSnapshot> {
        self.records
            .get(invocation_id)
            .map(|record| InvocationSnapshot {
                status: record.status,
                started_at: record.started_at,
            })
    }
}

/// Consumer loop of the coordinating task. Exits when every feed sender has
/// been dropped.
pub(crate) async fn run_correlator(
    mut feed_rx: mpsc::Receiver<FeedEvent>,
    events_tx: Sender<InvocationEvent>,
) {
    let mut state = CorrelationState::default();
    while let Some(event) = feed_rx.recv().await {
        match event {
            FeedEvent::Activate { invocation_id, ack } => {
                let _ = ack.send(state.activate(invocation_id));
            }
            FeedEvent::Started { invocation_id } => state.mark_running(&invocation_id),
            FeedEvent::Chunk {
                invocation_id,
                stream,
                payload,
            } => {
                if let Some(chunk) = state.accept_chunk(&invocation_id, stream, &payload) {
                    let delta = InvocationEvent::OutputDelta(OutputChunkEvent {
                        invocation_id,
                        stream,
                        chunk,
                    });
                    // Observers may have gone away; aggregation continues
                    // regardless.
                    let _ = events_tx.send(delta).await;
                }
            }
            FeedEvent::Exited {
                invocation_id,
                exit_code,
            } => {
                if let Some(result) = state.finish(&invocation_id, exit_code) {
                    let _ = events_tx
                        .send(InvocationEvent::Completed {
                            invocation_id,
                            result,
                        })
                        .await;
                }
            }
            FeedEvent::SpawnFailed { invocation_id } => state.fail(&invocation_id),
            FeedEvent::Reset { ack } => {
                state.reset();
                let _ = ack.send(());
            }
            FeedEvent::ActiveQuery { reply } => {
                let _ = reply.send(state.active());
            }
            FeedEvent::StatusQuery {
                invocation_id,
                reply,
            } => {
                let _ = reply.send(state.snapshot(&invocation_id));
            }
        }
    }
    tracing::debug!("invocation feed closed; correlator exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(raw: &str) -> InvocationId {
        InvocationId::new(raw)
    }

    fn running(state: &mut CorrelationState, raw: &str) -> InvocationId {
        let invocation_id = id(raw);
        state
            .activate(invocation_id.clone())
            .expect("activate invocation");
        state.mark_running(&invocation_id);
        invocation_id
    }

    #[test]
    fn stdout_is_exact_concatenation_of_accepted_chunks() {
        let mut state = CorrelationState::default();
        let abc = running(&mut state, "abc");

        for chunk in [
            "START RequestId=abc",
            "Processing payment for order=92138 amount=42.00",
            "END RequestId=abc",
        ] {
            let accepted = state.accept_chunk(&abc, OutputStream::Stdout, chunk.as_bytes());
            assert_eq!(accepted.as_deref(), Some(chunk));
        }

        let result = state.finish(&abc, 0).expect("terminal result");
        assert_eq!(
            result.stdout,
            "START RequestId=abcProcessing payment for order=92138 amount=42.00END RequestId=abc"
        );
        assert_eq!(result.stderr, "");
        assert_eq!(result.exit_code, 0);
        assert_eq!(
            state.snapshot(&abc).map(|s| s.status),
            Some(InvocationStatus::Completed)
        );
        assert_eq!(state.active(), None);
    }

    #[test]
    fn streams_aggregate_independently() {
        let mut state = CorrelationState::default();
        let inv = running(&mut state, "mixed");

        state.accept_chunk(&inv, OutputStream::Stdout, b"out-1");
        state.accept_chunk(&inv, OutputStream::Stderr, b"err-1");
        state.accept_chunk(&inv, OutputStream::Stdout, b"out-2");

        let result = state.finish(&inv, 2).expect("terminal result");
        assert_eq!(result.stdout, "out-1out-2");
        assert_eq!(result.stderr, "err-1");
        assert_eq!(result.exit_code, 2);
    }

    #[test]
    fn late_chunks_from_superseded_invocation_are_dropped() {
        let mut state = CorrelationState::default();
        let x1 = running(&mut state, "x1");
        let x2 = running(&mut state, "x2");

        // Two queued chunks tagged with the superseded id arrive after the
        // pointer moved on.
        assert_eq!(state.accept_chunk(&x1, OutputStream::Stdout, b"late"), None);
        assert_eq!(
            state.accept_chunk(&x1, OutputStream::Stderr, b"late too"),
            None
        );
        assert_eq!(
            state.snapshot(&x1).map(|s| s.status),
            Some(InvocationStatus::Superseded)
        );

        let result = state.finish(&x2, 0).expect("terminal result");
        assert_eq!(result.stdout, "");
        assert_eq!(result.stderr, "");
    }

    #[test]
    fn exit_of_superseded_invocation_produces_no_result() {
        let mut state = CorrelationState::default();
        let x1 = running(&mut state, "x1");
        let x2 = running(&mut state, "x2");

        assert_eq!(state.finish(&x1, 0), None);
        assert_eq!(
            state.snapshot(&x1).map(|s| s.status),
            Some(InvocationStatus::Superseded)
        );
        assert_eq!(state.active(), Some(x2));
    }

    #[test]
    fn activation_resets_leftover_buffers() {
        let mut state = CorrelationState::default();
        let first = running(&mut state, "first");
        // Ends mid-sequence so a decoder carry is left behind too.
        state.accept_chunk(&first, OutputStream::Stdout, b"stale\xc3");

        let second = running(&mut state, "second");
        state.accept_chunk(&second, OutputStream::Stdout, b"fresh");

        let result = state.finish(&second, 0).expect("terminal result");
        assert_eq!(result.stdout, "fresh");
    }

    #[test]
    fn reset_is_idempotent() {
        let mut state = CorrelationState::default();
        let inv = running(&mut state, "inv");
        state.accept_chunk(&inv, OutputStream::Stdout, b"partial");

        state.reset();
        assert_eq!(state.active(), None);
        state.reset();
        assert_eq!(state.active(), None);

        // No residue is observable after a later invocation completes.
        let next = running(&mut state, "next");
        let result = state.finish(&next, 0).expect("terminal result");
        assert_eq!(result.stdout, "");
    }

    #[test]
    fn reset_supersedes_the_detached_invocation() {
        let mut state = CorrelationState::default();
        let inv = running(&mut state, "detached");

        state.reset();
        assert_eq!(
            state.snapshot(&inv).map(|s| s.status),
            Some(InvocationStatus::Superseded)
        );

        // The orphaned process exiting later neither yields a result nor
        // moves the record out of its terminal state.
        assert_eq!(state.finish(&inv, 0), None);
        assert_eq!(
            state.snapshot(&inv).map(|s| s.status),
            Some(InvocationStatus::Superseded)
        );
    }

    #[test]
    fn spawn_failure_clears_active_pointer() {
        let mut state = CorrelationState::default();
        let inv = id("doomed");
        state.activate(inv.clone()).expect("activate invocation");

        state.fail(&inv);
        assert_eq!(state.active(), None);
        assert_eq!(
            state.snapshot(&inv).map(|s| s.status),
            Some(InvocationStatus::Failed)
        );
        assert_eq!(state.accept_chunk(&inv, OutputStream::Stdout, b"no"), None);
    }

    #[test]
    fn undecodable_fragment_is_skipped_not_fatal() {
        let mut state = CorrelationState::default();
        let inv = running(&mut state, "binary");

        assert_eq!(
            state.accept_chunk(&inv, OutputStream::Stdout, &[0xff, 0xfe, 0xfd]),
            None
        );
        assert_eq!(
            state
                .accept_chunk(&inv, OutputStream::Stdout, b"still here")
                .as_deref(),
            Some("still here")
        );

        let result = state.finish(&inv, 0).expect("terminal result");
        assert_eq!(result.stdout, "still here");
    }

    #[test]
    fn multibyte_sequence_split_across_fragments_is_reassembled() {
        let mut state = CorrelationState::default();
        let inv = running(&mut state, "split");

        // Reader fragments cut `é` (0xC3 0xA9) between its two bytes, as an
        // 8 KiB read boundary would.
        let mut first = "a".repeat(8191).into_bytes();
        first.push(0xc3);
        let accepted = state
            .accept_chunk(&inv, OutputStream::Stdout, &first)
            .expect("valid prefix is forwarded");
        assert_eq!(accepted, "a".repeat(8191));

        assert_eq!(
            state
                .accept_chunk(&inv, OutputStream::Stdout, b"\xa9tail\n")
                .as_deref(),
            Some("\u{e9}tail\n")
        );

        let result = state.finish(&inv, 0).expect("terminal result");
        let mut expected = "a".repeat(8191);
        expected.push('\u{e9}');
        expected.push_str("tail\n");
        assert_eq!(result.stdout, expected);
    }

    #[test]
    fn carry_only_fragment_is_held_not_forwarded() {
        let mut state = CorrelationState::default();
        let inv = running(&mut state, "euro");

        // First two bytes of `€` (0xE2 0x82 0xAC): nothing decodable yet.
        assert_eq!(
            state.accept_chunk(&inv, OutputStream::Stdout, b"\xe2\x82"),
            None
        );
        assert_eq!(
            state
                .accept_chunk(&inv, OutputStream::Stdout, b"\xac42")
                .as_deref(),
            Some("\u{20ac}42")
        );

        let result = state.finish(&inv, 0).expect("terminal result");
        assert_eq!(result.stdout, "\u{20ac}42");
    }

    #[test]
    fn incomplete_tail_at_exit_is_dropped() {
        let mut state = CorrelationState::default();
        let inv = running(&mut state, "truncated");

        assert_eq!(
            state
                .accept_chunk(&inv, OutputStream::Stdout, b"ok\xc3")
                .as_deref(),
            Some("ok")
        );

        let result = state.finish(&inv, 0).expect("terminal result");
        assert_eq!(result.stdout, "ok");

        // The dangling byte does not leak into a later invocation either.
        let next = running(&mut state, "next");
        assert_eq!(
            state
                .accept_chunk(&next, OutputStream::Stdout, b"clean")
                .as_deref(),
            Some("clean")
        );
    }

    #[test]
    fn invocation_ids_are_never_reused() {
        let mut state = CorrelationState::default();
        let inv = running(&mut state, "once");
        state.finish(&inv, 0).expect("terminal result");

        assert!(matches!(
            state.activate(inv),
            Err(RelayErr::DuplicateInvocationId(_))
        ));
    }
}
