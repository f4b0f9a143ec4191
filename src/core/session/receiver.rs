//! Receiving half of a transfer.
//!
//! Waits for the sender's metadata, runs the name through the advisor and,
//! when the approval policy says so, pauses the sender until the user
//! decides. Chunks that were already in flight during the pause are held
//! and folded in on approval. Progress goes back to the sender at most once
//! per report interval, plus a final 100% report on completion.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use super::sink::{FileSink, SavedFile};
use super::state::{FileDescriptor, TransferStatus};
use super::{TransferSession, send_control};
use crate::core::connection::{ChannelEvent, TransportChannel};
use crate::core::error::TransferError;
use crate::core::pipeline::chunk::Assembly;
use crate::core::protocol::ControlMessage;
use crate::core::protocol::frame::{Frame, decode_frame};
use crate::core::security::advisor::{self, Advisory, ApprovalPolicy};

/// Asks the user whether a flagged file may be received.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn decide(&self, file: &FileDescriptor, advisory: &Advisory) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOutcome {
    pub file: FileDescriptor,
    pub saved: SavedFile,
}

/// Mutable state of one inbound transfer.
#[derive(Default)]
struct Inbound {
    file: Option<FileDescriptor>,
    assembly: Option<Assembly>,
    /// Chunks that arrived while the user was deciding.
    held: Vec<(u32, Bytes)>,
    decision: Option<JoinHandle<bool>>,
    end_of_stream: Option<u32>,
    last_report: Option<Instant>,
}

impl TransferSession {
    /// Run the inbound transfer over an open channel.
    ///
    /// Returns the saved file once complete. The channel is closed on
    /// return.
    pub async fn receive_file(
        &self,
        channel: Arc<dyn TransportChannel>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        sink: Arc<dyn FileSink>,
        policy: ApprovalPolicy,
        gate: Arc<dyn ApprovalGate>,
    ) -> Result<ReceiveOutcome, TransferError> {
        self.bind_channel(channel.clone()).await?;
        self.transition(TransferStatus::Transferring).await;

        let result = self
            .drive_receive(channel.as_ref(), &mut events, sink, policy, gate)
            .await;
        match &result {
            Ok(_) => {
                // Keep the channel up so the sender sees the final report.
                let linger = self.config().completion_linger;
                let _ = timeout(linger, wait_peer_close(&mut events)).await;
            }
            Err(e) => {
                self.finish_with(e.clone()).await;
            }
        }
        self.release_channel().await;
        result
    }

    async fn drive_receive(
        &self,
        channel: &dyn TransportChannel,
        events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
        sink: Arc<dyn FileSink>,
        policy: ApprovalPolicy,
        gate: Arc<dyn ApprovalGate>,
    ) -> Result<ReceiveOutcome, TransferError> {
        let transfer_id = self.id();
        let stop = self.stop_signal().clone();
        let mut state = Inbound::default();

        loop {
            tokio::select! {
                event = events.recv() => {
                    let raw = match event {
                        Some(ChannelEvent::Frame(raw)) => raw,
                        Some(ChannelEvent::Error(reason)) => {
                            warn!(event = "receiver_channel_error", %transfer_id, %reason);
                            return Err(TransferError::ConnectionLost);
                        }
                        Some(ChannelEvent::Closed) | None => {
                            return Err(TransferError::ConnectionLost);
                        }
                    };
                    self.on_frame(channel, &mut state, raw, policy, &gate).await?;
                }
                approved = wait_decision(&mut state.decision), if state.decision.is_some() => {
                    state.decision = None;
                    self.on_decision(channel, &mut state, approved).await?;
                }
                _ = stop.wait() => {
                    let _ = send_control(
                        channel,
                        &ControlMessage::Cancel { reason: Some("cancelled by receiver".into()) },
                    )
                    .await;
                    return Err(TransferError::cancelled("cancelled by receiver"));
                }
            }

            if state.decision.is_some() {
                continue;
            }
            let Some(assembly) = &state.assembly else {
                continue;
            };
            if assembly.is_complete() {
                break;
            }
            if let Some(chunks_sent) = state.end_of_stream {
                warn!(
                    event = "chunk_count_mismatch",
                    %transfer_id,
                    chunks_sent,
                    expected = assembly.expected(),
                    received = assembly.received(),
                );
                return Err(TransferError::CountMismatch {
                    expected: assembly.expected(),
                    received: assembly.received(),
                });
            }
        }

        self.finish(channel, state, sink).await
    }

    async fn on_frame(
        &self,
        channel: &dyn TransportChannel,
        state: &mut Inbound,
        raw: Bytes,
        policy: ApprovalPolicy,
        gate: &Arc<dyn ApprovalGate>,
    ) -> Result<(), TransferError> {
        let transfer_id = self.id();
        let frame = match decode_frame(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = "frame_decode_error", %transfer_id, error = %e);
                return Ok(());
            }
        };

        match frame {
            Frame::Chunk { index, data } => {
                if state.decision.is_some() {
                    state.held.push((index, data));
                    return Ok(());
                }
                let Some(assembly) = state.assembly.as_mut() else {
                    warn!(event = "chunk_before_metadata", %transfer_id, index);
                    return Ok(());
                };
                assembly.append_received(index, &data);
                self.report_progress(channel, state).await;
            }
            Frame::Control(ControlMessage::Metadata {
                transfer_id: announced,
                name,
                byte_size,
                mime_type,
                last_modified,
                chunk_count,
            }) => {
                if state.file.is_some() {
                    warn!(event = "metadata_duplicate", %transfer_id);
                    return Ok(());
                }
                if announced != transfer_id {
                    return Err(TransferError::Validation(format!(
                        "metadata for transfer {announced}, expected {transfer_id}"
                    )));
                }
                if (byte_size == 0) != (chunk_count == 0) {
                    return Err(TransferError::Validation(format!(
                        "{chunk_count} chunks announced for {byte_size} bytes"
                    )));
                }

                let file = FileDescriptor {
                    name,
                    byte_size,
                    mime_type,
                    last_modified,
                    chunk_count,
                };
                info!(
                    event = "metadata_received",
                    %transfer_id,
                    name = %file.name,
                    bytes = byte_size,
                    chunks = chunk_count,
                );
                self.set_file(file.clone()).await;
                state.assembly = Some(Assembly::new(chunk_count, byte_size));

                let advisory = advisor::classify(&file.name);
                if !advisory.is_clear() {
                    warn!(
                        event = "file_advisory",
                        %transfer_id,
                        level = %advisory.level,
                        rationale = advisory.rationale.unwrap_or_default(),
                    );
                }
                if policy.requires_approval(&advisory) {
                    send_control(channel, &ControlMessage::Pause).await?;
                    self.transition(TransferStatus::PendingApproval).await;
                    info!(event = "approval_requested", %transfer_id, "Waiting for user approval");
                    let gate = gate.clone();
                    let pending = file.clone();
                    state.decision = Some(tokio::spawn(async move {
                        gate.decide(&pending, &advisory).await
                    }));
                }
                state.file = Some(file);
            }
            Frame::Control(ControlMessage::EndOfStream { chunks_sent }) => {
                debug!(event = "end_of_stream", %transfer_id, chunks_sent);
                state.end_of_stream = Some(chunks_sent);
            }
            Frame::Control(ControlMessage::Cancel { reason }) => {
                info!(event = "transfer_cancelled_by_peer", %transfer_id, reason = ?reason);
                return Err(TransferError::Cancelled { reason });
            }
            Frame::Control(
                other @ (ControlMessage::Pause
                | ControlMessage::Resume
                | ControlMessage::Progress { .. }),
            ) => {
                warn!(event = "unexpected_control", %transfer_id, kind = other.kind());
            }
        }
        Ok(())
    }

    async fn on_decision(
        &self,
        channel: &dyn TransportChannel,
        state: &mut Inbound,
        approved: bool,
    ) -> Result<(), TransferError> {
        let transfer_id = self.id();
        if !approved {
            info!(event = "transfer_rejected", %transfer_id, "User rejected the file");
            let _ = send_control(
                channel,
                &ControlMessage::Cancel {
                    reason: Some("rejected by receiver".into()),
                },
            )
            .await;
            return Err(TransferError::cancelled("rejected by receiver"));
        }

        info!(
            event = "transfer_approved",
            %transfer_id,
            held = state.held.len(),
            "User approved the file"
        );
        self.transition(TransferStatus::TransferringResumed).await;
        send_control(channel, &ControlMessage::Resume).await?;
        if let Some(assembly) = state.assembly.as_mut() {
            for (index, data) in state.held.drain(..) {
                assembly.append_received(index, &data);
            }
        }
        self.report_progress(channel, state).await;
        Ok(())
    }

    /// Record progress locally and report it to the sender if the last
    /// report is old enough.
    async fn report_progress(&self, channel: &dyn TransportChannel, state: &mut Inbound) {
        let Some(assembly) = &state.assembly else {
            return;
        };
        let progress = assembly.progress_percent();
        self.record_progress(progress).await;

        let interval = self.config().progress_interval;
        let due = state.last_report.is_none_or(|t| t.elapsed() >= interval);
        if !due || assembly.is_complete() {
            return;
        }
        state.last_report = Some(Instant::now());
        let _ = send_control(
            channel,
            &ControlMessage::Progress {
                progress,
                chunks_received: assembly.received(),
                chunk_count: assembly.expected(),
            },
        )
        .await;
    }

    async fn finish(
        &self,
        channel: &dyn TransportChannel,
        mut state: Inbound,
        sink: Arc<dyn FileSink>,
    ) -> Result<ReceiveOutcome, TransferError> {
        let (Some(file), Some(assembly)) = (state.file.take(), state.assembly.take()) else {
            return Err(TransferError::Validation("finished without metadata".into()));
        };
        let chunk_count = assembly.expected();
        let content = assembly.finalize()?;
        let saved = sink
            .save(&file, content)
            .await
            .map_err(|e| TransferError::Io(format!("{e:#}")))?;

        self.transition(TransferStatus::Completed).await;
        info!(
            event = "transfer_complete",
            transfer_id = %self.id(),
            bytes = saved.byte_size,
            "Transfer completed"
        );
        // Confirmation for the sender; it may already be gone.
        let _ = send_control(
            channel,
            &ControlMessage::Progress {
                progress: 100.0,
                chunks_received: chunk_count,
                chunk_count,
            },
        )
        .await;

        Ok(ReceiveOutcome { file, saved })
    }
}

async fn wait_decision(slot: &mut Option<JoinHandle<bool>>) -> bool {
    match slot {
        // A gate that panicked counts as a rejection.
        Some(handle) => handle.await.unwrap_or(false),
        None => std::future::pending().await,
    }
}

async fn wait_peer_close(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        if matches!(event, ChannelEvent::Closed | ChannelEvent::Error(_)) {
            return;
        }
    }
}
