//! Sending half of a transfer.
//!
//! Sends the metadata, then pumps chunk frames while honouring three
//! suspension points: the receiver's pause, the send-buffer high water mark
//! and the chunk worker round-trip. A separate task reads what the receiver
//! says (pause, resume, cancel, progress) and feeds the pump through a
//! `watch` flag and a signal queue.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::state::TransferStatus;
use super::{TransferSession, send_control};
use crate::core::config::BACKPRESSURE_STALL_TIMEOUT;
use crate::core::connection::channel::wait_for_buffer_space;
use crate::core::connection::{ChannelEvent, TransportChannel};
use crate::core::error::TransferError;
use crate::core::pipeline::chunk::{self, ChunkRange, FileSource};
use crate::core::pipeline::worker::ChunkWorker;
use crate::core::protocol::ControlMessage;
use crate::core::protocol::frame::{Frame, decode_frame, encode_chunk_frame};

/// How long to wait for the receiver's explanation once the channel dies
/// under the pump.
const LOSS_GRACE: Duration = Duration::from_secs(1);

/// What the receiver told us, as far as completion is concerned.
#[derive(Debug)]
enum RemoteSignal {
    /// Full receipt confirmed.
    Confirmed,
    Cancelled(Option<String>),
    Lost,
}

impl TransferSession {
    /// Run the outbound transfer over an open channel.
    ///
    /// Returns once the session reached a terminal state. The channel is
    /// closed on return.
    pub async fn send_file(
        &self,
        channel: Arc<dyn TransportChannel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        source: FileSource,
    ) -> Result<(), TransferError> {
        self.bind_channel(channel.clone()).await?;
        let result = self.drive_send(channel, events, source).await;
        if let Err(e) = &result {
            self.finish_with(e.clone()).await;
        }
        self.release_channel().await;
        result
    }

    async fn drive_send(
        &self,
        channel: Arc<dyn TransportChannel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        source: FileSource,
    ) -> Result<(), TransferError> {
        let file = self.snapshot().await.file;
        let config = self.config().clone();

        let ranges = chunk::split(file.byte_size, config.chunk_size)?;
        if ranges.len() as u64 != u64::from(file.chunk_count) {
            return Err(TransferError::Validation(format!(
                "{} chunks announced, {} produced",
                file.chunk_count,
                ranges.len()
            )));
        }

        self.transition(TransferStatus::Transferring).await;
        info!(
            event = "chunk_pump_start",
            transfer_id = %self.id(),
            name = %file.name,
            bytes = file.byte_size,
            chunks = file.chunk_count,
        );

        send_control(
            channel.as_ref(),
            &ControlMessage::Metadata {
                transfer_id: self.id(),
                name: file.name.clone(),
                byte_size: file.byte_size,
                mime_type: file.mime_type.clone(),
                last_modified: file.last_modified,
                chunk_count: file.chunk_count,
            },
        )
        .await?;

        let (pause_tx, pause_rx) = watch::channel(false);
        let (remote_tx, mut remote_rx) = mpsc::unbounded_channel();
        let inbound = tokio::spawn(watch_receiver(
            self.clone(),
            events,
            file.chunk_count,
            pause_tx,
            remote_tx,
        ));

        let worker = ChunkWorker::spawn(&source, config.worker_timeout);
        let outcome = self
            .await_completion(channel.as_ref(), &worker, ranges, pause_rx, &mut remote_rx)
            .await;
        drop(worker);

        if outcome.is_ok() {
            self.transition(TransferStatus::Completed).await;
            info!(event = "transfer_complete", transfer_id = %self.id(), "Transfer completed");
            // Let the receiver's final report arrive before closing.
            let confirmed = timeout(config.completion_linger, wait_confirmed(&mut remote_rx)).await;
            debug!(event = "completion_linger_done", confirmed = confirmed.is_ok());
        }
        inbound.abort();
        outcome
    }

    /// Run the pump, then wait until the buffer drains or the receiver
    /// confirms, whichever comes first.
    async fn await_completion(
        &self,
        channel: &dyn TransportChannel,
        worker: &ChunkWorker,
        ranges: Vec<ChunkRange>,
        mut pause_rx: watch::Receiver<bool>,
        remote_rx: &mut mpsc::UnboundedReceiver<RemoteSignal>,
    ) -> Result<(), TransferError> {
        let stop = self.stop_signal().clone();
        let pump = self.pump(channel, worker, ranges, pause_rx.clone());
        tokio::pin!(pump);
        let mut pumping = true;
        let mut pause_open = true;

        loop {
            let paused = *pause_rx.borrow();
            tokio::select! {
                result = &mut pump, if pumping => match result {
                    Ok(()) => pumping = false,
                    Err(TransferError::ConnectionLost) => {
                        return Err(explain_loss(remote_rx).await);
                    }
                    Err(e) => return Err(e),
                },
                signal = remote_rx.recv() => match signal {
                    Some(RemoteSignal::Confirmed) => {
                        info!(event = "transfer_confirmed", transfer_id = %self.id());
                        return Ok(());
                    }
                    Some(RemoteSignal::Cancelled(reason)) => {
                        return Err(TransferError::Cancelled { reason });
                    }
                    Some(RemoteSignal::Lost) | None => return Err(TransferError::ConnectionLost),
                },
                changed = pause_rx.changed(), if pause_open => {
                    pause_open = changed.is_ok();
                }
                drained = drained(channel), if !pumping && !paused => {
                    drained?;
                    debug!(event = "send_buffer_drained", transfer_id = %self.id());
                    return Ok(());
                }
                _ = stop.wait() => {
                    let _ = send_control(
                        channel,
                        &ControlMessage::Cancel { reason: Some("cancelled by sender".into()) },
                    )
                    .await;
                    return Err(TransferError::cancelled("cancelled by sender"));
                }
            }
        }
    }

    async fn pump(
        &self,
        channel: &dyn TransportChannel,
        worker: &ChunkWorker,
        ranges: Vec<ChunkRange>,
        mut paused: watch::Receiver<bool>,
    ) -> Result<(), TransferError> {
        let total = u32::try_from(ranges.len())
            .map_err(|_| TransferError::Validation(format!("{} chunks", ranges.len())))?;
        if total == 0 {
            return Ok(());
        }
        let config = self.config();

        for range in ranges {
            if *paused.borrow() {
                debug!(event = "chunk_pump_paused", index = range.index);
                let resumed = paused.wait_for(|p| !*p).await.is_ok();
                if !resumed {
                    return Err(TransferError::ConnectionLost);
                }
                debug!(event = "chunk_pump_resumed", index = range.index);
            }

            wait_for_buffer_space(
                channel,
                config.buffered_high,
                config.buffered_low,
                BACKPRESSURE_STALL_TIMEOUT,
            )
            .await?;

            let data = worker.materialize(range).await?;
            channel
                .send(encode_chunk_frame(range.index, &data))
                .await
                .map_err(|e| {
                    warn!(event = "chunk_send_failed", index = range.index, error = %e);
                    TransferError::ConnectionLost
                })?;

            let sent = range.index + 1;
            self.record_local_progress(f64::from(sent) / f64::from(total) * 100.0)
                .await;
        }

        wait_for_buffer_space(
            channel,
            config.buffered_high,
            config.buffered_low,
            BACKPRESSURE_STALL_TIMEOUT,
        )
        .await?;
        send_control(channel, &ControlMessage::EndOfStream { chunks_sent: total }).await?;
        info!(event = "chunk_pump_done", transfer_id = %self.id(), chunks = total);
        Ok(())
    }
}

/// Resolves once nothing is left in the send buffer.
async fn drained(channel: &dyn TransportChannel) -> Result<(), TransferError> {
    loop {
        if channel.buffered_amount().await == 0 {
            return Ok(());
        }
        if !channel.is_open() {
            return Err(TransferError::ConnectionLost);
        }
        tokio::select! {
            _ = channel.wait_buffered_low() => {}
            _ = tokio::time::sleep(crate::core::config::BACKPRESSURE_POLL_INTERVAL) => {}
        }
    }
}

/// The channel died; a cancel that raced the close wins over "lost".
async fn explain_loss(remote_rx: &mut mpsc::UnboundedReceiver<RemoteSignal>) -> TransferError {
    match timeout(LOSS_GRACE, remote_rx.recv()).await {
        Ok(Some(RemoteSignal::Cancelled(reason))) => TransferError::Cancelled { reason },
        _ => TransferError::ConnectionLost,
    }
}

async fn wait_confirmed(remote_rx: &mut mpsc::UnboundedReceiver<RemoteSignal>) {
    while let Some(signal) = remote_rx.recv().await {
        if matches!(signal, RemoteSignal::Confirmed) {
            return;
        }
    }
}

/// Inbound side of the sender: translate receiver messages into pause
/// state, progress and completion signals.
async fn watch_receiver(
    session: TransferSession,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    chunk_count: u32,
    pause_tx: watch::Sender<bool>,
    remote: mpsc::UnboundedSender<RemoteSignal>,
) {
    let transfer_id = session.id();
    while let Some(event) = events.recv().await {
        let raw = match event {
            ChannelEvent::Frame(raw) => raw,
            ChannelEvent::Closed => {
                debug!(event = "sender_channel_closed", %transfer_id);
                let _ = remote.send(RemoteSignal::Lost);
                return;
            }
            ChannelEvent::Error(reason) => {
                warn!(event = "sender_channel_error", %transfer_id, %reason);
                let _ = remote.send(RemoteSignal::Lost);
                return;
            }
        };

        let msg = match decode_frame(raw) {
            Ok(Frame::Control(msg)) => msg,
            Ok(Frame::Chunk { index, .. }) => {
                warn!(event = "unexpected_chunk", %transfer_id, index, "Receiver sent a chunk frame");
                continue;
            }
            Err(e) => {
                warn!(event = "frame_decode_error", %transfer_id, error = %e);
                continue;
            }
        };

        match msg {
            ControlMessage::Pause => {
                info!(event = "transfer_paused", %transfer_id, "Receiver paused the transfer");
                let _ = pause_tx.send(true);
                session.transition(TransferStatus::PendingApproval).await;
            }
            ControlMessage::Resume => {
                info!(event = "transfer_resumed", %transfer_id, "Receiver resumed the transfer");
                let _ = pause_tx.send(false);
                session.transition(TransferStatus::TransferringResumed).await;
            }
            ControlMessage::Cancel { reason } => {
                info!(event = "transfer_cancelled_by_peer", %transfer_id, reason = ?reason);
                let _ = remote.send(RemoteSignal::Cancelled(reason));
                return;
            }
            ControlMessage::Progress {
                progress,
                chunks_received,
                chunk_count: reported,
            } => {
                session.record_progress(progress).await;
                if reported == chunk_count && chunks_received >= chunk_count {
                    let _ = remote.send(RemoteSignal::Confirmed);
                }
            }
            other @ (ControlMessage::Metadata { .. } | ControlMessage::EndOfStream { .. }) => {
                warn!(event = "unexpected_control", %transfer_id, kind = other.kind());
            }
        }
    }
    let _ = remote.send(RemoteSignal::Lost);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::channel::loopback::pair;
    use crate::core::protocol::frame::FRAME_CHUNK;
    use crate::core::security::advisor::{Advisory, ApprovalPolicy};
    use crate::core::session::sink::memory::MemorySink;
    use crate::core::session::test_support::*;
    use crate::core::session::{ApprovalGate, Direction, FileDescriptor, Transfer};
    use crate::utils::sos::SignalOfStop;
    use async_trait::async_trait;
    use bytes::Bytes;
    use uuid::Uuid;

    struct Gate {
        approve: bool,
        delay: Duration,
    }

    #[async_trait]
    impl ApprovalGate for Gate {
        async fn decide(&self, _file: &FileDescriptor, _advisory: &Advisory) -> bool {
            tokio::time::sleep(self.delay).await;
            self.approve
        }
    }

    struct Run {
        sender: TransferSession,
        receiver: TransferSession,
        sink: Arc<MemorySink>,
        sent_frames: Vec<Bytes>,
        peak_buffered: usize,
        sender_result: Result<(), TransferError>,
        receiver_ok: bool,
    }

    async fn run_transfer(
        name: &str,
        data: Bytes,
        latency: Duration,
        policy: ApprovalPolicy,
        gate: Gate,
        sender_updates: Option<tokio::sync::broadcast::Sender<Transfer>>,
    ) -> Run {
        let config = small_config();
        let root = SignalOfStop::new();
        let id = Uuid::new_v4();
        let file = descriptor(name, data.len() as u64, config.chunk_size);

        let sender =
            TransferSession::new(id, Direction::Outbound, file.clone(), &root, config.clone());
        let receiver = TransferSession::new(id, Direction::Inbound, file, &root, config.clone());

        if let Some(fwd) = sender_updates {
            let mut rx = sender.subscribe();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(t) => {
                            let done = t.status.is_terminal();
                            let _ = fwd.send(t);
                            if done {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
            });
        }

        let ((a, a_rx), (b, b_rx)) = pair(latency, config.buffered_low);
        let sink = Arc::new(MemorySink::default());

        let recv_task = {
            let receiver = receiver.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                receiver
                    .receive_file(b, b_rx, sink, policy, Arc::new(gate))
                    .await
                    .is_ok()
            })
        };
        let sender_result = sender
            .send_file(a.clone(), a_rx, FileSource::Memory(data))
            .await;
        let receiver_ok = recv_task.await.unwrap();

        Run {
            sender,
            receiver,
            sink,
            sent_frames: a.sent_frames(),
            peak_buffered: a.peak_buffered(),
            sender_result,
            receiver_ok,
        }
    }

    fn chunk_frames(frames: &[Bytes]) -> usize {
        frames.iter().filter(|f| f.first() == Some(&FRAME_CHUNK)).count()
    }

    #[tokio::test]
    async fn transfers_file_end_to_end() {
        let data = payload(50 * 1024 + 17);
        let run = run_transfer(
            "photo.png",
            data.clone(),
            Duration::ZERO,
            ApprovalPolicy::AnyAdvisory,
            Gate { approve: true, delay: Duration::ZERO },
            None,
        )
        .await;

        assert!(run.sender_result.is_ok());
        assert!(run.receiver_ok);
        assert_eq!(run.sender.status().await, TransferStatus::Completed);
        assert_eq!(run.receiver.status().await, TransferStatus::Completed);
        assert_eq!(chunk_frames(&run.sent_frames), 51);
        assert_eq!(run.sink.files(), vec![("photo.png".to_string(), data)]);
    }

    #[tokio::test]
    async fn sender_progress_never_decreases() {
        let (tx, mut rx) = tokio::sync::broadcast::channel(4096);
        let run = run_transfer(
            "data.bin",
            payload(64 * 1024),
            Duration::from_micros(200),
            ApprovalPolicy::AnyAdvisory,
            Gate { approve: true, delay: Duration::ZERO },
            Some(tx),
        )
        .await;
        assert!(run.sender_result.is_ok());

        let mut last = 0.0;
        let mut seen = 0;
        while let Ok(t) = rx.try_recv() {
            assert!(t.progress_percent >= last, "{} < {last}", t.progress_percent);
            if !t.status.is_terminal() {
                assert!(t.progress_percent <= 100.0);
            }
            last = t.progress_percent;
            seen += 1;
        }
        assert!(seen > 0);
        assert_eq!(run.sender.snapshot().await.progress_percent, 100.0);
    }

    #[tokio::test]
    async fn pause_and_resume_rebuilds_identical_bytes() {
        let data = payload(40 * 1024 + 3);
        let run = run_transfer(
            "invoice.pdf.exe",
            data.clone(),
            Duration::from_micros(500),
            ApprovalPolicy::CautionOnly,
            Gate { approve: true, delay: Duration::from_millis(30) },
            None,
        )
        .await;

        assert!(run.receiver_ok, "receiver failed: {:?}", run.receiver.snapshot().await.error);
        assert_eq!(run.receiver.status().await, TransferStatus::Completed);
        assert_eq!(run.sink.files()[0].1, data);
    }

    #[tokio::test]
    async fn rejection_cancels_both_sides() {
        let run = run_transfer(
            "invoice.pdf.exe",
            payload(200 * 1024),
            Duration::from_millis(1),
            ApprovalPolicy::AnyAdvisory,
            Gate { approve: false, delay: Duration::ZERO },
            None,
        )
        .await;

        assert!(!run.receiver_ok);
        assert_eq!(run.receiver.status().await, TransferStatus::Cancelled);
        assert_eq!(run.sender.status().await, TransferStatus::Cancelled);
        assert!(matches!(run.sender_result, Err(TransferError::Cancelled { .. })));
        assert!(run.sink.files().is_empty());
    }

    #[tokio::test]
    async fn zero_byte_file_sends_metadata_only() {
        let run = run_transfer(
            "empty.txt",
            Bytes::new(),
            Duration::ZERO,
            ApprovalPolicy::AnyAdvisory,
            Gate { approve: true, delay: Duration::ZERO },
            None,
        )
        .await;

        assert!(run.sender_result.is_ok());
        assert_eq!(run.sent_frames.len(), 1);
        assert_eq!(chunk_frames(&run.sent_frames), 0);
        assert_eq!(run.receiver.status().await, TransferStatus::Completed);
        assert_eq!(run.sink.files(), vec![("empty.txt".to_string(), Bytes::new())]);
    }

    #[tokio::test]
    async fn close_after_completion_keeps_completed() {
        let run = run_transfer(
            "notes.txt",
            payload(3000),
            Duration::ZERO,
            ApprovalPolicy::AnyAdvisory,
            Gate { approve: true, delay: Duration::ZERO },
            None,
        )
        .await;

        run.sender.close().await;
        run.receiver.close().await;
        assert_eq!(run.sender.status().await, TransferStatus::Completed);
        assert_eq!(run.receiver.status().await, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn send_buffer_stays_under_high_water_mark() {
        let config = small_config();
        let data = payload(16 * config.buffered_high + 300);
        let run = run_transfer(
            "scan.png",
            data.clone(),
            Duration::from_millis(1),
            ApprovalPolicy::AnyAdvisory,
            Gate { approve: true, delay: Duration::ZERO },
            None,
        )
        .await;

        assert!(run.sender_result.is_ok());
        assert!(run.receiver_ok);
        assert_eq!(run.sink.files(), vec![("scan.png".to_string(), data)]);
        // The buffer must actually have filled for the bound to mean anything.
        assert!(run.peak_buffered > config.buffered_low);
        assert!(run.peak_buffered <= config.buffered_high + config.chunk_size + 5);
    }

    #[tokio::test]
    async fn receiver_disappearing_fails_sender() {
        let config = small_config();
        let root = SignalOfStop::new();
        let data = payload(100 * 1024);
        let sender = TransferSession::new(
            Uuid::new_v4(),
            Direction::Outbound,
            descriptor("big.bin", data.len() as u64, config.chunk_size),
            &root,
            config.clone(),
        );
        let ((a, a_rx), (b, _b_rx)) = pair(Duration::from_millis(1), config.buffered_low);

        let killer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            b.fail("peer vanished");
        });
        let result = sender.send_file(a, a_rx, FileSource::Memory(data)).await;
        killer.await.unwrap();

        assert_eq!(result, Err(TransferError::ConnectionLost));
        assert_eq!(sender.status().await, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn local_close_stops_pump() {
        let config = small_config();
        let root = SignalOfStop::new();
        let data = payload(100 * 1024);
        let sender = TransferSession::new(
            Uuid::new_v4(),
            Direction::Outbound,
            descriptor("big.bin", data.len() as u64, config.chunk_size),
            &root,
            config.clone(),
        );
        let ((a, a_rx), (_b, _b_rx)) = pair(Duration::from_millis(1), config.buffered_low);

        let closer = {
            let sender = sender.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                sender.close().await;
            })
        };
        let result = sender.send_file(a.clone(), a_rx, FileSource::Memory(data)).await;
        closer.await.unwrap();

        assert!(matches!(result, Err(TransferError::Cancelled { .. })));
        assert_eq!(sender.status().await, TransferStatus::Cancelled);
        assert!(chunk_frames(&a.sent_frames()) < 100);
    }
}
