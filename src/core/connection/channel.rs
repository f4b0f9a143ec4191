//! Transport channel seam between a transfer session and the data channel.
//!
//! A session only needs to send frames, watch the outbound buffer, and
//! receive [`ChannelEvent`]s. [`RtcChannel`] adapts a WebRTC data channel;
//! tests use the in-memory `loopback` pair.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;

use crate::core::config::BACKPRESSURE_POLL_INTERVAL;
use crate::core::error::TransferError;

/// What arrives from the remote side.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Frame(Bytes),
    Closed,
    Error(String),
}

/// Duplex, ordered, reliable binary channel.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Bytes accepted by `send` but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    /// Resolves after the buffered amount drops to the low threshold.
    /// May also resolve spuriously; callers re-check the amount.
    async fn wait_buffered_low(&self);

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Hold the producer while the outbound buffer is above `high`.
///
/// Once above the high mark, waits until the buffer is at or below `low`.
/// Wake-ups come from the buffered-amount-low notification with a bounded
/// polling fallback. A buffer that makes no progress for `stall_timeout`
/// counts as a lost connection.
pub async fn wait_for_buffer_space(
    channel: &dyn TransportChannel,
    high: usize,
    low: usize,
    stall_timeout: Duration,
) -> Result<(), TransferError> {
    if !channel.is_open() {
        return Err(TransferError::ConnectionLost);
    }
    let mut buffered = channel.buffered_amount().await;
    if buffered <= high {
        return Ok(());
    }

    debug!(
        event = "backpressure_engaged",
        buffered,
        high_watermark = high,
        low_watermark = low,
        "Waiting for send buffer to drain"
    );

    let mut last_progress = Instant::now();
    loop {
        tokio::select! {
            _ = channel.wait_buffered_low() => {}
            _ = tokio::time::sleep(BACKPRESSURE_POLL_INTERVAL) => {}
        }
        if !channel.is_open() {
            return Err(TransferError::ConnectionLost);
        }
        let now = channel.buffered_amount().await;
        if now <= low {
            debug!(event = "backpressure_released", buffered = now);
            return Ok(());
        }
        if now < buffered {
            last_progress = Instant::now();
        } else if last_progress.elapsed() >= stall_timeout {
            warn!(
                event = "backpressure_stalled",
                buffered = now,
                stalled_secs = stall_timeout.as_secs(),
                "Send buffer made no progress"
            );
            return Err(TransferError::ConnectionLost);
        }
        buffered = now;
    }
}

// ── WebRTC data channel ──────────────────────────────────────────────────────

pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
    low: Arc<Notify>,
}

impl RtcChannel {
    /// Wrap `dc`, registering message/close/error handlers and the
    /// buffered-amount-low notification at `low_threshold`.
    ///
    /// Call before the channel opens so no early message is missed.
    pub async fn attach(
        dc: Arc<RTCDataChannel>,
        low_threshold: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let low = Arc::new(Notify::new());

        dc.set_buffered_amount_low_threshold(low_threshold).await;
        let notify = low.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let notify = notify.clone();
            Box::pin(async move {
                notify.notify_one();
            })
        }))
        .await;

        let label = dc.label().to_string();
        let close_tx = tx.clone();
        dc.on_close(Box::new(move || {
            let label = label.clone();
            let tx = close_tx.clone();
            Box::pin(async move {
                info!(event = "dc_closed", channel = %label, "DataChannel closed by transport");
                let _ = tx.send(ChannelEvent::Closed);
            })
        }));

        let label = dc.label().to_string();
        let err_tx = tx.clone();
        dc.on_error(Box::new(move |err| {
            let label = label.clone();
            let tx = err_tx.clone();
            Box::pin(async move {
                error!(event = "dc_error", channel = %label, %err, "DataChannel transport error");
                let _ = tx.send(ChannelEvent::Error(err.to_string()));
            })
        }));

        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                if msg.is_string {
                    debug!(event = "dc_text_ignored", bytes = msg.data.len());
                    return;
                }
                let _ = tx.send(ChannelEvent::Frame(msg.data));
            })
        }));

        (Arc::new(Self { dc, low }), rx)
    }

    pub fn label(&self) -> &str {
        self.dc.label()
    }
}

#[async_trait]
impl TransportChannel for RtcChannel {
    async fn send(&self, frame: Bytes) -> Result<()> {
        let state = self.dc.ready_state();
        if state != RTCDataChannelState::Open {
            return Err(anyhow!("data channel not open: {state:?}"));
        }
        self.dc.send(&frame).await?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn wait_buffered_low(&self) {
        self.low.notified().await;
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(event = "dc_close_error", error = %e);
        }
    }
}

// ── In-memory pair ───────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::loopback::pair;
    use super::*;

    #[tokio::test]
    async fn loopback_delivers_in_order() {
        let ((a, _a_rx), (_b, mut b_rx)) = pair(Duration::ZERO, 0);
        for i in 0..5u8 {
            a.send(Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(b_rx.recv().await.unwrap(), ChannelEvent::Frame(Bytes::from(vec![i])));
        }
    }

    #[tokio::test]
    async fn close_reaches_both_sides_after_pending_frames() {
        let ((a, mut a_rx), (b, mut b_rx)) = pair(Duration::ZERO, 0);
        a.send(Bytes::from_static(b"last")).await.unwrap();
        a.close().await;

        assert_eq!(b_rx.recv().await.unwrap(), ChannelEvent::Frame(Bytes::from_static(b"last")));
        assert_eq!(b_rx.recv().await.unwrap(), ChannelEvent::Closed);
        assert_eq!(a_rx.recv().await.unwrap(), ChannelEvent::Closed);
        assert!(!b.is_open());
        assert!(b.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_wait_releases_below_low_mark() {
        let ((a, _a_rx), (_b, _b_rx)) = pair(Duration::from_millis(10), 100);
        for _ in 0..10 {
            a.send(Bytes::from(vec![0u8; 50])).await.unwrap();
        }
        assert_eq!(a.buffered_amount().await, 500);

        wait_for_buffer_space(a.as_ref(), 200, 100, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(a.buffered_amount().await <= 100);
    }

    #[tokio::test]
    async fn buffer_wait_is_immediate_below_high_mark() {
        let ((a, _a_rx), (_b, _b_rx)) = pair(Duration::ZERO, 0);
        wait_for_buffer_space(a.as_ref(), 1024, 512, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_buffer_counts_as_lost_connection() {
        // Frames sit in the buffer far longer than the stall timeout.
        let ((a, _a_rx), (_b, _b_rx)) = pair(Duration::from_secs(3600), 0);
        for _ in 0..4 {
            a.send(Bytes::from(vec![0u8; 10])).await.unwrap();
        }
        let started = Instant::now();
        let err = wait_for_buffer_space(a.as_ref(), 10, 5, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::ConnectionLost);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(a.is_open());
    }

    #[tokio::test]
    async fn buffer_wait_fails_on_closed_channel() {
        let ((a, _a_rx), (_b, _b_rx)) = pair(Duration::ZERO, 0);
        a.fail("boom");
        let err = wait_for_buffer_space(a.as_ref(), 1, 0, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::ConnectionLost);
    }
}
