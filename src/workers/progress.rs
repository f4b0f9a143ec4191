//! Terminal progress display and prompts.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::{BufRead, Write};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::core::security::advisor::Advisory;
use crate::core::session::{ApprovalGate, FileDescriptor, SessionManager, Transfer, TransferStatus};
use crate::utils::sos::SignalOfStop;

const REFRESH: Duration = Duration::from_millis(250);
const BAR_WIDTH: usize = 24;

/// One status line for a transfer.
pub fn format_line(t: &Transfer) -> String {
    let filled = ((t.progress_percent / 100.0) * BAR_WIDTH as f64).round() as usize;
    let filled = filled.min(BAR_WIDTH);
    format!(
        "[{}{}] {:>5.1}%  {}  {}",
        "#".repeat(filled),
        "-".repeat(BAR_WIDTH - filled),
        t.progress_percent,
        t.file.name,
        t.status,
    )
}

/// Redraw the manager's snapshot until every transfer ended or `stop` fires.
pub fn spawn_display(manager: SessionManager, stop: SignalOfStop) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = String::new();
        loop {
            let transfers = manager.snapshot().await;
            let lines: Vec<String> = transfers.iter().map(format_line).collect();
            let frame = lines.join(" | ");
            if frame != last && !frame.is_empty() {
                eprint!("\r{frame}");
                let _ = std::io::stderr().flush();
                last = frame;
            }
            let finished = !transfers.is_empty() && transfers.iter().all(|t| t.status.is_terminal());
            if finished {
                eprintln!();
                break;
            }
            if stop.select(tokio::time::sleep(REFRESH)).await.is_none() {
                eprintln!();
                break;
            }
        }
    })
}

/// Read one line from stdin without blocking the runtime.
pub async fn read_line(prompt: String) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        eprint!("{prompt}");
        std::io::stderr().flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_string())
    })
    .await
    .context("prompt task failed")?
}

/// Asks on the terminal; anything but "y"/"yes" rejects.
pub struct TerminalGate;

#[async_trait]
impl ApprovalGate for TerminalGate {
    async fn decide(&self, file: &FileDescriptor, advisory: &Advisory) -> bool {
        let prompt = format!(
            "\n{} ({} bytes) was flagged [{}]: {}.\nReceive it anyway? [y/N] ",
            file.name,
            file.byte_size,
            advisory.level,
            advisory.rationale.unwrap_or("no details"),
        );
        match read_line(prompt).await {
            Ok(answer) => is_yes(&answer),
            Err(_) => false,
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Final summary for one transfer.
pub fn summary(t: &Transfer) -> String {
    match (&t.status, &t.error) {
        (TransferStatus::Completed, _) => format!("{}: completed", t.file.name),
        (status, Some(e)) => format!("{}: {status} ({e})", t.file.name),
        (status, None) => format!("{}: {status}", t.file.name),
    }
}
