mod core;
mod utils;
mod workers;

use crate::utils::file_log::FileLogLayer;
use crate::utils::sos::SignalOfStop;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use workers::args::{Args, Command};
use workers::receive::ReceiveOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load()?;

    // webrtc_ice logs "unknown TransactionID" warnings for late STUN
    // responses, which are harmless.
    let filter = match args.verbose {
        0 => "warn,peerdrop=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let file_layer = args
        .log_file
        .as_deref()
        .map(FileLogLayer::new)
        .transpose()?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(file_layer)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match args.command.clone() {
        Command::Send { file, pin } => {
            workers::send::run(&args, &file, pin.as_deref(), sos).await
        }
        Command::Receive {
            short_id,
            pin,
            out,
            auto_approve,
        } => {
            let opts = ReceiveOptions {
                short_id,
                pin,
                out,
                auto_approve,
            };
            workers::receive::run(&args, opts, sos).await
        }
        Command::Pin {
            short_id,
            pin,
            clear,
        } => workers::pin::run(&args, &short_id, pin, clear).await,
    }
}
