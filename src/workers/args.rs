//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`--config`, or `./config.toml` when present)
//! - Merging CLI with file config (CLI takes precedence)

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::config::TransferConfig;

/// Signaling service used when neither the CLI nor the config file names one.
pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8787";

/// peerdrop - browser-compatible peer-to-peer file transfer.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Base URL of the signaling service.
    #[clap(long, global = true)]
    pub server: Option<String>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also write logs to this file.
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Configuration file (TOML).
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,

    /// Tunables from the `[transfer]` table of the config file.
    #[clap(skip)]
    pub transfer: TransferConfig,
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Share a file and wait for someone to receive it.
    Send {
        file: PathBuf,
        /// Require this PIN from the receiver.
        #[clap(long)]
        pin: Option<String>,
    },
    /// Receive a shared file by its short id.
    Receive {
        short_id: String,
        /// PIN, if the share requires one (prompted otherwise).
        #[clap(long)]
        pin: Option<String>,
        /// Directory to save into. Defaults to the current directory.
        #[clap(long)]
        out: Option<PathBuf>,
        /// Do not ask before receiving files with suspicious names.
        #[clap(long)]
        auto_approve: bool,
    },
    /// Attach, change or clear the PIN of a published share.
    Pin {
        short_id: String,
        /// New PIN (prompted when neither this nor --clear is given).
        #[clap(long, conflicts_with = "clear")]
        pin: Option<String>,
        /// Remove the PIN requirement.
        #[clap(long)]
        clear: bool,
    },
}

/// What `config.toml` may contain.
#[derive(Deserialize, Default, Debug)]
#[serde(default)]
struct FileConfig {
    server: Option<String>,
    verbose: Option<u8>,
    log_file: Option<PathBuf>,
    download_dir: Option<PathBuf>,
    auto_approve: Option<bool>,
    transfer: TransferConfig,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Result<Self> {
        Args::parse().with_file_config()
    }

    fn with_file_config(mut self) -> Result<Self> {
        let explicit = self.config.is_some();
        let path = self
            .config
            .clone()
            .map(Self::resolve_path)
            .unwrap_or_else(|| PathBuf::from("config.toml"));

        match Self::from_file(&path)? {
            Some(file) => self.merge(file),
            None if explicit => bail!("config file {} not found", path.display()),
            None => {}
        }
        self.transfer.validate()?;
        Ok(self)
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    fn from_file(path: &Path) -> Result<Option<FileConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let parsed = toml::from_str::<FileConfig>(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(parsed))
    }

    /// Fill in what the CLI left unset.
    fn merge(&mut self, file: FileConfig) {
        if self.server.is_none() {
            self.server = file.server;
        }
        if self.verbose == 0 {
            self.verbose = file.verbose.unwrap_or(0);
        }
        if self.log_file.is_none() {
            self.log_file = file.log_file;
        }
        if let Command::Receive {
            out, auto_approve, ..
        } = &mut self.command
        {
            if out.is_none() {
                *out = file.download_dir;
            }
            if !*auto_approve {
                *auto_approve = file.auto_approve.unwrap_or(false);
            }
        }
        self.transfer = file.transfer;
    }

    pub fn server(&self) -> &str {
        self.server.as_deref().unwrap_or(DEFAULT_SERVER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn parses_send() {
        let args = parse(&["peerdrop", "-vv", "send", "notes.txt", "--pin", "4821"]);
        assert_eq!(args.verbose, 2);
        assert_eq!(
            args.command,
            Command::Send {
                file: PathBuf::from("notes.txt"),
                pin: Some("4821".into())
            }
        );
        assert_eq!(args.server(), DEFAULT_SERVER);
    }

    #[test]
    fn pin_and_clear_are_exclusive() {
        let args = parse(&["peerdrop", "pin", "Ab3dE9xZ", "--clear"]);
        assert_eq!(
            args.command,
            Command::Pin {
                short_id: "Ab3dE9xZ".into(),
                pin: None,
                clear: true
            }
        );
        assert!(Args::try_parse_from(["peerdrop", "pin", "Ab3dE9xZ", "--pin", "1", "--clear"]).is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let args = parse(&["peerdrop", "receive", "Ab3dE9xZ", "--server", "https://s.example", "--auto-approve"]);
        assert_eq!(args.server(), "https://s.example");
        assert!(matches!(
            args.command,
            Command::Receive { auto_approve: true, .. }
        ));
    }

    #[test]
    fn cli_wins_over_file() {
        let mut args = parse(&["peerdrop", "--server", "https://cli.example", "receive", "abc"]);
        let file: FileConfig = toml::from_str(
            r#"
            server = "https://file.example"
            verbose = 1
            download_dir = "/tmp/downloads"
            auto_approve = true

            [transfer]
            chunk_size = 32768
            "#,
        )
        .unwrap();
        args.merge(file);

        assert_eq!(args.server(), "https://cli.example");
        assert_eq!(args.verbose, 1);
        assert_eq!(args.transfer.chunk_size, 32768);
        assert_eq!(
            args.command,
            Command::Receive {
                short_id: "abc".into(),
                pin: None,
                out: Some(PathBuf::from("/tmp/downloads")),
                auto_approve: true,
            }
        );
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let args = parse(&["peerdrop", "--config", "/nonexistent/peerdrop.toml", "send", "a"]);
        assert!(args.with_file_config().is_err());
    }

    #[test]
    fn invalid_transfer_table_is_rejected() {
        let path = std::env::temp_dir().join(format!("peerdrop-args-{}.toml", uuid::Uuid::new_v4()));
        fs::write(&path, "[transfer]\nbuffered_high = 10\nbuffered_low = 20\n").unwrap();
        let args = parse(&["peerdrop", "--config", path.to_str().unwrap(), "send", "a"]);
        assert!(args.with_file_config().is_err());
        let _ = fs::remove_file(&path);
    }
}
