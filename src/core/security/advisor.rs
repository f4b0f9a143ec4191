//! Heuristic classifier for inbound file names.
//!
//! Purely advisory: the result never blocks a transfer by itself. The
//! receiving side's [`ApprovalPolicy`] decides whether an advisory pauses
//! the transfer until the user approves it.

use std::fmt;

/// Document/image/archive extensions that disguise an executable when
/// followed by `.exe` (`invoice.pdf.exe`).
const DECOY_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "jpg", "jpeg", "png", "txt", "zip"];

/// Extensions that execute on double-click on common desktops.
const SCRIPT_EXTENSIONS: &[&str] = &["scr", "pif", "com", "cmd", "bat", "vbs", "ps1"];

/// Zero-width, BOM and bidi-override characters that hide the real name.
const INVISIBLE_CHARS: &[char] = &['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{202E}'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AdvisoryLevel {
    None,
    Info,
    Caution,
}

impl fmt::Display for AdvisoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Info => "info",
            Self::Caution => "caution",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advisory {
    pub level: AdvisoryLevel,
    pub rationale: Option<&'static str>,
}

impl Advisory {
    const CLEAR: Self = Self {
        level: AdvisoryLevel::None,
        rationale: None,
    };

    fn new(level: AdvisoryLevel, rationale: &'static str) -> Self {
        Self {
            level,
            rationale: Some(rationale),
        }
    }

    pub fn is_clear(&self) -> bool {
        self.level == AdvisoryLevel::None
    }
}

/// Classify `file_name`. First matching rule wins.
pub fn classify(file_name: &str) -> Advisory {
    let lower = file_name.to_lowercase();

    if DECOY_EXTENSIONS
        .iter()
        .any(|ext| lower.contains(&format!("{ext}.exe")))
    {
        return Advisory::new(
            AdvisoryLevel::Caution,
            "executable disguised behind a document extension",
        );
    }

    if let Some((_, ext)) = lower.rsplit_once('.')
        && SCRIPT_EXTENSIONS.contains(&ext)
    {
        return Advisory::new(AdvisoryLevel::Info, "file type runs code when opened");
    }

    if has_percent_escape(file_name)
        || file_name.contains(INVISIBLE_CHARS)
        || has_padding_run(file_name)
    {
        return Advisory::new(AdvisoryLevel::Info, "name contains hidden or obfuscating characters");
    }

    Advisory::CLEAR
}

/// `%XX` with two hex digits anywhere in the name.
fn has_percent_escape(name: &str) -> bool {
    name.as_bytes()
        .windows(3)
        .any(|w| w[0] == b'%' && w[1].is_ascii_hexdigit() && w[2].is_ascii_hexdigit())
}

/// Three or more consecutive spaces or dots.
fn has_padding_run(name: &str) -> bool {
    let mut run = 0;
    for c in name.chars() {
        if c == ' ' || c == '.' {
            run += 1;
            if run >= 3 {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

/// How the receiving side reacts to advisories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApprovalPolicy {
    /// Never pause; advisories are only logged.
    AutoApprove,
    /// Pause only on `Caution`.
    CautionOnly,
    /// Pause on any advisory.
    #[default]
    AnyAdvisory,
}

impl ApprovalPolicy {
    pub fn requires_approval(&self, advisory: &Advisory) -> bool {
        match self {
            Self::AutoApprove => false,
            Self::CautionOnly => advisory.level >= AdvisoryLevel::Caution,
            Self::AnyAdvisory => advisory.level > AdvisoryLevel::None,
        }
    }
}
