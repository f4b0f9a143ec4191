//! ICE candidate helpers: type classification and duplicate suppression.
//!
//! A candidate line looks like
//! `candidate:1 1 udp 2130706431 192.168.1.5 54321 typ host generation 0`;
//! the token after `typ` names the kind.

use std::collections::HashSet;
use std::fmt;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateKind {
    /// Kind of a candidate line, `None` if it carries no recognizable `typ`.
    pub fn parse(candidate: &str) -> Option<Self> {
        let mut tokens = candidate.split_whitespace();
        tokens.find(|t| *t == "typ")?;
        match tokens.next()? {
            "host" => Some(Self::Host),
            "srflx" => Some(Self::ServerReflexive),
            "prflx" => Some(Self::PeerReflexive),
            "relay" => Some(Self::Relay),
            _ => None,
        }
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        })
    }
}

/// Kinds of the `a=candidate:` lines in an SDP blob, in order.
pub fn sdp_candidate_kinds(sdp: &str) -> Vec<CandidateKind> {
    sdp.lines()
        .map(str::trim)
        .filter(|line| line.starts_with("a=candidate:"))
        .filter_map(CandidateKind::parse)
        .collect()
}

/// End-of-candidates marker: an empty candidate string.
pub fn is_end_of_candidates(init: &RTCIceCandidateInit) -> bool {
    init.candidate.trim().is_empty()
}

/// Remembers which candidates were already applied.
///
/// Two candidates are the same when their line (without the optional
/// `a=` / `candidate:` framing differences) and media id match.
#[derive(Debug, Default)]
pub struct CandidateSet {
    seen: HashSet<(String, Option<String>)>,
}

impl CandidateSet {
    /// `true` if the candidate was not seen before.
    pub fn insert(&mut self, init: &RTCIceCandidateInit) -> bool {
        self.seen.insert(Self::key(init))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    fn key(init: &RTCIceCandidateInit) -> (String, Option<String>) {
        let line = init.candidate.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let normalized = line.split_whitespace().collect::<Vec<_>>().join(" ");
        (normalized, init.sdp_mid.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "candidate:1 1 udp 2130706431 192.168.1.5 54321 typ host generation 0";
    const RELAY: &str =
        "candidate:3 1 udp 41885439 203.0.113.7 61000 typ relay raddr 198.51.100.2 rport 50000";

    fn init(line: &str) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: line.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn parses_kinds() {
        assert_eq!(CandidateKind::parse(HOST), Some(CandidateKind::Host));
        assert_eq!(CandidateKind::parse(RELAY), Some(CandidateKind::Relay));
        assert_eq!(
            CandidateKind::parse("candidate:2 1 udp 1 1.2.3.4 9 typ srflx raddr 0.0.0.0 rport 0"),
            Some(CandidateKind::ServerReflexive)
        );
        assert_eq!(CandidateKind::parse("candidate:2 1 udp 1 1.2.3.4 9"), None);
        assert_eq!(CandidateKind::parse("typ"), None);
    }

    #[test]
    fn candidate_kinds_from_sdp() {
        let sdp = format!(
            "v=0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na={HOST}\r\na={RELAY}\r\na=end-of-candidates\r\n"
        );
        assert_eq!(
            sdp_candidate_kinds(&sdp),
            vec![CandidateKind::Host, CandidateKind::Relay]
        );
        assert!(sdp_candidate_kinds("v=0\r\n").is_empty());
    }

    #[test]
    fn duplicates_are_detected() {
        let mut set = CandidateSet::default();
        assert!(set.insert(&init(HOST)));
        assert!(!set.insert(&init(HOST)));
        assert!(!set.insert(&init(&format!("a={HOST}"))));
        assert!(!set.insert(&init(&HOST.replace(' ', "  "))));
        assert!(set.insert(&init(RELAY)));
        assert_eq!(set.len(), 2);

        let mut other_mid = init(HOST);
        other_mid.sdp_mid = Some("1".into());
        assert!(set.insert(&other_mid));
    }

    #[test]
    fn empty_candidate_marks_end() {
        assert!(is_end_of_candidates(&init("")));
        assert!(!is_end_of_candidates(&init(HOST)));
    }
}
