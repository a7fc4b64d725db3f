//! Sentinel markers the shell emits around editing and execution phases, and the
//! pure functions that derive session status from them.
//!
//! Each marker is a device-control-string (`ESC P … ESC \`) wrapping
//! `kmux;<PHASE>;<salt-hex>`. The salt is fixed at compile time so the
//! sequence cannot plausibly appear in ordinary command output.

use crate::error::KmuxError;

/// 32 hex digits, chosen once and baked into both the shell hook patch and the scanner.
pub const MARKER_SALT: &str = "1b3e62c774b44f78898be928a7aa6532";

const DCS_START: &[u8] = b"\x1bP";
const DCS_END: &[u8] = b"\x1b\\";

/// One of the four sentinel phases emitted by the shell hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    EditStart,
    EditEnd,
    ExecStart,
    ExecEnd,
}

impl MarkerKind {
    fn phase_name(self) -> &'static str {
        match self {
            MarkerKind::EditStart => "EDITSTART",
            MarkerKind::EditEnd => "EDITEND",
            MarkerKind::ExecStart => "EXECSTART",
            MarkerKind::ExecEnd => "EXECEND",
        }
    }

    fn from_phase_name(name: &str) -> Option<Self> {
        match name {
            "EDITSTART" => Some(MarkerKind::EditStart),
            "EDITEND" => Some(MarkerKind::EditEnd),
            "EXECSTART" => Some(MarkerKind::ExecStart),
            "EXECEND" => Some(MarkerKind::ExecEnd),
            _ => None,
        }
    }

    /// The exact byte sequence emitted on the wire for this marker.
    pub fn wire_bytes(self) -> Vec<u8> {
        build_marker(self.phase_name())
    }
}

fn build_marker(phase: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(DCS_START.len() + phase.len() + MARKER_SALT.len() + DCS_END.len() + 8);
    out.extend_from_slice(DCS_START);
    out.extend_from_slice(format!("kmux;{};{}", phase, MARKER_SALT).as_bytes());
    out.extend_from_slice(DCS_END);
    out
}

/// All four markers, in the order they're checked during scanning.
fn all_markers() -> [(MarkerKind, Vec<u8>); 4] {
    [
        (MarkerKind::EditStart, MarkerKind::EditStart.wire_bytes()),
        (MarkerKind::EditEnd, MarkerKind::EditEnd.wire_bytes()),
        (MarkerKind::ExecStart, MarkerKind::ExecStart.wire_bytes()),
        (MarkerKind::ExecEnd, MarkerKind::ExecEnd.wire_bytes()),
    ]
}

/// One occurrence of a marker in a buffer: its byte offset and kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerOccurrence {
    pub offset: usize,
    pub end: usize,
    pub kind: MarkerKind,
}

/// Scans `buffer` for every marker occurrence, in positional order.
///
/// A linear left-to-right scan: at each position we try each marker's byte
/// string; the first hit advances the cursor past it. This is O(n * 4 *
/// marker_len) which is fine for the buffer sizes involved (interactive
/// command output, not bulk data transfer).
pub fn extract_markers(buffer: &[u8]) -> Vec<MarkerOccurrence> {
    let markers = all_markers();
    let mut out = Vec::new();
    let mut i = 0;
    'scan: while i < buffer.len() {
        if buffer[i..].starts_with(DCS_START) {
            for (kind, bytes) in &markers {
                if buffer[i..].starts_with(bytes.as_slice()) {
                    out.push(MarkerOccurrence {
                        offset: i,
                        end: i + bytes.len(),
                        kind: *kind,
                    });
                    i += bytes.len();
                    continue 'scan;
                }
            }
        }
        i += 1;
    }
    out
}

/// Removes every marker occurrence from `buffer`, leaving ordinary bytes untouched.
///
/// Idempotent: running it again on already-stripped input is a no-op.
pub fn strip_markers(buffer: &[u8]) -> Vec<u8> {
    let occurrences = extract_markers(buffer);
    if occurrences.is_empty() {
        return buffer.to_vec();
    }

    let mut out = Vec::with_capacity(buffer.len());
    let mut cursor = 0;
    for occ in occurrences {
        out.extend_from_slice(&buffer[cursor..occ.offset]);
        cursor = occ.end;
    }
    out.extend_from_slice(&buffer[cursor..]);
    out
}

/// The four user-visible/transitional session statuses, derived purely from
/// the tail of the marker stream. See `status_from_markers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No markers observed yet; the shell hasn't finished initialising.
    NoMarkers,
    /// Shell is ready for a new command (or the continuation of one).
    AwaitingCommand,
    /// A multi-line command is mid-edit (continuation pending).
    InputCommand,
    /// A command is currently executing.
    Executing,
    /// A lone bookkeeping marker with no determined partner yet; transient.
    TransientShellBookkeeping,
}

impl SessionStatus {
    pub fn is_idle(self) -> bool {
        matches!(self, SessionStatus::AwaitingCommand | SessionStatus::InputCommand)
    }

    fn label(self) -> &'static str {
        match self {
            SessionStatus::NoMarkers => "no markers yet",
            SessionStatus::AwaitingCommand => "awaiting command",
            SessionStatus::InputCommand => "mid multi-line input",
            SessionStatus::Executing => "executing",
            SessionStatus::TransientShellBookkeeping => "transient shell bookkeeping",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Derives status from the last one or two markers in a buffer. Pure:
/// same buffer, same answer, always — never scatter ad-hoc `if last == X`
/// checks elsewhere, route everything through here.
pub fn status_from_markers(buffer: &[u8]) -> crate::error::Result<SessionStatus> {
    let occurrences = extract_markers(buffer);
    status_from_tail(&occurrences)
}

fn status_from_tail(occurrences: &[MarkerOccurrence]) -> crate::error::Result<SessionStatus> {
    let last = occurrences.last().map(|o| o.kind);
    let second_last = if occurrences.len() >= 2 {
        Some(occurrences[occurrences.len() - 2].kind)
    } else {
        None
    };

    use MarkerKind::*;
    let status = match (second_last, last) {
        (_, None) => SessionStatus::NoMarkers,
        (_, Some(ExecStart)) => SessionStatus::Executing,
        (None, Some(EditStart)) => SessionStatus::AwaitingCommand,
        (Some(ExecEnd), Some(EditStart)) => SessionStatus::AwaitingCommand,
        (Some(EditEnd), Some(EditStart)) => SessionStatus::InputCommand,
        (_, Some(EditEnd)) => SessionStatus::TransientShellBookkeeping,
        (_, Some(ExecEnd)) => SessionStatus::TransientShellBookkeeping,
        (prev, Some(EditStart)) => {
            return Err(KmuxError::ParseInvariantViolation(format!(
                "unexpected marker pair ({:?}, EditStart)",
                prev
            )))
        }
    };
    Ok(status)
}

/// Shorthand used by the registry response formatter; not part of the
/// scanning contract itself.
pub fn parse_phase_for_tests(name: &str) -> Option<MarkerKind> {
    MarkerKind::from_phase_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(kind: MarkerKind) -> Vec<u8> {
        kind.wire_bytes()
    }

    #[test]
    fn no_markers_is_no_markers() {
        assert_eq!(status_from_markers(b"hello world").unwrap(), SessionStatus::NoMarkers);
    }

    #[test]
    fn single_edit_start_is_awaiting_command() {
        let buf = marker(MarkerKind::EditStart);
        assert_eq!(status_from_markers(&buf).unwrap(), SessionStatus::AwaitingCommand);
    }

    #[test]
    fn edit_start_edit_end_is_transient() {
        let mut buf = marker(MarkerKind::EditStart);
        buf.extend(marker(MarkerKind::EditEnd));
        assert_eq!(status_from_markers(&buf).unwrap(), SessionStatus::TransientShellBookkeeping);
    }

    #[test]
    fn edit_end_then_edit_start_is_input_command() {
        let mut buf = marker(MarkerKind::EditStart);
        buf.extend(marker(MarkerKind::EditEnd));
        buf.extend(marker(MarkerKind::EditStart));
        assert_eq!(status_from_markers(&buf).unwrap(), SessionStatus::InputCommand);
    }

    #[test]
    fn exec_start_is_executing() {
        let mut buf = marker(MarkerKind::EditStart);
        buf.extend(marker(MarkerKind::EditEnd));
        buf.extend(marker(MarkerKind::ExecStart));
        assert_eq!(status_from_markers(&buf).unwrap(), SessionStatus::Executing);
    }

    #[test]
    fn exec_end_then_edit_start_is_awaiting_command() {
        let mut buf = marker(MarkerKind::ExecStart);
        buf.extend(marker(MarkerKind::ExecEnd));
        buf.extend(marker(MarkerKind::EditStart));
        assert_eq!(status_from_markers(&buf).unwrap(), SessionStatus::AwaitingCommand);
    }

    #[test]
    fn out_of_order_edit_start_after_edit_start_is_invariant_violation() {
        let mut buf = marker(MarkerKind::ExecEnd);
        buf.extend(marker(MarkerKind::ExecStart));
        buf.extend(marker(MarkerKind::EditStart));
        assert!(status_from_markers(&buf).is_err());
    }

    #[test]
    fn stripping_markers_is_idempotent() {
        let mut buf = b"before ".to_vec();
        buf.extend(marker(MarkerKind::EditStart));
        buf.extend(b" after".to_vec());
        let once = strip_markers(&buf);
        let twice = strip_markers(&once);
        assert_eq!(once, twice);
        assert_eq!(once, b"before  after");
    }

    #[test]
    fn extract_markers_returns_positions_in_order() {
        let mut buf = b"aaa".to_vec();
        buf.extend(marker(MarkerKind::EditStart));
        buf.extend(b"bbb".to_vec());
        buf.extend(marker(MarkerKind::EditEnd));
        let occ = extract_markers(&buf);
        assert_eq!(occ.len(), 2);
        assert_eq!(occ[0].kind, MarkerKind::EditStart);
        assert_eq!(occ[1].kind, MarkerKind::EditEnd);
        assert!(occ[0].offset < occ[1].offset);
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        fn arbitrary_marker() -> impl Strategy<Value = MarkerKind> {
            prop_oneof![
                Just(MarkerKind::EditStart),
                Just(MarkerKind::EditEnd),
                Just(MarkerKind::ExecStart),
                Just(MarkerKind::ExecEnd),
            ]
        }

        proptest! {
            /// Stripping is idempotent for any mix of markers and filler bytes.
            #[test]
            fn prop_strip_is_idempotent(kinds in prop::collection::vec(arbitrary_marker(), 0..8)) {
                let mut buf = Vec::new();
                for k in kinds {
                    buf.extend(b"xyz");
                    buf.extend(k.wire_bytes());
                }
                let once = strip_markers(&buf);
                let twice = strip_markers(&once);
                prop_assert_eq!(once, twice);
            }

            /// Scanning never finds more occurrences than markers we inserted.
            #[test]
            fn prop_extract_matches_inserted_count(kinds in prop::collection::vec(arbitrary_marker(), 0..8)) {
                let mut buf = Vec::new();
                for k in &kinds {
                    buf.extend(k.wire_bytes());
                }
                let occ = extract_markers(&buf);
                prop_assert_eq!(occ.len(), kinds.len());
            }
        }
    }
}
