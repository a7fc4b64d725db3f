//! Zsh detection and the shell-init patch that teaches a zsh session to emit
//! block markers at editing and execution boundaries.
//!
//! Only zsh is supported: it's the shell offering the specific
//! pre-command (`preexec`), post-command (`precmd`), and line-editor
//! (`zle-line-init`) hooks the marker scheme relies on.

use std::path::{Path, PathBuf};

use crate::marker::MARKER_SALT;

/// The zsh binary located for a session, plus whatever we could tell about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInfo {
    pub path: PathBuf,
    is_zsh: bool,
}

impl ShellInfo {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let is_zsh = path.file_name().and_then(|n| n.to_str()) == Some("zsh");
        Self { path, is_zsh }
    }

    pub fn is_zsh(&self) -> bool {
        self.is_zsh
    }

    pub fn login_args(&self) -> Vec<&'static str> {
        vec!["-i"]
    }
}

/// Locates zsh: an explicit override, then `$SHELL` if it happens to be zsh,
/// then a fixed fallback path. Does not consult `PATH`, mirroring the
/// original's `os.execvpe` behaviour only for the interactive exec itself.
pub fn detect_zsh(override_path: Option<&str>, shell_env: Option<&str>) -> ShellInfo {
    if let Some(path) = override_path {
        return ShellInfo::new(path);
    }
    if let Some(shell) = shell_env {
        if Path::new(shell).file_name().and_then(|n| n.to_str()) == Some("zsh") {
            return ShellInfo::new(shell);
        }
    }
    ShellInfo::new("/bin/zsh")
}

/// Builds the zsh init patch that registers the four marker emitters.
///
/// Hook mapping:
/// - `zle-line-init` fires every time the line editor starts accepting a new
///   line, including multi-line continuations: emits `EditStart`.
/// - `accept-line` is wrapped: pressing enter always emits `EditEnd` before
///   falling through to the real widget. If the line is a complete command,
///   `preexec` immediately follows and emits `ExecStart`; if it's an
///   unterminated construct, zsh reinvokes the editor and `zle-line-init`
///   fires again, so `EditEnd, EditStart` naturally means "continuation
///   pending" with no `ExecStart` in between.
/// - `preexec` emits `ExecStart` and bumps an open-exec counter.
/// - `precmd` emits `ExecEnd`, but only when the counter shows a matching
///   `ExecStart` — guards against `precmd` firing without `preexec` (e.g. an
///   empty line at the prompt).
pub fn build_zshrc_patch() -> String {
    format!(
        r#"
# --- kmux block markers ---
typeset -g KMUX_MARKER_SALT={salt}
typeset -g KMUX_DCS_START=$'\x1bP'
typeset -g KMUX_DCS_END=$'\x1b\\'
typeset -g KMUX_EXEC_OPEN=0

kmux_emit() {{
  print -n -- "${{KMUX_DCS_START}}kmux;$1;${{KMUX_MARKER_SALT}}${{KMUX_DCS_END}}"
}}

kmux_zle_line_init() {{
  kmux_emit EDITSTART
}}

kmux_accept_line() {{
  kmux_emit EDITEND
  zle .accept-line
}}

kmux_preexec() {{
  KMUX_EXEC_OPEN=$((KMUX_EXEC_OPEN + 1))
  kmux_emit EXECSTART
}}

kmux_precmd() {{
  if (( KMUX_EXEC_OPEN > 0 )); then
    KMUX_EXEC_OPEN=$((KMUX_EXEC_OPEN - 1))
    kmux_emit EXECEND
  fi
}}

zle -N zle-line-init kmux_zle_line_init
zle -N accept-line kmux_accept_line

typeset -ga preexec_functions precmd_functions
(( ${{preexec_functions[(Ie)kmux_preexec]}} )) || preexec_functions+=(kmux_preexec)
(( ${{precmd_functions[(Ie)kmux_precmd]}} )) || precmd_functions+=(kmux_precmd)
"#,
        salt = MARKER_SALT
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_zsh_by_basename() {
        let info = ShellInfo::new("/usr/bin/zsh");
        assert!(info.is_zsh());
    }

    #[test]
    fn non_zsh_basename_is_not_zsh() {
        let info = ShellInfo::new("/bin/bash");
        assert!(!info.is_zsh());
    }

    #[test]
    fn override_wins_over_env() {
        let info = detect_zsh(Some("/opt/homebrew/bin/zsh"), Some("/bin/bash"));
        assert_eq!(info.path, PathBuf::from("/opt/homebrew/bin/zsh"));
    }

    #[test]
    fn env_used_when_it_is_zsh() {
        let info = detect_zsh(None, Some("/usr/local/bin/zsh"));
        assert_eq!(info.path, PathBuf::from("/usr/local/bin/zsh"));
    }

    #[test]
    fn falls_back_to_bin_zsh() {
        let info = detect_zsh(None, Some("/bin/bash"));
        assert_eq!(info.path, PathBuf::from("/bin/zsh"));
    }

    #[test]
    fn patch_contains_all_four_phase_names() {
        let patch = build_zshrc_patch();
        for phase in ["EDITSTART", "EDITEND", "EXECSTART", "EXECEND"] {
            assert!(patch.contains(phase), "missing {phase}");
        }
        assert!(patch.contains(MARKER_SALT));
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_detect_zsh_is_idempotent(path in prop_oneof![
                Just("/bin/zsh"), Just("/usr/bin/zsh"), Just("/bin/bash"), Just("/usr/bin/fish"),
            ]) {
                let a = detect_zsh(Some(path), None);
                let b = detect_zsh(Some(path), None);
                prop_assert_eq!(a, b);
            }
        }
    }
}
