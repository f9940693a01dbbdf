//! Client-side shell state and the composite command builder.

use std::collections::BTreeMap;

use super::history::CommandHistory;
use super::quote::{is_identifier, quote_path, shell_quote};

/// Home directory assumed when the remote did not report one.
pub const FALLBACK_HOME: &str = "/var/mobile";

/// Variables the remote shell manages itself and that are never re-exported.
const SHELL_MANAGED_VARS: &[&str] = &["PWD", "OLDPWD", "SHLVL", "_"];

/// Everything the emulator remembers between two discrete invocations.
#[derive(Debug, Clone)]
pub struct ShellState {
    pub cwd: String,
    pub home_dir: Option<String>,
    pub previous_cwd: Option<String>,
    pub env_vars: BTreeMap<String, String>,
    pub history: CommandHistory,
}

impl Default for ShellState {
    fn default() -> Self {
        Self {
            cwd: "~".to_string(),
            home_dir: None,
            previous_cwd: None,
            env_vars: BTreeMap::new(),
            history: CommandHistory::default(),
        }
    }
}

impl ShellState {
    pub fn home(&self) -> &str {
        self.home_dir.as_deref().unwrap_or(FALLBACK_HOME)
    }

    /// Replace the environment with `env` output. NUL-separated entries
    /// (`env -0`) keep multi-line values whole; in plain `NAME=value` lines
    /// their continuation lines are skipped.
    pub fn seed_env(&mut self, env_output: &str) {
        let separator = if env_output.contains('\0') { '\0' } else { '\n' };
        self.env_vars = env_output
            .split(separator)
            .map(|entry| entry.strip_suffix('\r').unwrap_or(entry))
            .filter_map(|line| line.split_once('='))
            .filter(|(name, _)| is_identifier(name))
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
    }

    /// Move to `new_cwd`, remembering where we came from.
    pub fn change_cwd(&mut self, new_cwd: &str) {
        if new_cwd != self.cwd {
            self.previous_cwd = Some(std::mem::replace(&mut self.cwd, new_cwd.to_string()));
        }
    }

    /// Resolve a path against home and cwd without touching the remote.
    /// `~`, `~/x`, absolute and relative paths; `-` is handled by the caller.
    pub fn resolve_path(&self, path: &str) -> String {
        if path.is_empty() || path == "~" {
            return self.home().to_string();
        }
        if let Some(rest) = path.strip_prefix("~/") {
            return join_path(self.home(), rest);
        }
        if path.starts_with('/') {
            return path.to_string();
        }
        join_path(&self.cwd, path)
    }

    /// Wrap `command` so it runs in the tracked cwd with the tracked
    /// environment: `cd '<cwd>' && export K='V' && ... && <command>`.
    pub fn build_command(&self, command: &str) -> String {
        let mut parts = Vec::with_capacity(self.env_vars.len() + 2);
        parts.push(format!("cd {}", quote_path(&self.cwd)));
        parts.extend(
            self.env_vars
                .iter()
                .filter(|(name, _)| !SHELL_MANAGED_VARS.contains(&name.as_str()))
                .map(|(name, value)| format!("export {}={}", name, shell_quote(value))),
        );
        parts.push(command.to_string());
        parts.join(" && ")
    }

    /// Path shown in the prompt, with the home directory abbreviated to `~`.
    pub fn display_path(&self) -> String {
        if let Some(home) = self.home_dir.as_deref().filter(|h| !h.is_empty() && *h != "/") {
            if self.cwd == home {
                return "~".to_string();
            }
            if let Some(rest) = self.cwd.strip_prefix(home)
                && rest.starts_with('/')
            {
                return format!("~{}", rest);
            }
        }
        self.cwd.clone()
    }
}

/// Join `base` and a relative `path` with a single `/`.
pub fn join_path(base: &str, path: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_at(cwd: &str) -> ShellState {
        ShellState {
            cwd: cwd.to_string(),
            home_dir: Some("/var/mobile".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_seed_env_skips_invalid_lines() {
        let mut state = ShellState::default();
        state.seed_env("HOME=/var/mobile\nPATH=/usr/bin:/bin\n  continued line\nA-B=x\nEMPTY=\n");
        assert_eq!(state.env_vars.get("HOME").map(String::as_str), Some("/var/mobile"));
        assert_eq!(state.env_vars.get("EMPTY").map(String::as_str), Some(""));
        assert_eq!(state.env_vars.len(), 3);
    }

    #[test]
    fn test_seed_env_keeps_multiline_values_whole() {
        let mut state = ShellState::default();
        state.seed_env("USER=mobile\0MOTD=welcome\nEVIL=1\0PATH=/usr/bin\0");
        assert_eq!(
            state.env_vars.get("MOTD").map(String::as_str),
            Some("welcome\nEVIL=1")
        );
        assert!(!state.env_vars.contains_key("EVIL"));
        assert_eq!(state.env_vars.len(), 3);
    }

    #[test]
    fn test_default_cwd_expands_home() {
        assert_eq!(ShellState::default().build_command("ls"), "cd ~ && ls");
        assert_eq!(state_at("~/My Docs").build_command("ls"), "cd ~/'My Docs' && ls");
    }

    #[test]
    fn test_build_command_exports_tracked_vars() {
        let mut state = state_at("/tmp");
        state.env_vars.insert("FOO".into(), "bar".into());
        state.env_vars.insert("PWD".into(), "/old".into());
        state.env_vars.insert("QUOTE".into(), "it's".into());

        let command = state.build_command("ls -la");

        assert!(command.starts_with("cd '/tmp' && "));
        assert!(command.contains("export FOO='bar'"));
        assert!(command.contains(r"export QUOTE='it'\''s'"));
        assert!(!command.contains("PWD"));
        assert!(command.ends_with(" && ls -la"));
    }

    #[test]
    fn test_resolve_path() {
        let state = state_at("/var/mobile/Documents");
        assert_eq!(state.resolve_path("~"), "/var/mobile");
        assert_eq!(state.resolve_path(""), "/var/mobile");
        assert_eq!(state.resolve_path("~/Library"), "/var/mobile/Library");
        assert_eq!(state.resolve_path("/etc"), "/etc");
        assert_eq!(state.resolve_path("sub"), "/var/mobile/Documents/sub");
        assert_eq!(state_at("/").resolve_path("usr"), "/usr");
    }

    #[test]
    fn test_resolve_without_home_uses_fallback() {
        let state = ShellState::default();
        assert_eq!(state.resolve_path("~"), FALLBACK_HOME);
    }

    #[test]
    fn test_display_path() {
        assert_eq!(state_at("/var/mobile").display_path(), "~");
        assert_eq!(state_at("/var/mobile/Library").display_path(), "~/Library");
        assert_eq!(state_at("/var/mobile2").display_path(), "/var/mobile2");
        assert_eq!(state_at("/tmp").display_path(), "/tmp");
    }

    #[test]
    fn test_change_cwd_tracks_previous() {
        let mut state = state_at("/var/mobile");
        state.change_cwd("/tmp");
        assert_eq!(state.previous_cwd.as_deref(), Some("/var/mobile"));
        state.change_cwd("/tmp");
        assert_eq!(state.previous_cwd.as_deref(), Some("/var/mobile"));
    }
}
