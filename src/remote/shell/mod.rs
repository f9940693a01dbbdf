//! Persistent shell emulation over a stateless exec channel.
//!
//! Every remote invocation starts a fresh shell, so a bare `cd /foo` is lost
//! by the next command. [`ShellStateEmulator`] keeps cwd, environment and
//! history on the client and turns each user command into one composite
//! invocation that restores that state first:
//!
//! ```text
//! cd '<cwd>' && export K1='V1' && ... && <user command>
//! ```
//!
//! # Built-ins
//!
//! | Command | Behavior |
//! |---------|----------|
//! | `cd [dir\|~\|~/x\|-]` | Resolved locally, confirmed with `cd '<dir>' && pwd`, remote path adopted |
//! | `export NAME=VALUE` | Updates the tracked environment only |
//! | `clear` | Internal, never sent |
//! | `sudo <cmd>` | Feeds the login password to `sudo -S`, strips the prompt from stderr |
//!
//! Commands that mention `cd`, `pushd` or `popd` anywhere else report the
//! final directory in the same invocation so the tracked cwd follows them.
//!
//! State only changes on confirmed success; failed probes leave it as it was.

mod completion;
mod history;
mod quote;
mod state;

pub use history::{CommandHistory, HISTORY_CAPACITY};
pub use quote::shell_quote;
pub use state::{FALLBACK_HOME, ShellState};

use std::sync::Arc;

use tracing::{debug, info, warn};

use self::quote::{changes_directory, has_shell_operators, is_identifier, quote_path, strip_quotes};
use super::connection::ConnectionSession;
use super::types::ConnectionType;

/// Marker line carrying the final cwd of commands that change directory.
pub(crate) const CWD_MARKER: &str = "__DEVICE_SHELL_CWD__";

/// Prompt name used for USB devices when the remote sets no `HOSTNAME`.
const DEFAULT_DEVICE_HOSTNAME: &str = "iPhone";

/// Prompt name used when neither the remote nor the login name a user.
const DEFAULT_USER: &str = "mobile";

/// Result of one line entered by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    /// Handled entirely on the client (nothing to display from the remote)
    pub internal: bool,
}

impl ShellOutput {
    fn internal() -> Self {
        Self {
            internal: true,
            ..Default::default()
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            stderr: message.into(),
            ..Default::default()
        }
    }
}

/// Client-side shell on top of a [`ConnectionSession`].
///
/// Issues one remote command at a time; callers must not share an emulator's
/// session with another command issuer.
pub struct ShellStateEmulator {
    session: Arc<ConnectionSession>,
    state: ShellState,
    login_user: String,
    login_host: String,
}

impl ShellStateEmulator {
    /// Attach to `session` and seed state from the remote environment when
    /// it is connected.
    pub async fn attach(session: Arc<ConnectionSession>) -> Self {
        let (login_user, login_host) = match session.connection_info().await {
            Some(info) => {
                let host = match info.connection_type {
                    ConnectionType::Usb => DEFAULT_DEVICE_HOSTNAME.to_string(),
                    ConnectionType::Network => info.host,
                };
                (info.username, host)
            }
            None => (DEFAULT_USER.to_string(), DEFAULT_DEVICE_HOSTNAME.to_string()),
        };

        let mut emulator = Self {
            session,
            state: ShellState::default(),
            login_user,
            login_host,
        };
        emulator.seed().await;
        emulator
    }

    /// Re-read home, cwd and environment from the remote. History is kept.
    pub async fn reset(&mut self) {
        let history = std::mem::take(&mut self.state.history);
        self.state = ShellState {
            history,
            ..Default::default()
        };
        self.seed().await;
    }

    async fn seed(&mut self) {
        if !self.session.is_connected() {
            return;
        }

        let (stdout, _) = self.session.execute_command("echo $HOME", None).await;
        let home = stdout.trim();
        if !home.is_empty() {
            self.state.home_dir = Some(home.to_string());
            self.state.cwd = home.to_string();
        }

        let (stdout, _) = self.session.execute_command("pwd", None).await;
        let cwd = stdout.trim();
        if !cwd.is_empty() {
            self.state.cwd = cwd.to_string();
        }

        let (mut env, _) = self.session.execute_command("env -0", None).await;
        if !env.contains('\0') {
            debug!("env -0 unsupported, reading environment line by line");
            env = self.session.execute_command("env", None).await.0;
        }
        if !env.trim().is_empty() {
            self.state.seed_env(&env);
        }

        info!(
            "Shell state seeded: cwd={}, {} environment variable(s)",
            self.state.cwd,
            self.state.env_vars.len()
        );
    }

    pub fn session(&self) -> &Arc<ConnectionSession> {
        &self.session
    }

    pub fn state(&self) -> &ShellState {
        &self.state
    }

    pub fn cwd(&self) -> &str {
        &self.state.cwd
    }

    /// Run one line of user input.
    pub async fn execute(&mut self, command: &str) -> ShellOutput {
        let line = command.trim();
        if line.is_empty() {
            return ShellOutput::internal();
        }
        self.state.history.push(line);

        let (program, args) = match line.split_once(char::is_whitespace) {
            Some((program, args)) => (program, args.trim()),
            None => (line, ""),
        };

        let output = match program {
            "clear" if args.is_empty() => return ShellOutput::internal(),
            "cd" if !has_shell_operators(args) => self.change_directory(args).await,
            "export" if !args.is_empty() && !has_shell_operators(args) => self.export(args),
            "sudo" if !args.is_empty() => self.sudo(args).await,
            _ => self.run(line).await,
        };

        if !output.internal {
            self.session
                .notify_command_output(line, &output.stdout, &output.stderr);
        }
        output
    }

    async fn change_directory(&mut self, arg: &str) -> ShellOutput {
        let arg = strip_quotes(arg);
        let returning = arg == "-";
        let target = if returning {
            match &self.state.previous_cwd {
                Some(previous) => previous.clone(),
                None => return ShellOutput::error("cd: OLDPWD not set\n"),
            }
        } else {
            self.state.resolve_path(arg)
        };

        let check = format!("cd {} && pwd", quote_path(&target));
        let (stdout, stderr) = self.session.execute_command(&check, None).await;
        let confirmed = stdout.trim();

        if confirmed.is_empty() || !stderr.trim().is_empty() {
            debug!("cd to {} rejected by remote", target);
            return ShellOutput::error(format!("cd: {}: No such file or directory\n", target));
        }

        self.state.change_cwd(confirmed);
        ShellOutput {
            // Like bash, `cd -` prints where it went.
            stdout: if returning {
                format!("{}\n", confirmed)
            } else {
                String::new()
            },
            ..Default::default()
        }
    }

    fn export(&mut self, assignment: &str) -> ShellOutput {
        let Some((name, value)) = assignment.split_once('=') else {
            return ShellOutput::error("export: invalid syntax\n");
        };
        if !is_identifier(name) {
            return ShellOutput::error("export: invalid syntax\n");
        }

        self.state
            .env_vars
            .insert(name.to_string(), strip_quotes(value.trim()).to_string());
        ShellOutput::default()
    }

    /// Run `sudo <command>` with the session's login password on stdin.
    ///
    /// The password is never logged and never enters history.
    async fn sudo(&mut self, command: &str) -> ShellOutput {
        let Some(password) = self.session.password().await else {
            return ShellOutput::error("sudo: no password available for this session\n");
        };

        let piped = format!("echo {} | sudo -S {}", shell_quote(&password), command);
        let composite = self.state.build_command(&piped);
        let (stdout, stderr) = self.session.execute_command(&composite, None).await;

        ShellOutput {
            stdout,
            stderr: strip_sudo_prompt(&stderr),
            internal: false,
        }
    }

    async fn run(&mut self, command: &str) -> ShellOutput {
        let tracks_cwd = changes_directory(command);
        let mut composite = self.state.build_command(command);
        if tracks_cwd {
            composite.push_str(&format!("; printf '\\n{}%s\\n' \"$(pwd)\"", CWD_MARKER));
        }

        let (mut stdout, stderr) = self.session.execute_command(&composite, None).await;

        if tracks_cwd {
            let marker = format!("\n{}", CWD_MARKER);
            if let Some(start) = stdout.rfind(&marker) {
                let reported = stdout[start + marker.len()..].trim().to_string();
                stdout.truncate(start);
                if reported.starts_with('/') {
                    self.state.change_cwd(&reported);
                } else {
                    warn!("Ignoring unexpected cwd report {:?}", reported);
                }
            }
        }

        ShellOutput {
            stdout,
            stderr,
            internal: false,
        }
    }

    /// `user@host:path$ `, preferring the remote's `USER` and `HOSTNAME`.
    pub fn get_prompt(&self) -> String {
        let user = self
            .state
            .env_vars
            .get("USER")
            .filter(|u| !u.is_empty())
            .unwrap_or(&self.login_user);
        let host = self
            .state
            .env_vars
            .get("HOSTNAME")
            .filter(|h| !h.is_empty())
            .unwrap_or(&self.login_host);
        format!("{}@{}:{}$ ", user, host, self.state.display_path())
    }

    pub async fn get_completions(&self, partial: &str) -> Vec<String> {
        completion::complete(&self.session, &self.state, partial).await
    }

    pub fn get_history_prev(&mut self) -> Option<String> {
        self.state.history.prev()
    }

    pub fn get_history_next(&mut self) -> Option<String> {
        self.state.history.next()
    }

    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.state.history.iter()
    }
}

/// Drop the `[sudo] password for <user>: ` / `Password:` prompt sudo writes to
/// stderr, keeping whatever followed it on the same line.
fn strip_sudo_prompt(stderr: &str) -> String {
    let mut cleaned = String::with_capacity(stderr.len());
    for line in stderr.split_inclusive('\n') {
        let rest = if let Some(after) = line.strip_prefix("[sudo] password for ") {
            after.split_once(": ").map(|(_, rest)| rest).unwrap_or("")
        } else if let Some(after) = line.strip_prefix("Password:") {
            after.strip_prefix(' ').unwrap_or(after)
        } else {
            line
        };
        if !rest.trim().is_empty() {
            cleaned.push_str(rest);
        }
    }
    cleaned
}
