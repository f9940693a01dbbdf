//! Scripted fakes shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::error::{SessionError, VaultError};
use super::transport::{ExecChannel, ExecConnector};
use super::types::{ConnectionInfo, ConnectionType, ExecOutput};
use super::vault::SecretStore;

type Responder = Box<dyn Fn(&str) -> ExecOutput + Send + Sync>;

pub(crate) fn test_info() -> ConnectionInfo {
    ConnectionInfo {
        host: "127.0.0.1".into(),
        port: 2222,
        username: "mobile".into(),
        password: "alpine".into(),
        device_id: Some("test-device".into()),
        connection_type: ConnectionType::Usb,
    }
}

pub(crate) fn stdout(text: &str) -> ExecOutput {
    ExecOutput {
        stdout: text.to_string(),
        exit_status: 0,
        ..Default::default()
    }
}

pub(crate) fn stderr(text: &str) -> ExecOutput {
    ExecOutput {
        stderr: text.to_string(),
        exit_status: 1,
        ..Default::default()
    }
}

/// Answers `echo <text>` with `<text>\n` (quotes stripped), anything else
/// with empty output.
pub(crate) fn echo_responder() -> impl Fn(&str) -> ExecOutput + Send + Sync + 'static {
    |command: &str| match command.strip_prefix("echo ") {
        Some(text) => stdout(&format!("{}\n", text.trim_matches('\''))),
        None => ExecOutput::default(),
    }
}

/// Channel answering commands through a closure and recording them.
pub(crate) struct ScriptedChannel {
    responder: Responder,
    commands: Mutex<Vec<String>>,
    fail_next: Mutex<Option<String>>,
    pub(crate) closed: AtomicBool,
}

impl ScriptedChannel {
    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub(crate) fn last_command(&self) -> Option<String> {
        self.commands.lock().unwrap().last().cloned()
    }

    pub(crate) fn fail_next_exec(&self, message: &str) {
        *self.fail_next.lock().unwrap() = Some(message.to_string());
    }
}

struct SharedChannel(Arc<ScriptedChannel>);

#[async_trait]
impl ExecChannel for SharedChannel {
    async fn exec(&self, command: &str, _timeout: Duration) -> Result<ExecOutput, String> {
        if let Some(message) = self.0.fail_next.lock().unwrap().take() {
            return Err(message);
        }
        self.0.commands.lock().unwrap().push(command.to_string());
        Ok((self.0.responder)(command))
    }

    async fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector with scripted probe and open outcomes. Unscripted probes
/// succeed and unscripted opens hand out the shared channel.
pub(crate) struct ScriptedConnector {
    probe_script: Mutex<VecDeque<bool>>,
    open_script: Mutex<VecDeque<Result<(), SessionError>>>,
    pub(crate) probes: AtomicUsize,
    pub(crate) opens: AtomicUsize,
    pub(crate) channel: Arc<ScriptedChannel>,
}

impl ScriptedConnector {
    pub(crate) fn new(responder: impl Fn(&str) -> ExecOutput + Send + Sync + 'static) -> Self {
        Self {
            probe_script: Mutex::new(VecDeque::new()),
            open_script: Mutex::new(VecDeque::new()),
            probes: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            channel: Arc::new(ScriptedChannel {
                responder: Box::new(responder),
                commands: Mutex::new(Vec::new()),
                fail_next: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn push_probe(&self, reachable: bool) {
        self.probe_script.lock().unwrap().push_back(reachable);
    }

    pub(crate) fn push_open_result(&self, result: Result<(), SessionError>) {
        self.open_script.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl ExecConnector for ScriptedConnector {
    async fn probe(&self, _host: &str, _port: u16, _timeout: Duration) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.probe_script.lock().unwrap().pop_front().unwrap_or(true)
    }

    async fn open(
        &self,
        _info: &ConnectionInfo,
        _timeout: Duration,
    ) -> Result<Box<dyn ExecChannel>, SessionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let scripted = self.open_script.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(()))?;
        Ok(Box::new(SharedChannel(self.channel.clone())))
    }
}

/// In-memory secret store.
#[derive(Default)]
pub(crate) struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    fail: bool,
}

impl MemoryStore {
    /// A store that rejects every write.
    pub(crate) fn failing() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            fail: true,
        }
    }

    pub(crate) fn get(&self, account: &str) -> Option<String> {
        self.entries.lock().unwrap().get(account).cloned()
    }
}

impl SecretStore for MemoryStore {
    fn set_password(&self, account: &str, password: &str) -> Result<(), VaultError> {
        if self.fail {
            return Err(VaultError::Backend("store locked".into()));
        }
        self.entries
            .lock()
            .unwrap()
            .insert(account.to_string(), password.to_string());
        Ok(())
    }

    fn get_password(&self, account: &str) -> Result<Option<String>, VaultError> {
        Ok(self.get(account))
    }

    fn delete_password(&self, account: &str) -> Result<(), VaultError> {
        self.entries.lock().unwrap().remove(account);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
