use crate::config::DeviceProfile;
use crate::error::{AppError, AppResult};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use ssh2::{CheckResult, KnownHostFileKind, Session as Ssh2Session};
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Transport keepalive interval; `is_alive` relies on keepalive being enabled.
const KEEPALIVE_INTERVAL_SECS: u32 = 15;

/// Output of one remote command. A non-zero exit code is the remote
/// process's own status, not a transport failure.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Read-only session snapshot for listings
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub hostname: String,
    pub username: String,
    pub connected: bool,
    pub alive: bool,
    pub last_activity: i64,
    pub working_directory: String,
}

/// One SSH connection to a single device.
///
/// Created disconnected; `connect` either transitions to connected or leaves
/// no partial state behind. All operations require an explicit prior connect.
pub struct TransportSession {
    id: String,
    profile: DeviceProfile,
    transport: Mutex<Option<Ssh2Session>>,
    connected: RwLock<bool>,
    last_activity: RwLock<i64>,
    working_directory: RwLock<String>,
}

impl TransportSession {
    pub fn new(id: String, profile: DeviceProfile) -> Self {
        Self {
            id,
            profile,
            transport: Mutex::new(None),
            connected: RwLock::new(false),
            last_activity: RwLock::new(Utc::now().timestamp()),
            working_directory: RwLock::new("~".to_string()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    pub fn last_activity(&self) -> i64 {
        *self.last_activity.read()
    }

    pub fn working_directory(&self) -> String {
        self.working_directory.read().clone()
    }

    /// Remember a working directory for display. Best-effort only; not
    /// synchronized with any remote shell state.
    pub fn set_working_directory(&self, dir: impl Into<String>) {
        *self.working_directory.write() = dir.into();
    }

    /// Establish the SSH transport: TCP connect, handshake, host-key check,
    /// authentication. On any failure the session stays disconnected.
    pub fn connect(&self, timeout: Duration) -> AppResult<()> {
        // A stale transport from a previous connect is torn down first.
        self.disconnect();

        if self.profile.hostname.is_empty() {
            return Err(AppError::Connection(format!(
                "profile '{}' has no hostname",
                self.profile.name
            )));
        }
        if self.profile.username.is_empty() {
            return Err(AppError::Connection(format!(
                "profile '{}' has no username",
                self.profile.name
            )));
        }

        tracing::info!(
            "Connecting to {}@{}:{} (session {})",
            self.profile.username,
            self.profile.hostname,
            self.profile.port,
            self.id
        );

        let addr = (self.profile.hostname.as_str(), self.profile.port)
            .to_socket_addrs()
            .map_err(|e| {
                AppError::Connection(format!("failed to resolve {}: {}", self.profile.hostname, e))
            })?
            .next()
            .ok_or_else(|| {
                AppError::Connection(format!("no addresses found for {}", self.profile.hostname))
            })?;

        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                AppError::Timeout(format!(
                    "connect to {} timed out after {}s",
                    addr,
                    timeout.as_secs()
                ))
            } else {
                AppError::Connection(format!("TCP connect to {} failed: {}", addr, e))
            }
        })?;
        tcp.set_nodelay(true)?;

        let mut session = Ssh2Session::new()
            .map_err(|e| AppError::Ssh(format!("failed to create SSH session: {}", e)))?;
        session.set_compress(self.profile.compression);
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout.as_millis() as u32);
        session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);

        session
            .handshake()
            .map_err(|e| map_ssh_error(e, "SSH handshake failed"))?;

        self.verify_host_key(&session)?;
        self.authenticate(&session)?;

        // Post-connect operations manage their own deadlines.
        session.set_timeout(0);

        *self.transport.lock() = Some(session);
        *self.connected.write() = true;
        *self.last_activity.write() = Utc::now().timestamp();

        tracing::info!("SSH connected (session {})", self.id);
        Ok(())
    }

    /// Check the server's host key against the user's known_hosts.
    ///
    /// A mismatch is always rejected. An unknown host is rejected under
    /// strict checking and trusted otherwise.
    fn verify_host_key(&self, session: &Ssh2Session) -> AppResult<()> {
        let (key, _key_type) = session
            .host_key()
            .ok_or_else(|| AppError::Connection("no host key received".to_string()))?;

        let mut known_hosts = session
            .known_hosts()
            .map_err(|e| AppError::Ssh(format!("failed to init known_hosts: {}", e)))?;

        if let Some(path) = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .filter(|p| p.exists())
        {
            let _ = known_hosts.read_file(&path, KnownHostFileKind::OpenSSH);
        }

        match known_hosts.check_port(&self.profile.hostname, self.profile.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound if !self.profile.verify_host_keys => {
                tracing::warn!(
                    "Trusting unknown host key for {}:{} (session {})",
                    self.profile.hostname,
                    self.profile.port,
                    self.id
                );
                Ok(())
            }
            CheckResult::NotFound => Err(AppError::Connection(format!(
                "host key for {}:{} is not in known_hosts (strict checking)",
                self.profile.hostname, self.profile.port
            ))),
            CheckResult::Mismatch => {
                tracing::error!(
                    "Host key mismatch for {}:{} (session {})",
                    self.profile.hostname,
                    self.profile.port,
                    self.id
                );
                Err(AppError::Connection(format!(
                    "host key mismatch for {}:{} - refusing to connect",
                    self.profile.hostname, self.profile.port
                )))
            }
            CheckResult::Failure => Err(AppError::Ssh("known_hosts check failed".to_string())),
        }
    }

    /// Authenticate with the key file if the profile has one, else password.
    fn authenticate(&self, session: &Ssh2Session) -> AppResult<()> {
        if let Some(key_file) = &self.profile.key_file {
            session
                .userauth_pubkey_file(&self.profile.username, None, key_file, None)
                .map_err(|e| AppError::Auth(format!("key authentication failed: {}", e)))?;
        } else if let Some(password) = &self.profile.password {
            session
                .userauth_password(&self.profile.username, password)
                .map_err(|_| AppError::Auth("password authentication failed".to_string()))?;
        } else {
            return Err(AppError::Auth(format!(
                "profile '{}' has no key file or password",
                self.profile.name
            )));
        }

        if !session.authenticated() {
            return Err(AppError::Auth("authentication failed".to_string()));
        }

        Ok(())
    }

    /// Close the transport. Idempotent; never fails.
    pub fn disconnect(&self) {
        if let Some(session) = self.transport.lock().take() {
            let _ = session.disconnect(None, "closing session", None);
            tracing::info!("Disconnected session {}", self.id);
        }
        *self.connected.write() = false;
    }

    /// Run a command on the remote host and capture its output.
    ///
    /// The caller must have connected first; this never connects implicitly.
    /// On a deadline overrun the session stays connected but the command's
    /// outcome is unknown.
    pub fn execute_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> AppResult<CommandOutput> {
        let guard = self.transport.lock();
        let session = match (guard.as_ref(), *self.connected.read()) {
            (Some(s), true) => s,
            _ => return Err(AppError::NotConnected(self.id.clone())),
        };

        tracing::debug!("Executing command (session {}): {}", self.id, command);

        session.set_timeout(timeout.map(|t| t.as_millis() as u32).unwrap_or(0));
        let result = run_command(session, command);
        session.set_timeout(0);

        let output = result?;
        *self.last_activity.write() = Utc::now().timestamp();
        Ok(output)
    }

    /// Non-destructive liveness probe: a transport keepalive, no remote
    /// command. Any probe error means not alive and marks the session
    /// disconnected.
    pub fn is_alive(&self) -> bool {
        if !*self.connected.read() {
            return false;
        }

        // A transport busy with a command or transfer counts as alive.
        let Some(guard) = self.transport.try_lock() else {
            return true;
        };
        let Some(session) = guard.as_ref() else {
            return false;
        };

        match session.keepalive_send() {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Liveness probe failed (session {}): {}", self.id, e);
                *self.connected.write() = false;
                false
            }
        }
    }

    /// Open the SFTP file channel for this session.
    pub fn sftp(&self) -> AppResult<ssh2::Sftp> {
        let guard = self.transport.lock();
        match (guard.as_ref(), *self.connected.read()) {
            (Some(s), true) => s
                .sftp()
                .map_err(|e| map_ssh_error(e, "failed to open SFTP channel")),
            _ => Err(AppError::NotConnected(self.id.clone())),
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            hostname: self.profile.hostname.clone(),
            username: self.profile.username.clone(),
            connected: *self.connected.read(),
            alive: self.is_alive(),
            last_activity: *self.last_activity.read(),
            working_directory: self.working_directory.read().clone(),
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn run_command(session: &Ssh2Session, command: &str) -> AppResult<CommandOutput> {
    let mut channel = session
        .channel_session()
        .map_err(|e| map_ssh_error(e, "failed to open channel"))?;
    channel
        .exec(command)
        .map_err(|e| map_ssh_error(e, "exec request failed"))?;

    let mut stdout = Vec::new();
    channel
        .read_to_end(&mut stdout)
        .map_err(|e| map_io_error(e, "failed to read stdout"))?;

    let mut stderr = Vec::new();
    channel
        .stderr()
        .read_to_end(&mut stderr)
        .map_err(|e| map_io_error(e, "failed to read stderr"))?;

    channel
        .wait_close()
        .map_err(|e| map_ssh_error(e, "failed waiting for channel close"))?;
    let exit_code = channel
        .exit_status()
        .map_err(|e| map_ssh_error(e, "failed to read exit status"))?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    })
}

fn map_ssh_error(e: ssh2::Error, context: &str) -> AppError {
    let msg = e.message().to_lowercase();
    // Session(-9) is LIBSSH2_ERROR_TIMEOUT
    let timed_out = matches!(e.code(), ssh2::ErrorCode::Session(-9))
        || msg.contains("timeout")
        || msg.contains("timed out");
    if timed_out {
        AppError::Timeout(format!("{}: {}", context, e))
    } else {
        AppError::Ssh(format!("{}: {}", context, e))
    }
}

fn map_io_error(e: std::io::Error, context: &str) -> AppError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            AppError::Timeout(format!("{}: {}", context, e))
        }
        _ => AppError::Ssh(format!("{}: {}", context, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_profile() -> DeviceProfile {
        let mut profile = DeviceProfile::new("testbox", "127.0.0.1", "tester");
        profile.password = Some("hunter2".to_string());
        profile
    }

    #[test]
    fn test_new_session_is_disconnected() {
        let session = TransportSession::new("conn-1".into(), test_profile());
        assert!(!session.is_connected());
        assert!(!session.is_alive());
        assert_eq!(session.working_directory(), "~");
    }

    #[test]
    fn test_execute_without_connect_fails() {
        let session = TransportSession::new("conn-1".into(), test_profile());
        let err = session.execute_command("uptime", None).unwrap_err();
        assert!(matches!(err, AppError::NotConnected(_)));
    }

    #[test]
    fn test_sftp_without_connect_fails() {
        let session = TransportSession::new("conn-1".into(), test_profile());
        assert!(matches!(
            session.sftp(),
            Err(AppError::NotConnected(_))
        ));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let session = TransportSession::new("conn-1".into(), test_profile());
        session.disconnect();
        assert!(!session.is_connected());
        session.disconnect();
        assert!(!session.is_connected());
    }

    #[test]
    fn test_connect_requires_hostname() {
        let mut profile = test_profile();
        profile.hostname = String::new();
        let session = TransportSession::new("conn-1".into(), profile);
        let err = session.connect(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, AppError::Connection(_)));
        assert!(!session.is_connected());
    }

    #[test]
    fn test_connect_refused_leaves_disconnected() {
        // Port 1 on loopback is virtually guaranteed to refuse.
        let mut profile = test_profile();
        profile.port = 1;
        let session = TransportSession::new("conn-1".into(), profile);
        let err = session.connect(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(
            err,
            AppError::Connection(_) | AppError::Timeout(_)
        ));
        assert!(!session.is_connected());
        assert!(!session.is_alive());
    }

    #[test]
    fn test_working_directory_is_remembered() {
        let session = TransportSession::new("conn-1".into(), test_profile());
        session.set_working_directory("/var/log");
        assert_eq!(session.working_directory(), "/var/log");
        assert_eq!(session.info().working_directory, "/var/log");
    }
}
