//! Remote command execution over SSH.
//!
//! Holds at most one live SSH client per remote host. The client is dialed
//! lazily on first use; when opening a session fails (the server closed the
//! connection underneath us) the client is replaced and the session open is
//! retried exactly once. The mutex only guards dial/swap/session-open;
//! command I/O runs on the channel without holding it.

use crate::error::{Result, SiloError};
use crate::exec::{CommandResult, Executor};
use crate::strutil;
use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Connection parameters for a remote host. Password auth only; the host key
/// is not verified (dev posture).
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub run_as_root: bool,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

pub struct RemoteExecutor {
    config: RemoteConfig,
    client: Mutex<Option<Handle<AcceptingHandler>>>,
}

/// Accepts any host key.
struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

impl RemoteExecutor {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config, client: Mutex::new(None) }
    }

    /// Dial the remote host eagerly. [`Executor::exec`] dials on demand, so
    /// calling this is optional; it exists to surface connectivity problems
    /// at startup.
    pub async fn startup(&self) -> Result<()> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await?);
        }
        Ok(())
    }

    /// Close the client if one is connected.
    pub async fn shutdown(&self) -> Result<()> {
        let mut guard = self.client.lock().await;
        if let Some(handle) = guard.take() {
            handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .map_err(|e| SiloError::Ssh(format!("failed to close client: {e}")))?;
        }
        Ok(())
    }

    async fn dial(&self) -> Result<Handle<AcceptingHandler>> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(
            config,
            (self.config.address.as_str(), self.config.port),
            AcceptingHandler,
        )
        .await
        .map_err(|e| SiloError::Ssh(format!("failed to dial host: {e}")))?;

        let authenticated = handle
            .authenticate_password(&self.config.username, &self.config.password)
            .await
            .map_err(|e| SiloError::Ssh(format!("failed to authenticate: {e}")))?;
        if !authenticated {
            return Err(SiloError::Ssh(format!(
                "password authentication rejected for {}@{}",
                self.config.username, self.config.address
            )));
        }

        Ok(handle)
    }

    /// Open a session channel, redialing the client once if the open fails on
    /// a dropped connection. A second failure is a hard error.
    async fn open_session(&self) -> Result<Channel<Msg>> {
        let mut guard = self.client.lock().await;

        let mut attempts = 0;
        loop {
            if guard.is_none() {
                *guard = Some(self.dial().await?);
            }
            let Some(handle) = guard.as_mut() else {
                continue;
            };

            match handle.channel_open_session().await {
                Ok(channel) => return Ok(channel),
                Err(err) if attempts == 0 => {
                    // The underlying connection likely dropped. Discard the
                    // client and retry once with a fresh one.
                    debug!("ssh session open failed, redialing: {err}");
                    attempts += 1;
                    if let Some(old) = guard.take() {
                        let _ = old.disconnect(Disconnect::ByApplication, "", "en").await;
                    }
                }
                Err(err) => {
                    return Err(SiloError::Ssh(format!(
                        "failed to create ssh session: retry failed: {err}"
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    async fn exec(&self, command: &str) -> Result<CommandResult> {
        let mut channel = self.open_session().await?;

        let command = if self.config.run_as_root {
            format!("sudo sh -c {}", strutil::quote(command))
        } else {
            command.to_string()
        };

        channel
            .exec(true, command.as_str())
            .await
            .map_err(|e| SiloError::Ssh(format!("failed to exec command: {e}")))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = 0;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = exit_status as i32,
                _ => {}
            }
        }

        let result = CommandResult {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        };

        if result.exit_code == 0 {
            Ok(result)
        } else {
            Err(SiloError::CommandFailed(result))
        }
    }
}
