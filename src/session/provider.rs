//! Concrete identity providers.
//!
//! Sessions are `reqwest::Client`s. `DirectProvider` talks to the network
//! as-is; `CircuitProvider` runs an anonymizing SOCKS proxy process and routes
//! the client through it.

use super::IdentityProvider;
use crate::models::{CircuitConfig, HttpConfig, Result, StagehandError};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

fn build_client(http: &HttpConfig, proxy_url: Option<&str>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(http.timeout())
        .user_agent(http.user_agent.as_str());
    if let Some(url) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::all(url)?);
    }
    builder
        .build()
        .map_err(|e| StagehandError::Session(format!("building HTTP client: {e}")))
}

/// No circuit; every identity is a fresh client on the host's own network.
#[derive(Debug, Clone)]
pub struct DirectProvider {
    http: HttpConfig,
}

impl DirectProvider {
    pub fn new(http: HttpConfig) -> Self {
        Self { http }
    }
}

impl IdentityProvider for DirectProvider {
    type Circuit = ();
    type Session = reqwest::Client;

    async fn start_circuit(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_circuit(&self, _circuit: ()) -> Result<()> {
        Ok(())
    }

    async fn open_session(&self, _circuit: &()) -> Result<reqwest::Client> {
        build_client(&self.http, None)
    }

    async fn close_session(&self, _session: reqwest::Client) -> Result<()> {
        Ok(())
    }
}

/// Running circuit process; killed on drop if never stopped explicitly.
#[derive(Debug)]
pub struct CircuitProcess {
    child: Child,
}

impl CircuitProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Launches the configured proxy program in its own process group.
#[derive(Debug, Clone)]
pub struct CircuitProvider {
    circuit: CircuitConfig,
    http: HttpConfig,
}

impl CircuitProvider {
    pub fn new(circuit: CircuitConfig, http: HttpConfig) -> Self {
        Self { circuit, http }
    }
}

impl IdentityProvider for CircuitProvider {
    type Circuit = CircuitProcess;
    type Session = reqwest::Client;

    async fn start_circuit(&self) -> Result<CircuitProcess> {
        let mut command = Command::new(&self.circuit.program);
        command
            .args(&self.circuit.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|e| {
            StagehandError::Session(format!(
                "starting circuit {}: {e}",
                self.circuit.program.display()
            ))
        })?;
        info!(
            program = %self.circuit.program.display(),
            pid = child.id(),
            socks_port = self.circuit.socks_port,
            "Circuit started"
        );
        Ok(CircuitProcess { child })
    }

    async fn stop_circuit(&self, mut circuit: CircuitProcess) -> Result<()> {
        let pid = circuit.child.id();

        // The proxy may fork helpers; take the whole group down.
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            match pid.map(i32::try_from) {
                Some(Ok(raw)) => match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => warn!(pid = raw, error = %e, "Failed to signal circuit process group"),
                },
                Some(Err(_)) => warn!(pid, "Circuit pid out of range, killing the leader only"),
                None => {}
            }
        }

        circuit
            .child
            .kill()
            .await
            .map_err(|e| StagehandError::io("stopping circuit", e))?;
        debug!(pid, "Circuit stopped");
        Ok(())
    }

    async fn open_session(&self, _circuit: &CircuitProcess) -> Result<reqwest::Client> {
        build_client(&self.http, Some(&self.circuit.proxy_url()))
    }

    async fn close_session(&self, _session: reqwest::Client) -> Result<()> {
        Ok(())
    }

    fn settle_after_start(&self) -> Duration {
        self.circuit.settle_after_start()
    }

    fn settle_after_stop(&self) -> Duration {
        self.circuit.settle_after_stop()
    }
}
