use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::FlowConfig;
use crate::error::FlowError;
use crate::rpc::Liveness;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// First line the backend prints on stdout once it is listening.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handshake {
    pub token: String,
    pub port: u16,
}

/// The backend child process, supervised by exit polling only.
#[derive(Debug)]
pub struct BackendProcess {
    child: Mutex<Child>,
    pid: u32,
    handshake: Handshake,
    log_path: PathBuf,
}

impl BackendProcess {
    pub fn spawn(config: &FlowConfig) -> Result<Self, FlowError> {
        config.check_backend_path()?;

        // Truncate once, then hand the child an append-mode handle so a later
        // clear_log does not leave it writing past the new end of file.
        File::create(&config.backend_log).map_err(|err| {
            FlowError::process(format!("failed to create {}: {err}", config.backend_log.display()))
        })?;
        let log_file = OpenOptions::new().append(true).open(&config.backend_log).map_err(|err| {
            FlowError::process(format!("failed to open {}: {err}", config.backend_log.display()))
        })?;

        let mut cmd = Command::new(&config.backend_path);
        if let Some(decrement_file) = &config.decrement_file {
            cmd.arg("--decrement-file").arg(decrement_file);
        }
        cmd.arg("0").stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::from(log_file));

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FlowError::process(format!(
                    "failed to spawn '{}' (not found). set backend_path in the config",
                    config.backend_path.display()
                )))
            }
            Err(err) => {
                return Err(FlowError::process(format!(
                    "failed to spawn {}: {err}",
                    config.backend_path.display()
                )))
            }
        };
        let pid = child.id();

        let handshake = child
            .stdout
            .take()
            .ok_or_else(|| FlowError::process("backend stdout was not captured"))
            .and_then(|stdout| read_handshake(stdout, pid));
        let handshake = match handshake {
            Ok(handshake) => handshake,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };
        log::info!("backend: pid {pid} listening on port {}", handshake.port);

        Ok(Self { child: Mutex::new(child), pid, handshake, log_path: config.backend_log.clone() })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn token(&self) -> &str {
        &self.handshake.token
    }

    pub fn port(&self) -> u16 {
        self.handshake.port
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Non-blocking exit check.
    pub fn has_exited(&self) -> bool {
        let mut child = self.child.lock().expect("backend child mutex poisoned");
        match child.try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(err) => {
                log::warn!("backend: failed to check pid {} status: {err}", self.pid);
                false
            }
        }
    }

    /// Asks the backend to exit, then kills it once `timeout` has elapsed.
    pub fn terminate(&self, timeout: Duration) -> Result<(), FlowError> {
        let mut child = self.child.lock().expect("backend child mutex poisoned");
        if try_wait(&mut child)?.is_some() {
            return Ok(());
        }

        request_exit(&mut child)?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = try_wait(&mut child)? {
                log::debug!("backend: pid {} exited with {status}", self.pid);
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }

        log::warn!(
            "backend: {}s timeout reached, killing pid {}",
            timeout.as_secs_f64(),
            self.pid
        );
        if let Err(err) = child.kill() {
            log::debug!("backend: kill pid {} failed: {err}", self.pid);
        }
        child
            .wait()
            .map(|_| ())
            .map_err(|err| FlowError::process(format!("failed to reap pid {}: {err}", self.pid)))
    }

    /// Empties the backend's stderr log.
    pub fn clear_log(&self) -> Result<(), FlowError> {
        OpenOptions::new()
            .write(true)
            .open(&self.log_path)
            .and_then(|file| file.set_len(0))
            .map_err(|err| {
                FlowError::process(format!("failed to clear {}: {err}", self.log_path.display()))
            })
    }
}

impl Liveness for BackendProcess {
    fn has_exited(&self) -> bool {
        BackendProcess::has_exited(self)
    }
}

impl Drop for BackendProcess {
    fn drop(&mut self) {
        let Ok(child) = self.child.get_mut() else {
            return;
        };
        if let Ok(None) = child.try_wait() {
            log::debug!("backend: killing pid {} on drop", self.pid);
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn try_wait(child: &mut Child) -> Result<Option<std::process::ExitStatus>, FlowError> {
    child
        .try_wait()
        .map_err(|err| FlowError::process(format!("failed to check backend status: {err}")))
}

#[cfg(unix)]
fn request_exit(child: &mut Child) -> Result<(), FlowError> {
    let pid = child.id();
    let status = Command::new("kill")
        .arg(pid.to_string())
        .status()
        .map_err(|err| FlowError::process(format!("failed to signal pid {pid}: {err}")))?;
    if !status.success() {
        log::debug!("backend: kill returned {status} for pid {pid}");
    }
    Ok(())
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) -> Result<(), FlowError> {
    child
        .kill()
        .map_err(|err| FlowError::process(format!("failed to stop pid {}: {err}", child.id())))
}

/// Waits for the handshake line, then leaves a thread draining the rest of
/// stdout into the debug log so the pipe never fills.
fn read_handshake(stdout: ChildStdout, pid: u32) -> Result<Handshake, FlowError> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("flow-backend-stdout".into())
        .spawn(move || {
            let mut lines = BufReader::new(stdout).lines();
            let first = lines.next();
            let _ = tx.send(first);
            for line in lines.map_while(Result::ok) {
                log::debug!("backend({pid}): {line}");
            }
        })
        .map_err(|err| FlowError::process(format!("failed to spawn stdout reader: {err}")))?;

    let line = match rx.recv_timeout(HANDSHAKE_TIMEOUT) {
        Ok(Some(Ok(line))) => line,
        Ok(Some(Err(err))) => {
            return Err(FlowError::process(format!("failed to read backend handshake: {err}")))
        }
        Ok(None) | Err(mpsc::RecvTimeoutError::Disconnected) => {
            return Err(FlowError::process("backend exited before the handshake"))
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            return Err(FlowError::process("timed out waiting for the backend handshake"))
        }
    };
    parse_handshake(&line)
}

pub fn parse_handshake(line: &str) -> Result<Handshake, FlowError> {
    serde_json::from_str(line.trim())
        .map_err(|err| FlowError::process(format!("invalid backend handshake {line:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_line_is_parsed() {
        assert_eq!(
            parse_handshake("{\"token\": \"abc\", \"port\": 40123}\n").unwrap(),
            Handshake { token: "abc".into(), port: 40123 }
        );
    }

    #[test]
    fn malformed_handshake_is_a_process_error() {
        let err = parse_handshake("listening").unwrap_err();
        assert!(matches!(err, FlowError::Process { .. }));
        let err = parse_handshake("{\"token\": \"abc\"}").unwrap_err();
        assert!(matches!(err, FlowError::Process { .. }));
    }
}
