// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! OS shell for running directly on the SUT.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use super::{AsyncHandle, CommandOutput, OsShell};
use crate::error::{Result, UpiError};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs commands through `sh -c` on the local host.
#[derive(Debug, Default)]
pub struct LocalShell {
    next_id: u64,
    session: Vec<Child>,
}

impl LocalShell {
    pub fn new() -> Self {
        Self::default()
    }

    fn command(cmd: &str, cwd: Option<&str>) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        command
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    })
}

impl OsShell for LocalShell {
    fn execute(&mut self, cmd: &str, timeout: Duration, cwd: Option<&str>) -> Result<CommandOutput> {
        log::debug!("execute: {}", cmd);
        let mut child = Self::command(cmd, cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(UpiError::CommandFailed(format!(
                    "'{}' timed out after {}s",
                    cmd,
                    timeout.as_secs()
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        Ok(CommandOutput {
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
            return_code: status.code().unwrap_or(-1),
        })
    }

    fn execute_async(&mut self, cmd: &str, cwd: Option<&str>) -> Result<AsyncHandle> {
        log::debug!("execute_async: {}", cmd);
        let child = Self::command(cmd, cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        self.session.push(child);
        self.next_id += 1;
        Ok(AsyncHandle {
            id: self.next_id,
            command: cmd.to_string(),
        })
    }

    fn kill_async_session(&mut self) -> Result<()> {
        for mut child in self.session.drain(..) {
            // Already-exited children report an error here; nothing to do.
            let _ = child.kill();
            let _ = child.wait();
        }
        Ok(())
    }

    fn path_exists(&mut self, path: &str) -> Result<bool> {
        if path.contains('*') {
            // Let the shell expand the pattern.
            let output = self.execute(&format!("ls -d {}", path), Duration::from_secs(10), None)?;
            return Ok(output.succeeded());
        }
        Ok(Path::new(path).exists())
    }
}

impl Drop for LocalShell {
    fn drop(&mut self) {
        let _ = self.kill_async_session();
    }
}
