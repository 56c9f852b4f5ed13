//! Fake init supervisor for tests.
//!
//! Starting a unit reads its config, listens on the configured port and
//! writes the pid of a stand-in `sleep` process to the configured pidfile.
//! Stopping kills that process and closes the listener.

use std::collections::HashMap;
use std::net::TcpListener;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use cachefleet_health::process;
use cachefleet_redis::RedisConf;

use crate::error::{SupervisorError, SupervisorResult};
use crate::unit::UnitController;

#[derive(Debug)]
struct Running {
    pid: i32,
    _listener: Option<TcpListener>,
}

#[derive(Debug)]
struct State {
    starts: u32,
    stops: u32,
    fail_starts: u32,
    listen: bool,
    running: HashMap<String, Running>,
}

#[derive(Debug)]
pub struct FakeUnits {
    state: Mutex<State>,
}

impl Default for FakeUnits {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeUnits {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                starts: 0,
                stops: 0,
                fail_starts: 0,
                listen: true,
                running: HashMap::new(),
            }),
        }
    }

    /// Make the next `n` start calls fail with a unit error.
    pub fn fail_next_starts(&self, n: u32) {
        self.lock().fail_starts = n;
    }

    /// Start units without opening their port.
    pub fn skip_listen(&self) {
        self.lock().listen = false;
    }

    /// Start calls so far, failed ones included.
    pub fn starts(&self) -> u32 {
        self.lock().starts
    }

    pub fn stops(&self) -> u32 {
        self.lock().stops
    }

    pub fn is_running(&self, unit: &str) -> bool {
        self.lock().running.contains_key(unit)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn failure(unit: &str, reason: impl Into<String>) -> SupervisorError {
    SupervisorError::Unit {
        unit: unit.to_string(),
        command: "fake".into(),
        reason: reason.into(),
    }
}

#[async_trait]
impl UnitController for FakeUnits {
    async fn start(&self, unit: &str, config: &Path) -> SupervisorResult<()> {
        let listen = {
            let mut state = self.lock();
            state.starts += 1;
            if state.fail_starts > 0 {
                state.fail_starts -= 1;
                return Err(failure(unit, "injected failure"));
            }
            state.listen
        };

        let conf = RedisConf::load(config)?;
        let port = conf.port()?;
        let listener = if listen {
            Some(
                TcpListener::bind(("127.0.0.1", port))
                    .map_err(|e| failure(unit, format!("bind {port}: {e}")))?,
            )
        } else {
            None
        };

        let mut child = std::process::Command::new("sleep")
            .arg("300")
            .spawn()
            .map_err(|e| failure(unit, e.to_string()))?;
        let pid = child.id() as i32;
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        if let Some(pidfile) = conf.pidfile() {
            std::fs::write(&pidfile, pid.to_string()).map_err(|source| SupervisorError::Io {
                path: pidfile.clone(),
                source,
            })?;
        }

        self.lock().running.insert(
            unit.to_string(),
            Running {
                pid,
                _listener: listener,
            },
        );
        Ok(())
    }

    async fn stop(&self, unit: &str, config: &Path) -> SupervisorResult<()> {
        let running = {
            let mut state = self.lock();
            state.stops += 1;
            state.running.remove(unit)
        };
        if let Some(running) = running {
            let _ = process::kill_and_wait(running.pid, std::time::Duration::from_secs(2)).await;
        }
        if let Some(pidfile) = RedisConf::load(config).ok().and_then(|c| c.pidfile()) {
            let _ = std::fs::remove_file(pidfile);
        }
        Ok(())
    }
}

impl Drop for FakeUnits {
    fn drop(&mut self) {
        for running in self.lock().running.values() {
            let _ = process::kill(running.pid);
        }
    }
}
