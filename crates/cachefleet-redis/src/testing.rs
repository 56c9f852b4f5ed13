//! In-process mock cache server for tests.
//!
//! Speaks just enough RESP for the admin client: AUTH, CLIENT, PING,
//! DBSIZE, LASTSAVE, INFO persistence, BGSAVE, FLUSHALL. BGSAVE completes
//! ~50 ms later, writing the configured dump file (if any) and advancing
//! LASTSAVE by one second.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const SAVE_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct State {
    password: String,
    keys: u64,
    lastsave: i64,
    dump: Option<(PathBuf, Vec<u8>)>,
    saves: u32,
    saving: bool,
    last_save_failed: bool,
    fail_bgsave: bool,
    stall_bgsave: bool,
    fail_in_background: bool,
    freeze_lastsave: bool,
}

/// A mock server bound to an ephemeral localhost port. Stops on drop.
#[derive(Debug)]
pub struct MockRedis {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    accept: JoinHandle<()>,
}

impl MockRedis {
    /// Start a server requiring `password` (empty means no AUTH needed).
    pub async fn start(password: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock redis");
        Self::serve(listener, password)
    }

    /// Start a server on an already bound listener.
    pub fn serve(listener: TcpListener, password: &str) -> Self {
        let addr = listener.local_addr().expect("mock redis local addr");
        let state = Arc::new(Mutex::new(State {
            password: password.to_string(),
            lastsave: 1_700_000_000,
            ..State::default()
        }));
        let accept_state = Arc::clone(&state);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle(stream, Arc::clone(&accept_state)));
            }
        });
        Self {
            addr,
            state,
            accept,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_keys(&self, keys: u64) {
        self.lock().keys = keys;
    }

    pub fn keys(&self) -> u64 {
        self.lock().keys
    }

    /// File BGSAVE writes on completion.
    pub fn set_dump(&self, path: &Path, contents: &[u8]) {
        self.lock().dump = Some((path.to_path_buf(), contents.to_vec()));
    }

    /// Make BGSAVE answer with an error reply.
    pub fn fail_bgsave(&self) {
        self.lock().fail_bgsave = true;
    }

    /// Make BGSAVE report started but never finish.
    pub fn stall_bgsave(&self) {
        self.lock().stall_bgsave = true;
    }

    /// Make BGSAVE start, then finish with `rdb_last_bgsave_status:err`.
    pub fn fail_bgsave_in_background(&self) {
        self.lock().fail_in_background = true;
    }

    /// Complete saves without moving LASTSAVE, as when a save finishes
    /// within the same second it started.
    pub fn freeze_lastsave(&self) {
        self.lock().freeze_lastsave = true;
    }

    /// Number of completed background saves.
    pub fn saves(&self) -> u32 {
        self.lock().saves
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for MockRedis {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// One request: an array of bulk strings. `None` on EOF or anything else.
async fn read_request(stream: &mut BufReader<TcpStream>) -> Option<Vec<String>> {
    let count = read_length(stream, '*').await?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_length(stream, '$').await?;
        let mut data = vec![0u8; len + 2];
        stream.read_exact(&mut data).await.ok()?;
        data.truncate(len);
        args.push(String::from_utf8(data).ok()?);
    }
    Some(args)
}

async fn read_length(stream: &mut BufReader<TcpStream>, marker: char) -> Option<usize> {
    let mut line = String::new();
    if stream.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    line.strip_suffix("\r\n")?.strip_prefix(marker)?.parse().ok()
}

async fn handle(stream: TcpStream, state: Arc<Mutex<State>>) {
    let mut stream = BufReader::new(stream);
    let mut authenticated = state.lock().map(|s| s.password.is_empty()).unwrap_or(false);

    while let Some(args) = read_request(&mut stream).await {
        let Some(command) = args.first().map(|c| c.to_ascii_uppercase()) else {
            break;
        };

        let response = if command == "AUTH" {
            let ok = {
                let s = state.lock().unwrap_or_else(|e| e.into_inner());
                args.last().is_some_and(|p| *p == s.password)
            };
            if ok {
                authenticated = true;
                "+OK\r\n".to_string()
            } else {
                "-WRONGPASS invalid username-password pair\r\n".to_string()
            }
        } else if !authenticated {
            "-NOAUTH Authentication required.\r\n".to_string()
        } else {
            dispatch(&command, &args[1..], &state)
        };

        if stream.get_mut().write_all(response.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn bulk(text: &str) -> String {
    format!("${}\r\n{text}\r\n", text.len())
}

fn dispatch(command: &str, args: &[String], state: &Arc<Mutex<State>>) -> String {
    let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
    match command {
        "PING" => "+PONG\r\n".to_string(),
        // Connection setup: SETNAME / SETINFO.
        "CLIENT" => "+OK\r\n".to_string(),
        "DBSIZE" => format!(":{}\r\n", s.keys),
        "LASTSAVE" => format!(":{}\r\n", s.lastsave),
        "INFO" if args.first().is_some_and(|a| a.eq_ignore_ascii_case("persistence")) => {
            bulk(&format!(
                "# Persistence\r\nloading:0\r\nrdb_bgsave_in_progress:{}\r\n\
                 rdb_last_save_time:{}\r\nrdb_last_bgsave_status:{}\r\n",
                u8::from(s.saving),
                s.lastsave,
                if s.last_save_failed { "err" } else { "ok" },
            ))
        }
        "FLUSHALL" => {
            s.keys = 0;
            "+OK\r\n".to_string()
        }
        "BGSAVE" if s.fail_bgsave => "-ERR Background save failed\r\n".to_string(),
        "BGSAVE" if s.saving => "-ERR Background save already in progress\r\n".to_string(),
        "BGSAVE" if s.stall_bgsave => {
            s.saving = true;
            "+Background saving started\r\n".to_string()
        }
        "BGSAVE" => {
            s.saving = true;
            let state = Arc::clone(state);
            tokio::spawn(async move {
                tokio::time::sleep(SAVE_DELAY).await;
                let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
                s.saving = false;
                if s.fail_in_background {
                    s.last_save_failed = true;
                    return;
                }
                if let Some((path, contents)) = &s.dump {
                    let _ = std::fs::write(path, contents);
                }
                s.last_save_failed = false;
                if !s.freeze_lastsave {
                    s.lastsave += 1;
                }
                s.saves += 1;
            });
            "+Background saving started\r\n".to_string()
        }
        other => format!("-ERR unknown command '{other}'\r\n"),
    }
}
