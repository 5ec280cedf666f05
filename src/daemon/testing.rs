//! In-process stand-ins for the prediction engine, used by unit tests.

use super::process::{LaunchSpec, ProcessControl};
use crate::error::{DaemonError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) fn model_file() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.vw");
    std::fs::write(&path, b"weights").unwrap();
    (dir, path)
}

pub(crate) fn touch(path: &Path, offset: Duration) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + offset).unwrap();
}

/// Serve `response` for every request line until the token is cancelled.
pub(crate) fn serve_lines(listener: TcpListener, response: &str) -> CancellationToken {
    let token = CancellationToken::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(accept_loop(listener, response.to_string(), received, token.clone()));
    token
}

async fn accept_loop(
    listener: TcpListener,
    response: String,
    received: Arc<Mutex<Vec<String>>>,
    token: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(_) => return,
            },
        };

        let response = response.clone();
        let received = Arc::clone(&received);
        let token = token.clone();
        tokio::spawn(async move {
            let mut stream = BufReader::new(stream);
            loop {
                let mut line = String::new();
                let read = tokio::select! {
                    _ = token.cancelled() => return,
                    read = stream.read_line(&mut line) => read,
                };
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {
                        received.lock().unwrap().push(line);
                        if stream.get_mut().write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Process counts that follow a script; the last entry repeats.
pub(crate) struct ScriptedCounts {
    script: Mutex<VecDeque<usize>>,
    fail: bool,
    polls: AtomicUsize,
}

impl ScriptedCounts {
    pub(crate) fn new(script: impl IntoIterator<Item = usize>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fail: false,
            polls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new([])
        }
    }

    pub(crate) fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessControl for ScriptedCounts {
    async fn launch(&self, _spec: &LaunchSpec) -> Result<()> {
        Ok(())
    }

    async fn kill(&self, _port: u16) -> Result<()> {
        Ok(())
    }

    async fn count(&self, _port: u16) -> Result<usize> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DaemonError::ProcessQuery("scripted failure".into()));
        }
        let mut script = self.script.lock().unwrap();
        let next = script.front().copied().unwrap_or(0);
        if script.len() > 1 {
            script.pop_front();
        }
        Ok(next)
    }
}

#[derive(Default)]
struct PortState {
    count: usize,
    kills: usize,
    launches: usize,
    ignore_kills: bool,
    partial: Option<usize>,
    server: Option<(CancellationToken, JoinHandle<()>)>,
    received: Arc<Mutex<Vec<String>>>,
}

/// Fake engine: `launch` binds a real loopback listener on the port and
/// reports `workers + 1` processes; `kill` tears it down.
pub(crate) struct FakeEngine {
    response: String,
    ports: Mutex<HashMap<u16, PortState>>,
}

impl FakeEngine {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            response: "0.5 tag1\n".to_string(),
            ports: Mutex::new(HashMap::new()),
        })
    }

    fn with_port<T>(&self, port: u16, f: impl FnOnce(&mut PortState) -> T) -> T {
        let mut ports = self.ports.lock().unwrap();
        f(ports.entry(port).or_default())
    }

    pub(crate) fn set_count(&self, port: u16, count: usize) {
        self.with_port(port, |p| p.count = count);
    }

    pub(crate) fn count_now(&self, port: u16) -> usize {
        self.with_port(port, |p| p.count)
    }

    pub(crate) fn kills(&self, port: u16) -> usize {
        self.with_port(port, |p| p.kills)
    }

    pub(crate) fn launches(&self, port: u16) -> usize {
        self.with_port(port, |p| p.launches)
    }

    pub(crate) fn ignore_kills(&self, port: u16) {
        self.with_port(port, |p| p.ignore_kills = true);
    }

    /// Launches on `port` only ever bring up `count` processes.
    pub(crate) fn partial_start(&self, port: u16, count: usize) {
        self.with_port(port, |p| p.partial = Some(count));
    }

    pub(crate) fn received(&self, port: u16) -> Vec<String> {
        self.with_port(port, |p| p.received.lock().unwrap().clone())
    }

    /// Drop every connection and the listener while still reporting processes.
    pub(crate) async fn crash(&self, port: u16) {
        let server = self.with_port(port, |p| p.server.take());
        if let Some((token, task)) = server {
            token.cancel();
            let _ = task.await;
        }
    }
}

#[async_trait]
impl ProcessControl for FakeEngine {
    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        let partial = self.with_port(spec.port, |p| {
            p.launches += 1;
            p.partial
        });
        if let Some(count) = partial {
            self.set_count(spec.port, count);
            return Ok(());
        }

        let listener = TcpListener::bind(("127.0.0.1", spec.port))
            .await
            .map_err(|source| DaemonError::Launch {
                binary: spec.binary.clone(),
                source,
            })?;

        self.with_port(spec.port, |p| {
            let token = CancellationToken::new();
            let task = tokio::spawn(accept_loop(
                listener,
                self.response.clone(),
                Arc::clone(&p.received),
                token.clone(),
            ));
            p.server = Some((token, task));
            p.count = spec.workers + 1;
        });
        Ok(())
    }

    async fn kill(&self, port: u16) -> Result<()> {
        let server = self.with_port(port, |p| {
            p.kills += 1;
            if p.ignore_kills {
                return None;
            }
            p.count = 0;
            p.server.take()
        });
        if let Some((token, task)) = server {
            token.cancel();
            let _ = task.await;
        }
        Ok(())
    }

    async fn count(&self, port: u16) -> Result<usize> {
        Ok(self.count_now(port))
    }
}
