//! Audio side-channel: containers whose audio only exists as a host source
//! get a per-slot transcoder (pulse monitor in, MPEG-TS out) whose stdout is
//! relayed to the subscriber as binary WebSocket frames.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::AppState;

const READ_CHUNK: usize = 8192;
const KILL_GRACE: Duration = Duration::from_secs(2);

/// One transcoder per slot; a new subscriber preempts the previous process.
#[derive(Default)]
pub struct AudioRegistry {
    procs: Mutex<HashMap<usize, Child>>,
}

impl AudioRegistry {
    /// Remove and terminate the slot's current transcoder, if any.
    async fn preempt(&self, slot_id: usize) {
        let child = self.procs.lock().await.remove(&slot_id);
        if let Some(child) = child {
            info!(slot = slot_id, "preempting audio transcoder");
            terminate(child).await;
        }
    }

    async fn install(&self, slot_id: usize, child: Child) {
        if let Some(previous) = self.procs.lock().await.insert(slot_id, child) {
            terminate(previous).await;
        }
    }

    /// Tear down the slot's transcoder if `pid` still owns it; a newer
    /// subscriber's process is left untouched.
    async fn teardown(&self, slot_id: usize, pid: Option<u32>) {
        let mut procs = self.procs.lock().await;
        if procs.get(&slot_id).and_then(|c| c.id()) == pid {
            if let Some(child) = procs.remove(&slot_id) {
                drop(procs);
                terminate(child).await;
            }
        }
    }
}

/// SIGTERM first so ffmpeg can flush, SIGKILL after the grace window.
async fn terminate(mut child: Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

pub fn handle(ws: WebSocketUpgrade, state: AppState, slot_id: usize) -> Response {
    ws.on_upgrade(move |socket| stream_audio(socket, state, slot_id))
}

async fn stream_audio(mut socket: WebSocket, state: AppState, slot_id: usize) {
    let container = state.config.container_name(slot_id);
    state.audio.preempt(slot_id).await;

    let mut child = match spawn_transcoder(&container) {
        Ok(child) => child,
        Err(err) => {
            warn!(slot = slot_id, %container, %err, "audio transcoder failed to start");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let Some(mut stdout) = child.stdout.take() else {
        warn!(slot = slot_id, "audio transcoder has no stdout");
        terminate(child).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    let pid = child.id();
    state.audio.install(slot_id, child).await;
    info!(slot = slot_id, %container, pid = pid.unwrap_or(0), "audio transcoder started");

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    debug!(slot = slot_id, "audio transcoder stream ended");
                    break;
                }
                Ok(n) => {
                    if socket.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            },
            incoming = socket.recv() => match incoming {
                // Pings are answered by the protocol layer; anything else
                // from the subscriber is ignored until it closes.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = socket.send(Message::Close(None)).await;
    state.audio.teardown(slot_id, pid).await;
    debug!(slot = slot_id, "audio subscriber disconnected");
}

fn spawn_transcoder(container: &str) -> std::io::Result<Child> {
    Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "pulse",
            "-i",
            &format!("{container}.monitor"),
            "-codec:a",
            "mp2",
            "-b:a",
            "128k",
            "-f",
            "mpegts",
            "-muxdelay",
            "0.1",
            "pipe:1",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}
