#![allow(dead_code)]

use futures::StreamExt;
use jobdeck::api::{self, resolve::SessionCarriage, AppState, RouterConfig};
use jobdeck::artifacts::ArtifactStore;
use jobdeck::job::{JobRunner, WorkerCommand};
use jobdeck::session::SessionRegistry;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Worker that logs a few lines, writes one stderr chunk, drops an
/// artifact into `downloadPath` and exits 0.
pub const WORKER_OK: &str = r#"
dl=$(sed -n 's/.*"downloadPath": *"\([^"]*\)".*/\1/p' "$1")
echo "starting"
echo ""
echo "processing"
echo "oops" >&2
printf 'report body' > "$dl/report.txt"
echo "finished"
"#;

/// Worker that records its pid next to the descriptor's download dir,
/// announces itself and then sleeps.
pub const WORKER_SLOW: &str = r#"
dl=$(sed -n 's/.*"downloadPath": *"\([^"]*\)".*/\1/p' "$1")
echo $$ > "$dl/worker.pid"
echo "started"
exec sleep 30
"#;

/// A running server over temp directories.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub client: reqwest::Client,
    pub root: tempfile::TempDir,
}

/// Write `body` as a shell script and return the worker command running it.
pub fn write_worker(dir: &Path, body: &str) -> WorkerCommand {
    let script = dir.join("worker.sh");
    std::fs::write(&script, format!("#!/bin/sh\n{body}")).unwrap();
    WorkerCommand {
        program: "/bin/sh".to_string(),
        args: vec![script.to_string_lossy().into_owned()],
        cwd: None,
    }
}

pub fn descriptor_dir(root: &Path) -> PathBuf {
    root.join("descriptors")
}

/// Start a server whose worker runs the given shell script body.
pub async fn start_server(worker_body: &str) -> TestServer {
    let root = tempfile::tempdir().unwrap();
    let worker = write_worker(root.path(), worker_body);
    start_server_with(root, worker).await
}

pub async fn start_server_with(root: tempfile::TempDir, worker: WorkerCommand) -> TestServer {
    let artifacts = ArtifactStore::new(root.path().join("downloads"));
    let runner = JobRunner::new(
        worker,
        artifacts.clone(),
        "https://example.test/login",
        descriptor_dir(root.path()),
        Duration::from_millis(500),
    );
    let state = AppState {
        sessions: SessionRegistry::new(),
        artifacts,
        runner: Arc::new(runner),
        carriage: Arc::new(SessionCarriage::from_settings(&Default::default())),
    };
    let app = api::router(state.clone(), RouterConfig::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        state,
        client: reqwest::Client::new(),
        root,
    }
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Mint a session and return its cookie pair (`name=value`).
    pub async fn new_session(&self) -> String {
        let resp = self.client.get(self.url("/api/session")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let set_cookie = resp
            .headers()
            .get("set-cookie")
            .expect("session cookie")
            .to_str()
            .unwrap();
        set_cookie.split(';').next().unwrap().to_string()
    }

    pub fn session_id(cookie: &str) -> &str {
        cookie.split_once('=').map(|(_, v)| v).unwrap()
    }

    pub async fn post_json(&self, cookie: &str, path: &str, body: serde_json::Value) -> serde_json::Value {
        let resp = self
            .client
            .post(self.url(path))
            .header("cookie", cookie)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }

    pub async fn get_json(&self, cookie: &str, path: &str) -> serde_json::Value {
        let resp = self
            .client
            .get(self.url(path))
            .header("cookie", cookie)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }

    /// Give the session a complete config and a two-entry target list.
    pub async fn configure(&self, cookie: &str) {
        self.post_json(
            cookie,
            "/api/config",
            serde_json::json!({
                "username": "student",
                "password": "secret",
                "classUrl": "https://example.test/class",
                "submissionUrl": "https://example.test/submit",
            }),
        )
        .await;
        let saved = self
            .post_json(
                cookie,
                "/api/students",
                serde_json::json!({"students": "2106700001\n2106700002\n"}),
            )
            .await;
        assert_eq!(saved["count"], 2);
    }

    /// Open the run stream.
    pub async fn open_run(&self, cookie: &str) -> reqwest::Response {
        let resp = self
            .client
            .get(self.url("/api/run"))
            .header("cookie", cookie)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp
    }

    /// Run a job to completion and collect every event.
    pub async fn run_to_end(&self, cookie: &str) -> Vec<serde_json::Value> {
        let mut reader = SseReader::new(self.open_run(cookie).await);
        let mut events = Vec::new();
        while let Some(event) = reader.next_event(Duration::from_secs(10)).await {
            events.push(event);
        }
        events
    }
}

/// Incremental reader of `data:` frames from an SSE response.
pub struct SseReader {
    body: futures::stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buf: String,
    done: bool,
}

impl SseReader {
    pub fn new(resp: reqwest::Response) -> Self {
        Self {
            body: resp.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed(),
            buf: String::new(),
            done: false,
        }
    }

    /// Next event, or `None` once the stream has ended. Panics if nothing
    /// arrives within `timeout`.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<serde_json::Value> {
        loop {
            // Frames are separated by a blank line.
            if let Some(end) = self.buf.find("\n\n") {
                let frame: String = self.buf.drain(..end + 2).collect();
                let data: Vec<&str> = frame
                    .lines()
                    .filter_map(|l| l.strip_prefix("data: ").or_else(|| l.strip_prefix("data:")))
                    .collect();
                if data.is_empty() {
                    // Keep-alive comment.
                    continue;
                }
                return Some(serde_json::from_str(&data.join("\n")).unwrap());
            }
            if self.done {
                return None;
            }
            match tokio::time::timeout(timeout, self.body.next())
                .await
                .expect("timed out waiting for an event")
            {
                Some(chunk) => self.buf.push_str(&String::from_utf8_lossy(&chunk.unwrap())),
                None => self.done = true,
            }
        }
    }
}

/// True if a process with this pid exists (and is not yet reaped).
pub fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Poll `cond` every 20ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
