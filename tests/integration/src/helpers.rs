//! Test helpers for spawning a cinder-server and speaking its wire
//! protocol: text command lines out, RESP replies back.

use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A parsed RESP reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    /// `None` is the `$-1` absent value.
    Bulk(Option<String>),
    Array(Vec<Reply>),
}

/// Options for starting a test server.
#[derive(Default)]
pub struct ServerOptions {
    /// Persistence mode flag ("rdb" / "aof").
    pub persistence: Option<&'static str>,
    pub appendfsync: Option<&'static str>,
    /// Reuse an existing data directory (restart scenarios).
    pub data_dir_path: Option<PathBuf>,
    pub node_role: Option<&'static str>,
    pub master_port: Option<u16>,
    pub node_id: Option<&'static str>,
}

/// A cinder-server subprocess managed by the test harness.
pub struct TestServer {
    child: Child,
    pub port: u16,
    _data_dir: Option<tempfile::TempDir>,
}

impl TestServer {
    /// Starts a server with defaults on a free port.
    pub fn start() -> Self {
        Self::start_with(ServerOptions::default())
    }

    /// Starts a server with custom options, blocking until it accepts
    /// connections (up to 5 seconds).
    pub fn start_with(opts: ServerOptions) -> Self {
        let binary = server_binary();
        // keep derived ports (command + 11000 / + 20000) inside u16
        let port = find_free_port();

        let mut cmd = Command::new(&binary);
        cmd.arg("--host").arg("127.0.0.1");
        cmd.arg("--port").arg(port.to_string());
        cmd.arg("--databases").arg("4");
        cmd.env("RUST_LOG", "error");

        let data_dir = if let Some(ref path) = opts.data_dir_path {
            cmd.arg("--data-dir").arg(path);
            None
        } else {
            let dir = tempfile::tempdir().expect("create temp data dir");
            cmd.arg("--data-dir").arg(dir.path());
            Some(dir)
        };

        if let Some(mode) = opts.persistence {
            cmd.arg("--persistence").arg(mode);
        }
        if let Some(policy) = opts.appendfsync {
            cmd.arg("--appendfsync").arg(policy);
        }
        if let Some(role) = opts.node_role {
            cmd.arg("--node-role").arg(role);
        }
        if let Some(master_port) = opts.master_port {
            cmd.arg("--master-host").arg("127.0.0.1");
            cmd.arg("--master-port").arg(master_port.to_string());
        }
        if let Some(id) = opts.node_id {
            cmd.arg("--node-id").arg(id);
        }

        let child = cmd
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .unwrap_or_else(|e| {
                panic!("failed to spawn cinder-server at {}: {e}", binary.display())
            });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if std::time::Instant::now() > deadline {
                panic!("cinder-server failed to start within 5 seconds on port {port}");
            }
            if std::net::TcpStream::connect(format!("127.0.0.1:{port}")).is_ok() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        Self {
            child,
            port,
            _data_dir: data_dir,
        }
    }

    /// Connects a test client to this server.
    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.port).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A minimal client: writes command lines, parses RESP replies.
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(format!("127.0.0.1:{port}"))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to 127.0.0.1:{port}: {e}"));
        let (read_half, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer,
        };
        // consume the connection greeting
        let greeting = client.read_line().await;
        assert!(
            greeting.starts_with("+OK Welcome"),
            "unexpected greeting: {greeting}"
        );
        client
    }

    /// Sends one command line and returns the parsed reply.
    pub async fn cmd(&mut self, line: &str) -> Reply {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write command");
        self.read_reply().await
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .expect("read reply line");
        assert!(n > 0, "server closed connection");
        line.trim_end_matches(['\r', '\n']).to_owned()
    }

    async fn read_reply(&mut self) -> Reply {
        let line = self.read_line().await;
        let (prefix, rest) = line.split_at(1);
        match prefix {
            "+" => Reply::Simple(rest.to_owned()),
            "-" => Reply::Error(rest.to_owned()),
            ":" => Reply::Integer(rest.parse().expect("integer reply")),
            "$" => {
                let len: i64 = rest.parse().expect("bulk length");
                if len < 0 {
                    return Reply::Bulk(None);
                }
                let mut buf = vec![0u8; len as usize + 2]; // data + CRLF
                self.reader
                    .read_exact(&mut buf)
                    .await
                    .expect("read bulk body");
                buf.truncate(len as usize);
                Reply::Bulk(Some(String::from_utf8(buf).expect("utf-8 bulk")))
            }
            "*" => {
                let count: usize = rest.parse().expect("array length");
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(Box::pin(self.read_reply()).await);
                }
                Reply::Array(items)
            }
            other => panic!("unknown reply prefix '{other}' in line: {line}"),
        }
    }

    /// Sends a command and expects `+OK`.
    pub async fn ok(&mut self, line: &str) {
        match self.cmd(line).await {
            Reply::Simple(s) if s == "OK" => {}
            other => panic!("expected OK for '{line}', got {other:?}"),
        }
    }

    /// Sends a command and extracts the integer reply.
    pub async fn get_int(&mut self, line: &str) -> i64 {
        match self.cmd(line).await {
            Reply::Integer(n) => n,
            other => panic!("expected integer for '{line}', got {other:?}"),
        }
    }

    /// Sends a command and extracts the bulk string (None = absent).
    pub async fn get_bulk(&mut self, line: &str) -> Option<String> {
        match self.cmd(line).await {
            Reply::Bulk(value) => value,
            other => panic!("expected bulk for '{line}', got {other:?}"),
        }
    }

    /// Sends a command and expects an error; returns the message.
    pub async fn err(&mut self, line: &str) -> String {
        match self.cmd(line).await {
            Reply::Error(msg) => msg,
            other => panic!("expected error for '{line}', got {other:?}"),
        }
    }

    /// Sends a command and flattens an array-of-bulks reply.
    pub async fn get_array(&mut self, line: &str) -> Vec<String> {
        match self.cmd(line).await {
            Reply::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Bulk(Some(s)) => s,
                    other => panic!("expected bulk array element, got {other:?}"),
                })
                .collect(),
            other => panic!("expected array for '{line}', got {other:?}"),
        }
    }
}

/// Finds a free port low enough that the derived replication and
/// gossip ports stay below 65536.
pub fn find_free_port() -> u16 {
    static NEXT: AtomicU16 = AtomicU16::new(21000);
    loop {
        let candidate = NEXT.fetch_add(1, Ordering::Relaxed);
        if candidate > 44000 {
            panic!("no free test port found");
        }
        let command_free = std::net::TcpListener::bind(("127.0.0.1", candidate)).is_ok();
        let sync_free = std::net::TcpListener::bind(("127.0.0.1", candidate + 11000)).is_ok();
        if command_free && sync_free {
            return candidate;
        }
    }
}

/// Locates the cinder-server binary in the cargo target directory.
fn server_binary() -> PathBuf {
    let mut path = std::env::current_exe().expect("current test binary path");
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("cinder-server");
    if !path.exists() {
        panic!(
            "cinder-server binary not found. run `cargo build` first.\nlooked at: {}",
            path.display()
        );
    }
    path
}
