//! Append-only command log.
//!
//! One mutating command per LF-terminated line, arguments separated by
//! single spaces. A leading `SELECT i` line switches the shard that
//! subsequent commands replay into. Arguments are not quoted, so values
//! containing whitespace do not survive a rewrite/replay round trip;
//! a documented limitation of the format.
//!
//! All writes funnel through a single dedicated task that owns the file
//! handle and reads from a channel, so concurrent appenders can never
//! interleave partial lines. The task also performs rewrites: the full
//! replacement transcript is written to `<path>.tmp` and renamed over
//! the live log, then the handle is reopened.
//!
//! Replay is strictly more permissive than command dispatch: blank
//! lines are skipped, malformed lines are logged and dropped, and
//! unrecognized commands are ignored.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::snapshot::{self, SnapEntry, SnapValue};

/// When the append-log writer forces data out of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Flush after every appended command. Safest, slowest.
    Always,
    /// Flush once per second, driven by the database manager's tick.
    #[default]
    EverySec,
    /// Never flush explicitly; the OS decides.
    No,
}

/// Joins a command and its arguments into one log line.
pub fn encode_command(command: &str, args: &[&str]) -> String {
    let mut line = String::with_capacity(command.len() + args.iter().map(|a| a.len() + 1).sum::<usize>());
    line.push_str(command);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

enum AofOp {
    Append { shard: usize, line: String },
    Flush,
    /// Replace the whole log with a rewrite transcript.
    Rewrite { lines: Vec<String> },
    Close { done: oneshot::Sender<()> },
}

/// Handle to the append-log writer task. Cheap to clone; all clones
/// feed the same file through the same channel.
#[derive(Clone)]
pub struct AofLog {
    tx: mpsc::UnboundedSender<AofOp>,
    path: PathBuf,
}

impl AofLog {
    /// Opens (or creates) the log at `path` and spawns the writer task.
    pub fn open(path: impl Into<PathBuf>, policy: FsyncPolicy) -> io::Result<Self> {
        let path = path.into();
        let writer = open_for_append(&path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(rx, writer, path.clone(), policy));
        Ok(Self { tx, path })
    }

    /// Path of the live log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queues one command line for the given shard. A `SELECT` line is
    /// inserted by the writer when the shard differs from the previous
    /// append. Failures are the writer's to log; the calling command
    /// never observes them.
    pub fn append(&self, shard: usize, line: String) {
        let _ = self.tx.send(AofOp::Append { shard, line });
    }

    /// Requests a flush of buffered lines (the `everysec` tick).
    pub fn flush(&self) {
        let _ = self.tx.send(AofOp::Flush);
    }

    /// Replaces the log with a rewrite transcript.
    pub fn rewrite(&self, lines: Vec<String>) {
        let _ = self.tx.send(AofOp::Rewrite { lines });
    }

    /// Flushes and closes the log, waiting for the writer to finish.
    pub async fn close(self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(AofOp::Close { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }
    }
}

fn open_for_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// The writer task. Owns the buffered file handle and the "current
/// shard" cursor that decides when `SELECT` lines are emitted.
async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<AofOp>,
    mut writer: BufWriter<File>,
    path: PathBuf,
    policy: FsyncPolicy,
) {
    // shard of the most recently appended line; None forces a SELECT
    let mut current_shard: Option<usize> = None;

    while let Some(op) = rx.recv().await {
        match op {
            AofOp::Append { shard, line } => {
                if current_shard != Some(shard) {
                    if let Err(e) = writeln!(writer, "SELECT {shard}") {
                        warn!("aof select write failed: {e}");
                        continue;
                    }
                    current_shard = Some(shard);
                }
                if let Err(e) = writeln!(writer, "{line}") {
                    warn!("aof append failed: {e}");
                    continue;
                }
                if policy == FsyncPolicy::Always {
                    if let Err(e) = writer.flush() {
                        warn!("aof flush failed: {e}");
                    }
                }
            }
            AofOp::Flush => {
                if let Err(e) = writer.flush() {
                    warn!("aof periodic flush failed: {e}");
                }
            }
            AofOp::Rewrite { lines } => {
                match rewrite_file(&path, &lines) {
                    Ok(()) => {
                        info!(lines = lines.len(), "aof rewrite complete");
                        match open_for_append(&path) {
                            Ok(w) => {
                                writer = w;
                                current_shard = None;
                            }
                            Err(e) => warn!("failed to reopen aof after rewrite: {e}"),
                        }
                    }
                    Err(e) => warn!("aof rewrite failed: {e}"),
                }
            }
            AofOp::Close { done } => {
                if let Err(e) = writer.flush() {
                    warn!("aof flush on close failed: {e}");
                }
                let _ = done.send(());
                return;
            }
        }
    }

    // all senders dropped without an explicit close
    let _ = writer.flush();
}

fn rewrite_file(path: &Path, lines: &[String]) -> io::Result<()> {
    let tmp = snapshot::tmp_path_for(path);
    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let mut w = BufWriter::new(file);
        for line in lines {
            writeln!(w, "{line}")?;
        }
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    snapshot::replace_file(&tmp, path).map_err(io::Error::other)
}

// ---------------------------------------------------------------------------
// rewrite transcript
// ---------------------------------------------------------------------------

/// Builds the minimal replay transcript for the given shard vector.
///
/// Per shard: a `SELECT i`, then one reconstructive command sequence per
/// key, then `PEXPIRE` for keys that carry an expiration. `remaining`
/// converts an absolute expire-at instant to a remaining-ms figure; keys
/// whose remainder is not positive are already dead and get no line.
/// Lists are walked tail-first so the `LPUSH`-per-element replay rebuilds
/// them head-first in the original order.
pub fn rewrite_transcript(
    shards: &[Vec<SnapEntry>],
    remaining: impl Fn(i64) -> i64,
) -> Vec<String> {
    let mut lines = Vec::new();
    for (index, entries) in shards.iter().enumerate() {
        lines.push(format!("SELECT {index}"));
        for entry in entries {
            match &entry.value {
                SnapValue::Str(data) => {
                    lines.push(format!("SET {} {}", entry.key, String::from_utf8_lossy(data)));
                }
                SnapValue::List(items) => {
                    for item in items.iter().rev() {
                        lines.push(format!(
                            "LPUSH {} {}",
                            entry.key,
                            String::from_utf8_lossy(item)
                        ));
                    }
                }
                SnapValue::Set(members) => {
                    for member in members {
                        lines.push(format!("SADD {} {member}", entry.key));
                    }
                }
                SnapValue::Hash(fields) => {
                    for (field, value) in fields {
                        lines.push(format!(
                            "HSET {} {field} {}",
                            entry.key,
                            String::from_utf8_lossy(value)
                        ));
                    }
                }
                SnapValue::ZSet(members) => {
                    for (score, member) in members {
                        lines.push(format!("ZADD {} {score} {member}", entry.key));
                    }
                }
            }
            if entry.expire_at >= 0 {
                let ms = remaining(entry.expire_at);
                if ms > 0 {
                    lines.push(format!("PEXPIRE {} {ms}", entry.key));
                }
            }
        }
    }
    lines
}

// ---------------------------------------------------------------------------
// replay
// ---------------------------------------------------------------------------

/// One replayable command parsed out of the log.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayCommand {
    Select(usize),
    Set { key: String, value: String },
    LPush { key: String, values: Vec<String> },
    RPush { key: String, values: Vec<String> },
    SAdd { key: String, members: Vec<String> },
    HSet { key: String, field: String, value: String },
    ZAdd { key: String, members: Vec<(f64, String)> },
    PExpire { key: String, ms: i64 },
    Del { key: String },
}

/// Reads the whole log into replayable commands. Missing files yield an
/// empty replay; the log only exists after the first mutation.
pub fn read_log(path: &Path) -> io::Result<Vec<ReplayCommand>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut commands = Vec::new();
    let mut skipped = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_replay_line(trimmed) {
            Some(cmd) => commands.push(cmd),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        info!(skipped, "ignored unrecognized or malformed aof lines");
    }
    Ok(commands)
}

/// Parses one log line. Returns `None` for commands outside the replay
/// vocabulary and for lines whose arguments do not parse; both are
/// skipped, never fatal.
pub fn parse_replay_line(line: &str) -> Option<ReplayCommand> {
    let mut parts = line.split_whitespace();
    let command = parts.next()?.to_ascii_uppercase();
    let args: Vec<&str> = parts.collect();

    match command.as_str() {
        "SELECT" => {
            let index = args.first()?.parse().ok()?;
            Some(ReplayCommand::Select(index))
        }
        "SET" => {
            if args.len() < 2 {
                warn!("aof SET line missing arguments: {line}");
                return None;
            }
            Some(ReplayCommand::Set {
                key: args[0].to_owned(),
                value: args[1].to_owned(),
            })
        }
        "LPUSH" | "RPUSH" => {
            if args.len() < 2 {
                warn!("aof {command} line missing arguments: {line}");
                return None;
            }
            let key = args[0].to_owned();
            let values = args[1..].iter().map(|s| (*s).to_owned()).collect();
            if command == "LPUSH" {
                Some(ReplayCommand::LPush { key, values })
            } else {
                Some(ReplayCommand::RPush { key, values })
            }
        }
        "SADD" => {
            if args.len() < 2 {
                warn!("aof SADD line missing arguments: {line}");
                return None;
            }
            Some(ReplayCommand::SAdd {
                key: args[0].to_owned(),
                members: args[1..].iter().map(|s| (*s).to_owned()).collect(),
            })
        }
        "HSET" => {
            if args.len() < 3 {
                warn!("aof HSET line missing arguments: {line}");
                return None;
            }
            Some(ReplayCommand::HSet {
                key: args[0].to_owned(),
                field: args[1].to_owned(),
                value: args[2].to_owned(),
            })
        }
        "ZADD" => {
            if args.len() < 3 || args.len() % 2 == 0 {
                warn!("aof ZADD line malformed: {line}");
                return None;
            }
            let key = args[0].to_owned();
            let mut members = Vec::with_capacity((args.len() - 1) / 2);
            for pair in args[1..].chunks(2) {
                let score: f64 = match pair[0].parse() {
                    Ok(s) => s,
                    Err(_) => {
                        warn!("aof ZADD score does not parse: {line}");
                        return None;
                    }
                };
                members.push((score, pair[1].to_owned()));
            }
            Some(ReplayCommand::ZAdd { key, members })
        }
        "PEXPIRE" => {
            if args.len() < 2 {
                warn!("aof PEXPIRE line missing arguments: {line}");
                return None;
            }
            let ms = match args[1].parse() {
                Ok(ms) => ms,
                Err(_) => {
                    warn!("aof PEXPIRE ttl does not parse: {line}");
                    return None;
                }
            };
            Some(ReplayCommand::PExpire {
                key: args[0].to_owned(),
                ms,
            })
        }
        "DEL" => {
            let key = args.first()?;
            Some(ReplayCommand::Del {
                key: (*key).to_owned(),
            })
        }
        _ => None,
    }
}
