//! Per-connection handler.
//!
//! One UTF-8 command per LF-terminated line in, one RESP frame out.
//! Each connection carries its own selected-shard index. Command
//! errors become `-…` replies and the loop continues; only QUIT or a
//! socket error ends the connection.

use std::sync::Arc;

use bytes::BytesMut;
use cinder_protocol::{tokenize, Command, Frame};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::dispatch::{self, ConnState, ServerContext};

/// First bytes every client sees.
const GREETING: &[u8] = b"+OK Welcome to Cinder Server\n";

/// Ceiling on a single command line. A client that exceeds it gets an
/// error and the connection is closed.
const MAX_LINE: usize = 4 * 1024 * 1024;

/// Drives one client connection to completion.
pub async fn handle(stream: TcpStream, ctx: Arc<ServerContext>) -> std::io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    writer.write_all(GREETING).await?;

    let mut conn = ConnState::default();
    let mut line = String::new();
    let mut out = BytesMut::with_capacity(4096);

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(()); // clean disconnect
        }
        if line.len() > MAX_LINE {
            out.clear();
            Frame::Error("ERR command line too long".into()).serialize(&mut out);
            writer.write_all(&out).await?;
            return Ok(());
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let (reply, quit) = process(&ctx, &mut conn, trimmed);
        out.clear();
        reply.serialize(&mut out);
        writer.write_all(&out).await?;
        if quit {
            return Ok(());
        }
    }
}

/// Tokenizes, parses, and executes one line. Returns the reply and
/// whether the client asked to disconnect.
fn process(ctx: &ServerContext, conn: &mut ConnState, line: &str) -> (Frame, bool) {
    let tokens = match tokenize(line) {
        Ok(tokens) => tokens,
        Err(e) => return (Frame::Error(e.to_string()), false),
    };
    let cmd = match Command::parse(tokens) {
        Ok(cmd) => cmd,
        Err(e) => return (Frame::Error(e.to_string()), false),
    };
    if cmd == Command::Quit {
        return (Frame::Simple("OK bye".into()), true);
    }
    (dispatch::execute(ctx, conn, cmd), false)
}
