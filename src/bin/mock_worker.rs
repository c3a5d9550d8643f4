//! Stand-in inference node. Listens for the gateway, reports itself
//! available and answers every task with a canned completion.
//!
//! Usage: `mock_worker <listen-addr> <node-id>`

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use gateway_protocol::{drain_messages, encode, NodeStatus, TaskAssignment, TokenResponse, WireMessage};
use tracing::{debug, info, warn};

use inference_gateway::logging;

const COMPLETION: &str = "Artificial intelligence is a branch of computer science that builds machines able to perform tasks that normally require human intelligence.";
const TOKEN_DELAY: Duration = Duration::from_millis(50);
const HEARTBEAT_EVERY: Duration = Duration::from_secs(30);

fn main() -> anyhow::Result<()> {
    logging::init("info");

    let mut args = std::env::args().skip(1);
    let (Some(listen_addr), Some(node_id)) = (args.next(), args.next()) else {
        bail!("usage: mock_worker <listen-addr> <node-id>");
    };

    let listener = TcpListener::bind(&listen_addr)
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(%listen_addr, %node_id, "mock worker listening");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = serve(stream, &node_id) {
                    warn!(error = %e, "gateway session ended with error");
                }
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
    Ok(())
}

/// Task replies and heartbeats share the socket; whole lines only.
fn send(writer: &Mutex<TcpStream>, message: &WireMessage) -> anyhow::Result<()> {
    let bytes = encode(message).context("failed to encode message")?;
    writer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .write_all(&bytes)
        .context("failed to write to gateway")?;
    Ok(())
}

/// One gateway connection, served until it closes.
fn serve(mut stream: TcpStream, node_id: &str) -> anyhow::Result<()> {
    let peer = stream.peer_addr().context("peer address")?;
    info!(%peer, "gateway connected");

    let writer = Arc::new(Mutex::new(stream.try_clone().context("clone stream")?));
    send(
        &writer,
        &WireMessage::Status(NodeStatus {
            node_id: node_id.to_string(),
            available: true,
            load: 0.0,
        }),
    )?;

    let alive = Arc::new(AtomicBool::new(true));
    let heartbeat = spawn_heartbeat(Arc::clone(&writer), Arc::clone(&alive))?;

    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let outcome = loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(anyhow::Error::new(e).context("read from gateway")),
        };
        buffer.extend_from_slice(&chunk[..n]);

        for parsed in drain_messages(&mut buffer) {
            match parsed {
                Ok(WireMessage::Task(task)) => {
                    if let Err(e) = run_task(&writer, &task) {
                        alive.store(false, Ordering::SeqCst);
                        let _ = heartbeat.join();
                        return Err(e);
                    }
                }
                Ok(WireMessage::Heartbeat) => debug!("heartbeat from gateway"),
                Ok(other) => debug!(kind = other.kind(), "ignoring message"),
                Err(e) => warn!(error = %e, "undecodable message from gateway"),
            }
        }
    };

    alive.store(false, Ordering::SeqCst);
    let _ = heartbeat.join();
    info!(%peer, "gateway disconnected");
    outcome
}

fn spawn_heartbeat(
    writer: Arc<Mutex<TcpStream>>,
    alive: Arc<AtomicBool>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("mock_worker_heartbeat".to_string())
        .spawn(move || {
            let tick = Duration::from_millis(100);
            let mut waited = Duration::ZERO;
            while alive.load(Ordering::SeqCst) {
                thread::sleep(tick);
                waited += tick;
                if waited < HEARTBEAT_EVERY {
                    continue;
                }
                waited = Duration::ZERO;
                if send(&writer, &WireMessage::Heartbeat).is_err() {
                    return;
                }
            }
        })
        .context("failed to spawn heartbeat thread")?;
    Ok(handle)
}

/// Word-sized tokens with their trailing space kept, so concatenation gives
/// back the full text.
fn tokens(text: &str) -> Vec<&str> {
    text.split_inclusive(' ').collect()
}

fn run_task(writer: &Mutex<TcpStream>, task: &TaskAssignment) -> anyhow::Result<()> {
    info!(
        request_id = %task.id,
        model = %task.model,
        stream = task.stream,
        max_tokens = task.max_tokens,
        "task received"
    );

    let limit = usize::try_from(task.max_tokens).unwrap_or(usize::MAX).max(1);
    let output: Vec<&str> = tokens(COMPLETION).into_iter().take(limit).collect();

    if !task.stream {
        return send(
            writer,
            &WireMessage::Response(TokenResponse {
                id: task.id.clone(),
                token: None,
                result: Some(output.concat()),
                finished: true,
                client_socket: Some(task.client_socket),
            }),
        );
    }

    let last = output.len().saturating_sub(1);
    for (i, token) in output.iter().enumerate() {
        send(
            writer,
            &WireMessage::Response(TokenResponse {
                id: task.id.clone(),
                token: Some((*token).to_string()),
                result: None,
                finished: i == last,
                client_socket: Some(task.client_socket),
            }),
        )?;
        thread::sleep(TOKEN_DELAY);
    }
    debug!(request_id = %task.id, tokens = output.len(), "task streamed");
    Ok(())
}
