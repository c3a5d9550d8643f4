use mio::Interest;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use gateway_protocol::{drain_messages, encode, WireMessage};
use tracing::{debug, warn};

use crate::dispatch::{Dispatcher, Drain};
use crate::task::ConnectionId;

const READ_CHUNK: usize = 4096;

/// A request the client is still waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMapping {
    pub request_id: String,
    pub stream: bool,
    /// Fragments collected for a non-streamed request.
    pub accumulated: String,
}

impl RequestMapping {
    pub fn new(request_id: String, stream: bool) -> Self {
        Self {
            request_id,
            stream,
            accumulated: String::new(),
        }
    }
}

pub struct Client {
    pub stream: mio::net::TcpStream,
    pub addr: SocketAddr,
    pub buffer: Vec<u8>,
    pub output_buffer: VecDeque<u8>,
    pub requests: Vec<RequestMapping>,
}

impl Client {
    pub fn new(stream: mio::net::TcpStream, addr: SocketAddr) -> Self {
        Self {
            stream,
            addr,
            buffer: Vec::with_capacity(READ_CHUNK),
            output_buffer: VecDeque::new(),
            requests: Vec::new(),
        }
    }
}

fn queue_message(output: &mut VecDeque<u8>, message: &WireMessage) {
    match encode(message) {
        Ok(bytes) => output.extend(bytes),
        Err(e) => warn!(kind = message.kind(), error = %e, "failed to encode client message"),
    }
}

/// Reads whatever is available, then admits every complete request line.
/// Returns true when the connection should be closed.
pub fn handle_read(client: &mut Client, dispatcher: &Dispatcher, client_id: ConnectionId) -> bool {
    let mut chunk = [0; READ_CHUNK];
    loop {
        match client.stream.read(&mut chunk) {
            Ok(0) => return true,
            Ok(n) => client.buffer.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e)
                if e.kind() == io::ErrorKind::ConnectionReset
                    || e.kind() == io::ErrorKind::BrokenPipe =>
            {
                return true;
            }
            Err(e) => {
                warn!(client = client_id, error = %e, "client read error");
                return true;
            }
        }
    }

    for parsed in drain_messages(&mut client.buffer) {
        match parsed {
            Ok(message) => handle_message(client, message, dispatcher, client_id),
            Err(e) => {
                warn!(client = client_id, error = %e, "dropping undecodable client message");
                queue_message(
                    &mut client.output_buffer,
                    &WireMessage::error("", &e.to_string()),
                );
            }
        }
    }
    false
}

fn handle_message(
    client: &mut Client,
    message: WireMessage,
    dispatcher: &Dispatcher,
    client_id: ConnectionId,
) {
    match message {
        WireMessage::Request(request) => match dispatcher.admit(&request, client_id) {
            Ok(record) => {
                client
                    .requests
                    .push(RequestMapping::new(record.request_id, record.payload.stream));
            }
            Err(e) => {
                debug!(client = client_id, error = %e, "request rejected");
                let id = request.requested_id().unwrap_or_default();
                queue_message(&mut client.output_buffer, &WireMessage::error(id, &e.to_string()));
            }
        },
        WireMessage::Heartbeat => queue_message(&mut client.output_buffer, &WireMessage::Heartbeat),
        other => {
            let reason = format!("unexpected '{}' message from client", other.kind());
            queue_message(&mut client.output_buffer, &WireMessage::error("", &reason));
        }
    }
}

/// Moves up to `max_fragments` fragments per waiting request into the output
/// buffer. Finished streams are closed out and their mapping dropped.
pub fn deliver_pending(client: &mut Client, dispatcher: &Dispatcher, max_fragments: usize) -> usize {
    let Client {
        requests,
        output_buffer,
        ..
    } = client;
    let mut moved = 0;

    requests.retain_mut(|mapping| {
        for _ in 0..max_fragments {
            match dispatcher.next_fragment(&mapping.request_id) {
                Drain::Fragment(fragment) => {
                    moved += 1;
                    if mapping.stream {
                        queue_message(output_buffer, &WireMessage::token(&mapping.request_id, &fragment));
                    } else {
                        mapping.accumulated.push_str(&fragment);
                    }
                }
                Drain::Finished => {
                    let end = if mapping.stream {
                        WireMessage::stream_end(&mapping.request_id)
                    } else {
                        WireMessage::full_result(&mapping.request_id, &mapping.accumulated)
                    };
                    queue_message(output_buffer, &end);
                    dispatcher.finish_delivery(&mapping.request_id);
                    return false;
                }
                Drain::Failed(reason) => {
                    queue_message(output_buffer, &WireMessage::error(&mapping.request_id, &reason));
                    return false;
                }
                Drain::Nothing => break,
            }
        }
        true
    });

    moved
}

/// Cancels everything the client was waiting on. Called once the socket is
/// gone; nothing is written.
pub fn release(client: &mut Client, dispatcher: &Dispatcher, client_id: ConnectionId) {
    dispatcher.cancel_connection(client_id);
    for mapping in client.requests.drain(..) {
        dispatcher.clear_token_list(&mapping.request_id);
    }
}

pub fn handle_write(client: &mut Client) -> bool {
    while !client.output_buffer.is_empty() {
        let (head, _) = client.output_buffer.as_slices();
        match client.stream.write(head) {
            Ok(0) => return true,
            Ok(n) => {
                client.output_buffer.drain(..n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return true,
        }
    }
    false
}

pub fn needs_writable_interest(client: &Client) -> bool {
    !client.output_buffer.is_empty()
}

pub fn writable_interest() -> Interest {
    Interest::READABLE | Interest::WRITABLE
}
