use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, info, warn};

use crate::context::GatewayContext;
use crate::errors::GatewayError;
use crate::transport::{
    deliver_pending, handle_read, handle_write, needs_writable_interest, release, writable_interest,
    Client,
};

const SERVER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CLIENT: usize = 2;

/// Single-threaded event loop owning the listener and every client socket.
/// Worker output reaches clients only through the dispatcher's buffers.
pub struct Multiplexer {
    ctx: Arc<GatewayContext>,
    poll: Poll,
    listener: TcpListener,
    clients: HashMap<Token, Client>,
    next_token: usize,
}

impl Multiplexer {
    pub fn bind(ctx: Arc<GatewayContext>) -> Result<Self, GatewayError> {
        let address = ctx.config.listen_address();
        let addr = address
            .to_socket_addrs()
            .map_err(|_| GatewayError::ListenAddress(address.clone()))?
            .next()
            .ok_or(GatewayError::ListenAddress(address))?;
        Ok(Self::bind_addr(ctx, addr)?)
    }

    pub fn bind_addr(ctx: Arc<GatewayContext>, addr: SocketAddr) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, SERVER, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        ctx.dispatcher.set_waker(waker);

        Ok(Self {
            ctx,
            poll,
            listener,
            clients: HashMap::new(),
            next_token: FIRST_CLIENT,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Runs until the shutdown flag is set, then drops every client.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(128);
        let timeout = Duration::from_millis(self.ctx.config.server.poll_timeout_ms);
        info!(addr = %self.local_addr()?, "gateway listening");

        while !self.ctx.is_shutting_down() {
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let mut closed = Vec::new();
            for event in events.iter() {
                match event.token() {
                    SERVER => self.accept_clients(),
                    WAKER => {}
                    token => {
                        let Some(client) = self.clients.get_mut(&token) else {
                            continue;
                        };
                        if event.is_readable() && handle_read(client, &self.ctx.dispatcher, token.0) {
                            closed.push(token);
                            continue;
                        }
                        if event.is_writable() {
                            if handle_write(client) {
                                closed.push(token);
                            } else if !needs_writable_interest(client)
                                && !reregister(self.poll.registry(), client, token, Interest::READABLE)
                            {
                                closed.push(token);
                            }
                        }
                    }
                }
            }
            for token in closed {
                self.close_client(token);
            }

            self.sweep_deliveries();
        }

        self.close_all();
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.clients.len() >= self.ctx.config.server.max_clients {
                        warn!(%addr, max = self.ctx.config.server.max_clients, "client limit reached, dropping connection");
                        drop(stream);
                        continue;
                    }
                    self.register_client(stream, addr);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "accept error");
                    return;
                }
            }
        }
    }

    /// A stream the registry refuses is dropped; the loop keeps serving.
    fn register_client(&mut self, mut stream: TcpStream, addr: SocketAddr) -> Option<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            warn!(%addr, error = %e, "failed to register client, dropping connection");
            return None;
        }
        info!(client = token.0, %addr, "client connected");
        self.clients.insert(token, Client::new(stream, addr));
        Some(token)
    }

    /// Drains every waiting request into its client's output buffer and
    /// flushes what the socket takes.
    fn sweep_deliveries(&mut self) {
        let max_fragments = self.ctx.config.dispatch.max_fragments_per_sweep;
        let mut closed = Vec::new();

        for (token, client) in self.clients.iter_mut() {
            if !client.requests.is_empty() {
                deliver_pending(client, &self.ctx.dispatcher, max_fragments);
            }
            if !needs_writable_interest(client) {
                continue;
            }
            if handle_write(client) {
                closed.push(*token);
                continue;
            }
            let interest = if needs_writable_interest(client) {
                writable_interest()
            } else {
                Interest::READABLE
            };
            if !reregister(self.poll.registry(), client, *token, interest) {
                closed.push(*token);
            }
        }

        for token in closed {
            self.close_client(token);
        }
    }

    fn close_client(&mut self, token: Token) {
        if let Some(mut client) = self.clients.remove(&token) {
            let _ = self.poll.registry().deregister(&mut client.stream);
            let waiting = client.requests.len();
            release(&mut client, &self.ctx.dispatcher, token.0);
            info!(client = token.0, addr = %client.addr, waiting, "client disconnected");
        }
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.clients.keys().copied().collect();
        for token in tokens {
            self.close_client(token);
        }
        debug!("multiplexer stopped");
    }
}

/// False when the registry refused; the caller closes that client only.
fn reregister(registry: &Registry, client: &mut Client, token: Token, interest: Interest) -> bool {
    match registry.reregister(&mut client.stream, token, interest) {
        Ok(()) => true,
        Err(e) => {
            warn!(client = token.0, error = %e, "reregister failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use gateway_protocol::{decode, encode, WireMessage};

    use mio::{Interest, Token};

    use super::{reregister, Multiplexer};
    use crate::config::GatewayConfig;
    use crate::context::GatewayContext;
    use crate::runtime::spawn_loops;
    use crate::transport::Client;

    fn read_line(stream: &mut TcpStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while byte[0] != b'\n' {
            stream.read_exact(&mut byte).expect("read byte");
            line.push(byte[0]);
        }
        String::from_utf8(line).expect("utf8")
    }

    /// Worker that answers each task with `tokens`, or stays silent when empty.
    fn fake_worker(tokens: &'static [&'static str]) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind worker");
        let addr = listener.local_addr().expect("addr").to_string();
        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept gateway");
            conn.set_read_timeout(Some(Duration::from_secs(5)))
                .expect("read timeout");
            let mut line = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                match conn.read(&mut byte) {
                    Ok(1) if byte[0] == b'\n' => {}
                    Ok(1) => {
                        line.push(byte[0]);
                        continue;
                    }
                    _ => return,
                }
                let text = String::from_utf8(std::mem::take(&mut line)).expect("utf8");
                let Ok(WireMessage::Task(task)) = decode(&text) else {
                    continue;
                };
                for (i, token) in tokens.iter().enumerate() {
                    let reply = format!(
                        "{{\"type\":\"response\",\"id\":\"{}\",\"token\":\"{}\",\"finished\":{}}}\n",
                        task.id,
                        token,
                        i + 1 == tokens.len()
                    );
                    if conn.write_all(reply.as_bytes()).is_err() {
                        return;
                    }
                }
            }
        });
        (addr, handle)
    }

    fn start_gateway(worker_addr: String) -> (Arc<GatewayContext>, std::net::SocketAddr, JoinHandle<()>) {
        let mut config = GatewayConfig::default();
        config.workers.addresses = vec![worker_addr];
        config.dispatch.idle_backoff_ms = 1;

        let ctx = Arc::new(GatewayContext::new(config));
        assert_eq!(ctx.connect_workers(), 1);
        let loops = spawn_loops(&ctx).expect("spawn loops");

        let mut mux = Multiplexer::bind_addr(Arc::clone(&ctx), "127.0.0.1:0".parse().expect("addr"))
            .expect("bind multiplexer");
        let addr = mux.local_addr().expect("local addr");
        let handle = thread::spawn(move || {
            mux.run().expect("multiplexer run");
            loops.join();
        });
        (ctx, addr, handle)
    }

    /// Accepted side as a non-blocking mio stream, plus the connecting peer.
    fn accepted_stream() -> (mio::net::TcpStream, std::net::SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let peer = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (accepted, addr) = listener.accept().expect("accept");
        accepted.set_nonblocking(true).expect("nonblocking");
        (mio::net::TcpStream::from_std(accepted), addr, peer)
    }

    fn idle_multiplexer() -> Multiplexer {
        let ctx = Arc::new(GatewayContext::new(GatewayConfig::default()));
        Multiplexer::bind_addr(ctx, "127.0.0.1:0".parse().expect("addr")).expect("bind multiplexer")
    }

    #[test]
    fn refused_registration_drops_only_that_connection() {
        let mut mux = idle_multiplexer();

        let (mut taken, addr, _peer) = accepted_stream();
        mux.poll
            .registry()
            .register(&mut taken, Token(999), Interest::READABLE)
            .expect("first registration");
        assert!(mux.register_client(taken, addr).is_none());
        assert_eq!(mux.client_count(), 0);

        let (fresh, addr, _peer2) = accepted_stream();
        assert!(mux.register_client(fresh, addr).is_some());
        assert_eq!(mux.client_count(), 1);
    }

    #[test]
    fn reregister_failure_is_reported_not_raised() {
        let mux = idle_multiplexer();
        let (stream, addr, _peer) = accepted_stream();
        let mut client = Client::new(stream, addr);

        assert!(!reregister(mux.poll.registry(), &mut client, Token(7), Interest::READABLE));
    }

    fn send_request(client: &mut TcpStream, id: &str) {
        let request = format!("{{\"type\":\"request\",\"id\":\"{id}\",\"model\":\"llama2-7b\",\"prompt\":\"hi\"}}\n");
        client.write_all(request.as_bytes()).expect("write request");
    }

    #[test]
    fn tokens_stream_back_in_order_and_record_is_released() {
        let (worker_addr, worker) = fake_worker(&["he", "llo", "!"]);
        let (ctx, addr, gateway) = start_gateway(worker_addr);

        let mut client = TcpStream::connect(addr).expect("connect client");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        send_request(&mut client, "r1");

        let replies: Vec<WireMessage> = (0..4)
            .map(|_| decode(&read_line(&mut client)).expect("decode reply"))
            .collect();
        assert_eq!(
            replies,
            vec![
                WireMessage::token("r1", "he"),
                WireMessage::token("r1", "llo"),
                WireMessage::token("r1", "!"),
                WireMessage::stream_end("r1"),
            ]
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while ctx.dispatcher.cache().contains("r1") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!ctx.dispatcher.cache().contains("r1"));

        ctx.request_shutdown();
        gateway.join().expect("gateway thread");
        ctx.pool.close_all();
        worker.join().expect("worker thread");
    }

    #[test]
    fn closing_the_client_cancels_its_task() {
        let (worker_addr, worker) = fake_worker(&[]);
        let (ctx, addr, gateway) = start_gateway(worker_addr);

        let mut client = TcpStream::connect(addr).expect("connect client");
        send_request(&mut client, "r1");

        let deadline = Instant::now() + Duration::from_secs(2);
        while ctx.dispatcher.queue().processing_len() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(ctx.dispatcher.cache().contains("r1"));

        drop(client);
        let deadline = Instant::now() + Duration::from_secs(2);
        while ctx.dispatcher.cache().contains("r1") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!ctx.dispatcher.cache().contains("r1"));
        assert_eq!(ctx.dispatcher.queue().processing_len(), 0);

        ctx.request_shutdown();
        gateway.join().expect("gateway thread");
        ctx.pool.close_all();
        worker.join().expect("worker thread");
    }

    #[test]
    fn heartbeat_round_trip() {
        let (worker_addr, worker) = fake_worker(&[]);
        let (ctx, addr, gateway) = start_gateway(worker_addr);

        let mut client = TcpStream::connect(addr).expect("connect client");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        client
            .write_all(&encode(&WireMessage::Heartbeat).expect("encode"))
            .expect("write heartbeat");
        assert_eq!(decode(&read_line(&mut client)).expect("decode"), WireMessage::Heartbeat);

        ctx.request_shutdown();
        gateway.join().expect("gateway thread");
        ctx.pool.close_all();
        worker.join().expect("worker thread");
    }
}
