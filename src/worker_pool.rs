use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use gateway_control_models::WorkerSnapshot;
use gateway_protocol::drain_lines;
use tracing::{debug, info, warn};

use crate::errors::WorkerError;
use crate::task::now_millis;

const READ_CHUNK: usize = 4096;
/// Reads per worker per poll, so one chatty worker cannot starve the rest.
const MAX_READS_PER_POLL: usize = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct WorkerIo {
    stream: TcpStream,
    read_buffer: Vec<u8>,
}

#[derive(Debug, Clone)]
struct WorkerState {
    connected: bool,
    available: bool,
    node_id: Option<String>,
    load: f32,
    last_seen_ms: i64,
}

struct WorkerSlot {
    index: usize,
    address: String,
    io: Mutex<WorkerIo>,
    state: Mutex<WorkerState>,
}

impl WorkerSlot {
    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// Dead, and its loss already drained.
    fn is_reusable(&self, lost: &[usize]) -> bool {
        !self.is_connected() && !lost.contains(&self.index)
    }

    fn is_selectable(&self) -> bool {
        let state = lock(&self.state);
        state.connected && state.available
    }
}

struct WorkerTable {
    slots: Vec<Arc<WorkerSlot>>,
    next: usize,
}

/// Outbound connections to inference workers.
///
/// Lock order: `table`, `lost`, then slot state. The table lock only guards
/// slot lookup; reads and writes go through the slot's own `io` lock so one
/// worker's socket never blocks another's.
pub struct WorkerPool {
    max_workers: usize,
    connect_timeout: Duration,
    table: Mutex<WorkerTable>,
    lost: Mutex<Vec<usize>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, connect_timeout: Duration) -> Self {
        Self {
            max_workers,
            connect_timeout,
            table: Mutex::new(WorkerTable {
                slots: Vec::with_capacity(max_workers),
                next: 0,
            }),
            lost: Mutex::new(Vec::new()),
        }
    }

    /// Connects to `address` and returns the worker index. A dead slot is
    /// reused before the table grows, but only once its loss has been taken
    /// through `drain_disconnected`.
    pub fn add_worker(&self, address: &str) -> Result<usize, WorkerError> {
        if !self.has_free_slot() {
            return Err(WorkerError::PoolFull {
                max: self.max_workers,
            });
        }

        let stream = self.connect(address)?;

        let mut table = lock(&self.table);
        let reuse = {
            let lost = lock(&self.lost);
            table.slots.iter().position(|slot| slot.is_reusable(&lost))
        };
        let index = match reuse {
            Some(index) => index,
            None if table.slots.len() < self.max_workers => table.slots.len(),
            None => {
                let _ = stream.shutdown(Shutdown::Both);
                return Err(WorkerError::PoolFull {
                    max: self.max_workers,
                });
            }
        };

        let slot = Arc::new(WorkerSlot {
            index,
            address: address.to_string(),
            io: Mutex::new(WorkerIo {
                stream,
                read_buffer: Vec::with_capacity(READ_CHUNK),
            }),
            state: Mutex::new(WorkerState {
                connected: true,
                available: true,
                node_id: None,
                load: 0.0,
                last_seen_ms: now_millis(),
            }),
        });

        if index == table.slots.len() {
            table.slots.push(slot);
        } else {
            table.slots[index] = slot;
        }
        drop(table);

        info!(worker = index, %address, "worker connected");
        Ok(index)
    }

    fn has_free_slot(&self) -> bool {
        let table = lock(&self.table);
        let lost = lock(&self.lost);
        table.slots.len() < self.max_workers || table.slots.iter().any(|s| s.is_reusable(&lost))
    }

    fn connect(&self, address: &str) -> Result<TcpStream, WorkerError> {
        let connect_failed = |source: io::Error| WorkerError::ConnectFailed {
            address: address.to_string(),
            source,
        };

        let mut last_err = io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing");
        let addrs = address.to_socket_addrs().map_err(connect_failed)?;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nonblocking(true).map_err(connect_failed)?;
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }
        Err(connect_failed(last_err))
    }

    fn slot(&self, index: usize) -> Option<Arc<WorkerSlot>> {
        lock(&self.table).slots.get(index).cloned()
    }

    fn slots(&self) -> Vec<Arc<WorkerSlot>> {
        lock(&self.table).slots.clone()
    }

    /// One write attempt. Anything short of the full payload is a failure; a
    /// partially written frame leaves the stream unusable, so the worker is
    /// dropped in that case.
    pub fn send(&self, index: usize, payload: &[u8]) -> Result<(), WorkerError> {
        let slot = self.slot(index).ok_or(WorkerError::UnknownWorker { index })?;
        if !slot.is_connected() {
            return Err(WorkerError::NotConnected { index });
        }

        let mut io = lock(&slot.io);
        match io.stream.write(payload) {
            Ok(n) if n == payload.len() => Ok(()),
            Ok(n) => {
                drop(io);
                self.mark_lost(&slot, "partial write");
                Err(WorkerError::SendFailed {
                    index,
                    reason: format!("partial write: {} of {} bytes", n, payload.len()),
                })
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Err(WorkerError::SendFailed {
                index,
                reason: "socket send buffer full".to_string(),
            }),
            Err(e) => {
                drop(io);
                self.mark_lost(&slot, &e.to_string());
                Err(WorkerError::SendFailed {
                    index,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Non-blocking sweep over every live worker. Returns each complete line
    /// tagged with the worker index, in arrival order per worker.
    pub fn poll_all(&self) -> Vec<(usize, String)> {
        let mut messages = Vec::new();

        for slot in self.slots() {
            if !slot.is_connected() {
                continue;
            }

            let mut io = lock(&slot.io);
            let mut chunk = [0u8; READ_CHUNK];
            let mut closed: Option<String> = None;

            for _ in 0..MAX_READS_PER_POLL {
                match io.stream.read(&mut chunk) {
                    Ok(0) => {
                        closed = Some("connection closed by worker".to_string());
                        break;
                    }
                    Ok(n) => io.read_buffer.extend_from_slice(&chunk[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        closed = Some(e.to_string());
                        break;
                    }
                }
            }

            for line in drain_lines(&mut io.read_buffer) {
                match line {
                    Ok(line) => messages.push((slot.index, line)),
                    Err(e) => warn!(worker = slot.index, error = %e, "dropping undecodable worker frame"),
                }
            }
            drop(io);

            if let Some(reason) = closed {
                self.mark_lost(&slot, &reason);
            }
        }

        messages
    }

    fn mark_lost(&self, slot: &WorkerSlot, reason: &str) {
        {
            let mut state = lock(&slot.state);
            if !state.connected {
                return;
            }
            state.connected = false;
            state.available = false;
        }
        if let Ok(io) = slot.io.try_lock() {
            let _ = io.stream.shutdown(Shutdown::Both);
        }
        warn!(worker = slot.index, address = %slot.address, reason, "worker connection lost");
        lock(&self.lost).push(slot.index);
    }

    /// Workers that went away since the previous call.
    pub fn drain_disconnected(&self) -> Vec<usize> {
        std::mem::take(&mut *lock(&self.lost))
    }

    /// Round-robin over connected workers that report themselves available.
    /// Load is not taken into account.
    pub fn select_worker(&self) -> Option<usize> {
        let mut table = lock(&self.table);
        let count = table.slots.len();
        let start = table.next;
        for offset in 0..count {
            let index = (start + offset) % count;
            if table.slots[index].is_selectable() {
                table.next = index + 1;
                return Some(index);
            }
        }
        None
    }

    pub fn has_available_worker(&self) -> bool {
        self.slots().iter().any(|slot| slot.is_selectable())
    }

    pub fn update_status(&self, index: usize, node_id: &str, available: bool, load: f32) {
        if let Some(slot) = self.slot(index) {
            let mut state = lock(&slot.state);
            if !node_id.is_empty() {
                state.node_id = Some(node_id.to_string());
            }
            state.available = available && state.connected;
            state.load = load;
            state.last_seen_ms = now_millis();
            debug!(worker = index, node_id, available, load, "worker status");
        }
    }

    pub fn touch(&self, index: usize) {
        if let Some(slot) = self.slot(index) {
            lock(&slot.state).last_seen_ms = now_millis();
        }
    }

    pub fn connected_count(&self) -> usize {
        self.slots().iter().filter(|slot| slot.is_connected()).count()
    }

    pub fn is_connected(&self, index: usize) -> bool {
        self.slot(index).map(|slot| slot.is_connected()).unwrap_or(false)
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.slots()
            .iter()
            .map(|slot| {
                let state = lock(&slot.state).clone();
                WorkerSnapshot {
                    index: slot.index,
                    address: slot.address.clone(),
                    node_id: state.node_id,
                    connected: state.connected,
                    available: state.available,
                    load: state.load,
                    last_seen_ms: state.last_seen_ms,
                }
            })
            .collect()
    }

    pub fn close_all(&self) {
        for slot in self.slots() {
            let mut state = lock(&slot.state);
            if state.connected {
                state.connected = false;
                state.available = false;
                let _ = lock(&slot.io).stream.shutdown(Shutdown::Both);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::WorkerPool;
    use crate::errors::WorkerError;

    fn pool(max: usize) -> WorkerPool {
        WorkerPool::new(max, Duration::from_secs(2))
    }

    fn worker_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind worker listener");
        let addr = listener.local_addr().expect("local addr").to_string();
        (listener, addr)
    }

    fn accept(listener: &TcpListener) -> TcpStream {
        let (stream, _) = listener.accept().expect("accept gateway");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("read timeout");
        stream
    }

    fn poll_until(pool: &WorkerPool, want: usize) -> Vec<(usize, String)> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut got = Vec::new();
        while got.len() < want && Instant::now() < deadline {
            got.extend(pool.poll_all());
            thread::sleep(Duration::from_millis(5));
        }
        got
    }

    #[test]
    fn add_worker_respects_bound() {
        let (l1, a1) = worker_listener();
        let (_l2, a2) = worker_listener();
        let pool = pool(1);

        assert_eq!(pool.add_worker(&a1).expect("first worker"), 0);
        let _peer = accept(&l1);
        let err = pool.add_worker(&a2).unwrap_err();
        assert!(matches!(err, WorkerError::PoolFull { max: 1 }));
        assert_eq!(pool.connected_count(), 1);
    }

    #[test]
    fn connect_refused_is_reported() {
        let (listener, addr) = worker_listener();
        drop(listener);
        let err = pool(2).add_worker(&addr).unwrap_err();
        assert!(matches!(err, WorkerError::ConnectFailed { .. }));
    }

    #[test]
    fn send_delivers_full_payload() {
        let (listener, addr) = worker_listener();
        let pool = pool(2);
        let index = pool.add_worker(&addr).expect("add");
        let peer = accept(&listener);

        pool.send(index, b"{\"type\":\"heartbeat\"}\n").expect("send");
        let mut line = String::new();
        BufReader::new(peer).read_line(&mut line).expect("read line");
        assert_eq!(line, "{\"type\":\"heartbeat\"}\n");
    }

    #[test]
    fn send_to_unknown_worker_fails() {
        let err = pool(2).send(3, b"x\n").unwrap_err();
        assert!(matches!(err, WorkerError::UnknownWorker { index: 3 }));
    }

    #[test]
    fn poll_all_splits_lines_across_workers() {
        let (l1, a1) = worker_listener();
        let (l2, a2) = worker_listener();
        let pool = pool(4);
        let w1 = pool.add_worker(&a1).expect("w1");
        let w2 = pool.add_worker(&a2).expect("w2");
        let mut p1 = accept(&l1);
        let mut p2 = accept(&l2);

        p1.write_all(b"one\ntw").expect("p1 write");
        p2.write_all(b"three\n").expect("p2 write");

        let mut got = poll_until(&pool, 2);
        p1.write_all(b"o\n").expect("p1 finish");
        got.extend(poll_until(&pool, 1));

        let from_w1: Vec<&str> = got.iter().filter(|(w, _)| *w == w1).map(|(_, l)| l.as_str()).collect();
        let from_w2: Vec<&str> = got.iter().filter(|(w, _)| *w == w2).map(|(_, l)| l.as_str()).collect();
        assert_eq!(from_w1, vec!["one", "two"]);
        assert_eq!(from_w2, vec!["three"]);
    }

    #[test]
    fn closed_worker_is_reported_once_and_slot_reused() {
        let (l1, a1) = worker_listener();
        let pool = pool(1);
        let index = pool.add_worker(&a1).expect("add");
        let peer = accept(&l1);
        drop(peer);

        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.is_connected(index) && Instant::now() < deadline {
            pool.poll_all();
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!pool.is_connected(index));
        let err = pool.add_worker(&a1).unwrap_err();
        assert!(matches!(err, WorkerError::PoolFull { max: 1 }));

        assert_eq!(pool.drain_disconnected(), vec![index]);
        assert!(pool.drain_disconnected().is_empty());
        assert!(pool.select_worker().is_none());

        let reused = pool.add_worker(&a1).expect("re-add into dead slot");
        assert_eq!(reused, index);
    }

    #[test]
    fn select_worker_round_robins_and_skips_unavailable() {
        let (l1, a1) = worker_listener();
        let (l2, a2) = worker_listener();
        let (l3, a3) = worker_listener();
        let pool = pool(4);
        pool.add_worker(&a1).expect("w0");
        pool.add_worker(&a2).expect("w1");
        pool.add_worker(&a3).expect("w2");
        let _peers = (accept(&l1), accept(&l2), accept(&l3));

        let picks: Vec<usize> = (0..4).filter_map(|_| pool.select_worker()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0]);

        pool.update_status(1, "npu-1", false, 0.9);
        let picks: Vec<usize> = (0..3).filter_map(|_| pool.select_worker()).collect();
        assert_eq!(picks, vec![2, 0, 2]);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot[1].node_id.as_deref(), Some("npu-1"));
        assert!(!snapshot[1].available);
        assert!(snapshot[1].connected);
    }
}
