//! Reactor socket backend.
//!
//! A dedicated OS thread owns a `mio::Poll` and a [`SocketManager`] holding
//! every accepted stream. Async handles talk to that thread through a command
//! queue and a waker; inbound frames flow back over tokio channels.
//!
//! The thread exits once the listener has been dropped and the last managed
//! socket has been closed.

use super::{bind_listener, frame, FrameReader, FrameWriter, Listener, Transport, TransportHandle};
use crate::error::TransportError;
use async_trait::async_trait;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use frame::FrameDecoder;
use mio::event::Event;
use mio::net::{TcpListener as MioListener, TcpStream as MioStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_SOCKET: usize = 2;

const READ_CHUNK: usize = 16 * 1024;

/// Backend driven by a `mio` poll loop on its own thread.
#[derive(Debug, Default)]
pub struct ReactorTransport;

impl ReactorTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for ReactorTransport {
    fn name(&self) -> &'static str {
        "reactor"
    }

    async fn listen(&self, addr: SocketAddr) -> Result<Box<dyn Listener>, TransportError> {
        let std_listener = bind_listener(addr)?;
        let local_addr = std_listener.local_addr()?;
        let mut listener = MioListener::from_std(std_listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let (command_tx, command_rx) = channel::unbounded();
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();

        let reactor = Reactor {
            poll,
            listener: Some(listener),
            sockets: SocketManager::new(),
            commands: command_rx,
            command_tx: command_tx.clone(),
            waker: waker.clone(),
            accepted: accepted_tx,
        };

        std::thread::Builder::new()
            .name("battle-reactor".to_string())
            .spawn(move || reactor.run())?;

        info!("✅ Reactor listener bound on {}", local_addr);
        Ok(Box::new(ReactorListener {
            local_addr,
            accepted: accepted_rx,
            commands: command_tx,
            waker,
        }))
    }
}

/// Requests from async handles to the reactor thread.
#[derive(Debug)]
enum Command {
    /// Queue an already-encoded frame on a socket
    Write(Token, Vec<u8>),
    /// Flush pending output, then close the socket
    Close(Token),
    /// Stop accepting new connections
    StopListening,
}

fn send_command(commands: &Sender<Command>, waker: &Waker, command: Command) -> io::Result<()> {
    commands
        .send(command)
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reactor has stopped"))?;
    waker.wake()
}

// ============================================================================
// Socket manager
// ============================================================================

struct ManagedSocket {
    stream: MioStream,
    decoder: FrameDecoder,
    outbound: VecDeque<Vec<u8>>,
    /// Bytes of the front outbound buffer already written
    written: usize,
    inbound: mpsc::UnboundedSender<io::Result<Vec<u8>>>,
    closed: Arc<AtomicBool>,
    closing: bool,
    writable_interest: bool,
}

/// Owns every accepted stream, keyed by its poll token.
struct SocketManager {
    sockets: HashMap<Token, ManagedSocket>,
    next_token: usize,
}

/// Outcome of servicing a socket.
enum SocketState {
    Open,
    Finished,
    Failed(io::Error),
}

impl SocketManager {
    fn new() -> Self {
        Self {
            sockets: HashMap::new(),
            next_token: FIRST_SOCKET,
        }
    }

    fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    fn insert(
        &mut self,
        registry: &Registry,
        mut stream: MioStream,
    ) -> io::Result<(Token, mpsc::UnboundedReceiver<io::Result<Vec<u8>>>, Arc<AtomicBool>)> {
        let token = Token(self.next_token);
        self.next_token += 1;

        registry.register(&mut stream, token, Interest::READABLE)?;

        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.sockets.insert(
            token,
            ManagedSocket {
                stream,
                decoder: FrameDecoder::new(),
                outbound: VecDeque::new(),
                written: 0,
                inbound,
                closed: closed.clone(),
                closing: false,
                writable_interest: false,
            },
        );
        Ok((token, inbound_rx, closed))
    }

    fn handle_event(&mut self, registry: &Registry, event: &Event) {
        let token = event.token();
        let Some(socket) = self.sockets.get_mut(&token) else {
            return;
        };

        let mut state = SocketState::Open;
        if event.is_writable() {
            state = socket.flush(registry, token);
        }
        if matches!(state, SocketState::Open) && (event.is_readable() || event.is_read_closed()) {
            state = socket.fill();
        }
        if matches!(state, SocketState::Open) && event.is_error() {
            state = SocketState::Failed(
                socket
                    .stream
                    .take_error()
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| io::Error::other("socket error")),
            );
        }

        self.settle(registry, token, state);
    }

    fn queue(&mut self, registry: &Registry, token: Token, bytes: Vec<u8>) {
        let Some(socket) = self.sockets.get_mut(&token) else {
            debug!("Dropping write for closed socket {:?}", token);
            return;
        };
        if socket.closing {
            return;
        }
        socket.outbound.push_back(bytes);
        let state = socket.flush(registry, token);
        self.settle(registry, token, state);
    }

    fn close(&mut self, registry: &Registry, token: Token) {
        let Some(socket) = self.sockets.get_mut(&token) else {
            return;
        };
        socket.closing = true;
        let state = socket.flush(registry, token);
        self.settle(registry, token, state);
    }

    /// Remove the socket if servicing it finished or failed.
    fn settle(&mut self, registry: &Registry, token: Token, state: SocketState) {
        match state {
            SocketState::Open => {}
            SocketState::Finished => self.remove(registry, token, None),
            SocketState::Failed(e) => self.remove(registry, token, Some(e)),
        }
    }

    fn remove(&mut self, registry: &Registry, token: Token, error: Option<io::Error>) {
        let Some(mut socket) = self.sockets.remove(&token) else {
            return;
        };
        socket.closed.store(true, Ordering::Release);
        if let Err(e) = registry.deregister(&mut socket.stream) {
            debug!("Deregistering socket {:?} failed: {}", token, e);
        }
        let _ = socket.stream.shutdown(Shutdown::Both);
        if let Some(e) = error {
            let _ = socket.inbound.send(Err(e));
        }
        // Dropping `inbound` ends the reader's stream.
    }

    fn close_all(&mut self, registry: &Registry) {
        let tokens: Vec<Token> = self.sockets.keys().copied().collect();
        for token in tokens {
            self.remove(registry, token, None);
        }
    }
}

impl ManagedSocket {
    /// Read until the socket would block, forwarding complete frames.
    fn fill(&mut self) -> SocketState {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    if self.decoder.pending() > 0 {
                        return SocketState::Failed(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed mid-frame",
                        ));
                    }
                    return SocketState::Finished;
                }
                Ok(n) => {
                    self.decoder.extend(&chunk[..n]);
                    loop {
                        match self.decoder.next_frame() {
                            Ok(Some(frame)) => {
                                let _ = self.inbound.send(Ok(frame));
                            }
                            Ok(None) => break,
                            Err(e) => return SocketState::Failed(e),
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return SocketState::Open,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return SocketState::Failed(e),
            }
        }
    }

    /// Write queued output until drained or the socket would block.
    fn flush(&mut self, registry: &Registry, token: Token) -> SocketState {
        while let Some(front) = self.outbound.front() {
            match self.stream.write(&front[self.written..]) {
                Ok(0) => {
                    return SocketState::Failed(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ))
                }
                Ok(n) => {
                    self.written += n;
                    if self.written == front.len() {
                        self.outbound.pop_front();
                        self.written = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return SocketState::Failed(e),
            }
        }

        if self.outbound.is_empty() && self.closing {
            return SocketState::Finished;
        }

        let want_writable = !self.outbound.is_empty();
        if want_writable != self.writable_interest {
            let interest = if want_writable {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if let Err(e) = registry.reregister(&mut self.stream, token, interest) {
                return SocketState::Failed(e);
            }
            self.writable_interest = want_writable;
        }
        SocketState::Open
    }
}

// ============================================================================
// Reactor thread
// ============================================================================

struct Reactor {
    poll: Poll,
    listener: Option<MioListener>,
    sockets: SocketManager,
    commands: Receiver<Command>,
    command_tx: Sender<Command>,
    waker: Arc<Waker>,
    accepted: mpsc::UnboundedSender<io::Result<TransportHandle>>,
}

impl Reactor {
    fn run(mut self) {
        let mut events = Events::with_capacity(256);
        debug!("Reactor thread started");

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("Reactor poll failed: {}", e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_pending(),
                    WAKER => {}
                    _ => self.sockets.handle_event(self.poll.registry(), event),
                }
            }

            if !self.drain_commands() {
                break;
            }
            if self.listener.is_none() && self.sockets.is_empty() {
                break;
            }
        }

        self.sockets.close_all(self.poll.registry());
        debug!("Reactor thread stopped");
    }

    /// Apply queued commands. Returns false when no handle can reach the
    /// reactor any more.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Write(token, bytes)) => {
                    self.sockets.queue(self.poll.registry(), token, bytes)
                }
                Ok(Command::Close(token)) => self.sockets.close(self.poll.registry(), token),
                Ok(Command::StopListening) => {
                    if let Some(mut listener) = self.listener.take() {
                        let _ = self.poll.registry().deregister(&mut listener);
                        debug!("Reactor listener stopped");
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((stream, remote_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY for {}: {}", remote_addr, e);
                    }
                    let handle = match self.sockets.insert(self.poll.registry(), stream) {
                        Ok((token, inbound, closed)) => TransportHandle::new(
                            remote_addr,
                            Box::new(ReactorReader { inbound }),
                            Box::new(ReactorWriter {
                                token,
                                closed,
                                commands: self.command_tx.clone(),
                                waker: self.waker.clone(),
                            }),
                        ),
                        Err(e) => {
                            error!("Failed to register socket from {}: {}", remote_addr, e);
                            continue;
                        }
                    };
                    if self.accepted.send(Ok(handle)).is_err() {
                        // Listener handle is gone; the writer's drop closes the socket.
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = self.accepted.send(Err(e));
                    return;
                }
            }
        }
    }
}

// ============================================================================
// Async handles
// ============================================================================

struct ReactorListener {
    local_addr: SocketAddr,
    accepted: mpsc::UnboundedReceiver<io::Result<TransportHandle>>,
    commands: Sender<Command>,
    waker: Arc<Waker>,
}

#[async_trait]
impl Listener for ReactorListener {
    async fn accept(&mut self) -> io::Result<TransportHandle> {
        match self.accepted.recv().await {
            Some(result) => result,
            None => Err(io::Error::other("reactor has stopped")),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

impl Drop for ReactorListener {
    fn drop(&mut self) {
        let _ = send_command(&self.commands, &self.waker, Command::StopListening);
    }
}

struct ReactorReader {
    inbound: mpsc::UnboundedReceiver<io::Result<Vec<u8>>>,
}

#[async_trait]
impl FrameReader for ReactorReader {
    async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self.inbound.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

struct ReactorWriter {
    token: Token,
    closed: Arc<AtomicBool>,
    commands: Sender<Command>,
    waker: Arc<Waker>,
}

#[async_trait]
impl FrameWriter for ReactorWriter {
    async fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            ));
        }
        let bytes = frame::encode(payload)?;
        send_command(&self.commands, &self.waker, Command::Write(self.token, bytes))
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        send_command(&self.commands, &self.waker, Command::Close(self.token))
    }
}

impl Drop for ReactorWriter {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = send_command(&self.commands, &self.waker, Command::Close(self.token));
        }
    }
}
