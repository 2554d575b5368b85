use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use openssl::pkey::PKey;
use openssl::ssl::{SslAcceptor, SslMethod, SslStream};
use openssl::x509::X509;

use super::{CollectorCounter, ACCEPT_POLL_INTERVAL, TRANSPORT_ERROR_BACKOFF};
use crate::common::Message;
use crate::consts::MESSAGE_HEADER_LENGTH;
use crate::decoder::MessageDecoder;
use crate::error::{Error, Result};
use crate::utils::bytes::read_u16_be;
use crate::utils::queue::Sender;

pub(super) fn tls_acceptor(cert_pem: &[u8], key_pem: &[u8]) -> Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())
        .map_err(|e| Error::Tls(e.to_string()))?;
    let key = PKey::private_key_from_pem(key_pem).map_err(|e| Error::Tls(e.to_string()))?;
    let cert = X509::from_pem(cert_pem).map_err(|e| Error::Tls(e.to_string()))?;
    builder
        .set_private_key(&key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    builder
        .set_certificate(&cert)
        .map_err(|e| Error::Tls(e.to_string()))?;
    builder
        .check_private_key()
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(builder.build())
}

enum MaybeTlsStream {
    Raw(TcpStream),
    Tls(Box<SslStream<TcpStream>>),
}

impl Read for MaybeTlsStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            MaybeTlsStream::Raw(stream) => stream.read(buf),
            MaybeTlsStream::Tls(stream) => stream.read(buf),
        }
    }
}

// accepts exporters and hands each connection to its own thread, no worker
// pool needed since connections scale with clients
pub(super) struct TcpAcceptor {
    pub listener: TcpListener,
    pub tls: Option<SslAcceptor>,
    pub max_buffer_size: u16,
    pub output: Sender<Message>,
    pub decoder: Arc<MessageDecoder>,
    pub running: Arc<AtomicBool>,
    pub counter: Arc<CollectorCounter>,
}

impl TcpAcceptor {
    pub fn run(self) {
        let mut connections: Vec<JoinHandle<()>> = vec![];
        while self.running.load(Ordering::Relaxed) {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                    connections.retain(|handle| !handle.is_finished());
                    continue;
                }
                Err(e) => {
                    self.counter.transport_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("tcp accept failed: {}", e);
                    thread::sleep(TRANSPORT_ERROR_BACKOFF);
                    continue;
                }
            };
            debug!("accepted exporter connection from {}", peer);
            let stream = match self.setup_stream(stream, peer) {
                Some(stream) => stream,
                None => continue,
            };
            let connection = Connection {
                stream,
                peer,
                max_buffer_size: self.max_buffer_size,
                output: self.output.clone(),
                decoder: self.decoder.clone(),
                running: self.running.clone(),
                counter: self.counter.clone(),
            };
            connections.push(
                thread::Builder::new()
                    .name("tcp-connection".to_owned())
                    .spawn(move || connection.run())
                    .unwrap(),
            );
        }
        for handle in connections {
            let _ = handle.join();
        }
        info!("tcp acceptor exited");
    }

    fn setup_stream(&self, stream: TcpStream, peer: SocketAddr) -> Option<MaybeTlsStream> {
        // accepted sockets must not inherit the listener's non-blocking
        // mode, reads poll with a timeout so shutdown stays bounded
        let prepared = stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_read_timeout(Some(super::RCV_TIMEOUT)));
        if let Err(e) = prepared {
            warn!("preparing connection from {} failed: {}", peer, e);
            return None;
        }
        match &self.tls {
            None => Some(MaybeTlsStream::Raw(stream)),
            Some(acceptor) => match acceptor.accept(stream) {
                Ok(stream) => Some(MaybeTlsStream::Tls(Box::new(stream))),
                Err(e) => {
                    self.counter.transport_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("tls handshake with {} failed: {}", peer, e);
                    None
                }
            },
        }
    }
}

enum ReadOutcome {
    Full,
    // clean close before any byte of the frame
    Eof,
    Stopped,
}

struct Connection {
    stream: MaybeTlsStream,
    peer: SocketAddr,
    max_buffer_size: u16,
    output: Sender<Message>,
    decoder: Arc<MessageDecoder>,
    running: Arc<AtomicBool>,
    counter: Arc<CollectorCounter>,
}

impl Connection {
    fn run(mut self) {
        self.counter.connections.fetch_add(1, Ordering::Relaxed);
        self.serve();
        self.counter.connections.fetch_sub(1, Ordering::Relaxed);
        debug!("connection from {} closed", self.peer);
    }

    fn serve(&mut self) {
        let mut frame = vec![0u8; self.max_buffer_size as usize];
        let mut warned_version = false;
        loop {
            // version and length lead the message, the length field frames
            // the stream
            let mut header = [0u8; 4];
            match self.read_full(&mut header) {
                Ok(ReadOutcome::Full) => (),
                Ok(ReadOutcome::Eof) | Ok(ReadOutcome::Stopped) => return,
                Err(e) => {
                    self.counter.transport_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("read from {} failed: {}", self.peer, e);
                    return;
                }
            }
            let length = read_u16_be(&header[2..4]) as usize;
            if length < MESSAGE_HEADER_LENGTH || length > frame.len() {
                // the stream cannot be re-framed after a bogus length
                self.counter
                    .on_decode_error(&Error::Malformed(String::new()));
                warn!(
                    "exporter {} sent message length {}, closing connection",
                    self.peer, length
                );
                return;
            }
            frame[..4].copy_from_slice(&header);
            match self.read_full(&mut frame[4..length]) {
                Ok(ReadOutcome::Full) => (),
                Ok(ReadOutcome::Stopped) => return,
                Ok(ReadOutcome::Eof) => {
                    warn!("exporter {} closed mid-frame", self.peer);
                    return;
                }
                Err(e) => {
                    self.counter.transport_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("read from {} failed: {}", self.peer, e);
                    return;
                }
            }
            self.counter.rx.fetch_add(1, Ordering::Relaxed);
            self.counter
                .rx_bytes
                .fetch_add(length as u64, Ordering::Relaxed);

            match self.decoder.decode(&frame[..length]) {
                Ok(message) => {
                    self.counter.decoded.fetch_add(1, Ordering::Relaxed);
                    // a full queue stalls here and backpressure reaches the
                    // exporter through the unread socket
                    if !super::forward(&self.output, &self.running, message) {
                        return;
                    }
                }
                Err(e) => {
                    self.counter.on_decode_error(&e);
                    match e {
                        Error::UnsupportedVersion(v) => {
                            if !warned_version {
                                warned_version = true;
                                warn!(
                                    "exporter {} sends version {}, dropping its messages",
                                    self.peer, v
                                );
                            }
                        }
                        e => debug!("dropping message from {}: {}", self.peer, e),
                    }
                }
            }
        }
    }

    // collects bytes across read timeouts until buf is full, a message may
    // arrive split over any number of segments
    fn read_full(&mut self, buf: &mut [u8]) -> std::io::Result<ReadOutcome> {
        let mut filled = 0;
        while filled < buf.len() {
            if !self.running.load(Ordering::Relaxed) {
                return Ok(ReadOutcome::Stopped);
            }
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    if filled == 0 {
                        return Ok(ReadOutcome::Eof);
                    }
                    return Err(ErrorKind::UnexpectedEof.into());
                }
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ReadOutcome::Full)
    }
}
