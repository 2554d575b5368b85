use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;

use log::{debug, info, warn};

use super::{CollectorCounter, RCV_TIMEOUT, TRANSPORT_ERROR_BACKOFF};
use crate::common::Message;
use crate::decoder::MessageDecoder;
use crate::error::Error;
use crate::utils::queue::{self, Receiver, Sender};

pub(super) struct Datagram {
    pub data: Vec<u8>,
    pub peer: SocketAddr,
}

// sole owner of the socket, fans datagrams out to the worker pool and
// sheds load when no worker is free
pub(super) struct UdpReader {
    pub socket: UdpSocket,
    pub max_buffer_size: u16,
    pub dispatch: Sender<Datagram>,
    pub running: Arc<AtomicBool>,
    pub counter: Arc<CollectorCounter>,
}

impl UdpReader {
    pub fn run(self) {
        let mut buf = vec![0u8; self.max_buffer_size as usize];
        while self.running.load(Ordering::Relaxed) {
            let (n, peer) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => {
                    // never exits the process, retries after a short pause
                    self.counter.transport_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("udp receive failed: {}", e);
                    thread::sleep(TRANSPORT_ERROR_BACKOFF);
                    continue;
                }
            };
            self.counter.rx.fetch_add(1, Ordering::Relaxed);
            self.counter.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
            let datagram = Datagram {
                data: buf[..n].to_vec(),
                peer,
            };
            match self.dispatch.try_send(datagram) {
                Ok(()) => (),
                Err(queue::Error::Full(_)) => {
                    // udp semantics, the datagram is gone
                    self.counter.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => break,
            }
        }
        info!("udp reader exited");
    }
}

pub(super) struct UdpWorker {
    pub id: usize,
    pub input: Arc<Receiver<Datagram>>,
    pub output: Sender<Message>,
    pub decoder: Arc<MessageDecoder>,
    pub running: Arc<AtomicBool>,
    pub counter: Arc<CollectorCounter>,
}

impl UdpWorker {
    pub fn run(self) {
        let mut bad_version_peers = HashSet::new();
        while self.running.load(Ordering::Relaxed) {
            let datagram = match self.input.recv(Some(RCV_TIMEOUT)) {
                Ok(datagram) => datagram,
                Err(queue::Error::Timeout) => continue,
                Err(_) => break,
            };
            match self.decoder.decode(&datagram.data) {
                Ok(message) => {
                    self.counter.decoded.fetch_add(1, Ordering::Relaxed);
                    if !super::forward(&self.output, &self.running, message) {
                        break;
                    }
                }
                Err(e) => {
                    self.counter.on_decode_error(&e);
                    match e {
                        Error::UnsupportedVersion(v) => {
                            if bad_version_peers.insert(datagram.peer) {
                                warn!(
                                    "exporter {} sends version {}, dropping its messages",
                                    datagram.peer, v
                                );
                            }
                        }
                        e => debug!("dropping datagram from {}: {}", datagram.peer, e),
                    }
                }
            }
        }
        info!("udp worker {} exited", self.id);
    }
}
