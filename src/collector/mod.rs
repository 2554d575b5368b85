mod tcp;
mod udp;

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::common::Message;
use crate::config::{Config, Transport};
use crate::decoder::{MessageDecoder, TemplateCache};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::utils::queue::{self, Receiver, Sender};
use crate::utils::stats::{
    Countable, Counter, CounterType, CounterValue, RefCountable, StatsOption,
};

const RCV_TIMEOUT: Duration = crate::consts::RCV_TIMEOUT;
const ACCEPT_POLL_INTERVAL: Duration = crate::consts::ACCEPT_POLL_INTERVAL;
const TRANSPORT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct CollectorCounter {
    // datagrams or frames taken off the wire
    pub rx: AtomicU64,
    pub rx_bytes: AtomicU64,
    // shed because no ingest worker was free
    pub dropped: AtomicU64,
    pub decoded: AtomicU64,
    pub truncated: AtomicU64,
    pub malformed: AtomicU64,
    pub unsupported_version: AtomicU64,
    pub discarded_no_template: AtomicU64,
    pub transport_errors: AtomicU64,
    pub connections: AtomicU64,
}

impl CollectorCounter {
    fn on_decode_error(&self, e: &Error) {
        match e {
            Error::Truncated(_) => self.truncated.fetch_add(1, Ordering::Relaxed),
            Error::Malformed(_) => self.malformed.fetch_add(1, Ordering::Relaxed),
            Error::UnsupportedVersion(_) => {
                self.unsupported_version.fetch_add(1, Ordering::Relaxed)
            }
            Error::UnknownTemplate(..) | Error::TemplateExpired(..) => {
                self.discarded_no_template.fetch_add(1, Ordering::Relaxed)
            }
            _ => self.transport_errors.fetch_add(1, Ordering::Relaxed),
        };
    }
}

// pushes downstream with backpressure, but stays responsive to shutdown,
// false means the message could not be delivered and the caller should exit
fn forward(output: &Sender<Message>, running: &AtomicBool, message: Message) -> bool {
    let mut message = message;
    loop {
        match output.send_timeout(message, RCV_TIMEOUT) {
            Ok(()) => return true,
            Err(queue::Error::Full(returned)) => {
                if !running.load(Ordering::Relaxed) {
                    return false;
                }
                message = returned;
            }
            Err(_) => return false,
        }
    }
}

impl RefCountable for CollectorCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "rx",
                CounterType::Counted,
                CounterValue::Unsigned(self.rx.swap(0, Ordering::Relaxed)),
            ),
            (
                "rx-bytes",
                CounterType::Counted,
                CounterValue::Unsigned(self.rx_bytes.swap(0, Ordering::Relaxed)),
            ),
            (
                "dropped",
                CounterType::Counted,
                CounterValue::Unsigned(self.dropped.swap(0, Ordering::Relaxed)),
            ),
            (
                "decoded",
                CounterType::Counted,
                CounterValue::Unsigned(self.decoded.swap(0, Ordering::Relaxed)),
            ),
            (
                "truncated",
                CounterType::Counted,
                CounterValue::Unsigned(self.truncated.swap(0, Ordering::Relaxed)),
            ),
            (
                "malformed",
                CounterType::Counted,
                CounterValue::Unsigned(self.malformed.swap(0, Ordering::Relaxed)),
            ),
            (
                "unsupported-version",
                CounterType::Counted,
                CounterValue::Unsigned(self.unsupported_version.swap(0, Ordering::Relaxed)),
            ),
            (
                "discarded-no-template",
                CounterType::Counted,
                CounterValue::Unsigned(self.discarded_no_template.swap(0, Ordering::Relaxed)),
            ),
            (
                "transport-errors",
                CounterType::Counted,
                CounterValue::Unsigned(self.transport_errors.swap(0, Ordering::Relaxed)),
            ),
            (
                "connections",
                CounterType::Gauged,
                CounterValue::Unsigned(self.connections.load(Ordering::Relaxed)),
            ),
        ]
    }
}

// receives IPFIX messages over one transport, decodes them against the
// template cache and hands them to the receiver returned by new()
pub struct CollectingProcess {
    config: Config,
    templates: Arc<TemplateCache>,
    decoder: Arc<MessageDecoder>,
    output: Mutex<Option<Sender<Message>>>,

    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,

    counter: Arc<CollectorCounter>,
    stats: Option<crate::utils::stats::Collector>,
}

impl CollectingProcess {
    pub fn new(
        mut config: Config,
        registry: Arc<dyn Registry>,
    ) -> Result<(Self, Receiver<Message>)> {
        config.normalize();
        config.validate().map_err(|e| Error::Config(e.to_string()))?;

        let templates = Arc::new(TemplateCache::new(config.template_ttl));
        let decoder = Arc::new(MessageDecoder::new(templates.clone(), registry));
        let (sender, receiver, output_handle) = queue::bounded(config.message_queue_size);
        let counter = Arc::new(CollectorCounter::default());

        let stats = if config.stats_remotes.is_empty() {
            None
        } else {
            let stats =
                crate::utils::stats::Collector::new("ipfix-collector", &config.stats_remotes);
            let collector_counter: Arc<dyn RefCountable> = counter.clone();
            let decoder_counter: Arc<dyn RefCountable> = decoder.counter().clone();
            let template_gauge: Arc<dyn RefCountable> = templates.clone();
            stats.register_countable(
                "collector",
                Countable::Ref(Arc::downgrade(&collector_counter)),
                vec![],
            );
            stats.register_countable(
                "decoder",
                Countable::Ref(Arc::downgrade(&decoder_counter)),
                vec![],
            );
            stats.register_countable(
                "template-cache",
                Countable::Ref(Arc::downgrade(&template_gauge)),
                vec![],
            );
            stats.register_countable(
                "message-queue",
                Countable::Owned(Box::new(output_handle)),
                vec![StatsOption::Tag("direction", "output".to_owned())],
            );
            Some(stats)
        };

        Ok((
            Self {
                config,
                templates,
                decoder,
                output: Mutex::new(Some(sender)),
                running: Arc::new(AtomicBool::new(false)),
                threads: Mutex::new(vec![]),
                local_addr: Mutex::new(None),
                counter,
                stats,
            },
            receiver,
        ))
    }

    pub fn counter(&self) -> &Arc<CollectorCounter> {
        &self.counter
    }

    pub fn decoder_counter(&self) -> &Arc<crate::decoder::DecoderCounter> {
        self.decoder.counter()
    }

    // the bound address, wildcard port resolved
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("collecting process already started, do nothing");
            return Ok(());
        }
        let addr = self
            .config
            .socket_addr()
            .map_err(|e| Error::Config(e.to_string()));
        let bound = addr.and_then(|addr| match self.config.protocol {
            Transport::Udp => self.start_udp(addr),
            Transport::Tcp => self.start_tcp(addr),
        });
        if let Err(e) = bound {
            self.running.store(false, Ordering::Relaxed);
            return Err(e);
        }

        if !self.templates.ttl().is_zero() {
            self.spawn_sweeper();
        }
        if let Some(stats) = &self.stats {
            stats.start();
        }
        info!(
            "collecting process listening on {}/{}",
            self.local_addr().unwrap(),
            self.config.protocol
        );
        Ok(())
    }

    fn start_udp(&self, addr: SocketAddr) -> Result<()> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(RCV_TIMEOUT))?;
        *self.local_addr.lock().unwrap() = Some(socket.local_addr()?);

        // a single bounded dispatch queue replaces per-worker channels, a
        // full queue means no worker is free and the datagram is shed
        let worker_count = self.config.ingest_worker_count;
        let (dispatch, datagrams, dispatch_handle) = queue::bounded(worker_count);
        if let Some(stats) = &self.stats {
            stats.register_countable(
                "message-queue",
                Countable::Owned(Box::new(dispatch_handle)),
                vec![StatsOption::Tag("direction", "dispatch".to_owned())],
            );
        }

        let mut threads = self.threads.lock().unwrap();
        let datagrams = Arc::new(datagrams);
        let output = self.output.lock().unwrap().clone().unwrap();
        for id in 0..worker_count {
            let worker = udp::UdpWorker {
                id,
                input: datagrams.clone(),
                output: output.clone(),
                decoder: self.decoder.clone(),
                running: self.running.clone(),
                counter: self.counter.clone(),
            };
            threads.push(
                thread::Builder::new()
                    .name(format!("udp-worker-{}", id))
                    .spawn(move || worker.run())
                    .unwrap(),
            );
        }
        drop(output);

        let reader = udp::UdpReader {
            socket,
            max_buffer_size: self.config.max_buffer_size,
            dispatch,
            running: self.running.clone(),
            counter: self.counter.clone(),
        };
        threads.push(
            thread::Builder::new()
                .name("udp-reader".to_owned())
                .spawn(move || reader.run())
                .unwrap(),
        );
        Ok(())
    }

    fn start_tcp(&self, addr: SocketAddr) -> Result<()> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        *self.local_addr.lock().unwrap() = Some(listener.local_addr()?);

        let tls = if self.config.is_encrypted {
            Some(tcp::tls_acceptor(
                self.config.server_cert.as_bytes(),
                self.config.server_key.as_bytes(),
            )?)
        } else {
            None
        };

        let acceptor = tcp::TcpAcceptor {
            listener,
            tls,
            max_buffer_size: self.config.max_buffer_size,
            output: self.output.lock().unwrap().clone().unwrap(),
            decoder: self.decoder.clone(),
            running: self.running.clone(),
            counter: self.counter.clone(),
        };
        self.threads.lock().unwrap().push(
            thread::Builder::new()
                .name("tcp-acceptor".to_owned())
                .spawn(move || acceptor.run())
                .unwrap(),
        );
        Ok(())
    }

    fn spawn_sweeper(&self) {
        let templates = self.templates.clone();
        let running = self.running.clone();
        let interval = (templates.ttl() / 2).max(MIN_SWEEP_INTERVAL);
        self.threads.lock().unwrap().push(
            thread::Builder::new()
                .name("template-sweeper".to_owned())
                .spawn(move || {
                    let mut slept = Duration::ZERO;
                    while running.load(Ordering::Relaxed) {
                        thread::sleep(RCV_TIMEOUT.min(interval));
                        slept += RCV_TIMEOUT.min(interval);
                        if slept >= interval {
                            templates.sweep();
                            slept = Duration::ZERO;
                        }
                    }
                })
                .unwrap(),
        );
    }

    // waits for in-flight workers and connections, then closes the output
    // queue so the downstream receiver sees end of input
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            warn!("collecting process already stopped, do nothing");
            return;
        }
        for thread in self.threads.lock().unwrap().drain(..) {
            let _ = thread.join();
        }
        self.output.lock().unwrap().take();
        if let Some(stats) = &self.stats {
            stats.stop();
        }
        info!("collecting process exited");
    }
}

impl Drop for CollectingProcess {
    fn drop(&mut self) {
        if self.running.load(Ordering::Relaxed) {
            self.stop();
        }
    }
}
