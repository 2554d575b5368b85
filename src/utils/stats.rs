use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cadence::{
    ext::{MetricValue, ToCounterValue, ToGaugeValue},
    Counted, Gauged, Metric, MetricBuilder, MetricResult, StatsdClient, UdpMetricSink,
};
use log::{debug, info, warn};

const TICK_CYCLE: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug)]
pub enum CounterType {
    Counted,
    Gauged,
}

#[derive(Clone, Copy, Debug)]
pub enum CounterValue {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

impl CounterValue {
    // the statsd wire format only carries signed values, counters and
    // gauges narrow the same way
    fn into_signed(self) -> MetricValue {
        match self {
            CounterValue::Signed(v) => MetricValue::Signed(v),
            CounterValue::Unsigned(v) => MetricValue::Signed(v as i64),
            CounterValue::Float(v) => MetricValue::Signed(v as i64),
        }
    }
}

impl ToCounterValue for CounterValue {
    fn try_to_value(self) -> MetricResult<MetricValue> {
        Ok(self.into_signed())
    }
}

impl ToGaugeValue for CounterValue {
    fn try_to_value(self) -> MetricResult<MetricValue> {
        Ok(self.into_signed())
    }
}

pub type Counter = (&'static str, CounterType, CounterValue);

pub trait RefCountable: Send + Sync {
    fn get_counters(&self) -> Vec<Counter>;
}

pub trait OwnedCountable: Send + Sync {
    fn get_counters(&self) -> Vec<Counter>;
    fn closed(&self) -> bool;
}

pub enum Countable {
    Owned(Box<dyn OwnedCountable>),
    Ref(Weak<dyn RefCountable>),
}

impl Countable {
    fn get_counters(&self) -> Vec<Counter> {
        match self {
            Countable::Owned(c) => c.get_counters(),
            Countable::Ref(c) => c.upgrade().map(|c| c.get_counters()).unwrap_or_default(),
        }
    }

    fn closed(&self) -> bool {
        match self {
            Countable::Owned(c) => c.closed(),
            Countable::Ref(c) => c.strong_count() == 0,
        }
    }
}

pub enum StatsOption {
    Tag(&'static str, String),
}

struct Source {
    module: &'static str,
    countable: Countable,
    tags: Vec<(&'static str, String)>,
}

// periodically flushes registered counters to the configured statsd targets
pub struct Collector {
    prefix: &'static str,
    hostname: String,
    remotes: Vec<SocketAddr>,
    sources: Arc<Mutex<Vec<Source>>>,

    running: Arc<(Mutex<bool>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn new(prefix: &'static str, remotes: &[String]) -> Self {
        let remotes = remotes
            .iter()
            .filter_map(|addr| match addr.to_socket_addrs() {
                Ok(mut addrs) => addrs.next(),
                Err(e) => {
                    warn!("ignoring unresolvable stats remote {}: {}", addr, e);
                    None
                }
            })
            .collect();
        Self {
            prefix,
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_default(),
            remotes,
            sources: Arc::new(Mutex::new(vec![])),
            running: Arc::new((Mutex::new(false), Condvar::new())),
            thread: Mutex::new(None),
        }
    }

    pub fn register_countable(
        &self,
        module: &'static str,
        countable: Countable,
        options: Vec<StatsOption>,
    ) {
        let mut source = Source {
            module,
            countable,
            tags: vec![],
        };
        for option in options {
            match option {
                StatsOption::Tag(k, v) if !source.tags.iter().any(|(key, _)| key == &k) => {
                    source.tags.push((k, v))
                }
                _ => warn!("ignored duplicated tag for module {}", source.module),
            }
        }
        self.sources.lock().unwrap().push(source);
    }

    fn new_statsd_client(prefix: &'static str, addr: SocketAddr) -> MetricResult<StatsdClient> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let sink = UdpMetricSink::from(addr, socket)?;
        Ok(StatsdClient::from_sink(prefix, sink))
    }

    fn send_metrics<'a, T: Metric + From<String>>(
        mut b: MetricBuilder<'a, '_, T>,
        host: &'a str,
        tags: &'a [(&'static str, String)],
    ) {
        let mut has_host = false;
        for (k, v) in tags {
            if *k == "host" {
                has_host = true;
            }
            b = b.with_tag(k, v);
        }
        if !has_host {
            b = b.with_tag("host", host);
        }
        b.send();
    }

    pub fn start(&self) {
        {
            let (started, _) = &*self.running;
            let mut started = started.lock().unwrap();
            if *started {
                return;
            }
            *started = true;
        }

        let prefix = self.prefix;
        let hostname = self.hostname.clone();
        let remotes = self.remotes.clone();
        let running = self.running.clone();
        let sources = self.sources.clone();
        *self.thread.lock().unwrap() = Some(
            thread::Builder::new()
                .name("stats-collector".to_owned())
                .spawn(move || {
                    let clients = remotes
                        .iter()
                        .filter_map(|&remote| match Self::new_statsd_client(prefix, remote) {
                            Ok(c) => Some(c),
                            Err(e) => {
                                warn!("create statsd client to {} failed: {}", remote, e);
                                None
                            }
                        })
                        .collect::<Vec<_>>();
                    loop {
                        {
                            let mut sources = sources.lock().unwrap();
                            sources.retain(|s| !s.countable.closed());
                            for source in sources.iter() {
                                let points = source.countable.get_counters();
                                if points.is_empty() {
                                    continue;
                                }
                                debug!("{} collected: {:?}", source.module, points);
                                for client in clients.iter() {
                                    for (name, counter_type, value) in points.iter() {
                                        let metric_name =
                                            format!("{}_{}", source.module, name).replace('-', "_");
                                        match counter_type {
                                            CounterType::Counted => Self::send_metrics(
                                                client.count_with_tags(&metric_name, *value),
                                                &hostname,
                                                &source.tags,
                                            ),
                                            CounterType::Gauged => Self::send_metrics(
                                                client.gauge_with_tags(&metric_name, *value),
                                                &hostname,
                                                &source.tags,
                                            ),
                                        }
                                    }
                                }
                            }
                        }

                        let (running, timer) = &*running;
                        let mut running = running.lock().unwrap();
                        if !*running {
                            break;
                        }
                        running = timer.wait_timeout(running, TICK_CYCLE).unwrap().0;
                        if !*running {
                            break;
                        }
                    }
                })
                .unwrap(),
        );
        info!("stats collector started");
    }

    pub fn stop(&self) {
        {
            let (running, timer) = &*self.running;
            let mut running = running.lock().unwrap();
            if !*running {
                return;
            }
            *running = false;
            timer.notify_one();
        }
        if let Some(t) = self.thread.lock().unwrap().take() {
            let _ = t.join();
        }
        info!("stats collector exited");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    struct FakeCounter(AtomicU64);

    impl RefCountable for FakeCounter {
        fn get_counters(&self) -> Vec<Counter> {
            vec![(
                "value",
                CounterType::Counted,
                CounterValue::Unsigned(self.0.swap(0, Ordering::Relaxed)),
            )]
        }
    }

    #[test]
    fn register_and_retire_sources() {
        let collector = Collector::new("test", &[]);
        let counter: Arc<dyn RefCountable> = Arc::new(FakeCounter(AtomicU64::new(7)));
        let countable: Weak<dyn RefCountable> = Arc::downgrade(&counter);
        collector.register_countable(
            "fake",
            Countable::Ref(countable),
            vec![StatsOption::Tag("id", "0".to_owned())],
        );
        assert_eq!(collector.sources.lock().unwrap().len(), 1);

        // dropping the strong reference retires the source on next flush
        drop(counter);
        let sources = collector.sources.lock().unwrap();
        assert!(sources[0].countable.closed());
    }

    #[test]
    fn start_stop_idempotent() {
        let collector = Collector::new("test", &[]);
        collector.start();
        collector.start();
        collector.stop();
        collector.stop();
    }
}
