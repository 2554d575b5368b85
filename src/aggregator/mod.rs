use std::collections::{HashMap, VecDeque};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::common::{DataRecord, Field, FieldValue, FlowKey, Message, Set};
use crate::config::{AggregationConfig, StatsKind};
use crate::consts::{QUEUE_BATCH_SIZE, RCV_TIMEOUT, UNCORRELATABLE_BACKLOG};
use crate::error::{Error, Result};
use crate::registry::{InfoElement, Registry};
use crate::utils::queue::{self, Receiver};
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};

// which observation point reported a record, derived from the pod metadata
// the exporter filled in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordSide {
    Source,
    Destination,
    // both pod names filled in, the record arrived pre-correlated
    Both,
    Unknown,
}

fn detect_side(record: &DataRecord) -> RecordSide {
    let source = record
        .value("sourcePodName")
        .map(|v| !v.is_empty())
        .unwrap_or(false);
    let destination = record
        .value("destinationPodName")
        .map(|v| !v.is_empty())
        .unwrap_or(false);
    match (source, destination) {
        (true, true) => RecordSide::Both,
        (true, false) => RecordSide::Source,
        (false, true) => RecordSide::Destination,
        (false, false) => RecordSide::Unknown,
    }
}

// a merged bidirectional flow with per-side provenance
#[derive(Debug, Clone)]
pub struct AggregationFlowRecord {
    pub record: DataRecord,
    pub source_seen: bool,
    pub destination_seen: bool,
}

struct StatsSpec {
    name: String,
    kind: StatsKind,
    source_slot: InfoElement,
    destination_slot: InfoElement,
}

struct MergeSpec {
    correlate_fields: Vec<String>,
    non_stats_elements: Vec<String>,
    stats: Vec<StatsSpec>,
}

impl MergeSpec {
    fn resolve(config: &AggregationConfig, registry: &dyn Registry) -> Result<Self> {
        let mut stats = Vec::with_capacity(config.stats_elements.len());
        for (i, name) in config.stats_elements.iter().enumerate() {
            let source_name = &config.aggregated_source_stats_elements[i];
            let destination_name = &config.aggregated_destination_stats_elements[i];
            let source_slot = registry.element_by_name(source_name).ok_or_else(|| {
                Error::Config(format!("element {} not in registry", source_name))
            })?;
            let destination_slot =
                registry.element_by_name(destination_name).ok_or_else(|| {
                    Error::Config(format!("element {} not in registry", destination_name))
                })?;
            stats.push(StatsSpec {
                name: name.clone(),
                kind: config.stats_kind(name),
                source_slot,
                destination_slot,
            });
        }
        Ok(Self {
            correlate_fields: config.correlate_fields.clone(),
            non_stats_elements: config.non_stats_elements.clone(),
            stats,
        })
    }

    // first record for a key becomes the aggregate, extended with zeroed
    // per-side counter slots before its own side is folded in
    fn new_aggregate(&self, mut record: DataRecord, side: RecordSide) -> AggregationFlowRecord {
        for spec in &self.stats {
            let value = record.value(&spec.name).cloned();
            let zero = value
                .as_ref()
                .map(|v| v.zeroed())
                .unwrap_or(FieldValue::Unsigned64(0));
            let (source_value, destination_value) = match (side, value) {
                (RecordSide::Source, Some(v)) => (v, zero),
                (RecordSide::Destination, Some(v)) => (zero, v),
                (_, _) => (zero.clone(), zero),
            };
            if !record.has(spec.source_slot.name) {
                record.push(Field {
                    def: spec.source_slot,
                    value: source_value,
                    is_scope: false,
                });
            }
            if !record.has(spec.destination_slot.name) {
                record.push(Field {
                    def: spec.destination_slot,
                    value: destination_value,
                    is_scope: false,
                });
            }
        }
        AggregationFlowRecord {
            record,
            source_seen: matches!(side, RecordSide::Source | RecordSide::Both),
            destination_seen: matches!(side, RecordSide::Destination | RecordSide::Both),
        }
    }

    fn merge(&self, aggregate: &mut AggregationFlowRecord, record: &DataRecord, side: RecordSide) {
        // fill values the other observation point could not know
        for name in &self.correlate_fields {
            let Some(incoming) = record.value(name) else {
                continue;
            };
            if incoming.is_empty() {
                continue;
            }
            match aggregate.record.get_mut(name) {
                Some(field) if field.value.is_empty() => field.value = incoming.clone(),
                Some(_) => (),
                None => {
                    if let Some(field) = record.get(name) {
                        aggregate.record.push(field.clone());
                    }
                }
            }
        }

        for name in &self.non_stats_elements {
            let Some(incoming) = record.value(name) else {
                continue;
            };
            match aggregate.record.get_mut(name) {
                Some(field) => field.value = incoming.clone(),
                None => {
                    if let Some(field) = record.get(name) {
                        aggregate.record.push(field.clone());
                    }
                }
            }
        }

        for spec in &self.stats {
            let Some(incoming) = record.value(&spec.name) else {
                continue;
            };
            match aggregate.record.get_mut(&spec.name) {
                Some(field) => match spec.kind {
                    StatsKind::Delta => field.value.accumulate(incoming),
                    StatsKind::Total => field.value.max_assign(incoming),
                },
                None => {
                    if let Some(field) = record.get(&spec.name) {
                        aggregate.record.push(field.clone());
                    }
                }
            }
            let slot = match side {
                RecordSide::Source => &spec.source_slot,
                RecordSide::Destination => &spec.destination_slot,
                // no side to attribute the counters to
                RecordSide::Both | RecordSide::Unknown => continue,
            };
            match aggregate.record.get_mut(slot.name) {
                Some(field) => match spec.kind {
                    StatsKind::Delta => field.value.accumulate(incoming),
                    StatsKind::Total => field.value.max_assign(incoming),
                },
                None => aggregate.record.push(Field {
                    def: *slot,
                    value: incoming.clone(),
                    is_scope: false,
                }),
            }
        }

        aggregate.source_seen |= matches!(side, RecordSide::Source | RecordSide::Both);
        aggregate.destination_seen |= matches!(side, RecordSide::Destination | RecordSide::Both);
    }
}

#[derive(Debug, Default)]
pub struct AggregatorCounter {
    pub records_in: AtomicU64,
    pub records_merged: AtomicU64,
    pub aggregates_created: AtomicU64,
    pub aggregates_live: AtomicU64,
    pub uncorrelatable: AtomicU64,
    pub uncorrelatable_dropped: AtomicU64,
}

impl RefCountable for AggregatorCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "records-in",
                CounterType::Counted,
                CounterValue::Unsigned(self.records_in.swap(0, Ordering::Relaxed)),
            ),
            (
                "records-merged",
                CounterType::Counted,
                CounterValue::Unsigned(self.records_merged.swap(0, Ordering::Relaxed)),
            ),
            (
                "aggregates-created",
                CounterType::Counted,
                CounterValue::Unsigned(self.aggregates_created.swap(0, Ordering::Relaxed)),
            ),
            (
                "aggregates-live",
                CounterType::Gauged,
                CounterValue::Unsigned(self.aggregates_live.load(Ordering::Relaxed)),
            ),
            (
                "uncorrelatable",
                CounterType::Counted,
                CounterValue::Unsigned(self.uncorrelatable.swap(0, Ordering::Relaxed)),
            ),
            (
                "uncorrelatable-dropped",
                CounterType::Counted,
                CounterValue::Unsigned(self.uncorrelatable_dropped.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

type FlowMap = HashMap<FlowKey, AggregationFlowRecord>;

// folds decoded data records into one bidirectional aggregate per 5-tuple
pub struct AggregationProcess {
    input: Arc<Receiver<Message>>,
    flow_map: Arc<RwLock<FlowMap>>,
    spec: Arc<MergeSpec>,
    // records without a complete 5-tuple, oldest shed first
    uncorrelatable: Arc<Mutex<VecDeque<DataRecord>>>,
    worker_count: usize,

    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,

    counter: Arc<AggregatorCounter>,
}

impl AggregationProcess {
    pub fn new(
        input: Receiver<Message>,
        config: AggregationConfig,
        registry: Arc<dyn Registry>,
    ) -> Result<Self> {
        config.validate().map_err(|e| Error::Config(e.to_string()))?;
        let spec = MergeSpec::resolve(&config, registry.as_ref())?;
        Ok(Self {
            input: Arc::new(input),
            flow_map: Arc::new(RwLock::new(HashMap::new())),
            spec: Arc::new(spec),
            uncorrelatable: Arc::new(Mutex::new(VecDeque::new())),
            worker_count: config.worker_count.max(1),
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(vec![]),
            counter: Arc::new(AggregatorCounter::default()),
        })
    }

    pub fn counter(&self) -> &Arc<AggregatorCounter> {
        &self.counter
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("aggregation process already started, do nothing");
            return;
        }
        let mut threads = self.threads.lock().unwrap();
        for id in 0..self.worker_count {
            let worker = AggregationWorker {
                id,
                input: self.input.clone(),
                flow_map: self.flow_map.clone(),
                spec: self.spec.clone(),
                uncorrelatable: self.uncorrelatable.clone(),
                running: self.running.clone(),
                counter: self.counter.clone(),
            };
            threads.push(
                thread::Builder::new()
                    .name(format!("aggregation-worker-{}", id))
                    .spawn(move || worker.run())
                    .unwrap(),
            );
        }
        info!("aggregation process started with {} workers", self.worker_count);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            warn!("aggregation process already stopped, do nothing");
            return;
        }
        for thread in self.threads.lock().unwrap().drain(..) {
            let _ = thread.join();
        }
        info!("aggregation process exited");
    }

    // the callback must not add or remove aggregates, it runs under the
    // shared lock
    pub fn for_all_records<F>(&self, mut visit: F)
    where
        F: FnMut(&FlowKey, &AggregationFlowRecord),
    {
        let flow_map = self.flow_map.read();
        for (key, record) in flow_map.iter() {
            visit(key, record);
        }
    }

    // the only way an aggregate leaves the map
    pub fn delete(&self, key: &FlowKey) -> bool {
        let removed = self.flow_map.write().remove(key).is_some();
        if removed {
            self.counter.aggregates_live.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn record_count(&self) -> usize {
        self.flow_map.read().len()
    }

    // records parked because their flow key was incomplete
    pub fn drain_uncorrelatable(&self) -> Vec<DataRecord> {
        self.uncorrelatable.lock().unwrap().drain(..).collect()
    }
}

impl Drop for AggregationProcess {
    fn drop(&mut self) {
        if self.running.load(Ordering::Relaxed) {
            self.stop();
        }
    }
}

struct AggregationWorker {
    id: usize,
    input: Arc<Receiver<Message>>,
    flow_map: Arc<RwLock<FlowMap>>,
    spec: Arc<MergeSpec>,
    uncorrelatable: Arc<Mutex<VecDeque<DataRecord>>>,
    running: Arc<AtomicBool>,
    counter: Arc<AggregatorCounter>,
}

impl AggregationWorker {
    fn run(self) {
        let mut batch = Vec::with_capacity(QUEUE_BATCH_SIZE);
        while self.running.load(Ordering::Relaxed) {
            match self.input.recv_all(&mut batch, Some(RCV_TIMEOUT)) {
                Ok(()) => {
                    for message in batch.drain(..) {
                        self.handle_message(message);
                    }
                }
                Err(queue::Error::Timeout) => continue,
                Err(_) => break,
            }
        }
        info!("aggregation worker {} exited", self.id);
    }

    fn handle_message(&self, message: Message) {
        for set in message.sets {
            if let Set::Data { records, .. } = set {
                for record in records {
                    self.aggregate(record);
                }
            }
        }
    }

    fn aggregate(&self, record: DataRecord) {
        self.counter.records_in.fetch_add(1, Ordering::Relaxed);
        let Some(key) = FlowKey::from_record(&record) else {
            self.counter.uncorrelatable.fetch_add(1, Ordering::Relaxed);
            debug!("record without a complete flow key, parking");
            let mut parked = self.uncorrelatable.lock().unwrap();
            if parked.len() >= UNCORRELATABLE_BACKLOG {
                parked.pop_front();
                self.counter
                    .uncorrelatable_dropped
                    .fetch_add(1, Ordering::Relaxed);
            }
            parked.push_back(record);
            return;
        };
        let side = detect_side(&record);

        let mut flow_map = self.flow_map.write();
        match flow_map.get_mut(&key) {
            Some(aggregate) => {
                self.spec.merge(aggregate, &record, side);
                self.counter.records_merged.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                flow_map.insert(key, self.spec.new_aggregate(record, side));
                self.counter
                    .aggregates_created
                    .fetch_add(1, Ordering::Relaxed);
                self.counter.aggregates_live.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, Instant};

    use crate::registry::IpfixRegistry;

    use super::*;

    fn registry() -> Arc<IpfixRegistry> {
        Arc::new(IpfixRegistry::load())
    }

    fn spec() -> MergeSpec {
        MergeSpec::resolve(&AggregationConfig::default(), &*registry()).unwrap()
    }

    fn field(name: &str, value: FieldValue) -> Field {
        Field {
            def: IpfixRegistry::load().element_by_name(name).unwrap(),
            value,
            is_scope: false,
        }
    }

    // the flow of the seed scenarios: 10.0.0.1:1234 -> 10.0.0.2:5678/tcp
    fn base_record() -> DataRecord {
        let mut record = DataRecord::default();
        record.push(field(
            "sourceIPv4Address",
            FieldValue::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
        ));
        record.push(field(
            "destinationIPv4Address",
            FieldValue::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))),
        ));
        record.push(field("protocolIdentifier", FieldValue::Unsigned8(6)));
        record.push(field("sourceTransportPort", FieldValue::Unsigned16(1234)));
        record.push(field(
            "destinationTransportPort",
            FieldValue::Unsigned16(5678),
        ));
        record
    }

    // what the destination node exports before correlation
    fn destination_record() -> DataRecord {
        let mut record = base_record();
        record.push(field("flowEndSeconds", FieldValue::DateTimeSeconds(100)));
        record.push(field("packetTotalCount", FieldValue::Unsigned64(1000)));
        record.push(field("packetDeltaCount", FieldValue::Unsigned64(500)));
        record.push(field("sourcePodName", FieldValue::String(String::new())));
        record.push(field(
            "destinationPodName",
            FieldValue::String("pod2".to_owned()),
        ));
        record.push(field("destinationServicePort", FieldValue::Unsigned16(0)));
        record.push(field(
            "destinationClusterIPv4",
            FieldValue::Ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        ));
        record.push(field(
            "reversePacketTotalCount",
            FieldValue::Unsigned64(400),
        ));
        record.push(field(
            "reversePacketDeltaCount",
            FieldValue::Unsigned64(200),
        ));
        record
    }

    fn source_record() -> DataRecord {
        let mut record = base_record();
        record.push(field("flowEndSeconds", FieldValue::DateTimeSeconds(200)));
        record.push(field("packetTotalCount", FieldValue::Unsigned64(800)));
        record.push(field("packetDeltaCount", FieldValue::Unsigned64(500)));
        record.push(field(
            "sourcePodName",
            FieldValue::String("pod1".to_owned()),
        ));
        record.push(field("destinationPodName", FieldValue::String(String::new())));
        record.push(field(
            "destinationServicePort",
            FieldValue::Unsigned16(4739),
        ));
        record.push(field(
            "destinationClusterIPv4",
            FieldValue::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3))),
        ));
        record.push(field(
            "reversePacketTotalCount",
            FieldValue::Unsigned64(300),
        ));
        record.push(field(
            "reversePacketDeltaCount",
            FieldValue::Unsigned64(150),
        ));
        record
    }

    fn value_u64(aggregate: &AggregationFlowRecord, name: &str) -> u64 {
        aggregate.record.value(name).unwrap().as_u64().unwrap()
    }

    #[test]
    fn first_record_creates_one_sided_aggregate() {
        let spec = spec();
        let record = destination_record();
        let aggregate = spec.new_aggregate(record.clone(), detect_side(&record));
        assert!(aggregate.destination_seen);
        assert!(!aggregate.source_seen);
        assert_eq!(value_u64(&aggregate, "packetTotalCount"), 1000);
        assert_eq!(
            value_u64(&aggregate, "packetTotalCountFromDestinationNode"),
            1000
        );
        assert_eq!(value_u64(&aggregate, "packetTotalCountFromSourceNode"), 0);
        assert_eq!(
            aggregate.record.value("destinationPodName").unwrap().as_str(),
            Some("pod2")
        );
    }

    #[test]
    fn second_record_completes_correlation() {
        let spec = spec();
        let first = destination_record();
        let mut aggregate = spec.new_aggregate(first.clone(), detect_side(&first));
        let second = source_record();
        spec.merge(&mut aggregate, &second, detect_side(&second));

        assert!(aggregate.source_seen && aggregate.destination_seen);
        // totals take the max, deltas add up
        assert_eq!(value_u64(&aggregate, "packetTotalCount"), 1000);
        assert_eq!(value_u64(&aggregate, "packetDeltaCount"), 1000);
        assert_eq!(value_u64(&aggregate, "reversePacketTotalCount"), 400);
        assert_eq!(value_u64(&aggregate, "reversePacketDeltaCount"), 350);
        // per-side provenance
        assert_eq!(value_u64(&aggregate, "packetTotalCountFromSourceNode"), 800);
        assert_eq!(
            value_u64(&aggregate, "packetTotalCountFromDestinationNode"),
            1000
        );
        assert_eq!(
            value_u64(&aggregate, "reversePacketTotalCountFromSourceNode"),
            300
        );
        assert_eq!(
            value_u64(&aggregate, "reversePacketDeltaCountFromDestinationNode"),
            200
        );
        // correlated metadata from both sides
        assert_eq!(
            aggregate.record.value("sourcePodName").unwrap().as_str(),
            Some("pod1")
        );
        assert_eq!(
            aggregate.record.value("destinationPodName").unwrap().as_str(),
            Some("pod2")
        );
        assert_eq!(value_u64(&aggregate, "destinationServicePort"), 4739);
        assert_eq!(
            aggregate
                .record
                .value("destinationClusterIPv4")
                .unwrap()
                .as_ip(),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)))
        );
        // last writer wins
        assert_eq!(value_u64(&aggregate, "flowEndSeconds"), 200);
    }

    #[test]
    fn merge_is_commutative_for_deltas_and_correlate_fields() {
        let spec = spec();
        let r1 = destination_record();
        let r2 = source_record();

        let mut forward = spec.new_aggregate(r1.clone(), detect_side(&r1));
        spec.merge(&mut forward, &r2, detect_side(&r2));
        let mut backward = spec.new_aggregate(r2.clone(), detect_side(&r2));
        spec.merge(&mut backward, &r1, detect_side(&r1));

        for name in [
            "packetTotalCount",
            "packetDeltaCount",
            "reversePacketTotalCount",
            "reversePacketDeltaCount",
            "packetTotalCountFromSourceNode",
            "packetDeltaCountFromSourceNode",
            "packetTotalCountFromDestinationNode",
            "packetDeltaCountFromDestinationNode",
        ] {
            assert_eq!(
                value_u64(&forward, name),
                value_u64(&backward, name),
                "{} differs by merge order",
                name
            );
        }
        assert_eq!(
            forward.record.value("sourcePodName"),
            backward.record.value("sourcePodName")
        );
        assert_eq!(
            forward.record.value("destinationServicePort"),
            backward.record.value("destinationServicePort")
        );
    }

    #[test]
    fn repeated_record_is_idempotent_for_correlation_only() {
        let spec = spec();
        let record = source_record();
        let mut aggregate = spec.new_aggregate(record.clone(), detect_side(&record));
        spec.merge(&mut aggregate, &record, detect_side(&record));

        // correlate fields unchanged
        assert_eq!(
            aggregate.record.value("sourcePodName").unwrap().as_str(),
            Some("pod1")
        );
        assert_eq!(value_u64(&aggregate, "destinationServicePort"), 4739);
        // stats reflect two contributions
        assert_eq!(value_u64(&aggregate, "packetDeltaCount"), 1000);
        assert_eq!(value_u64(&aggregate, "packetDeltaCountFromSourceNode"), 1000);
        assert_eq!(value_u64(&aggregate, "packetTotalCount"), 800);
    }

    #[test]
    fn pre_correlated_record_sets_both_sides() {
        let spec = spec();
        let mut record = source_record();
        record.get_mut("destinationPodName").unwrap().value =
            FieldValue::String("pod2".to_owned());
        assert_eq!(detect_side(&record), RecordSide::Both);
        let aggregate = spec.new_aggregate(record.clone(), RecordSide::Both);
        assert!(aggregate.source_seen && aggregate.destination_seen);
        // nothing attributable to a single side
        assert_eq!(value_u64(&aggregate, "packetTotalCountFromSourceNode"), 0);
        assert_eq!(
            value_u64(&aggregate, "packetTotalCountFromDestinationNode"),
            0
        );
    }

    fn process_with_input() -> (AggregationProcess, queue::Sender<Message>) {
        let (sender, receiver, _) = queue::bounded(16);
        let process =
            AggregationProcess::new(receiver, AggregationConfig::default(), registry()).unwrap();
        (process, sender)
    }

    fn data_message(records: Vec<DataRecord>) -> Message {
        Message {
            header: crate::common::MessageHeader {
                version: 10,
                length: 0,
                export_time: 0,
                sequence_number: 0,
                obs_domain_id: 1,
            },
            sets: vec![Set::Data {
                template_id: 256,
                records,
            }],
        }
    }

    fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn workers_fold_messages_from_the_queue() {
        let (process, sender) = process_with_input();
        process.start();
        sender
            .send(data_message(vec![destination_record()]))
            .unwrap();
        sender.send(data_message(vec![source_record()])).unwrap();

        wait_for("both sides to be merged", || {
            let mut correlated = false;
            process.for_all_records(|_, aggregate| {
                correlated = aggregate.source_seen && aggregate.destination_seen;
            });
            correlated
        });
        assert_eq!(process.record_count(), 1);
        process.stop();

        let key = FlowKey::from_record(&base_record()).unwrap();
        let mut seen = None;
        process.for_all_records(|k, aggregate| {
            seen = Some((k.clone(), aggregate.record.fields.len()))
        });
        assert_eq!(seen.as_ref().unwrap().0, key);
        assert!(process.delete(&key));
        assert!(!process.delete(&key));
        assert_eq!(process.record_count(), 0);
    }

    #[test]
    fn incomplete_key_is_parked() {
        let (process, sender) = process_with_input();
        process.start();
        let mut record = DataRecord::default();
        record.push(field("packetTotalCount", FieldValue::Unsigned64(1)));
        sender.send(data_message(vec![record])).unwrap();
        wait_for("record to be parked", || {
            process.counter().uncorrelatable.load(Ordering::Relaxed) == 1
        });
        process.stop();
        assert_eq!(process.record_count(), 0);
        assert_eq!(process.drain_uncorrelatable().len(), 1);
    }
}
