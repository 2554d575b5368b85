use std::fmt;
use std::net::IpAddr;

use super::message::DataRecord;

// 5-tuple bucketing records into flows for aggregation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    // None when any of the five components is missing, such records
    // cannot be correlated
    pub fn from_record(record: &DataRecord) -> Option<FlowKey> {
        let src_addr = record
            .value("sourceIPv4Address")
            .or_else(|| record.value("sourceIPv6Address"))
            .and_then(|v| v.as_ip())?;
        let dst_addr = record
            .value("destinationIPv4Address")
            .or_else(|| record.value("destinationIPv6Address"))
            .and_then(|v| v.as_ip())?;
        let protocol = match record.value("protocolIdentifier")?.as_u64()? {
            p @ 0..=255 => p as u8,
            _ => return None,
        };
        let src_port = record.value("sourceTransportPort")?.as_u64()? as u16;
        let dst_port = record.value("destinationTransportPort")?.as_u64()? as u16;
        Some(FlowKey {
            src_addr,
            dst_addr,
            protocol,
            src_port,
            dst_port,
        })
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto {}",
            self.src_addr, self.src_port, self.dst_addr, self.dst_port, self.protocol
        )
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::common::{Field, FieldValue};
    use crate::registry::{IpfixRegistry, Registry};

    use super::*;

    fn field(registry: &IpfixRegistry, name: &str, value: FieldValue) -> Field {
        Field {
            def: registry.element_by_name(name).unwrap(),
            value,
            is_scope: false,
        }
    }

    #[test]
    fn extraction() {
        let registry = IpfixRegistry::load();
        let mut record = DataRecord::default();
        record.push(field(
            &registry,
            "sourceIPv4Address",
            FieldValue::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
        ));
        record.push(field(
            &registry,
            "destinationIPv4Address",
            FieldValue::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))),
        ));
        record.push(field(
            &registry,
            "protocolIdentifier",
            FieldValue::Unsigned8(6),
        ));
        record.push(field(
            &registry,
            "sourceTransportPort",
            FieldValue::Unsigned16(1234),
        ));

        // destination port still missing
        assert_eq!(FlowKey::from_record(&record), None);

        record.push(field(
            &registry,
            "destinationTransportPort",
            FieldValue::Unsigned16(5678),
        ));
        let key = FlowKey::from_record(&record).unwrap();
        assert_eq!(key.protocol, 6);
        assert_eq!(key.src_port, 1234);
        assert_eq!(key.dst_port, 5678);
        assert_eq!(key.to_string(), "10.0.0.1:1234 -> 10.0.0.2:5678 proto 6");
    }
}
