use std::collections::HashMap;

use num_enum::TryFromPrimitive;

use crate::consts::{
    IANA_ENTERPRISE_ID, REVERSE_ENTERPRISE_ID, VARIABLE_LENGTH, VENDOR_ENTERPRISE_ID,
};

// abstract data types of RFC 5610 §3.1, by registered code
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum DataType {
    OctetArray = 0,
    Unsigned8 = 1,
    Unsigned16 = 2,
    Unsigned32 = 3,
    Unsigned64 = 4,
    Signed8 = 5,
    Signed16 = 6,
    Signed32 = 7,
    Signed64 = 8,
    Float32 = 9,
    Float64 = 10,
    Boolean = 11,
    MacAddress = 12,
    String = 13,
    DateTimeSeconds = 14,
    DateTimeMilliseconds = 15,
    DateTimeMicroseconds = 16,
    DateTimeNanoseconds = 17,
    Ipv4Address = 18,
    Ipv6Address = 19,
    BasicList = 20,
    SubTemplateList = 21,
    SubTemplateMultiList = 22,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InfoElement {
    pub name: &'static str,
    pub element_id: u16,
    pub enterprise_id: u32,
    pub data_type: DataType,
    pub length: u16,
}

pub trait Registry: Send + Sync {
    fn name_from_id(&self, enterprise_id: u32, element_id: u16) -> Option<&'static str>;
    fn element_by_name(&self, name: &str) -> Option<InfoElement>;

    fn element_from_id(&self, enterprise_id: u32, element_id: u16) -> Option<InfoElement> {
        self.name_from_id(enterprise_id, element_id)
            .and_then(|name| self.element_by_name(name))
    }
}

const fn ie(
    name: &'static str,
    element_id: u16,
    enterprise_id: u32,
    data_type: DataType,
    length: u16,
) -> InfoElement {
    InfoElement {
        name,
        element_id,
        enterprise_id,
        data_type,
        length,
    }
}

// curated IANA subset, enough for flow 5-tuples, counters and timestamps
#[rustfmt::skip]
const IANA_ELEMENTS: &[InfoElement] = &[
    ie("octetDeltaCount",          1, IANA_ENTERPRISE_ID, DataType::Unsigned64, 8),
    ie("packetDeltaCount",         2, IANA_ENTERPRISE_ID, DataType::Unsigned64, 8),
    ie("protocolIdentifier",       4, IANA_ENTERPRISE_ID, DataType::Unsigned8, 1),
    ie("ipClassOfService",         5, IANA_ENTERPRISE_ID, DataType::Unsigned8, 1),
    ie("tcpControlBits",           6, IANA_ENTERPRISE_ID, DataType::Unsigned16, 2),
    ie("sourceTransportPort",      7, IANA_ENTERPRISE_ID, DataType::Unsigned16, 2),
    ie("sourceIPv4Address",        8, IANA_ENTERPRISE_ID, DataType::Ipv4Address, 4),
    ie("ingressInterface",        10, IANA_ENTERPRISE_ID, DataType::Unsigned32, 4),
    ie("destinationTransportPort",11, IANA_ENTERPRISE_ID, DataType::Unsigned16, 2),
    ie("destinationIPv4Address",  12, IANA_ENTERPRISE_ID, DataType::Ipv4Address, 4),
    ie("egressInterface",         14, IANA_ENTERPRISE_ID, DataType::Unsigned32, 4),
    ie("sourceIPv6Address",       27, IANA_ENTERPRISE_ID, DataType::Ipv6Address, 16),
    ie("destinationIPv6Address",  28, IANA_ENTERPRISE_ID, DataType::Ipv6Address, 16),
    ie("icmpTypeCodeIPv4",        32, IANA_ENTERPRISE_ID, DataType::Unsigned16, 2),
    ie("minimumTTL",              52, IANA_ENTERPRISE_ID, DataType::Unsigned8, 1),
    ie("maximumTTL",              53, IANA_ENTERPRISE_ID, DataType::Unsigned8, 1),
    ie("sourceMacAddress",        56, IANA_ENTERPRISE_ID, DataType::MacAddress, 6),
    ie("destinationMacAddress",   80, IANA_ENTERPRISE_ID, DataType::MacAddress, 6),
    ie("octetTotalCount",         85, IANA_ENTERPRISE_ID, DataType::Unsigned64, 8),
    ie("packetTotalCount",        86, IANA_ENTERPRISE_ID, DataType::Unsigned64, 8),
    ie("flowEndReason",          136, IANA_ENTERPRISE_ID, DataType::Unsigned8, 1),
    ie("flowId",                 148, IANA_ENTERPRISE_ID, DataType::Unsigned64, 8),
    ie("flowStartSeconds",       150, IANA_ENTERPRISE_ID, DataType::DateTimeSeconds, 4),
    ie("flowEndSeconds",         151, IANA_ENTERPRISE_ID, DataType::DateTimeSeconds, 4),
    ie("flowStartMilliseconds",  152, IANA_ENTERPRISE_ID, DataType::DateTimeMilliseconds, 8),
    ie("flowEndMilliseconds",    153, IANA_ENTERPRISE_ID, DataType::DateTimeMilliseconds, 8),
];

// reverse-direction counterparts registered under the RFC 5103 PEN
#[rustfmt::skip]
const REVERSE_ELEMENTS: &[InfoElement] = &[
    ie("reverseOctetDeltaCount",   1, REVERSE_ENTERPRISE_ID, DataType::Unsigned64, 8),
    ie("reversePacketDeltaCount",  2, REVERSE_ENTERPRISE_ID, DataType::Unsigned64, 8),
    ie("reverseOctetTotalCount",  85, REVERSE_ENTERPRISE_ID, DataType::Unsigned64, 8),
    ie("reversePacketTotalCount", 86, REVERSE_ENTERPRISE_ID, DataType::Unsigned64, 8),
];

#[rustfmt::skip]
const VENDOR_ELEMENTS: &[InfoElement] = &[
    ie("sourcePodNamespace",          100, VENDOR_ENTERPRISE_ID, DataType::String, VARIABLE_LENGTH),
    ie("sourcePodName",               101, VENDOR_ENTERPRISE_ID, DataType::String, VARIABLE_LENGTH),
    ie("destinationPodNamespace",     102, VENDOR_ENTERPRISE_ID, DataType::String, VARIABLE_LENGTH),
    ie("destinationPodName",          103, VENDOR_ENTERPRISE_ID, DataType::String, VARIABLE_LENGTH),
    ie("sourceNodeName",              104, VENDOR_ENTERPRISE_ID, DataType::String, VARIABLE_LENGTH),
    ie("destinationNodeName",         105, VENDOR_ENTERPRISE_ID, DataType::String, VARIABLE_LENGTH),
    ie("destinationClusterIPv4",      106, VENDOR_ENTERPRISE_ID, DataType::Ipv4Address, 4),
    ie("destinationClusterIPv6",      107, VENDOR_ENTERPRISE_ID, DataType::Ipv6Address, 16),
    ie("destinationServicePort",      108, VENDOR_ENTERPRISE_ID, DataType::Unsigned16, 2),
    ie("destinationServicePortName",  109, VENDOR_ENTERPRISE_ID, DataType::String, VARIABLE_LENGTH),
    ie("flowType",                    137, VENDOR_ENTERPRISE_ID, DataType::Unsigned8, 1),
    ie("packetTotalCountFromSourceNode",              120, VENDOR_ENTERPRISE_ID, DataType::Unsigned64, 8),
    ie("packetDeltaCountFromSourceNode",              121, VENDOR_ENTERPRISE_ID, DataType::Unsigned64, 8),
    ie("reversePacketTotalCountFromSourceNode",       122, VENDOR_ENTERPRISE_ID, DataType::Unsigned64, 8),
    ie("reversePacketDeltaCountFromSourceNode",       123, VENDOR_ENTERPRISE_ID, DataType::Unsigned64, 8),
    ie("packetTotalCountFromDestinationNode",         124, VENDOR_ENTERPRISE_ID, DataType::Unsigned64, 8),
    ie("packetDeltaCountFromDestinationNode",         125, VENDOR_ENTERPRISE_ID, DataType::Unsigned64, 8),
    ie("reversePacketTotalCountFromDestinationNode",  126, VENDOR_ENTERPRISE_ID, DataType::Unsigned64, 8),
    ie("reversePacketDeltaCountFromDestinationNode",  127, VENDOR_ENTERPRISE_ID, DataType::Unsigned64, 8),
];

pub struct IpfixRegistry {
    by_id: HashMap<(u32, u16), InfoElement>,
    by_name: HashMap<&'static str, InfoElement>,
}

impl IpfixRegistry {
    pub fn load() -> Self {
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for table in [IANA_ELEMENTS, REVERSE_ELEMENTS, VENDOR_ELEMENTS] {
            for element in table {
                by_id.insert((element.enterprise_id, element.element_id), *element);
                by_name.insert(element.name, *element);
            }
        }
        Self { by_id, by_name }
    }
}

impl Registry for IpfixRegistry {
    fn name_from_id(&self, enterprise_id: u32, element_id: u16) -> Option<&'static str> {
        self.by_id
            .get(&(enterprise_id, element_id))
            .map(|element| element.name)
    }

    fn element_by_name(&self, name: &str) -> Option<InfoElement> {
        self.by_name.get(name).copied()
    }

    fn element_from_id(&self, enterprise_id: u32, element_id: u16) -> Option<InfoElement> {
        self.by_id.get(&(enterprise_id, element_id)).copied()
    }
}
