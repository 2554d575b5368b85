use std::time::Duration;

pub const IPFIX_VERSION: u16 = 10;
pub const MESSAGE_HEADER_LENGTH: usize = 16;
pub const SET_HEADER_LENGTH: usize = 4;

// set ids 0-1 are reserved, 2 is the template set, 3 the options template
// set, 4-255 are reserved for future use
pub const TEMPLATE_SET_ID: u16 = 2;
pub const OPTIONS_TEMPLATE_SET_ID: u16 = 3;
pub const MIN_DATA_SET_ID: u16 = 256;

// element length announcing the variable-length encoding of RFC 7011 §7
pub const VARIABLE_LENGTH: u16 = 0xffff;
// high bit of the element id in template records flags an enterprise number
pub const ENTERPRISE_BIT: u16 = 0x8000;

pub const IANA_ENTERPRISE_ID: u32 = 0;
// reverse-direction information elements per RFC 5103
pub const REVERSE_ENTERPRISE_ID: u32 = 29305;
pub const VENDOR_ENTERPRISE_ID: u32 = 56506;

pub const RCV_TIMEOUT: Duration = Duration::from_secs(1);
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const QUEUE_BATCH_SIZE: usize = 1024;

pub const DEFAULT_COLLECTOR_PORT: u16 = 4739;
pub const DEFAULT_MESSAGE_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_MAX_BUFFER_SIZE: u16 = 65535;
pub const DEFAULT_WORKER_COUNT: usize = 2;

pub const UNCORRELATABLE_BACKLOG: usize = 256;
