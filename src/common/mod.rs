pub mod field_value;
pub mod flow_key;
pub mod message;

pub use field_value::FieldValue;
pub use flow_key::FlowKey;
pub use message::{DataRecord, Field, Message, MessageHeader, Set, TemplateField, TemplateRecord};
