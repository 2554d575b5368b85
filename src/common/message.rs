use crate::consts::VARIABLE_LENGTH;
use crate::registry::InfoElement;

use super::field_value::FieldValue;

/*
from RFC 7011 §3.1

 0                   1                   2                   3
 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
|       Version Number          |            Length             |
+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
|                           Export Time                         |
+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
|                       Sequence Number                         |
+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
|                    Observation Domain ID                      |
+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u16,
    pub length: u16,
    pub export_time: u32,
    pub sequence_number: u32,
    pub obs_domain_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateField {
    pub element_id: u16,
    pub element_length: u16,
    pub enterprise_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRecord {
    pub template_id: u16,
    // non-zero only for options templates, scope fields lead the list
    pub scope_field_count: u16,
    pub fields: Vec<TemplateField>,
}

impl TemplateRecord {
    pub fn is_options(&self) -> bool {
        self.scope_field_count > 0
    }

    // smallest number of octets a data record of this template can occupy,
    // variable-length fields contribute their one length octet
    pub fn min_record_length(&self) -> usize {
        self.fields
            .iter()
            .map(|f| {
                if f.element_length == VARIABLE_LENGTH {
                    1
                } else {
                    f.element_length as usize
                }
            })
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub def: InfoElement,
    pub value: FieldValue,
    pub is_scope: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataRecord {
    pub fields: Vec<Field>,
}

impl DataRecord {
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.def.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.def.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        self.get(name).map(|f| &f.value)
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, field: Field) {
        self.fields.push(field);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Set {
    Template(Vec<TemplateRecord>),
    OptionsTemplate(Vec<TemplateRecord>),
    Data {
        template_id: u16,
        records: Vec<DataRecord>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub sets: Vec<Set>,
}

impl Message {
    pub fn data_record_count(&self) -> usize {
        self.sets
            .iter()
            .map(|set| match set {
                Set::Data { records, .. } => records.len(),
                _ => 0,
            })
            .sum()
    }
}
