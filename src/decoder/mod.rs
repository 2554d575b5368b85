mod template_cache;

pub use template_cache::TemplateCache;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use log::{debug, warn};

use crate::common::{
    DataRecord, Field, FieldValue, Message, MessageHeader, Set, TemplateField, TemplateRecord,
};
use crate::consts::{
    ENTERPRISE_BIT, IPFIX_VERSION, MESSAGE_HEADER_LENGTH, MIN_DATA_SET_ID,
    OPTIONS_TEMPLATE_SET_ID, SET_HEADER_LENGTH, TEMPLATE_SET_ID, VARIABLE_LENGTH,
};
use crate::error::{Error, Result};
use crate::registry::{DataType, InfoElement, Registry};
use crate::utils::bytes::{
    read_f32_be, read_f64_be, read_int_be, read_u16_be, read_u32_be, read_uint_be,
};
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Truncated(what));
        }
        let bs = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bs)
    }

    fn take_u16(&mut self, what: &'static str) -> Result<u16> {
        Ok(read_u16_be(self.take(2, what)?))
    }

    fn take_u32(&mut self, what: &'static str) -> Result<u32> {
        Ok(read_u32_be(self.take(4, what)?))
    }
}

#[derive(Debug, Default)]
pub struct DecoderCounter {
    pub unknown_template: AtomicU64,
    pub expired_template: AtomicU64,
    pub registry_misses: AtomicU64,
    pub skipped_sets: AtomicU64,
}

impl RefCountable for DecoderCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "unknown-template",
                CounterType::Counted,
                CounterValue::Unsigned(self.unknown_template.swap(0, Ordering::Relaxed)),
            ),
            (
                "expired-template",
                CounterType::Counted,
                CounterValue::Unsigned(self.expired_template.swap(0, Ordering::Relaxed)),
            ),
            (
                "registry-misses",
                CounterType::Counted,
                CounterValue::Unsigned(self.registry_misses.swap(0, Ordering::Relaxed)),
            ),
            (
                "skipped-sets",
                CounterType::Counted,
                CounterValue::Unsigned(self.skipped_sets.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

// template driven IPFIX message decoder, shared by all ingest workers
pub struct MessageDecoder {
    templates: Arc<TemplateCache>,
    registry: Arc<dyn Registry>,
    counter: Arc<DecoderCounter>,
}

impl MessageDecoder {
    pub fn new(templates: Arc<TemplateCache>, registry: Arc<dyn Registry>) -> Self {
        Self {
            templates,
            registry,
            counter: Arc::new(DecoderCounter::default()),
        }
    }

    pub fn counter(&self) -> &Arc<DecoderCounter> {
        &self.counter
    }

    pub fn templates(&self) -> &Arc<TemplateCache> {
        &self.templates
    }

    // decodes exactly one message, the input must hold the whole of it
    pub fn decode(&self, buf: &[u8]) -> Result<Message> {
        let header = Self::decode_header(buf)?;
        let mut cur = Cursor::new(&buf[MESSAGE_HEADER_LENGTH..header.length as usize]);

        let mut sets = Vec::new();
        // remembers a set skipped for a missing template so a message that
        // decoded nothing at all can report why
        let mut first_skip = None;
        while cur.remaining() > 0 {
            if cur.remaining() < SET_HEADER_LENGTH {
                return Err(Error::Malformed(format!(
                    "{} trailing bytes after last set",
                    cur.remaining()
                )));
            }
            let set_id = cur.take_u16("set id")?;
            let set_length = cur.take_u16("set length")? as usize;
            if set_length < SET_HEADER_LENGTH {
                return Err(Error::Malformed(format!("set length {} below minimum", set_length)));
            }
            let body_length = set_length - SET_HEADER_LENGTH;
            if body_length > cur.remaining() {
                return Err(Error::Malformed(format!(
                    "set length {} exceeds message bounds",
                    set_length
                )));
            }
            let body = cur.take(body_length, "set body")?;
            match set_id {
                TEMPLATE_SET_ID => {
                    let records = self.decode_template_set(body, header.obs_domain_id, false)?;
                    sets.push(Set::Template(records));
                }
                OPTIONS_TEMPLATE_SET_ID => {
                    let records = self.decode_template_set(body, header.obs_domain_id, true)?;
                    sets.push(Set::OptionsTemplate(records));
                }
                id if id >= MIN_DATA_SET_ID => {
                    match self.decode_data_set(body, header.obs_domain_id, id) {
                        Ok(records) => sets.push(Set::Data {
                            template_id: id,
                            records,
                        }),
                        Err(e @ Error::UnknownTemplate(..)) => {
                            self.counter.unknown_template.fetch_add(1, Ordering::Relaxed);
                            debug!("skipping data set: {}", e);
                            first_skip.get_or_insert(e);
                        }
                        Err(e @ Error::TemplateExpired(..)) => {
                            self.counter.expired_template.fetch_add(1, Ordering::Relaxed);
                            debug!("skipping data set: {}", e);
                            first_skip.get_or_insert(e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                id => {
                    // 0, 1 and 4-255 are reserved
                    self.counter.skipped_sets.fetch_add(1, Ordering::Relaxed);
                    warn!("skipping set with reserved id {}", id);
                }
            }
        }

        if sets.is_empty() {
            if let Some(e) = first_skip {
                return Err(e);
            }
        }
        Ok(Message { header, sets })
    }

    fn decode_header(buf: &[u8]) -> Result<MessageHeader> {
        let mut cur = Cursor::new(buf);
        let version = cur.take_u16("message header")?;
        if version != IPFIX_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let length = cur.take_u16("message header")?;
        let export_time = cur.take_u32("message header")?;
        let sequence_number = cur.take_u32("message header")?;
        let obs_domain_id = cur.take_u32("message header")?;
        if (length as usize) < MESSAGE_HEADER_LENGTH {
            return Err(Error::Malformed(format!(
                "message length {} below header size",
                length
            )));
        }
        if buf.len() < length as usize {
            return Err(Error::Truncated("message body"));
        }
        Ok(MessageHeader {
            version,
            length,
            export_time,
            sequence_number,
            obs_domain_id,
        })
    }

    fn decode_template_set(
        &self,
        body: &[u8],
        obs_domain_id: u32,
        options: bool,
    ) -> Result<Vec<TemplateRecord>> {
        let record_header = if options { 6 } else { 4 };
        let mut cur = Cursor::new(body);
        let mut records = Vec::new();
        while cur.remaining() >= record_header {
            let template_id = cur.take_u16("template id")?;
            if template_id < MIN_DATA_SET_ID {
                return Err(Error::Malformed(format!(
                    "template id {} is in the reserved range",
                    template_id
                )));
            }
            let field_count = cur.take_u16("field count")?;
            if field_count == 0 {
                return Err(Error::Malformed(format!(
                    "template {} has no fields",
                    template_id
                )));
            }
            let scope_field_count = if options {
                let scope_field_count = cur.take_u16("scope field count")?;
                if scope_field_count == 0 || scope_field_count > field_count {
                    return Err(Error::Malformed(format!(
                        "options template {} scope count {} out of range",
                        template_id, scope_field_count
                    )));
                }
                scope_field_count
            } else {
                0
            };

            let mut fields = Vec::with_capacity(field_count as usize);
            for _ in 0..field_count {
                let raw_id = cur.take_u16("template field")?;
                let element_length = cur.take_u16("template field")?;
                let (element_id, enterprise_id) = if raw_id & ENTERPRISE_BIT != 0 {
                    (raw_id & !ENTERPRISE_BIT, cur.take_u32("enterprise id")?)
                } else {
                    (raw_id, 0)
                };
                fields.push(TemplateField {
                    element_id,
                    element_length,
                    enterprise_id,
                });
            }
            let record = TemplateRecord {
                template_id,
                scope_field_count,
                fields,
            };
            self.templates.put(obs_domain_id, record.clone());
            records.push(record);
        }
        if records.is_empty() {
            return Err(Error::Malformed("template set without records".to_owned()));
        }
        // anything shorter than a record header is padding
        Ok(records)
    }

    fn decode_data_set(
        &self,
        body: &[u8],
        obs_domain_id: u32,
        set_id: u16,
    ) -> Result<Vec<DataRecord>> {
        let template = self.templates.get(obs_domain_id, set_id)?;
        let min_length = template.min_record_length();
        if min_length == 0 {
            return Err(Error::Malformed(format!(
                "template {} has zero length records",
                set_id
            )));
        }
        let mut cur = Cursor::new(body);
        let mut records = Vec::new();
        // everything shorter than the smallest possible record is padding
        while cur.remaining() >= min_length {
            let mut record = DataRecord::default();
            for (i, field) in template.fields.iter().enumerate() {
                let is_scope = (i as u16) < template.scope_field_count;
                record.push(self.decode_field(&mut cur, field, is_scope)?);
            }
            records.push(record);
        }
        Ok(records)
    }

    fn decode_field(
        &self,
        cur: &mut Cursor,
        field: &TemplateField,
        is_scope: bool,
    ) -> Result<Field> {
        let def = match self
            .registry
            .element_from_id(field.enterprise_id, field.element_id)
        {
            Some(def) => def,
            None => {
                // unknown elements are carried through as raw octets
                self.counter.registry_misses.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "element ({}, {}) not in registry, passing value through as octets",
                    field.enterprise_id, field.element_id
                );
                InfoElement {
                    name: "",
                    element_id: field.element_id,
                    enterprise_id: field.enterprise_id,
                    data_type: DataType::OctetArray,
                    length: field.element_length,
                }
            }
        };
        let value = self.decode_value(cur, field.element_length, def.data_type)?;
        Ok(Field {
            def,
            value,
            is_scope,
        })
    }

    fn decode_value(
        &self,
        cur: &mut Cursor,
        element_length: u16,
        data_type: DataType,
    ) -> Result<FieldValue> {
        let length = if element_length == VARIABLE_LENGTH {
            Self::decode_variable_length(cur)?
        } else {
            element_length as usize
        };
        let bs = cur.take(length, "field value")?;

        let fixed = |expected: usize| -> Result<()> {
            if length != expected {
                return Err(Error::Malformed(format!(
                    "{:?} value of {} octets, expected {}",
                    data_type, length, expected
                )));
            }
            Ok(())
        };
        let reduced = |max: usize| -> Result<()> {
            if length == 0 || length > max {
                return Err(Error::Malformed(format!(
                    "{:?} value of {} octets, expected 1 to {}",
                    data_type, length, max
                )));
            }
            Ok(())
        };

        let value = match data_type {
            DataType::OctetArray
            | DataType::BasicList
            | DataType::SubTemplateList
            | DataType::SubTemplateMultiList => FieldValue::Octets(bs.to_vec()),
            DataType::String => match std::str::from_utf8(bs) {
                Ok(s) => FieldValue::String(s.to_owned()),
                Err(_) => return Err(Error::Malformed("string value is not utf-8".to_owned())),
            },
            DataType::Unsigned8 => {
                fixed(1)?;
                FieldValue::Unsigned8(bs[0])
            }
            DataType::Unsigned16 => {
                reduced(2)?;
                FieldValue::Unsigned16(read_uint_be(bs) as u16)
            }
            DataType::Unsigned32 => {
                reduced(4)?;
                FieldValue::Unsigned32(read_uint_be(bs) as u32)
            }
            DataType::Unsigned64 => {
                reduced(8)?;
                FieldValue::Unsigned64(read_uint_be(bs))
            }
            DataType::Signed8 => {
                fixed(1)?;
                FieldValue::Signed8(bs[0] as i8)
            }
            DataType::Signed16 => {
                reduced(2)?;
                FieldValue::Signed16(read_int_be(bs) as i16)
            }
            DataType::Signed32 => {
                reduced(4)?;
                FieldValue::Signed32(read_int_be(bs) as i32)
            }
            DataType::Signed64 => {
                reduced(8)?;
                FieldValue::Signed64(read_int_be(bs))
            }
            DataType::Float32 => {
                fixed(4)?;
                FieldValue::Float32(read_f32_be(bs))
            }
            DataType::Float64 => {
                // a float64 may arrive reduced to float32
                if length == 4 {
                    FieldValue::Float64(read_f32_be(bs) as f64)
                } else {
                    fixed(8)?;
                    FieldValue::Float64(read_f64_be(bs))
                }
            }
            DataType::Boolean => {
                fixed(1)?;
                // SMIv2 TruthValue
                match bs[0] {
                    1 => FieldValue::Boolean(true),
                    2 => FieldValue::Boolean(false),
                    v => {
                        return Err(Error::Malformed(format!("invalid boolean octet {}", v)));
                    }
                }
            }
            DataType::MacAddress => {
                fixed(6)?;
                let mut mac = [0u8; 6];
                mac.copy_from_slice(bs);
                FieldValue::Mac(mac)
            }
            DataType::Ipv4Address => {
                fixed(4)?;
                let mut octets = [0u8; 4];
                octets.copy_from_slice(bs);
                FieldValue::Ip(std::net::IpAddr::from(octets))
            }
            DataType::Ipv6Address => {
                fixed(16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(bs);
                FieldValue::Ip(std::net::IpAddr::from(octets))
            }
            DataType::DateTimeSeconds => {
                fixed(4)?;
                FieldValue::DateTimeSeconds(read_u32_be(bs))
            }
            DataType::DateTimeMilliseconds => {
                fixed(8)?;
                FieldValue::DateTimeMilliseconds(read_uint_be(bs))
            }
            DataType::DateTimeMicroseconds => {
                fixed(8)?;
                FieldValue::DateTimeMicroseconds(read_uint_be(bs))
            }
            DataType::DateTimeNanoseconds => {
                fixed(8)?;
                FieldValue::DateTimeNanoseconds(read_uint_be(bs))
            }
        };
        Ok(value)
    }

    // RFC 7011 §7: one length octet below 255, the sentinel 255 announces a
    // two octet length
    fn decode_variable_length(cur: &mut Cursor) -> Result<usize> {
        let first = cur.take(1, "variable length")?[0];
        if first < 255 {
            Ok(first as usize)
        } else {
            Ok(cur.take_u16("extended variable length")? as usize)
        }
    }
}
