use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::RwLock;

use crate::common::TemplateRecord;
use crate::error::{Error, Result};
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};

struct TemplateEntry {
    record: Arc<TemplateRecord>,
    received_at: Instant,
}

// templates scoped per observation domain, refreshed by every template set
// and aged out after ttl (ttl zero disables expiry, suitable for TCP
// transport, UDP deployments should set a finite ttl per RFC 7011 §10.3.6)
pub struct TemplateCache {
    templates: RwLock<HashMap<u32, HashMap<u16, TemplateEntry>>>,
    ttl: Duration,
}

impl TemplateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // replaces any previous template under the same key and restarts its ttl
    pub fn put(&self, obs_domain_id: u32, record: TemplateRecord) {
        let template_id = record.template_id;
        let entry = TemplateEntry {
            record: Arc::new(record),
            received_at: Instant::now(),
        };
        self.templates
            .write()
            .entry(obs_domain_id)
            .or_default()
            .insert(template_id, entry);
    }

    // the returned Arc snapshots the field list: replacing or expiring the
    // template later never affects records already decoded against it
    pub fn get(&self, obs_domain_id: u32, template_id: u16) -> Result<Arc<TemplateRecord>> {
        {
            let templates = self.templates.read();
            let entry = templates
                .get(&obs_domain_id)
                .and_then(|domain| domain.get(&template_id))
                .ok_or(Error::UnknownTemplate(obs_domain_id, template_id))?;
            if self.ttl.is_zero() || entry.received_at.elapsed() <= self.ttl {
                return Ok(entry.record.clone());
            }
        }
        // expired, upgrade to the write lock and evict
        let mut templates = self.templates.write();
        if let Some(domain) = templates.get_mut(&obs_domain_id) {
            if let Some(entry) = domain.get(&template_id) {
                if entry.received_at.elapsed() > self.ttl {
                    domain.remove(&template_id);
                    debug!(
                        "evicted expired template {} of observation domain {}",
                        template_id, obs_domain_id
                    );
                    return Err(Error::TemplateExpired(obs_domain_id, template_id));
                }
                // refreshed between the locks
                return Ok(entry.record.clone());
            }
        }
        Err(Error::UnknownTemplate(obs_domain_id, template_id))
    }

    // drops every expired entry, returns how many were removed
    pub fn sweep(&self) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }
        let mut removed = 0;
        let mut templates = self.templates.write();
        for domain in templates.values_mut() {
            let before = domain.len();
            domain.retain(|_, entry| entry.received_at.elapsed() <= self.ttl);
            removed += before - domain.len();
        }
        templates.retain(|_, domain| !domain.is_empty());
        if removed > 0 {
            debug!("swept {} expired templates", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.templates.read().values().map(|d| d.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RefCountable for TemplateCache {
    fn get_counters(&self) -> Vec<Counter> {
        vec![(
            "templates-cached",
            CounterType::Gauged,
            CounterValue::Unsigned(self.len() as u64),
        )]
    }
}
