//! Access-control rules and policies.
//!
//! Rules and policies are persisted as JSON rows keyed by 8-byte big-endian
//! ids, so iteration order is numeric order and the last key is the highest
//! id. Rules are additionally indexed in memory by their SURT prefixes for
//! fast per-capture evaluation. All in-memory state sits behind one lock:
//! mutations persist first, then swap the maps and the prefix index inside
//! a single write section, so readers never observe a half-applied update.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use time::util::days_in_month;
use time::{Date, OffsetDateTime, PrimitiveDateTime};
use tracing::warn;

use cdxstore_core::Capture;

use crate::filter::CaptureFilter;
use crate::{Result, StoreError};

/// Prefix-index keys get this byte prepended so that a rule with an empty
/// SURT (the match-all default) has a non-empty key. No canonical urlkey
/// starts with `(`, so sentinel keys cannot collide with real prefixes.
const SENTINEL: u8 = b'(';

/// Half-open date window: `start <= t < end`, either bound optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
}

impl DateRange {
    fn contains(&self, t: OffsetDateTime) -> bool {
        self.start.map_or(true, |s| t >= s) && self.end.map_or(true, |e| t < e)
    }
}

/// Relative span, e.g. "within 3 years of capture".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    #[serde(default)]
    pub years: u32,
    #[serde(default)]
    pub months: u32,
    #[serde(default)]
    pub days: u32,
}

impl Period {
    fn is_zero(&self) -> bool {
        self.years == 0 && self.months == 0 && self.days == 0
    }

    /// End of the span starting at `from`. Month arithmetic clamps the day
    /// to the target month's length.
    fn end(&self, from: OffsetDateTime) -> OffsetDateTime {
        let total_months =
            from.year() as i64 * 12 + from.month() as i64 - 1 + self.years as i64 * 12
                + self.months as i64;
        let year = total_months.div_euclid(12) as i32;
        let month = time::Month::try_from((total_months.rem_euclid(12) + 1) as u8)
            .unwrap_or(from.month());
        let day = from.day().min(days_in_month(month, year));
        let date = Date::from_calendar_date(year, month, day).unwrap_or(from.date());
        PrimitiveDateTime::new(date, from.time()).assume_offset(from.offset())
            + time::Duration::days(self.days as i64)
    }
}

/// A predicate over (SURT prefix, capture date, access date) pointing at a
/// policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRule {
    #[serde(default)]
    pub id: Option<u64>,
    pub policy_id: u64,
    #[serde(default)]
    pub surts: Vec<String>,
    #[serde(default)]
    pub captured: Option<DateRange>,
    #[serde(default)]
    pub accessed: Option<DateRange>,
    #[serde(default)]
    pub period: Option<Period>,
}

impl AccessRule {
    /// Whether this rule applies to a capture taken at `capture_date` and
    /// viewed at `access_time`.
    fn matches_dates(&self, capture_date: Option<OffsetDateTime>, access_time: OffsetDateTime) -> bool {
        if let Some(range) = &self.captured {
            match capture_date {
                Some(d) if range.contains(d) => {}
                _ => return false,
            }
        }
        if let Some(range) = &self.accessed {
            if !range.contains(access_time) {
                return false;
            }
        }
        if let Some(period) = &self.period {
            if !period.is_zero() {
                match capture_date {
                    Some(d) if access_time < period.end(d) => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

/// A named set of access points. A capture governed by a rule is visible at
/// access point A iff the rule's policy contains A.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicy {
    #[serde(default)]
    pub id: Option<u64>,
    pub name: String,
    #[serde(default)]
    pub access_points: Vec<String>,
}

impl AccessPolicy {
    fn named(name: &str, access_points: &[&str]) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            access_points: access_points.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Secondary index from sentinel-prefixed SURT prefix to the rules stored
/// under it, in insertion order.
#[derive(Default)]
struct RulesBySurt {
    tree: BTreeMap<Vec<u8>, Vec<u64>>,
}

impl RulesBySurt {
    fn key(surt: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(surt.len() + 1);
        key.push(SENTINEL);
        key.extend_from_slice(surt.as_bytes());
        key
    }

    fn insert(&mut self, rule: &AccessRule) {
        let id = rule.id.expect("indexed rule must have an id");
        for surt in &rule.surts {
            self.tree.entry(Self::key(surt)).or_default().push(id);
        }
    }

    fn remove(&mut self, rule: &AccessRule) {
        let id = rule.id.expect("indexed rule must have an id");
        for surt in &rule.surts {
            let key = Self::key(surt);
            if let Some(ids) = self.tree.get_mut(&key) {
                ids.retain(|&other| other != id);
                if ids.is_empty() {
                    self.tree.remove(&key);
                }
            }
        }
    }

    /// Ids of all rules whose stored prefix is a prefix of `surt`, ordered
    /// by prefix length then insertion order.
    fn prefixing(&self, surt: &str) -> Vec<u64> {
        let key = Self::key(surt);
        let mut ids = Vec::new();
        for end in 1..=key.len() {
            if let Some(list) = self.tree.get(&key[..end]) {
                ids.extend_from_slice(list);
            }
        }
        ids
    }
}

#[derive(Default)]
struct AccessState {
    rules: BTreeMap<u64, AccessRule>,
    policies: BTreeMap<u64, AccessPolicy>,
    by_surt: RulesBySurt,
}

impl AccessState {
    /// Most specific applicable rule: longest matching prefix wins, ties go
    /// to the rule inserted last.
    fn rule_for(&self, capture: &Capture, access_time: OffsetDateTime) -> Option<&AccessRule> {
        let capture_date = capture.date();
        let mut selected = None;
        for id in self.by_surt.prefixing(&capture.urlkey) {
            if let Some(rule) = self.rules.get(&id) {
                if rule.matches_dates(capture_date, access_time) {
                    selected = Some(rule);
                }
            }
        }
        selected
    }
}

/// Persistent rule/policy store for one collection.
pub struct AccessControl {
    rules_tree: sled::Tree,
    policies_tree: sled::Tree,
    state: RwLock<AccessState>,
    next_rule_id: AtomicU64,
    next_policy_id: AtomicU64,
}

fn encode_id(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn decode_id(bytes: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

fn next_id(tree: &sled::Tree) -> Result<u64> {
    Ok(match tree.last()? {
        Some((key, _)) => decode_id(&key).map_or(0, |id| id + 1),
        None => 0,
    })
}

impl AccessControl {
    pub(crate) fn open(db: &sled::Db, collection: &str) -> Result<Self> {
        let rules_tree = db.open_tree(format!("{collection}.access.rules").as_bytes())?;
        let policies_tree = db.open_tree(format!("{collection}.access.policies").as_bytes())?;

        let mut state = AccessState::default();
        for row in policies_tree.iter() {
            let (key, value) = row?;
            match serde_json::from_slice::<AccessPolicy>(&value) {
                Ok(policy) => {
                    let id = policy.id.or_else(|| decode_id(&key));
                    if let Some(id) = id {
                        state.policies.insert(id, AccessPolicy { id: Some(id), ..policy });
                    }
                }
                Err(e) => warn!(collection, error = %e, "skipping unreadable policy row"),
            }
        }
        for row in rules_tree.iter() {
            let (key, value) = row?;
            match serde_json::from_slice::<AccessRule>(&value) {
                Ok(rule) => {
                    let id = rule.id.or_else(|| decode_id(&key));
                    if let Some(id) = id {
                        let rule = AccessRule { id: Some(id), ..rule };
                        state.by_surt.insert(&rule);
                        state.rules.insert(id, rule);
                    }
                }
                Err(e) => warn!(collection, error = %e, "skipping unreadable rule row"),
            }
        }

        let next_rule_id = AtomicU64::new(next_id(&rules_tree)?);
        let next_policy_id = AtomicU64::new(next_id(&policies_tree)?);
        let seed = state.policies.is_empty();

        let control = Self {
            rules_tree,
            policies_tree,
            state: RwLock::new(state),
            next_rule_id,
            next_policy_id,
        };
        if seed {
            control.put_policy(AccessPolicy::named("Public", &["public", "staff"]))?;
            control.put_policy(AccessPolicy::named("Staff Only", &["staff"]))?;
            control.put_policy(AccessPolicy::named("No Access", &[]))?;
        }
        Ok(control)
    }

    /// Save a rule, assigning an id on first write. The referenced policy
    /// must exist. Returns the rule's id.
    pub fn put_rule(&self, mut rule: AccessRule) -> Result<u64> {
        if !self.state.read().expect("access state lock").policies.contains_key(&rule.policy_id) {
            return Err(StoreError::UnknownPolicy(rule.policy_id));
        }
        let id = match rule.id {
            Some(id) => {
                self.next_rule_id.fetch_max(id + 1, Ordering::SeqCst);
                id
            }
            None => self.next_rule_id.fetch_add(1, Ordering::SeqCst),
        };
        rule.id = Some(id);

        let value = serde_json::to_vec(&rule).map_err(|e| StoreError::Store(e.to_string()))?;
        self.rules_tree.insert(encode_id(id), value)?;
        self.rules_tree.flush()?;

        let mut state = self.state.write().expect("access state lock");
        if let Some(previous) = state.rules.remove(&id) {
            state.by_surt.remove(&previous);
        }
        state.by_surt.insert(&rule);
        state.rules.insert(id, rule);
        Ok(id)
    }

    /// Remove a rule. Returns whether it existed.
    pub fn delete_rule(&self, id: u64) -> Result<bool> {
        self.rules_tree.remove(encode_id(id))?;
        self.rules_tree.flush()?;

        let mut state = self.state.write().expect("access state lock");
        match state.rules.remove(&id) {
            Some(rule) => {
                state.by_surt.remove(&rule);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Save a policy, assigning an id on first write. Returns the id.
    pub fn put_policy(&self, mut policy: AccessPolicy) -> Result<u64> {
        let id = match policy.id {
            Some(id) => {
                self.next_policy_id.fetch_max(id + 1, Ordering::SeqCst);
                id
            }
            None => self.next_policy_id.fetch_add(1, Ordering::SeqCst),
        };
        policy.id = Some(id);

        let value = serde_json::to_vec(&policy).map_err(|e| StoreError::Store(e.to_string()))?;
        self.policies_tree.insert(encode_id(id), value)?;
        self.policies_tree.flush()?;

        self.state
            .write()
            .expect("access state lock")
            .policies
            .insert(id, policy);
        Ok(id)
    }

    pub fn rule(&self, id: u64) -> Option<AccessRule> {
        self.state.read().expect("access state lock").rules.get(&id).cloned()
    }

    pub fn policy(&self, id: u64) -> Option<AccessPolicy> {
        self.state
            .read()
            .expect("access state lock")
            .policies
            .get(&id)
            .cloned()
    }

    /// All rules, in id order.
    pub fn list_rules(&self) -> Vec<AccessRule> {
        self.state
            .read()
            .expect("access state lock")
            .rules
            .values()
            .cloned()
            .collect()
    }

    /// All policies, in id order.
    pub fn list_policies(&self) -> Vec<AccessPolicy> {
        self.state
            .read()
            .expect("access state lock")
            .policies
            .values()
            .cloned()
            .collect()
    }

    /// All rules whose stored prefixes cover `surt`, least specific first.
    pub fn rules_for_surt(&self, surt: &str) -> Vec<AccessRule> {
        let state = self.state.read().expect("access state lock");
        state
            .by_surt
            .prefixing(surt)
            .into_iter()
            .filter_map(|id| state.rules.get(&id).cloned())
            .collect()
    }

    /// The most specific rule applicable to `capture` at `access_time`.
    pub fn rule_for_capture(
        &self,
        capture: &Capture,
        access_time: OffsetDateTime,
    ) -> Option<AccessRule> {
        self.state
            .read()
            .expect("access state lock")
            .rule_for(capture, access_time)
            .cloned()
    }

    fn is_visible(&self, capture: &Capture, access_point: &str, access_time: OffsetDateTime) -> bool {
        let state = self.state.read().expect("access state lock");
        match state.rule_for(capture, access_time) {
            Some(rule) => match state.policies.get(&rule.policy_id) {
                Some(policy) => policy.access_points.iter().any(|p| p == access_point),
                None => true,
            },
            None => true,
        }
    }
}

/// Visibility predicate for one access point at one access time, usable
/// inside a query's filter chain.
pub struct AccessFilter {
    control: Arc<AccessControl>,
    access_point: String,
    access_time: OffsetDateTime,
}

impl AccessFilter {
    pub fn new(control: Arc<AccessControl>, access_point: &str, access_time: OffsetDateTime) -> Self {
        Self {
            control,
            access_point: access_point.to_string(),
            access_time,
        }
    }
}

impl CaptureFilter for AccessFilter {
    fn accept(&self, capture: &Capture) -> Result<bool> {
        Ok(self
            .control
            .is_visible(capture, &self.access_point, self.access_time))
    }
}
