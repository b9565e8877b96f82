//! Causal ordering for replicated values.
//!
//! A [`VectorClock`] is a map from node address to a monotonically
//! increasing counter, plus a physical timestamp used only to break ties
//! when the counters alone do not establish an order.

use std::cmp::Ordering as StdOrdering;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;

use chrono::{Local, NaiveDateTime, TimeZone};

/// Result of comparing two clocks under the partial order induced by their
/// counters, with a physical-timestamp tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareValue {
    Equal,
    LessThan,
    GreaterThan,
    Concurrent,
}

impl CompareValue {
    /// Flips LessThan/GreaterThan; Equal and Concurrent are self-inverse.
    pub fn reversed(self) -> CompareValue {
        match self {
            CompareValue::LessThan => CompareValue::GreaterThan,
            CompareValue::GreaterThan => CompareValue::LessThan,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorClock {
    counters: HashMap<String, i64>,
    // Seconds since epoch. Local time, to match the textual encoding's
    // "MM/DD/YY:HH:MM:SS" format, which carries no timezone offset.
    physical_time: i64,
}

impl Default for VectorClock {
    fn default() -> Self {
        VectorClock {
            counters: HashMap::new(),
            physical_time: now_secs(),
        }
    }
}

fn now_secs() -> i64 {
    Local::now().naive_local().and_utc().timestamp()
}

impl VectorClock {
    /// The zero clock, stamped with the current time.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_counters(counters: HashMap<String, i64>) -> Self {
        VectorClock {
            counters,
            physical_time: now_secs(),
        }
    }

    pub fn get(&self, addr: &str) -> i64 {
        self.counters.get(addr).copied().unwrap_or(0)
    }

    /// Compares `self` to `other`. Never mutates either clock.
    pub fn compare(&self, other: &VectorClock) -> CompareValue {
        let mut keys: HashSet<&str> = HashSet::new();
        keys.extend(self.counters.keys().map(String::as_str));
        keys.extend(other.counters.keys().map(String::as_str));

        let mut sign = 0i64;

        for key in keys {
            let a = self.get(key);
            let b = other.get(key);
            let d = a - b;
            let new_sign = d.signum();

            if sign == 0 {
                sign = new_sign;
            } else if new_sign == 0 || new_sign == sign {
                continue;
            } else {
                return CompareValue::Concurrent;
            }
        }

        if sign == 0 {
            sign = (self.physical_time - other.physical_time).signum();
        }

        match sign.cmp(&0) {
            StdOrdering::Less => CompareValue::LessThan,
            StdOrdering::Greater => CompareValue::GreaterThan,
            StdOrdering::Equal => CompareValue::Equal,
        }
    }

    /// Componentwise max over counters; stamped with the current time.
    pub fn merge(a: &VectorClock, b: &VectorClock) -> VectorClock {
        let mut counters = a.counters.clone();
        for (addr, &bv) in &b.counters {
            let av = counters.get(addr).copied().unwrap_or(0);
            counters.insert(addr.clone(), av.max(bv));
        }
        VectorClock {
            counters,
            physical_time: now_secs(),
        }
    }

    /// `a` with `a[addr] += k`; stamped with the current time.
    pub fn add(a: &VectorClock, addr: &str, k: i64) -> VectorClock {
        let mut counters = a.counters.clone();
        *counters.entry(addr.to_string()).or_insert(0) += k;
        VectorClock {
            counters,
            physical_time: now_secs(),
        }
    }

    /// True unless `a` is strictly LessThan `b`; ties (Equal/Concurrent) are
    /// broken by whichever clock carries the later physical timestamp.
    pub fn is_max(a: &VectorClock, b: &VectorClock) -> bool {
        match a.compare(b) {
            CompareValue::LessThan => false,
            CompareValue::GreaterThan => true,
            _ => b.physical_time <= a.physical_time,
        }
    }

    /// Folds `is_max` over a non-empty collection, returning the winner.
    /// Panics if `versions` is empty — callers must guard for that case
    /// themselves, since "no versions at all" and "one tombstoned version"
    /// are different outcomes at the call sites that use this.
    pub fn reconcile<'a, T>(versions: &'a [T], clock_of: impl Fn(&T) -> &'a VectorClock) -> &'a T {
        let mut winner = &versions[0];
        for candidate in &versions[1..] {
            if VectorClock::is_max(clock_of(candidate), clock_of(winner)) {
                winner = candidate;
            }
        }
        winner
    }

    pub fn to_string_encoding(&self) -> String {
        let dt = Local
            .timestamp_opt(self.physical_time, 0)
            .single()
            .unwrap_or_else(Local::now);
        let mut out = format!("PhysicalTime:{}", dt.format("%m/%d/%y:%H:%M:%S"));

        let mut pairs: Vec<(&String, &i64)> = self.counters.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        for (addr, count) in pairs {
            out.push(' ');
            out.push_str(addr);
            out.push(';');
            out.push_str(&count.to_string());
        }
        out
    }

    pub fn from_string_encoding(s: &str) -> VectorClock {
        if s.is_empty() {
            return VectorClock {
                counters: HashMap::new(),
                physical_time: now_secs(),
            };
        }

        let mut parts = s.split(' ');
        let time_token = parts.next().unwrap_or("");
        let time_str = time_token.strip_prefix("PhysicalTime:").unwrap_or("");
        let physical_time = NaiveDateTime::parse_from_str(time_str, "%m/%d/%y:%H:%M:%S")
            .map(|naive| naive.and_utc().timestamp())
            .unwrap_or_else(|_| now_secs());

        let mut counters = HashMap::new();
        for pair in parts {
            if pair.is_empty() {
                continue;
            }
            if let Some((addr, count)) = pair.split_once(';') {
                counters.insert(addr.to_string(), count.parse().unwrap_or(0));
            }
        }

        VectorClock {
            counters,
            physical_time,
        }
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_encoding())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(pairs: &[(&str, i64)]) -> VectorClock {
        let mut counters = HashMap::new();
        for (addr, c) in pairs {
            counters.insert(addr.to_string(), *c);
        }
        VectorClock::from_counters(counters)
    }

    #[test]
    fn compare_is_antisymmetric() {
        let a = clock(&[("a", 2), ("b", 1)]);
        let b = clock(&[("a", 1), ("b", 1)]);
        assert_eq!(a.compare(&b), CompareValue::GreaterThan);
        assert_eq!(b.compare(&a).reversed(), a.compare(&b));
    }

    #[test]
    fn concurrent_when_signs_disagree() {
        let a = clock(&[("a", 2), ("b", 0)]);
        let b = clock(&[("a", 0), ("b", 2)]);
        assert_eq!(a.compare(&b), CompareValue::Concurrent);
    }

    #[test]
    fn merge_dominates_both_inputs() {
        let a = clock(&[("a", 2), ("b", 0)]);
        let b = clock(&[("a", 0), ("b", 2)]);
        let m = VectorClock::merge(&a, &b);
        assert_ne!(m.compare(&a), CompareValue::LessThan);
        assert_ne!(m.compare(&b), CompareValue::LessThan);
    }

    #[test]
    fn add_is_strictly_greater() {
        let a = clock(&[("a", 1)]);
        let added = VectorClock::add(&a, "a", 3);
        assert_eq!(added.compare(&a), CompareValue::GreaterThan);
    }

    #[test]
    fn round_trips_through_string_encoding() {
        let a = clock(&[("a:8080", 3), ("b:8081", 5)]);
        let decoded = VectorClock::from_string_encoding(&a.to_string_encoding());
        assert_eq!(decoded.get("a:8080"), 3);
        assert_eq!(decoded.get("b:8081"), 5);
        assert_eq!(decoded.physical_time, a.physical_time);
    }

    #[test]
    fn empty_string_is_zero_clock() {
        let z = VectorClock::from_string_encoding("");
        assert_eq!(z.get("anything"), 0);
    }

    #[test]
    fn is_max_false_only_when_strictly_less() {
        let a = clock(&[("a", 1)]);
        let b = clock(&[("a", 2)]);
        assert!(!VectorClock::is_max(&a, &b));
        assert!(VectorClock::is_max(&b, &a));
    }
}
