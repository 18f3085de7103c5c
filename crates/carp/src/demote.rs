//! Demotion counters.
//!
//! Every coordinator carries its own counter and every interface group has
//! one shared by its members. Counters saturate instead of wrapping and
//! never go below zero; on the wire they are clamped to a byte.

use crate::types::IFGROUP_ALL;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemotionCounter(i32);

impl DemotionCounter {
    pub fn get(self) -> i32 {
        self.0
    }

    /// Apply a signed delta and return the new value.
    pub fn adjust(&mut self, adj: i32) -> i32 {
        self.0 = if adj > 0 && self.0 > i32::MAX - adj {
            i32::MAX
        } else if adj < 0 && self.0 < i32::MIN - adj {
            0
        } else {
            (self.0 + adj).max(0)
        };
        self.0
    }

    /// Value as carried in advertisements
    pub fn wire(self) -> u8 {
        self.0.clamp(0, u8::MAX as i32) as u8
    }
}

/// Registry of interface groups and their demotion counters
#[derive(Debug, Clone, Default)]
pub struct InterfaceGroups {
    groups: BTreeMap<String, DemotionCounter>,
}

impl InterfaceGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure(&mut self, name: &str) {
        if !self.groups.contains_key(name) {
            self.groups.insert(name.to_string(), DemotionCounter::default());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    pub fn get(&self, name: &str) -> i32 {
        self.groups.get(name).map(|c| c.get()).unwrap_or(0)
    }

    /// Adjust a group counter, creating the group if needed.
    ///
    /// Returns the value before and after. The `all` group is never adjusted.
    pub fn adjust(&mut self, name: &str, adj: i32) -> (i32, i32) {
        if name == IFGROUP_ALL {
            return (0, 0);
        }
        let counter = self.groups.entry(name.to_string()).or_default();
        let before = counter.get();
        (before, counter.adjust(adj))
    }

    /// Set a group counter from an administrative delta.
    ///
    /// The result must stay within a byte, otherwise nothing changes.
    pub fn try_adjust_bounded(&mut self, name: &str, adj: i32) -> Option<i32> {
        let current = self.get(name);
        let next = current.checked_add(adj)?;
        if !(0..=u8::MAX as i32).contains(&next) {
            return None;
        }
        let counter = self.groups.entry(name.to_string()).or_default();
        counter.0 = next;
        Some(next)
    }
}

/// Demotion advertised by a coordinator.
///
/// Sum of its groups' counters (saturating at 255); falls back to the
/// coordinator's own counter when the groups carry none.
pub fn effective_demotion<'a>(
    own: DemotionCounter,
    groups: &InterfaceGroups,
    membership: impl IntoIterator<Item = &'a String>,
) -> u8 {
    let mut count: i32 = 0;
    for name in membership {
        match count.checked_add(groups.get(name)) {
            Some(sum) => count = sum,
            None => {
                count = u8::MAX as i32;
                break;
            }
        }
    }
    if count == 0 {
        count = own.get();
    }
    count.clamp(0, u8::MAX as i32) as u8
}
