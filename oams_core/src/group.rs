//! Lane groups: named ordered sets of (feeder, bay) pairs that are
//! interchangeable as one logical tool (e.g. "T0"). Membership is fixed at
//! init; every query is a read-only pass over feeder snapshots.

use std::collections::BTreeMap;

use crate::feeder::Feeder;

#[derive(Debug, Clone)]
pub struct LaneGroup {
    name: String,
    members: Vec<(String, u8)>,
}

impl LaneGroup {
    pub fn new(name: impl Into<String>, members: Vec<(String, u8)>) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[(String, u8)] {
        &self.members
    }

    pub fn contains(&self, feeder: &str, bay: u8) -> bool {
        self.members.iter().any(|(f, b)| f == feeder && *b == bay)
    }

    /// Members whose bay has a spool seated and not already threaded,
    /// in configured order.
    pub fn available<'a>(&'a self, feeders: &BTreeMap<String, Feeder>) -> Vec<(&'a str, u8)> {
        self.members
            .iter()
            .filter(|(name, bay)| {
                feeders
                    .get(name)
                    .is_some_and(|f| f.is_bay_ready(*bay) && !f.is_bay_loaded(*bay))
            })
            .map(|(name, bay)| (name.as_str(), *bay))
            .collect()
    }

    /// The member currently feeding, if any. A group counts as loaded iff
    /// exactly one member bay is its feeder's current bay with the hub
    /// engaged.
    pub fn loaded<'a>(&'a self, feeders: &BTreeMap<String, Feeder>) -> Option<(&'a str, u8)> {
        self.members
            .iter()
            .find(|(name, bay)| feeders.get(name).is_some_and(|f| f.is_bay_loaded(*bay)))
            .map(|(name, bay)| (name.as_str(), *bay))
    }

    /// First available member in configured order.
    pub fn next_available<'a>(&'a self, feeders: &BTreeMap<String, Feeder>) -> Option<(&'a str, u8)> {
        self.available(feeders).into_iter().next()
    }
}
