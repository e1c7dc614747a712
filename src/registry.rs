use std::collections::HashMap;

use itertools::Itertools;

use crate::tube::Tube;

/// The single authoritative namespace of tubes for one broker instance.
/// Tubes are created lazily on first reference and dropped opportunistically
/// once empty and unreferenced.
#[derive(Debug, Default)]
pub struct TubeRegistry {
    tubes: HashMap<String, Tube>,
}

impl TubeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Tube> {
        self.tubes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tube> {
        self.tubes.get_mut(name)
    }

    pub fn get_or_create(&mut self, name: &str) -> &mut Tube {
        self.tubes.entry(name.to_string()).or_default()
    }

    /// Drops the tube if it holds no jobs and no session references it.
    pub fn maybe_gc(&mut self, name: &str) {
        if self.tubes.get(name).is_some_and(Tube::is_idle) {
            self.tubes.remove(name);
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.tubes.keys().cloned().sorted().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tube)> {
        self.tubes.iter()
    }

    pub fn len(&self) -> usize {
        self.tubes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tubes.is_empty()
    }
}
