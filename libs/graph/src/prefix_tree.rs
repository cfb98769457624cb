//! Dot-separated name lookup over all test variants.
//!
//! Test node names are dotted variant chains like
//! `quicktest.tutorial1.net1`. The tree indexes every name under *every*
//! token it contains, so a query like `tutorial1` finds all nodes whose name
//! passes through that variant, and `quicktest.tutorial1` narrows the match
//! to names where the two tokens are adjacent.

use std::collections::{BTreeMap, HashMap};

/// One variant token within some indexed name.
struct TreeSlot<T> {
    terminal: Option<T>,
    children: BTreeMap<String, usize>,
}

impl<T> TreeSlot<T> {
    fn new() -> Self {
        Self {
            terminal: None,
            children: BTreeMap::new(),
        }
    }
}

/// An inverted prefix tree over dotted variant names.
///
/// Unlike a plain trie, a token occurring in the middle of one name and at
/// the start of another is tracked in both positions, so lookups may start
/// from any token.
pub struct PrefixTree<T> {
    slots: Vec<TreeSlot<T>>,
    variant_slots: HashMap<String, Vec<usize>>,
}

impl<T: Copy> PrefixTree<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            variant_slots: HashMap::new(),
        }
    }

    /// Number of distinct tree positions a variant token occupies.
    pub fn variant_count(&self, variant: &str) -> usize {
        self.variant_slots.get(variant).map_or(0, Vec::len)
    }

    fn new_slot(&mut self, variant: &str) -> usize {
        let index = self.slots.len();
        self.slots.push(TreeSlot::new());
        self.variant_slots
            .entry(variant.to_owned())
            .or_default()
            .push(index);
        index
    }

    /// Index `name` under every tree position its first token occupies,
    /// pointing the end of each token chain at `value`.
    pub fn insert(&mut self, name: &str, value: T) {
        let tokens: Vec<&str> = name.split('.').collect();
        let Some((first, rest)) = tokens.split_first() else {
            return;
        };
        if !self.variant_slots.contains_key(*first) {
            self.new_slot(first);
        }
        // Snapshot the starting positions: extending a chain may register
        // new positions for the same token, which must not be revisited.
        let starts = self.variant_slots[*first].clone();
        for start in starts {
            let mut current = start;
            for token in rest {
                current = match self.slots[current].children.get(*token) {
                    Some(&child) => child,
                    None => {
                        let child = self.new_slot(token);
                        self.slots[current]
                            .children
                            .insert((*token).to_owned(), child);
                        child
                    }
                };
            }
            self.slots[current].terminal = Some(value);
        }
    }

    /// Whether some indexed name contains `name` as a contiguous token run.
    pub fn contains(&self, name: &str) -> bool {
        !self.get(name).is_empty()
    }

    /// All values whose indexed name contains `name` as a contiguous token
    /// run, in tree order. A value is reported once per matching position.
    pub fn get(&self, name: &str) -> Vec<T> {
        let tokens: Vec<&str> = name.split('.').collect();
        let Some((first, rest)) = tokens.split_first() else {
            return Vec::new();
        };
        let mut found = Vec::new();
        let Some(starts) = self.variant_slots.get(*first) else {
            return found;
        };
        'starts: for &start in starts {
            let mut current = start;
            for token in rest {
                match self.slots[current].children.get(*token) {
                    Some(&child) => current = child,
                    None => continue 'starts,
                }
            }
            self.collect_terminals(current, &mut found);
        }
        found
    }

    fn collect_terminals(&self, slot: usize, found: &mut Vec<T>) {
        if let Some(value) = self.slots[slot].terminal {
            found.push(value);
        }
        for &child in self.slots[slot].children.values() {
            self.collect_terminals(child, found);
        }
    }
}

impl<T: Copy> Default for PrefixTree<T> {
    fn default() -> Self {
        Self::new()
    }
}
