//! The aged multiset of arcs a peer keeps to its neighbours.
//!
//! Arcs are stored as a flat list of (peer, age) pairs, kept ascending by
//! age: fresh arcs sit at the front, the oldest arc is the last element.
//! The same peer may appear any number of times; every occurrence is an
//! independent arc with its own age.

use rand::seq::SliceRandom;
use rand::Rng;

use spray_core::wire::PeerId;

use crate::error::{MembershipError, Result};

/// One directed, aged entry of a partial view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arc {
    pub peer: PeerId,
    /// Rounds survived since creation.
    pub age: u32,
}

impl Arc {
    pub fn new(peer: PeerId) -> Self {
        Self { peer, age: 0 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PartialView {
    arcs: Vec<Arc>,
}

impl PartialView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh arc (age 0) to `peer`.
    pub fn add_neighbor(&mut self, peer: PeerId) {
        self.insert(Arc::new(peer));
    }

    /// Put arcs back with the ages they had.
    pub fn restore(&mut self, arcs: impl IntoIterator<Item = Arc>) {
        for arc in arcs {
            self.insert(arc);
        }
    }

    /// Insert at the sorted position, after arcs of equal age.
    fn insert(&mut self, arc: Arc) {
        let at = self.arcs.partition_point(|a| a.age <= arc.age);
        self.arcs.insert(at, arc);
    }

    /// The arc with the highest age.
    pub fn oldest(&self) -> Result<&Arc> {
        self.arcs.last().ok_or(MembershipError::EmptyView)
    }

    /// Age every arc by one round. Order is preserved.
    pub fn increment(&mut self) {
        for arc in &mut self.arcs {
            arc.age = arc.age.saturating_add(1);
        }
    }

    /// Number of arcs handed over in one exchange: ceil(len / 2).
    pub fn sample_size(&self) -> usize {
        self.arcs.len().div_ceil(2)
    }

    /// Pick `sample_size()` arcs uniformly without replacement.
    ///
    /// With `is_initiator`, the oldest occurrence of `target` is forced into
    /// the sample first so the exchange partner always receives a path back.
    /// The view itself is left untouched.
    pub fn sample<R: Rng + ?Sized>(&self, target: &PeerId, is_initiator: bool, rng: &mut R) -> Vec<Arc> {
        let size = self.sample_size();
        let mut pool = self.arcs.clone();
        let mut sample = Vec::with_capacity(size);

        if is_initiator {
            if let Some(i) = pool.iter().rposition(|a| &a.peer == target) {
                sample.push(pool.remove(i));
            }
        }

        let remaining = size.saturating_sub(sample.len());
        sample.extend(pool.choose_multiple(rng, remaining).cloned());
        sample
    }

    /// Remove exactly one arc with the same (peer, age) per sample entry.
    pub fn remove_sample(&mut self, sample: &[Arc]) {
        for arc in sample {
            self.remove_peer_age(&arc.peer, arc.age);
        }
    }

    /// Remove every arc to `peer`. Returns how many were removed.
    pub fn remove_all(&mut self, peer: &PeerId) -> usize {
        let before = self.arcs.len();
        self.arcs.retain(|a| &a.peer != peer);
        before - self.arcs.len()
    }

    pub fn remove_peer(&mut self, peer: &PeerId) -> Option<Arc> {
        let i = self.index_of(peer)?;
        Some(self.arcs.remove(i))
    }

    pub fn remove_peer_age(&mut self, peer: &PeerId, age: u32) -> Option<Arc> {
        let i = self
            .arcs
            .iter()
            .position(|a| &a.peer == peer && a.age == age)?;
        Some(self.arcs.remove(i))
    }

    /// Copy of `sample` with every arc to `old` pointing at `fresh` instead.
    pub fn replace(sample: &[Arc], old: &PeerId, fresh: &PeerId) -> Vec<Arc> {
        sample
            .iter()
            .map(|a| {
                if &a.peer == old {
                    Arc { peer: fresh.clone(), age: a.age }
                } else {
                    a.clone()
                }
            })
            .collect()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.arcs.iter().any(|a| &a.peer == peer)
    }

    /// Position of the youngest arc to `peer`.
    pub fn index_of(&self, peer: &PeerId) -> Option<usize> {
        self.arcs.iter().position(|a| &a.peer == peer)
    }

    pub fn occurrences(&self, peer: &PeerId) -> usize {
        self.arcs.iter().filter(|a| &a.peer == peer).count()
    }

    pub fn len(&self) -> usize {
        self.arcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arcs.is_empty()
    }

    pub fn clear(&mut self) {
        self.arcs.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc> {
        self.arcs.iter()
    }

    /// Distinct peers, in view order.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = Vec::new();
        for arc in &self.arcs {
            if !peers.contains(&arc.peer) {
                peers.push(arc.peer.clone());
            }
        }
        peers
    }

    pub fn random_arc<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Arc> {
        self.arcs.choose(rng)
    }
}
