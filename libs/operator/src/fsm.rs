//! Finite-state machine used to validate custom resource state transitions.
//!
//! Mirrors the adjacency-matrix design of the Go reconciler's state package:
//! states are registered up front, edges are added explicitly, and both a
//! direct-transition check and a reachability check are exposed.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

/// A named state a custom resource's `status.state` field can hold.
pub type State = String;

/// Adjacency-matrix backed finite-state machine over a fixed set of [`State`]s.
#[derive(Debug, Clone)]
pub struct Fsm {
    adjacency: Vec<Vec<bool>>,
    index: HashMap<State, usize>,
    states: Vec<State>,
}

impl Fsm {
    /// Registers `states` as the full vertex set of the machine. No edges exist yet.
    pub fn new<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<State>,
    {
        let states: Vec<State> = states.into_iter().map(Into::into).collect();
        let n = states.len();
        let index = states
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();
        Fsm {
            adjacency: vec![vec![false; n]; n],
            index,
            states,
        }
    }

    fn idx(&self, state: &str) -> Result<usize> {
        self.index
            .get(state)
            .copied()
            .ok_or_else(|| Error::UnknownState(state.to_string()))
    }

    /// Resolves a state name to its index, or `None` if it was never registered.
    fn try_idx(&self, state: &str) -> Option<usize> {
        self.index.get(state).copied()
    }

    /// Registers a directed edge allowing a transition from `from` to `to`.
    pub fn set_adjacent(&mut self, from: &str, to: &str) -> Result<()> {
        let i = self.idx(from)?;
        let j = self.idx(to)?;
        self.adjacency[i][j] = true;
        Ok(())
    }

    /// True if a single edge allows `from -> to` directly. An unregistered
    /// `from` or `to` fails closed: `Ok(false)`, no edge.
    pub fn valid_transition(&self, from: &str, to: &str) -> Result<bool> {
        let (Some(i), Some(j)) = (self.try_idx(from), self.try_idx(to)) else {
            return Ok(false);
        };
        Ok(self.adjacency[i][j])
    }

    /// True if `to` is reachable from `from` through one or more edges. An
    /// unregistered `from` or `to` fails closed: `Ok(false)`, no path.
    ///
    /// Tracks visited vertices to stay correct in the presence of cycles,
    /// unlike a plain depth-first walk over the adjacency matrix.
    pub fn path_exists(&self, from: &str, to: &str) -> Result<bool> {
        let (Some(from_idx), Some(to_idx)) = (self.try_idx(from), self.try_idx(to)) else {
            return Ok(false);
        };
        let mut visited = HashSet::new();
        Ok(self.path_exists_idx(from_idx, to_idx, &mut visited))
    }

    fn path_exists_idx(&self, from: usize, to: usize, visited: &mut HashSet<usize>) -> bool {
        if from == to {
            return true;
        }
        if !visited.insert(from) {
            return false;
        }
        for (next, &reachable) in self.adjacency[from].iter().enumerate() {
            if reachable && self.path_exists_idx(next, to, visited) {
                return true;
            }
        }
        false
    }

    /// All registered states, in registration order.
    pub fn states(&self) -> &[State] {
        &self.states
    }
}
