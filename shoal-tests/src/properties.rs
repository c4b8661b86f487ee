//! Safety properties checked against a running simulation.
//!
//! [`PropertyChecker::record`] is cheap and meant to run after every event;
//! it tracks history (leaders per term, terms and commit indexes per node,
//! the committed prefix) and flags anything that contradicts it. The
//! pairwise log comparison is quadratic and runs from
//! [`PropertyChecker::check_all`] at checkpoints.

use std::collections::{BTreeMap, BTreeSet};

use shoal_core::{LogIndex, NodeId, TermId};
use shoal_raft::LogStore;

use crate::simulation::{SimRaft, Simulation};

// ============================================================================
// Property Violation Types
// ============================================================================

/// A violation of a Raft safety property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyViolation {
    /// Two leaders in the same term.
    MultipleLeadersInTerm {
        /// The term.
        term: u64,
        /// Every node seen leading it.
        leaders: Vec<u64>,
    },
    /// A node's term went down.
    TermRegressed {
        /// The node.
        node: u64,
        /// Previously observed term.
        from: u64,
        /// Term observed now.
        to: u64,
    },
    /// A node's commit index went down.
    CommitRegressed {
        /// The node.
        node: u64,
        /// Previously observed commit index.
        from: u64,
        /// Commit index observed now.
        to: u64,
    },
    /// Two nodes committed different entries at one index.
    CommittedEntryChanged {
        /// The index.
        index: u64,
        /// Term first committed there.
        expected_term: u64,
        /// Node now disagreeing.
        node: u64,
        /// Term that node committed.
        actual_term: u64,
    },
    /// Entries at the same index and term, but earlier entries differ.
    LogMismatch {
        /// The earliest differing index.
        index: u64,
        /// The first node.
        node_a: u64,
        /// Its term at `index`.
        term_a: u64,
        /// The second node.
        node_b: u64,
        /// Its term at `index`.
        term_b: u64,
    },
    /// A leader lacks an entry committed before its term.
    MissingCommittedEntry {
        /// The entry's index.
        index: u64,
        /// The entry's term.
        term: u64,
        /// The leader.
        leader_node: u64,
        /// The leader's term.
        leader_term: u64,
    },
    /// The application saw entries out of order, twice, or uncommitted.
    BadApply {
        /// The node.
        node: u64,
        /// Index that should have come next.
        expected_index: u64,
        /// Index that came.
        actual_index: u64,
    },
}

impl std::fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MultipleLeadersInTerm { term, leaders } => {
                write!(f, "Multiple leaders in term {term}: {leaders:?}")
            }
            Self::TermRegressed { node, from, to } => {
                write!(f, "Node {node} term went from {from} to {to}")
            }
            Self::CommitRegressed { node, from, to } => {
                write!(f, "Node {node} commit index went from {from} to {to}")
            }
            Self::CommittedEntryChanged {
                index,
                expected_term,
                node,
                actual_term,
            } => write!(
                f,
                "Index {index} committed with term {expected_term}, \
                 but node {node} committed term {actual_term}"
            ),
            Self::LogMismatch {
                index,
                node_a,
                term_a,
                node_b,
                term_b,
            } => write!(
                f,
                "Log mismatch at index {index}: node {node_a} has term {term_a}, \
                 node {node_b} has term {term_b}"
            ),
            Self::MissingCommittedEntry {
                index,
                term,
                leader_node,
                leader_term,
            } => write!(
                f,
                "Committed entry (index={index}, term={term}) missing from \
                 leader {leader_node} in term {leader_term}"
            ),
            Self::BadApply {
                node,
                expected_index,
                actual_index,
            } => write!(
                f,
                "Node {node} applied index {actual_index}, expected {expected_index}"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CommittedEntry {
    term: TermId,
    /// Term of the node that first reported it committed. Every leader of a
    /// later term must hold the entry.
    observed_in: TermId,
}

// ============================================================================
// Property Checker
// ============================================================================

/// Tracks history across a simulation and collects violations.
#[derive(Debug, Default)]
pub struct PropertyChecker {
    leaders_by_term: BTreeMap<TermId, BTreeSet<NodeId>>,
    terms: BTreeMap<NodeId, TermId>,
    commits: BTreeMap<NodeId, LogIndex>,
    applied_seen: BTreeMap<NodeId, usize>,
    committed: BTreeMap<LogIndex, CommittedEntry>,
    violations: Vec<PropertyViolation>,
}

impl PropertyChecker {
    /// Creates an empty checker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Violations found so far.
    #[must_use]
    pub fn violations(&self) -> &[PropertyViolation] {
        &self.violations
    }

    /// Number of distinct terms that had a leader.
    #[must_use]
    pub fn terms_with_leader(&self) -> usize {
        self.leaders_by_term.len()
    }

    /// Number of indexes known to be committed.
    #[must_use]
    pub fn committed_len(&self) -> usize {
        self.committed.len()
    }

    /// Records the state of every running node. Call after each event.
    pub fn record(&mut self, sim: &Simulation) {
        for node in sim.nodes() {
            let Some(raft) = node.raft() else {
                continue;
            };
            let id = node.id();

            self.record_term(id, raft);
            self.record_commit(id, raft);
            self.record_applied(id, node.applied());
        }
    }

    /// Runs every check, including the pairwise log comparison.
    ///
    /// Returns everything found so far.
    pub fn check_all(&mut self, sim: &Simulation) -> &[PropertyViolation] {
        self.record(sim);

        let running: Vec<(NodeId, &SimRaft)> = sim
            .nodes()
            .filter_map(|n| n.raft().map(|r| (n.id(), r)))
            .collect();

        for (i, &(a, raft_a)) in running.iter().enumerate() {
            for &(b, raft_b) in &running[i + 1..] {
                if let Some(violation) = check_log_matching(a, raft_a, b, raft_b) {
                    self.violations.push(violation);
                }
            }
            if raft_a.is_leader() {
                self.check_leader_completeness(a, raft_a);
            }
        }
        &self.violations
    }

    /// Panics with every violation found, if any.
    ///
    /// # Panics
    /// Panics if any property was violated.
    pub fn assert_ok(&mut self, sim: &Simulation, context: &str) {
        let violations = self.check_all(sim);
        assert!(
            violations.is_empty(),
            "{context}: {} violation(s):\n{}",
            violations.len(),
            violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n")
        );
    }

    fn record_term(&mut self, id: NodeId, raft: &SimRaft) {
        let term = raft.current_term();
        if let Some(&previous) = self.terms.get(&id) {
            if term < previous {
                self.violations.push(PropertyViolation::TermRegressed {
                    node: id.get(),
                    from: previous.get(),
                    to: term.get(),
                });
            }
        }
        self.terms.insert(id, term);

        if raft.is_leader() {
            let leaders = self.leaders_by_term.entry(term).or_default();
            if leaders.insert(id) {
                if leaders.len() > 1 {
                    let leaders = leaders.iter().map(|n| n.get()).collect();
                    self.violations.push(PropertyViolation::MultipleLeadersInTerm {
                        term: term.get(),
                        leaders,
                    });
                }
                self.check_leader_completeness(id, raft);
            }
        }
    }

    fn record_commit(&mut self, id: NodeId, raft: &SimRaft) {
        let commit = raft.commit_index();
        let previous = self.commits.get(&id).copied().unwrap_or(LogIndex::new(0));
        if commit < previous {
            self.violations.push(PropertyViolation::CommitRegressed {
                node: id.get(),
                from: previous.get(),
                to: commit.get(),
            });
        }

        let mut index = previous.next();
        while index <= commit {
            if let Some(term) = raft.log().term_at(index) {
                match self.committed.get(&index) {
                    Some(known) if known.term != term => {
                        self.violations.push(PropertyViolation::CommittedEntryChanged {
                            index: index.get(),
                            expected_term: known.term.get(),
                            node: id.get(),
                            actual_term: term.get(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        self.committed.insert(
                            index,
                            CommittedEntry {
                                term,
                                observed_in: raft.current_term(),
                            },
                        );
                    }
                }
            }
            index = index.next();
        }
        self.commits.insert(id, commit.max(previous));
    }

    fn record_applied(&mut self, id: NodeId, applied: &[shoal_raft::LogEntry]) {
        let seen = self.applied_seen.entry(id).or_insert(0);
        for (position, entry) in applied.iter().enumerate().skip(*seen) {
            // Safe cast: positions are bounded by the simulated log length.
            #[allow(clippy::cast_possible_truncation)]
            let expected = LogIndex::new(position as u64 + 1);
            let committed_term = self.committed.get(&entry.index).map(|c| c.term);
            if entry.index != expected || committed_term.is_some_and(|t| t != entry.term) {
                self.violations.push(PropertyViolation::BadApply {
                    node: id.get(),
                    expected_index: expected.get(),
                    actual_index: entry.index.get(),
                });
            }
        }
        *seen = applied.len();
    }

    fn check_leader_completeness(&mut self, id: NodeId, raft: &SimRaft) {
        let leader_term = raft.current_term();
        for (&index, entry) in &self.committed {
            if entry.observed_in >= leader_term {
                continue;
            }
            if raft.log().term_at(index) != Some(entry.term) {
                self.violations.push(PropertyViolation::MissingCommittedEntry {
                    index: index.get(),
                    term: entry.term.get(),
                    leader_node: id.get(),
                    leader_term: leader_term.get(),
                });
            }
        }
    }
}

/// Checks that two logs agreeing on some entry agree on everything before it.
fn check_log_matching(
    a: NodeId,
    raft_a: &SimRaft,
    b: NodeId,
    raft_b: &SimRaft,
) -> Option<PropertyViolation> {
    let log_a = raft_a.log();
    let log_b = raft_b.log();
    let top = log_a.last_index().min(log_b.last_index());

    // Highest index where both hold the same term.
    let mut index = top;
    while index.get() > 0 && log_a.term_at(index) != log_b.term_at(index) {
        index = index.prev();
    }

    let mut check = LogIndex::new(1);
    while check <= index {
        let (term_a, term_b) = (log_a.term_at(check), log_b.term_at(check));
        if term_a != term_b {
            return Some(PropertyViolation::LogMismatch {
                index: check.get(),
                node_a: a.get(),
                term_a: term_a.map_or(0, TermId::get),
                node_b: b.get(),
                term_b: term_b.map_or(0, TermId::get),
            });
        }
        check = check.next();
    }
    None
}
