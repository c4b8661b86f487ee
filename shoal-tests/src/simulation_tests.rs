//! Simulation tests with fault injection.
//!
//! Every test checks the safety properties after each simulated event and
//! again, pairwise, at the end.

use std::time::Duration;

use bytes::Bytes;
use shoal_core::NodeId;
use shoal_raft::LogStore;

use crate::properties::PropertyChecker;
use crate::scenarios::faults::NetworkFaults;
use crate::scenarios::seeds::{REGRESSION_SEEDS, SWEEP_SEED_COUNT};
use crate::scenarios::{clusters, ELECTION_SETTLE};
use crate::simulation::{Simulation, SimulationConfig};

fn simulation(nodes: u64, seed: u64, faults: NetworkFaults) -> (Simulation, PropertyChecker) {
    let sim = Simulation::new(SimulationConfig::new(nodes, seed).with_faults(faults));
    (sim, PropertyChecker::new())
}

/// Proposes one entry every `every` for `duration`, tolerating leaderless gaps.
fn propose_for(
    sim: &mut Simulation,
    checker: &mut PropertyChecker,
    duration: Duration,
    every: Duration,
) -> u64 {
    let mut proposed = 0;
    let mut elapsed = Duration::ZERO;
    while elapsed < duration {
        if sim.propose(Bytes::from(format!("op-{proposed}"))).is_some() {
            proposed += 1;
        }
        sim.run_for(every, checker);
        elapsed += every;
    }
    proposed
}

// ============================================================================
// Basic Simulation Tests
// ============================================================================

#[test]
fn test_simulation_basic_election() {
    let (mut sim, mut checker) = simulation(clusters::THREE_NODE, 42, NetworkFaults::RELIABLE);

    let leader = sim.run_until_leader(ELECTION_SETTLE, &mut checker);

    assert!(leader.is_some(), "no leader after {:?}", sim.now());
    checker.assert_ok(&sim, "seed 42");
}

#[test]
fn test_simulation_followers_agree_on_leader() {
    let (mut sim, mut checker) = simulation(clusters::FIVE_NODE, 7, NetworkFaults::RELIABLE);
    let leader = sim.run_until_leader(ELECTION_SETTLE, &mut checker).unwrap();
    sim.run_for(Duration::from_millis(200), &mut checker);

    for node in sim.nodes() {
        let raft = node.raft().unwrap();
        if node.id() == leader {
            assert!(raft.is_leader());
        } else {
            assert_eq!(raft.leader_id(), Some(leader), "{} disagrees", node.id());
        }
    }
    checker.assert_ok(&sim, "seed 7");
}

#[test]
fn test_simulation_heartbeats_prevent_elections() {
    let (mut sim, mut checker) = simulation(clusters::THREE_NODE, 1234, NetworkFaults::RELIABLE);
    let leader = sim.run_until_leader(ELECTION_SETTLE, &mut checker).unwrap();
    let term = sim.node(leader).unwrap().raft().unwrap().current_term();
    let elected = sim.stats().leaders_elected;

    sim.run_for(Duration::from_secs(10), &mut checker);

    assert_eq!(sim.leader(), Some(leader));
    assert_eq!(sim.node(leader).unwrap().raft().unwrap().current_term(), term);
    assert_eq!(sim.stats().leaders_elected, elected);
    checker.assert_ok(&sim, "seed 1234");
}

#[test]
fn test_simulation_replicates_to_all_nodes() {
    let (mut sim, mut checker) = simulation(clusters::THREE_NODE, 99, NetworkFaults::RELIABLE);
    sim.run_until_leader(ELECTION_SETTLE, &mut checker).unwrap();

    let proposed = propose_for(
        &mut sim,
        &mut checker,
        Duration::from_secs(1),
        Duration::from_millis(20),
    );
    sim.run_for(Duration::from_millis(500), &mut checker);

    assert!(proposed > 0);
    for node in sim.nodes() {
        let applied = node.applied();
        assert_eq!(applied.len() as u64, proposed, "{} lags", node.id());
        for (n, entry) in applied.iter().enumerate() {
            assert_eq!(entry.data, Bytes::from(format!("op-{n}")));
        }
    }
    checker.assert_ok(&sim, "seed 99");
}

#[test]
fn test_simulation_is_deterministic() {
    let run = |seed| {
        let (mut sim, mut checker) = simulation(clusters::FIVE_NODE, seed, NetworkFaults::LOSSY);
        sim.run_until_leader(ELECTION_SETTLE, &mut checker);
        propose_for(
            &mut sim,
            &mut checker,
            Duration::from_secs(2),
            Duration::from_millis(50),
        );
        (sim.stats(), sim.leaders(), sim.max_commit_index())
    };

    assert_eq!(run(31337), run(31337));
}

// ============================================================================
// Fault Injection Tests
// ============================================================================

#[test]
fn test_simulation_regression_seeds_lossy_network() {
    for &seed in REGRESSION_SEEDS {
        let (mut sim, mut checker) = simulation(clusters::FIVE_NODE, seed, NetworkFaults::LOSSY);
        sim.run_until_leader(ELECTION_SETTLE, &mut checker);
        propose_for(
            &mut sim,
            &mut checker,
            Duration::from_secs(5),
            Duration::from_millis(25),
        );
        checker.assert_ok(&sim, &format!("seed {seed}"));
    }
}

#[test]
fn test_simulation_hostile_network_stays_safe() {
    for seed in 0..SWEEP_SEED_COUNT / 5 {
        let (mut sim, mut checker) = simulation(clusters::THREE_NODE, seed, NetworkFaults::HOSTILE);
        propose_for(
            &mut sim,
            &mut checker,
            Duration::from_secs(5),
            Duration::from_millis(30),
        );
        checker.assert_ok(&sim, &format!("seed {seed}"));
    }
}

#[test]
fn test_simulation_leader_crash_recovery() {
    for seed in [100, 200, 300] {
        let (mut sim, mut checker) = simulation(clusters::THREE_NODE, seed, NetworkFaults::RELIABLE);
        let old = sim.run_until_leader(ELECTION_SETTLE, &mut checker).unwrap();
        let old_term = sim.node(old).unwrap().raft().unwrap().current_term();
        propose_for(
            &mut sim,
            &mut checker,
            Duration::from_millis(500),
            Duration::from_millis(20),
        );
        let committed = sim.max_commit_index();

        sim.crash(old);
        let new = sim.run_until_leader(ELECTION_SETTLE, &mut checker).unwrap();
        assert_ne!(new, old, "seed {seed}");
        let new_raft = sim.node(new).unwrap().raft().unwrap();
        assert!(new_raft.current_term() > old_term, "seed {seed}");
        assert!(new_raft.log().last_index() >= committed, "seed {seed}");

        propose_for(
            &mut sim,
            &mut checker,
            Duration::from_millis(500),
            Duration::from_millis(20),
        );
        sim.restart(old);
        sim.run_for(Duration::from_secs(2), &mut checker);

        let old_raft = sim.node(old).unwrap().raft().unwrap();
        assert!(!old_raft.is_leader(), "seed {seed}");
        assert_eq!(old_raft.commit_index(), sim.max_commit_index(), "seed {seed}");
        checker.assert_ok(&sim, &format!("seed {seed}"));
    }
}

#[test]
fn test_simulation_isolated_leader_cannot_commit() {
    let (mut sim, mut checker) = simulation(clusters::FIVE_NODE, 4242, NetworkFaults::RELIABLE);
    let old = sim.run_until_leader(ELECTION_SETTLE, &mut checker).unwrap();
    sim.run_for(Duration::from_millis(100), &mut checker);
    let commit_before = sim.node(old).unwrap().raft().unwrap().commit_index();

    sim.isolate(old);
    let stale = sim
        .propose_on(old, Bytes::from("never-committed"))
        .expect("isolated node still believes it leads");
    sim.run_for(Duration::from_secs(2), &mut checker);

    let old_raft = sim.node(old).unwrap().raft().unwrap();
    assert_eq!(old_raft.commit_index(), commit_before);
    let new = sim.leader().unwrap();
    assert_ne!(new, old);

    sim.propose_on(new, Bytes::from("majority")).unwrap();
    sim.heal();
    sim.run_for(Duration::from_secs(2), &mut checker);

    let old_node = sim.node(old).unwrap();
    let old_raft = old_node.raft().unwrap();
    assert!(!old_raft.is_leader());
    assert!(old_node
        .applied()
        .iter()
        .all(|e| e.data != Bytes::from("never-committed")));
    assert!(old_node.applied().iter().any(|e| e.data == Bytes::from("majority")));
    assert_ne!(
        old_raft.log().entry_at(stale).map(|e| e.data),
        Some(Bytes::from("never-committed"))
    );
    checker.assert_ok(&sim, "seed 4242");
}

#[test]
fn test_simulation_minority_partition_makes_no_progress() {
    let (mut sim, mut checker) = simulation(clusters::FIVE_NODE, 808, NetworkFaults::RELIABLE);
    sim.run_until_leader(ELECTION_SETTLE, &mut checker).unwrap();

    let minority = [NodeId::new(1), NodeId::new(2)];
    let majority = [NodeId::new(3), NodeId::new(4), NodeId::new(5)];
    sim.partition(&minority, &majority);
    sim.run_for(Duration::from_secs(3), &mut checker);

    let leaders = sim.leaders();
    let majority_leader = leaders
        .iter()
        .filter(|(id, _)| majority.contains(id))
        .max_by_key(|(_, term)| *term)
        .map(|(id, _)| *id)
        .expect("majority side elects a leader");
    sim.propose_on(majority_leader, Bytes::from("progress")).unwrap();
    sim.run_for(Duration::from_millis(500), &mut checker);

    for id in minority {
        let raft = sim.node(id).unwrap().raft().unwrap();
        assert!(
            raft.commit_index() < sim.max_commit_index(),
            "{id} committed without a majority"
        );
    }

    sim.heal();
    sim.run_for(Duration::from_secs(3), &mut checker);
    let commit = sim.max_commit_index();
    for node in sim.nodes() {
        assert_eq!(node.raft().unwrap().commit_index(), commit, "{}", node.id());
    }
    checker.assert_ok(&sim, "seed 808");
}

#[test]
fn test_simulation_rolling_restarts_keep_committed_entries() {
    let (mut sim, mut checker) = simulation(clusters::FIVE_NODE, 2024, NetworkFaults::LOSSY);
    sim.run_until_leader(ELECTION_SETTLE, &mut checker);

    for id in 1..=clusters::FIVE_NODE {
        let node = NodeId::new(id);
        propose_for(
            &mut sim,
            &mut checker,
            Duration::from_millis(400),
            Duration::from_millis(20),
        );
        sim.crash(node);
        propose_for(
            &mut sim,
            &mut checker,
            Duration::from_millis(400),
            Duration::from_millis(20),
        );
        sim.restart(node);
    }
    sim.run_for(Duration::from_secs(3), &mut checker);

    assert!(checker.committed_len() > 0);
    checker.assert_ok(&sim, "seed 2024");
}

#[test]
fn test_simulation_repeated_leader_crashes() {
    for &seed in &REGRESSION_SEEDS[..4] {
        let (mut sim, mut checker) = simulation(clusters::FIVE_NODE, seed, NetworkFaults::LOSSY);
        for _ in 0..4 {
            let Some(leader) = sim.run_until_leader(ELECTION_SETTLE, &mut checker) else {
                continue;
            };
            propose_for(
                &mut sim,
                &mut checker,
                Duration::from_millis(300),
                Duration::from_millis(20),
            );
            sim.crash(leader);
            sim.run_for(Duration::from_millis(300), &mut checker);
            sim.restart(leader);
        }
        sim.run_for(Duration::from_secs(2), &mut checker);

        assert!(checker.terms_with_leader() >= 2, "seed {seed}");
        checker.assert_ok(&sim, &format!("seed {seed}"));
    }
}

#[test]
fn test_simulation_seed_sweep() {
    for seed in 0..SWEEP_SEED_COUNT {
        let (mut sim, mut checker) = simulation(clusters::THREE_NODE, seed, NetworkFaults::LOSSY);
        sim.run_until_leader(ELECTION_SETTLE, &mut checker);
        propose_for(
            &mut sim,
            &mut checker,
            Duration::from_secs(2),
            Duration::from_millis(40),
        );
        let victim = NodeId::new(seed % clusters::THREE_NODE + 1);
        sim.crash(victim);
        sim.run_for(Duration::from_secs(1), &mut checker);
        sim.restart(victim);
        sim.run_for(Duration::from_secs(1), &mut checker);
        checker.assert_ok(&sim, &format!("seed {seed}"));
    }
}
