//! Property tests over random operation sequences.
//!
//! proptest generates `Vec<WorldOp>` against a world of a few participants;
//! the standard invariants must hold after every operation, with and without
//! injected faults. A final heal phase reconnects everyone and checks the
//! world settles without breaking them.

use arbitrary::{Arbitrary, Unstructured};
use proptest::prelude::*;
use relaydrop_harness::{FaultConfig, InvariantRegistry, PeerId, RoomSlot, SimWorld, WorldOp};

fn operation_strategy() -> impl Strategy<Value = WorldOp> {
    let peer = any::<PeerId>();
    let room = any::<RoomSlot>();

    prop_oneof![
        2 => peer.clone().prop_map(|peer| WorldOp::Connect { peer }),
        1 => peer.clone().prop_map(|peer| WorldOp::Disconnect { peer }),
        2 => (peer.clone(), room.clone()).prop_map(|(peer, room)| WorldOp::CreateRoom { peer, room }),
        3 => (peer.clone(), room).prop_map(|(peer, room)| WorldOp::JoinRoom { peer, room }),
        2 => peer.clone().prop_map(|peer| WorldOp::StartTransfer { peer }),
        1 => peer.prop_map(|peer| WorldOp::LeaveRoom { peer }),
        4 => any::<u8>().prop_map(|frames| WorldOp::Deliver { frames }),
        1 => any::<u16>().prop_map(|millis| WorldOp::AdvanceTime { millis }),
        1 => Just(WorldOp::ReconnectLost),
    ]
}

fn world(seed: u64, participants: usize, faulty: bool) -> SimWorld {
    let faults = if faulty { FaultConfig::lossy() } else { FaultConfig::NONE };
    let mut world = SimWorld::with_faults(seed, faults);
    for _ in 0..participants {
        world.add_participant();
    }
    world
}

proptest! {
    /// Invariants hold after every operation of any sequence.
    #[test]
    fn prop_invariants_hold_after_every_op(
        seed in any::<u64>(),
        participants in 2..5usize,
        faulty in any::<bool>(),
        ops in prop::collection::vec(operation_strategy(), 0..80)
    ) {
        let mut world = world(seed, participants, faulty);
        let registry = InvariantRegistry::standard();

        for (i, op) in ops.iter().enumerate() {
            let result = op.apply(&mut world);
            prop_assert!(result.is_ok(), "op {} {:?} failed: {:?}", i, op, result);

            let violations = registry.check_all(&world.snapshot());
            prop_assert!(
                violations.is_ok(),
                "after op {} {:?} (seed {}): {:?}",
                i, op, seed, violations
            );
        }
    }

    /// Reconnecting everyone and letting time pass never breaks an invariant
    /// and leaves every participant connected.
    #[test]
    fn prop_heal_settles(
        seed in any::<u64>(),
        participants in 2..4usize,
        ops in prop::collection::vec(operation_strategy(), 0..40)
    ) {
        let mut world = world(seed, participants, false);
        for op in &ops {
            prop_assert!(op.apply(&mut world).is_ok());
        }

        for who in 0..participants {
            prop_assert!(world.connect(who).is_ok());
        }
        let registry = InvariantRegistry::standard();
        let settled = world.settle_until(30, |w| {
            registry.assert_all(&w.snapshot(), &format!("heal, seed {seed}"));
            false
        });
        prop_assert!(settled.is_ok());

        for who in 0..participants {
            prop_assert!(world.is_connected(who), "participant {} offline after heal", who);
            prop_assert!(world.client(who).is_authenticated());
        }
        prop_assert_eq!(world.relay().connection_count(), participants);
    }
}

/// The fuzzing entry point builds operations with `arbitrary`; the same
/// bytes must always produce the same run.
#[test]
fn arbitrary_ops_are_deterministic() {
    let bytes: Vec<u8> = (0..2048u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8).collect();

    let run = || {
        let mut u = Unstructured::new(&bytes);
        let ops = Vec::<WorldOp>::arbitrary(&mut u).unwrap();
        let mut world = world(99, 3, true);
        for op in &ops {
            op.apply(&mut world).unwrap();
        }
        (ops.len(), world.snapshot())
    };

    let (len_a, a) = run();
    let (len_b, b) = run();
    assert_eq!(len_a, len_b);
    assert_eq!(a, b);
}
