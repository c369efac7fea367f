//! Fuzz target for whole-system operation sequences
//!
//! Drives a `SimWorld` (relay plus participants, in-process) with arbitrary
//! operations and checks the standard transfer invariants after each one.
//!
//! # Invariants
//!
//! - Receivers only hold chunks inside the manifest
//! - Progress never goes backwards while a room is joined
//! - A relay confirmation implies the receiver holds the whole file
//! - The sender's confirmation view never exceeds the relay's

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use relaydrop_harness::{FaultConfig, InvariantRegistry, SimWorld, WorldOp};

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u64,
    participants: u8,
    faulty: bool,
    ops: Vec<WorldOp>,
}

fuzz_target!(|scenario: Scenario| {
    let faults = if scenario.faulty { FaultConfig::lossy() } else { FaultConfig::NONE };
    let mut world = SimWorld::with_faults(scenario.seed, faults);
    for _ in 0..(scenario.participants % 4) + 2 {
        world.add_participant();
    }

    let registry = InvariantRegistry::standard();
    for (i, op) in scenario.ops.iter().take(256).enumerate() {
        op.apply(&mut world).expect("operations never fail on a valid world");
        registry.assert_all(&world.snapshot(), &format!("op {i} {op:?}"));
    }
});
