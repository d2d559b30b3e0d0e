// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Benchmark for single verification passes.
//!
//! Measures one exhaustive pass over every active port of the simulated
//! platform, including peer resolution for the topology check.

use criterion::{criterion_group, criterion_main, Criterion};

use upilib::platform::PlatformFamily;
use upilib::sim::{SimDebug, SimState};
use upilib::verify::{LinkVerifier, UpiCheck};

fn bench_verify_lanes(c: &mut Criterion) {
    let debug = SimDebug::new(SimState::four_socket_mesh(PlatformFamily::SPR));
    c.bench_function("verify_lanes_4s", |b| {
        b.iter(|| {
            let verifier = LinkVerifier::new(&debug).unwrap();
            let _ = verifier.verify_lanes();
        });
    });
}

fn bench_all_checks(c: &mut Criterion) {
    let debug = SimDebug::new(SimState::random_mesh(PlatformFamily::GNR, 8, 42));
    c.bench_function("all_checks_gnr_8s", |b| {
        b.iter(|| {
            let verifier = LinkVerifier::new(&debug).unwrap();
            for check in UpiCheck::ALL {
                let _ = verifier.run_check(check, None);
            }
        });
    });
}

criterion_group!(benches, bench_verify_lanes, bench_all_checks);
criterion_main!(benches);
