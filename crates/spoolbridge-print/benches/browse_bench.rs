// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Criterion benchmarks for the text paths hit on every announcement: queue
// name sanitizing and legacy browse packet parsing and formatting.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use spoolbridge_core::sanitize::{SanitizeMode, sanitize};
use spoolbridge_print::legacy::BrowsePacket;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const PACKET: &str = "801c 3 ipp://192.168.1.20:631/printers/Office_Laser \
\"Second floor, room 214\" \"Office Laser\" \"HP LaserJet 400 M401dne\" \
lease-duration=300 uuid=urn:uuid:5b8e0c2a-1d2f-4c55-9e55-0f7f4c1a2b3c \
job-sheets=none,none media=iso_a4_210x297mm sides=two-sided-long-edge \
printer-info=Office\\ Laser\\ \\\"east\\\"\n";

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_sanitize(c: &mut Criterion) {
    c.bench_function("sanitize (queue name)", |b| {
        b.iter(|| sanitize(black_box("HP LaserJet 400 M401dne (Office #2)"), SanitizeMode::Name));
    });

    c.bench_function("sanitize (pdl list)", |b| {
        b.iter(|| {
            sanitize(
                black_box("application/pdf, image/pwg-raster, image/urf, application/PCLm"),
                SanitizeMode::MimeList,
            )
        });
    });
}

fn bench_packet_parse(c: &mut Criterion) {
    c.bench_function("browse packet parse", |b| {
        b.iter(|| {
            let packet = BrowsePacket::parse(black_box(PACKET));
            assert!(packet.is_ok());
        });
    });
}

fn bench_packet_encode(c: &mut Criterion) {
    let packet = BrowsePacket::parse(PACKET).expect("fixture packet parses");

    c.bench_function("browse packet encode", |b| {
        b.iter(|| {
            let text = black_box(&packet).encode();
            black_box(text)
        });
    });
}

criterion_group!(benches, bench_sanitize, bench_packet_parse, bench_packet_encode);
criterion_main!(benches);
