//! Packet codec benchmarks.
//!
//! Measures framing cost with no protection and with the common
//! aes128-ctr + hmac-sha2-256 suite.
//!
//! Run with: `cargo bench --bench packet_bench`

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use kiln_platform::mock::MockRandom;
use kiln_proto::ssh::compression::{Compressor, Decompressor};
use kiln_proto::ssh::config::Role;
use kiln_proto::ssh::crypto::{CipherSuite, HashAlgorithm};
use kiln_proto::ssh::PacketCodec;

const SIZES: [usize; 3] = [64, 1500, 32 * 1024];

/// A client-side sending codec and the server-side codec that reads it.
fn keyed_pair(cipher: &str, mac: &str) -> (PacketCodec, PacketCodec) {
    let shared_secret = [0x5au8; 256];
    let exchange_hash = [0x11u8; 32];

    let mut halves = Vec::new();
    for role in [Role::Client, Role::Server] {
        let mut suite = CipherSuite::new(cipher, cipher, mac, mac).unwrap();
        let keys = suite.derive_keys(
            HashAlgorithm::Sha256,
            role,
            &shared_secret,
            &exchange_hash,
            &exchange_hash,
        );
        suite.set_keys(&keys).unwrap();
        halves.push(suite.into_halves().unwrap());
    }
    let (client_sealer, _) = halves.remove(0);
    let (_, server_opener) = halves.remove(0);

    let mut sender = PacketCodec::new(256 * 1024);
    sender.set_outgoing(client_sealer, Compressor::new("none").unwrap());
    let mut receiver = PacketCodec::new(256 * 1024);
    receiver.set_incoming(server_opener, Decompressor::new("none").unwrap());
    (sender, receiver)
}

fn bench_suite(c: &mut Criterion, label: &str, cipher: &str, mac: &str) {
    let mut group = c.benchmark_group(label);

    for size in SIZES {
        let payload = vec![0x42u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("encode_{}bytes", size), |b| {
            let (mut sender, _) = keyed_pair(cipher, mac);
            let mut rng = MockRandom::new(1);
            b.iter(|| black_box(sender.encode(94, &payload, &mut rng).unwrap()));
        });

        group.bench_function(format!("round_trip_{}bytes", size), |b| {
            let (mut sender, mut receiver) = keyed_pair(cipher, mac);
            let mut rng = MockRandom::new(1);
            b.iter(|| {
                let wire = sender.encode(94, &payload, &mut rng).unwrap();
                let mut buf = BytesMut::from(&wire[..]);
                black_box(receiver.decode(&mut buf).unwrap().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_plaintext(c: &mut Criterion) {
    bench_suite(c, "packet_none", "none", "none");
}

fn bench_aes_ctr_hmac(c: &mut Criterion) {
    bench_suite(c, "packet_aes128ctr_hmac_sha256", "aes128-ctr", "hmac-sha2-256");
}

criterion_group!(benches, bench_plaintext, bench_aes_ctr_hmac);
criterion_main!(benches);
