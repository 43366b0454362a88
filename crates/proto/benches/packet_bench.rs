//! Packet layer benchmarks.
//!
//! Measures encode and decode throughput for the built-in ciphers.
//!
//! Run with: `cargo bench --bench packet_bench`

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use latch_proto::ssh::crypto::{
    new_aes128_ctr, new_aes256_gcm, new_chacha20_poly1305, new_hmac_sha256, CipherMode,
};
use latch_proto::ssh::packet::{CompressionState, DirectionKeys};
use latch_proto::ssh::{PacketDecoder, PacketEncoder};

const PAYLOAD_SIZES: [usize; 3] = [64, 1024, 32 * 1024];

/// Builds matching keys for both ends of one direction.
fn keys(cipher: &str) -> (DirectionKeys, DirectionKeys) {
    let key = [0x42u8; 64];
    let iv = [0x24u8; 16];
    let make = |mode: CipherMode| match cipher {
        "chacha20-poly1305@openssh.com" => DirectionKeys {
            cipher: new_chacha20_poly1305(&key, &[], mode).unwrap(),
            mac: None,
            etm: false,
            compression: CompressionState::None,
        },
        "aes256-gcm@openssh.com" => DirectionKeys {
            cipher: new_aes256_gcm(&key[..32], &iv[..12], mode).unwrap(),
            mac: None,
            etm: false,
            compression: CompressionState::None,
        },
        _ => DirectionKeys {
            cipher: new_aes128_ctr(&key[..16], &iv, mode).unwrap(),
            mac: Some(new_hmac_sha256(&key[..32]).unwrap()),
            etm: true,
            compression: CompressionState::None,
        },
    };
    (make(CipherMode::Encrypt), make(CipherMode::Decrypt))
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_encode");
    for cipher in [
        "chacha20-poly1305@openssh.com",
        "aes256-gcm@openssh.com",
        "aes128-ctr+hmac-sha2-256-etm",
    ] {
        for size in PAYLOAD_SIZES {
            let payload = vec![0xA5u8; size];
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::new(cipher, size), &payload, |b, payload| {
                let (outbound, _) = keys(cipher);
                let mut encoder = PacketEncoder::new();
                encoder.install(outbound, false);
                b.iter(|| black_box(encoder.encode(black_box(payload)).unwrap()));
            });
        }
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_decode");
    for cipher in [
        "chacha20-poly1305@openssh.com",
        "aes256-gcm@openssh.com",
        "aes128-ctr+hmac-sha2-256-etm",
    ] {
        let size = 1024;
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(BenchmarkId::new(cipher, size), |b| {
            b.iter_batched(
                || {
                    // Fresh pair so both sequence numbers stay in step
                    let (outbound, inbound) = keys(cipher);
                    let mut encoder = PacketEncoder::new();
                    encoder.install(outbound, false);
                    let mut decoder = PacketDecoder::new(256 * 1024);
                    decoder.install(inbound, false);
                    let wire = encoder.encode(&vec![0x5Au8; size]).unwrap();
                    (decoder, BytesMut::from(wire.as_slice()))
                },
                |(mut decoder, mut buf)| black_box(decoder.decode(&mut buf).unwrap()),
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
