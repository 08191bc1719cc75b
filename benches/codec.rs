use std::net::SocketAddr;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use udprpc::{Envelope, IdentityValidator, LocalIdentity, MessageId};

const SEED: &str = "af5385ce253b477a3b22b70af7b12515be847dff3455e810be3d5aaef33f77df";

fn identity() -> LocalIdentity {
    let mut seed = [0u8; 32];
    hex::decode_to_slice(SEED, &mut seed).unwrap();
    LocalIdentity::from_seed(seed)
}

fn envelope(identity: &LocalIdentity) -> Envelope {
    let addr: SocketAddr = "198.51.100.1:18467".parse().unwrap();
    Envelope {
        message_id: MessageId::random(),
        sender: identity.peer(addr, false),
        command: "FIND_NODE".into(),
        arguments: (0..8).map(|i| format!("{i:040x}")).collect(),
        testnet: false,
    }
}

fn bench_envelope(c: &mut Criterion) {
    let local = identity();
    let envelope = envelope(&local);
    let encoded = envelope.encode().unwrap();

    c.bench_function("envelope_encode", |b| {
        b.iter(|| black_box(&envelope).encode().unwrap())
    });
    c.bench_function("envelope_decode", |b| {
        b.iter(|| Envelope::decode(black_box(&encoded)).unwrap())
    });
}

fn bench_identity(c: &mut Criterion) {
    let local = identity();
    let validator = IdentityValidator::default();
    let guid = local.guid();
    let key = local.signed_public_key().clone();

    c.bench_function("identity_validate", |b| {
        b.iter(|| validator.validate(black_box(&guid), black_box(&key)).unwrap())
    });
}

criterion_group!(benches, bench_envelope, bench_identity);
criterion_main!(benches);
