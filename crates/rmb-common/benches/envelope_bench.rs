use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rmb_common::envelope::{Body, Payload, Request};
use rmb_common::{Address, E2eKey, Envelope, KeyType, Signer};

fn request_1kb() -> Envelope {
    Envelope {
        uid: "5f0c3e8e-1b7a-4c55-9a42-0b8f6d7a1e21".into(),
        timestamp: 1_700_000_000,
        expiration: 300,
        source: Some(Address::twin(7)),
        destination: Some(Address::session(9, "worker")),
        body: Some(Body::Request(Request {
            command: "deployment.get".into(),
        })),
        schema: Some("application/json".into()),
        federation: Some("relay.example".into()),
        payload: Some(Payload::Plain(vec![0xAB; 1024])),
        ..Default::default()
    }
}

fn bench_serialize(c: &mut Criterion) {
    let env = request_1kb();
    c.bench_function("envelope_serialize_1kb", |b| {
        b.iter(|| black_box(env.serialize()));
    });
}

fn bench_parse(c: &mut Criterion) {
    let bytes = request_1kb().serialize();
    c.bench_function("envelope_parse_1kb", |b| {
        b.iter(|| black_box(Envelope::parse(&bytes).unwrap()));
    });
}

fn bench_challenge(c: &mut Criterion) {
    let env = request_1kb();
    c.bench_function("envelope_challenge_1kb", |b| {
        b.iter(|| black_box(env.challenge()));
    });
}

fn bench_sign_verify(c: &mut Criterion) {
    for kt in [KeyType::Ed25519, KeyType::Sr25519] {
        let signer = Signer::from_seed(kt, &[0x11; 32]).unwrap();
        let mut env = request_1kb();
        env.sign(&signer);
        let pk = signer.public_key();

        c.bench_function(&format!("envelope_sign_{kt}"), |b| {
            b.iter(|| {
                let mut e = env.clone();
                e.sign(&signer);
                black_box(e)
            });
        });
        c.bench_function(&format!("envelope_verify_{kt}"), |b| {
            b.iter(|| black_box(env.verify(&pk).unwrap()));
        });
    }
}

fn bench_seal_open(c: &mut Criterion) {
    let alice = E2eKey::from_bytes(&[1; 32]).unwrap();
    let bob = E2eKey::from_bytes(&[2; 32]).unwrap();
    let bob_pub = bob.public_key();
    let alice_pub = alice.public_key();
    let plaintext = vec![0xCD; 1024];
    let sealed = alice.seal(&bob_pub, &plaintext).unwrap();

    c.bench_function("seal_1kb", |b| {
        b.iter(|| black_box(alice.seal(&bob_pub, &plaintext).unwrap()));
    });
    c.bench_function("open_1kb", |b| {
        b.iter(|| black_box(bob.open(&alice_pub, &sealed).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_serialize,
    bench_parse,
    bench_challenge,
    bench_sign_verify,
    bench_seal_open
);
criterion_main!(benches);
