//! Criterion benchmarks for satchel-wallet hot paths.
//!
//! Covers: coin selection over large UTXO sets, fee estimation, key
//! derivation from a seed, and PSBT chunking for transport.

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, ScriptBuf, Txid};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use satchel_core::address::{Network, ScriptType};
use satchel_core::types::{Confirmation, Utxo};
use satchel_wallet::coin_selection::{CoinSelector, SelectionParams};
use satchel_wallet::fee::{estimate_fee, InputProfile};
use satchel_wallet::keys::{parse_path, KeyNode};
use satchel_wallet::mnemonic::mnemonic_to_seed;
use satchel_wallet::transport::{chunk, reassemble};

const PHRASE: &str = "ozone drill grab fiber curtain grace pudding thank cruise elder eight picnic";

fn make_utxos(n: usize) -> Vec<Utxo> {
    (0..n)
        .map(|i| {
            let mut txid = [0u8; 32];
            txid[..8].copy_from_slice(&(i as u64).to_le_bytes());
            Utxo {
                outpoint: OutPoint::new(Txid::from_byte_array(txid), 0),
                value: 5_000 + (i as u64 * 7_919) % 250_000,
                script_pubkey: ScriptBuf::new(),
                confirmation: Confirmation::Confirmed { height: i as u32 },
            }
        })
        .collect()
}

fn bench_coin_selection(c: &mut Criterion) {
    let params = SelectionParams::new(InputProfile::P2wpkh, vec![22], 22);
    let mut group = c.benchmark_group("coin_selection");
    for n in [10usize, 100, 1_000] {
        let utxos = make_utxos(n);
        let target = utxos.iter().map(|u| u.value).sum::<u64>() / 3;
        group.bench_with_input(BenchmarkId::from_parameter(n), &utxos, |b, utxos| {
            b.iter(|| {
                let mut selector = CoinSelector::new();
                selector.select(black_box(utxos), target, 5, &params)
            })
        });
    }
    group.finish();
}

fn bench_fee(c: &mut Criterion) {
    let inputs = vec![InputProfile::P2wpkh; 20];
    let multisig = vec![
        InputProfile::Multisig {
            script_type: ScriptType::P2wsh,
            m: 2,
            n: 3,
        };
        20
    ];

    c.bench_function("estimate_fee_p2wpkh_20", |b| {
        b.iter(|| estimate_fee(black_box(&inputs), &[22, 22], 10))
    });

    c.bench_function("estimate_fee_p2wsh_2of3_20", |b| {
        b.iter(|| estimate_fee(black_box(&multisig), &[34, 34], 10))
    });
}

fn bench_derivation(c: &mut Criterion) {
    let seed = mnemonic_to_seed(PHRASE, "").expect("valid phrase");
    let path = parse_path("m/84'/0'/0'/0/0").expect("valid path");

    c.bench_function("mnemonic_to_seed", |b| {
        b.iter(|| mnemonic_to_seed(black_box(PHRASE), ""))
    });

    c.bench_function("derive_bip84_leaf", |b| {
        b.iter(|| {
            KeyNode::master(&seed, Network::Mainnet)
                .and_then(|master| master.derive_path(black_box(&path)))
        })
    });
}

fn bench_transport(c: &mut Criterion) {
    let payload: Vec<u8> = (0..16_384u32).map(|i| (i % 251) as u8).collect();
    let chunks = chunk(&payload, 200).expect("chunkable");

    c.bench_function("chunk_16k", |b| b.iter(|| chunk(black_box(&payload), 200)));

    c.bench_function("reassemble_16k", |b| {
        b.iter(|| reassemble(black_box(&chunks)))
    });
}

criterion_group!(
    benches,
    bench_coin_selection,
    bench_fee,
    bench_derivation,
    bench_transport
);
criterion_main!(benches);
