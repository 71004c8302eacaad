use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ojir_mail_ingest::models::{Direction, ParsedTransaction, Wallet};

fn parsed(bank: &str, account: &str) -> ParsedTransaction {
    ParsedTransaction {
        recipient: "Toko Maju".to_string(),
        amount: 5_000_000,
        fee: 250_000,
        total_amount: 5_250_000,
        currency: "IDR".to_string(),
        ref_no: "2026/10/19/000123".to_string(),
        source_account: Some(account.to_string()),
        destination_account: Some("9876543210".to_string()),
        direction: Direction::Out,
        bank: bank.to_string(),
    }
}

fn benchmark_wallet_matching(c: &mut Criterion) {
    // A heavy user: many wallets across several banks
    let banks = ["bca", "mandiri", "bni", "bri", "jago"];
    let wallets: Vec<Wallet> = (0..50)
        .map(|i| Wallet {
            id: format!("wallet-{i}"),
            user_id: "user-1".to_string(),
            bank: banks[i % banks.len()].to_string(),
            account_number: Some(format!("00012{:05}", i)),
        })
        .collect();

    let last = parsed("bri", "xxxx0048");
    let none = parsed("bca", "xxxx9999");

    let mut group = c.benchmark_group("wallet_matching");

    group.bench_function("match_near_end", |b| {
        b.iter(|| wallets.iter().find(|w| w.matches(black_box(&last))))
    });

    group.bench_function("no_match", |b| {
        b.iter(|| wallets.iter().find(|w| w.matches(black_box(&none))))
    });

    group.bench_function("idempotency_key", |b| {
        b.iter(|| black_box(&last).idempotency_key())
    });

    group.finish();
}

criterion_group!(benches, benchmark_wallet_matching);
criterion_main!(benches);
