// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Deadlock detection tests using parking_lot's built-in deadlock detector.
//!
//! These tests drive the engine's locking paths (customer leases, the
//! idempotency registries, the ledger partitions and the directory) from
//! many threads and verify no lock cycle forms.
//!
//! The customer leases are parking_lot mutexes; with the `deadlock_detection`
//! feature the detector sees every thread blocked on one.

use loyalty_ledger::{
    CustomerId, Engine, IdempotencyKey, InMemoryDirectory, PosCustomerId, PosOrderEvent, TenantId,
    ingest_pos_order,
};
use parking_lot::deadlock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

const TENANT: TenantId = TenantId(1);

// === Deadlock Detection Infrastructure ===

/// Starts a background thread that checks for deadlocks.
/// Returns a handle to stop the detector.
fn start_deadlock_detector() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    thread::spawn(move || {
        while running_clone.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
            let deadlocks = deadlock::check_deadlock();
            if !deadlocks.is_empty() {
                eprintln!("\n=== DEADLOCK DETECTED ===");
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("\nDeadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}", t.thread_id());
                        eprintln!("Backtrace:\n{:#?}", t.backtrace());
                    }
                }
                panic!("Deadlock detected! See output above for details.");
            }
        }
    });

    running
}

/// Stops the deadlock detector.
fn stop_deadlock_detector(running: Arc<AtomicBool>) {
    running.store(false, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150)); // Let detector thread exit
}

fn engine_with_customers(n: usize) -> (Arc<Engine>, Vec<CustomerId>) {
    let engine = Arc::new(Engine::new(InMemoryDirectory::new()));
    let customers = (0..n).map(|_| engine.directory().register(TENANT)).collect();
    (engine, customers)
}

// === Tests ===

/// High contention on a single customer with many threads.
#[test]
fn no_deadlock_high_contention_single_customer() {
    let detector = start_deadlock_detector();
    let (engine, customers) = engine_with_customers(1);
    let customer = customers[0];
    let key_counter = Arc::new(AtomicU32::new(1));

    const NUM_THREADS: usize = 50;
    const OPS_PER_THREAD: usize = 100;

    let mut handles = Vec::with_capacity(NUM_THREADS);

    for _ in 0..NUM_THREADS {
        let engine = engine.clone();
        let key_counter = key_counter.clone();

        let handle = thread::spawn(move || {
            for i in 0..OPS_PER_THREAD {
                let n = key_counter.fetch_add(1, Ordering::SeqCst);

                match i % 4 {
                    0 => {
                        let key = IdempotencyKey::new(format!("o{n}"));
                        engine
                            .create_order_and_earn(TENANT, customer, 1_000, Some(key))
                            .unwrap();
                    }
                    1 => {
                        let key = IdempotencyKey::new(format!("r{}", n % 10));
                        let _ = engine.redeem(TENANT, customer, 3, "gift", Some(key));
                    }
                    2 => {
                        let _ = engine.redeem(TENANT, customer, 1, "gift", None);
                    }
                    _ => {
                        let _ = engine.balance(TENANT, customer);
                        let _ = engine.list_ledger(TENANT, customer, Some(20), None);
                    }
                }
            }
        });

        handles.push(handle);
    }

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    stop_deadlock_detector(detector);

    assert!(engine.balance(TENANT, customer) >= 0);
    assert_eq!(engine.store().order_count(), NUM_THREADS * OPS_PER_THREAD / 4);
}

/// Shared order keys force registry races across different customer leases.
#[test]
fn no_deadlock_shared_order_keys_across_customers() {
    let detector = start_deadlock_detector();
    let (engine, customers) = engine_with_customers(20);
    let customers = Arc::new(customers);

    const NUM_THREADS: usize = 20;
    const KEYS: u32 = 200;

    let mut handles = Vec::with_capacity(NUM_THREADS);

    for t in 0..NUM_THREADS {
        let engine = engine.clone();
        let customers = customers.clone();

        handles.push(thread::spawn(move || {
            for k in 0..KEYS {
                let customer = customers[(t + k as usize) % customers.len()];
                let key = IdempotencyKey::new(format!("shared-{k}"));
                engine
                    .create_order_and_earn(TENANT, customer, 100, Some(key))
                    .unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    stop_deadlock_detector(detector);

    assert_eq!(engine.store().order_count(), KEYS as usize);
    let total: i64 = customers.iter().map(|c| engine.balance(TENANT, *c)).sum();
    assert_eq!(total, KEYS as i64);
}

/// Webhook ingestion registers customers while orders are being written.
#[test]
fn no_deadlock_webhook_ingestion_with_redemptions() {
    let detector = start_deadlock_detector();
    let engine = Arc::new(Engine::new(InMemoryDirectory::new()));

    const NUM_THREADS: usize = 16;
    const EVENTS_PER_THREAD: usize = 100;

    let mut handles = Vec::with_capacity(NUM_THREADS);

    for t in 0..NUM_THREADS {
        let engine = engine.clone();

        handles.push(thread::spawn(move || {
            for i in 0..EVENTS_PER_THREAD {
                let event = PosOrderEvent {
                    pos_customer_id: PosCustomerId(format!("pos-{}", i % 8)),
                    subtotal_cents: 500,
                    idempotency_key: Some(IdempotencyKey::new(format!("evt-{}", i % 50))),
                };
                let receipt = ingest_pos_order(&engine, TENANT, event).unwrap();

                if t % 2 == 0 {
                    let _ = engine.redeem(TENANT, receipt.order.customer_id, 2, "gift", None);
                }
            }
        }));
    }

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    stop_deadlock_detector(detector);

    assert_eq!(engine.store().order_count(), 50);
    assert_eq!(engine.directory().len(), 8);
    for (tenant, customer) in engine.customers() {
        assert!(engine.balance(tenant, customer) >= 0);
    }
}

/// Readers never take leases and must not block writers indefinitely.
#[test]
fn no_deadlock_concurrent_reads_and_writes() {
    let detector = start_deadlock_detector();
    let (engine, customers) = engine_with_customers(10);
    let customers = Arc::new(customers);
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let customers = customers.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    for customer in customers.iter() {
                        assert!(engine.balance(TENANT, *customer) >= 0);
                        let page = engine.list_ledger(TENANT, *customer, None, None).unwrap();
                        assert!(page.entries.windows(2).all(|w| w[0].id > w[1].id));
                    }
                }
            })
        })
        .collect();

    let writers: Vec<_> = (0..8)
        .map(|w| {
            let engine = engine.clone();
            let customers = customers.clone();
            thread::spawn(move || {
                for i in 0..250 {
                    let customer = customers[(w + i) % customers.len()];
                    engine.earn(TENANT, customer, None, 2).unwrap();
                    let _ = engine.redeem(TENANT, customer, 1, "gift", None);
                }
            })
        })
        .collect();

    for writer in writers {
        writer.join().expect("Writer panicked");
    }
    stop.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.join().expect("Reader panicked");
    }

    stop_deadlock_detector(detector);

    let total: i64 = customers.iter().map(|c| engine.balance(TENANT, *c)).sum();
    assert_eq!(total, 8 * 250 * (2 - 1));
}
