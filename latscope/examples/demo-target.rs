//! Demo target - one function worth measuring
//!
//! Calls `handle_request` in a loop on a few threads; each call sleeps for a
//! random 1-20 ms and returns through one of two exits.
//!
//! Run with: cargo run --example demo-target -- [CALLS]
//! Measure with: sudo latscope demo-target --symbol handle_request

#![allow(unsafe_code)] // #[no_mangle]

use rand::Rng;
use std::thread;
use std::time::Duration;

const THREADS: u64 = 4;

/// Kept out of line and unmangled so the symbol can be found by name
#[no_mangle]
#[inline(never)]
pub extern "C" fn handle_request(id: u64) -> u64 {
    let delay = rand::thread_rng().gen_range(1..=20);
    thread::sleep(Duration::from_millis(delay));

    // Two return paths: the exit scan must probe both
    if id % 2 == 0 {
        return delay;
    }
    delay + 1
}

fn main() {
    let calls: u64 = std::env::args().nth(1).and_then(|n| n.parse().ok()).unwrap_or(u64::MAX);
    println!("🚀 demo-target pid {} ({calls} calls per thread)", std::process::id());

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            thread::spawn(move || {
                let mut total = 0u64;
                for i in 0..calls {
                    total = total.wrapping_add(std::hint::black_box(handle_request(t + i)));
                    thread::sleep(Duration::from_millis(5));
                }
                total
            })
        })
        .collect();

    for worker in workers {
        let _ = worker.join();
    }
    println!("✓ done");
}
