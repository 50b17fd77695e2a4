//! Spawns a few cooperating fibers and prints a symbolized stack trace
//! from inside one of them.
//!
//! ```sh
//! RUST_LOG=trace cargo run --example fibers
//! ```

use keel::fiber::{any_ready, spawn, yield_now};
use keel::trace::{capture, format_trace, SymbolLookup};

fn main() {
    // The runtime core only emits `tracing` events; a subscriber makes
    // them visible.
    tracing_subscriber::fmt::init();

    for tag in 1..=3u32 {
        spawn(move || {
            println!("fiber {tag}: first half");
            yield_now();
            println!("fiber {tag}: second half");

            if tag == 2 {
                let trace = capture(0);
                println!("fiber {tag} stack ({} frames):", trace.count());
                print!("{}", format_trace(&trace, &SymbolLookup::new()));
            }
        });
    }

    while any_ready() {
        yield_now();
    }
    println!("all fibers done");
}
