//! Makes a fixed set of allocation calls straight through libc, to be run
//! with `LD_PRELOAD=libmemtrace.so`. Some scenarios are undefined behaviour
//! without the tracer in front of libc.
//!
//! ```plaintext
//! memtrace-driver clean|double-free|illegal-free|leak|realloc-freed
//! ```

use std::{hint::black_box, process::ExitCode};

use libc::c_void;

fn main() -> ExitCode {
    let Some(scenario) = std::env::args().nth(1) else {
        eprintln!("usage: memtrace-driver <scenario>");
        return ExitCode::from(2);
    };

    // black_box keeps the compiler from pairing up and deleting the calls
    unsafe {
        match scenario.as_str() {
            "clean" => {
                let p = black_box(libc::malloc(64));
                let q = black_box(libc::calloc(4, 16));
                let p = black_box(libc::realloc(p, 128));
                libc::free(p);
                libc::free(q);
            }
            "double-free" => {
                let p = black_box(libc::malloc(64));
                libc::free(p);
                libc::free(black_box(p));
            }
            "illegal-free" => libc::free(black_box(0xdead_0000 as *mut c_void)),
            "leak" => {
                black_box(libc::malloc(1234));
            }
            "realloc-freed" => {
                let p = black_box(libc::malloc(16));
                libc::free(p);
                if !black_box(libc::realloc(black_box(p), 32)).is_null() {
                    return ExitCode::FAILURE;
                }
            }
            other => {
                eprintln!("unknown scenario `{other}`");
                return ExitCode::from(2);
            }
        }
    }
    ExitCode::SUCCESS
}
