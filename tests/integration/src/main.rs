//! Integration Test Harness
//!
//! Runs all integration test categories and reports a summary.
//!
//! # Usage
//!
//! Run everything:
//! ```
//! cargo run -p integration-tests
//! ```
//!
//! Run a single category:
//! ```
//! cargo test -p integration-tests --test transport_tests
//! cargo test -p integration-tests --test query_lifecycle_tests
//! cargo test -p integration-tests --test cache_tests
//! cargo test -p integration-tests --test registry_tests
//! ```
//!
//! Run with increased logging:
//! ```
//! RUST_LOG=debug cargo test -p integration-tests --test transport_tests
//! ```

use std::process::Command;
use std::time::Instant;

struct TestCategory {
    name: &'static str,
    description: &'static str,
    test_name: &'static str,
}

const TEST_CATEGORIES: &[TestCategory] = &[
    TestCategory {
        name: "Transport Tests",
        description: "Frame transport, adapters, timeouts, channel separation",
        test_name: "transport_tests",
    },
    TestCategory {
        name: "Query Lifecycle Tests",
        description: "Search/preview/activate across two runtimes, cancel, cardinality",
        test_name: "query_lifecycle_tests",
    },
    TestCategory {
        name: "Cache Tests",
        description: "Surfacing cache write and offline replay",
        test_name: "cache_tests",
    },
    TestCategory {
        name: "Registry Tests",
        description: "Locate, launch-on-demand, state notification",
        test_name: "registry_tests",
    },
];

fn main() {
    println!("scopes middleware integration suite");
    println!("===================================");

    let mut failures = Vec::new();
    let started = Instant::now();

    for category in TEST_CATEGORIES {
        println!();
        println!("--- {} ---", category.name);
        println!("    {}", category.description);

        let category_started = Instant::now();
        let status = Command::new("cargo")
            .args([
                "test",
                "-p",
                "integration-tests",
                "--test",
                category.test_name,
            ])
            .status();

        match status {
            Ok(status) if status.success() => {
                println!(
                    "    PASS ({:.1}s)",
                    category_started.elapsed().as_secs_f64()
                );
            }
            Ok(status) => {
                println!("    FAIL (exit: {})", status);
                failures.push(category.name);
            }
            Err(e) => {
                println!("    FAIL (cannot run cargo: {})", e);
                failures.push(category.name);
            }
        }
    }

    println!();
    println!("===================================");
    println!(
        "{}/{} categories passed in {:.1}s",
        TEST_CATEGORIES.len() - failures.len(),
        TEST_CATEGORIES.len(),
        started.elapsed().as_secs_f64()
    );
    if !failures.is_empty() {
        for name in &failures {
            println!("  failed: {}", name);
        }
        std::process::exit(1);
    }
}
