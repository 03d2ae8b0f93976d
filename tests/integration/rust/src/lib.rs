//! Integration test suite for the JIT runtime
//!
//! These tests drive compiled code the way the code generator would,
//! across the allocator, the object heap and the runtime operations.

/// Re-export components for test convenience
pub mod components {
    pub use core_types;
    pub use jit_runtime;
    pub use memory_manager;
}

/// Installs a test subscriber so `RUST_LOG` works in failing tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
