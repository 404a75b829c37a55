//! Shared helpers for the integration suites.

use std::sync::Once;

use cooptask::Value;

static INIT: Once = Once::new();

/// Installs the test tracing subscriber once per process. Honors
/// `RUST_LOG` so a failing suite can be rerun with traces enabled.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Unwraps an `i32` payload.
#[allow(dead_code)]
pub fn as_i32(v: &Value) -> i32 {
    *v.downcast_ref::<i32>().expect("payload should be an i32")
}

/// Unwraps a `&'static str` payload.
#[allow(dead_code)]
pub fn as_str(v: &Value) -> &'static str {
    *v.downcast_ref::<&'static str>()
        .expect("payload should be a str")
}
