#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! Helpers shared by the test suites of this workspace.

use std::{env, sync::Once};

pub use tempfile;

/// Catch-all error type for test code.
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Catch-all result type for test code.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Return a temporary directory that is deleted when the object is dropped.
pub fn tmp_dir() -> Result<tempfile::TempDir> {
    let root = env::var_os("TEST_REPLICATED_WRITE_DIR").unwrap_or_else(|| env::temp_dir().into());

    Ok(tempfile::Builder::new()
        .prefix("replicated_write")
        .tempdir_in(root)?)
}

static LOG_SETUP: Once = Once::new();

/// Enables debug logging regardless of the value of the `RUST_LOG` environment
/// variable. If `RUST_LOG` isn't specified, defaults to `"debug"`.
pub fn start_logging() {
    // ensure the global has been initialized
    LOG_SETUP.call_once(|| {
        // honor any existing RUST_LOG level
        if env::var("RUST_LOG").is_err() {
            env::set_var("RUST_LOG", "debug");
        }

        use observability_deps::tracing_subscriber::{self, prelude::*, EnvFilter};

        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    })
}

/// Enables debug logging if the `RUST_LOG` environment variable is set. Does
/// nothing otherwise, or if logging was already started.
pub fn maybe_start_logging() {
    if env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

#[macro_export]
/// A macro to assert that one string is contained within another with a nice
/// error message if it is not.
///
/// Both arguments must be convertable into `String`s (`Into<String>`).
macro_rules! assert_contains {
    ($ACTUAL: expr, $EXPECTED: expr) => {
        let actual_value: String = $ACTUAL.into();
        let expected_value: String = $EXPECTED.into();
        assert!(
            actual_value.contains(&expected_value),
            "Can not find expected in actual.\n\nExpected:\n{}\n\nActual:\n{}",
            expected_value,
            actual_value
        );
    };
}

#[macro_export]
/// A macro to assert that one string is NOT contained within another with a
/// nice error message if that check fails.
///
/// Both arguments must be convertable into `String`s (`Into<String>`).
macro_rules! assert_not_contains {
    ($ACTUAL: expr, $UNEXPECTED: expr) => {
        let actual_value: String = $ACTUAL.into();
        let unexpected_value: String = $UNEXPECTED.into();
        assert!(
            !actual_value.contains(&unexpected_value),
            "Found unexpected value in actual.\n\nUnexpected:\n{}\n\nActual:\n{}",
            unexpected_value,
            actual_value
        );
    };
}
