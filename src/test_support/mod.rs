//! Internal helpers re-exported for integration tests.
//!
//! Provides tracing capture and a fake engine whose `initdb` and `pg_ctl`
//! are POSIX shell scripts that record every invocation, so lifecycle tests
//! run without a real database engine.

mod fake_engine;
mod logging;

pub use fake_engine::{FakeEngine, read_invocations};
pub use logging::{capture_info_logs, capture_warn_logs};
