//! Test-mode detection shared by `config` and `persist`-adjacent code.
//!
//! Unit tests always count as test mode via `cfg(test)`, and a
//! `BROKER_ENV=test` environment variable lets integration tests opt in
//! without the `cfg`.

/// True when running under `cargo test`, or `BROKER_ENV=test` is set.
#[must_use]
pub fn is_test_mode() -> bool {
    cfg!(test) || std::env::var("BROKER_ENV").as_deref() == Ok("test")
}
