//! Iterative DNS resolution: a single-exchange UDP transport adapter
//! and a resolver that follows delegation chains from a bootstrap
//! nameserver until it reaches an authoritative answer, runs out of
//! nameservers to try, or exhausts its hop budget.
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod iterative;
pub mod transport;

pub use self::iterative::{resolve, ResolutionError, MAX_HOPS};
pub use self::transport::{Exchange, ExchangeError, Upstream};
