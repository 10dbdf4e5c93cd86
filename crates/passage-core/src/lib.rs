//! Shared primitives for the passage proxies.
//!
//! Both servers speak the same data model: absolute target URLs carried as
//! opaque `__cpo` fingerprints, the absolutisation rule that turns embedded
//! URL references into proxy URLs, and the random bearer tokens that gate
//! access to fleet slots. Everything here is pure (no I/O) so the rewriters
//! and stores can be tested without a network.

pub mod absolutize;
pub mod fingerprint;
pub mod forwarded;
pub mod identity;
pub mod token;

pub use absolutize::{absolutize, proxy_url, rewrite_reference, should_rewrite};
pub use fingerprint::{decode, encode, FingerprintError, FINGERPRINT_PARAM};
pub use token::mint_token;
