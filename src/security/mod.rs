//! Sender authorization.
//!
//! Every inbound message is classified against a fixed allow-list of bare
//! identities. The allow-list is built once from configuration and shared
//! read-only by the dispatcher; [`AuthorizedSender`] is the proof that a
//! particular message passed the check.
//!
//! Authorization trusts the identity asserted by the messaging channel. It is
//! not a boundary against a compromised transport.

pub mod allowlist;

pub use allowlist::{bare_identity, normalize_identity, AuthorizedSender, SenderAllowlist};
