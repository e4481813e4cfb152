// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![warn(
    clippy::default_trait_access,
    clippy::dbg_macro,
    clippy::unimplemented,
    missing_docs,
    non_snake_case,
    non_upper_case_globals,
    rust_2018_idioms,
    unreachable_pub
)]

//! DANE (RFC 6698 / RFC 7671) certificate verification over the OpenSSL
//! X.509 chain builder.
//!
//! A TLS client that has obtained authenticated TLSA records for a server
//! attaches them to a per-connection [`DaneTlsa`] store and verifies the
//! presented certificate through a [`DaneVerifier`]. The verifier applies
//! the four RFC 7671 usage modes: DANE-EE (3) matches the leaf directly and
//! bypasses PKIX entirely, DANE-TA (2) promotes a matched chain element --
//! or a trust anchor known only from DNS -- to the trust set, while
//! PKIX-TA (0) and PKIX-EE (1) constrain an ordinarily validated chain.
//! Name checks against the connection's reference identities run on every
//! successful chain build.
//!
//! ```no_run
//! use danessl::{DaneResult, DaneTlsa, DaneVerifier, PkixBuilder, VerifyContext};
//! use openssl::x509::X509;
//!
//! fn verify(leaf: X509, chain: Vec<X509>, tlsa_rdata: &[u8]) -> DaneResult<bool> {
//!     danessl::library_init()?;
//!
//!     // TLSA 3 1 1: DANE-EE, SPKI, SHA-256
//!     let mut dane = DaneTlsa::new(Some("www.example.com"), &["www.example.com"])?;
//!     dane.add_tlsa(3, 1, Some("sha256"), tlsa_rdata)?;
//!
//!     let verifier = DaneVerifier::new(Box::new(PkixBuilder::new()))?;
//!     let mut ctx = VerifyContext::new(leaf, chain);
//!     verifier.verify_cert(Some(&mut dane), &mut ctx)
//! }
//! ```
//!
//! Fetching and authenticating the TLSA records (DNSSEC) and driving the TLS
//! handshake are out of scope; see the `dane-connect` demo for how to bolt
//! the verifier onto an `SslConnector` session.

use std::sync::RwLock;

use openssl::ec::{EcGroup, EcKey};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private, Public};
use tracing::warn;

mod anchor;
mod error;
mod matcher;
mod names;
mod store;
mod tlsa;
mod verify;

pub use error::{DaneError, DaneResult};
pub use store::DaneTlsa;
pub use tlsa::{CertUsage, Selector};
pub use verify::{
    CertError, ChainBuilder, DaneVerifier, PkixBuilder, VerifyCallback, VerifyContext, VerifyEvent,
};

/// Level of DANE support the process provides, see [`library_init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaneSupport {
    /// All usages available
    Full,
    /// The signing key needed for DANE-TA (usage 2) synthesis could not be
    /// generated; callers should omit usage-2 records
    Partial,
}

/// The internal signing identity for synthetic trust anchors: an ephemeral
/// EC P-256 key generated once per process, never rotated, used only to sign
/// certificates that exist for the duration of one verification call.
#[derive(Clone)]
pub(crate) struct SignSlot {
    pub(crate) key: PKey<Private>,
    pub(crate) public: PKey<Public>,
    pub(crate) md: MessageDigest,
}

enum SignState {
    Ready(SignSlot),
    Unavailable,
}

impl SignState {
    fn support(&self) -> DaneSupport {
        match self {
            Self::Ready(_) => DaneSupport::Full,
            Self::Unavailable => DaneSupport::Partial,
        }
    }
}

static SIGNING: RwLock<Option<SignState>> = RwLock::new(None);

/// Initialises process-wide DANE state.
///
/// Must be called before any per-connection DANE call; subsequent calls are
/// idempotent and may come from any number of threads concurrently. Returns
/// [`DaneSupport::Partial`] when the platform cannot generate the internal
/// signing key, in which case usage-2 records are rejected at insertion.
pub fn library_init() -> DaneResult<DaneSupport> {
    {
        let signing = SIGNING.read().map_err(|_| DaneError::DaneSupport)?;
        if let Some(state) = signing.as_ref() {
            return Ok(state.support());
        }
    }

    let mut signing = SIGNING.write().map_err(|_| DaneError::DaneSupport)?;
    // another thread may have won the upgrade race
    if let Some(state) = signing.as_ref() {
        return Ok(state.support());
    }

    let state = match generate_signing_slot() {
        Ok(slot) => SignState::Ready(slot),
        Err(err) => {
            warn!(%err, "no signing key, DANE-TA support unavailable");
            SignState::Unavailable
        }
    };
    let support = state.support();
    *signing = Some(state);
    Ok(support)
}

/// Trust-anchors synthesized for chain builders that require self-signed
/// roots are signed with a throwaway P-256 key.
fn generate_signing_slot() -> Result<SignSlot, ErrorStack> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let key = PKey::from_ec_key(EcKey::generate(&group)?)?;
    let public = PKey::public_key_from_der(&key.public_key_to_der()?)?;
    Ok(SignSlot {
        key,
        public,
        md: MessageDigest::sha256(),
    })
}

/// Whether [`library_init`] has completed.
pub(crate) fn initialized() -> bool {
    SIGNING.read().map(|s| s.is_some()).unwrap_or(false)
}

/// A handle on the internal signing identity, `None` before initialisation
/// or on a partial-support platform.
pub(crate) fn signing_slot() -> Option<SignSlot> {
    let signing = SIGNING.read().ok()?;
    match signing.as_ref() {
        Some(SignState::Ready(slot)) => Some(slot.clone()),
        _ => None,
    }
}
