// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The verification driver that applies DANE semantics around a stock X.509
//! chain builder.

use std::fmt;

use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{X509, X509Ref, X509StoreContext, X509VerifyResult};
use tracing::debug;

use crate::anchor::Synthesizer;
use crate::error::{DaneError, DaneResult};
use crate::matcher::match_tlsa;
use crate::names::name_check;
use crate::store::DaneTlsa;
use crate::tlsa::CertUsage;

/// A verification error that can be overridden through the verify callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertError {
    /// No TLSA record vouches for the presented chain
    Untrusted,
    /// No reference identity matches the names the leaf presents
    HostnameMismatch,
    /// The underlying PKIX chain builder rejected the chain
    Pkix(X509VerifyResult),
}

impl fmt::Display for CertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Untrusted => write!(f, "certificate untrusted"),
            Self::HostnameMismatch => write!(f, "hostname mismatch"),
            Self::Pkix(err) => write!(f, "{}", err.error_string()),
        }
    }
}

/// One observation reported to the verify callback.
#[derive(Clone, Copy)]
pub struct VerifyEvent<'a> {
    /// Chain depth the observation applies to, 0 being the leaf
    pub depth: usize,
    /// The error, absent when the observation reports success
    pub error: Option<CertError>,
    /// The certificate at that depth, when one is available
    pub cert: Option<&'a X509Ref>,
}

/// User-supplied verify callback.
///
/// Receives the tentative verdict and the event that produced it; its return
/// value replaces the verdict, so returning `true` on a failed observation
/// overrides the failure, exactly like an OpenSSL verify callback.
pub type VerifyCallback = Box<dyn FnMut(bool, &VerifyEvent<'_>) -> bool>;

/// Transient state for one certificate verification.
///
/// Owns the presented leaf and the untrusted peer chain on the way in, and
/// the built chain plus the error/depth pair that produced the verdict on
/// the way out.
pub struct VerifyContext {
    pub(crate) cert: X509,
    pub(crate) untrusted: Vec<X509>,
    /// Trust set synthesized from usage-2 records, replacing the builder's
    /// own store for this call.
    pub(crate) trusted: Option<Vec<X509>>,
    pub(crate) chain: Vec<X509>,
    pub(crate) error: Option<CertError>,
    pub(crate) error_depth: usize,
    callback: Option<VerifyCallback>,
}

impl VerifyContext {
    /// Creates verification state for one presented leaf and the untrusted
    /// chain that accompanied it.
    pub fn new(cert: X509, untrusted: Vec<X509>) -> Self {
        Self {
            cert,
            untrusted,
            trusted: None,
            chain: Vec::new(),
            error: None,
            error_depth: 0,
            callback: None,
        }
    }

    /// Installs a verify callback consulted for every overridable error and
    /// for the DANE-EE fast-path success.
    pub fn set_verify_callback<F>(&mut self, callback: F)
    where
        F: FnMut(bool, &VerifyEvent<'_>) -> bool + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    /// The presented leaf certificate.
    pub fn cert(&self) -> &X509Ref {
        &self.cert
    }

    /// The chain produced by the last verification.
    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    /// The error of the last verification, if any.
    pub fn error(&self) -> Option<CertError> {
        self.error
    }

    /// The chain depth the last error applies to.
    pub fn error_depth(&self) -> usize {
        self.error_depth
    }

    pub(crate) fn set_error(&mut self, error: CertError, depth: usize) {
        self.error = Some(error);
        self.error_depth = depth;
    }

    /// Consults the verify callback; without one the verdict stands.
    pub(crate) fn invoke_callback(&mut self, ok: bool) -> bool {
        let Some(mut callback) = self.callback.take() else {
            return ok;
        };
        let cert = self
            .chain
            .get(self.error_depth)
            .map(|c| c.as_ref())
            .or(Some(self.cert.as_ref()));
        let event = VerifyEvent {
            depth: self.error_depth,
            error: self.error,
            cert,
        };
        let verdict = callback(ok, &event);
        self.callback = Some(callback);
        verdict
    }
}

/// The underlying X.509 chain building primitive.
///
/// The driver treats the builder as opaque: it installs trusted roots and an
/// untrusted chain on the [`VerifyContext`], asks the builder to build, and
/// applies the DANE constraints to the result. Swapping strategies on the
/// context keeps the interposition local to one verification instead of
/// mutating global function pointers.
pub trait ChainBuilder {
    /// Whether the builder can honour a non-self-signed trust anchor
    /// directly. When it cannot, matched usage-2 anchors are wrapped up to a
    /// synthetic self-signed root before the build.
    fn accepts_partial_chain(&self) -> bool;

    /// Builds and validates a chain for the context's certificate,
    /// populating the context's chain and error slots. `Ok(false)` is a
    /// verification verdict; `Err` is an operational failure.
    fn build_chain(&self, ctx: &mut VerifyContext) -> DaneResult<bool>;
}

/// The production [`ChainBuilder`] over OpenSSL's `X509_verify_cert`.
pub struct PkixBuilder {
    trusted: Vec<X509>,
    partial_chain: bool,
}

impl PkixBuilder {
    /// An empty trust store that honours partial chains.
    pub fn new() -> Self {
        Self {
            trusted: Vec::new(),
            partial_chain: true,
        }
    }

    /// Adds a trusted root used when no usage-2 trust set is synthesized.
    pub fn add_ca(&mut self, ca: X509) {
        self.trusted.push(ca);
    }

    /// Forces trust anchors to be self-signed, as chain builders without
    /// partial-chain support require; matched usage-2 anchors are then
    /// re-signed and capped by synthetic roots.
    pub fn set_partial_chain(&mut self, partial_chain: bool) {
        self.partial_chain = partial_chain;
    }
}

impl Default for PkixBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBuilder for PkixBuilder {
    fn accepts_partial_chain(&self) -> bool {
        self.partial_chain
    }

    fn build_chain(&self, ctx: &mut VerifyContext) -> DaneResult<bool> {
        let roots = match &ctx.trusted {
            Some(roots) => roots.clone(),
            None => self.trusted.clone(),
        };

        let mut store = X509StoreBuilder::new()?;
        for ca in roots {
            store.add_cert(ca)?;
        }
        if self.partial_chain {
            store.set_flags(X509VerifyFlags::PARTIAL_CHAIN)?;
        }
        let store = store.build();

        let mut untrusted = Stack::new()?;
        for cert in &ctx.untrusted {
            untrusted.push(cert.clone())?;
        }

        let leaf = ctx.cert.clone();
        let mut store_ctx = X509StoreContext::new()?;
        let (ok, error, depth, chain) = store_ctx.init(&store, &leaf, &untrusted, |c| {
            let ok = c.verify_cert()?;
            let chain = c
                .chain()
                .map(|chain| chain.iter().map(X509Ref::to_owned).collect::<Vec<_>>())
                .unwrap_or_default();
            Ok((ok, c.error(), c.error_depth() as usize, chain))
        })?;

        // Keep whatever partial chain was built, the post-build constraint
        // checks run against it even on an overridden failure.
        ctx.chain = if chain.is_empty() { vec![leaf] } else { chain };

        if ok {
            Ok(true)
        } else {
            debug!(%error, depth, "PKIX chain building failed");
            ctx.set_error(CertError::Pkix(error), depth);
            Ok(ctx.invoke_callback(false))
        }
    }
}

/// The DANE verification driver.
///
/// Stands in for the TLS stack's certificate verification: consult the
/// connection's TLSA store, short-circuit on DANE-EE, synthesize usage-2
/// trust anchors, delegate to the chain builder, and enforce the usage-0/1
/// constraints and the name check on the built chain.
pub struct DaneVerifier {
    builder: Box<dyn ChainBuilder>,
}

impl DaneVerifier {
    /// Wraps a chain builder for DANE verification.
    ///
    /// # Errors
    ///
    /// Returns [`DaneError::LibraryInit`] when [`crate::library_init`] has
    /// not run yet.
    pub fn new(builder: Box<dyn ChainBuilder>) -> DaneResult<Self> {
        if !crate::initialized() {
            return Err(DaneError::LibraryInit);
        }
        Ok(Self { builder })
    }

    /// Verifies the context's certificate under the connection's DANE state.
    ///
    /// Without DANE state the call is handed to the unmodified chain
    /// builder. `Ok(false)` is a verification failure whose cause is left in
    /// the context; `Err` is an operational failure of the engine itself.
    pub fn verify_cert(
        &self,
        dane: Option<&mut DaneTlsa>,
        ctx: &mut VerifyContext,
    ) -> DaneResult<bool> {
        let Some(dane) = dane else {
            return self.builder.build_chain(ctx);
        };

        // Restart from a clean slate, the store may be verified repeatedly.
        dane.mhost = None;
        dane.depth = None;
        dane.roots.clear();
        dane.chain.clear();

        if !dane.usage(CertUsage::DaneEe).is_empty() {
            // DANE-EE: a match on the leaf stands alone, no PKIX chain
            // building and no name check are performed.
            if match_tlsa(dane.usage(CertUsage::DaneEe), &ctx.cert, 0)?.is_some() {
                debug!("DANE-EE TLSA record matched the leaf, bypassing PKIX");
                if ctx.chain.is_empty() {
                    let leaf = ctx.cert.clone();
                    ctx.chain.push(leaf);
                }
                ctx.error = None;
                ctx.error_depth = 0;
                return Ok(ctx.invoke_callback(true));
            }
        }

        if !dane.usage(CertUsage::DaneTa).is_empty() {
            let wrap_signed = !self.builder.accepts_partial_chain();
            let leaf = ctx.cert.clone();
            let untrusted = ctx.untrusted.clone();
            let found = {
                let mut synth = Synthesizer::new(dane, crate::signing_slot(), wrap_signed);
                synth.set_trust_anchor(&leaf, &untrusted)?
            };
            if found {
                debug!(
                    roots = dane.roots.len(),
                    chain = dane.chain.len(),
                    "installing synthesized trust anchors"
                );
                ctx.trusted = Some(dane.roots.clone());
                ctx.untrusted = dane.chain.clone();
            }
        }

        let pkix_ok = self.builder.build_chain(ctx)?;
        self.verify_chain(dane, ctx, pkix_ok)
    }

    /// Post-build constraint enforcement, run once the builder produced its
    /// candidate chain.
    fn verify_chain(
        &self,
        dane: &mut DaneTlsa,
        ctx: &mut VerifyContext,
        pkix_ok: bool,
    ) -> DaneResult<bool> {
        // Satisfy at least one usage 0 or 1 constraint, unless a usage 2
        // trust anchor was already matched.
        if dane.roots.is_empty() {
            let issuer_rrs = dane.usage(CertUsage::PkixTa);
            let leaf_rrs = dane.usage(CertUsage::PkixEe);
            let chain = ctx.chain.clone();
            let chain_length = chain.len();

            let mut matched = false;
            if !issuer_rrs.is_empty() {
                // top of the chain first; the leaf itself does not satisfy a
                // CA constraint
                for n in (1..chain_length).rev() {
                    if match_tlsa(issuer_rrs, &chain[n], n)?.is_some() {
                        matched = true;
                        break;
                    }
                }
            }
            if !matched && !leaf_rrs.is_empty() {
                if let Some(leaf) = chain.first() {
                    matched = match_tlsa(leaf_rrs, leaf, 0)?.is_some();
                }
            }

            if !matched {
                ctx.set_error(CertError::Untrusted, chain_length.saturating_sub(1));
                if !ctx.invoke_callback(false) {
                    return Ok(false);
                }
            }
        }

        let leaf = ctx.cert.clone();
        if !name_check(dane, &leaf) {
            ctx.set_error(CertError::HostnameMismatch, 0);
            if !ctx.invoke_callback(false) {
                return Ok(false);
            }
        }

        Ok(pkix_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cert_error_display() {
        assert_eq!(CertError::Untrusted.to_string(), "certificate untrusted");
        assert_eq!(
            CertError::HostnameMismatch.to_string(),
            "hostname mismatch"
        );
    }

    #[test]
    fn test_verifier_requires_library_init() {
        crate::library_init().unwrap();
        assert!(DaneVerifier::new(Box::new(PkixBuilder::new())).is_ok());
    }

    #[test]
    fn test_callback_override() {
        let mut ctx = VerifyContext::new_empty_for_test();
        assert!(!ctx.invoke_callback(false));

        ctx.set_verify_callback(|_ok, event| {
            assert_eq!(event.error, Some(CertError::Untrusted));
            true
        });
        ctx.set_error(CertError::Untrusted, 0);
        assert!(ctx.invoke_callback(false));
    }

    impl VerifyContext {
        fn new_empty_for_test() -> Self {
            use openssl::asn1::Asn1Time;
            use openssl::hash::MessageDigest;
            use openssl::pkey::PKey;
            use openssl::rsa::Rsa;
            use openssl::x509::X509;

            let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
            let mut builder = X509::builder().unwrap();
            builder
                .set_not_before(&Asn1Time::days_from_now(0).unwrap())
                .unwrap();
            builder
                .set_not_after(&Asn1Time::days_from_now(1).unwrap())
                .unwrap();
            builder.set_pubkey(&pkey).unwrap();
            builder.sign(&pkey, MessageDigest::sha256()).unwrap();
            Self::new(builder.build(), Vec::new())
        }
    }
}
