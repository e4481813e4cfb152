// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-connection TLSA record store.

use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Public};
use openssl::x509::X509;
use tracing::debug;

use crate::error::{DaneError, DaneResult};
use crate::tlsa::{CertUsage, Selector, USAGE_COUNT};

/// Association data grouped under one (selector, matching type) pair.
///
/// `md` is `None` for matching type 0 (the full DER object); digests are
/// compared by NID since `MessageDigest` carries no equality of its own.
pub(crate) struct MtypeGroup {
    pub(crate) md: Option<MessageDigest>,
    pub(crate) data: Vec<Vec<u8>>,
}

impl MtypeGroup {
    fn matches_md(&self, md: Option<MessageDigest>) -> bool {
        match (self.md, md) {
            (None, None) => true,
            (Some(a), Some(b)) => a.type_() == b.type_(),
            _ => false,
        }
    }
}

/// All records of one usage that share a selector, grouped by matching type.
pub(crate) struct SelectorGroup {
    pub(crate) selector: Selector,
    pub(crate) mtypes: Vec<MtypeGroup>,
}

/// Per-connection DANE verification state.
///
/// A `DaneTlsa` collects the authenticated TLSA records for one TLS
/// connection together with the reference identities the peer must present.
/// It is attached to exactly one connection, filled through
/// [`add_tlsa`][DaneTlsa::add_tlsa], consumed by
/// [`DaneVerifier::verify_cert`][crate::DaneVerifier::verify_cert], and
/// dropped with the connection. All certificates and keys it owns are
/// released when it goes out of scope.
pub struct DaneTlsa {
    /// Record groups indexed by certificate usage.
    pub(crate) selectors: [Vec<SelectorGroup>; USAGE_COUNT],
    /// Parsed usage-2 full certificates (selector 0, no matching type).
    pub(crate) certs: Vec<X509>,
    /// Parsed usage-2 bare public keys (selector 1, no matching type).
    pub(crate) pkeys: Vec<PKey<Public>>,
    /// Reference identities, in insertion order. A leading `.` (on a name
    /// longer than `.`) matches any proper sub-domain.
    pub(crate) hosts: Vec<String>,
    /// Allow the certificate wildcard label to span multiple host labels.
    pub(crate) multi: bool,
    /// TLSA base domain, conventionally the first reference identity.
    base_domain: Option<String>,
    /// SNI name to be applied by the TLS layer, if any.
    sni_name: Option<String>,
    /// Peer name matched by the last successful name check.
    pub(crate) mhost: Option<String>,
    /// Depth of the first synthesized trust anchor, for diagnostics.
    pub(crate) depth: Option<usize>,
    /// Trust set produced by usage-2 synthesis.
    pub(crate) roots: Vec<X509>,
    /// Untrusted working chain produced by usage-2 synthesis.
    pub(crate) chain: Vec<X509>,
}

impl DaneTlsa {
    /// Creates DANE state for one connection.
    ///
    /// `sni_name`, when given, is recorded for the TLS layer to apply to the
    /// handshake. `hostnames` are the reference identities for the name
    /// check; the first one is conventionally the TLSA base domain. An empty
    /// list is accepted, but every name check will then fail.
    ///
    /// # Errors
    ///
    /// Returns [`DaneError::LibraryInit`] when [`crate::library_init`] has
    /// not run yet.
    pub fn new(sni_name: Option<&str>, hostnames: &[&str]) -> DaneResult<Self> {
        if !crate::initialized() {
            return Err(DaneError::LibraryInit);
        }

        Ok(Self {
            selectors: Default::default(),
            certs: Vec::new(),
            pkeys: Vec::new(),
            hosts: hostnames.iter().map(|h| h.to_string()).collect(),
            multi: false,
            base_domain: hostnames.first().map(|h| h.to_string()),
            sni_name: sni_name.map(str::to_string),
            mhost: None,
            depth: None,
            roots: Vec::new(),
            chain: Vec::new(),
        })
    }

    /// Adds one TLSA record to the store.
    ///
    /// `mdname` is the matching type: `None` for matching type 0 (raw
    /// association data), otherwise an OpenSSL digest name such as
    /// `"sha256"`. Duplicate records are ignored and reported as success.
    ///
    /// For usage 2 records with raw data the certificate (selector 0) or
    /// public key (selector 1) is parsed and retained to drive trust-anchor
    /// synthesis.
    pub fn add_tlsa(
        &mut self,
        usage: u8,
        selector: u8,
        mdname: Option<&str>,
        data: &[u8],
    ) -> DaneResult<()> {
        let usage = CertUsage::try_from(usage)?;
        let selector = Selector::try_from(selector)?;
        let md = match mdname {
            None => None,
            Some(name) => Some(
                MessageDigest::from_name(name)
                    .ok_or_else(|| DaneError::BadDigest(name.to_string()))?,
            ),
        };
        if data.is_empty() {
            return Err(DaneError::BadNullData);
        }
        if let Some(md) = md {
            if data.len() != md.size() {
                return Err(DaneError::BadDataLength);
            }
        }

        // Usage 2 eventually signs synthesized trust anchors with the
        // internal key, which a partial-support platform does not have.
        if usage == CertUsage::DaneTa && crate::signing_slot().is_none() {
            return Err(DaneError::NoSignKey);
        }

        let mut cert = None;
        let mut pkey = None;
        if md.is_none() {
            match selector {
                Selector::Cert => {
                    let x = X509::from_der(data).map_err(|_| DaneError::BadCert)?;
                    if x.to_der()?.len() != data.len() {
                        return Err(DaneError::BadCert);
                    }
                    if x.public_key().is_err() {
                        return Err(DaneError::BadCertPKey);
                    }
                    if usage == CertUsage::DaneTa {
                        cert = Some(x);
                    }
                }
                Selector::Spki => {
                    let k = PKey::public_key_from_der(data).map_err(|_| DaneError::BadPKey)?;
                    if k.public_key_to_der()?.len() != data.len() {
                        return Err(DaneError::BadPKey);
                    }
                    if usage == CertUsage::DaneTa {
                        pkey = Some(k);
                    }
                }
            }
        }

        let groups = &mut self.selectors[usage.index()];
        let gi = match groups.iter().position(|g| g.selector == selector) {
            Some(i) => i,
            None => {
                groups.push(SelectorGroup {
                    selector,
                    mtypes: Vec::new(),
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[gi];
        let mi = match group.mtypes.iter().position(|m| m.matches_md(md)) {
            Some(i) => i,
            None => {
                group.mtypes.push(MtypeGroup {
                    md,
                    data: Vec::new(),
                });
                group.mtypes.len() - 1
            }
        };
        let mtype = &mut group.mtypes[mi];

        // Don't add duplicate elements.
        if mtype.data.iter().any(|d| d == data) {
            return Ok(());
        }
        mtype.data.push(data.to_vec());

        if let Some(cert) = cert {
            self.certs.push(cert);
        }
        if let Some(pkey) = pkey {
            self.pkeys.push(pkey);
        }

        debug!(
            usage = %usage,
            selector = %selector,
            mtype = mdname.unwrap_or("raw"),
            len = data.len(),
            "added TLSA record"
        );
        Ok(())
    }

    /// Allow (or forbid) certificate wildcards that span multiple labels.
    pub fn set_multi_label_wildcard(&mut self, multi: bool) {
        self.multi = multi;
    }

    /// The SNI name recorded at creation, for the TLS layer to apply.
    pub fn sni_name(&self) -> Option<&str> {
        self.sni_name.as_deref()
    }

    /// The TLSA base domain, i.e. the first reference identity.
    pub fn base_domain(&self) -> Option<&str> {
        self.base_domain.as_deref()
    }

    /// The peer name matched by the name check of the last verification.
    pub fn matched_host(&self) -> Option<&str> {
        self.mhost.as_deref()
    }

    /// Depth at which the last verification synthesized its trust anchor.
    pub fn trust_anchor_depth(&self) -> Option<usize> {
        self.depth
    }

    /// Total number of distinct TLSA records in the store.
    pub fn tlsa_count(&self) -> usize {
        self.selectors
            .iter()
            .flatten()
            .flat_map(|g| g.mtypes.iter())
            .map(|m| m.data.len())
            .sum()
    }

    /// Record groups for one usage.
    pub(crate) fn usage(&self, usage: CertUsage) -> &[SelectorGroup] {
        &self.selectors[usage.index()]
    }
}

#[cfg(test)]
mod tests {
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::pkey::{PKey, Private};
    use openssl::rsa::Rsa;
    use openssl::x509::{X509, X509NameBuilder};

    use super::*;

    fn self_signed() -> (PKey<Private>, X509) {
        let rsa = Rsa::generate(2048).unwrap();
        let pkey = PKey::from_rsa(rsa).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "tlsa.example.com").unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(30).unwrap())
            .unwrap();
        builder.set_pubkey(&pkey).unwrap();
        builder.sign(&pkey, MessageDigest::sha256()).unwrap();
        (pkey, builder.build())
    }

    fn store() -> DaneTlsa {
        crate::library_init().unwrap();
        DaneTlsa::new(None, &["tlsa.example.com"]).unwrap()
    }

    #[test]
    fn test_add_tlsa_validation() {
        let mut dane = store();

        assert!(matches!(
            dane.add_tlsa(4, 0, None, &[1]),
            Err(DaneError::BadUsage(4))
        ));
        assert!(matches!(
            dane.add_tlsa(3, 2, None, &[1]),
            Err(DaneError::BadSelector(2))
        ));
        assert!(matches!(
            dane.add_tlsa(3, 0, Some("no-such-digest"), &[1]),
            Err(DaneError::BadDigest(_))
        ));
        assert!(matches!(
            dane.add_tlsa(3, 0, Some("sha256"), &[0u8; 16]),
            Err(DaneError::BadDataLength)
        ));
        assert!(matches!(
            dane.add_tlsa(3, 0, None, &[]),
            Err(DaneError::BadNullData)
        ));
        // usage 2 raw data must parse
        assert!(matches!(
            dane.add_tlsa(2, 0, None, &[0xde, 0xad, 0xbe, 0xef]),
            Err(DaneError::BadCert)
        ));
        assert!(matches!(
            dane.add_tlsa(2, 1, None, &[0xde, 0xad, 0xbe, 0xef]),
            Err(DaneError::BadPKey)
        ));
        assert_eq!(dane.tlsa_count(), 0);
    }

    #[test]
    fn test_add_tlsa_duplicates_ignored() {
        let mut dane = store();
        let digest = [0xabu8; 32];

        dane.add_tlsa(3, 1, Some("sha256"), &digest).unwrap();
        dane.add_tlsa(3, 1, Some("sha256"), &digest).unwrap();
        assert_eq!(dane.tlsa_count(), 1);

        // same data under a different selector is a distinct record
        dane.add_tlsa(3, 0, Some("sha256"), &digest).unwrap();
        assert_eq!(dane.tlsa_count(), 2);
    }

    #[test]
    fn test_add_tlsa_usage2_retains_parsed_forms() {
        let (pkey, cert) = self_signed();
        let mut dane = store();

        dane.add_tlsa(2, 0, None, &cert.to_der().unwrap()).unwrap();
        assert_eq!(dane.certs.len(), 1);

        dane.add_tlsa(2, 1, None, &pkey.public_key_to_der().unwrap())
            .unwrap();
        assert_eq!(dane.pkeys.len(), 1);
        assert_eq!(dane.tlsa_count(), 2);

        // usage 3 raw records are validated but not retained
        let mut dane = store();
        dane.add_tlsa(3, 0, None, &cert.to_der().unwrap()).unwrap();
        assert!(dane.certs.is_empty());
    }

    #[test]
    fn test_requires_library_init() {
        crate::library_init().unwrap();
        let dane = DaneTlsa::new(Some("sni.example.com"), &["example.com", ".example.net"]);
        let dane = dane.unwrap();
        assert_eq!(dane.sni_name(), Some("sni.example.com"));
        assert_eq!(dane.base_domain(), Some("example.com"));
        assert_eq!(dane.hosts.len(), 2);
    }
}
