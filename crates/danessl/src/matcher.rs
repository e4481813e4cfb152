// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Matching of candidate certificates against TLSA association data.

use openssl::hash::hash;
use openssl::x509::X509Ref;
use tracing::debug;

use crate::error::DaneResult;
use crate::store::SelectorGroup;
use crate::tlsa::Selector;

/// What part of the candidate certificate a TLSA record matched.
///
/// Trust-anchor synthesis needs to know whether a usage-2 hit was on the
/// certificate or on its public key: a certificate can be promoted to the
/// trust set as-is, while a bare key needs a certificate fabricated around
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MatchKind {
    /// The full certificate (selector 0) matched
    Cert,
    /// The SubjectPublicKeyInfo (selector 1) matched
    Pkey,
}

/// Tests `cert` against every record in `groups`.
///
/// The candidate is encoded once per selector and digested once per matching
/// type; the first equal association datum wins. `depth` is only reported in
/// the trace output.
pub(crate) fn match_tlsa(
    groups: &[SelectorGroup],
    cert: &X509Ref,
    depth: usize,
) -> DaneResult<Option<MatchKind>> {
    for group in groups {
        // ASN.1 DER form of the certificate or its public key
        let (buf, kind) = match group.selector {
            Selector::Cert => (cert.to_der()?, MatchKind::Cert),
            Selector::Spki => (cert.public_key()?.public_key_to_der()?, MatchKind::Pkey),
        };

        for mtype in &group.mtypes {
            let digest;
            let cmp: &[u8] = match mtype.md {
                Some(md) => {
                    digest = hash(md, &buf)?;
                    &digest
                }
                None => &buf,
            };

            if mtype.data.iter().any(|d| d[..] == *cmp) {
                debug!(
                    depth,
                    selector = %group.selector,
                    "certificate matched TLSA record"
                );
                return Ok(Some(kind));
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509, X509NameBuilder};

    use super::*;
    use crate::store::DaneTlsa;
    use crate::tlsa::CertUsage;

    fn leaf() -> X509 {
        let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "match.example.com").unwrap();
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
        builder.build()
    }

    fn store() -> DaneTlsa {
        crate::library_init().unwrap();
        DaneTlsa::new(None, &["match.example.com"]).unwrap()
    }

    #[test]
    fn test_match_raw_cert() {
        let cert = leaf();
        let mut dane = store();
        dane.add_tlsa(3, 0, None, &cert.to_der().unwrap()).unwrap();

        let matched = match_tlsa(dane.usage(CertUsage::DaneEe), &cert, 0).unwrap();
        assert_eq!(matched, Some(MatchKind::Cert));

        // no records for other usages
        let matched = match_tlsa(dane.usage(CertUsage::DaneTa), &cert, 0).unwrap();
        assert_eq!(matched, None);
    }

    #[test]
    fn test_match_spki_digest() {
        let cert = leaf();
        let spki = cert.public_key().unwrap().public_key_to_der().unwrap();
        let digest = hash(MessageDigest::sha256(), &spki).unwrap();

        let mut dane = store();
        dane.add_tlsa(3, 1, Some("sha256"), &digest).unwrap();

        let matched = match_tlsa(dane.usage(CertUsage::DaneEe), &cert, 0).unwrap();
        assert_eq!(matched, Some(MatchKind::Pkey));
    }

    #[test]
    fn test_no_match_on_other_cert() {
        let cert = leaf();
        let other = leaf();
        let mut dane = store();
        dane.add_tlsa(3, 0, None, &cert.to_der().unwrap()).unwrap();
        dane.add_tlsa(
            3,
            1,
            Some("sha512"),
            &hash(
                MessageDigest::sha512(),
                &cert.public_key().unwrap().public_key_to_der().unwrap(),
            )
            .unwrap(),
        )
        .unwrap();

        let matched = match_tlsa(dane.usage(CertUsage::DaneEe), &other, 0).unwrap();
        assert_eq!(matched, None);
    }
}
