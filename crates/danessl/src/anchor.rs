// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Trust-anchor synthesis for DANE-TA (usage 2) records.
//!
//! A usage-2 TLSA record may designate a certificate, or a bare public key,
//! that the local PKIX trust store knows nothing about. To feed such an
//! anchor into the stock chain builder this module manufactures short-lived
//! certificates: a matched trust-anchor certificate is promoted into the
//! trust set directly when the builder honours partial chains, and is
//! otherwise deep-copied, re-signed by the library's internal key and capped
//! with a synthetic signing root; a matched bare key gets a CA certificate
//! fabricated around it. The synthetic certificates only ever exist for the
//! duration of one verification call.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1OctetStringRef, Asn1Time};
use openssl::pkey::{PKey, Public};
use openssl::sign::Signer;
use openssl::x509::extension::{BasicConstraints, SubjectKeyIdentifier};
use openssl::x509::{X509, X509Builder, X509Extension, X509NameRef, X509Ref, X509VerifyResult};
use tracing::debug;

use crate::error::{DaneError, DaneResult};
use crate::matcher::{match_tlsa, MatchKind};
use crate::store::DaneTlsa;
use crate::tlsa::CertUsage;
use crate::SignSlot;

/// Synthetic CA certificates are valid for +/- 30 days around "now"; they
/// never outlive the verification call, so the window only has to cover
/// clock skew inside the chain builder.
const CA_VALIDITY_SECS: i64 = 30 * 86_400;

/// AlgorithmIdentifier for ecdsa-with-SHA256 (1.2.840.10045.4.3.2), the
/// fixed signature algorithm of the internal P-256 signing key.
const ECDSA_WITH_SHA256: &[u8] = &[
    0x30, 0x0a, 0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02,
];

/// One trust-anchor synthesis pass over a DANE store.
pub(crate) struct Synthesizer<'a> {
    dane: &'a mut DaneTlsa,
    signer: Option<SignSlot>,
    /// Whether trust anchors must be wrapped up to a self-signed root
    /// because the chain builder cannot honour partial chains.
    wrap_signed: bool,
}

impl<'a> Synthesizer<'a> {
    pub(crate) fn new(dane: &'a mut DaneTlsa, signer: Option<SignSlot>, wrap_signed: bool) -> Self {
        Self {
            dane,
            signer,
            wrap_signed,
        }
    }

    fn signer(&self) -> DaneResult<&SignSlot> {
        self.signer.as_ref().ok_or(DaneError::NoSignKey)
    }

    /// Walks from the leaf towards a root, consuming issuers out of the
    /// untrusted peer chain, until an element matches a usage-2 record and
    /// becomes the trust anchor.
    ///
    /// Returns `true` when an anchor was found and the store's root and
    /// working-chain slots are populated for installation into the builder.
    pub(crate) fn set_trust_anchor(
        &mut self,
        cert: &X509Ref,
        untrusted: &[X509],
    ) -> DaneResult<bool> {
        let usage2 = CertUsage::DaneTa;

        // Accept a degenerate case: depth 0 self-signed trust anchor.
        if cert.issued(cert) == X509VerifyResult::OK {
            if match_tlsa(self.dane.usage(usage2), cert, 0)?.is_some() {
                self.dane.roots.push(cert.to_owned());
                return Ok(true);
            }
            return Ok(false);
        }

        let mut input = untrusted.to_vec();
        let mut subject = cert.to_owned();
        let mut residual = true;
        let mut depth = 0;

        // At each step the issuer of the current subject is consumed out of
        // the input set; the walk ends when no issuer is left or an element
        // matches a usage-2 record.
        while !input.is_empty() {
            let Some(i) = input
                .iter()
                .position(|ca| ca.issued(&subject) == X509VerifyResult::OK)
            else {
                break;
            };
            let ca = input.remove(i);

            match match_tlsa(self.dane.usage(usage2), &ca, depth + 1)? {
                None => {
                    // Not a trust anchor: record as untrusted and continue
                    // with the issuer as the new subject.
                    self.dane.chain.push(ca.clone());
                    if ca.issued(&ca) == X509VerifyResult::OK {
                        // Final self-signed element, skip the ta_signed() check.
                        residual = false;
                        break;
                    }
                    subject = ca;
                    depth += 1;
                }
                Some(MatchKind::Cert) => {
                    self.wrap_cert(depth, &ca)?;
                    return Ok(true);
                }
                Some(MatchKind::Pkey) => {
                    let takey = ca.public_key()?;
                    self.wrap_key(depth, Some(&takey), &subject)?;
                    return Ok(true);
                }
            }
        }

        // The residual subject has no issuer in the peer's chain and is not
        // self-signed; it may still be signed by a certificate or public key
        // obtained via a TLSA record.
        if residual {
            return self.ta_signed(&subject, depth);
        }
        Ok(false)
    }

    /// Checks whether a usage-2 certificate or bare public key from the
    /// store vouches for `cert` even though the corresponding certificate
    /// never appeared in the peer's chain.
    fn ta_signed(&mut self, cert: &X509Ref, depth: usize) -> DaneResult<bool> {
        // TA certificates first: the issued() name comparison is cheaper
        // than the public key operations below.
        let mut tacert = None;
        for x in &self.dane.certs {
            if x.issued(cert) == X509VerifyResult::OK {
                let pk = x.public_key().map_err(|_| DaneError::BadCertPKey)?;
                // Check the signature, some other TA may work if not this.
                if matches!(cert.verify(&pk), Ok(true)) {
                    tacert = Some(x.clone());
                    break;
                }
            }
        }
        if let Some(tacert) = tacert {
            debug!("residual chain element signed by TLSA trust-anchor certificate");
            self.wrap_cert(depth + 1, &tacert)?;
            return Ok(true);
        }

        // With a bare public key there is no issuer name to compare, only
        // the signature can be checked. This handles peers that never send
        // the trust-anchor certificate itself.
        let mut takey = None;
        for k in &self.dane.pkeys {
            if matches!(cert.verify(k), Ok(true)) {
                takey = Some(k.clone());
                break;
            }
        }
        if let Some(takey) = takey {
            debug!("residual chain element signed by TLSA trust-anchor public key");
            self.wrap_key(depth, Some(&takey), cert)?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Promotes a matched trust-anchor certificate.
    ///
    /// When the builder honours partial chains, or the certificate is
    /// self-issued, it becomes a root as-is. Otherwise it is deep-copied via
    /// a DER round trip (detaching it from the peer chain), re-signed by the
    /// internal key, recorded in the working chain, and capped with a
    /// synthetic signing root.
    fn wrap_cert(&mut self, depth: usize, tacert: &X509Ref) -> DaneResult<()> {
        self.dane.depth = Some(depth);

        if !self.wrap_signed || tacert.issued(tacert) == X509VerifyResult::OK {
            self.dane.roots.push(tacert.to_owned());
            return Ok(());
        }

        let der = tacert.to_der()?;
        let copy = X509::from_der(&der)?;
        let round = copy.to_der()?;
        // The round trip must re-encode to the identical length, otherwise
        // the copy is not equivalent to the matched certificate.
        if round.len() != der.len() {
            return Err(DaneError::Message("certificate DER round trip diverged"));
        }

        let signer = self.signer()?.clone();
        let resigned = resign(&round, &signer)?;
        self.dane.chain.push(resigned.clone());
        debug!(depth, "re-signed trust-anchor certificate into working chain");

        self.wrap_key(depth + 1, Some(&signer.public), &resigned)
    }

    /// Manufactures a synthetic CA certificate above `subject`.
    ///
    /// With a `key` this is the issuer that `subject`'s own authority key
    /// identifier describes, carrying that key as its subject public key.
    /// Without one it is a self-signed root for the internal signing key.
    /// Non-root synthetics are signed by the internal key and capped with a
    /// further root by recursion.
    fn wrap_key(
        &mut self,
        depth: usize,
        key: Option<&PKey<Public>>,
        subject: &X509Ref,
    ) -> DaneResult<()> {
        // Record the depth of the trust-anchor certificate.
        if self.dane.depth.is_none() {
            self.dane.depth = Some(depth + 1);
        }

        let name = subject.issuer_name();
        let akid_keyid = subject.authority_key_id();
        let akid_issuer = akid_issuer_name(subject);
        let selfsigned = match akid_issuer {
            Some(issuer) => issuer.try_cmp(name)? == Ordering::Equal,
            None => true,
        };

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        match subject.authority_serial() {
            Some(serial) => {
                let asn1_serial = serial.to_bn()?.to_asn1_integer()?;
                builder.set_serial_number(&asn1_serial)?
            }
            None => {
                // One above the subject's serial, avoiding a collision
                // between the issuer and the signing root above it.
                let mut bn = subject.serial_number().to_bn()?;
                bn.add_word(1)?;
                let asn1_serial = bn.to_asn1_integer()?;
                builder.set_serial_number(&asn1_serial)?;
            }
        }
        builder.set_subject_name(name)?;
        builder.set_issuer_name(akid_issuer.unwrap_or(name))?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| DaneError::Message("system clock before the epoch"))?
            .as_secs() as i64;
        let not_before = Asn1Time::from_unix(now - CA_VALIDITY_SECS)?;
        builder.set_not_before(&not_before)?;
        let not_after = Asn1Time::from_unix(now + CA_VALIDITY_SECS)?;
        builder.set_not_after(&not_after)?;

        match key {
            Some(key) => builder.set_pubkey(key)?,
            None => builder.set_pubkey(&self.signer()?.key)?,
        }

        builder.append_extension(BasicConstraints::new().ca().build()?)?;
        if key.is_some() && !selfsigned {
            add_akid(&mut builder, akid_keyid)?;
        }
        add_skid(&mut builder, akid_keyid)?;

        // Synthetics are signed unconditionally; trust-anchor signatures are
        // not checked, but an unsigned certificate has no fingerprint and
        // confuses the store lookups of some chain builders.
        let signer = self.signer()?.clone();
        builder.sign(&signer.key, signer.md)?;
        let cert = builder.build();

        if key.is_some() && !selfsigned && self.wrap_signed {
            // An intermediate needs a root above it before it goes into the
            // working chain.
            self.wrap_key(depth + 1, None, &cert)?;
            debug!(depth, "synthesized intermediate issuer certificate");
            self.dane.chain.push(cert);
        } else {
            debug!(depth, "synthesized root certificate");
            self.dane.roots.push(cert);
        }
        Ok(())
    }
}

/// The directory name inside the subject's authority key identifier, if any.
fn akid_issuer_name(subject: &X509Ref) -> Option<&X509NameRef> {
    subject
        .authority_issuer()
        .and_then(|gens| gens.iter().find_map(|gn| gn.directory_name()))
}

/// Adds an authority key identifier whose key id is the single byte 0x00.
///
/// 0x00 can never be a SHA-1 subject key id of ours, but it could be our
/// subject key id when forced from the child's authority key id; in that
/// case 0x01 is used instead. The synthetic certificate is thus never
/// self-signed and exempt from any self-signature checks.
fn add_akid(builder: &mut X509Builder, keyid: Option<&Asn1OctetStringRef>) -> DaneResult<()> {
    let c = match keyid {
        Some(id) if id.as_slice() == [0x00] => 0x01,
        _ => 0x00,
    };
    // AuthorityKeyIdentifier ::= SEQUENCE { keyIdentifier [0] IMPLICIT OCTET STRING }
    let der = [0x30, 0x03, 0x80, 0x01, c];
    let oid = Asn1Object::from_str("2.5.29.35")?;
    let contents = Asn1OctetString::new_from_bytes(&der)?;
    builder.append_extension(X509Extension::new_from_der(&oid, false, &contents)?)?;
    Ok(())
}

/// Sets the subject key identifier to the child's authority key id, so the
/// chain builder links the two, falling back to the usual public-key hash.
fn add_skid(builder: &mut X509Builder, keyid: Option<&Asn1OctetStringRef>) -> DaneResult<()> {
    match keyid {
        Some(id) => {
            let der = der_wrap(0x04, id.as_slice());
            let oid = Asn1Object::from_str("2.5.29.14")?;
            let contents = Asn1OctetString::new_from_bytes(&der)?;
            builder.append_extension(X509Extension::new_from_der(&oid, false, &contents)?)?;
        }
        None => {
            let ext = {
                let ctx = builder.x509v3_context(None, None);
                SubjectKeyIdentifier::new().build(&ctx)?
            };
            builder.append_extension(ext)?;
        }
    }
    Ok(())
}

/// Replaces the signature of a DER certificate with one by the internal key.
///
/// This is a plain transformation of the encoding: the algorithm identifier
/// is replaced both inside the TBSCertificate and in the outer Certificate,
/// the new TBSCertificate is signed, and the three elements are reassembled.
/// The input comes out of our own round-tripped encoding, so structural
/// errors indicate a bug rather than hostile input.
fn resign(der: &[u8], signer: &SignSlot) -> DaneResult<X509> {
    // Certificate ::= SEQUENCE { tbsCertificate, signatureAlgorithm, signatureValue }
    let contents = der_unwrap(der)?;
    let (tbs, _rest) = der_next(contents)?;

    // TBSCertificate ::= SEQUENCE { version [0] EXPLICIT OPTIONAL,
    //     serialNumber, signature, ...unchanged }
    let tbs_contents = der_unwrap(tbs)?;
    let mut body = Vec::with_capacity(tbs.len());
    let mut remaining = tbs_contents;
    if remaining.first() == Some(&0xa0) {
        let (version, rest) = der_next(remaining)?;
        body.extend_from_slice(version);
        remaining = rest;
    }
    let (serial, rest) = der_next(remaining)?;
    body.extend_from_slice(serial);
    let (_old_alg, rest) = der_next(rest)?;
    body.extend_from_slice(ECDSA_WITH_SHA256);
    body.extend_from_slice(rest);
    let new_tbs = der_wrap(0x30, &body);

    let mut sig = Signer::new(signer.md, &signer.key)?;
    sig.update(&new_tbs)?;
    let sig = sig.sign_to_vec()?;

    let mut bits = Vec::with_capacity(sig.len() + 1);
    bits.push(0x00); // no unused bits
    bits.extend_from_slice(&sig);

    let mut cert = new_tbs;
    cert.extend_from_slice(ECDSA_WITH_SHA256);
    cert.extend_from_slice(&der_wrap(0x03, &bits));
    let cert = der_wrap(0x30, &cert);

    Ok(X509::from_der(&cert)?)
}

/// Splits the first TLV off `input`, returning it and the remainder.
fn der_next(input: &[u8]) -> DaneResult<(&[u8], &[u8])> {
    let (header, content) = der_header(input)?;
    Ok(input.split_at(header + content))
}

/// Contents of a SEQUENCE that spans all of `input`.
fn der_unwrap(input: &[u8]) -> DaneResult<&[u8]> {
    let (header, content) = der_header(input)?;
    if input.first() != Some(&0x30) || header + content != input.len() {
        return Err(DaneError::Message("malformed certificate encoding"));
    }
    Ok(&input[header..])
}

/// Decodes one definite-length DER header: (header length, content length).
fn der_header(input: &[u8]) -> DaneResult<(usize, usize)> {
    let malformed = DaneError::Message("malformed certificate encoding");
    if input.len() < 2 {
        return Err(malformed);
    }
    match input[1] {
        len @ 0x00..=0x7f => {
            let len = len as usize;
            if input.len() < 2 + len {
                return Err(malformed);
            }
            Ok((2, len))
        }
        0x80 => Err(malformed), // indefinite length is not DER
        long => {
            let count = (long & 0x7f) as usize;
            if count > std::mem::size_of::<usize>() || input.len() < 2 + count {
                return Err(malformed);
            }
            let mut len = 0usize;
            for &b in &input[2..2 + count] {
                len = (len << 8) | b as usize;
            }
            if input.len() < 2 + count + len {
                return Err(malformed);
            }
            Ok((2 + count, len))
        }
    }
}

/// Encodes one TLV with a definite length.
fn der_wrap(tag: u8, contents: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(contents.len() + 6);
    out.push(tag);
    if contents.len() < 0x80 {
        out.push(contents.len() as u8);
    } else {
        let bytes = contents.len().to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(contents);
    out
}

#[cfg(test)]
mod tests {
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::pkey::{PKey, Private};
    use openssl::rsa::Rsa;
    use openssl::x509::X509NameBuilder;

    use super::*;

    fn keypair() -> PKey<Private> {
        PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
    }

    fn self_signed(cn: &str) -> (PKey<Private>, X509) {
        let pkey = keypair();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", cn).unwrap();
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

    fn signer() -> SignSlot {
        crate::library_init().unwrap();
        crate::signing_slot().unwrap()
    }

    #[test]
    fn test_der_helpers() {
        let short = der_wrap(0x04, &[1, 2, 3]);
        assert_eq!(short, vec![0x04, 0x03, 1, 2, 3]);
        let (header, content) = der_header(&short).unwrap();
        assert_eq!((header, content), (2, 3));

        let long = der_wrap(0x30, &[0xaa; 300]);
        assert_eq!(&long[..4], &[0x30, 0x82, 0x01, 0x2c]);
        let (header, content) = der_header(&long).unwrap();
        assert_eq!((header, content), (4, 300));

        assert!(der_header(&[0x30]).is_err());
        assert!(der_header(&[0x30, 0x80, 0x00]).is_err());
        assert!(der_unwrap(&[0x04, 0x01, 0x00]).is_err());
    }

    #[test]
    fn test_resign_replaces_signature() {
        let signer = signer();
        let (_pkey, cert) = self_signed("resign.example.com");

        let resigned = resign(&cert.to_der().unwrap(), &signer).unwrap();
        // names and key are preserved, the signature is now the internal key's
        assert!(resigned.verify(&signer.public).unwrap());
        assert_eq!(
            resigned.subject_name().try_cmp(cert.subject_name()).unwrap(),
            Ordering::Equal
        );
        assert_eq!(
            resigned
                .serial_number()
                .to_bn()
                .unwrap()
                .to_vec(),
            cert.serial_number().to_bn().unwrap().to_vec()
        );
    }

    #[test]
    fn test_akid_zero_byte_is_remapped() {
        let zero = Asn1OctetString::new_from_bytes(&[0x00]).unwrap();
        let mut builder = X509::builder().unwrap();
        add_akid(&mut builder, Some(&zero)).unwrap();
        let cert = builder.build();
        assert_eq!(cert.authority_key_id().unwrap().as_slice(), &[0x01]);

        let other = Asn1OctetString::new_from_bytes(&[0xab, 0xcd]).unwrap();
        let mut builder = X509::builder().unwrap();
        add_akid(&mut builder, Some(&other)).unwrap();
        let cert = builder.build();
        assert_eq!(cert.authority_key_id().unwrap().as_slice(), &[0x00]);
    }

    #[test]
    fn test_skid_copies_child_akid() {
        let keyid = Asn1OctetString::new_from_bytes(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
        let mut builder = X509::builder().unwrap();
        add_skid(&mut builder, Some(&keyid)).unwrap();
        let cert = builder.build();
        assert_eq!(
            cert.subject_key_id().unwrap().as_slice(),
            &[0xde, 0xad, 0xbe, 0xef]
        );
    }

    #[test]
    fn test_wrap_key_builds_self_signed_root() {
        crate::library_init().unwrap();
        let mut dane = DaneTlsa::new(None, &["example.com"]).unwrap();
        let (_pkey, subject) = self_signed("subject.example.com");

        let mut synth = Synthesizer::new(&mut dane, crate::signing_slot(), true);
        synth.wrap_key(0, None, &subject).unwrap();

        assert_eq!(dane.roots.len(), 1);
        assert!(dane.chain.is_empty());
        assert_eq!(dane.trust_anchor_depth(), Some(1));

        let root = &dane.roots[0];
        // self-signed with the internal key
        assert_eq!(root.issued(root), X509VerifyResult::OK);
        let signer = crate::signing_slot().unwrap();
        assert!(root.verify(&signer.public).unwrap());
        assert_eq!(
            root.subject_name().try_cmp(subject.issuer_name()).unwrap(),
            Ordering::Equal
        );
    }
}
