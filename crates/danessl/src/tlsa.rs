// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! TLSA certificate usage and selector fields, restricted to the values the
//! verification engine implements.

use std::fmt;

use crate::error::DaneError;

/// [RFC 6698, DNS-Based Authentication for TLS](https://tools.ietf.org/html/rfc6698#section-2.1.1)
///
/// ```text
/// 2.1.1.  The Certificate Usage Field
///
///    A one-octet value, called "certificate usage", specifies the provided
///    association that will be used to match the certificate presented in
///    the TLS handshake.  The certificate usages defined in this
///    document are:
///
///       0 -- CA constraint
///
///       1 -- Service certificate constraint
///
///       2 -- Trust anchor assertion
///
///       3 -- Domain-issued certificate
/// ```
///
/// Unlike a wire-format decoder, the verifier rejects unassigned and private
/// usages outright, since no verification semantics exist for them.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum CertUsage {
    /// Constrains which CA certificate must be found in the PKIX
    /// certification path; PKIX validation is still required (PKIX-TA)
    PkixTa,

    /// Constrains the end entity certificate; PKIX validation is still
    /// required (PKIX-EE)
    PkixEe,

    /// Asserts a new trust anchor under which the chain must validate,
    /// bypassing the local PKIX trust store (DANE-TA)
    DaneTa,

    /// Asserts the end entity certificate directly; no PKIX validation is
    /// performed (DANE-EE)
    DaneEe,
}

/// The number of distinct certificate usages
pub(crate) const USAGE_COUNT: usize = 4;

impl CertUsage {
    /// Index into the per-usage record groups of the TLSA store
    pub(crate) fn index(self) -> usize {
        u8::from(self) as usize
    }
}

impl TryFrom<u8> for CertUsage {
    type Error = DaneError;

    fn try_from(usage: u8) -> Result<Self, DaneError> {
        match usage {
            0 => Ok(Self::PkixTa),
            1 => Ok(Self::PkixEe),
            2 => Ok(Self::DaneTa),
            3 => Ok(Self::DaneEe),
            _ => Err(DaneError::BadUsage(usage)),
        }
    }
}

impl From<CertUsage> for u8 {
    fn from(usage: CertUsage) -> Self {
        match usage {
            CertUsage::PkixTa => 0,
            CertUsage::PkixEe => 1,
            CertUsage::DaneTa => 2,
            CertUsage::DaneEe => 3,
        }
    }
}

impl fmt::Display for CertUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", u8::from(*self))
    }
}

/// [RFC 6698, DNS-Based Authentication for TLS](https://tools.ietf.org/html/rfc6698#section-2.1.2)
///
/// ```text
/// 2.1.2.  The Selector Field
///
///    A one-octet value, called "selector", specifies which part of the TLS
///    certificate presented by the server will be matched against the
///    association data.  The selectors defined in this document are:
///
///       0 -- Full certificate
///
///       1 -- SubjectPublicKeyInfo
/// ```
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Selector {
    /// Full certificate: the DER-encoded Certificate structure as defined in
    /// [RFC 5280](https://tools.ietf.org/html/rfc5280)
    Cert,

    /// SubjectPublicKeyInfo: the DER-encoded binary structure as defined in
    /// [RFC 5280](https://tools.ietf.org/html/rfc5280)
    Spki,
}

impl TryFrom<u8> for Selector {
    type Error = DaneError;

    fn try_from(selector: u8) -> Result<Self, DaneError> {
        match selector {
            0 => Ok(Self::Cert),
            1 => Ok(Self::Spki),
            _ => Err(DaneError::BadSelector(selector)),
        }
    }
}

impl From<Selector> for u8 {
    fn from(selector: Selector) -> Self {
        match selector {
            Selector::Cert => 0,
            Selector::Spki => 1,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", u8::from(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_cert_usage() {
        assert_eq!(CertUsage::try_from(0).unwrap(), CertUsage::PkixTa);
        assert_eq!(CertUsage::try_from(1).unwrap(), CertUsage::PkixEe);
        assert_eq!(CertUsage::try_from(2).unwrap(), CertUsage::DaneTa);
        assert_eq!(CertUsage::try_from(3).unwrap(), CertUsage::DaneEe);
        assert!(matches!(
            CertUsage::try_from(4),
            Err(DaneError::BadUsage(4))
        ));
        assert!(matches!(
            CertUsage::try_from(255),
            Err(DaneError::BadUsage(255))
        ));

        assert_eq!(u8::from(CertUsage::PkixTa), 0);
        assert_eq!(u8::from(CertUsage::PkixEe), 1);
        assert_eq!(u8::from(CertUsage::DaneTa), 2);
        assert_eq!(u8::from(CertUsage::DaneEe), 3);
    }

    #[test]
    fn read_selector() {
        assert_eq!(Selector::try_from(0).unwrap(), Selector::Cert);
        assert_eq!(Selector::try_from(1).unwrap(), Selector::Spki);
        assert!(matches!(
            Selector::try_from(2),
            Err(DaneError::BadSelector(2))
        ));

        assert_eq!(u8::from(Selector::Cert), 0);
        assert_eq!(u8::from(Selector::Spki), 1);
    }
}
