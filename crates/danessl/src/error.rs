// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error types for the crate

#![deny(missing_docs)]

use openssl::error::ErrorStack;
use thiserror::Error;

/// An alias for results returned by functions of this crate
pub type DaneResult<T> = ::std::result::Result<T, DaneError>;

/// The error type for errors that get returned in the crate
///
/// Insertion-time errors leave the TLSA store unmutated; verification-time
/// errors are fatal to the verification call, while recoverable conditions
/// (untrusted chain, hostname mismatch) are reported through the verify
/// callback instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DaneError {
    /// The TLSA certificate usage is not one of the RFC 6698 values 0..=3
    #[error("bad TLSA record usage: {0}")]
    BadUsage(u8),

    /// The TLSA selector is not one of the RFC 6698 values 0..=1
    #[error("bad TLSA record selector: {0}")]
    BadSelector(u8),

    /// The TLSA matching type names a digest this OpenSSL build does not know
    #[error("bad TLSA record digest: {0}")]
    BadDigest(String),

    /// The association data length does not equal the digest output length
    #[error("bad TLSA record digest length")]
    BadDataLength,

    /// The association data is empty
    #[error("bad TLSA record null data")]
    BadNullData,

    /// Usage 2 selector 0 data with no matching type is not a DER certificate
    #[error("bad TLSA record certificate")]
    BadCert,

    /// The TLSA record certificate carries an unusable public key
    #[error("bad TLSA record certificate public key")]
    BadCertPKey,

    /// Usage 2 selector 1 data with no matching type is not a DER public key
    #[error("bad TLSA record public key")]
    BadPKey,

    /// Trust-anchor synthesis needs the internal signing key, which this
    /// process could not generate (see [`crate::library_init`])
    #[error("certificate usage 2 requires EC support")]
    NoSignKey,

    /// The platform cannot provide DANE support at all
    #[error("DANE library features not supported")]
    DaneSupport,

    /// The connection handle has no DANE state attached
    #[error("dane_init() required")]
    DaneInit,

    /// The TLS context was not initialised for DANE verification
    #[error("context_init() required")]
    SctxInit,

    /// [`crate::library_init`] has not been called yet
    #[error("library_init() required")]
    LibraryInit,

    /// An unexpected condition inside the verification engine
    #[error("{0}")]
    Message(&'static str),

    /// An error from the underlying OpenSSL library
    #[error("ssl error: {0}")]
    Ssl(#[from] ErrorStack),
}
