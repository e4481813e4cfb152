// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The dane-connect program: connect to a live TLS server and verify its
//! certificate against one TLSA association given on the command line.

// BINARY WARNINGS
#![warn(
    clippy::default_trait_access,
    clippy::dbg_macro,
    clippy::unimplemented,
    missing_copy_implementations,
    missing_docs,
    non_snake_case,
    non_upper_case_globals,
    rust_2018_idioms,
    unreachable_pub
)]

use std::error::Error;
use std::fs;
use std::net::TcpStream;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use openssl::hash::{hash, MessageDigest};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::{X509, X509Ref};
use tracing::warn;

use danessl::{DaneSupport, DaneTlsa, DaneVerifier, PkixBuilder, Selector, VerifyContext};

/// Connect to a TLS server and verify its certificate against a TLSA
/// association.
///
/// The association data is derived from a local PEM certificate: the full
/// certificate or its SubjectPublicKeyInfo per the selector, optionally
/// hashed per the matching type. This stands in for an authenticated TLSA
/// lookup so DANE verification can be exercised against live servers.
#[derive(Debug, Parser)]
#[clap(name = "dane-connect")]
struct Opts {
    /// TLSA certificate usage
    usage: u8,

    /// TLSA selector
    selector: u8,

    /// Matching type: empty string or an OpenSSL digest algorithm name
    mtype: String,

    /// PEM certificate file providing the association data
    certfile: PathBuf,

    /// PEM file with any usage 0/1 trusted roots, empty string to skip
    cafile: String,

    /// Destination port number
    service: u16,

    /// Destination hostname
    hostname: String,

    /// Each certname augments the hostname for the name checks
    certnames: Vec<String>,

    /// Allow certificate wildcards to span multiple labels
    #[clap(long)]
    multi: bool,

    /// Enable debug logging
    #[clap(long)]
    debug: bool,
}

/// Derives the TLSA association data the arguments describe.
fn tlsa_data(opts: &Opts) -> Result<Vec<u8>, Box<dyn Error>> {
    let pem = fs::read(&opts.certfile)?;
    let cert = X509::from_pem(&pem)?;

    let der = match Selector::try_from(opts.selector)? {
        Selector::Cert => cert.to_der()?,
        Selector::Spki => cert.public_key()?.public_key_to_der()?,
    };

    if opts.mtype.is_empty() {
        return Ok(der);
    }
    let md = MessageDigest::from_name(&opts.mtype)
        .ok_or_else(|| format!("invalid certificate digest: {}", opts.mtype))?;
    Ok(hash(md, &der)?.to_vec())
}

/// The subject in the one-line format OpenSSL tools print.
fn subject_oneline(cert: &X509Ref) -> String {
    let mut out = String::new();
    for entry in cert.subject_name().entries() {
        let key = entry.object().nid().short_name().unwrap_or("UNDEF");
        match entry.data().as_utf8() {
            Ok(value) => {
                out.push('/');
                out.push_str(key);
                out.push('=');
                out.push_str(&value);
            }
            Err(_) => out.push_str("/<unprintable>"),
        }
    }
    if out.is_empty() {
        out.push_str("<unknown>");
    }
    out
}

fn run(opts: &Opts) -> Result<(), Box<dyn Error>> {
    if danessl::library_init()? == DaneSupport::Partial {
        warn!("partial DANE support, usage 2 records will be rejected");
    }

    // the underlying chain builder, with any usage 0/1 trust roots
    let mut pkix = PkixBuilder::new();
    if !opts.cafile.is_empty() {
        for ca in X509::stack_from_pem(&fs::read(&opts.cafile)?)? {
            pkix.add_ca(ca);
        }
    }
    let verifier = DaneVerifier::new(Box::new(pkix))?;

    // connection state: SNI plus the names acceptable to the name check
    let mut names: Vec<&str> = vec![opts.hostname.as_str()];
    names.extend(opts.certnames.iter().map(String::as_str));
    let mut dane = DaneTlsa::new(Some(&opts.hostname), &names)?;
    dane.set_multi_label_wildcard(opts.multi);
    dane.add_tlsa(opts.usage, opts.selector, mtype(opts), &tlsa_data(opts)?)?;

    // connect without any TLS-layer verification, the DANE driver decides
    let tcp = TcpStream::connect((opts.hostname.as_str(), opts.service))?;
    println!("connected to {}:{}", opts.hostname, opts.service);

    let mut connector = SslConnector::builder(SslMethod::tls())?;
    connector.set_verify(SslVerifyMode::NONE);
    let connector = connector.build();
    let mut config = connector.configure()?;
    config.set_verify_hostname(false);
    let sni = dane.sni_name().unwrap_or(&opts.hostname).to_string();
    let mut tls = config.connect(&sni, tcp)?;

    let ssl = tls.ssl();
    let leaf = ssl
        .peer_certificate()
        .ok_or("server presented no certificate")?;
    let chain: Vec<X509> = ssl
        .peer_cert_chain()
        .map(|chain| chain.iter().map(|c| c.to_owned()).collect())
        .unwrap_or_default();

    let mut ctx = VerifyContext::new(leaf, chain);
    ctx.set_verify_callback(|ok, event| {
        let subject = event.cert.map(subject_oneline);
        println!(
            "depth={} verify={} err={} subject={}",
            event.depth,
            i32::from(ok),
            event
                .error
                .map_or_else(|| "none".to_string(), |e| e.to_string()),
            subject.as_deref().unwrap_or("<unknown>"),
        );
        // report only, never reject; the final status tells the tale
        true
    });

    let ok = verifier.verify_cert(Some(&mut dane), &mut ctx)?;
    match ctx.error() {
        None => println!("verify status: {}", if ok { "ok" } else { "failed" }),
        Some(err) => println!(
            "verify status: {} ({err})",
            if ok { "ok, overridden" } else { "failed" },
        ),
    }
    if let Some(mhost) = dane.matched_host() {
        println!("matched peer name: {mhost}");
    }

    let _ = tls.shutdown();
    Ok(())
}

fn mtype(opts: &Opts) -> Option<&str> {
    if opts.mtype.is_empty() {
        None
    } else {
        Some(&opts.mtype)
    }
}

fn main() {
    let opts = Opts::parse();
    let level = if opts.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    // the binary is dane-connect, the tracing target is the module path
    danessl_util::logger("dane_connect", level);

    if let Err(err) = run(&opts) {
        eprintln!("Fatal: {err}");
        process::exit(1);
    }
}
