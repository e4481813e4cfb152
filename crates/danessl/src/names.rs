// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! DNS name checks between the reference identities and the names a
//! certificate presents, per RFC 6125.

use std::str;

use openssl::nid::Nid;
use openssl::x509::X509Ref;
use tracing::debug;

use crate::store::DaneTlsa;

/// Validates one name taken from a certificate.
///
/// Trailing NULs are ignored; anything outside LDH (letters, digits, `-`),
/// `.` and `*` rejects the name, which also covers embedded NULs.
fn check_name(mut name: &[u8]) -> Option<&str> {
    while let [head @ .., 0] = name {
        name = head;
    }
    if name.is_empty() {
        return None;
    }
    if !name
        .iter()
        .all(|&c| c.is_ascii_alphanumeric() || matches!(c, b'.' | b'-' | b'*'))
    {
        return None;
    }
    // all ASCII at this point
    str::from_utf8(name).ok()
}

/// Tests one certificate name against the reference identities.
///
/// A reference identity starting with `.` matches any proper sub-domain of
/// itself. Otherwise the match is a case-insensitive comparison, or the
/// RFC 6125 leftmost-label wildcard: a certificate name `*.<parent>` covers
/// one label in front of `<parent>`, or any number of labels when `multi` is
/// set.
fn match_name(certid: &str, hosts: &[String], multi: bool) -> bool {
    for host in hosts {
        let (domain, match_subdomain) = match host.strip_prefix('.') {
            Some(rest) if !rest.is_empty() => (rest, true),
            _ => (host.as_str(), false),
        };

        if match_subdomain {
            // certid must be <label(s)>.domain
            let (idlen, domlen) = (certid.len(), domain.len());
            if idlen > domlen + 1
                && certid.as_bytes()[idlen - domlen - 1] == b'.'
                && certid[idlen - domlen..].eq_ignore_ascii_case(domain)
            {
                return true;
            }
            continue;
        }

        if certid.eq_ignore_ascii_case(domain) {
            return true;
        }

        // Initial "*." in the certid matches one hostname label, or more
        // when multi-label wildcards are enabled, provided the reference
        // has a parent domain at all.
        let id = certid.as_bytes();
        if id.len() > 2 && id[0] == b'*' && id[1] == b'.' {
            let tail = &certid[1..];
            if let Some(dot) = domain.find('.') {
                let parent = &domain[dot..];
                if tail.len() <= parent.len() {
                    let cmp = if multi {
                        &parent[parent.len() - tail.len()..]
                    } else {
                        parent
                    };
                    if cmp.eq_ignore_ascii_case(tail) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

/// The first commonName of the subject, decoded to UTF-8 and validated.
fn parse_subject_name(cert: &X509Ref) -> Option<String> {
    let entry = cert
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()?;
    let utf8 = entry.data().as_utf8().ok()?;
    check_name(utf8.as_bytes()).map(str::to_string)
}

/// Checks the leaf's names against the stored reference identities.
///
/// DNS subjectAltName entries are consulted in certificate order; the
/// commonName is only considered when the certificate carries no DNS
/// subjectAltName at all. The first matching name is recorded as the
/// matched peer name.
pub(crate) fn name_check(dane: &mut DaneTlsa, cert: &X509Ref) -> bool {
    let mut got_altname = false;

    if let Some(gens) = cert.subject_alt_names() {
        for gn in &gens {
            let Some(dns) = gn.dnsname() else {
                continue;
            };
            got_altname = true;
            let Some(certid) = check_name(dns.as_bytes()) else {
                continue;
            };
            if match_name(certid, &dane.hosts, dane.multi) {
                debug!(name = certid, "subjectAltName matched reference identity");
                dane.mhost = Some(certid.to_string());
                return true;
            }
        }
    }

    if !got_altname {
        if let Some(certid) = parse_subject_name(cert) {
            if match_name(&certid, &dane.hosts, dane.multi) {
                debug!(name = %certid, "commonName matched reference identity");
                dane.mhost = Some(certid);
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_check_name() {
        assert_eq!(check_name(b"www.example.com"), Some("www.example.com"));
        assert_eq!(check_name(b"*.example.com"), Some("*.example.com"));
        assert_eq!(check_name(b"a-b.example.com"), Some("a-b.example.com"));
        // trailing NULs are trimmed
        assert_eq!(check_name(b"example.com\0\0"), Some("example.com"));
        // embedded NULs reject the name
        assert_eq!(check_name(b"example.com\0evil.com"), None);
        // non-LDH characters reject the name
        assert_eq!(check_name(b"exa_mple.com"), None);
        assert_eq!(check_name(b"example.com "), None);
        assert_eq!(check_name(b""), None);
        assert_eq!(check_name(b"\0"), None);
    }

    #[test]
    fn test_match_name_literal() {
        let h = hosts(&["example.com"]);
        assert!(match_name("example.com", &h, false));
        assert!(match_name("EXAMPLE.COM", &h, false));
        assert!(!match_name("www.example.com", &h, false));
        assert!(!match_name("example.org", &h, false));
    }

    #[test]
    fn test_match_name_wildcard() {
        let h = hosts(&["x.a.b"]);
        assert!(match_name("*.a.b", &h, false));
        assert!(!match_name("*.b", &h, false));
        // multi-label wildcards align on the trailing suffix
        assert!(match_name("*.b", &h, true));
        assert!(match_name("*.a.b", &h, true));

        // wildcard needs a parent domain in the reference
        let bare = hosts(&["com"]);
        assert!(!match_name("*.com", &bare, false));

        // "*.a.b" does not cover "a.b" itself, nor "y.x.a.b"
        assert!(!match_name("*.a.b", &hosts(&["a.b"]), false));
        assert!(!match_name("*.a.b", &hosts(&["y.x.a.b"]), false));
        assert!(match_name("*.a.b", &hosts(&["y.x.a.b"]), true));
    }

    #[test]
    fn test_match_name_subdomain() {
        let h = hosts(&[".example.com"]);
        assert!(match_name("www.example.com", &h, false));
        assert!(match_name("a.b.example.com", &h, false));
        // the domain itself is not a proper sub-domain
        assert!(!match_name("example.com", &h, false));
        assert!(!match_name("badexample.com", &h, false));
    }

    #[test]
    fn test_match_name_first_reference_wins() {
        // consulted in insertion order
        let h = hosts(&["one.example.com", "two.example.com"]);
        assert!(match_name("two.example.com", &h, false));
        assert!(match_name("one.example.com", &h, false));
        assert!(!match_name("three.example.com", &h, false));
    }

    #[test]
    fn test_match_name_empty_references() {
        assert!(!match_name("example.com", &[], false));
    }
}
