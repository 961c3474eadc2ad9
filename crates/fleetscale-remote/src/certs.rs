//! Per-machine certificate generation.
//!
//! Each machine gets its own CA. The CA key travels to the machine so it can
//! issue the daemon's serving certificate; the leaf generated here is the
//! control plane's client certificate for that machine.

use chrono::{Datelike, Duration, Utc};
use fleetscale_core::{ServerName, TlsMaterial};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, SanType,
};

use crate::error::Result;

/// How long generated certificates stay valid.
const VALIDITY_DAYS: i64 = 5 * 365;

/// Generate a fresh CA and a leaf certificate signed by it.
///
/// # Errors
///
/// Returns an error if key generation or signing fails.
pub fn generate(name: &ServerName) -> Result<TlsMaterial> {
    let (start, end) = validity();

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name = distinguished_name(&format!("{name} CA"));
    ca_params.not_before = rcgen::date_time_ymd(start.0, start.1, start.2);
    ca_params.not_after = rcgen::date_time_ymd(end.0, end.1, end.2);

    let ca_key = KeyPair::generate()?;
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let mut leaf_params = CertificateParams::default();
    leaf_params.distinguished_name = distinguished_name(name.as_str());
    leaf_params.subject_alt_names = vec![
        SanType::DnsName(name.to_string().try_into()?),
        SanType::DnsName("localhost".to_string().try_into()?),
    ];
    leaf_params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    leaf_params.not_before = ca_params.not_before;
    leaf_params.not_after = ca_params.not_after;

    let leaf_key = KeyPair::generate()?;
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key)?;

    tracing::debug!(server = %name, "generated machine certificates");

    Ok(TlsMaterial {
        ca_key: ca_key.serialize_pem(),
        ca_cert: ca_cert.pem(),
        tls_key: leaf_key.serialize_pem(),
        tls_cert: leaf_cert.pem(),
    })
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "fleetscale");
    dn.push(DnType::CommonName, common_name);
    dn
}

/// Validity window as `(year, month, day)` bounds, starting yesterday to
/// tolerate clock skew.
fn validity() -> ((i32, u8, u8), (i32, u8, u8)) {
    let start = Utc::now() - Duration::days(1);
    let end = start + Duration::days(VALIDITY_DAYS);
    (ymd(start), ymd(end))
}

fn ymd(at: chrono::DateTime<Utc>) -> (i32, u8, u8) {
    let month = u8::try_from(at.month()).unwrap_or(1);
    let day = u8::try_from(at.day()).unwrap_or(1);
    (at.year(), month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_pem_material() {
        let name = ServerName::parse("agent-certs").unwrap();
        let tls = generate(&name).unwrap();

        assert!(tls.ca_cert.contains("BEGIN CERTIFICATE"));
        assert!(tls.tls_cert.contains("BEGIN CERTIFICATE"));
        assert!(tls.ca_key.contains("PRIVATE KEY"));
        assert!(tls.tls_key.contains("PRIVATE KEY"));
        assert_ne!(tls.ca_cert, tls.tls_cert);
        assert_ne!(tls.ca_key, tls.tls_key);
    }

    #[test]
    fn every_machine_gets_its_own_ca() {
        let a = generate(&ServerName::generate()).unwrap();
        let b = generate(&ServerName::generate()).unwrap();
        assert_ne!(a.ca_cert, b.ca_cert);
        assert_ne!(a.ca_key, b.ca_key);
    }
}
