//! Renewal scheduling

use chrono::{DateTime, Utc};
use certwarden_common::crd::CertificateSpec;
use certwarden_common::Duration;
use tracing::info;

/// Renew-before window actually applied to a certificate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenewBefore {
    /// Window before `notAfter` in which renewal starts
    pub duration: chrono::Duration,
    /// Whether the configured window exceeded the lifetime and was cut to a third of it
    pub clamped: bool,
}

/// Renew-before window for a certificate living `cert_duration`
///
/// A window longer than the certificate itself is clamped to a third of the
/// lifetime.
pub fn effective_renew_before(
    cert_duration: chrono::Duration,
    spec: &CertificateSpec,
    default_renew_before: Duration,
) -> RenewBefore {
    let configured = spec
        .renew_before
        .unwrap_or(default_renew_before)
        .as_chrono();
    if configured > cert_duration {
        RenewBefore {
            duration: cert_duration / 3,
            clamped: true,
        }
    } else {
        RenewBefore {
            duration: configured,
            clamped: false,
        }
    }
}

/// Time from `now` until the certificate valid from `not_before` to
/// `not_after` should be renewed
///
/// Zero or negative means renewal is due now.
pub fn time_until_renew(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    spec: &CertificateSpec,
    default_renew_before: Duration,
    now: DateTime<Utc>,
) -> chrono::Duration {
    let cert_duration = not_after - not_before;
    if let Some(requested) = spec.duration {
        if cert_duration < requested.as_chrono() {
            info!(
                requested = %requested,
                actual_secs = cert_duration.num_seconds(),
                "Issued certificate is shorter than requested; the issuer's policy applies"
            );
        }
    }

    let renew_before = effective_renew_before(cert_duration, spec, default_renew_before);
    (not_after - now) - renew_before.duration
}

#[cfg(test)]
mod tests {
    use super::*;
    use certwarden_common::crd::{IssuerRef, KeyAlgorithm, KeyEncoding};
    use chrono::TimeZone;

    fn spec(renew_before: Option<Duration>) -> CertificateSpec {
        CertificateSpec {
            secret_name: "web-tls".to_string(),
            common_name: Some("web.example.com".to_string()),
            dns_names: vec![],
            ip_addresses: vec![],
            organization: vec![],
            duration: None,
            renew_before,
            key_algorithm: KeyAlgorithm::Ecdsa,
            key_size: 256,
            key_encoding: KeyEncoding::Pkcs8,
            is_ca: false,
            issuer_ref: IssuerRef::default(),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("valid date")
    }

    fn days(n: i64) -> chrono::Duration {
        chrono::Duration::days(n)
    }

    const DEFAULT: Duration = Duration::from_hours(720);

    #[test]
    fn ninety_day_cert_renews_after_sixty_days() {
        let until = time_until_renew(
            t0(),
            t0() + days(90),
            &spec(Some(Duration::from_hours(30 * 24))),
            DEFAULT,
            t0(),
        );
        assert_eq!(until, days(60));
    }

    #[test]
    fn oversized_renew_before_is_clamped_to_a_third() {
        let s = spec(Some(Duration::from_hours(30 * 24)));
        let rb = effective_renew_before(days(10), &s, DEFAULT);
        assert!(rb.clamped);
        assert_eq!(rb.duration, days(10) / 3);

        let until = time_until_renew(t0(), t0() + days(10), &s, DEFAULT, t0());
        assert_eq!(until, days(10) - days(10) / 3);
        assert!(until > days(6) && until < days(7));
    }

    #[test]
    fn default_applies_when_unset() {
        let until = time_until_renew(t0(), t0() + days(90), &spec(None), DEFAULT, t0());
        assert_eq!(until, days(60));
    }

    #[test]
    fn overdue_certificate_is_due_now() {
        let until = time_until_renew(
            t0(),
            t0() + days(90),
            &spec(None),
            DEFAULT,
            t0() + days(75),
        );
        assert!(until <= chrono::Duration::zero());
    }

    #[test]
    fn clamped_window_never_exceeds_lifetime_and_result_is_non_negative() {
        for lifetime_hours in [1i64, 5, 24, 24 * 10, 24 * 90, 24 * 365] {
            for renew_hours in [1u64, 12, 24 * 30, 24 * 400] {
                let lifetime = chrono::Duration::hours(lifetime_hours);
                let s = spec(Some(Duration::from_hours(renew_hours)));
                let rb = effective_renew_before(lifetime, &s, DEFAULT);
                assert!(rb.duration <= lifetime);

                let until = time_until_renew(t0(), t0() + lifetime, &s, DEFAULT, t0());
                assert!(until >= chrono::Duration::zero());
            }
        }
    }
}
