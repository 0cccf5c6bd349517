/// Certificate identity extraction and revocation checking for mTLS client
/// authentication
///
/// Identity matching uses the subject DN or the subject key identifier from
/// the presented certificate. Revocation consults OCSP when the certificate
/// names a responder and the TLS layer supplied the issuer, falling back to
/// the CRL distribution points; results are held in a short in-memory cache.
use std::time::Duration;

use dashmap::DashMap;
use sha1::{Digest, Sha1};
use x509_parser::prelude::*;

use crate::clock::{now_nanos, NANOS_PER_SEC};
use crate::error::{Result, ServiceError};

const CACHE_TTL_SECS: i64 = 300;
const FETCH_TIMEOUT_SECS: u64 = 5;

const OID_OCSP: &str = "1.3.6.1.5.5.7.48.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationStatus {
    Good,
    Revoked,
    Unknown,
}

/// Identity facts extracted from a client certificate.
#[derive(Debug, Clone)]
pub struct CertIdentity {
    pub subject_dn: String,
    /// Subject key identifier, lowercase hex, when the extension is present.
    pub ski_hex: Option<String>,
    pub serial_hex: String,
    pub ocsp_url: Option<String>,
    pub crl_urls: Vec<String>,
}

/// Parse the DER certificate into the facts client authentication needs.
pub fn extract_identity(cert_der: &[u8]) -> Result<CertIdentity> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|_| ServiceError::InvalidClient)?;

    let mut ski_hex = None;
    let mut ocsp_url = None;
    let mut crl_urls = Vec::new();

    for ext in cert.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::SubjectKeyIdentifier(ski) => {
                ski_hex = Some(hex::encode(ski.0));
            }
            ParsedExtension::AuthorityInfoAccess(aia) => {
                for desc in &aia.accessdescs {
                    if desc.access_method.to_id_string() == OID_OCSP {
                        if let GeneralName::URI(uri) = &desc.access_location {
                            ocsp_url = Some(uri.to_string());
                        }
                    }
                }
            }
            ParsedExtension::CRLDistributionPoints(points) => {
                for point in &points.points {
                    if let Some(DistributionPointName::FullName(names)) =
                        &point.distribution_point
                    {
                        for name in names {
                            if let GeneralName::URI(uri) = name {
                                crl_urls.push(uri.to_string());
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok(CertIdentity {
        subject_dn: cert.subject().to_string(),
        ski_hex,
        serial_hex: hex::encode(cert.raw_serial()),
        ocsp_url,
        crl_urls,
    })
}

/// Revocation checker with a short-lived in-memory cache.
pub struct RevocationChecker {
    http: reqwest::Client,
    cache: DashMap<String, (RevocationStatus, i64)>,
}

impl Default for RevocationChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl RevocationChecker {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            http,
            cache: DashMap::new(),
        }
    }

    /// Check revocation for `cert_der`. `issuer_der` is the next certificate
    /// in the presented chain when the client sent one; without it OCSP is
    /// skipped (the request requires issuer hashes).
    pub async fn check(
        &self,
        cert_der: &[u8],
        issuer_der: Option<&[u8]>,
    ) -> RevocationStatus {
        let identity = match extract_identity(cert_der) {
            Ok(identity) => identity,
            Err(_) => return RevocationStatus::Unknown,
        };

        let now = now_nanos();
        if let Some(entry) = self.cache.get(&identity.serial_hex) {
            let (status, expires) = *entry;
            if expires > now {
                return status;
            }
        }

        let mut status = RevocationStatus::Unknown;

        if let (Some(url), Some(issuer)) = (&identity.ocsp_url, issuer_der) {
            if let Some(resolved) = self.check_ocsp(url, cert_der, issuer).await {
                status = resolved;
            }
        }

        if status == RevocationStatus::Unknown {
            for url in &identity.crl_urls {
                if let Some(resolved) = self.check_crl(url, cert_der).await {
                    status = resolved;
                    break;
                }
            }
        }

        self.cache.insert(
            identity.serial_hex,
            (status, now + CACHE_TTL_SECS * NANOS_PER_SEC),
        );
        status
    }

    async fn check_ocsp(
        &self,
        url: &str,
        cert_der: &[u8],
        issuer_der: &[u8],
    ) -> Option<RevocationStatus> {
        let request = build_ocsp_request(cert_der, issuer_der)?;
        let response = self
            .http
            .post(url)
            .header("content-type", "application/ocsp-request")
            .body(request)
            .send()
            .await
            .ok()?;
        let body = response.bytes().await.ok()?;
        parse_ocsp_response(&body, cert_der)
    }

    async fn check_crl(&self, url: &str, cert_der: &[u8]) -> Option<RevocationStatus> {
        let response = self.http.get(url).send().await.ok()?;
        let body = response.bytes().await.ok()?;
        evaluate_crl(&body, cert_der)
    }
}

/// Decide a certificate's status from a DER CRL.
pub fn evaluate_crl(crl_der: &[u8], cert_der: &[u8]) -> Option<RevocationStatus> {
    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let (_, crl) = CertificateRevocationList::from_der(crl_der).ok()?;

    let revoked = crl
        .iter_revoked_certificates()
        .any(|entry| entry.user_certificate == cert.tbs_certificate.serial);
    Some(if revoked {
        RevocationStatus::Revoked
    } else {
        RevocationStatus::Good
    })
}

/// Minimal unsigned OCSPRequest (RFC 6960) for one certificate, SHA-1
/// CertID as universally supported by responders.
fn build_ocsp_request(cert_der: &[u8], issuer_der: &[u8]) -> Option<Vec<u8>> {
    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let (_, issuer) = X509Certificate::from_der(issuer_der).ok()?;

    let name_hash = Sha1::digest(issuer.tbs_certificate.subject.as_raw());
    let key_hash = Sha1::digest(issuer.tbs_certificate.subject_pki.subject_public_key.data.as_ref());

    // CertID ::= SEQUENCE { AlgorithmIdentifier, OCTET STRING, OCTET STRING,
    // CertificateSerialNumber }
    let alg_id = der(
        0x30,
        &[der(0x06, &[0x2b, 0x0e, 0x03, 0x02, 0x1a]), der(0x05, &[])].concat(),
    );
    let cert_id = der(
        0x30,
        &[
            alg_id,
            der(0x04, &name_hash),
            der(0x04, &key_hash),
            der(0x02, cert.raw_serial()),
        ]
        .concat(),
    );

    let request = der(0x30, &cert_id);
    let request_list = der(0x30, &request);
    let tbs_request = der(0x30, &request_list);
    Some(der(0x30, &tbs_request))
}

/// Tolerant OCSPResponse walk: find the SingleResponse matching our serial
/// and read its certStatus tag. Any structural surprise yields None and the
/// caller falls back to CRL.
fn parse_ocsp_response(body: &[u8], cert_der: &[u8]) -> Option<RevocationStatus> {
    use x509_parser::der_parser::ber::BerObjectContent;
    use x509_parser::der_parser::parse_der;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let serial = cert.raw_serial();

    let (_, response) = parse_der(body).ok()?;
    let outer = response.as_sequence().ok()?;
    // responseStatus ENUMERATED: 0 = successful.
    if outer.first()?.as_u32().ok()? != 0 {
        return None;
    }

    // responseBytes [0] EXPLICIT → SEQUENCE { OID, OCTET STRING }.
    let tagged = outer.get(1)?;
    let response_bytes = match &tagged.content {
        BerObjectContent::Tagged(_, _, inner) => inner.as_sequence().ok()?.to_vec(),
        BerObjectContent::Unknown(any) => {
            let (_, inner) = parse_der(any.data).ok()?;
            inner.as_sequence().ok()?.to_vec()
        }
        _ => return None,
    };
    let basic_der = response_bytes.get(1)?.as_slice().ok()?.to_vec();

    // BasicOCSPResponse → tbsResponseData → responses (first plain
    // SEQUENCE child).
    let (_, basic) = parse_der(&basic_der).ok()?;
    let basic_seq = basic.as_sequence().ok()?;
    let tbs = basic_seq.first()?.as_sequence().ok()?;
    let responses = tbs
        .iter()
        .find(|obj| matches!(obj.content, BerObjectContent::Sequence(_)))?
        .as_sequence()
        .ok()?;

    for single in responses {
        let fields = single.as_sequence().ok()?;
        let cert_id = fields.first()?.as_sequence().ok()?;
        // certID.serialNumber is the last field.
        let matches_serial = cert_id
            .last()
            .and_then(|obj| obj.as_slice().ok())
            .map(|bytes| bytes == serial)
            .unwrap_or(false);
        if !matches_serial {
            continue;
        }
        // certStatus: [0] good, [1] revoked, [2] unknown.
        let status = fields.get(1)?;
        return Some(match status.header.tag().0 {
            0 => RevocationStatus::Good,
            1 => RevocationStatus::Revoked,
            _ => RevocationStatus::Unknown,
        });
    }
    None
}

/// DER TLV with definite length.
fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let first = bytes.iter().position(|&b| b != 0).unwrap_or(7);
        out.push(0x80 | (8 - first) as u8);
        out.extend_from_slice(&bytes[first..]);
    }
    out.extend_from_slice(content);
    out
}
