//! Sigstore verification of code provenance
//!
//! Establishes which measurement the published source code should produce:
//! 1. Look up the latest release and its image digest
//! 2. Fetch the Sigstore bundle attesting that digest
//! 3. Fetch the Sigstore trusted root
//! 4. Check the signing certificate was issued by a trusted Fulcio CA to
//!    GitHub Actions for the expected repository
//! 5. Check the DSSE signature and the in-toto subject digest
//! 6. Read the measurement out of the predicate

use std::collections::HashMap;

use base64::Engine;
use der::{Decode, Encode};
use serde::Deserialize;
use x509_cert::Certificate;

use crate::attestation::types::{Measurement, PredicateType};
use crate::error::{VerificationError, VerificationStage};

const GITHUB_ACTIONS_ISSUER: &str = "https://token.actions.githubusercontent.com";

// Fulcio certificate extensions
const OID_ISSUER_V1: &str = "1.3.6.1.4.1.57264.1.1";
const OID_ISSUER_V2: &str = "1.3.6.1.4.1.57264.1.8";
const OID_BUILD_SIGNER_URI: &str = "1.3.6.1.4.1.57264.1.9";
const OID_SOURCE_REPOSITORY_URI: &str = "1.3.6.1.4.1.57264.1.12";

fn stage_error(stage: VerificationStage) -> impl Fn(String) -> VerificationError {
    move |message| VerificationError::new(stage, message)
}

fn decode_b64(data: &str, what: &str) -> Result<Vec<u8>, VerificationError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| verify_error(format!("Failed to decode {}: {}", what, e)))
}

fn verify_error(message: String) -> VerificationError {
    VerificationError::new(VerificationStage::MeasurementVerify, message)
}

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
    tag_name: String,
}

#[derive(Debug, Deserialize)]
struct AttestationResponse {
    attestations: Vec<AttestationEntry>,
}

#[derive(Debug, Deserialize)]
struct AttestationEntry {
    bundle: Bundle,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBytes {
    raw_bytes: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CertificateList {
    certificates: Vec<RawBytes>,
}

/// Sigstore bundle (v0.1 - v0.3 layouts)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    verification_material: VerificationMaterial,
    dsse_envelope: DsseEnvelope,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerificationMaterial {
    #[serde(default)]
    certificate: Option<RawBytes>,
    #[serde(default)]
    x509_certificate_chain: Option<CertificateList>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DsseEnvelope {
    payload: String,
    payload_type: String,
    signatures: Vec<DsseSignature>,
}

#[derive(Debug, Clone, Deserialize)]
struct DsseSignature {
    sig: String,
}

impl Bundle {
    fn signing_certificate(&self) -> Result<Certificate, VerificationError> {
        let material = &self.verification_material;
        let raw = material
            .certificate
            .as_ref()
            .or_else(|| {
                material
                    .x509_certificate_chain
                    .as_ref()
                    .and_then(|chain| chain.certificates.first())
            })
            .ok_or_else(|| verify_error("No certificate in bundle".into()))?;

        let der = decode_b64(&raw.raw_bytes, "certificate")?;
        Certificate::from_der(&der)
            .map_err(|e| verify_error(format!("Failed to parse certificate: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustedRootJson {
    #[serde(default)]
    certificate_authorities: Vec<CertificateAuthorityJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertificateAuthorityJson {
    cert_chain: CertificateList,
}

/// Fulcio certificate authorities from the Sigstore trusted root
#[derive(Debug, Clone)]
pub struct TrustRoot {
    authorities: Vec<Certificate>,
}

impl TrustRoot {
    pub fn from_json(json: &[u8]) -> Result<Self, VerificationError> {
        let fail = stage_error(VerificationStage::TrustRootFetch);
        let parsed: TrustedRootJson = serde_json::from_slice(json)
            .map_err(|e| fail(format!("Failed to parse trusted root: {}", e)))?;

        let mut authorities = Vec::new();
        for ca in parsed.certificate_authorities {
            for raw in ca.cert_chain.certificates {
                let der = base64::engine::general_purpose::STANDARD
                    .decode(&raw.raw_bytes)
                    .map_err(|e| fail(format!("Failed to decode CA certificate: {}", e)))?;
                let cert = Certificate::from_der(&der)
                    .map_err(|e| fail(format!("Failed to parse CA certificate: {}", e)))?;
                authorities.push(cert);
            }
        }

        if authorities.is_empty() {
            return Err(fail("Trusted root contains no certificate authorities".into()));
        }
        Ok(Self { authorities })
    }

    pub fn len(&self) -> usize {
        self.authorities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authorities.is_empty()
    }

    /// Check `leaf` is signed by a CA whose subject is the leaf's issuer
    fn verify_issued(&self, leaf: &Certificate) -> Result<(), VerificationError> {
        use p384::ecdsa::signature::Verifier;
        use p384::ecdsa::{Signature, VerifyingKey};

        let tbs = leaf
            .tbs_certificate
            .to_der()
            .map_err(|e| verify_error(format!("Failed to encode TBS: {}", e)))?;
        let signature = Signature::from_der(leaf.signature.raw_bytes())
            .map_err(|e| verify_error(format!("Invalid certificate signature: {}", e)))?;

        let issued = self
            .authorities
            .iter()
            .filter(|ca| ca.tbs_certificate.subject == leaf.tbs_certificate.issuer)
            .any(|ca| {
                let key = ca
                    .tbs_certificate
                    .subject_public_key_info
                    .subject_public_key
                    .raw_bytes();
                VerifyingKey::from_sec1_bytes(key)
                    .map(|key| key.verify(&tbs, &signature).is_ok())
                    .unwrap_or(false)
            });

        if !issued {
            return Err(verify_error(
                "Signing certificate was not issued by a trusted Fulcio CA".into(),
            ));
        }
        Ok(())
    }
}

/// Identity claims Fulcio embeds in a signing certificate
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CertificateIdentity {
    pub issuer: String,
    pub build_signer_uri: String,
    pub source_repository_uri: String,
}

impl CertificateIdentity {
    fn from_cert(cert: &Certificate) -> Self {
        let mut identity = Self::default();
        let Some(extensions) = &cert.tbs_certificate.extensions else {
            return identity;
        };

        for ext in extensions {
            let value = extension_string(ext.extn_value.as_bytes());
            match ext.extn_id.to_string().as_str() {
                OID_ISSUER_V2 => identity.issuer = value,
                OID_ISSUER_V1 if identity.issuer.is_empty() => identity.issuer = value,
                OID_BUILD_SIGNER_URI => identity.build_signer_uri = value,
                OID_SOURCE_REPOSITORY_URI => identity.source_repository_uri = value,
                _ => {}
            }
        }
        identity
    }

    /// The certificate must come from GitHub Actions running in `repo`
    pub fn check(&self, repo: &str) -> Result<(), VerificationError> {
        if self.issuer != GITHUB_ACTIONS_ISSUER {
            return Err(verify_error(format!(
                "Certificate not from GitHub Actions. Issuer: {}",
                self.issuer
            )));
        }

        let repo_url = format!("https://github.com/{}", repo);
        let signer_prefix = format!("{}/", repo_url);
        if self.source_repository_uri != repo_url
            && !self.build_signer_uri.starts_with(&signer_prefix)
        {
            return Err(verify_error(format!(
                "Certificate not for expected repository. Expected: {}, Got repo: {}, workflow: {}",
                repo, self.source_repository_uri, self.build_signer_uri
            )));
        }
        Ok(())
    }
}

/// v2 extensions are DER UTF8Strings, v1 extensions are raw bytes
fn extension_string(bytes: &[u8]) -> String {
    match der::asn1::Utf8StringRef::from_der(bytes) {
        Ok(s) => s.as_str().to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// DSSE Pre-Authentication Encoding:
/// `"DSSEv1" SP LEN(type) SP type SP LEN(body) SP body`
fn compute_pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut pae = format!(
        "DSSEv1 {} {} {} ",
        payload_type.len(),
        payload_type,
        payload.len()
    )
    .into_bytes();
    pae.extend_from_slice(payload);
    pae
}

/// Check the envelope's signature and return the decoded payload
fn verify_dsse(
    envelope: &DsseEnvelope,
    key: &p256::ecdsa::VerifyingKey,
) -> Result<Vec<u8>, VerificationError> {
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::Signature;

    let payload = decode_b64(&envelope.payload, "payload")?;
    let signature = envelope
        .signatures
        .first()
        .ok_or_else(|| verify_error("No signature in DSSE envelope".into()))?;
    let signature = decode_b64(&signature.sig, "signature")?;

    // DER when it starts with a SEQUENCE tag, raw r||s otherwise
    let signature = if signature.first() == Some(&0x30) {
        Signature::from_der(&signature)
    } else {
        Signature::from_slice(&signature)
    }
    .map_err(|e| verify_error(format!("Invalid signature: {}", e)))?;

    key.verify(&compute_pae(&envelope.payload_type, &payload), &signature)
        .map_err(|e| verify_error(format!("DSSE signature verification failed: {}", e)))?;

    Ok(payload)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InTotoStatement {
    predicate_type: String,
    predicate: serde_json::Value,
    #[serde(default)]
    subject: Vec<Subject>,
}

#[derive(Debug, Deserialize)]
struct Subject {
    digest: HashMap<String, String>,
}

impl InTotoStatement {
    fn covers_digest(&self, digest: &str) -> bool {
        self.subject
            .iter()
            .any(|s| s.digest.get("sha256").map(String::as_str) == Some(digest))
    }

    fn measurement(&self) -> Result<Measurement, VerificationError> {
        let field = |value: &serde_json::Value, name: &str| {
            value
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| verify_error(format!("Missing {}", name)))
        };

        let type_ = PredicateType::from_uri(&self.predicate_type);
        let registers = match type_ {
            PredicateType::SevGuestV2 => vec![field(&self.predicate, "snp_measurement")?],
            PredicateType::SnpTdxMultiPlatformV1 => {
                let tdx = self
                    .predicate
                    .get("tdx_measurement")
                    .ok_or_else(|| verify_error("Missing tdx_measurement".into()))?;
                vec![
                    field(&self.predicate, "snp_measurement")?,
                    field(tdx, "rtmr1")?,
                    field(tdx, "rtmr2")?,
                ]
            }
            _ => {
                return Err(verify_error(format!(
                    "Unsupported predicate type: {}",
                    self.predicate_type
                )))
            }
        };

        Ok(Measurement { type_, registers })
    }
}

/// Verify a bundle for `repo`'s release `digest` and return its code measurement
pub fn verify_attestation(
    trust_root: &TrustRoot,
    bundle: &Bundle,
    digest: &str,
    repo: &str,
) -> Result<Measurement, VerificationError> {
    let cert = bundle.signing_certificate()?;
    trust_root.verify_issued(&cert)?;
    CertificateIdentity::from_cert(&cert).check(repo)?;

    let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(
        cert.tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .raw_bytes(),
    )
    .map_err(|e| verify_error(format!("Invalid public key: {}", e)))?;
    let payload = verify_dsse(&bundle.dsse_envelope, &key)?;

    let statement: InTotoStatement = serde_json::from_slice(&payload)
        .map_err(|e| verify_error(format!("Failed to parse statement: {}", e)))?;
    if !statement.covers_digest(digest) {
        return Err(verify_error(format!(
            "Statement subject does not cover release digest {}",
            digest
        )));
    }

    statement.measurement()
}

/// Latest release digest of `repo`
pub async fn fetch_latest_digest(
    http: &reqwest::Client,
    github_proxy: &str,
    repo: &str,
) -> Result<String, VerificationError> {
    let fail = stage_error(VerificationStage::ReleaseLookup);

    let url = format!("{}/repos/{}/releases/latest", github_proxy, repo);
    let release: ReleaseResponse = http
        .get(&url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| fail(format!("Failed to fetch release: {}", e)))?
        .json()
        .await
        .map_err(|e| fail(format!("Failed to parse release: {}", e)))?;

    let url = format!(
        "{}/{}/releases/download/{}/tinfoil.hash",
        github_proxy, repo, release.tag_name
    );
    let digest = http
        .get(&url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| fail(format!("Failed to fetch digest: {}", e)))?
        .text()
        .await
        .map_err(|e| fail(format!("Failed to read digest: {}", e)))?;

    let digest = digest.trim().to_string();
    if digest.is_empty() {
        return Err(fail(format!("Release {} has an empty digest", release.tag_name)));
    }
    Ok(digest)
}

/// First Sigstore bundle attesting `sha256:{digest}`
pub async fn fetch_attestation_bundle(
    http: &reqwest::Client,
    attestation_proxy: &str,
    repo: &str,
    digest: &str,
) -> Result<Bundle, VerificationError> {
    let fail = stage_error(VerificationStage::AttestationBundleFetch);

    let url = format!(
        "{}/repos/{}/attestations/sha256:{}",
        attestation_proxy, repo, digest
    );
    let response: AttestationResponse = http
        .get(&url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| fail(format!("Failed to fetch bundle: {}", e)))?
        .json()
        .await
        .map_err(|e| fail(format!("Failed to parse bundle response: {}", e)))?;

    response
        .attestations
        .into_iter()
        .next()
        .map(|entry| entry.bundle)
        .ok_or_else(|| fail("No attestations found".into()))
}

pub async fn fetch_trust_root(
    http: &reqwest::Client,
    url: &str,
) -> Result<TrustRoot, VerificationError> {
    let fail = stage_error(VerificationStage::TrustRootFetch);

    let body = http
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| fail(format!("Failed to fetch trusted root: {}", e)))?
        .bytes()
        .await
        .map_err(|e| fail(format!("Failed to read trusted root: {}", e)))?;

    TrustRoot::from_json(&body)
}
