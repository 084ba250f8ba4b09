//! AMD SEV-SNP report verification
//!
//! 1. Decode the report (base64 + gzip) and check its layout
//! 2. Fetch the VCEK for the reporting chip and the ASK/ARK chain from the KDS proxy
//! 3. Pin the ARK by SPKI fingerprint, then check ARK -> ASK -> VCEK (RSA-PSS SHA-384)
//! 4. Check the report signature against the VCEK (ECDSA P-384)

use std::io::Read;

use base64::Engine;
use der::{Decode, Encode};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256, Sha384};
use x509_cert::Certificate;

use super::types::{Measurement, PredicateType, Verification};
use crate::error::{VerificationError, VerificationStage};

// v2/v3 report layout
const REPORT_SIZE: usize = 1184;
const REPORT_DATA_OFFSET: usize = 80;
const REPORT_DATA_SIZE: usize = 64;
const MEASUREMENT_OFFSET: usize = 144;
const MEASUREMENT_SIZE: usize = 48;
const REPORTED_TCB_OFFSET: usize = 384;
const CHIP_ID_OFFSET: usize = 416;
const CHIP_ID_SIZE: usize = 64;
const SIGNATURE_OFFSET: usize = 672;
const SIGNATURE_SIZE: usize = 512;

// R and S are 48-byte little-endian scalars, each padded to 72 bytes
const SIG_COMPONENT_SIZE: usize = 72;
const SIG_VALUE_SIZE: usize = 48;

const PRODUCT: &str = "Genoa";

/// SPKI SHA-256 fingerprint of AMD's Genoa root key (ARK).
///
/// ```bash
/// curl -s 'https://kds.amd.com/vcek/v1/Genoa/cert_chain' | \
///   openssl x509 -pubkey -noout | \
///   openssl pkey -pubin -outform DER | sha256sum
/// ```
const AMD_ARK_GENOA_SPKI_FINGERPRINT: &str =
    "429a69c9422aa258ee4d8db5fcda9c6470ef15f8cd5a9cebd6cbc7d90b863831";

fn invalid(message: impl Into<String>) -> VerificationError {
    VerificationError::new(VerificationStage::EnclaveAttestationVerify, message)
}

/// TCB security patch levels, as needed for the VCEK lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tcb {
    pub bootloader: u8,
    pub tee: u8,
    pub snp: u8,
    pub microcode: u8,
}

impl Tcb {
    fn from_raw(raw: u64) -> Self {
        Self {
            bootloader: (raw & 0xff) as u8,
            tee: ((raw >> 8) & 0xff) as u8,
            snp: ((raw >> 48) & 0xff) as u8,
            microcode: ((raw >> 56) & 0xff) as u8,
        }
    }
}

/// A structurally valid SEV-SNP attestation report
pub(crate) struct SnpReport {
    bytes: Vec<u8>,
}

impl SnpReport {
    /// Decode a base64, gzipped report as served by the enclave
    pub fn decode(body: &str) -> Result<Self, VerificationError> {
        let compressed = base64::engine::general_purpose::STANDARD
            .decode(body)
            .map_err(|e| invalid(format!("Base64 decode failed: {}", e)))?;

        // Inflate at most one byte past a full report; the body is unattested
        let mut bytes = Vec::with_capacity(REPORT_SIZE);
        GzDecoder::new(&compressed[..])
            .take(REPORT_SIZE as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| invalid(format!("Gzip decompress failed: {}", e)))?;
        if bytes.len() > REPORT_SIZE {
            return Err(invalid(format!(
                "Invalid report size: larger than {} bytes",
                REPORT_SIZE
            )));
        }

        Self::parse(bytes)
    }

    fn parse(bytes: Vec<u8>) -> Result<Self, VerificationError> {
        if bytes.len() != REPORT_SIZE {
            return Err(invalid(format!(
                "Invalid report size: expected {}, got {}",
                REPORT_SIZE,
                bytes.len()
            )));
        }

        let report = Self { bytes };
        let version = report.version();
        if !(2..=3).contains(&version) {
            return Err(invalid(format!("Unexpected report version: {}", version)));
        }
        Ok(report)
    }

    fn field(&self, offset: usize, len: usize) -> &[u8] {
        &self.bytes[offset..offset + len]
    }

    pub fn version(&self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.field(0, 4));
        u32::from_le_bytes(raw)
    }

    pub fn measurement(&self) -> &[u8] {
        self.field(MEASUREMENT_OFFSET, MEASUREMENT_SIZE)
    }

    /// First half: TLS SPKI fingerprint. Second half: HPKE public key.
    pub fn report_data(&self) -> &[u8] {
        self.field(REPORT_DATA_OFFSET, REPORT_DATA_SIZE)
    }

    pub fn chip_id(&self) -> &[u8] {
        self.field(CHIP_ID_OFFSET, CHIP_ID_SIZE)
    }

    pub fn reported_tcb(&self) -> Tcb {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.field(REPORTED_TCB_OFFSET, 8));
        Tcb::from_raw(u64::from_le_bytes(raw))
    }

    fn signed_body(&self) -> &[u8] {
        &self.bytes[..SIGNATURE_OFFSET]
    }

    /// Big-endian `r || s`
    fn signature_scalars(&self) -> Result<Vec<u8>, VerificationError> {
        let sig = self.field(SIGNATURE_OFFSET, SIGNATURE_SIZE);
        if sig.iter().all(|&b| b == 0) {
            return Err(invalid("Invalid signature: all zeros"));
        }

        let mut scalars: Vec<u8> = sig[..SIG_VALUE_SIZE].iter().rev().copied().collect();
        scalars.extend(
            sig[SIG_COMPONENT_SIZE..SIG_COMPONENT_SIZE + SIG_VALUE_SIZE]
                .iter()
                .rev(),
        );
        Ok(scalars)
    }

    pub fn verification(&self) -> Verification {
        let report_data = self.report_data();
        Verification {
            measurement: Measurement {
                type_: PredicateType::SevGuestV2,
                registers: vec![hex::encode(self.measurement())],
            },
            tls_public_key_fp: report_data[..32].to_vec(),
            hpke_public_key: Some(hex::encode(&report_data[32..])),
        }
    }
}

/// Verify a SEV-SNP report against AMD's certificate chain
pub async fn verify(
    http: &reqwest::Client,
    kds_proxy: &str,
    body: &str,
) -> Result<Verification, VerificationError> {
    let report = SnpReport::decode(body)?;

    let vcek = fetch_collateral(http, &vcek_url(kds_proxy, &report), "VCEK").await?;
    let chain_url = format!("{}/vcek/v1/{}/cert_chain", kds_proxy, PRODUCT);
    let chain = fetch_collateral(http, &chain_url, "cert chain").await?;

    let vcek = parse_cert(&vcek, "VCEK")?;
    verify_cert_chain(&vcek, &chain)?;
    verify_report_signature(&report, &vcek)?;

    Ok(report.verification())
}

fn vcek_url(kds_proxy: &str, report: &SnpReport) -> String {
    let tcb = report.reported_tcb();
    format!(
        "{}/vcek/v1/{}/{}?blSPL={}&teeSPL={}&snpSPL={}&ucodeSPL={}",
        kds_proxy,
        PRODUCT,
        hex::encode(report.chip_id()),
        tcb.bootloader,
        tcb.tee,
        tcb.snp,
        tcb.microcode
    )
}

async fn fetch_collateral(
    http: &reqwest::Client,
    url: &str,
    what: &str,
) -> Result<Vec<u8>, VerificationError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| invalid(format!("Failed to fetch {}: {}", what, e)))?;

    if !response.status().is_success() {
        return Err(invalid(format!(
            "{} fetch failed: HTTP {}",
            what,
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| invalid(format!("Failed to read {}: {}", what, e)))?;
    Ok(bytes.to_vec())
}

fn parse_cert(der: &[u8], what: &str) -> Result<Certificate, VerificationError> {
    Certificate::from_der(der).map_err(|e| invalid(format!("Failed to parse {}: {}", what, e)))
}

fn spki_der(cert: &Certificate) -> Result<Vec<u8>, VerificationError> {
    cert.tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| invalid(format!("Failed to encode SPKI: {}", e)))
}

/// VCEK must chain to the pinned ARK through the ASK
fn verify_cert_chain(vcek: &Certificate, chain_pem: &[u8]) -> Result<(), VerificationError> {
    let pems = pem::parse_many(chain_pem)
        .map_err(|e| invalid(format!("Failed to parse PEM chain: {}", e)))?;
    let (ask, ark) = match pems.as_slice() {
        [ask, ark, ..] => (parse_cert(ask.contents(), "ASK")?, parse_cert(ark.contents(), "ARK")?),
        _ => return Err(invalid("Certificate chain should contain ASK and ARK")),
    };

    let ark_spki = spki_der(&ark)?;
    let ark_fingerprint = hex::encode(Sha256::digest(&ark_spki));
    if ark_fingerprint != AMD_ARK_GENOA_SPKI_FINGERPRINT {
        return Err(invalid(format!(
            "ARK public key fingerprint mismatch: expected {}, got {}",
            AMD_ARK_GENOA_SPKI_FINGERPRINT, ark_fingerprint
        )));
    }

    let ark_name = &ark.tbs_certificate.subject;
    let ask_name = &ask.tbs_certificate.subject;
    if &vcek.tbs_certificate.issuer != ask_name {
        return Err(invalid("VCEK issuer does not match ASK subject"));
    }
    if &ask.tbs_certificate.issuer != ark_name {
        return Err(invalid("ASK issuer does not match ARK subject"));
    }
    if &ark.tbs_certificate.issuer != ark_name {
        return Err(invalid("ARK is not self-signed"));
    }

    expect_common_name(ark_name, &format!("ARK-{}", PRODUCT))?;
    expect_common_name(ask_name, &format!("SEV-{}", PRODUCT))?;

    verify_rsa_pss(&ark, &ark_spki, "ARK self-signature")?;
    verify_rsa_pss(&ask, &ark_spki, "ASK signature")?;
    verify_rsa_pss(vcek, &spki_der(&ask)?, "VCEK signature")?;

    Ok(())
}

fn verify_rsa_pss(
    cert: &Certificate,
    signer_spki_der: &[u8],
    context: &str,
) -> Result<(), VerificationError> {
    use rsa::pkcs8::DecodePublicKey;
    use rsa::pss::{Signature, VerifyingKey};
    use rsa::signature::Verifier;
    use rsa::RsaPublicKey;

    let key = RsaPublicKey::from_public_key_der(signer_spki_der)
        .map_err(|e| invalid(format!("Invalid RSA public key for {}: {}", context, e)))?;
    let tbs = cert
        .tbs_certificate
        .to_der()
        .map_err(|e| invalid(format!("Failed to encode TBS for {}: {}", context, e)))?;
    let signature = Signature::try_from(cert.signature.raw_bytes())
        .map_err(|e| invalid(format!("Invalid signature format for {}: {}", context, e)))?;

    VerifyingKey::<Sha384>::new(key)
        .verify(&tbs, &signature)
        .map_err(|e| invalid(format!("{} verification failed: {}", context, e)))
}

fn expect_common_name(name: &x509_cert::name::Name, expected: &str) -> Result<(), VerificationError> {
    use x509_cert::der::oid::db::rfc4519::CN;

    let cn = name
        .0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == CN)
        .ok_or_else(|| invalid("No CN found in certificate"))?;
    let cn = std::str::from_utf8(cn.value.value())
        .map_err(|_| invalid("CN value is not valid UTF-8"))?;

    if cn != expected {
        return Err(invalid(format!("Unexpected CN: {}, expected {}", cn, expected)));
    }
    Ok(())
}

fn verify_report_signature(report: &SnpReport, vcek: &Certificate) -> Result<(), VerificationError> {
    use p384::ecdsa::signature::Verifier;
    use p384::ecdsa::{Signature, VerifyingKey};

    let key = VerifyingKey::from_sec1_bytes(
        vcek.tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .raw_bytes(),
    )
    .map_err(|e| invalid(format!("Invalid VCEK public key: {}", e)))?;

    let signature = Signature::from_slice(&report.signature_scalars()?)
        .map_err(|e| invalid(format!("Invalid signature format: {}", e)))?;

    key.verify(report.signed_body(), &signature)
        .map_err(|e| invalid(format!("Report signature verification failed: {}", e)))
}
