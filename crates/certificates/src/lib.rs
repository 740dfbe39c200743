use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the CA certificate every hop trusts.
pub const CA_CERT_FILE: &str = "ca-cert.pem";
pub const SERVER_CERT_FILE: &str = "tcp-server-cert.pem";
pub const SERVER_KEY_FILE: &str = "tcp-server-key.pem";
pub const CLIENT_CERT_FILE: &str = "tcp-client-cert.pem";
pub const CLIENT_KEY_FILE: &str = "tcp-client-key.pem";

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Errors that can occur during certificate creation.
#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("Failed to generate certificate: {0}")]
    GenerationError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rcgen::Error> for CertificateError {
    fn from(e: rcgen::Error) -> Self {
        CertificateError::GenerationError(e.to_string())
    }
}

/// A certificate and its private key, both PEM encoded.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// A private certificate authority that signs the certificates used for mutual TLS between hops.
///
/// Every hop trusts only certificates chained to this authority, for both server and client
/// authentication.
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl CertificateAuthority {
    /// Generates a new self-signed certificate authority.
    ///
    /// # Arguments
    ///
    /// * `common_name` - Common Name of the CA subject.
    ///
    /// # Errors
    ///
    /// Returns `CertificateError::GenerationError` if key or certificate generation fails.
    pub fn generate(common_name: &str) -> Result<Self, CertificateError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = subject(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, CA_VALIDITY_DAYS);

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        Ok(Self { cert, key })
    }

    /// PEM encoding of the CA certificate.
    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    /// Issues a leaf certificate usable for both server and client authentication.
    ///
    /// # Arguments
    ///
    /// * `common_name` - Common Name of the leaf subject.
    /// * `subject_alt_names` - DNS names or IP addresses the certificate is valid for. IP
    ///   literals become IP address SANs.
    ///
    /// # Errors
    ///
    /// Returns `CertificateError::GenerationError` if a SAN is invalid or signing fails.
    pub fn issue_leaf(
        &self,
        common_name: &str,
        subject_alt_names: &[&str],
    ) -> Result<IssuedCertificate, CertificateError> {
        let sans: Vec<String> = subject_alt_names.iter().map(|s| s.to_string()).collect();
        let mut params = CertificateParams::new(sans)?;
        params.distinguished_name = subject(common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        set_validity(&mut params, LEAF_VALIDITY_DAYS);

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

/// Paths of a written TLS bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsBundlePaths {
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

/// Generates a fresh CA plus server and client leaf certificates and writes them to `dir`.
///
/// Both leaves are valid for `localhost` and `127.0.0.1`. Existing files are replaced.
///
/// # Errors
///
/// Returns `CertificateError::GenerationError` if generation fails, or `CertificateError::Io`
/// if `dir` cannot be created or a file cannot be written.
pub fn write_tls_bundle(dir: &Path) -> Result<TlsBundlePaths, CertificateError> {
    fs::create_dir_all(dir)?;
    let ca = CertificateAuthority::generate("HL7 Relay Development CA")?;
    let server = ca.issue_leaf("relay-tcp-server", &["localhost", "127.0.0.1"])?;
    let client = ca.issue_leaf("relay-tcp-client", &["localhost", "127.0.0.1"])?;

    let paths = TlsBundlePaths {
        ca_cert: dir.join(CA_CERT_FILE),
        server_cert: dir.join(SERVER_CERT_FILE),
        server_key: dir.join(SERVER_KEY_FILE),
        client_cert: dir.join(CLIENT_CERT_FILE),
        client_key: dir.join(CLIENT_KEY_FILE),
    };
    fs::write(&paths.ca_cert, ca.cert_pem())?;
    fs::write(&paths.server_cert, &server.cert_pem)?;
    fs::write(&paths.server_key, &server.key_pem)?;
    fs::write(&paths.client_cert, &client.cert_pem)?;
    fs::write(&paths.client_key, &client.key_pem)?;

    tracing::info!(dir = %dir.display(), "wrote development TLS bundle");
    Ok(paths)
}

fn subject(common_name: &str) -> DistinguishedName {
    let mut subject = DistinguishedName::new();
    subject.push(DnType::CommonName, common_name);
    subject
}

fn set_validity(params: &mut CertificateParams, days: i64) {
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::minutes(5);
    params.not_after = now + time::Duration::days(days);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use x509_parser::extensions::GeneralName;
    use x509_parser::pem::parse_x509_pem;

    #[test]
    fn test_generate_ca() {
        let ca = CertificateAuthority::generate("Test CA").unwrap();
        let pem = ca.cert_pem();
        assert!(pem.contains("BEGIN CERTIFICATE"));

        let (_, pem) = parse_x509_pem(pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        let constraints = cert.basic_constraints().unwrap().unwrap();
        assert!(constraints.value.ca);
        assert_eq!(cert.subject().to_string(), cert.issuer().to_string());
    }

    #[test]
    fn test_leaf_is_signed_by_ca_with_sans() {
        let ca = CertificateAuthority::generate("Test CA").unwrap();
        let leaf = ca.issue_leaf("hop", &["localhost", "127.0.0.1"]).unwrap();
        assert!(leaf.key_pem.contains("BEGIN PRIVATE KEY"));

        let (_, ca_pem) = parse_x509_pem(ca.cert_pem().as_bytes()).unwrap();
        let ca_cert = ca_pem.parse_x509().unwrap();
        let (_, leaf_pem) = parse_x509_pem(leaf.cert_pem.as_bytes()).unwrap();
        let leaf_cert = leaf_pem.parse_x509().unwrap();

        assert_eq!(leaf_cert.issuer().to_string(), ca_cert.subject().to_string());
        let sans = leaf_cert.subject_alternative_name().unwrap().unwrap();
        let names = &sans.value.general_names;
        assert!(names.contains(&GeneralName::DNSName("localhost")));
        assert!(names.contains(&GeneralName::IPAddress(&[127, 0, 0, 1])));
    }

    #[test]
    fn test_write_tls_bundle() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let paths = write_tls_bundle(&temp_dir.path().join("certs")).unwrap();

        for path in [
            &paths.ca_cert,
            &paths.server_cert,
            &paths.server_key,
            &paths.client_cert,
            &paths.client_key,
        ] {
            assert!(path.is_file(), "missing {}", path.display());
        }
        assert!(paths.ca_cert.ends_with(CA_CERT_FILE));
        let key = fs::read_to_string(&paths.client_key).unwrap();
        assert!(key.contains("PRIVATE KEY"));
    }
}
