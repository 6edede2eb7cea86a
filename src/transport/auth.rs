//! Password-derived certificate authority.
//!
//! Both ends stretch the shared password with PBKDF2-HMAC-SHA512 into an
//! Ed25519 key and build the same self-signed authority from it. Each end
//! then issues itself a throwaway leaf certificate signed by that authority,
//! and only peers whose certificate chains to it are accepted. Producing such
//! a certificate requires knowing the password.

use crate::error::{Result, SyncError};
use pbkdf2::pbkdf2_hmac;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use sha2::Sha512;
use std::sync::Arc;

const KDF_ROUNDS: u32 = 15_000;
const KDF_SALT: &[u8] = b"qsync/password-authority/v1";
const AUTHORITY_NAME: &str = "qsync password authority";

/// PKCS#8 v1 header for a bare 32-byte Ed25519 seed (RFC 8410).
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

fn cert_error(e: impl std::fmt::Display) -> SyncError {
    SyncError::Transport(format!("certificate setup failed: {}", e))
}

pub struct PasswordAuthority {
    cert: Certificate,
    key: KeyPair,
}

impl PasswordAuthority {
    /// Same password, same signing key, on every machine.
    pub fn derive(password: &str) -> Result<Self> {
        if password.is_empty() {
            return Err(SyncError::Config("password must not be empty".to_string()));
        }
        let mut seed = [0u8; 32];
        pbkdf2_hmac::<Sha512>(password.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut seed);

        let mut der = Vec::with_capacity(ED25519_PKCS8_PREFIX.len() + seed.len());
        der.extend_from_slice(&ED25519_PKCS8_PREFIX);
        der.extend_from_slice(&seed);
        let key = KeyPair::try_from(der.as_slice()).map_err(cert_error)?;

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, AUTHORITY_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
        let cert = params.self_signed(&key).map_err(cert_error)?;
        Ok(Self { cert, key })
    }

    /// A fresh leaf certificate for `name`, usable by either end.
    pub fn issue(&self, name: &str) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
        let leaf_key = KeyPair::generate().map_err(cert_error)?;
        let mut params = CertificateParams::new(vec![name.to_string()]).map_err(cert_error)?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let cert = params
            .signed_by(&leaf_key, &self.cert, &self.key)
            .map_err(cert_error)?;
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        Ok((cert.der().clone(), key))
    }

    /// Trust store holding only the authority.
    pub fn roots(&self) -> Result<Arc<RootCertStore>> {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert.der().clone()).map_err(cert_error)?;
        Ok(Arc::new(roots))
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.key.public_key_der()
    }
}
