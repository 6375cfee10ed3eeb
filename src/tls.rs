//! Swappable certificate slot and rustls server configuration
//!
//! The slot holds at most one certificate. The resolver reads it on every
//! handshake, so a rotation is visible to the very next TLS client without
//! rebuilding the server config. Every transition also bumps a watch
//! channel that live connections listen on to drain themselves.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::sync::watch;
use tracing::info;

use crate::error::CertError;

/// State machine {NoCert, HasCert} with rotation notifications
pub struct CertSlot {
    current: ArcSwapOption<CertifiedKey>,
    rotations: watch::Sender<u64>,
}

impl CertSlot {
    pub fn new() -> Self {
        let (rotations, _) = watch::channel(0);
        Self {
            current: ArcSwapOption::empty(),
            rotations,
        }
    }

    /// NoCert/HasCert -> HasCert
    pub fn install(&self, key: Arc<CertifiedKey>) {
        self.current.store(Some(key));
        self.notify();
        info!("TLS certificate installed");
    }

    /// HasCert/NoCert -> NoCert
    pub fn clear(&self) {
        self.current.store(None);
        self.notify();
        info!("TLS certificate cleared");
    }

    pub fn current(&self) -> Option<Arc<CertifiedKey>> {
        self.current.load_full()
    }

    pub fn has_cert(&self) -> bool {
        self.current.load().is_some()
    }

    /// Receiver that changes on every transition
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.rotations.subscribe()
    }

    fn notify(&self) {
        self.rotations.send_modify(|generation| *generation += 1);
    }
}

impl Default for CertSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CertSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertSlot")
            .field("has_cert", &self.has_cert())
            .field("generation", &*self.rotations.borrow())
            .finish()
    }
}

/// Parse a PEM certificate chain and private key into a signing pair
///
/// Rejects a key that does not belong to the leaf certificate.
pub fn parse_pem_pair(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey, CertError> {
    let chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(CertError::NoCertificate);
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())?.ok_or(CertError::NoPrivateKey)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| CertError::UnsupportedKey(e.to_string()))?;

    let certified = CertifiedKey::new(chain, signing_key);
    certified
        .keys_match()
        .map_err(|e| CertError::Mismatch(e.to_string()))?;
    Ok(certified)
}

/// Hands rustls whatever the slot currently holds
#[derive(Debug)]
pub struct SlotResolver {
    slot: Arc<CertSlot>,
}

impl SlotResolver {
    pub fn new(slot: Arc<CertSlot>) -> Self {
        Self { slot }
    }
}

impl ResolvesServerCert for SlotResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.slot.current()
    }
}

/// Server config resolving certificates from the slot, ALPN h2 then http/1.1
pub fn server_config(slot: Arc<CertSlot>) -> Result<Arc<ServerConfig>, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SlotResolver::new(slot)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (String, String) {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (generated.cert.pem(), generated.key_pair.serialize_pem())
    }

    #[test]
    fn test_parse_matching_pair() {
        let (cert, key) = self_signed();
        let certified = parse_pem_pair(&cert, &key).unwrap();
        assert_eq!(certified.cert.len(), 1);
    }

    #[test]
    fn test_mismatched_pair_rejected() {
        let (cert, _) = self_signed();
        let (_, other_key) = self_signed();
        assert!(matches!(
            parse_pem_pair(&cert, &other_key),
            Err(CertError::Mismatch(_))
        ));
    }

    #[test]
    fn test_empty_input_rejected() {
        let (cert, key) = self_signed();
        assert!(matches!(parse_pem_pair("", &key), Err(CertError::NoCertificate)));
        assert!(matches!(parse_pem_pair(&cert, ""), Err(CertError::NoPrivateKey)));
    }

    #[test]
    fn test_slot_transitions_notify() {
        let (cert, key) = self_signed();
        let slot = CertSlot::new();
        let rx = slot.subscribe();
        assert!(!slot.has_cert());

        slot.install(Arc::new(parse_pem_pair(&cert, &key).unwrap()));
        assert!(slot.has_cert());
        assert_eq!(*rx.borrow(), 1);

        slot.clear();
        assert!(!slot.has_cert());
        assert_eq!(*rx.borrow(), 2);
    }

    #[test]
    fn test_server_config_builds() {
        let config = server_config(Arc::new(CertSlot::new())).unwrap();
        assert_eq!(config.alpn_protocols[0], b"h2");
    }
}
