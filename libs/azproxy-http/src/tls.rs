//! rustls configuration for the outbound client.

use rustls_pki_types::CertificateDer;
use std::sync::{Arc, OnceLock};

/// OS roots, loaded once per process. Empty means none were found.
static NATIVE_ROOTS: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

fn load_native_roots() -> Vec<CertificateDer<'static>> {
    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }
    tracing::debug!(count = result.certs.len(), "loaded native root certificates");
    result.certs
}

/// The globally installed crypto provider if any, aws-lc-rs otherwise.
/// Never installs a global default.
pub(crate) fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Client config trusting the OS certificate store.
///
/// # Errors
/// Fails when no usable root certificate is available, so a broken trust
/// store surfaces at startup instead of on the first handshake.
pub(crate) fn native_roots_client_config() -> Result<rustls::ClientConfig, String> {
    let certs = NATIVE_ROOTS.get_or_init(load_native_roots);
    if certs.is_empty() {
        return Err("no native root CA certificates found in OS certificate store".to_owned());
    }

    let mut store = rustls::RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(certs.iter().cloned());
    if added == 0 {
        return Err(format!(
            "none of the {} native root certificates could be parsed",
            certs.len()
        ));
    }
    if ignored > 0 {
        tracing::warn!(added, ignored, "some native root certificates were ignored");
    }

    rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("failed to set TLS protocol versions: {e}"))
        .map(|b| b.with_root_certificates(store).with_no_client_auth())
}
