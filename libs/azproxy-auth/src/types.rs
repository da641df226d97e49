use serde::{Deserialize, Serialize};

/// How the client id and secret reach the token endpoint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuthMethod {
    /// `Authorization: Basic base64(id:secret)`
    #[default]
    Basic,
    /// `client_id` and `client_secret` form fields (what Azure AD examples use)
    Form,
}

#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn auth_method_from_lowercase() {
        let m: ClientAuthMethod = serde_json::from_str("\"form\"").unwrap();
        assert_eq!(m, ClientAuthMethod::Form);
        assert_eq!(ClientAuthMethod::default(), ClientAuthMethod::Basic);
    }

    #[test]
    fn azure_ad_response_parses() {
        let json = r#"{"token_type":"Bearer","expires_in":3599,"ext_expires_in":3599,"access_token":"eyJ0"}"#;
        let r: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(r.access_token, "eyJ0");
        assert_eq!(r.expires_in, Some(3599));
        assert_eq!(r.token_type.as_deref(), Some("Bearer"));
    }

    #[test]
    fn minimal_response_parses() {
        let r: TokenResponse = serde_json::from_str(r#"{"access_token":"t"}"#).unwrap();
        assert!(r.expires_in.is_none());
        assert!(r.token_type.is_none());
    }
}
