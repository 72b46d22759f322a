//! API Key 认证
//!
//! 修改部署状态的接口（deploy / stop / restart / 配置变更）通过 `RequireApiKey`
//! extractor 校验 `x-api-key` header；只读接口不需要认证。

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::HeaderMap, request::Parts},
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

/// 请求头名称
pub const API_KEY_HEADER: &str = "x-api-key";

/// 已通过认证的请求
#[derive(Debug, Clone)]
pub struct RequireApiKey;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        verify_api_key(&parts.headers, &state.api_key)
    }
}

/// 校验 `x-api-key` 与配置的密钥一致
pub fn verify_api_key(headers: &HeaderMap, expected_key: &str) -> Result<RequireApiKey, ApiError> {
    match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(key) if !expected_key.is_empty() && key == expected_key => Ok(RequireApiKey),
        Some(_) => {
            tracing::warn!("Rejected request with invalid API key");
            Err(ApiError::unauthorized())
        }
        None => {
            tracing::warn!("Rejected request without {} header", API_KEY_HEADER);
            Err(ApiError::unauthorized())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(key: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static(key));
        headers
    }

    #[test]
    fn test_matching_key_accepted() {
        assert!(verify_api_key(&headers("secret"), "secret").is_ok());
    }

    #[test]
    fn test_wrong_or_missing_key_rejected() {
        assert!(matches!(
            verify_api_key(&headers("guess"), "secret"),
            Err(ApiError::Unauthorized)
        ));
        assert!(verify_api_key(&HeaderMap::new(), "secret").is_err());
    }

    #[test]
    fn test_empty_configured_key_rejects_everything() {
        assert!(verify_api_key(&headers(""), "").is_err());
    }
}
