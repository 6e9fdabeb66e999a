//! JWT 认证模块
//!
//! 令牌由外部账号服务签发，中继只负责校验并还原出连接身份。

use axum::http::HeaderMap;
use config::JwtConfig;
use domain::{Identity, UserId};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Identity {
            user_id: UserId::from(claims.user_id),
            display_name: claims.name,
            avatar_url: claims.avatar,
        }
    }
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_ref());
        let decoding_key = DecodingKey::from_secret(config.secret.as_ref());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// 生成 JWT token（开发与测试环境使用）
    pub fn generate_token(&self, identity: &Identity) -> Result<String, ApiError> {
        let now = chrono::Utc::now();
        let exp = now + chrono::Duration::hours(self.config.expiration_hours);

        let claims = Claims {
            user_id: identity.user_id.into(),
            name: identity.display_name.clone(),
            avatar: identity.avatar_url.clone(),
            exp: exp.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| ApiError::unauthorized(format!("Token generation failed: {}", err)))
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|token_data| token_data.claims)
            .map_err(|err| ApiError::unauthorized(format!("Invalid token: {}", err)))
    }

    /// 从 headers 中提取和验证 token
    pub fn identity_from_headers(&self, headers: &HeaderMap) -> Result<Identity, ApiError> {
        let auth_header = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|header| header.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("Missing authorization header"))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("Invalid authorization header format"))?;

        Ok(self.verify_token(token)?.into())
    }

    /// WebSocket 握手：浏览器无法设置请求头，优先使用查询参数中的 token
    pub fn identity_for_handshake(
        &self,
        query_token: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<Identity, ApiError> {
        match query_token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(token) => Ok(self.verify_token(token)?.into()),
            None => self.identity_from_headers(headers),
        }
    }
}
