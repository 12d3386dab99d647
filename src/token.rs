//! 签名身份令牌的签发与校验。

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// 请求范围内的已认证主体。
#[derive(Clone, Debug)]
pub struct Principal {
    pub username: String,
    pub is_admin: bool,
}

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: String,
    admin: bool,
    exp: i64,
}

/// 持有进程级签名密钥的令牌服务；密钥在启动时生成，之后只读。
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenService {
    /// 使用新生成的随机密钥构建服务。
    pub fn new(ttl: Duration) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::with_secret(&secret, ttl)
    }

    pub fn with_secret(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    /// 签发带过期时间的用户令牌。
    pub fn issue(
        &self,
        username: &str,
        is_admin: bool,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        let claims = Claims {
            sub: username.to_string(),
            admin: is_admin,
            exp: (Utc::now() + ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }

    /// 校验令牌；格式错误、签名不符或已过期一律返回 None。
    pub fn validate(&self, token: &str) -> Option<Principal> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        match decode::<Claims>(token, &self.decoding, &validation) {
            Ok(data) => Some(Principal {
                username: data.claims.sub,
                is_admin: data.claims.admin,
            }),
            Err(err) => {
                debug!(error = %err, "token validation failed");
                None
            }
        }
    }
}
