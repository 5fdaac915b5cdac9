//! 统一令牌生成工具
//!
//! 提供设备 API Key 与访问 / 刷新令牌的通用生成逻辑。
//! 令牌本体是不透明随机串，有效性完全由令牌缓存决定。

use crate::errors::AppError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine as _};
use ring::rand::{SecureRandom, SystemRandom};

/// 令牌类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    /// 设备 API Key（长期凭证，入库存哈希）
    DeviceApiKey,
    /// 设备访问令牌（短期，默认 5 分钟）
    DeviceAccessToken,
    /// 设备刷新令牌（一次性，默认 1 天）
    DeviceRefreshToken,
}

impl TokenType {
    /// 获取令牌前缀
    pub fn prefix(&self) -> &'static str {
        match self {
            TokenType::DeviceApiKey => "vs_key_",
            TokenType::DeviceAccessToken => "vs_dat_",
            TokenType::DeviceRefreshToken => "vs_drt_",
        }
    }

    /// 随机部分的字节长度
    pub fn random_bytes_len(&self) -> usize {
        32
    }

    /// 展示前缀截取的字符数
    pub fn display_prefix_len(&self) -> usize {
        match self {
            TokenType::DeviceApiKey => 8,
            TokenType::DeviceAccessToken | TokenType::DeviceRefreshToken => 12,
        }
    }

    /// 从字符串解析令牌类型
    pub fn from_token(token: &str) -> Option<Self> {
        if token.starts_with("vs_key_") {
            Some(TokenType::DeviceApiKey)
        } else if token.starts_with("vs_dat_") {
            Some(TokenType::DeviceAccessToken)
        } else if token.starts_with("vs_drt_") {
            Some(TokenType::DeviceRefreshToken)
        } else {
            None
        }
    }
}

/// 生成新令牌（不透明随机串）
pub fn generate_token(token_type: TokenType) -> Result<String, AppError> {
    let rng = SystemRandom::new();
    let mut random_bytes = vec![0u8; token_type.random_bytes_len()];
    rng.fill(&mut random_bytes)
        .map_err(|_| AppError::InternalError("随机数生成失败".to_string()))?;

    let random_part = BASE64.encode(&random_bytes);
    Ok(format!("{}{}", token_type.prefix(), random_part))
}

/// 从令牌提取搜索前缀（用于数据库查询与展示）
pub fn token_search_prefix(token: &str) -> Result<String, AppError> {
    let token_type = TokenType::from_token(token)
        .ok_or_else(|| AppError::ValidationError("无效的令牌格式".to_string()))?;

    let prefix_len = token_type.prefix().len();
    let display_len = token_type.display_prefix_len();

    if token.len() < prefix_len + display_len {
        return Err(AppError::ValidationError("令牌过短".to_string()));
    }

    Ok(format!(
        "{}{}",
        token_type.prefix(),
        &token[prefix_len..prefix_len + display_len]
    ))
}

/// 遮蔽令牌（用于日志）
pub fn mask_token(token: &str) -> String {
    if let Some(token_type) = TokenType::from_token(token) {
        let prefix = token_type.prefix();
        let prefix_len = prefix.len();

        if token.len() > prefix_len + 4 {
            return format!("{}{}...", prefix, &token[prefix_len..prefix_len + 4]);
        }
    }

    if token.len() > 8 {
        format!("{}...", &token[..8])
    } else {
        "***".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_access_token() {
        let token = generate_token(TokenType::DeviceAccessToken).unwrap();
        assert!(token.starts_with("vs_dat_"));
        assert_eq!(
            TokenType::from_token(&token),
            Some(TokenType::DeviceAccessToken)
        );
    }

    #[test]
    fn test_generate_refresh_token() {
        let token = generate_token(TokenType::DeviceRefreshToken).unwrap();
        assert!(token.starts_with("vs_drt_"));
    }

    #[test]
    fn test_token_uniqueness() {
        let a = generate_token(TokenType::DeviceApiKey).unwrap();
        let b = generate_token(TokenType::DeviceApiKey).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_search_prefix() {
        let token = generate_token(TokenType::DeviceApiKey).unwrap();
        let prefix = token_search_prefix(&token).unwrap();

        assert!(prefix.starts_with("vs_key_"));
        assert!(token.starts_with(&prefix));
        assert_eq!(prefix.len(), "vs_key_".len() + 8);
    }

    #[test]
    fn test_search_prefix_rejects_unknown() {
        assert!(token_search_prefix("unknown_token").is_err());
    }

    #[test]
    fn test_mask_token() {
        let token = "vs_dat_abcdefghijklmnopqrstuvwxyz";
        let masked = mask_token(token);

        assert!(masked.starts_with("vs_dat_"));
        assert!(masked.ends_with("..."));
        assert!(!masked.contains("mnop")); // 中间部分被隐藏
    }
}
