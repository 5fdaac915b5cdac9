//! API Key 哈希处理
//!
//! 设备 API Key 入库只存 argon2id 哈希，完整 Key 仅在注册时返回
//! 一次。Key 本体是 32 字节 CSPRNG 随机串而非低熵口令，且校验
//! 发生在设备认证热路径上，参数取轻量档位：19 MiB 内存、2 轮、
//! 单通道。

use crate::errors::AppError;
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::{Algorithm, Argon2, Params, Version};

/// 随机凭证档位的 Argon2 参数
const MEMORY_COST_KIB: u32 = 19456;
const TIME_COST: u32 = 2;
const LANES: u32 = 1;

fn argon2() -> Result<Argon2<'static>, AppError> {
    Params::new(MEMORY_COST_KIB, TIME_COST, LANES, None)
        .map(|params| Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
        .map_err(|e| AppError::InternalError(format!("Argon2 参数错误: {}", e)))
}

/// 哈希 API Key
pub fn hash_api_key(api_key: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    argon2()?
        .hash_password(api_key.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::InternalError(format!("API Key 哈希失败: {}", e)))
}

/// 验证 API Key
///
/// 库里登记的哈希串同样是不可信输入：格式非法按验证失败处理，
/// 不升级成内部错误。
pub fn verify_api_key(api_key: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        tracing::warn!("登记的 API Key 哈希格式非法，按验证失败处理");
        return false;
    };

    match argon2() {
        Ok(argon2) => argon2
            .verify_password(api_key.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Argon2 初始化失败");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let api_key = "vs_key_test_credential";
        let hash = hash_api_key(api_key).unwrap();

        assert!(verify_api_key(api_key, &hash));
        assert!(!verify_api_key("vs_key_wrong", &hash));
    }

    #[test]
    fn test_malformed_hash_is_mismatch() {
        // 非法哈希串不报内部错误，仅判定不匹配
        assert!(!verify_api_key("vs_key_test_credential", "not-a-phc-string"));
        assert!(!verify_api_key("vs_key_test_credential", ""));
    }

    #[test]
    fn test_hashes_are_salted() {
        let api_key = "vs_key_test_credential";
        let first = hash_api_key(api_key).unwrap();
        let second = hash_api_key(api_key).unwrap();

        assert_ne!(first, second);
        assert!(verify_api_key(api_key, &first));
        assert!(verify_api_key(api_key, &second));
    }
}
