//! ID 生成工具
//!
//! - 事件 ID：UUID v4
//! - 运行时实例 ID：10 位 62 进制字符串（0-9, a-z, A-Z），便于日志中辨认

use uuid::Uuid;

/// 62 进制字符集
const BASE62_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// ID 长度
const ID_LENGTH: usize = 10;

/// 生成 10 位 62 进制 ID
///
/// 取 UUID v4 的随机位转换为 62 进制。
///
/// # Example
///
/// ```
/// use chips_testkit::utils::id::generate_id;
///
/// let id = generate_id();
/// assert_eq!(id.len(), 10);
/// ```
pub fn generate_id() -> String {
    let mut value = Uuid::new_v4().as_u128();

    let mut result = Vec::with_capacity(ID_LENGTH);
    for _ in 0..ID_LENGTH {
        let index = (value % 62) as usize;
        result.push(BASE62_CHARS[index] as char);
        value /= 62;
    }

    result.into_iter().rev().collect()
}

/// 验证 ID 格式是否有效
///
/// ```
/// use chips_testkit::utils::id::is_valid_id;
///
/// assert!(is_valid_id("a1B2c3D4e5"));
/// assert!(!is_valid_id("too-short"));
/// ```
pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LENGTH && id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// 生成 UUID v4 格式的 ID
///
/// 用于事件 ID 等需要全局唯一性的场景
pub fn generate_uuid() -> String {
    Uuid::new_v4().to_string()
}
