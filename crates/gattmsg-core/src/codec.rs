//! 消息编解码
//!
//! 消息特征上的负载就是 UTF-8 文本，没有额外分帧。

use crate::error::SessionError;
use log::warn;

pub struct MessageCodec;

impl MessageCodec {
    /// 文本 -> 特征负载
    ///
    /// 内存中的 `&str` 总是合法 UTF-8，因此不会返回 `SessionError::Encoding`；
    /// 长度限制由无线电一侧决定。
    pub fn encode(text: &str) -> Result<Vec<u8>, SessionError> {
        Ok(text.as_bytes().to_vec())
    }

    /// 特征负载 -> 文本
    ///
    /// 来自未知对端的负载属于不可信输入，非法 UTF-8 返回 `None` 而不是错误。
    pub fn decode(data: &[u8]) -> Option<String> {
        match std::str::from_utf8(data) {
            Ok(text) => Some(text.to_string()),
            Err(e) => {
                warn!(
                    "Dropping inbound payload ({} bytes): invalid UTF-8: {}",
                    data.len(),
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        for text in ["", "hi", "xin chào", "互传 📨", "\u{0}\u{10FFFF}"] {
            let bytes = MessageCodec::encode(text).unwrap();
            assert_eq!(MessageCodec::decode(&bytes), Some(text.to_string()));
        }
    }

    #[test]
    fn test_roundtrip_long_text() {
        for text in ["x".repeat(600), "互传📨".repeat(300)] {
            let bytes = MessageCodec::encode(&text).unwrap();
            assert!(bytes.len() > 512);
            assert_eq!(MessageCodec::decode(&bytes), Some(text));
        }
    }

    #[test]
    fn test_invalid_utf8() {
        assert_eq!(MessageCodec::decode(&[0xff, 0xfe]), None);
        assert_eq!(MessageCodec::decode(&[b'o', b'k', 0xc3]), None);
        // overlong encoding of '/'
        assert_eq!(MessageCodec::decode(&[0xc0, 0xaf]), None);
    }
}
