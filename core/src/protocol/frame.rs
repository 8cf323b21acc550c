//! Frame grammar: `<tag>[value]\r\n`
//!
//! The tag is `[0-9a-zA-Z_]+`. The value is whatever follows the closing
//! bracket, trimmed; an empty value is absent.

use crate::protocol::buffer::TERMINATOR;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("frame is not terminated")]
    Unterminated,
    #[error("frame does not start with '<'")]
    MissingTagOpen,
    #[error("tag is not closed with '>'")]
    MissingTagClose,
    #[error("invalid tag {0:?}")]
    InvalidTag(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: String,
    pub value: Option<String>,
}

impl Frame {
    /// Parse a complete message, terminator included
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let body = raw.strip_suffix(TERMINATOR).ok_or(FrameError::Unterminated)?;
        Self::parse_body(body)
    }

    /// Parse a frame with the terminator already stripped
    pub fn parse_body(body: &str) -> Result<Self, FrameError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(FrameError::Empty);
        }

        let rest = body.strip_prefix('<').ok_or(FrameError::MissingTagOpen)?;
        let (tag, value) = rest.split_once('>').ok_or(FrameError::MissingTagClose)?;

        if tag.is_empty() || !tag.chars().all(is_tag_char) {
            return Err(FrameError::InvalidTag(tag.to_string()));
        }

        let value = value.trim();
        Ok(Self {
            tag: tag.to_string(),
            value: (!value.is_empty()).then(|| value.to_string()),
        })
    }

    /// Value as an integer, if present and numeric
    pub fn int_value(&self) -> Option<i64> {
        self.value.as_deref().and_then(|value| value.parse().ok())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>{}", self.tag, self.value.as_deref().unwrap_or(""))
    }
}

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tag_and_value() {
        let frame = Frame::parse("<m_lk>1200\r\n").expect("valid frame");
        assert_eq!(frame.tag, "m_lk");
        assert_eq!(frame.value.as_deref(), Some("1200"));
        assert_eq!(frame.int_value(), Some(1200));
    }

    #[test]
    fn test_parse_tag_only() {
        let frame = Frame::parse("<req_lock_data>\r\n").expect("valid frame");
        assert_eq!(frame.tag, "req_lock_data");
        assert_eq!(frame.value, None);
        assert_eq!(frame.int_value(), None);
    }

    #[test]
    fn test_string_value() {
        let frame = Frame::parse("<key>AABBCC\r\n").expect("valid frame");
        assert_eq!(frame.value.as_deref(), Some("AABBCC"));
        assert_eq!(frame.int_value(), None);
    }

    #[test]
    fn test_negative_value() {
        assert_eq!(Frame::parse("<a_lk>-15\r\n").expect("valid").int_value(), Some(-15));
    }

    #[test]
    fn test_malformed_frames() {
        assert_eq!(Frame::parse("<status>1"), Err(FrameError::Unterminated));
        assert_eq!(Frame::parse("\r\n"), Err(FrameError::Empty));
        assert_eq!(Frame::parse("status>1\r\n"), Err(FrameError::MissingTagOpen));
        assert_eq!(Frame::parse("<status1\r\n"), Err(FrameError::MissingTagClose));
        assert_eq!(
            Frame::parse("<sta-tus>1\r\n"),
            Err(FrameError::InvalidTag("sta-tus".to_string()))
        );
        assert_eq!(Frame::parse("<>1\r\n"), Err(FrameError::InvalidTag(String::new())));
    }

    #[test]
    fn test_display_round_trip() {
        let frame = Frame::parse_body("<status>0").expect("valid");
        assert_eq!(frame.to_string(), "<status>0");
    }
}
