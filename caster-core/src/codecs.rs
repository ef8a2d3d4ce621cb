use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    H265,
    Av1,
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "h264"),
            VideoCodec::H265 => write!(f, "hevc"),
            VideoCodec::Av1 => write!(f, "av1"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioCodec {
    Aac,
    Opus,
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioCodec::Aac => write!(f, "aac"),
            AudioCodec::Opus => write!(f, "opus"),
        }
    }
}

/// Checks a codec name against a backend's comma-separated whitelist.
/// An empty whitelist accepts everything.
pub fn codec_supported(whitelist: &str, codec: &str) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    whitelist
        .split(',')
        .any(|entry| entry.trim().eq_ignore_ascii_case(codec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_whitelist() {
        assert!(codec_supported("", "h264"));
        assert!(codec_supported("h264", "h264"));
        assert!(codec_supported("h264,hevc", "hevc"));
        assert!(codec_supported("h264, hevc", "hevc"));
        assert!(!codec_supported("h264,hevc", "av1"));
        assert!(codec_supported("aac", &AudioCodec::Aac.to_string()));
    }
}
