//! Codec identification and sequence-header detection.
//!
//! Per spec.md §1 non-goals, this is a 1–2 byte header peek for
//! identification only — no bitstream parsing (no SPS/PPS, no
//! AudioSpecificConfig decoding). That depth of parsing belongs to a
//! transcoder or analyzer, not this relay.

/// FLV AUDIODATA SoundFormat nibble (top 4 bits of the first payload byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    LinearPcm,
    Adpcm,
    Mp3,
    LinearPcmLe,
    Nellymoser16k,
    Nellymoser8k,
    Nellymoser,
    G711ALaw,
    G711MuLaw,
    Aac,
    Speex,
    Mp38k,
    DeviceSpecific,
    Unknown(u8),
}

impl AudioCodec {
    fn from_id(id: u8) -> Self {
        match id {
            0 => AudioCodec::LinearPcm,
            1 => AudioCodec::Adpcm,
            2 => AudioCodec::Mp3,
            3 => AudioCodec::LinearPcmLe,
            4 => AudioCodec::Nellymoser16k,
            5 => AudioCodec::Nellymoser8k,
            6 => AudioCodec::Nellymoser,
            7 => AudioCodec::G711ALaw,
            8 => AudioCodec::G711MuLaw,
            10 => AudioCodec::Aac,
            11 => AudioCodec::Speex,
            14 => AudioCodec::Mp38k,
            15 => AudioCodec::DeviceSpecific,
            other => AudioCodec::Unknown(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AudioCodec::LinearPcm => "linear-pcm",
            AudioCodec::Adpcm => "adpcm",
            AudioCodec::Mp3 => "mp3",
            AudioCodec::LinearPcmLe => "linear-pcm-le",
            AudioCodec::Nellymoser16k => "nellymoser-16k",
            AudioCodec::Nellymoser8k => "nellymoser-8k",
            AudioCodec::Nellymoser => "nellymoser",
            AudioCodec::G711ALaw => "g711-alaw",
            AudioCodec::G711MuLaw => "g711-mulaw",
            AudioCodec::Aac => "aac",
            AudioCodec::Speex => "speex",
            AudioCodec::Mp38k => "mp3-8k",
            AudioCodec::DeviceSpecific => "device-specific",
            AudioCodec::Unknown(_) => "unknown",
        }
    }
}

/// FLV VIDEODATA CodecID nibble (low 4 bits of the first payload byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H263,
    Screen,
    Vp6,
    Vp6Alpha,
    ScreenV2,
    Avc,
    Unknown(u8),
}

impl VideoCodec {
    fn from_id(id: u8) -> Self {
        match id {
            2 => VideoCodec::H263,
            3 => VideoCodec::Screen,
            4 => VideoCodec::Vp6,
            5 => VideoCodec::Vp6Alpha,
            6 => VideoCodec::ScreenV2,
            7 => VideoCodec::Avc,
            other => VideoCodec::Unknown(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VideoCodec::H263 => "h263",
            VideoCodec::Screen => "screen",
            VideoCodec::Vp6 => "vp6",
            VideoCodec::Vp6Alpha => "vp6-alpha",
            VideoCodec::ScreenV2 => "screen-v2",
            VideoCodec::Avc => "avc",
            VideoCodec::Unknown(_) => "unknown",
        }
    }
}

/// Peeks the codec id out of an audio (type 8) payload's first byte.
/// Never mutates or consumes the payload (spec.md §4.10 step 1).
pub fn detect_audio_codec(payload: &[u8]) -> Option<AudioCodec> {
    payload.first().map(|b| AudioCodec::from_id(b >> 4))
}

/// Peeks the codec id out of a video (type 9) payload's first byte.
pub fn detect_video_codec(payload: &[u8]) -> Option<VideoCodec> {
    payload.first().map(|b| VideoCodec::from_id(b & 0x0F))
}

/// True when `payload` is an AVC (H.264) sequence header: `payload[0] ==
/// 0x17` (keyframe + codec 7) and `payload[1] == 0x00` (spec.md §6).
pub fn is_avc_sequence_header(payload: &[u8]) -> bool {
    payload.len() >= 2 && payload[0] == 0x17 && payload[1] == 0x00
}

/// True when `payload` is an AAC sequence header: high nibble of
/// `payload[0] == 0x0A` and `payload[1] == 0x00` (spec.md §6).
pub fn is_aac_sequence_header(payload: &[u8]) -> bool {
    payload.len() >= 2 && (payload[0] >> 4) == 10 && payload[1] == 0x00
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_avc_sequence_header() {
        assert!(is_avc_sequence_header(&[0x17, 0x00, 0x00, 0x00, 0x00]));
        assert!(!is_avc_sequence_header(&[0x17, 0x01, 0x00, 0x00, 0x00]));
        assert!(!is_avc_sequence_header(&[0x27, 0x00]));
    }

    #[test]
    fn detects_aac_sequence_header() {
        assert!(is_aac_sequence_header(&[0xAF, 0x00, 0x12, 0x10]));
        assert!(!is_aac_sequence_header(&[0xAF, 0x01, 0x00, 0x00]));
    }

    #[test]
    fn identifies_codec_ids() {
        assert_eq!(detect_video_codec(&[0x17]), Some(VideoCodec::Avc));
        assert_eq!(detect_audio_codec(&[0xAF]), Some(AudioCodec::Aac));
        assert_eq!(detect_audio_codec(&[]), None);
    }
}
