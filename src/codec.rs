//! Audio codecs and interpretation of their negotiated capabilities.
//!
//! A2DP capability blobs are bit-packed and codec specific. The parsers in
//! this module turn the negotiated blob into typed capability records and
//! derive the PCM stream parameters (channel count and sample rate) from
//! them. Fields that are unset or carry an unknown bit pattern map to zero;
//! callers must tolerate unspecified parameters.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use strum::Display;

/// Audio codec of a transport.
///
/// A2DP and HFP codecs share this enumeration; which namespace applies
/// follows from the transport profile.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Codec {
    /// Codec not negotiated yet.
    Undefined,
    /// Low-complexity subband codec, the mandatory A2DP codec.
    #[strum(serialize = "SBC")]
    Sbc,
    /// MPEG-1/2 audio (layers 1-3).
    #[strum(serialize = "MPEG-1,2")]
    Mpeg12,
    /// MPEG-2/4 AAC.
    #[strum(serialize = "AAC")]
    Aac,
    /// Qualcomm aptX.
    #[strum(serialize = "aptX")]
    AptX,
    /// Sony LDAC.
    #[strum(serialize = "LDAC")]
    Ldac,
    /// Narrowband voice, the mandatory HSP/HFP codec.
    #[strum(serialize = "CVSD")]
    Cvsd,
    /// Wideband voice (modified SBC).
    #[strum(serialize = "mSBC")]
    Msbc,
}

/// A2DP codec identifiers from the media endpoint negotiation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum A2dpCodecId {
    /// SBC.
    Sbc = 0x00,
    /// MPEG-1/2 audio.
    Mpeg12 = 0x01,
    /// MPEG-2/4 AAC.
    Mpeg24 = 0x02,
    /// Vendor specific codec; identified by the capability blob header.
    Vendor = 0xff,
}

/// HFP codec identifiers from the `AT+BCS` codec selection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum HfpCodecId {
    /// Not negotiated.
    Undefined = 0x00,
    /// CVSD.
    Cvsd = 0x01,
    /// mSBC.
    Msbc = 0x02,
}

impl Codec {
    /// Codec for an A2DP codec identifier.
    ///
    /// Vendor codecs cannot be told apart by the identifier alone and map to
    /// [Codec::Undefined]; the caller resolves them from the capability blob
    /// vendor header.
    pub fn from_a2dp_id(id: u8) -> Option<Self> {
        match A2dpCodecId::from_u8(id)? {
            A2dpCodecId::Sbc => Some(Self::Sbc),
            A2dpCodecId::Mpeg12 => Some(Self::Mpeg12),
            A2dpCodecId::Mpeg24 => Some(Self::Aac),
            A2dpCodecId::Vendor => Some(Self::Undefined),
        }
    }

    /// Codec for an HFP codec identifier.
    pub fn from_hfp_id(id: u8) -> Option<Self> {
        match HfpCodecId::from_u8(id)? {
            HfpCodecId::Undefined => Some(Self::Undefined),
            HfpCodecId::Cvsd => Some(Self::Cvsd),
            HfpCodecId::Msbc => Some(Self::Msbc),
        }
    }
}

/// Size of the vendor codec header (vendor id and codec id) that prefixes
/// aptX and LDAC capability blobs.
const VENDOR_HEADER_LEN: usize = 6;

/// SBC capabilities.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SbcCaps {
    /// Sampling frequency bit.
    pub frequency: u8,
    /// Channel mode bit.
    pub channel_mode: u8,
    /// Block length bit.
    pub block_length: u8,
    /// Subband count bit.
    pub subbands: u8,
    /// Allocation method bit.
    pub allocation_method: u8,
    /// Minimum bitpool value.
    pub min_bitpool: u8,
    /// Maximum bitpool value.
    pub max_bitpool: u8,
}

impl SbcCaps {
    /// Parses an SBC capability blob.
    pub fn parse(caps: &[u8]) -> Option<Self> {
        if caps.len() < 4 {
            return None;
        }
        Some(Self {
            channel_mode: caps[0] & 0x0f,
            frequency: caps[0] >> 4,
            allocation_method: caps[1] & 0x03,
            subbands: (caps[1] >> 2) & 0x03,
            block_length: caps[1] >> 4,
            min_bitpool: caps[2],
            max_bitpool: caps[3],
        })
    }
}

/// MPEG-1/2 audio capabilities.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MpegCaps {
    /// Sampling frequency bit.
    pub frequency: u8,
    /// Channel mode bit.
    pub channel_mode: u8,
    /// Layer bit.
    pub layer: u8,
    /// CRC protection flag.
    pub crc: bool,
}

impl MpegCaps {
    /// Parses an MPEG-1/2 capability blob.
    pub fn parse(caps: &[u8]) -> Option<Self> {
        if caps.len() < 4 {
            return None;
        }
        Some(Self {
            channel_mode: caps[0] & 0x0f,
            crc: caps[0] & 0x10 != 0,
            layer: caps[0] >> 5,
            frequency: caps[1] & 0x3f,
        })
    }
}

/// MPEG-2/4 AAC capabilities.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AacCaps {
    /// Object type bit.
    pub object_type: u8,
    /// Sampling frequency bits (12-bit field).
    pub frequency: u16,
    /// Channel count bit.
    pub channels: u8,
    /// Variable bitrate flag.
    pub vbr: bool,
}

impl AacCaps {
    /// Parses an AAC capability blob.
    pub fn parse(caps: &[u8]) -> Option<Self> {
        if caps.len() < 6 {
            return None;
        }
        Some(Self {
            object_type: caps[0],
            frequency: (caps[1] as u16) << 4 | (caps[2] >> 4) as u16,
            channels: (caps[2] >> 2) & 0x03,
            vbr: caps[3] & 0x80 != 0,
        })
    }
}

/// aptX capabilities.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AptxCaps {
    /// Sampling frequency bit.
    pub frequency: u8,
    /// Channel mode bit.
    pub channel_mode: u8,
}

impl AptxCaps {
    /// Parses an aptX capability blob (vendor header included).
    pub fn parse(caps: &[u8]) -> Option<Self> {
        let caps = caps.get(VENDOR_HEADER_LEN..)?;
        let b = *caps.first()?;
        Some(Self { channel_mode: b & 0x0f, frequency: b >> 4 })
    }
}

/// LDAC capabilities.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LdacCaps {
    /// Sampling frequency bits.
    pub frequency: u8,
    /// Channel mode bit.
    pub channel_mode: u8,
}

impl LdacCaps {
    /// Parses an LDAC capability blob (vendor header included).
    pub fn parse(caps: &[u8]) -> Option<Self> {
        let caps = caps.get(VENDOR_HEADER_LEN..)?;
        if caps.len() < 2 {
            return None;
        }
        Some(Self { frequency: caps[0] & 0x3f, channel_mode: caps[1] & 0x07 })
    }
}

/// Channel count of an A2DP stream with the given negotiated capabilities.
///
/// Joint-stereo, dual-channel and stereo modes all count as two channels.
/// Returns 0 if the channel mode is unspecified.
pub fn a2dp_channels(codec: Codec, caps: &[u8]) -> u32 {
    match codec {
        Codec::Sbc => match SbcCaps::parse(caps).map(|c| c.channel_mode) {
            Some(0x08) => 1,
            Some(0x04) | Some(0x02) | Some(0x01) => 2,
            _ => 0,
        },
        Codec::Mpeg12 => match MpegCaps::parse(caps).map(|c| c.channel_mode) {
            Some(0x08) => 1,
            Some(0x04) | Some(0x02) | Some(0x01) => 2,
            _ => 0,
        },
        Codec::Aac => match AacCaps::parse(caps).map(|c| c.channels) {
            Some(0x02) => 1,
            Some(0x01) => 2,
            _ => 0,
        },
        Codec::AptX => match AptxCaps::parse(caps).map(|c| c.channel_mode) {
            Some(0x01) => 1,
            Some(0x02) => 2,
            _ => 0,
        },
        Codec::Ldac => match LdacCaps::parse(caps).map(|c| c.channel_mode) {
            Some(0x04) => 1,
            Some(0x02) | Some(0x01) => 2,
            _ => 0,
        },
        _ => 0,
    }
}

/// Sample rate in Hz of an A2DP stream with the given negotiated capabilities.
///
/// Returns 0 if the sampling frequency is unspecified.
pub fn a2dp_sample_rate(codec: Codec, caps: &[u8]) -> u32 {
    match codec {
        Codec::Sbc => match SbcCaps::parse(caps).map(|c| c.frequency) {
            Some(0x08) => 16000,
            Some(0x04) => 32000,
            Some(0x02) => 44100,
            Some(0x01) => 48000,
            _ => 0,
        },
        Codec::Mpeg12 => match MpegCaps::parse(caps).map(|c| c.frequency) {
            Some(0x20) => 16000,
            Some(0x10) => 22050,
            Some(0x08) => 24000,
            Some(0x04) => 32000,
            Some(0x02) => 44100,
            Some(0x01) => 48000,
            _ => 0,
        },
        Codec::Aac => match AacCaps::parse(caps).map(|c| c.frequency) {
            Some(0x800) => 8000,
            Some(0x400) => 11025,
            Some(0x200) => 12000,
            Some(0x100) => 16000,
            Some(0x080) => 22050,
            Some(0x040) => 24000,
            Some(0x020) => 32000,
            Some(0x010) => 44100,
            Some(0x008) => 48000,
            Some(0x004) => 64000,
            Some(0x002) => 88200,
            Some(0x001) => 96000,
            _ => 0,
        },
        Codec::AptX => match AptxCaps::parse(caps).map(|c| c.frequency) {
            Some(0x08) => 16000,
            Some(0x04) => 32000,
            Some(0x02) => 44100,
            Some(0x01) => 48000,
            _ => 0,
        },
        Codec::Ldac => match LdacCaps::parse(caps).map(|c| c.frequency) {
            Some(0x20) => 44100,
            Some(0x10) => 48000,
            Some(0x08) => 88200,
            Some(0x04) => 96000,
            Some(0x02) => 176400,
            Some(0x01) => 192000,
            _ => 0,
        },
        _ => 0,
    }
}

/// Channel count of an SCO voice link. Always mono.
pub fn sco_channels() -> u32 {
    1
}

/// Sample rate in Hz of an SCO voice link with the given codec.
///
/// Returns 0 while the codec is not negotiated.
pub fn sco_sample_rate(codec: Codec) -> u32 {
    match codec {
        Codec::Cvsd => 8000,
        Codec::Msbc => 16000,
        Codec::Undefined => 0,
        other => {
            log::debug!("Unsupported SCO codec: {}", other);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbc_joint_stereo_44100() {
        // frequency 44.1 kHz, joint stereo, block length 16, 8 subbands,
        // loudness allocation, bitpool 2..53
        let caps = [0x21, 0x15, 2, 53];
        assert_eq!(a2dp_channels(Codec::Sbc, &caps), 2);
        assert_eq!(a2dp_sample_rate(Codec::Sbc, &caps), 44100);
    }

    #[test]
    fn sbc_mono_16000() {
        let caps = [0x88, 0x15, 2, 53];
        assert_eq!(a2dp_channels(Codec::Sbc, &caps), 1);
        assert_eq!(a2dp_sample_rate(Codec::Sbc, &caps), 16000);
    }

    #[test]
    fn aac_stereo_48000() {
        // frequency 48 kHz (bit 0x008), two channels
        let caps = [0x80, 0x00, 0x84, 0x00, 0x00, 0x00];
        assert_eq!(a2dp_channels(Codec::Aac, &caps), 2);
        assert_eq!(a2dp_sample_rate(Codec::Aac, &caps), 48000);
    }

    #[test]
    fn aac_mono_96000() {
        let caps = [0x80, 0x00, 0x18, 0x00, 0x00, 0x00];
        assert_eq!(a2dp_channels(Codec::Aac, &caps), 1);
        assert_eq!(a2dp_sample_rate(Codec::Aac, &caps), 96000);
    }

    #[test]
    fn mpeg_dual_channel_32000() {
        let caps = [0x64, 0x04, 0x00, 0x00];
        assert_eq!(a2dp_channels(Codec::Mpeg12, &caps), 2);
        assert_eq!(a2dp_sample_rate(Codec::Mpeg12, &caps), 32000);
    }

    #[test]
    fn aptx_stereo_44100() {
        let mut caps = vec![0x4f, 0x00, 0x00, 0x00, 0x01, 0x00];
        caps.push(0x22);
        assert_eq!(a2dp_channels(Codec::AptX, &caps), 2);
        assert_eq!(a2dp_sample_rate(Codec::AptX, &caps), 44100);
    }

    #[test]
    fn ldac_stereo_96000() {
        let caps = [0x2d, 0x01, 0x00, 0x00, 0xaa, 0x00, 0x04, 0x01];
        assert_eq!(a2dp_channels(Codec::Ldac, &caps), 2);
        assert_eq!(a2dp_sample_rate(Codec::Ldac, &caps), 96000);
    }

    #[test]
    fn empty_blob_is_unspecified() {
        assert_eq!(a2dp_channels(Codec::Sbc, &[]), 0);
        assert_eq!(a2dp_sample_rate(Codec::Sbc, &[]), 0);
        assert_eq!(a2dp_channels(Codec::Aac, &[0x80]), 0);
    }

    #[test]
    fn unknown_bit_patterns_are_unspecified() {
        // multiple frequency bits set at once
        let caps = [0x31, 0x15, 2, 53];
        assert_eq!(a2dp_sample_rate(Codec::Sbc, &caps), 0);
        // unknown channel mode
        let caps = [0x20, 0x15, 2, 53];
        assert_eq!(a2dp_channels(Codec::Sbc, &caps), 0);
    }

    #[test]
    fn sco_parameters() {
        assert_eq!(sco_channels(), 1);
        assert_eq!(sco_sample_rate(Codec::Cvsd), 8000);
        assert_eq!(sco_sample_rate(Codec::Msbc), 16000);
        assert_eq!(sco_sample_rate(Codec::Undefined), 0);
    }

    #[test]
    fn codec_identifiers() {
        assert_eq!(Codec::from_a2dp_id(0x00), Some(Codec::Sbc));
        assert_eq!(Codec::from_a2dp_id(0x02), Some(Codec::Aac));
        assert_eq!(Codec::from_a2dp_id(0x42), None);
        assert_eq!(Codec::from_hfp_id(0x02), Some(Codec::Msbc));
    }
}
