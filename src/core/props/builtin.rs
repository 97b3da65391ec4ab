// src/core/props/builtin.rs - Built-in property codes
//
// Properties are keyed either by a four character code or by a free-form
// name. The codes below are the ones the core and common filters agree on;
// `BUILTIN_PROPS` gives each of them a readable name, a description and its
// expected value type.

use super::value::PropertyType;

/// Packs a four character code into its big-endian `u32` form.
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    ((code[0] as u32) << 24) | ((code[1] as u32) << 16) | ((code[2] as u32) << 8) | code[3] as u32
}

/// Renders a code as its four characters when printable, in hex otherwise.
pub fn fourcc_to_str(code: u32) -> String {
    let bytes = code.to_be_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        bytes.iter().map(|b| *b as char).collect()
    } else {
        format!("0x{code:08X}")
    }
}

pub const PROP_PID_ID: u32 = fourcc(b"PIDI");
pub const PROP_PID_SERVICE_ID: u32 = fourcc(b"PSID");
pub const PROP_PID_LANGUAGE: u32 = fourcc(b"LANG");
pub const PROP_PID_STREAM_TYPE: u32 = fourcc(b"PMST");
pub const PROP_PID_CODECID: u32 = fourcc(b"POTI");
pub const PROP_PID_UNFRAMED: u32 = fourcc(b"PFRM");
pub const PROP_PID_DURATION: u32 = fourcc(b"PDUR");
pub const PROP_PID_NB_FRAMES: u32 = fourcc(b"NFRM");
pub const PROP_PID_TIMESCALE: u32 = fourcc(b"TIMS");
pub const PROP_PID_DECODER_CONFIG: u32 = fourcc(b"DCFG");
pub const PROP_PID_SAMPLE_RATE: u32 = fourcc(b"AUSR");
pub const PROP_PID_SAMPLES_PER_FRAME: u32 = fourcc(b"FRMS");
pub const PROP_PID_NUM_CHANNELS: u32 = fourcc(b"CHNB");
pub const PROP_PID_AUDIO_FORMAT: u32 = fourcc(b"AFMT");
pub const PROP_PID_WIDTH: u32 = fourcc(b"WIDT");
pub const PROP_PID_HEIGHT: u32 = fourcc(b"HEIG");
pub const PROP_PID_PIXFMT: u32 = fourcc(b"PFMT");
pub const PROP_PID_STRIDE: u32 = fourcc(b"VSTY");
pub const PROP_PID_FPS: u32 = fourcc(b"VFPF");
pub const PROP_PID_SAR: u32 = fourcc(b"PSAR");
pub const PROP_PID_BITRATE: u32 = fourcc(b"RATE");
pub const PROP_PID_URL: u32 = fourcc(b"FURL");
pub const PROP_PID_FILEPATH: u32 = fourcc(b"FSRC");
pub const PROP_PID_MIME: u32 = fourcc(b"MIME");
pub const PROP_PID_FILE_EXT: u32 = fourcc(b"FEXT");
pub const PROP_PCK_SENDER_NTP: u32 = fourcc(b"NTPS");
pub const PROP_PCK_ENCRYPTED: u32 = fourcc(b"EPCK");
pub const PROP_PCK_SUBS: u32 = fourcc(b"SUBS");
pub const PROP_PCK_FILENUM: u32 = fourcc(b"FNUM");

/// Description of a built-in property.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinProperty {
    pub code: u32,
    pub name: &'static str,
    pub description: &'static str,
    pub ty: PropertyType,
}

const fn prop(code: u32, name: &'static str, description: &'static str, ty: PropertyType) -> BuiltinProperty {
    BuiltinProperty {
        code,
        name,
        description,
        ty,
    }
}

pub static BUILTIN_PROPS: &[BuiltinProperty] = &[
    prop(PROP_PID_ID, "ID", "Stream ID of PID", PropertyType::UInt),
    prop(PROP_PID_SERVICE_ID, "ServiceID", "ID of parent service of this PID", PropertyType::UInt),
    prop(PROP_PID_LANGUAGE, "Language", "Language name for this PID", PropertyType::Name),
    prop(PROP_PID_STREAM_TYPE, "StreamType", "Media stream type", PropertyType::UInt),
    prop(PROP_PID_CODECID, "CodecID", "Codec ID of the stream", PropertyType::UInt),
    prop(PROP_PID_UNFRAMED, "Unframed", "Media data is not framed (a packet is not a complete frame)", PropertyType::Bool),
    prop(PROP_PID_DURATION, "Duration", "PID duration", PropertyType::Fraction),
    prop(PROP_PID_NB_FRAMES, "NumFrames", "Number of frames in the stream", PropertyType::UInt),
    prop(PROP_PID_TIMESCALE, "Timescale", "Timescale of PID (a timestamp of N is N/timescale seconds)", PropertyType::UInt),
    prop(PROP_PID_DECODER_CONFIG, "DecoderConfig", "Decoder configuration data", PropertyType::Data),
    prop(PROP_PID_SAMPLE_RATE, "SampleRate", "Audio sample rate", PropertyType::UInt),
    prop(PROP_PID_SAMPLES_PER_FRAME, "SamplesPerFrame", "Number of audio samples in one coded frame", PropertyType::UInt),
    prop(PROP_PID_NUM_CHANNELS, "NumChannels", "Number of audio channels", PropertyType::UInt),
    prop(PROP_PID_AUDIO_FORMAT, "AudioFormat", "Audio sample format", PropertyType::UInt),
    prop(PROP_PID_WIDTH, "Width", "Visual width", PropertyType::UInt),
    prop(PROP_PID_HEIGHT, "Height", "Visual height", PropertyType::UInt),
    prop(PROP_PID_PIXFMT, "PixelFormat", "Pixel format", PropertyType::UInt),
    prop(PROP_PID_STRIDE, "Stride", "Image or Y/alpha plane stride", PropertyType::UInt),
    prop(PROP_PID_FPS, "FPS", "Video frame rate", PropertyType::Fraction),
    prop(PROP_PID_SAR, "SAR", "Sample (pixel) aspect ratio", PropertyType::Fraction),
    prop(PROP_PID_BITRATE, "Bitrate", "PID bitrate in bps", PropertyType::UInt),
    prop(PROP_PID_URL, "URL", "URL of source", PropertyType::String),
    prop(PROP_PID_FILEPATH, "SourcePath", "Path of source file on file system", PropertyType::String),
    prop(PROP_PID_MIME, "MIMEType", "MIME type of source", PropertyType::String),
    prop(PROP_PID_FILE_EXT, "Extension", "File extension of source", PropertyType::String),
    prop(PROP_PCK_SENDER_NTP, "SenderNTP", "Sender NTP time", PropertyType::LUInt),
    prop(PROP_PCK_ENCRYPTED, "Encrypted", "Packet payload is encrypted", PropertyType::Bool),
    prop(PROP_PCK_SUBS, "SubSampleInfo", "Sub-sample layout of the packet", PropertyType::Data),
    prop(PROP_PCK_FILENUM, "FileNumber", "Index of file when dumping streams made of files", PropertyType::UInt),
];

pub fn builtin_info(code: u32) -> Option<&'static BuiltinProperty> {
    BUILTIN_PROPS.iter().find(|p| p.code == code)
}

pub fn builtin_name(code: u32) -> Option<&'static str> {
    builtin_info(code).map(|p| p.name)
}

pub fn builtin_code(name: &str) -> Option<u32> {
    BUILTIN_PROPS.iter().find(|p| p.name == name).map(|p| p.code)
}

/// Readable name of a property code, falling back to its 4CC text.
pub fn property_name(code: u32) -> String {
    match builtin_name(code) {
        Some(name) => name.to_string(),
        None => fourcc_to_str(code),
    }
}

/// Returns the first code or name registered twice in the built-in table.
pub fn check_builtin_uniqueness() -> Result<(), String> {
    for (i, a) in BUILTIN_PROPS.iter().enumerate() {
        for b in &BUILTIN_PROPS[i + 1..] {
            if a.code == b.code {
                return Err(format!(
                    "property code {} used by both {} and {}",
                    fourcc_to_str(a.code),
                    a.name,
                    b.name
                ));
            }
            if a.name == b.name {
                return Err(format!("property name {} registered twice", a.name));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_is_unique() {
        assert_eq!(check_builtin_uniqueness(), Ok(()));
    }

    #[test]
    fn test_fourcc_round_trip_text() {
        assert_eq!(fourcc(b"TIMS"), 0x5449_4D53);
        assert_eq!(fourcc_to_str(PROP_PID_TIMESCALE), "TIMS");
        assert_eq!(fourcc_to_str(1), "0x00000001");
    }

    #[test]
    fn test_lookup_by_name_and_code() {
        assert_eq!(builtin_name(PROP_PID_WIDTH), Some("Width"));
        assert_eq!(builtin_code("Timescale"), Some(PROP_PID_TIMESCALE));
        assert_eq!(builtin_info(PROP_PID_FPS).map(|p| p.ty), Some(PropertyType::Fraction));
        assert_eq!(property_name(fourcc(b"ABCD")), "ABCD");
    }
}
