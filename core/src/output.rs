use std::fmt;
use std::fmt::Write as _;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;

/// Codec applied to captured stdout/stderr before it is handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Ascii,
    Latin1,
    Hex,
    Base64,
    Utf16Le,
    /// Leave the bytes untouched.
    Raw,
}

impl Encoding {
    /// Resolves a codec name. Unknown names fall back to [`Encoding::Raw`]
    /// rather than failing.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Encoding::Utf8,
            "ascii" => Encoding::Ascii,
            "latin1" | "binary" => Encoding::Latin1,
            "hex" => Encoding::Hex,
            "base64" => Encoding::Base64,
            "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => Encoding::Utf16Le,
            _ => Encoding::Raw,
        }
    }

    pub fn decode(self, bytes: Vec<u8>) -> Output {
        match self {
            Encoding::Raw => Output::Bytes(bytes),
            Encoding::Utf8 => match String::from_utf8(bytes) {
                Ok(text) => Output::Text(text),
                Err(err) => Output::Text(String::from_utf8_lossy(err.as_bytes()).into_owned()),
            },
            Encoding::Ascii => Output::Text(bytes.iter().map(|b| char::from(b & 0x7f)).collect()),
            Encoding::Latin1 => Output::Text(bytes.iter().copied().map(char::from).collect()),
            Encoding::Hex => {
                let mut text = String::with_capacity(bytes.len() * 2);
                for byte in &bytes {
                    let _ = write!(text, "{byte:02x}");
                }
                Output::Text(text)
            }
            Encoding::Base64 => Output::Text(BASE64_STANDARD.encode(&bytes)),
            Encoding::Utf16Le => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                Output::Text(String::from_utf16_lossy(&units))
            }
        }
    }
}

/// Decoded stream contents.
#[derive(Clone, PartialEq, Eq)]
pub enum Output {
    Text(String),
    Bytes(Vec<u8>),
}

impl Output {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Output::Text(text) => text.as_bytes(),
            Output::Bytes(bytes) => bytes,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Output::Text(text) => Some(text),
            Output::Bytes(_) => None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Output::Text(text) => text.into_bytes(),
            Output::Bytes(bytes) => bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn is_bytes(&self) -> bool {
        matches!(self, Output::Bytes(_))
    }
}

impl Default for Output {
    fn default() -> Self {
        Output::Text(String::new())
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Output::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
        }
    }
}

impl PartialEq<&str> for Output {
    fn eq(&self, other: &&str) -> bool {
        self.as_text() == Some(*other)
    }
}

impl PartialEq<str> for Output {
    fn eq(&self, other: &str) -> bool {
        self.as_text() == Some(other)
    }
}
