//! HTTP/1.1 to HTTP/2 upgrade (`Upgrade: h2c`, RFC 7540 §3.2).
//!
//! # Responsibilities
//! - Recognise an `h2c` offer and validate its single `HTTP2-Settings` header
//! - Build the `101 Switching Protocols` head
//! - Re-encode the upgraded request as stream 1 frames for the HTTP/2 server
//!
//! # Design Decisions
//! - The header block is HPACK literals without indexing and without Huffman,
//!   so no encoder state outlives the request
//! - The offered settings are validated but not applied; the client repeats
//!   them in its own SETTINGS frame after the preface
//! - Requests whose header block exceeds one frame or whose body exceeds the
//!   initial window are served over HTTP/1.1 instead

use base64::alphabet::URL_SAFE;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONNECTION, HOST, UPGRADE};
use http::{HeaderMap, HeaderValue, Request, StatusCode, Version};

use crate::codec::http1::encode_head;
use crate::http::upgrade::PREFACE;

pub const HTTP2_SETTINGS: &str = "http2-settings";

const MAX_FRAME_SIZE: usize = 16_384;
const INITIAL_WINDOW_SIZE: usize = 65_535;
const FRAME_HEADER_LEN: usize = 9;
const SETTING_LEN: usize = 6;

const DATA: u8 = 0x0;
const HEADERS: u8 = 0x1;
const END_STREAM: u8 = 0x1;
const END_HEADERS: u8 = 0x4;

/// Stream the upgraded request is answered on.
const UPGRADE_STREAM: u32 = 1;

/// `token68` in the URL-safe alphabet; padding is optional.
const SETTINGS_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Connection-specific headers that must not appear in HTTP/2, plus the ones
/// carried by pseudo-headers or frames.
const DROPPED: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "upgrade",
    HTTP2_SETTINGS,
    "host",
    "content-length",
];

/// Why an `h2c` offer is served over HTTP/1.1.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpgradeDecline {
    #[error("upgrade offered on {0:?}")]
    Version(Version),

    #[error("expected exactly one HTTP2-Settings header, got {0}")]
    SettingsCount(usize),

    #[error("HTTP2-Settings is not a settings payload")]
    SettingsMalformed,

    #[error("request names no authority")]
    NoAuthority,

    #[error("request does not fit the initial HTTP/2 limits")]
    TooLarge,
}

/// Whether `Upgrade` lists `h2c`.
pub fn offers_h2c(headers: &HeaderMap) -> bool {
    headers
        .get_all(UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim().eq_ignore_ascii_case("h2c"))
}

/// Validates an `h2c` offer and returns the frames that replay `request` on
/// stream 1.
pub fn accept(request: &Request<Bytes>) -> Result<Bytes, UpgradeDecline> {
    if request.version() != Version::HTTP_11 {
        return Err(UpgradeDecline::Version(request.version()));
    }

    let offered: Vec<&HeaderValue> = request.headers().get_all(HTTP2_SETTINGS).iter().collect();
    let [settings] = offered.as_slice() else {
        return Err(UpgradeDecline::SettingsCount(offered.len()));
    };
    let payload = settings
        .to_str()
        .ok()
        .and_then(|v| SETTINGS_ENGINE.decode(v.trim()).ok())
        .ok_or(UpgradeDecline::SettingsMalformed)?;
    if payload.len() % SETTING_LEN != 0 {
        return Err(UpgradeDecline::SettingsMalformed);
    }

    let block = header_block(request)?;
    let body = request.body();
    if block.len() > MAX_FRAME_SIZE || body.len() > INITIAL_WINDOW_SIZE {
        return Err(UpgradeDecline::TooLarge);
    }

    let mut out = BytesMut::with_capacity(block.len() + body.len() + 4 * FRAME_HEADER_LEN);
    let headers_flags = if body.is_empty() {
        END_HEADERS | END_STREAM
    } else {
        END_HEADERS
    };
    frame(&mut out, HEADERS, headers_flags, &block);

    let mut chunks = body.chunks(MAX_FRAME_SIZE).peekable();
    while let Some(chunk) = chunks.next() {
        let flags = if chunks.peek().is_none() { END_STREAM } else { 0 };
        frame(&mut out, DATA, flags, chunk);
    }
    Ok(out.freeze())
}

/// `101 Switching Protocols` head that precedes the server preface.
pub fn switching_protocols() -> Bytes {
    let mut headers = HeaderMap::new();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("h2c"));
    encode_head(StatusCode::SWITCHING_PROTOCOLS, &headers)
}

fn header_block(request: &Request<Bytes>) -> Result<BytesMut, UpgradeDecline> {
    let authority = match request.uri().authority() {
        Some(authority) => authority.as_str().as_bytes(),
        None => request
            .headers()
            .get(HOST)
            .map(HeaderValue::as_bytes)
            .filter(|host| !host.is_empty())
            .ok_or(UpgradeDecline::NoAuthority)?,
    };
    let path = request
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/");

    let mut block = BytesMut::with_capacity(256);
    literal(&mut block, b":method", request.method().as_str().as_bytes());
    literal(&mut block, b":scheme", b"http");
    literal(&mut block, b":path", path.as_bytes());
    literal(&mut block, b":authority", authority);

    for (name, value) in request.headers() {
        if !DROPPED.contains(&name.as_str()) {
            literal(&mut block, name.as_str().as_bytes(), value.as_bytes());
        }
    }
    Ok(block)
}

/// Literal header field without indexing, new name (RFC 7541 §6.2.2).
fn literal(out: &mut BytesMut, name: &[u8], value: &[u8]) {
    out.put_u8(0x00);
    string(out, name);
    string(out, value);
}

fn string(out: &mut BytesMut, value: &[u8]) {
    integer(out, 7, 0x00, value.len());
    out.put_slice(value);
}

/// Prefix-coded integer (RFC 7541 §5.1).
fn integer(out: &mut BytesMut, prefix_bits: u8, first: u8, mut value: usize) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        out.put_u8(first | value as u8);
        return;
    }
    out.put_u8(first | max as u8);
    value -= max;
    while value >= 0x80 {
        out.put_u8((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

fn frame(out: &mut BytesMut, kind: u8, flags: u8, payload: &[u8]) {
    let len = payload.len() as u32;
    out.put_slice(&len.to_be_bytes()[1..]);
    out.put_u8(kind);
    out.put_u8(flags);
    out.put_u32(UPGRADE_STREAM);
    out.put_slice(payload);
}

/// Holds the upgraded request's frames back until the client preface and the
/// client's first frame went through, so stream 1 opens after its SETTINGS.
#[derive(Debug)]
pub struct UpgradeSeed {
    frames: Bytes,
    buffered: BytesMut,
}

impl UpgradeSeed {
    pub fn new(frames: Bytes) -> Self {
        Self {
            frames,
            buffered: BytesMut::new(),
        }
    }

    /// Buffers `data`. Returns everything for the HTTP/2 server once the
    /// frames could be placed.
    pub fn push(&mut self, data: &[u8]) -> Option<Bytes> {
        self.buffered.extend_from_slice(data);
        let header_end = PREFACE.len() + FRAME_HEADER_LEN;
        if self.buffered.len() < header_end {
            return None;
        }

        let len = &self.buffered[PREFACE.len()..PREFACE.len() + 3];
        let len = (usize::from(len[0]) << 16) | (usize::from(len[1]) << 8) | usize::from(len[2]);
        // An oversized first frame fails the session anyway.
        let split = if len > MAX_FRAME_SIZE {
            self.buffered.len()
        } else if self.buffered.len() < header_end + len {
            return None;
        } else {
            header_end + len
        };

        let mut out = BytesMut::with_capacity(self.buffered.len() + self.frames.len());
        out.put_slice(&self.buffered[..split]);
        out.put_slice(&self.frames);
        out.put_slice(&self.buffered[split..]);
        self.buffered.clear();
        Some(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = "AAMAAABkAARAAAAAAAIAAAAA";

    fn offer() -> http::request::Builder {
        Request::get("/status?x=1")
            .header(HOST, "example.com")
            .header(CONNECTION, "Upgrade, HTTP2-Settings")
            .header(UPGRADE, "h2c")
            .header(HTTP2_SETTINGS, SETTINGS)
    }

    fn frame_header(bytes: &[u8]) -> (usize, u8, u8, u32) {
        let len = (usize::from(bytes[0]) << 16) | (usize::from(bytes[1]) << 8) | usize::from(bytes[2]);
        let stream = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        (len, bytes[3], bytes[4], stream)
    }

    #[test]
    fn offers_are_recognised_in_lists() {
        let request = offer().body(Bytes::new()).unwrap();
        assert!(offers_h2c(request.headers()));

        let request = Request::get("/")
            .header(UPGRADE, "websocket, H2C")
            .body(Bytes::new())
            .unwrap();
        assert!(offers_h2c(request.headers()));

        let request = Request::get("/").header(UPGRADE, "h2").body(Bytes::new()).unwrap();
        assert!(!offers_h2c(request.headers()));
    }

    #[test]
    fn bodiless_request_is_a_single_headers_frame() {
        let request = offer().header("accept", "*/*").body(Bytes::new()).unwrap();
        let frames = accept(&request).unwrap();

        let (len, kind, flags, stream) = frame_header(&frames);
        assert_eq!(kind, HEADERS);
        assert_eq!(flags, END_HEADERS | END_STREAM);
        assert_eq!(stream, 1);
        assert_eq!(frames.len(), FRAME_HEADER_LEN + len);

        let block = &frames[FRAME_HEADER_LEN..];
        assert_eq!(&block[..13], b"\x00\x07:method\x03GET");
        let text = String::from_utf8_lossy(block);
        assert!(text.contains(":path\x0b/status?x=1"));
        assert!(text.contains(":authority\x0bexample.com"));
        assert!(text.contains("accept\x03*/*"));
        for dropped in ["upgrade", "http2-settings", "connection", "host"] {
            assert!(!text.contains(dropped), "{dropped} was forwarded");
        }
    }

    #[test]
    fn body_follows_in_a_data_frame() {
        let request = offer()
            .method("POST")
            .header("content-length", "5")
            .body(Bytes::from_static(b"hello"))
            .unwrap();
        let frames = accept(&request).unwrap();

        let (len, kind, flags, _) = frame_header(&frames);
        assert_eq!((kind, flags), (HEADERS, END_HEADERS));
        let data = &frames[FRAME_HEADER_LEN + len..];
        assert_eq!(frame_header(data), (5, DATA, END_STREAM, 1));
        assert_eq!(&data[FRAME_HEADER_LEN..], b"hello");
    }

    #[test]
    fn long_values_use_continuation_bytes() {
        let mut out = BytesMut::new();
        integer(&mut out, 7, 0x00, 1337);
        assert_eq!(&out[..], &[0x7f, 0xba, 0x09]);

        let mut out = BytesMut::new();
        integer(&mut out, 7, 0x00, 126);
        assert_eq!(&out[..], &[0x7e]);
    }

    #[test]
    fn settings_header_must_be_single_and_valid() {
        let missing = Request::get("/")
            .header(HOST, "example.com")
            .header(UPGRADE, "h2c")
            .body(Bytes::new())
            .unwrap();
        assert_eq!(accept(&missing), Err(UpgradeDecline::SettingsCount(0)));

        let twice = offer().header(HTTP2_SETTINGS, SETTINGS).body(Bytes::new()).unwrap();
        assert_eq!(accept(&twice), Err(UpgradeDecline::SettingsCount(2)));

        for bad in ["not base64!", "AAMAAA"] {
            let request = Request::get("/")
                .header(HOST, "example.com")
                .header(UPGRADE, "h2c")
                .header(HTTP2_SETTINGS, bad)
                .body(Bytes::new())
                .unwrap();
            assert_eq!(accept(&request), Err(UpgradeDecline::SettingsMalformed), "{bad}");
        }

        let empty = Request::get("/")
            .header(HOST, "example.com")
            .header(UPGRADE, "h2c")
            .header(HTTP2_SETTINGS, "")
            .body(Bytes::new())
            .unwrap();
        assert!(accept(&empty).is_ok());
    }

    #[test]
    fn other_versions_and_large_requests_are_declined() {
        let request = offer().version(Version::HTTP_10).body(Bytes::new()).unwrap();
        assert_eq!(accept(&request), Err(UpgradeDecline::Version(Version::HTTP_10)));

        let request = offer().body(Bytes::from(vec![b'x'; INITIAL_WINDOW_SIZE + 1])).unwrap();
        assert_eq!(accept(&request), Err(UpgradeDecline::TooLarge));

        let request = Request::get("/")
            .header(UPGRADE, "h2c")
            .header(HTTP2_SETTINGS, SETTINGS)
            .body(Bytes::new())
            .unwrap();
        assert_eq!(accept(&request), Err(UpgradeDecline::NoAuthority));
    }

    #[test]
    fn switching_protocols_head() {
        let head = switching_protocols();
        let head = std::str::from_utf8(&head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("connection: Upgrade\r\n"));
        assert!(head.contains("upgrade: h2c\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn seed_waits_for_the_first_client_frame() {
        let mut seed = UpgradeSeed::new(Bytes::from_static(b"<stream 1>"));
        let settings: &[u8] = b"\x00\x00\x06\x04\x00\x00\x00\x00\x00\x00\x03\x00\x00\x00\x64";

        assert_eq!(seed.push(PREFACE), None);
        assert_eq!(seed.push(&settings[..10]), None);

        let mut rest = settings[10..].to_vec();
        rest.extend_from_slice(b"ping");
        let ready = seed.push(&rest).unwrap();

        let mut expected = PREFACE.to_vec();
        expected.extend_from_slice(settings);
        expected.extend_from_slice(b"<stream 1>ping");
        assert_eq!(&ready[..], &expected[..]);
    }
}
