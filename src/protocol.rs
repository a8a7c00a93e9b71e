use md5::{Digest, Md5};
use rand::RngExt;
use serde::{Deserialize, Serialize};

use crate::crypto::EnvelopeCodec;

/// Control-plane routing tag.
pub const CHANNEL_WO_HOME: &str = "wohome";

/// Client identity sent inside every encrypted `param`.
pub const CLIENT_ID: &str = "1001000021";

/// Signed header carried by every dispatcher call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestHeader {
    pub key: String,
    pub res_time: i64,
    pub req_seq: u32,
    pub channel: String,
    pub sign: String,
    pub version: String,
}

impl RequestHeader {
    /// Header for the operation `key` with a fresh timestamp and sequence.
    pub fn new(channel: &str, key: &str) -> Self {
        let res_time = chrono::Utc::now().timestamp_millis();
        let req_seq = rand::rng().random_range(100_000..=108_999);
        Self::with_parts(channel, key, res_time, req_seq)
    }

    /// Deterministic constructor; the signature only depends on the parts.
    pub fn with_parts(channel: &str, key: &str, res_time: i64, req_seq: u32) -> Self {
        let version = "";
        Self {
            key: key.to_string(),
            res_time,
            req_seq,
            channel: channel.to_string(),
            sign: sign_request(key, res_time, req_seq, channel, version),
            version: version.to_string(),
        }
    }
}

/// `hex(md5(key ‖ resTime ‖ reqSeq ‖ channel ‖ version))`, integers in
/// base 10 with no separators.
pub fn sign_request(key: &str, res_time: i64, req_seq: u32, channel: &str, version: &str) -> String {
    md5_hex(format!("{key}{res_time}{req_seq}{channel}{version}").as_bytes())
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

#[derive(Debug, Serialize)]
pub struct RequestBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    pub secret: bool,
}

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub header: RequestHeader,
    pub body: RequestBody,
}

impl Envelope {
    /// Frame an operation call. `param` is compact-serialised and encrypted;
    /// calls without parameters send a bare `{secret:true}` body.
    pub fn new(
        codec: &EnvelopeCodec,
        channel: &str,
        key: &str,
        param: Option<&serde_json::Value>,
    ) -> Self {
        let param = param.map(|value| codec.encrypt(&compact_json(value), channel));
        Self {
            header: RequestHeader::new(channel, key),
            body: RequestBody {
                param,
                secret: true,
            },
        }
    }
}

/// Single serialisation point for signed plaintext. The upstream rejects
/// anything but minimal separators, so all `param` building funnels here.
pub fn compact_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Outer response envelope. `STATUS == "200"` and `RSP_CODE == "0000"`
/// together mean success; `DATA` is an encrypted JSON string.
#[derive(Debug, Deserialize)]
pub struct RawResponse {
    #[serde(rename = "STATUS")]
    pub status: String,
    #[serde(rename = "MSG", default)]
    pub msg: Option<String>,
    #[serde(rename = "RSP", default)]
    pub rsp: Option<RawRsp>,
}

#[derive(Debug, Deserialize)]
pub struct RawRsp {
    #[serde(rename = "RSP_CODE", default)]
    pub code: Option<String>,
    #[serde(rename = "RSP_DESC", default)]
    pub desc: Option<String>,
    #[serde(rename = "DATA", default)]
    pub data: Option<serde_json::Value>,
}
