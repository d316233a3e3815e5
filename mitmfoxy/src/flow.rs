use std::collections::HashMap;

use http::{HeaderMap, Method, StatusCode, Version};
use serde::Serialize;
use uuid::Uuid;

/// A captured request/response exchange, built once the response body has
/// been fully relayed to the client.
#[derive(Debug, Clone, Serialize)]
pub struct Flow {
    pub id: String,
    pub request: FlowRequest,
    pub response: FlowResponse,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowRequest {
    pub method: String,
    pub url: String,
    pub header: HashMap<String, Vec<String>>,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    #[serde(skip_serializing_if = "is_false")]
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowResponse {
    pub proto: String,
    pub status_code: u16,
    pub status_text: String,
    pub header: HashMap<String, Vec<String>>,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    pub cookies: Vec<FlowCookie>,
    #[serde(skip_serializing_if = "is_false")]
    pub truncated: bool,
}

/// One `Set-Cookie` value in parsed form. `raw` keeps the original header
/// value so nothing is lost to parsing.
#[derive(Debug, Clone, Serialize)]
pub struct FlowCookie {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
    pub raw: String,
}

impl Flow {
    pub fn new(request: FlowRequest, response: FlowResponse) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request,
            response,
        }
    }
}

impl FlowRequest {
    pub fn new(
        method: &Method,
        url: String,
        headers: &HeaderMap,
        body: Vec<u8>,
        truncated: bool,
    ) -> Self {
        Self {
            method: method.to_string(),
            url,
            header: header_multimap(headers),
            body,
            truncated,
        }
    }
}

impl FlowResponse {
    pub fn new(
        version: Version,
        status: StatusCode,
        headers: &HeaderMap,
        body: Vec<u8>,
        truncated: bool,
    ) -> Self {
        Self {
            proto: proto_name(version).to_string(),
            status_code: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            header: header_multimap(headers),
            body,
            cookies: parse_cookies(headers),
            truncated,
        }
    }
}

fn header_multimap(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for key in headers.keys() {
        let values = headers
            .get_all(key)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        map.insert(key.as_str().to_string(), values);
    }
    map
}

fn proto_name(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn parse_cookies(headers: &HeaderMap) -> Vec<FlowCookie> {
    headers
        .get_all(http::header::SET_COOKIE)
        .iter()
        .filter_map(|value| {
            let raw = value.to_str().ok()?;
            let parsed = cookie::Cookie::parse(raw).ok()?;
            Some(FlowCookie {
                name: parsed.name().to_string(),
                value: parsed.value().to_string(),
                path: parsed.path().map(ToString::to_string),
                domain: parsed.domain().map(ToString::to_string),
                max_age: parsed.max_age().map(|d| d.whole_seconds()),
                secure: parsed.secure().unwrap_or(false),
                http_only: parsed.http_only().unwrap_or(false),
                same_site: parsed.same_site().map(|s| s.to_string()),
                raw: raw.to_string(),
            })
        })
        .collect()
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

mod base64_bytes {
    use base64::Engine;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }
}
