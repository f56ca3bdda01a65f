//! Call-control document builder
//!
//! Produces the XML the carrier fetches on call setup: either a SIP dial
//! toward the model's gateway, a media-stream connect toward the bridge, or
//! a static spoken message. Also verifies carrier request signatures.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::config::DeployConfig;

type HmacSha1 = Hmac<Sha1>;

/// Default SIP-over-TLS port
const DEFAULT_SIP_TLS_PORT: u16 = 5061;

/// Spoken fallback when minting fails or the bridge is unreachable
pub const SERVICE_UNAVAILABLE_MESSAGE: &str =
    "The voice service is unavailable right now. Please try your call again later.";

/// Document shape selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Sip,
    Stream,
    Simple,
}

impl Mode {
    /// Parse a query value; unknown values fall back to the deployment
    /// default, then to SIP.
    pub fn resolve(query_value: Option<&str>, deploy: &DeployConfig) -> Self {
        Self::parse(query_value)
            .or_else(|| Self::parse(deploy.twiml_default_mode.as_deref()))
            .unwrap_or(Self::Sip)
    }

    fn parse(value: Option<&str>) -> Option<Self> {
        match value {
            Some("sip") => Some(Self::Sip),
            Some("stream") => Some(Self::Stream),
            Some("simple") => Some(Self::Simple),
            _ => None,
        }
    }
}

/// Query parameters recognized by the control-document endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentQuery {
    #[serde(default)]
    pub mode: Option<String>,
    /// Pre-minted credential; absent means mint one now
    #[serde(default)]
    pub token: Option<String>,
    /// "sip" or "sips"
    #[serde(default)]
    pub scheme: Option<String>,
    /// "tls", "tcp" or "udp"
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Put the credential in a query parameter instead of the URL path
    #[serde(default)]
    pub secret_in_query: Option<bool>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub prompt_version: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// Escape text for XML attribute and element content.
///
/// Control characters become numeric references so the document stays
/// well-formed whatever the caller passed in a URL or prompt override.
pub fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if (c as u32) < 0x20 && c != '\t' && c != '\n' && c != '\r' => {
                out.push_str(&format!("&#x{:X};", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

fn document(body: &str) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response>{}</Response>", body)
}

/// Stream-mode document: connect the carrier's media stream to the bridge
pub fn stream_document(bridge_url: &str) -> String {
    document(&format!(
        "<Start><Stream url=\"{}\"/></Start><Pause length=\"60\"/>",
        xml_escape(bridge_url)
    ))
}

/// SIP-mode document: dial the model's SIP gateway with the credential as
/// the user part. `sips:` implies TLS and omits the transport parameter.
pub fn sip_document(
    token: &str,
    gateway_host: &str,
    scheme: Option<&str>,
    transport: Option<&str>,
    port: Option<u16>,
    action_url: Option<&str>,
) -> String {
    let secure = matches!(scheme, Some("sips"));
    let scheme = if secure { "sips" } else { "sip" };
    let transport = match transport {
        Some(t @ ("tls" | "tcp" | "udp")) => t,
        _ => "tls",
    };
    let port = match port {
        Some(p) if p > 0 => p,
        _ => DEFAULT_SIP_TLS_PORT,
    };

    let mut uri = format!("{}:{}@{}:{}", scheme, token, gateway_host, port);
    if !secure {
        uri.push_str(&format!(";transport={}", transport));
    }

    let dial_attrs = match action_url {
        Some(url) => format!(" action=\"{}\" method=\"POST\"", xml_escape(url)),
        None => String::new(),
    };
    document(&format!(
        "<Dial{}><Sip>{}</Sip></Dial>",
        dial_attrs,
        xml_escape(&uri)
    ))
}

/// Simple-mode document: a static spoken message
pub fn simple_document(message: &str) -> String {
    document(&format!("<Say>{}</Say>", xml_escape(message)))
}

/// Spoken error for a failed mint; fail closed, never emit a bridge URL
pub fn unavailable_document() -> String {
    simple_document(SERVICE_UNAVAILABLE_MESSAGE)
}

/// 403 body for a failed signature check
pub fn forbidden_document() -> String {
    document("<Say>Forbidden</Say>")
}

/// Hang up after a successful dial leg
pub fn hangup_document() -> String {
    document("<Hangup/>")
}

/// Bridge WebSocket URL for the stream document.
///
/// The credential goes in a path segment by default; some carriers strip
/// query strings. `in_query` switches to `?secret=`.
pub fn bridge_stream_url(deploy: &DeployConfig, token: &str, in_query: bool) -> Option<String> {
    let origin = deploy
        .external_bridge_wss_url
        .clone()
        .or_else(|| {
            deploy.public_base_url.as_ref().map(|base| {
                base.replacen("https://", "wss://", 1)
                    .replacen("http://", "ws://", 1)
            })
        })?;
    let origin = origin.trim_end_matches('/');
    let encoded = urlencode(token);
    Some(if in_query {
        format!("{}/stream/twilio?secret={}", origin, encoded)
    } else {
        format!("{}/stream/twilio/{}", origin, encoded)
    })
}

/// Percent-encode a credential for URL embedding
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Verify a carrier request signature: HMAC-SHA1 over the full request URL
/// followed by the form parameters sorted by key, base64-encoded, compared
/// in constant time.
pub fn verify_carrier_signature(
    auth_token: &str,
    url: &str,
    form_params: &[(String, String)],
    signature: &str,
) -> bool {
    let mut sorted: Vec<&(String, String)> = form_params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut payload = String::from(url);
    for (key, value) in sorted {
        payload.push_str(key);
        payload.push_str(value);
    }

    let mut mac = match HmacSha1::new_from_slice(auth_token.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload.as_bytes());
    let expected = BASE64.encode(mac.finalize().into_bytes());

    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deploy() -> DeployConfig {
        DeployConfig {
            public_base_url: Some("https://host.example".to_string()),
            external_bridge_wss_url: None,
            twiml_default_mode: None,
            sip_gateway_host: "sip.api.openai.com".to_string(),
        }
    }

    #[test]
    fn test_xml_escape_special_chars() {
        assert_eq!(
            xml_escape(r#"<a href="x">&'"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&apos;"
        );
        assert_eq!(xml_escape("a\u{1}b"), "a&#x1;b");
    }

    #[test]
    fn test_stream_document_shape() {
        let url = bridge_stream_url(&deploy(), "ek_X", false).unwrap();
        assert_eq!(url, "wss://host.example/stream/twilio/ek_X");
        let doc = stream_document(&url);
        assert!(doc.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(doc.contains("<Start><Stream url=\"wss://host.example/stream/twilio/ek_X\"/></Start>"));
        assert!(doc.contains("<Pause length=\"60\"/>"));
    }

    #[test]
    fn test_stream_url_query_placement() {
        let url = bridge_stream_url(&deploy(), "ek/X", true).unwrap();
        assert_eq!(url, "wss://host.example/stream/twilio?secret=ek%2FX");
    }

    #[test]
    fn test_stream_url_prefers_external_bridge() {
        let mut d = deploy();
        d.external_bridge_wss_url = Some("wss://bridge.example".to_string());
        let url = bridge_stream_url(&d, "tok", false).unwrap();
        assert_eq!(url, "wss://bridge.example/stream/twilio/tok");
    }

    #[test]
    fn test_sip_document_default_tls() {
        let doc = sip_document("ek_X", "sip.api.openai.com", None, None, None, None);
        assert!(doc.contains("<Dial><Sip>sip:ek_X@sip.api.openai.com:5061;transport=tls</Sip></Dial>"));
    }

    #[test]
    fn test_sips_scheme_omits_transport() {
        let doc = sip_document("ek_X", "gw.example", Some("sips"), Some("tcp"), Some(5062), None);
        assert!(doc.contains("<Sip>sips:ek_X@gw.example:5062</Sip>"));
        assert!(!doc.contains("transport="));
    }

    #[test]
    fn test_sip_action_attribute() {
        let doc = sip_document("t", "gw", None, None, None, Some("https://host.example/twiml/action"));
        assert!(doc.contains("<Dial action=\"https://host.example/twiml/action\" method=\"POST\">"));
    }

    #[test]
    fn test_simple_document_escapes_user_text() {
        let doc = simple_document("a < b & c");
        assert!(doc.contains("<Say>a &lt; b &amp; c</Say>"));
    }

    #[test]
    fn test_mode_resolution() {
        let mut d = deploy();
        assert_eq!(Mode::resolve(Some("stream"), &d), Mode::Stream);
        assert_eq!(Mode::resolve(Some("bogus"), &d), Mode::Sip);
        d.twiml_default_mode = Some("simple".to_string());
        assert_eq!(Mode::resolve(None, &d), Mode::Simple);
        assert_eq!(Mode::resolve(Some("bogus"), &d), Mode::Simple);
    }

    #[test]
    fn test_signature_roundtrip() {
        let url = "https://host.example/twiml";
        let params = vec![
            ("CallSid".to_string(), "CA1".to_string()),
            ("AccountSid".to_string(), "AC1".to_string()),
        ];
        // Compute the expected signature with the same primitive
        let mut mac = HmacSha1::new_from_slice(b"authtoken").unwrap();
        mac.update(b"https://host.example/twimlAccountSidAC1CallSidCA1");
        let signature = BASE64.encode(mac.finalize().into_bytes());

        assert!(verify_carrier_signature("authtoken", url, &params, &signature));
        assert!(!verify_carrier_signature("authtoken", url, &params, "bogus"));
        assert!(!verify_carrier_signature("other", url, &params, &signature));
    }
}
