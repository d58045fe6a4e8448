//! `Sec-WebSocket-Extensions` negotiation.
//!
//! The only registered extension is permessage-deflate (RFC7692). Offers are
//! tried in the order the client listed them and the first one whose
//! parameters validate is accepted.

use tether_types::{Result, TetherError};
use tracing::debug;

use crate::settings::WebSocketSettings;

pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

const MIN_WINDOW_BITS: u8 = 8;
const MAX_WINDOW_BITS: u8 = 15;

/// Parameters in force once permessage-deflate was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateParameters {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
    pub client_max_window_bits: Option<u8>,
    pub server_max_window_bits: u8,
}

impl Default for DeflateParameters {
    fn default() -> Self {
        Self {
            client_no_context_takeover: true,
            server_no_context_takeover: true,
            client_max_window_bits: None,
            server_max_window_bits: MAX_WINDOW_BITS,
        }
    }
}

impl DeflateParameters {
    /// Value of the `Sec-WebSocket-Extensions` response header.
    pub fn response_header(&self) -> String {
        format!(
            "{PERMESSAGE_DEFLATE}; client_no_context_takeover; server_no_context_takeover; \
             server_max_window_bits={}",
            self.server_max_window_bits
        )
    }
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedExtension {
    pub deflate: DeflateParameters,
    pub response: String,
}

/// A single offer: extension name plus `(param, value)` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    pub name: String,
    pub params: Vec<(String, Option<String>)>,
}

/// Split a header value into offers. Empty entries are skipped.
pub fn parse_offers(header: &str) -> Vec<ExtensionOffer> {
    header
        .split(',')
        .filter_map(|offer| {
            let mut parts = offer.split(';').map(str::trim);
            let name = parts.next().filter(|n| !n.is_empty())?;
            let params = parts
                .filter(|p| !p.is_empty())
                .map(|p| match p.split_once('=') {
                    Some((key, value)) => (key.trim().to_ascii_lowercase(), Some(value.trim().to_string())),
                    None => (p.to_ascii_lowercase(), None),
                })
                .collect();
            Some(ExtensionOffer {
                name: name.to_ascii_lowercase(),
                params,
            })
        })
        .collect()
}

fn parse_window_bits(name: &str, value: &str) -> Result<u8> {
    let unquoted = value.trim_matches('"');
    let bits: u8 = unquoted
        .parse()
        .map_err(|_| TetherError::InvalidArgument(format!("{name}: '{value}' is not a number")))?;
    if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        return Err(TetherError::InvalidArgument(format!(
            "{name}: {bits} is outside [{MIN_WINDOW_BITS}, {MAX_WINDOW_BITS}]"
        )));
    }
    Ok(bits)
}

/// Validate one permessage-deflate offer against the server configuration.
pub fn validate_deflate_offer(offer: &ExtensionOffer, settings: &WebSocketSettings) -> Result<DeflateParameters> {
    let mut params = DeflateParameters {
        server_max_window_bits: settings.server_max_window_bits.clamp(MIN_WINDOW_BITS, MAX_WINDOW_BITS),
        ..DeflateParameters::default()
    };
    for (key, value) in &offer.params {
        match key.as_str() {
            "client_no_context_takeover" | "server_no_context_takeover" => {
                if value.is_some() {
                    return Err(TetherError::InvalidArgument(format!("{key} takes no value")));
                }
            }
            "client_max_window_bits" => {
                if let Some(value) = value {
                    params.client_max_window_bits = Some(parse_window_bits(key, value)?);
                }
            }
            "server_max_window_bits" => {
                if let Some(value) = value {
                    let requested = parse_window_bits(key, value)?;
                    params.server_max_window_bits = params.server_max_window_bits.min(requested);
                }
            }
            other => {
                return Err(TetherError::InvalidArgument(format!("unknown parameter {other}")));
            }
        }
    }
    Ok(params)
}

/// Pick the first acceptable offer. `None` means no extension is used.
pub fn negotiate(header: &str, settings: &WebSocketSettings) -> Option<NegotiatedExtension> {
    if !settings.permessage_deflate_enabled {
        return None;
    }
    for offer in parse_offers(header) {
        if offer.name != PERMESSAGE_DEFLATE {
            continue;
        }
        match validate_deflate_offer(&offer, settings) {
            Ok(deflate) => {
                return Some(NegotiatedExtension {
                    response: deflate.response_header(),
                    deflate,
                });
            }
            Err(e) => debug!(error = %e, "rejecting permessage-deflate offer"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> WebSocketSettings {
        WebSocketSettings::default()
    }

    #[test]
    fn parses_offers_and_params() {
        let offers = parse_offers("permessage-deflate; client_max_window_bits, x-webkit-deflate-frame");
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].name, "permessage-deflate");
        assert_eq!(offers[0].params, vec![("client_max_window_bits".to_string(), None)]);
        assert_eq!(offers[1].name, "x-webkit-deflate-frame");
    }

    #[test]
    fn window_bits_bounds() {
        for param in ["server_max_window_bits", "client_max_window_bits"] {
            for bits in [7, 16] {
                let header = format!("permessage-deflate; {param}={bits}");
                assert!(negotiate(&header, &settings()).is_none(), "{param}={bits} should fail");
            }
        }
        for bits in 8..=15 {
            let header = format!("permessage-deflate; client_max_window_bits={bits}");
            let negotiated = negotiate(&header, &settings()).unwrap();
            assert_eq!(negotiated.deflate.client_max_window_bits, Some(bits));
        }
        for bits in 8..=15 {
            let header = format!("permessage-deflate; server_max_window_bits={bits}");
            let negotiated = negotiate(&header, &settings()).unwrap();
            assert_eq!(negotiated.deflate.server_max_window_bits, bits);
        }
        let negotiated = negotiate("permessage-deflate", &settings()).unwrap();
        assert_eq!(negotiated.deflate.server_max_window_bits, 15);
    }

    #[test]
    fn quoted_values_are_accepted() {
        let negotiated = negotiate("permessage-deflate; client_max_window_bits=\"10\"", &settings()).unwrap();
        assert_eq!(negotiated.deflate.client_max_window_bits, Some(10));
    }

    #[test]
    fn no_context_takeover_must_not_carry_a_value() {
        assert!(negotiate("permessage-deflate; server_no_context_takeover=1", &settings()).is_none());
        assert!(negotiate("permessage-deflate; server_no_context_takeover", &settings()).is_some());
    }

    #[test]
    fn unknown_parameter_fails_offer_and_falls_back() {
        let header = "permessage-deflate; bogus, permessage-deflate; server_max_window_bits=10";
        let negotiated = negotiate(header, &settings()).unwrap();
        assert_eq!(negotiated.deflate.server_max_window_bits, 10);
    }

    #[test]
    fn response_uses_configured_minimum() {
        let mut settings = settings();
        settings.server_max_window_bits = 12;
        let negotiated = negotiate("permessage-deflate; server_max_window_bits=14", &settings).unwrap();
        assert_eq!(
            negotiated.response,
            "permessage-deflate; client_no_context_takeover; server_no_context_takeover; server_max_window_bits=12"
        );
    }

    #[test]
    fn disabled_setting_skips_negotiation() {
        let mut settings = settings();
        settings.permessage_deflate_enabled = false;
        assert!(negotiate("permessage-deflate", &settings).is_none());
    }
}
