//! Negotiation (C4): `POST <base>/negotiate`, transport/encoding selection,
//! connection-identity threading into the transport URL.

use crate::error::HubConnectionError;
use crate::transport::{TransferFormat, TransportKind};
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct AvailableTransport {
    pub transport: String,
    #[serde(rename = "transferFormats")]
    pub transfer_formats: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NegotiateResponse {
    #[serde(rename = "negotiateVersion", default)]
    pub negotiate_version: u32,
    #[serde(rename = "connectionId", default)]
    pub connection_id: Option<String>,
    #[serde(rename = "connectionToken", default)]
    pub connection_token: Option<String>,
    #[serde(rename = "availableTransports", default)]
    pub available_transports: Vec<AvailableTransport>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(rename = "accessToken", default)]
    pub access_token: Option<String>,
}

impl NegotiateResponse {
    /// The identity threaded into subsequent URLs: `connectionToken` under
    /// negotiate v1, else `connectionId`.
    pub fn identity(&self) -> Result<&str, HubConnectionError> {
        let id = if self.negotiate_version >= 1 {
            self.connection_token.as_deref().or(self.connection_id.as_deref())
        } else {
            self.connection_id.as_deref()
        };
        id.ok_or_else(|| {
            HubConnectionError::NegotiateValidation("negotiate response carried no connection identity".to_owned())
        })
    }
}

/// Rewrite `ws`/`wss` to `http`/`https` (a no-op for URLs already on an HTTP
/// scheme), preserving host, path, and query.
pub fn to_http_scheme(url: &str) -> Result<Url, HubConnectionError> {
    let mut parsed = Url::parse(url)
        .map_err(|e| HubConnectionError::InvalidConfig(format!("invalid hub url: {e}")))?;
    let scheme = match parsed.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => other,
    }
    .to_owned();
    parsed
        .set_scheme(&scheme)
        .map_err(|_| HubConnectionError::InvalidConfig("could not normalize hub url scheme".to_owned()))?;
    Ok(parsed)
}

/// `ws`/`wss` normalized the other direction, for building the transport's
/// own connect URL once negotiation selects WebSockets.
pub fn to_ws_scheme(url: &Url) -> Url {
    let mut out = url.clone();
    let scheme = match out.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => other,
    }
    .to_owned();
    let _ = out.set_scheme(&scheme);
    out
}

/// `<base>/negotiate?negotiateVersion=<v>`, preserving any query the caller
/// already attached to `base`.
fn negotiate_url(base: &Url, negotiate_version: u32) -> Url {
    let mut url = base.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .unwrap_or_else(|_| unreachable!("http/https urls always support path segments"));
        segments.pop_if_empty().push("negotiate");
    }
    url.query_pairs_mut()
        .append_pair("negotiateVersion", &negotiate_version.to_string());
    url
}

pub struct NegotiateOutcome {
    pub response: NegotiateResponse,
    /// The (already http/https-scheme) base URL with `id=<identity>` set,
    /// ready for `to_ws_scheme` or direct use by the HTTP transports.
    pub connection_url: Url,
}

/// Perform one negotiate round-trip, returning a base URL carrying the
/// server-assigned connection identity.
pub async fn negotiate(
    client: &reqwest::Client,
    hub_url: &str,
    headers: &HashMap<String, String>,
) -> Result<NegotiateOutcome, HubConnectionError> {
    let base = to_http_scheme(hub_url)?;
    let url = negotiate_url(&base, 1);

    let mut req = client.post(url).header("Content-Type", "application/json");
    for (k, v) in headers {
        req = req.header(k, v);
    }
    let resp = req.send().await?;

    match resp.status() {
        reqwest::StatusCode::OK => {}
        reqwest::StatusCode::UNAUTHORIZED => return Err(HubConnectionError::Unauthorized),
        other => {
            return Err(HubConnectionError::Hub {
                status: other.as_u16(),
                detail: "negotiate failed".to_owned(),
            });
        }
    }

    let response: NegotiateResponse = resp
        .json()
        .await
        .map_err(|e| HubConnectionError::NegotiateValidation(e.to_string()))?;

    let connection_url = if let (Some(azure_url), Some(_token)) = (&response.url, &response.access_token) {
        Url::parse(azure_url)
            .map_err(|e| HubConnectionError::NegotiateValidation(format!("invalid azure url: {e}")))?
    } else {
        let identity = response.identity()?.to_owned();
        let mut url = base.clone();
        url.query_pairs_mut().append_pair("id", &identity);
        url
    };

    Ok(NegotiateOutcome {
        response,
        connection_url,
    })
}

/// Choose a transport and transfer format: the caller's preference if it is
/// present in `available`, else the first of WebSockets, ServerSentEvents,
/// LongPolling (in that order) that `available` offers. Each candidate is
/// checked against its own name — unlike the reference factory's
/// long-polling branch, which mistakenly re-tests for ServerSentEvents.
pub fn select_transport(
    preferred: Option<TransportKind>,
    available: &[AvailableTransport],
) -> Option<(TransportKind, TransferFormat)> {
    let find = |kind: TransportKind| {
        available
            .iter()
            .find(|t| t.transport == kind.as_str())
            .map(|t| (kind, pick_format(&t.transfer_formats)))
    };

    if let Some(kind) = preferred {
        if let Some(found) = find(kind) {
            return Some(found);
        }
        return None;
    }

    for kind in [
        TransportKind::WebSockets,
        TransportKind::ServerSentEvents,
        TransportKind::LongPolling,
    ] {
        if let Some(found) = find(kind) {
            return Some(found);
        }
    }
    None
}

fn pick_format(formats: &[String]) -> TransferFormat {
    if formats.iter().any(|f| f == "Binary") {
        TransferFormat::Binary
    } else {
        TransferFormat::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(name: &str, formats: &[&str]) -> AvailableTransport {
        AvailableTransport {
            transport: name.to_owned(),
            transfer_formats: formats.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn to_http_scheme_normalizes_ws_and_wss() {
        assert_eq!(to_http_scheme("ws://host/hub").unwrap().scheme(), "http");
        assert_eq!(to_http_scheme("wss://host/hub").unwrap().scheme(), "https");
        assert_eq!(to_http_scheme("https://host/hub").unwrap().scheme(), "https");
    }

    #[test]
    fn negotiate_url_appends_path_and_preserves_query() {
        let base = Url::parse("http://host/hub?tenant=a").unwrap();
        let url = negotiate_url(&base, 1);
        assert_eq!(url.path(), "/hub/negotiate");
        let pairs: Vec<_> = url.query_pairs().collect();
        assert!(pairs.iter().any(|(k, v)| k == "tenant" && v == "a"));
        assert!(pairs.iter().any(|(k, v)| k == "negotiateVersion" && v == "1"));
    }

    #[test]
    fn select_transport_falls_back_in_correct_order() {
        let available = vec![transport("LongPolling", &["Text"])];
        let chosen = select_transport(None, &available);
        assert_eq!(chosen.unwrap().0, TransportKind::LongPolling);
    }

    #[test]
    fn select_transport_prefers_websockets_when_available() {
        let available = vec![
            transport("LongPolling", &["Text"]),
            transport("WebSockets", &["Text", "Binary"]),
        ];
        let chosen = select_transport(None, &available).unwrap();
        assert_eq!(chosen.0, TransportKind::WebSockets);
        assert_eq!(chosen.1, TransferFormat::Binary);
    }

    #[test]
    fn select_transport_returns_none_when_preference_unavailable() {
        let available = vec![transport("LongPolling", &["Text"])];
        assert!(select_transport(Some(TransportKind::WebSockets), &available).is_none());
    }

    #[test]
    fn identity_prefers_connection_token_under_v1() {
        let resp = NegotiateResponse {
            negotiate_version: 1,
            connection_id: Some("id".into()),
            connection_token: Some("token".into()),
            available_transports: vec![],
            url: None,
            access_token: None,
        };
        assert_eq!(resp.identity().unwrap(), "token");
    }

    #[test]
    fn identity_uses_connection_id_under_v0() {
        let resp = NegotiateResponse {
            negotiate_version: 0,
            connection_id: Some("id".into()),
            connection_token: Some("token".into()),
            available_transports: vec![],
            url: None,
            access_token: None,
        };
        assert_eq!(resp.identity().unwrap(), "id");
    }
}
