//! REST transport for the host node.
//!
//! Talks to the node's REST proxy over TLS with the node certificate
//! pinned and the macaroon sent as gRPC metadata. Server-streaming
//! endpoints arrive as newline-delimited JSON envelopes; the bidirectional
//! interceptor runs over the proxy's websocket bridge with the macaroon
//! carried in the websocket subprotocol.

use std::collections::HashMap;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue as WsHeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tracing::{debug, warn};

use async_trait::async_trait;

use bw_core::{CircuitKey, InFlightHtlc, PeerId};

use crate::{
    Channel, InterceptResponse, InterceptedHtlc, InterceptorChannels, LndClient, LndError,
    NodeInfo, ResolvedHtlc, RPC_TIMEOUT,
};

const MACAROON_HEADER: &str = "grpc-metadata-macaroon";
const STREAM_BUFFER: usize = 256;

/// Client for the host node's REST proxy.
pub struct LndRestClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    macaroon_hex: String,
    tls: Arc<rustls::ClientConfig>,
}

impl LndRestClient {
    /// Build a client for `address` using the node's TLS certificate and
    /// admin macaroon. Fails fast on unreadable credentials; the first RPC
    /// surfaces connectivity problems.
    pub fn new(
        address: &str,
        tls_cert_path: &Path,
        macaroon_path: &Path,
    ) -> Result<Self, LndError> {
        let cert_pem = std::fs::read(tls_cert_path).map_err(|e| {
            LndError::Credentials(format!("cannot read {}: {e}", tls_cert_path.display()))
        })?;
        let macaroon = std::fs::read(macaroon_path).map_err(|e| {
            LndError::Credentials(format!("cannot read {}: {e}", macaroon_path.display()))
        })?;
        let macaroon_hex = hex::encode(macaroon);

        let mut headers = HeaderMap::new();
        let mut macaroon_value = HeaderValue::from_str(&macaroon_hex)
            .map_err(|e| LndError::Credentials(e.to_string()))?;
        macaroon_value.set_sensitive(true);
        headers.insert(MACAROON_HEADER, macaroon_value);

        let certificate = reqwest::Certificate::from_pem(&cert_pem)
            .map_err(|e| LndError::Credentials(format!("invalid tls certificate: {e}")))?;
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .add_root_certificate(certificate)
            .default_headers(headers)
            .build()?;

        let tls = Arc::new(websocket_tls_config(&cert_pem)?);

        let base_url = base_url(address);
        let ws_url = base_url.replacen("http", "ws", 1);

        Ok(Self {
            http,
            base_url,
            ws_url,
            macaroon_hex,
            tls,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, LndError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(url)
            .timeout(RPC_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn all_channels(&self) -> Result<Vec<RestChannel>, LndError> {
        let response: ListChannelsResponse = self.get_json("/v1/channels").await?;
        Ok(response.channels)
    }
}

#[async_trait]
impl LndClient for LndRestClient {
    async fn get_info(&self) -> Result<NodeInfo, LndError> {
        let info: GetInfoResponse = self.get_json("/v1/getinfo").await?;
        let node_key = info
            .identity_pubkey
            .parse()
            .map_err(|e| LndError::Decode(format!("identity key: {e}")))?;

        Ok(NodeInfo {
            node_key,
            alias: info.alias,
            version: info.version,
        })
    }

    async fn list_channels(&self) -> Result<HashMap<u64, Channel>, LndError> {
        let mut channels = HashMap::new();
        for channel in self.all_channels().await? {
            let peer = channel
                .remote_pubkey
                .parse()
                .map_err(|e| LndError::Decode(format!("peer key: {e}")))?;
            channels.insert(
                channel.chan_id,
                Channel {
                    peer,
                    initiator: channel.initiator,
                },
            );
        }
        Ok(channels)
    }

    async fn list_closed_channels(&self) -> Result<HashMap<u64, Channel>, LndError> {
        let response: ClosedChannelsResponse = self.get_json("/v1/channels/closed").await?;

        let mut channels = HashMap::new();
        for channel in response.channels {
            let peer = channel
                .remote_pubkey
                .parse()
                .map_err(|e| LndError::Decode(format!("peer key: {e}")))?;
            // Only a definitive remote open counts as peer-initiated.
            let initiator = channel.open_initiator.as_str() != "INITIATOR_REMOTE";
            channels.insert(channel.chan_id, Channel { peer, initiator });
        }
        Ok(channels)
    }

    async fn get_node_alias(&self, peer: PeerId) -> Result<Option<String>, LndError> {
        let url = format!("{}/v1/graph/node/{peer}", self.base_url);
        let response = self.http.get(url).timeout(RPC_TIMEOUT).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if body.contains("unable to find node") {
                return Ok(None);
            }
            return Err(LndError::Transport(format!("node lookup: {status}: {body}")));
        }

        let info: NodeInfoResponse = response
            .json()
            .await
            .map_err(|e| LndError::Decode(e.to_string()))?;
        Ok(info.node.map(|n| n.alias))
    }

    async fn subscribe_htlc_events(&self) -> Result<mpsc::Receiver<ResolvedHtlc>, LndError> {
        let url = format!("{}/v2/router/htlcevents", self.base_url);
        let response = self.http.get(url).send().await?.error_for_status()?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        warn!(error = %err, "htlc event stream failed");
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let Some(resolved) = decode_event_line(&line) else {
                        continue;
                    };
                    if tx.send(resolved).await.is_err() {
                        return;
                    }
                }
            }
            // Dropping tx closes the receiver, which the daemon treats as a
            // fatal stream loss.
        });

        Ok(rx)
    }

    async fn htlc_interceptor(&self) -> Result<InterceptorChannels, LndError> {
        // The REST proxy bridges bidirectional streams over websockets; the
        // macaroon travels in the subprotocol header.
        let url = format!("{}/v2/router/htlcinterceptor?method=POST", self.ws_url);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| LndError::Websocket(e.to_string()))?;
        let protocol = format!("Grpc-Metadata-Macaroon+{}", self.macaroon_hex);
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            WsHeaderValue::from_str(&protocol)
                .map_err(|e| LndError::Credentials(e.to_string()))?,
        );

        let connector = Connector::Rustls(Arc::clone(&self.tls));
        let (socket, _) = connect_async_tls_with_config(request, None, false, Some(connector))
            .await
            .map_err(|e| LndError::Websocket(e.to_string()))?;
        let (mut write, mut read) = socket.split();

        let (request_tx, request_rx) = mpsc::channel(STREAM_BUFFER);
        let (response_tx, mut response_rx) = mpsc::channel::<InterceptResponse>(STREAM_BUFFER);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = read.next() => {
                        let message = match message {
                            Some(Ok(message)) => message,
                            Some(Err(err)) => {
                                warn!(error = %err, "interceptor stream failed");
                                break;
                            }
                            None => break,
                        };

                        let text = match message {
                            Message::Text(text) => text,
                            Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                                Ok(text) => text,
                                Err(_) => continue,
                            },
                            Message::Close(_) => break,
                            _ => continue,
                        };

                        let Some(intercepted) = decode_intercept_line(text.as_bytes()) else {
                            continue;
                        };
                        if request_tx.send(intercepted).await.is_err() {
                            break;
                        }
                    }

                    response = response_rx.recv() => {
                        let Some(response) = response else { break };
                        let body = encode_intercept_response(&response);
                        if let Err(err) = write.send(Message::Text(body)).await {
                            warn!(error = %err, "interceptor send failed");
                            break;
                        }
                    }
                }
            }
            // Closing without responding leaves in-flight HTLCs for the host
            // to fail.
            let _ = write.send(Message::Close(None)).await;
        });

        Ok(InterceptorChannels {
            requests: request_rx,
            responses: response_tx,
        })
    }

    async fn pending_incoming_htlcs(
        &self,
        peer: Option<PeerId>,
    ) -> Result<HashMap<PeerId, HashMap<CircuitKey, InFlightHtlc>>, LndError> {
        let mut pending: HashMap<PeerId, HashMap<CircuitKey, InFlightHtlc>> = HashMap::new();

        for channel in self.all_channels().await? {
            let channel_peer: PeerId = channel
                .remote_pubkey
                .parse()
                .map_err(|e| LndError::Decode(format!("peer key: {e}")))?;
            if peer.is_some_and(|p| p != channel_peer) {
                continue;
            }

            for htlc in channel.pending_htlcs {
                if !htlc.incoming {
                    continue;
                }

                let key = CircuitKey::new(channel.chan_id, htlc.htlc_index);
                pending.entry(channel_peer).or_default().insert(
                    key,
                    InFlightHtlc {
                        add_time: None,
                        incoming_msat: htlc.amount_sat * 1000,
                        outgoing_msat: 0,
                    },
                );
            }
        }

        Ok(pending)
    }
}

fn base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("https://{address}")
    }
}

fn websocket_tls_config(cert_pem: &[u8]) -> Result<rustls::ClientConfig, LndError> {
    let mut roots = rustls::RootCertStore::empty();
    let mut reader = BufReader::new(cert_pem);
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| LndError::Credentials(format!("invalid certificate: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| LndError::Credentials(format!("untrusted certificate: {e}")))?;
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn decode_event_line(line: &[u8]) -> Option<ResolvedHtlc> {
    let line = std::str::from_utf8(line).ok()?.trim();
    if line.is_empty() {
        return None;
    }

    let envelope: StreamEnvelope<RestHtlcEvent> = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(error = %err, "skipping undecodable htlc event");
            return None;
        }
    };
    let event = envelope.result?;

    if event.event_type != "FORWARD" {
        return None;
    }
    let settled = match (
        event.settle_event.is_some(),
        event.forward_fail_event.is_some() || event.link_fail_event.is_some(),
    ) {
        (true, _) => true,
        (false, true) => false,
        // Not a terminal outcome (e.g. the initial forward event).
        (false, false) => return None,
    };

    Some(ResolvedHtlc {
        incoming_circuit: CircuitKey::new(event.incoming_channel_id, event.incoming_htlc_id),
        outgoing_circuit: CircuitKey::new(event.outgoing_channel_id, event.outgoing_htlc_id),
        settled,
        timestamp: Utc.timestamp_nanos(event.timestamp_ns),
    })
}

fn decode_intercept_line(line: &[u8]) -> Option<InterceptedHtlc> {
    let envelope: StreamEnvelope<RestInterceptRequest> = match serde_json::from_slice(line) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(error = %err, "skipping undecodable intercept request");
            return None;
        }
    };
    let request = envelope.result?;
    let key = request.incoming_circuit_key?;

    Some(InterceptedHtlc {
        incoming_circuit: CircuitKey::new(key.chan_id, key.htlc_id),
        incoming_msat: request.incoming_amount_msat,
        outgoing_msat: request.outgoing_amount_msat,
    })
}

fn encode_intercept_response(response: &InterceptResponse) -> String {
    serde_json::json!({
        "incoming_circuit_key": {
            "chan_id": response.incoming_circuit.channel.to_string(),
            "htlc_id": response.incoming_circuit.htlc.to_string(),
        },
        "action": if response.resume { "RESUME" } else { "FAIL" },
    })
    .to_string()
}

// The proxy renders proto uint64 fields as JSON strings; accept both.
fn u64_field<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn i64_field<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
struct StreamEnvelope<T> {
    result: Option<T>,
}

#[derive(Deserialize)]
struct GetInfoResponse {
    identity_pubkey: String,
    #[serde(default)]
    alias: String,
    #[serde(default)]
    version: String,
}

#[derive(Deserialize)]
struct ListChannelsResponse {
    #[serde(default)]
    channels: Vec<RestChannel>,
}

#[derive(Deserialize)]
struct RestChannel {
    #[serde(default, deserialize_with = "u64_field")]
    chan_id: u64,
    remote_pubkey: String,
    #[serde(default)]
    initiator: bool,
    #[serde(default)]
    pending_htlcs: Vec<RestPendingHtlc>,
}

#[derive(Deserialize)]
struct RestPendingHtlc {
    #[serde(default)]
    incoming: bool,
    #[serde(default, rename = "amount", deserialize_with = "u64_field")]
    amount_sat: u64,
    #[serde(default, deserialize_with = "u64_field")]
    htlc_index: u64,
}

#[derive(Deserialize)]
struct ClosedChannelsResponse {
    #[serde(default)]
    channels: Vec<RestClosedChannel>,
}

#[derive(Deserialize)]
struct RestClosedChannel {
    #[serde(default, deserialize_with = "u64_field")]
    chan_id: u64,
    remote_pubkey: String,
    #[serde(default)]
    open_initiator: String,
}

#[derive(Deserialize)]
struct NodeInfoResponse {
    node: Option<RestNode>,
}

#[derive(Deserialize)]
struct RestNode {
    #[serde(default)]
    alias: String,
}

#[derive(Deserialize)]
struct RestHtlcEvent {
    #[serde(default)]
    event_type: String,
    #[serde(default, deserialize_with = "u64_field")]
    incoming_channel_id: u64,
    #[serde(default, deserialize_with = "u64_field")]
    incoming_htlc_id: u64,
    #[serde(default, deserialize_with = "u64_field")]
    outgoing_channel_id: u64,
    #[serde(default, deserialize_with = "u64_field")]
    outgoing_htlc_id: u64,
    #[serde(default, deserialize_with = "i64_field")]
    timestamp_ns: i64,
    settle_event: Option<serde_json::Value>,
    forward_fail_event: Option<serde_json::Value>,
    link_fail_event: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RestCircuitKey {
    #[serde(default, deserialize_with = "u64_field")]
    chan_id: u64,
    #[serde(default, deserialize_with = "u64_field")]
    htlc_id: u64,
}

#[derive(Deserialize)]
struct RestInterceptRequest {
    incoming_circuit_key: Option<RestCircuitKey>,
    #[serde(default, deserialize_with = "u64_field")]
    incoming_amount_msat: u64,
    #[serde(default, deserialize_with = "u64_field")]
    outgoing_amount_msat: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_settle_event() {
        let line = br#"{"result":{"incoming_channel_id":"2","incoming_htlc_id":"5","outgoing_channel_id":"7","outgoing_htlc_id":"0","timestamp_ns":"1700000000000000000","event_type":"FORWARD","settle_event":{"preimage":"00"}}}"#;

        let resolved = decode_event_line(line).unwrap();
        assert_eq!(resolved.incoming_circuit, CircuitKey::new(2, 5));
        assert_eq!(resolved.outgoing_circuit, CircuitKey::new(7, 0));
        assert!(resolved.settled);
    }

    #[test]
    fn decodes_link_fail_as_unsettled() {
        let line = br#"{"result":{"incoming_channel_id":"2","incoming_htlc_id":"6","event_type":"FORWARD","link_fail_event":{"wire_failure":"TEMPORARY_CHANNEL_FAILURE"}}}"#;

        let resolved = decode_event_line(line).unwrap();
        assert_eq!(resolved.incoming_circuit, CircuitKey::new(2, 6));
        assert_eq!(resolved.outgoing_circuit, CircuitKey::new(0, 0));
        assert!(!resolved.settled);
    }

    #[test]
    fn skips_non_terminal_events() {
        let forward = br#"{"result":{"incoming_channel_id":"2","incoming_htlc_id":"5","event_type":"FORWARD","forward_event":{}}}"#;
        assert!(decode_event_line(forward).is_none());

        let send = br#"{"result":{"incoming_channel_id":"2","incoming_htlc_id":"5","event_type":"SEND","settle_event":{}}}"#;
        assert!(decode_event_line(send).is_none());
    }

    #[test]
    fn decodes_intercept_request() {
        let line = br#"{"result":{"incoming_circuit_key":{"chan_id":"2","htlc_id":"5"},"incoming_amount_msat":"100000","outgoing_amount_msat":"99000"}}"#;

        let intercepted = decode_intercept_line(line).unwrap();
        assert_eq!(intercepted.incoming_circuit, CircuitKey::new(2, 5));
        assert_eq!(intercepted.incoming_msat, 100_000);
        assert_eq!(intercepted.outgoing_msat, 99_000);
    }

    #[test]
    fn encodes_response_actions() {
        let resume = encode_intercept_response(&InterceptResponse {
            incoming_circuit: CircuitKey::new(2, 5),
            resume: true,
        });
        assert!(resume.contains("\"RESUME\""));
        assert!(resume.contains("\"chan_id\":\"2\""));

        let fail = encode_intercept_response(&InterceptResponse {
            incoming_circuit: CircuitKey::new(2, 5),
            resume: false,
        });
        assert!(fail.contains("\"FAIL\""));
    }

    #[test]
    fn base_url_normalization() {
        assert_eq!(base_url("localhost:8080"), "https://localhost:8080");
        assert_eq!(base_url("https://node:8080/"), "https://node:8080");
        assert_eq!(base_url("http://node:8080"), "http://node:8080");
    }
}
