// tokio-tungstenite transport against the relay's shard endpoint.

use std::net::IpAddr;

use decksync_common::types::ShardId;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use super::{LinkMessage, ShardConnector, ShardLink, TransportFuture};
use crate::error::TransportError;

/// Opens `{relay_url}/v1/shards/{shard_id}/ws` per shard.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base: Url,
}

impl WsConnector {
    /// Accepts `ws`/`wss` (or `http`/`https`, mapped to the websocket scheme).
    /// Plain-text schemes are only allowed for loopback hosts.
    pub fn new(relay_url: &str) -> Result<Self, TransportError> {
        let invalid = |reason: String| TransportError::InvalidUrl {
            url: relay_url.to_string(),
            reason,
        };
        let mut base = Url::parse(relay_url).map_err(|error| invalid(error.to_string()))?;
        let scheme = match base.scheme() {
            "wss" | "https" => "wss",
            "ws" | "http" if is_loopback_host(base.host_str()) => "ws",
            "ws" | "http" => {
                return Err(invalid("ws is allowed only for localhost testing".into()));
            }
            other => return Err(invalid(format!("unsupported scheme `{other}`"))),
        };
        base.set_scheme(scheme).map_err(|()| invalid("cannot switch scheme".into()))?;
        Ok(Self { base })
    }

    pub fn shard_url(&self, shard_id: &ShardId) -> Url {
        let mut url = self.base.clone();
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{prefix}/v1/shards/{shard_id}/ws"));
        url
    }
}

impl ShardConnector for WsConnector {
    fn connect<'a>(&'a self, shard_id: &'a ShardId) -> TransportFuture<'a, Box<dyn ShardLink>> {
        Box::pin(async move {
            let url = self.shard_url(shard_id);
            let (stream, _) = connect_async(url.as_str())
                .await
                .map_err(|error| TransportError::Connect(error.to_string()))?;
            debug!(shard_id = %shard_id, url = %url, "websocket connected");
            Ok(Box::new(WsLink { stream }) as Box<dyn ShardLink>)
        })
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ShardLink for WsLink {
    fn send(&mut self, message: LinkMessage) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let frame = match message {
                LinkMessage::Binary(bytes) => WsMessage::Binary(bytes.into()),
                LinkMessage::Text(text) => WsMessage::Text(text.into()),
            };
            self.stream.send(frame).await.map_err(|error| TransportError::Send(error.to_string()))
        })
    }

    fn recv(&mut self) -> TransportFuture<'_, Option<LinkMessage>> {
        Box::pin(async move {
            loop {
                let Some(frame) = self.stream.next().await else {
                    return Ok(None);
                };
                match frame.map_err(|error| TransportError::Receive(error.to_string()))? {
                    WsMessage::Binary(bytes) => return Ok(Some(LinkMessage::Binary(bytes.to_vec()))),
                    WsMessage::Text(text) => {
                        return Ok(Some(LinkMessage::Text(text.as_str().to_owned())))
                    }
                    WsMessage::Close(_) => return Ok(None),
                    // tungstenite answers pings itself.
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
                }
            }
        })
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.stream.close(None).await.map_err(|error| TransportError::Send(error.to_string()))
        })
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(id: &str) -> ShardId {
        ShardId::new(id).unwrap()
    }

    #[test]
    fn shard_url_joins_base_path() {
        let connector = WsConnector::new("wss://relay.example.com/decks/").unwrap();
        assert_eq!(
            connector.shard_url(&shard("page-1")).as_str(),
            "wss://relay.example.com/decks/v1/shards/page-1/ws"
        );
    }

    #[test]
    fn http_schemes_map_to_websocket_schemes() {
        let connector = WsConnector::new("http://127.0.0.1:8080").unwrap();
        assert_eq!(connector.shard_url(&shard("a")).as_str(), "ws://127.0.0.1:8080/v1/shards/a/ws");
        let connector = WsConnector::new("https://relay.example.com").unwrap();
        assert!(connector.shard_url(&shard("a")).as_str().starts_with("wss://"));
    }

    #[test]
    fn plaintext_is_loopback_only() {
        assert!(WsConnector::new("ws://localhost:8080").is_ok());
        assert!(WsConnector::new("ws://[::1]:8080").is_ok());
        assert!(matches!(
            WsConnector::new("ws://relay.example.com"),
            Err(TransportError::InvalidUrl { .. })
        ));
        assert!(WsConnector::new("ftp://relay.example.com").is_err());
        assert!(WsConnector::new("not a url").is_err());
    }
}
