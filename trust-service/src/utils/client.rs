use service_core::axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

/// Caller address as resolved by the auth middleware.
///
/// `x-forwarded-for` is read only when the socket peer is a trusted proxy,
/// walking right to left past trusted hops. Otherwise the peer is the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIp(pub Option<String>);

impl ClientIp {
    pub fn from_parts(
        headers: &HeaderMap,
        peer: Option<&ConnectInfo<SocketAddr>>,
        trusted: &[IpAddr],
    ) -> Self {
        let Some(ConnectInfo(peer)) = peer else {
            return ClientIp(None);
        };
        let peer = peer.ip();
        if !trusted.contains(&peer) {
            return ClientIp(Some(peer.to_string()));
        }

        let hops = headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .collect::<Vec<_>>();

        let mut client = peer;
        for hop in hops.iter().rev() {
            match hop.parse::<IpAddr>() {
                Ok(ip) => {
                    client = ip;
                    if !trusted.contains(&ip) {
                        break;
                    }
                }
                // A hop we cannot read was written by something untrusted.
                Err(_) => break,
            }
        }
        ClientIp(Some(client.to_string()))
    }
}

/// Reads the address the auth middleware attached. Unauthenticated routes
/// fall back to the socket peer.
#[async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ip) = parts.extensions.get::<ClientIp>() {
            return Ok(ip.clone());
        }
        Ok(ClientIp::from_parts(
            &parts.headers,
            parts.extensions.get::<ConnectInfo<SocketAddr>>(),
            &[],
        ))
    }
}

pub fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
