//! TLS handshake and ALPN selection (paths A and B).

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::error::TransportError;
use crate::negotiation::{NegotiatedProtocol, NegotiationPath};
use crate::net::tls::{ALPN_H2, ALPN_HTTP11};
use crate::observability::metrics;

/// Map the ALPN outcome to a protocol.
///
/// An empty selection means HTTP/1.1. A plain TLS context never advertises
/// ALPN, so path B is HTTP/1.1 unconditionally.
pub fn select_protocol(path: NegotiationPath, alpn: Option<&[u8]>) -> Result<NegotiatedProtocol, TransportError> {
    if path != NegotiationPath::Alpn {
        return Ok(NegotiatedProtocol::Http11Tls);
    }
    match alpn {
        Some(p) if p == ALPN_H2 => Ok(NegotiatedProtocol::Http2Tls),
        Some(p) if p == ALPN_HTTP11 => Ok(NegotiatedProtocol::Http11Tls),
        None => Ok(NegotiatedProtocol::Http11Tls),
        Some(other) => Err(TransportError::Handshake(format!(
            "unexpected ALPN protocol {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// Complete the server handshake within `timeout` and report the protocol.
pub async fn handshake(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    path: NegotiationPath,
    timeout: Duration,
) -> Result<(TlsStream<TcpStream>, NegotiatedProtocol), TransportError> {
    let outcome = match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => {
            let protocol = select_protocol(path, tls.get_ref().1.alpn_protocol());
            protocol.map(|p| (tls, p))
        }
        Ok(Err(e)) => Err(TransportError::Handshake(e.to_string())),
        Err(_) => Err(TransportError::Handshake(format!(
            "handshake not completed within {}ms",
            timeout.as_millis()
        ))),
    };

    if outcome.is_err() {
        metrics::record_handshake_failure();
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_selection() {
        let alpn = NegotiationPath::Alpn;
        assert_eq!(select_protocol(alpn, Some(b"h2")).unwrap(), NegotiatedProtocol::Http2Tls);
        assert_eq!(select_protocol(alpn, Some(b"http/1.1")).unwrap(), NegotiatedProtocol::Http11Tls);
        assert_eq!(select_protocol(alpn, None).unwrap(), NegotiatedProtocol::Http11Tls);
        assert!(matches!(
            select_protocol(alpn, Some(b"spdy/3")),
            Err(TransportError::Handshake(_))
        ));
    }

    #[test]
    fn plain_tls_is_always_http11() {
        assert_eq!(
            select_protocol(NegotiationPath::Tls, Some(b"h2")).unwrap(),
            NegotiatedProtocol::Http11Tls
        );
    }
}
