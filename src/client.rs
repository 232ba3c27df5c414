//! Minimal relay client used by the publisher and the resolver.

use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::{
    client_async_tls,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::Ncc05Error,
    event::Event,
    message::{Ack, ClientMessage, Filter, RelayMessage},
};

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite + Send {}
impl<T: AsyncRead + AsyncWrite + Send> AsyncReadWrite for T {}

type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// `wss://` relays get TLS on top of the TCP or SOCKS stream.
type Socket = WebSocketStream<MaybeTlsStream<Stream>>;

/// One open WebSocket session with a relay.
pub struct RelayConnection {
    url: String,
    ws: Socket,
}

impl RelayConnection {
    /// Connect to `relay`, tunnelling through a SOCKS5 proxy when one is given.
    pub async fn connect(relay: &str, socks_proxy: Option<&str>) -> Result<Self, Ncc05Error> {
        let url = Url::parse(relay).map_err(|e| Ncc05Error::Network(format!("{relay}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| Ncc05Error::Network(format!("{relay}: missing host")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Ncc05Error::Network(format!("{relay}: missing port")))?;
        let req = relay.into_client_request()?;
        let stream: Stream = match socks_proxy {
            Some(proxy) => Box::new(
                Socks5Stream::connect(proxy, (host, port))
                    .await
                    .map_err(|e| Ncc05Error::Network(format!("{relay} via {proxy}: {e}")))?,
            ),
            None => Box::new(
                TcpStream::connect((host, port))
                    .await
                    .map_err(|e| Ncc05Error::Network(format!("{relay}: {e}")))?,
            ),
        };
        let (ws, _) = client_async_tls(req, stream).await?;
        debug!(relay, "connected");
        Ok(Self {
            url: relay.to_string(),
            ws,
        })
    }

    /// Submit `ev` and wait for the relay's `OK` for that id.
    pub async fn send_event(&mut self, ev: &Event) -> Result<Ack, Ncc05Error> {
        self.send(ClientMessage::Event(Box::new(ev.clone()))).await?;
        loop {
            match self.next_message().await? {
                RelayMessage::Ok(ack) if ack.event_id == ev.id => return Ok(ack),
                other => debug!(relay = %self.url, ?other, "ignoring frame while awaiting OK"),
            }
        }
    }

    /// Run a one-shot subscription and collect events until `EOSE`.
    pub async fn fetch(&mut self, subscription_id: &str, filter: Filter) -> Result<Vec<Event>, Ncc05Error> {
        self.send(ClientMessage::Req {
            subscription_id: subscription_id.to_string(),
            filters: vec![filter],
        })
        .await?;
        let mut events = Vec::new();
        loop {
            match self.next_message().await? {
                RelayMessage::Event {
                    subscription_id: sub,
                    event,
                } if sub == subscription_id => events.push(*event),
                RelayMessage::Eose(sub) if sub == subscription_id => break,
                other => debug!(relay = %self.url, ?other, "ignoring frame"),
            }
        }
        self.send(ClientMessage::Close(subscription_id.to_string())).await?;
        debug!(relay = %self.url, count = events.len(), "subscription complete");
        Ok(events)
    }

    /// Close the socket. Errors are irrelevant at this point.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }

    async fn send(&mut self, msg: ClientMessage) -> Result<(), Ncc05Error> {
        self.ws.send(Message::Text(msg.to_json())).await?;
        Ok(())
    }

    /// Next well-formed relay frame. `NOTICE`s are logged and skipped.
    async fn next_message(&mut self) -> Result<RelayMessage, Ncc05Error> {
        while let Some(msg) = self.ws.next().await {
            match msg? {
                Message::Text(txt) => match RelayMessage::parse(&txt) {
                    Ok(RelayMessage::Notice(notice)) => warn!(relay = %self.url, "NOTICE: {notice}"),
                    Ok(m) => return Ok(m),
                    Err(e) => debug!(relay = %self.url, "dropping frame: {e}"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(Ncc05Error::Network(format!("{}: connection closed", self.url)))
    }
}
