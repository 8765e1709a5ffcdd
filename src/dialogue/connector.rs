//! Transport to the realtime dialogue engine

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use crate::{Error, Result};

/// Frames buffered in each direction before senders wait
const CHANNEL_CAPACITY: usize = 256;

/// Text-frame duplex to the engine
///
/// `inbound` yields `None` once the engine side has closed. Dropping the
/// channel closes the connection.
pub struct DialogueChannel {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Opens connections to the dialogue engine
#[async_trait]
pub trait DialogueConnector: Send + Sync {
    /// Establish a fresh connection
    async fn connect(&self) -> Result<DialogueChannel>;
}

/// Realtime engine endpoint settings
#[derive(Debug, Clone)]
pub struct RealtimeEndpoint {
    /// Base WebSocket URL
    pub url: String,
    /// Model name passed as a query parameter
    pub model: String,
}

impl Default for RealtimeEndpoint {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".to_string(),
            model: "gpt-realtime-mini-2025-12-15".to_string(),
        }
    }
}

/// Connects to the OpenAI realtime API over WebSocket
pub struct RealtimeConnector {
    endpoint: RealtimeEndpoint,
    api_key: SecretString,
}

impl RealtimeConnector {
    /// Create a connector
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(endpoint: RealtimeEndpoint, api_key: SecretString) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for realtime dialogue".to_string(),
            ));
        }
        Ok(Self { endpoint, api_key })
    }

    /// Full connection URL including the model
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}?model={}", self.endpoint.url, self.endpoint.model)
    }
}

#[async_trait]
impl DialogueConnector for RealtimeConnector {
    async fn connect(&self) -> Result<DialogueChannel> {
        let mut request = self
            .url()
            .into_client_request()
            .map_err(|e| Error::UpstreamConnect(format!("invalid realtime url: {e}")))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key.expose_secret()))
            .map_err(|e| Error::Config(format!("invalid API key: {e}")))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", bearer);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::UpstreamConnect(e.to_string()))?;

        tracing::info!(model = %self.endpoint.model, "connected to realtime engine");

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::debug!(error = %e, "realtime send failed");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = in_tx.closed() => break,
                    frame = stream.next() => frame,
                };

                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(reason))) => {
                        tracing::info!(?reason, "realtime engine closed connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "realtime connection error");
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok(DialogueChannel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
