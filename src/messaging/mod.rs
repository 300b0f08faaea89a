use async_trait::async_trait;

mod evolution;

pub use evolution::EvolutionGateway;

/// Gateway instance connection state, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
    Connecting,
}

impl ConnectionState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "open" => Self::Open,
            "connecting" => Self::Connecting,
            _ => Self::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Connecting => "connecting",
        }
    }
}

/// Result of a WhatsApp existence check for one phone number.
#[derive(Debug, Clone)]
pub struct NumberCheck {
    pub exists: bool,
    /// Routable address, preferred over the raw number for sends.
    pub jid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub id: String,
}

/// WhatsApp transport seam — implement for any gateway backend.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Connection state of a gateway instance.
    async fn connection_state(&self, instance: &str) -> anyhow::Result<ConnectionState>;

    /// Whether a canonical phone number is reachable on WhatsApp.
    async fn check_number(&self, instance: &str, phone: &str) -> anyhow::Result<NumberCheck>;

    /// Send a plain text message to a JID or canonical phone number.
    async fn send_text(
        &self,
        instance: &str,
        destination: &str,
        text: &str,
    ) -> anyhow::Result<SentMessage>;
}
