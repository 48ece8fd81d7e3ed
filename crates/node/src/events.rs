use crate::app::ChatLine;

#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerJoined { index: u8, name: String },
    PeerLeft { index: u8 },
    Chat { from: Option<u8>, line: ChatLine },
    BadChat { from: Option<u8>, reason: String },
}
