//! Wire protocol: message formats, the Noise IK handshake, cookies, and
//! anti-replay.

pub mod cookie;
pub mod handshake;
pub mod messages;
pub mod replay;

pub use cookie::{CookieIssuer, CookieJar};
pub use handshake::{ConsumedInitiation, Handshake, SessionKeys, StaticIdentity};
pub use messages::{
    message_type, padded_len, CookieReply, Initiation, MessageType, Response, TransportHeader,
};
pub use replay::ReplayFilter;
