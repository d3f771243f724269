/// The downstream receiver went away; the session stops without further upstream calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("downstream client closed the stream")]
pub struct ClientClosed;
