pub mod channel;
pub mod wire;

pub use channel::{ChannelError, ChannelKind, ChannelName};
pub use wire::{
    decode_envelope, DecodeReport, EventEnvelope, SseFrameDecoder, WireError,
    CLOSE_EVENT, CONNECTED_EVENT, DEFAULT_MAX_FRAME_BYTES, HEARTBEAT_EVENT,
};
