//! IPC between the service and its clients

mod codec;
mod dispatcher;
mod protocol;
mod server;

pub use codec::{
    decode, encode, CodecError, Decoded, Frame, FrameDecoder, DEFAULT_MAX_FRAME_LEN, HEADER_LEN,
};
pub use dispatcher::Dispatcher;
pub use protocol::{
    IdRequest, InterceptorRequest, KeyDelivery, KeyMonitorRequest, MarkConsumedRequest, MessageTag,
    MonitorRequest, Payload, PointerDelivery, Reply, SubscribeRequest,
};
pub use server::{Server, ServerLimits};
