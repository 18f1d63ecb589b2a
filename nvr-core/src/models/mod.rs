pub mod stream;

pub use stream::{
    validate_stream_name, StreamDescriptor, StreamPatch, TransportProtocol, MAX_STREAM_NAME_LEN,
};
