//! Media muxing for the recorder: MPEG-TS/HLS live output and fragment-free
//! MP4 recording, plus the H.264/AAC helpers both need.

pub mod aac;
pub mod bytesio;
pub mod h264;
pub mod hls;
pub mod mp4;
pub mod mpegts;
pub mod packet;

pub use packet::{AudioCodec, AudioTrack, MediaKind, MediaPacket, TrackSet, VideoCodec, VideoTrack};
