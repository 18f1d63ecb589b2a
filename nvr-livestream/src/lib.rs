// NVR live media pipeline
//
// Per-camera sessions that read the broker's RTSP restream (or the camera
// itself) and drive two outputs from the same packets:
// - source/rtsp: packet sources behind a trait, RTSP via retina
// - normalizer:  DTS/PTS repair ahead of both muxers
// - session:     reconnecting packet loop fanning out to HLS and MP4
// - rotator:     key-frame aligned MP4 rotation with forced and hard cuts
// - facade:      start/stop recording and HLS per stream

pub mod error;
pub mod facade;
pub mod index;
pub mod normalizer;
pub mod rotator;
pub mod rtsp;
pub mod session;
pub mod source;
pub mod writers;

pub use error::{FacadeError, SessionError};
pub use facade::{BrokerLocator, DirectLocator, ManagerOptions, MediaSessionManager};
pub use index::{MemoryRecordingIndex, RecordingIndex, RecordingRow};
pub use normalizer::TimestampNormalizer;
pub use rotator::{Mp4Rotator, RotationPolicy, RotationReason};
pub use rtsp::RtspOpener;
pub use session::{MediaSession, Outputs, SessionConfig, SessionDeps, SessionHandle, UpstreamLocator};
pub use source::{PacketSource, SourceError, SourceEvent, SourceOpener};
pub use writers::{SessionSignals, WriterRegistry};
