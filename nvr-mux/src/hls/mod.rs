pub mod playlist;
pub mod writer;

pub use playlist::{Playlist, SegmentInfo};
pub use writer::{HlsWriter, HlsWriterError, HlsWriterOptions};
