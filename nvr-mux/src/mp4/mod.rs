//! ISO-BMFF (`.mp4`) writing.
//!
//! Media data is streamed into `mdat` as it arrives; the sample tables are
//! kept in memory and written as a trailing `moov` on finish. Files are
//! written under a `.partial` name and renamed into place once complete.

pub mod errors;
pub mod file;
pub mod writer;

pub use errors::Mp4Error;
pub use file::{Mp4File, Mp4Summary};
pub use writer::{Mp4Stats, Mp4Writer};
