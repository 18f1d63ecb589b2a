pub mod crc32;
pub mod define;
pub mod errors;
pub mod pes;
pub mod psi;
pub mod ts;

pub use errors::MpegTsError;
pub use ts::TsMuxer;
