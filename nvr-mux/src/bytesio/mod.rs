pub mod bytes_errors;
pub mod bytes_writer;
