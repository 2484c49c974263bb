pub mod zstd_stream;
