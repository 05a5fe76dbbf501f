pub mod encoding_utils;
pub mod header_utils;
