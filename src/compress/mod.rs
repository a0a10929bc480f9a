//! Compression algorithms.
//!
//! Compression is negotiated per direction like ciphers and MACs. The payload of each packet is
//! compressed before it is framed and encrypted, and the compression state carries over between
//! packets of the same direction until the next key exchange.
//!
//! # Supported algorithms
//!
//! - "none" ([`NONE`])
//! - "zlib" ([`ZLIB`])
//! - "zlib@openssh.com" ([`ZLIB_OPENSSH`]), which starts only after user authentication succeeds
use derivative::Derivative;
use crate::Result;
pub use self::zlib::{ZLIB, ZLIB_OPENSSH};

mod zlib;

/// Algorithm for compressing packet payloads.
///
/// See the [module documentation][self] for details.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CompressAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    /// Compression starts only after the user is authenticated.
    pub(crate) delayed: bool,
    #[derivative(Debug = "ignore")]
    pub(crate) make_compress: Option<fn() -> Box<dyn Compress + Send>>,
    #[derivative(Debug = "ignore")]
    pub(crate) make_decompress: Option<fn(max_len: usize) -> Box<dyn Decompress + Send>>,
}

/// "none" compression.
pub static NONE: CompressAlgo = CompressAlgo {
    name: "none",
    delayed: false,
    make_compress: None,
    make_decompress: None,
};

pub(crate) trait Compress {
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>>;
}

pub(crate) trait Decompress {
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>>;
}
