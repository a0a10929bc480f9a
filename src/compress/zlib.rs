use flate2::{Compression, FlushCompress, FlushDecompress, Status};
use crate::error::{Error, Result};
use super::{Compress, CompressAlgo, Decompress};

/// "zlib" compression from RFC 4253, active right after the key exchange.
pub static ZLIB: CompressAlgo = CompressAlgo {
    name: "zlib",
    delayed: false,
    make_compress: Some(|| Box::new(ZlibCompress::new())),
    make_decompress: Some(|max_len| Box::new(ZlibDecompress::new(max_len))),
};

/// "zlib@openssh.com" compression, which is delayed until the user is authenticated.
pub static ZLIB_OPENSSH: CompressAlgo = CompressAlgo {
    name: "zlib@openssh.com",
    delayed: true,
    make_compress: Some(|| Box::new(ZlibCompress::new())),
    make_decompress: Some(|max_len| Box::new(ZlibDecompress::new(max_len))),
};

struct ZlibCompress {
    inner: flate2::Compress,
}

impl ZlibCompress {
    fn new() -> Self {
        Self { inner: flate2::Compress::new(Compression::default(), true) }
    }
}

impl Compress for ZlibCompress {
    fn compress(&mut self, mut data: &[u8]) -> Result<Vec<u8>> {
        // every packet ends with a partial flush, so the peer can decompress it without waiting
        // for more data
        let mut out = Vec::with_capacity(data.len() + 64);
        loop {
            let total_in = self.inner.total_in();
            self.inner.compress_vec(data, &mut out, FlushCompress::Partial)
                .map_err(|_| Error::Compress("zlib compression failed"))?;
            data = &data[(self.inner.total_in() - total_in) as usize..];
            if data.is_empty() && out.len() < out.capacity() {
                return Ok(out)
            }
            out.reserve(out.capacity().max(64));
        }
    }
}

struct ZlibDecompress {
    inner: flate2::Decompress,
    max_len: usize,
}

impl ZlibDecompress {
    fn new(max_len: usize) -> Self {
        Self { inner: flate2::Decompress::new(true), max_len }
    }
}

impl Decompress for ZlibDecompress {
    fn decompress(&mut self, mut data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(4 * data.len() + 64);
        loop {
            let total_in = self.inner.total_in();
            let status = self.inner.decompress_vec(data, &mut out, FlushDecompress::Sync)
                .map_err(|_| Error::Compress("zlib stream is corrupted"))?;
            data = &data[(self.inner.total_in() - total_in) as usize..];

            if out.len() > self.max_len {
                return Err(Error::Compress("decompressed payload is too long"))
            }
            if status == Status::StreamEnd {
                return Err(Error::Compress("zlib stream ended unexpectedly"))
            }
            if data.is_empty() && out.len() < out.capacity() {
                return Ok(out)
            }
            if status == Status::BufError && !data.is_empty() && out.len() < out.capacity() {
                return Err(Error::Compress("zlib decompression made no progress"))
            }
            out.reserve(out.capacity().max(64));
        }
    }
}
