//! Streaming raw DEFLATE over pooled contexts.

use std::io::{self, Read, Write};
use std::sync::Arc;

use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};

use crate::pool::CompressionPool;

const BUF_SIZE: usize = 8192;

fn released() -> io::Error {
    io::Error::other("compression stream already finished")
}

/// Compresses everything written to it into `inner`.
pub(crate) struct DeflateWriter<W: Write> {
    inner: W,
    compress: Option<Compress>,
    pool: Arc<CompressionPool>,
    buf: Vec<u8>,
}

impl<W: Write> DeflateWriter<W> {
    pub fn new(inner: W, pool: Arc<CompressionPool>) -> Self {
        let compress = pool.acquire_compressor();
        Self {
            inner,
            compress: Some(compress),
            pool,
            buf: Vec::with_capacity(BUF_SIZE),
        }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Flush the final block and return the context to the pool.
    ///
    /// Returns `(bytes in, bytes out)`.
    pub fn finish(&mut self) -> io::Result<(u64, u64)> {
        let compress = self.compress.as_mut().ok_or_else(released)?;
        loop {
            self.buf.clear();
            let status = compress.compress_vec(&[], &mut self.buf, FlushCompress::Finish)?;
            self.inner.write_all(&self.buf)?;
            if status == Status::StreamEnd {
                break;
            }
        }
        let totals = (compress.total_in(), compress.total_out());
        if let Some(compress) = self.compress.take() {
            self.pool.release_compressor(compress);
        }
        Ok(totals)
    }
}

impl<W: Write> Write for DeflateWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let compress = self.compress.as_mut().ok_or_else(released)?;
        loop {
            let before = compress.total_in();
            self.buf.clear();
            compress.compress_vec(data, &mut self.buf, FlushCompress::None)?;
            self.inner.write_all(&self.buf)?;
            let consumed = (compress.total_in() - before) as usize;
            if consumed > 0 || data.is_empty() {
                return Ok(consumed);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> Drop for DeflateWriter<W> {
    fn drop(&mut self) {
        if let Some(compress) = self.compress.take() {
            self.pool.release_compressor(compress);
        }
    }
}

/// Decompresses a raw DEFLATE stream read from `inner`.
pub(crate) struct InflateReader<R: Read> {
    inner: R,
    decompress: Option<Decompress>,
    pool: Arc<CompressionPool>,
    buf: Box<[u8]>,
    pos: usize,
    cap: usize,
    eof: bool,
    done: bool,
}

impl<R: Read> InflateReader<R> {
    pub fn new(inner: R, pool: Arc<CompressionPool>) -> Self {
        let decompress = pool.acquire_decompressor();
        Self {
            inner,
            decompress: Some(decompress),
            pool,
            buf: vec![0u8; BUF_SIZE].into_boxed_slice(),
            pos: 0,
            cap: 0,
            eof: false,
            done: false,
        }
    }
}

impl<R: Read> Read for InflateReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.done || out.is_empty() {
            return Ok(0);
        }
        let decompress = self.decompress.as_mut().ok_or_else(released)?;
        loop {
            if self.pos == self.cap && !self.eof {
                self.cap = self.inner.read(&mut self.buf)?;
                self.pos = 0;
                self.eof = self.cap == 0;
            }
            let flush = if self.eof {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };
            let (before_in, before_out) = (decompress.total_in(), decompress.total_out());
            let status = decompress.decompress(&self.buf[self.pos..self.cap], out, flush)?;
            let consumed = (decompress.total_in() - before_in) as usize;
            let produced = (decompress.total_out() - before_out) as usize;
            self.pos += consumed;

            if status == Status::StreamEnd {
                self.done = true;
                return Ok(produced);
            }
            if produced > 0 {
                return Ok(produced);
            }
            if self.eof {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated deflate stream",
                ));
            }
            if consumed == 0 && self.pos < self.cap {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "deflate stream made no progress",
                ));
            }
        }
    }
}

impl<R: Read> Drop for InflateReader<R> {
    fn drop(&mut self) {
        if let Some(decompress) = self.decompress.take() {
            self.pool.release_decompressor(decompress);
        }
    }
}
