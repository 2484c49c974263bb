use zstd_safe::{CCtx, DCtx, InBuffer, OutBuffer};

/// Streaming zstd compressor. Each call flushes, so every packet is decodable
/// as soon as it arrives, while the window keeps earlier packets as context.
pub struct ZstdStreamEncoder {
    cctx: CCtx<'static>,
}

impl ZstdStreamEncoder {
    pub fn new(level: i32) -> anyhow::Result<Self> {
        let mut cctx = CCtx::create();
        map_zstd(
            cctx.set_parameter(zstd_safe::CParameter::CompressionLevel(level)),
            "set zstd compression level",
        )?;
        Ok(Self { cctx })
    }

    pub fn compress_flush(&mut self, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.compress_flush_into(input, &mut out)?;
        Ok(out)
    }

    /// Appends the flushed output for `input` to `out`.
    pub fn compress_flush_into(&mut self, input: &[u8], out: &mut Vec<u8>) -> anyhow::Result<()> {
        let start = out.len();
        let max = zstd_safe::compress_bound(input.len()).max(64);
        out.resize(start + max, 0);

        let mut in_buf = InBuffer::around(input);
        let written = {
            let mut out_buf = OutBuffer::around(&mut out[start..]);
            loop {
                let remaining = map_zstd(
                    self.cctx.compress_stream2(
                        &mut out_buf,
                        &mut in_buf,
                        zstd_safe::zstd_sys::ZSTD_EndDirective::ZSTD_e_flush,
                    ),
                    "zstd compress_stream2 flush",
                )?;
                if remaining == 0 {
                    break;
                }
                anyhow::ensure!(
                    out_buf.pos() < out_buf.capacity(),
                    "zstd flush did not fit the compress bound"
                );
            }
            out_buf.pos()
        };
        out.truncate(start + written);
        Ok(())
    }
}

/// Counterpart of [`ZstdStreamEncoder`] for consumers of the stream.
pub struct ZstdStreamDecoder {
    dctx: DCtx<'static>,
    scratch: Vec<u8>,
}

impl ZstdStreamDecoder {
    pub fn new() -> Self {
        Self {
            dctx: DCtx::create(),
            scratch: vec![0u8; 64 * 1024],
        }
    }

    pub fn decompress(&mut self, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut in_buf = InBuffer::around(input);
        loop {
            let (pos, more) = {
                let mut out_buf = OutBuffer::around(&mut self.scratch[..]);
                map_zstd(
                    self.dctx.decompress_stream(&mut out_buf, &mut in_buf),
                    "zstd decompress_stream",
                )?;
                let pos = out_buf.pos();
                (pos, pos == out_buf.capacity())
            };
            out.extend_from_slice(&self.scratch[..pos]);
            if in_buf.pos >= input.len() && !more {
                break;
            }
        }
        Ok(out)
    }
}

impl Default for ZstdStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn map_zstd(res: zstd_safe::SafeResult, ctx: &'static str) -> anyhow::Result<usize> {
    res.map_err(|code| anyhow::anyhow!("{ctx} (zstd error code {code:?})"))
}
