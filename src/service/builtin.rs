//! Services every table starts with.

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{Service, ServiceContext, ServiceError};
use crate::device::TileCoord;

/// Exit code of a finished tile, sent at index 0. The poller reads it
/// directly; no table entry handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DoneData {
    pub code: i32,
}

/// Text in tile memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct LogData {
    pub ptr: u32,
    pub len: u32,
}

/// Copies text out of tile memory into a writer.
pub struct LogService {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl LogService {
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            sink: Mutex::new(Box::new(sink)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// A log service writing into memory, and the handle to read it back.
    pub fn capture() -> (Self, LogCapture) {
        let capture = LogCapture::default();
        (Self::new(capture.clone()), capture)
    }
}

impl Service for LogService {
    type Data = LogData;
    const NAME: &'static str = "log";

    fn act_on_data(&self, ctx: &ServiceContext<'_>, data: LogData) -> Result<Option<u32>, ServiceError> {
        let bytes = ctx.read_bytes(data.ptr, data.len)?;
        let mut sink = self.sink.lock();
        sink.write_all(&bytes)?;
        sink.flush()?;
        Ok(None)
    }
}

/// Shared in-memory log sink.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_owned).collect()
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Words a tile wants the host to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BreakpointData {
    pub offset: u32,
    pub count: u32,
}

type BreakpointHook = dyn Fn(TileCoord, u32, &[u32]) + Send + Sync;

/// Reads the requested words and hands them to a hook. The default hook
/// logs them.
pub struct BreakpointService {
    hook: Box<BreakpointHook>,
}

impl BreakpointService {
    pub fn with_hook(hook: impl Fn(TileCoord, u32, &[u32]) + Send + Sync + 'static) -> Self {
        Self {
            hook: Box::new(hook),
        }
    }
}

impl Default for BreakpointService {
    fn default() -> Self {
        Self::with_hook(|coord, offset, words| {
            log::info!("breakpoint on tile {coord} at 0x{offset:04X}: {words:08X?}");
        })
    }
}

impl Service for BreakpointService {
    type Data = BreakpointData;
    const NAME: &'static str = "breakpoint";

    fn act_on_data(
        &self,
        ctx: &ServiceContext<'_>,
        data: BreakpointData,
    ) -> Result<Option<u32>, ServiceError> {
        let words = ctx.read_words(data.offset, data.count)?;
        (self.hook)(ctx.coord(), data.offset, &words);
        Ok(None)
    }
}
