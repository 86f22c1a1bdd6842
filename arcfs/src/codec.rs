//! The archive codec contract.
//!
//! The crate does not implement any container format or compression stage
//! itself. A [`Codec`] turns the byte streams the session hands it into a
//! header-and-data record sequence, and back. Format and filter codes are
//! opaque integer tags owned by the codec; the backend only records and
//! replays them.

use std::io::{Read, Seek, Write};

use thiserror::Error;

/// Integer tag for a container format (tar, cpio, ...).
pub type FormatCode = i32;

/// Integer tag for one payload filter stage (gzip, xz, ...). Filters apply
/// in the order they are listed.
pub type FilterCode = i32;

/// Format code a reader reports when the input holds no identifiable
/// archive. Backends refuse to mount it.
pub const FORMAT_EMPTY: FormatCode = 0;

/// The file type of one archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EntryKind {
    #[default]
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Unknown,
}

/// A point in time with nanosecond precision, as archives store it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryTime {
    pub sec: i64,
    pub nsec: u32,
}

/// One record inside an archive: a path with associated metadata. Regular
/// entries are followed by `size` bytes of content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryHeader {
    pub path: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
    pub mode: u32,
    pub atime: Option<EntryTime>,
    pub mtime: Option<EntryTime>,
    pub ctime: Option<EntryTime>,
    pub btime: Option<EntryTime>,
    pub symlink_target: Option<String>,
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("Corrupt archive: {reason}")]
    Corrupt { reason: String },
    #[error("Archive format {format} is not writable")]
    UnsupportedFormat { format: FormatCode },
    #[error("Archive filter {filter} is not writable")]
    UnsupportedFilter { filter: FilterCode },
}

impl CodecError {
    pub fn corrupt(reason: impl Into<String>) -> Self {
        CodecError::Corrupt {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Input stream handed to a reader. Archive files are plain files, so the
/// stream is always seekable; codecs use it to skip entry data.
pub trait Source: Read + Seek + Send {}
impl<T: Read + Seek + Send> Source for T {}

/// Output stream handed to a writer.
pub trait Sink: Write + Send {}
impl<T: Write + Send> Sink for T {}

/// One decoding pass over an archive. Headers come back in archive order;
/// between two headers the caller either reads or skips the entry data.
pub trait FormatReader: Send {
    /// Advance to the next entry. `Ok(None)` at the end of the archive.
    fn next_header(&mut self) -> Result<Option<EntryHeader>>;

    /// Read content bytes of the current entry. Returns 0 at the end of
    /// the entry data.
    fn read_data(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Drop the rest of the current entry's data.
    fn skip_data(&mut self) -> Result<()>;

    /// The detected container format.
    fn format(&self) -> FormatCode;

    /// The detected filter stages, outermost first.
    fn filters(&self) -> &[FilterCode];
}

/// One encoding pass. Entry data must follow its header and add up to the
/// size announced there; a writer is free to truncate excess bytes.
pub trait FormatWriter: Send {
    fn write_header(&mut self, header: &EntryHeader) -> Result<()>;

    /// Append content bytes for the current entry, returning how many were
    /// accepted.
    fn write_data(&mut self, data: &[u8]) -> Result<usize>;

    /// Write the archive trailer and flush the sink.
    fn finish(&mut self) -> Result<()>;
}

/// Factory for read and write passes over one archive encoding.
pub trait Codec: Send + Sync {
    /// Open a decoding pass, detecting format and filters from the stream.
    fn open_reader(&self, source: Box<dyn Source>) -> Result<Box<dyn FormatReader>>;

    /// Open an encoding pass producing the given format and filter chain.
    fn open_writer(
        &self,
        sink: Box<dyn Sink>,
        format: FormatCode,
        filters: &[FilterCode],
    ) -> Result<Box<dyn FormatWriter>>;

    /// Whether the codec can produce this format and filter chain. Mounts
    /// use this probe to decide if the archive is writable.
    fn can_write(&self, format: FormatCode, filters: &[FilterCode]) -> bool;
}

#[cfg(any(test, feature = "test"))]
pub mod test {
    //! A minimal fixture codec for exercising sessions and backends.
    //!
    //! The container is a flat record stream with no compression: a magic
    //! tag, the filter codes (recorded but applied as identity stages), and
    //! length-prefixed entries.

    use std::io::SeekFrom;

    use super::*;

    pub const FORMAT_BOX: FormatCode = 77;

    const MAGIC: [u8; 4] = *b"BOXF";
    const TAG_END: u8 = 0;
    const TAG_ENTRY: u8 = 1;

    pub struct BoxCodec;

    impl Codec for BoxCodec {
        fn open_reader(&self, mut source: Box<dyn Source>) -> Result<Box<dyn FormatReader>> {
            let mut magic = [0u8; 4];
            let mut got = 0;
            while got < magic.len() {
                let n = source.read(&mut magic[got..])?;
                if n == 0 {
                    break;
                }
                got += n;
            }

            if got == 0 {
                return Ok(Box::new(BoxReader {
                    source,
                    filters: Vec::new(),
                    format: FORMAT_EMPTY,
                    remaining: 0,
                    done: true,
                }));
            }
            if got < magic.len() || magic != MAGIC {
                return Err(CodecError::corrupt("bad magic"));
            }

            let filter_count = read_u32(&mut source)? as usize;
            let mut filters = Vec::with_capacity(filter_count);
            for _ in 0..filter_count {
                filters.push(read_u32(&mut source)? as FilterCode);
            }

            Ok(Box::new(BoxReader {
                source,
                filters,
                format: FORMAT_BOX,
                remaining: 0,
                done: false,
            }))
        }

        fn open_writer(
            &self,
            mut sink: Box<dyn Sink>,
            format: FormatCode,
            filters: &[FilterCode],
        ) -> Result<Box<dyn FormatWriter>> {
            if format != FORMAT_BOX {
                return Err(CodecError::UnsupportedFormat { format });
            }
            if let Some(filter) = filters.iter().find(|filter| **filter < 0) {
                return Err(CodecError::UnsupportedFilter { filter: *filter });
            }

            sink.write_all(&MAGIC)?;
            write_u32(&mut sink, filters.len() as u32)?;
            for filter in filters {
                write_u32(&mut sink, *filter as u32)?;
            }

            Ok(Box::new(BoxWriter {
                sink,
                remaining: 0,
            }))
        }

        fn can_write(&self, format: FormatCode, filters: &[FilterCode]) -> bool {
            format == FORMAT_BOX && filters.iter().all(|filter| *filter >= 0)
        }
    }

    struct BoxReader {
        source: Box<dyn Source>,
        filters: Vec<FilterCode>,
        format: FormatCode,
        remaining: u64,
        done: bool,
    }

    impl FormatReader for BoxReader {
        fn next_header(&mut self) -> Result<Option<EntryHeader>> {
            if self.done {
                return Ok(None);
            }
            self.skip_data()?;

            let tag = read_u8(&mut self.source)?;
            match tag {
                TAG_END => {
                    self.done = true;
                    Ok(None)
                }
                TAG_ENTRY => {
                    let path = read_string(&mut self.source)?;
                    let kind = kind_from_byte(read_u8(&mut self.source)?);
                    let mode = read_u32(&mut self.source)?;
                    let size = read_u64(&mut self.source)?;
                    let atime = read_time(&mut self.source)?;
                    let mtime = read_time(&mut self.source)?;
                    let ctime = read_time(&mut self.source)?;
                    let btime = read_time(&mut self.source)?;
                    let symlink_target = match read_u8(&mut self.source)? {
                        0 => None,
                        _ => Some(read_string(&mut self.source)?),
                    };

                    self.remaining = size;
                    Ok(Some(EntryHeader {
                        path,
                        kind,
                        size: Some(size),
                        mode,
                        atime,
                        mtime,
                        ctime,
                        btime,
                        symlink_target,
                    }))
                }
                _ => Err(CodecError::corrupt("bad entry tag")),
            }
        }

        fn read_data(&mut self, buffer: &mut [u8]) -> Result<usize> {
            let want = buffer.len().min(self.remaining as usize);
            if want == 0 {
                return Ok(0);
            }

            let read = self.source.read(&mut buffer[..want])?;
            if read == 0 {
                return Err(CodecError::corrupt("truncated entry data"));
            }
            self.remaining -= read as u64;
            Ok(read)
        }

        fn skip_data(&mut self) -> Result<()> {
            if self.remaining > 0 {
                self.source.seek(SeekFrom::Current(self.remaining as i64))?;
                self.remaining = 0;
            }
            Ok(())
        }

        fn format(&self) -> FormatCode {
            self.format
        }

        fn filters(&self) -> &[FilterCode] {
            &self.filters
        }
    }

    struct BoxWriter {
        sink: Box<dyn Sink>,
        remaining: u64,
    }

    impl BoxWriter {
        fn pad_entry(&mut self) -> Result<()> {
            let zero = [0u8; 512];
            while self.remaining > 0 {
                let chunk = zero.len().min(self.remaining as usize);
                self.sink.write_all(&zero[..chunk])?;
                self.remaining -= chunk as u64;
            }
            Ok(())
        }
    }

    impl FormatWriter for BoxWriter {
        fn write_header(&mut self, header: &EntryHeader) -> Result<()> {
            self.pad_entry()?;

            self.sink.write_all(&[TAG_ENTRY])?;
            write_string(&mut self.sink, &header.path)?;
            self.sink.write_all(&[kind_to_byte(header.kind)])?;
            write_u32(&mut self.sink, header.mode)?;
            let size = header.size.unwrap_or(0);
            write_u64(&mut self.sink, size)?;
            write_time(&mut self.sink, header.atime)?;
            write_time(&mut self.sink, header.mtime)?;
            write_time(&mut self.sink, header.ctime)?;
            write_time(&mut self.sink, header.btime)?;
            match &header.symlink_target {
                None => self.sink.write_all(&[0])?,
                Some(target) => {
                    self.sink.write_all(&[1])?;
                    write_string(&mut self.sink, target)?;
                }
            }

            self.remaining = size;
            Ok(())
        }

        fn write_data(&mut self, data: &[u8]) -> Result<usize> {
            let accepted = data.len().min(self.remaining as usize);
            self.sink.write_all(&data[..accepted])?;
            self.remaining -= accepted as u64;
            Ok(accepted)
        }

        fn finish(&mut self) -> Result<()> {
            self.pad_entry()?;
            self.sink.write_all(&[TAG_END])?;
            self.sink.flush()?;
            Ok(())
        }
    }

    fn kind_to_byte(kind: EntryKind) -> u8 {
        match kind {
            EntryKind::Regular => 0,
            EntryKind::Directory => 1,
            EntryKind::Symlink => 2,
            EntryKind::CharDevice => 3,
            EntryKind::BlockDevice => 4,
            EntryKind::Fifo => 5,
            EntryKind::Socket => 6,
            EntryKind::Unknown => 255,
        }
    }

    fn kind_from_byte(byte: u8) -> EntryKind {
        match byte {
            0 => EntryKind::Regular,
            1 => EntryKind::Directory,
            2 => EntryKind::Symlink,
            3 => EntryKind::CharDevice,
            4 => EntryKind::BlockDevice,
            5 => EntryKind::Fifo,
            6 => EntryKind::Socket,
            _ => EntryKind::Unknown,
        }
    }

    fn read_u8(source: &mut Box<dyn Source>) -> Result<u8> {
        let mut buffer = [0u8; 1];
        source.read_exact(&mut buffer)?;
        Ok(buffer[0])
    }

    fn read_u32(source: &mut Box<dyn Source>) -> Result<u32> {
        let mut buffer = [0u8; 4];
        source.read_exact(&mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    fn read_u64(source: &mut Box<dyn Source>) -> Result<u64> {
        let mut buffer = [0u8; 8];
        source.read_exact(&mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    fn read_i64(source: &mut Box<dyn Source>) -> Result<i64> {
        let mut buffer = [0u8; 8];
        source.read_exact(&mut buffer)?;
        Ok(i64::from_le_bytes(buffer))
    }

    fn read_string(source: &mut Box<dyn Source>) -> Result<String> {
        let length = read_u32(source)? as usize;
        let mut buffer = vec![0u8; length];
        source.read_exact(&mut buffer)?;
        String::from_utf8(buffer).map_err(|_| CodecError::corrupt("path is not utf-8"))
    }

    fn read_time(source: &mut Box<dyn Source>) -> Result<Option<EntryTime>> {
        match read_u8(source)? {
            0 => Ok(None),
            _ => Ok(Some(EntryTime {
                sec: read_i64(source)?,
                nsec: read_u32(source)?,
            })),
        }
    }

    fn write_u32(sink: &mut Box<dyn Sink>, value: u32) -> Result<()> {
        sink.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    fn write_u64(sink: &mut Box<dyn Sink>, value: u64) -> Result<()> {
        sink.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    fn write_string(sink: &mut Box<dyn Sink>, value: &str) -> Result<()> {
        write_u32(sink, value.len() as u32)?;
        sink.write_all(value.as_bytes())?;
        Ok(())
    }

    fn write_time(sink: &mut Box<dyn Sink>, time: Option<EntryTime>) -> Result<()> {
        match time {
            None => {
                sink.write_all(&[0])?;
            }
            Some(time) => {
                sink.write_all(&[1])?;
                sink.write_all(&time.sec.to_le_bytes())?;
                write_u32(sink, time.nsec)?;
            }
        }
        Ok(())
    }
}
