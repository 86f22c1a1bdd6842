//! One read and/or write pass over the backing archive.
//!
//! A session owns the codec handles and the streams behind them. The first
//! failure latches; every later call short-circuits, and finishing the
//! session either renames the temporary file over the archive or deletes
//! it, so the backing file never holds a half-written pass.

use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::debug;
use tempfile::NamedTempFile;

use crate::{
    codec::{Codec, CodecError, EntryHeader, FilterCode, FormatCode},
    error::{Error, Result},
    job::Job,
    BLOCK_SIZE,
};

/// Archive input stream. Every access checks the job first so a cancelled
/// operation unwinds at the next codec callback.
struct JobSource {
    file: File,
    job: Job,
}

impl Read for JobSource {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        if self.job.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
        }
        self.file.read(buffer)
    }
}

impl Seek for JobSource {
    fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
        if self.job.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
        }
        self.file.seek(position)
    }
}

/// Temp-file output stream with the same cancellation check.
struct JobSink {
    file: File,
    job: Job,
}

impl Write for JobSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.job.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
        }
        self.file.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

pub(crate) struct ArchiveSession {
    reader: Option<Box<dyn crate::codec::FormatReader>>,
    writer: Option<Box<dyn crate::codec::FormatWriter>>,
    temp: Option<NamedTempFile>,
    path: PathBuf,
    job: Job,
    error: Option<Error>,
}

impl ArchiveSession {
    pub fn read(codec: &dyn Codec, path: &Path, job: &Job) -> Self {
        Self::new(codec, path, job, true, false, 0, &[])
    }

    pub fn write(
        codec: &dyn Codec,
        path: &Path,
        job: &Job,
        format: FormatCode,
        filters: &[FilterCode],
    ) -> Self {
        Self::new(codec, path, job, false, true, format, filters)
    }

    pub fn read_write(
        codec: &dyn Codec,
        path: &Path,
        job: &Job,
        format: FormatCode,
        filters: &[FilterCode],
    ) -> Self {
        Self::new(codec, path, job, true, true, format, filters)
    }

    fn new(
        codec: &dyn Codec,
        path: &Path,
        job: &Job,
        readable: bool,
        writable: bool,
        format: FormatCode,
        filters: &[FilterCode],
    ) -> Self {
        assert!(readable || writable);

        let mut session = ArchiveSession {
            reader: None,
            writer: None,
            temp: None,
            path: path.to_owned(),
            job: job.clone(),
            error: None,
        };

        if readable {
            debug!("session open (read): {}", path.display());
            match File::open(path) {
                Ok(file) => {
                    let source = JobSource {
                        file,
                        job: job.clone(),
                    };
                    match codec.open_reader(Box::new(source)) {
                        Ok(reader) => session.reader = Some(reader),
                        Err(err) => session.set_error_from_codec(err),
                    }
                }
                Err(err) => session.error = Some(err.into()),
            }
        }

        if writable && session.error.is_none() {
            debug!("session open (write): {}", path.display());
            match Self::open_temp(path) {
                Ok(temp) => match temp.as_file().try_clone() {
                    Ok(file) => {
                        let sink = JobSink {
                            file,
                            job: job.clone(),
                        };
                        match codec.open_writer(Box::new(sink), format, filters) {
                            Ok(writer) => {
                                session.writer = Some(writer);
                                session.temp = Some(temp);
                            }
                            Err(err) => session.set_error_from_codec(err),
                        }
                    }
                    Err(err) => session.error = Some(err.into()),
                },
                Err(err) => session.error = Some(err),
            }
        }

        session
    }

    /// `P.XXXXXX` next to the archive, so the final rename stays on one
    /// filesystem.
    fn open_temp(path: &Path) -> Result<NamedTempFile> {
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(tempfile::Builder::new()
            .prefix(&format!("{name}."))
            .rand_bytes(6)
            .tempfile_in(directory)?)
    }

    pub fn in_error(&self) -> bool {
        self.error.is_some()
    }

    /// Take the latched error, clearing it, the way an operation reports
    /// its failure exactly once.
    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    pub fn set_error(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// The single translator from codec failures into session errors.
    fn set_error_from_codec(&mut self, err: CodecError) {
        if self.error.is_some() {
            return;
        }

        self.error = Some(match err {
            CodecError::Io { source } if source.kind() == io::ErrorKind::Interrupted => {
                Error::Cancelled
            }
            CodecError::Io { source } if source.kind() == io::ErrorKind::PermissionDenied => {
                Error::PermissionDenied
            }
            CodecError::Io { source } => Error::Io { source },
            other => Error::Failed {
                source: other.into(),
            },
        });
    }

    pub fn format(&self) -> Option<FormatCode> {
        self.reader.as_ref().map(|reader| reader.format())
    }

    pub fn filters(&self) -> Option<Vec<FilterCode>> {
        self.reader.as_ref().map(|reader| reader.filters().to_vec())
    }

    /// Next entry header, with any leading `./` stripped from its path.
    /// `None` at the end of the archive or once the session is in error.
    pub fn read_header(&mut self) -> Option<EntryHeader> {
        if self.error.is_some() {
            return None;
        }

        let reader = self.reader.as_mut()?;
        match reader.next_header() {
            Ok(Some(mut header)) => {
                if let Some(stripped) = header.path.strip_prefix("./") {
                    header.path = stripped.to_owned();
                }
                Some(header)
            }
            Ok(None) => None,
            Err(err) => {
                self.set_error_from_codec(err);
                None
            }
        }
    }

    pub fn write_header(&mut self, header: &EntryHeader) {
        if self.error.is_some() {
            return;
        }

        if let Some(writer) = self.writer.as_mut() {
            if let Err(err) = writer.write_header(header) {
                self.set_error_from_codec(err);
            }
        }
    }

    /// Read content bytes of the current entry; 0 at the end of the data
    /// or once the session is in error.
    pub fn read_data(&mut self, buffer: &mut [u8]) -> usize {
        if self.error.is_some() {
            return 0;
        }

        let Some(reader) = self.reader.as_mut() else {
            return 0;
        };
        match reader.read_data(buffer) {
            Ok(count) => count,
            Err(err) => {
                self.set_error_from_codec(err);
                0
            }
        }
    }

    pub fn write_data(&mut self, data: &[u8]) -> usize {
        if self.error.is_some() {
            return 0;
        }

        let Some(writer) = self.writer.as_mut() else {
            return 0;
        };
        match writer.write_data(data) {
            Ok(count) => count,
            Err(err) => {
                self.set_error_from_codec(err);
                0
            }
        }
    }

    pub fn skip_data(&mut self) {
        if self.error.is_some() {
            return;
        }

        if let Some(reader) = self.reader.as_mut() {
            if let Err(err) = reader.skip_data() {
                self.set_error_from_codec(err);
            }
        }
    }

    /// Stream the current entry's data from the read side to the write
    /// side, checking for cancellation between blocks.
    pub fn copy_data(&mut self) {
        let mut buffer = [0u8; BLOCK_SIZE];

        loop {
            let read_bytes = self.read_data(&mut buffer);
            if read_bytes == 0 {
                break;
            }

            let written = self.write_data(&buffer[..read_bytes]);
            if written != read_bytes && self.error.is_none() {
                self.error = Some(Error::Failed {
                    source: anyhow::anyhow!("archive entry size has not been set"),
                });
            }

            if self.job.is_cancelled() && self.error.is_none() {
                self.error = Some(Error::Cancelled);
            }
            if self.error.is_some() {
                break;
            }
        }
    }

    /// Copy entries verbatim until one matches either prefix on a path
    /// segment boundary; that entry is handed back untouched for the
    /// caller to rewrite, drop or replace. `None` at the end of the pass.
    pub fn copy_prefix(
        &mut self,
        prefix1: Option<&str>,
        prefix2: Option<&str>,
    ) -> Option<EntryHeader> {
        while let Some(header) = self.read_header() {
            if matches_prefix(&header.path, prefix1) || matches_prefix(&header.path, prefix2) {
                return Some(header);
            }

            self.write_header(&header);
            self.copy_data();
        }

        None
    }

    /// Copy the whole archive.
    pub fn copy_all(&mut self) {
        let _ = self.copy_prefix(None, None);
    }

    /// End the pass. A writable session commits the temporary file over
    /// the archive path, keeping the target's permission bits, or deletes
    /// it when the session is in error.
    pub fn finish(mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            if self.error.is_none() {
                if let Err(err) = writer.finish() {
                    self.set_error_from_codec(err);
                }
            }
            drop(writer);

            if let Some(temp) = self.temp.take() {
                if self.error.is_none() {
                    debug!("session commit: {}", self.path.display());
                    if let Ok(metadata) = fs::metadata(&self.path) {
                        let _ = fs::set_permissions(temp.path(), metadata.permissions());
                    }
                    if let Err(err) = temp.persist(&self.path) {
                        self.error = Some(Error::Io { source: err.error });
                    }
                } else {
                    // Dropping the handle removes the temporary file.
                    debug!("session abort: {}", self.path.display());
                }
            }
        }

        self.reader = None;
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Prefix match on a whole path segment: `dir` covers `dir` and `dir/x`
/// but not `dir2`.
pub(crate) fn matches_prefix(path: &str, prefix: Option<&str>) -> bool {
    let Some(prefix) = prefix else {
        return false;
    };

    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
