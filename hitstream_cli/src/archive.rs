// Recorded timeslice archives, as written by the replay tooling.
//
// File header:  magic "HTSA", u32 version, u64 number of timeslices
// Per timeslice: u64 index, u32 core microslices, u32 components
// Per component: u32 microslices
// Per microslice: u32 equipment id, u8 sys id, u16 flags, u64 start time (ns), u32 size,
//                 then size bytes of content
//
// Everything is little endian.
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

use libhitstream::timeslice::{MicrosliceDescriptor, OwnedTimeslice};

const MAGIC: &[u8; 4] = b"HTSA";
const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("File {0:?} is not a timeslice archive")]
    BadMagic(PathBuf),
    #[error("Archive version {0} is not supported")]
    UnsupportedVersion(u32),
    #[error("Archive ended after {0} of {1} timeslices")]
    Truncated(usize, usize),
}

/// Sequential reader over the timeslices of one archive file
#[derive(Debug)]
pub struct ArchiveReader {
    reader: BufReader<File>,
    n_timeslices: usize,
    n_read: usize,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ArchiveError::BadMagic(path.to_path_buf()));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(ArchiveError::UnsupportedVersion(version));
        }
        let n_timeslices = reader.read_u64::<LittleEndian>()? as usize;
        Ok(Self {
            reader,
            n_timeslices,
            n_read: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.n_timeslices
    }

    pub fn is_empty(&self) -> bool {
        self.n_timeslices == 0
    }

    fn read_timeslice(&mut self) -> Result<OwnedTimeslice, ArchiveError> {
        let index = self.reader.read_u64::<LittleEndian>()?;
        let n_core = self.reader.read_u32::<LittleEndian>()? as usize;
        let n_components = self.reader.read_u32::<LittleEndian>()? as usize;
        let mut timeslice = OwnedTimeslice::new(index, n_core);
        for component in 0..n_components {
            let n_microslices = self.reader.read_u32::<LittleEndian>()?;
            for _ in 0..n_microslices {
                let equipment_id = self.reader.read_u32::<LittleEndian>()?;
                let sys_id = self.reader.read_u8()?;
                let flags = self.reader.read_u16::<LittleEndian>()?;
                let start = self.reader.read_u64::<LittleEndian>()?;
                let size = self.reader.read_u32::<LittleEndian>()? as usize;
                let mut content = vec![0u8; size];
                self.reader.read_exact(&mut content)?;
                let descriptor = MicrosliceDescriptor {
                    equipment_id,
                    sys_id,
                    index: start,
                    size: size as u32,
                    flags,
                };
                timeslice.push_microslice(component, descriptor, content);
            }
        }
        Ok(timeslice)
    }
}

impl Iterator for ArchiveReader {
    type Item = Result<OwnedTimeslice, ArchiveError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.n_read >= self.n_timeslices {
            return None;
        }
        let result = match self.read_timeslice() {
            Err(ArchiveError::IOError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(ArchiveError::Truncated(self.n_read, self.n_timeslices))
            }
            other => other,
        };
        // A broken record leaves the stream misaligned, stop after reporting it
        self.n_read = if result.is_ok() {
            self.n_read + 1
        } else {
            self.n_timeslices
        };
        Some(result)
    }
}

/// Write timeslices into a new archive
#[cfg(test)]
fn write_archive<T: libhitstream::timeslice::TimesliceSource>(
    path: &Path,
    timeslices: &[T],
) -> Result<(), ArchiveError> {
    use byteorder::WriteBytesExt;
    use std::io::{BufWriter, Write};

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(MAGIC)?;
    writer.write_u32::<LittleEndian>(VERSION)?;
    writer.write_u64::<LittleEndian>(timeslices.len() as u64)?;
    for timeslice in timeslices {
        writer.write_u64::<LittleEndian>(timeslice.index())?;
        writer.write_u32::<LittleEndian>(timeslice.num_core_microslices() as u32)?;
        writer.write_u32::<LittleEndian>(timeslice.num_components() as u32)?;
        for component in 0..timeslice.num_components() {
            let n_microslices = timeslice.num_microslices(component);
            writer.write_u32::<LittleEndian>(n_microslices as u32)?;
            for ms in 0..n_microslices {
                let descriptor = timeslice.descriptor(component, ms).unwrap_or_default();
                let content = timeslice.content(component, ms).unwrap_or_default();
                writer.write_u32::<LittleEndian>(descriptor.equipment_id)?;
                writer.write_u8(descriptor.sys_id)?;
                writer.write_u16::<LittleEndian>(descriptor.flags)?;
                writer.write_u64::<LittleEndian>(descriptor.index)?;
                writer.write_u32::<LittleEndian>(content.len() as u32)?;
                writer.write_all(content)?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libhitstream::timeslice::TimesliceSource;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hitstream_{}_{}.tsa", name, std::process::id()))
    }

    fn sample(index: u64) -> OwnedTimeslice {
        let mut ts = OwnedTimeslice::new(index, 1);
        for component in 0..2 {
            for ms in 0..2u64 {
                let descriptor = MicrosliceDescriptor {
                    equipment_id: 0x100 + component as u32,
                    sys_id: 0x60,
                    index: index * 2000 + ms * 1000,
                    size: 0,
                    flags: 1,
                };
                ts.push_microslice(component, descriptor, vec![ms as u8; 8 * (ms as usize + 1)]);
            }
        }
        ts
    }

    #[test]
    fn test_read_back() {
        let path = temp_path("read_back");
        write_archive(&path, &[sample(5), sample(6)]).unwrap();

        let reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.len(), 2);
        let timeslices: Vec<OwnedTimeslice> = reader.collect::<Result<_, _>>().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(timeslices.len(), 2);
        let ts = &timeslices[1];
        assert_eq!(ts.index(), 6);
        assert_eq!(ts.num_components(), 2);
        assert_eq!(ts.num_core_microslices(), 1);
        let descriptor = ts.descriptor(1, 1).unwrap();
        assert_eq!(descriptor.equipment_id, 0x101);
        assert_eq!(descriptor.index, 13000);
        assert_eq!(descriptor.size, 16);
        assert_eq!(ts.content(1, 1), Some(&[1u8; 16][..]));
    }

    #[test]
    fn test_truncated_archive() {
        let path = temp_path("truncated");
        write_archive(&path, &[sample(0), sample(1)]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

        let results: Vec<_> = ArchiveReader::open(&path).unwrap().collect();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ArchiveError::Truncated(1, 2))));
    }

    #[test]
    fn test_bad_magic() {
        let path = temp_path("bad_magic");
        std::fs::write(&path, b"NOPE\x01\x00\x00\x00").unwrap();
        let result = ArchiveReader::open(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(ArchiveError::BadMagic(_))));
    }
}
