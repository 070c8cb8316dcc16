//! Filestore abstraction used by the CFDP transactions.
//!
//! File paths are used as handles: every operation names the file it works on, so there is no
//! explicit open or close step. Two implementations are provided, the [NativeFilestore] which
//! uses [std::fs], and the [InMemoryFilestore] which is useful for testing and for hosts without
//! a file system.
use std::{
    fs::{self, File, OpenOptions},
    io::{BufReader, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use crc::Crc;
use hashbrown::HashMap;

use crate::{pdu::ChecksumType, CRC_32, CRC_32C};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FilestoreError {
    #[error("file does not exist")]
    FileDoesNotExist,
    #[error("file already exists")]
    FileAlreadyExists,
    #[error("is not a file")]
    IsNotFile,
    #[error("buffer too small: found {found}, expected at least {expected}")]
    BufferTooSmall { found: usize, expected: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum type not implemented: {0:?}")]
    ChecksumTypeNotImplemented(ChecksumType),
    #[error("other error")]
    Other,
}

pub trait VirtualFilestore {
    fn create_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    /// Truncating a file means deleting all its data so the resulting file is empty.
    /// This can be more efficient than removing and re-creating a file.
    fn truncate_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    /// Read exactly `read_len` bytes starting at `offset` into the passed buffer.
    fn read_data(
        &self,
        file_path: &str,
        offset: u64,
        read_len: u64,
        buf: &mut [u8],
    ) -> Result<(), FilestoreError>;

    /// Write data at the given offset. Writing past the end of the file extends it.
    fn write_data(&self, file: &str, offset: u64, buf: &[u8]) -> Result<(), FilestoreError>;

    fn is_file(&self, path: &str) -> Result<bool, FilestoreError>;

    fn exists(&self, path: &str) -> Result<bool, FilestoreError>;

    fn file_size(&self, path: &str) -> Result<u64, FilestoreError>;

    /// This special function is the CFDP specific abstraction to calculate the checksum of the
    /// first `size_to_verify` bytes of a file.
    ///
    /// The passed verification buffer argument will be used by the specific implementation as
    /// a buffer to read the file into. It is recommended to use common buffer sizes like
    /// 4096 or 8192 bytes.
    fn calculate_checksum(
        &self,
        file_path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<u32, FilestoreError>;

    fn checksum_verify(
        &self,
        expected_checksum: u32,
        file_path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<bool, FilestoreError> {
        Ok(
            self.calculate_checksum(file_path, checksum_type, size_to_verify, verification_buf)?
                == expected_checksum,
        )
    }
}

/// Modular checksum as specified in 4.2.2 of the CFDP standard: the file is interpreted as a
/// sequence of big endian 32 bit words aligned to the start of the file, with the last word
/// padded with zeros, and all words are added up.
#[derive(Debug, Default, Copy, Clone)]
pub struct ModularChecksum {
    sum: u32,
    offset: u64,
}

impl ModularChecksum {
    pub fn update(&mut self, data: &[u8]) {
        for byte in data {
            let shift = 24 - 8 * (self.offset % 4) as u32;
            self.sum = self.sum.wrapping_add((*byte as u32) << shift);
            self.offset += 1;
        }
    }

    #[inline]
    pub fn finalize(&self) -> u32 {
        self.sum
    }
}

/// Calculate the checksum over the first `size_to_verify` bytes provided by the reader. Reading
/// stops early if the reader is exhausted.
pub fn calculate_checksum_with_reader<R: Read>(
    reader: &mut R,
    checksum_type: ChecksumType,
    size_to_verify: u64,
    verification_buf: &mut [u8],
) -> Result<u32, FilestoreError> {
    let crc: Option<Crc<u32>> = match checksum_type {
        ChecksumType::NullChecksum => return Ok(0),
        ChecksumType::Modular => None,
        ChecksumType::Crc32 => Some(CRC_32),
        ChecksumType::Crc32C => Some(CRC_32C),
        _ => return Err(FilestoreError::ChecksumTypeNotImplemented(checksum_type)),
    };
    if verification_buf.is_empty() && size_to_verify > 0 {
        return Err(FilestoreError::BufferTooSmall {
            found: 0,
            expected: 1,
        });
    }
    let mut digest = crc.as_ref().map(|crc| crc.digest());
    let mut modular = ModularChecksum::default();
    let mut remaining_bytes = size_to_verify;
    while remaining_bytes > 0 {
        // Read the smaller of the remaining bytes or the buffer size
        let bytes_to_read = remaining_bytes.min(verification_buf.len() as u64) as usize;
        let bytes_read = reader.read(&mut verification_buf[0..bytes_to_read])?;
        if bytes_read == 0 {
            break;
        }
        match digest.as_mut() {
            Some(digest) => digest.update(&verification_buf[0..bytes_read]),
            None => modular.update(&verification_buf[0..bytes_read]),
        }
        remaining_bytes -= bytes_read as u64;
    }
    Ok(match digest {
        Some(digest) => digest.finalize(),
        None => modular.finalize(),
    })
}

#[derive(Default, Debug, Copy, Clone)]
pub struct NativeFilestore {}

impl NativeFilestore {
    fn check_is_existing_file(&self, file_path: &str) -> Result<(), FilestoreError> {
        if !self.exists(file_path)? {
            return Err(FilestoreError::FileDoesNotExist);
        }
        if !self.is_file(file_path)? {
            return Err(FilestoreError::IsNotFile);
        }
        Ok(())
    }
}

impl VirtualFilestore for NativeFilestore {
    fn create_file(&self, file_path: &str) -> Result<(), FilestoreError> {
        if self.exists(file_path)? {
            return Err(FilestoreError::FileAlreadyExists);
        }
        File::create(file_path)?;
        Ok(())
    }

    fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError> {
        self.check_is_existing_file(file_path)?;
        fs::remove_file(file_path)?;
        Ok(())
    }

    fn truncate_file(&self, file_path: &str) -> Result<(), FilestoreError> {
        self.check_is_existing_file(file_path)?;
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(file_path)?;
        Ok(())
    }

    fn read_data(
        &self,
        file_name: &str,
        offset: u64,
        read_len: u64,
        buf: &mut [u8],
    ) -> Result<(), FilestoreError> {
        if buf.len() < read_len as usize {
            return Err(FilestoreError::BufferTooSmall {
                found: buf.len(),
                expected: read_len as usize,
            });
        }
        self.check_is_existing_file(file_name)?;
        let mut file = File::open(file_name)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[0..read_len as usize])?;
        Ok(())
    }

    fn write_data(&self, file: &str, offset: u64, buf: &[u8]) -> Result<(), FilestoreError> {
        self.check_is_existing_file(file)?;
        let mut file = OpenOptions::new().write(true).open(file)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn is_file(&self, str_path: &str) -> Result<bool, FilestoreError> {
        let path = Path::new(str_path);
        if !path.exists() {
            return Err(FilestoreError::FileDoesNotExist);
        }
        Ok(path.is_file())
    }

    fn exists(&self, path: &str) -> Result<bool, FilestoreError> {
        Ok(Path::new(path).exists())
    }

    fn file_size(&self, str_path: &str) -> Result<u64, FilestoreError> {
        self.check_is_existing_file(str_path)?;
        Ok(Path::new(str_path).metadata()?.len())
    }

    fn calculate_checksum(
        &self,
        file_path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<u32, FilestoreError> {
        match checksum_type {
            ChecksumType::NullChecksum => return Ok(0),
            ChecksumType::Modular | ChecksumType::Crc32 | ChecksumType::Crc32C => (),
            _ => return Err(FilestoreError::ChecksumTypeNotImplemented(checksum_type)),
        }
        let mut buf_reader = BufReader::new(File::open(file_path)?);
        calculate_checksum_with_reader(
            &mut buf_reader,
            checksum_type,
            size_to_verify,
            verification_buf,
        )
    }
}

/// Filestore which keeps all files in memory. Clones share the same files, so a test can keep
/// a handle to inspect the files written by an entity.
#[derive(Default, Debug, Clone)]
pub struct InMemoryFilestore {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryFilestore {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>, FilestoreError> {
        self.files.lock().map_err(|_| FilestoreError::Other)
    }

    /// Create or replace a file with the given content.
    pub fn insert_file(&self, file_path: &str, data: &[u8]) -> Result<(), FilestoreError> {
        self.lock()?.insert(String::from(file_path), data.to_vec());
        Ok(())
    }

    /// Copy of the file content, or [None] if the file does not exist.
    pub fn file_data(&self, file_path: &str) -> Option<Vec<u8>> {
        self.lock().ok()?.get(file_path).cloned()
    }
}

/// In-memory index range of `len` bytes at `offset`, or [None] if it is not addressable.
fn byte_range(offset: u64, len: usize) -> Option<core::ops::Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    Some(start..start.checked_add(len)?)
}

impl VirtualFilestore for InMemoryFilestore {
    fn create_file(&self, file_path: &str) -> Result<(), FilestoreError> {
        let mut files = self.lock()?;
        if files.contains_key(file_path) {
            return Err(FilestoreError::FileAlreadyExists);
        }
        files.insert(String::from(file_path), Vec::new());
        Ok(())
    }

    fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError> {
        self.lock()?
            .remove(file_path)
            .map(|_| ())
            .ok_or(FilestoreError::FileDoesNotExist)
    }

    fn truncate_file(&self, file_path: &str) -> Result<(), FilestoreError> {
        self.lock()?
            .get_mut(file_path)
            .map(|data| data.clear())
            .ok_or(FilestoreError::FileDoesNotExist)
    }

    fn read_data(
        &self,
        file_path: &str,
        offset: u64,
        read_len: u64,
        buf: &mut [u8],
    ) -> Result<(), FilestoreError> {
        let read_len = read_len as usize;
        if buf.len() < read_len {
            return Err(FilestoreError::BufferTooSmall {
                found: buf.len(),
                expected: read_len,
            });
        }
        let files = self.lock()?;
        let data = files
            .get(file_path)
            .ok_or(FilestoreError::FileDoesNotExist)?;
        let range = byte_range(offset, read_len)
            .filter(|range| range.end <= data.len())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        buf[..read_len].copy_from_slice(&data[range]);
        Ok(())
    }

    fn write_data(&self, file: &str, offset: u64, buf: &[u8]) -> Result<(), FilestoreError> {
        let mut files = self.lock()?;
        let data = files.get_mut(file).ok_or(FilestoreError::FileDoesNotExist)?;
        let range = byte_range(offset, buf.len())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        if data.len() < range.end {
            data.resize(range.end, 0);
        }
        data[range].copy_from_slice(buf);
        Ok(())
    }

    fn is_file(&self, path: &str) -> Result<bool, FilestoreError> {
        if !self.exists(path)? {
            return Err(FilestoreError::FileDoesNotExist);
        }
        Ok(true)
    }

    fn exists(&self, path: &str) -> Result<bool, FilestoreError> {
        Ok(self.lock()?.contains_key(path))
    }

    fn file_size(&self, path: &str) -> Result<u64, FilestoreError> {
        self.lock()?
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or(FilestoreError::FileDoesNotExist)
    }

    fn calculate_checksum(
        &self,
        file_path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<u32, FilestoreError> {
        if checksum_type == ChecksumType::NullChecksum {
            return Ok(0);
        }
        let files = self.lock()?;
        let data = files
            .get(file_path)
            .ok_or(FilestoreError::FileDoesNotExist)?;
        let mut reader = data.as_slice();
        calculate_checksum_with_reader(
            &mut reader,
            checksum_type,
            size_to_verify,
            verification_buf,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use tempfile::tempdir;

    const EXAMPLE_DATA_CFDP: [u8; 15] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
    ];

    const NATIVE_FS: NativeFilestore = NativeFilestore {};

    fn reference_modular_checksum(data: &[u8]) -> u32 {
        data.chunks(4).fold(0_u32, |sum, chunk| {
            let mut word = [0; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            sum.wrapping_add(u32::from_be_bytes(word))
        })
    }

    #[test]
    fn test_basic_native_filestore_create() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        let result =
            NATIVE_FS.create_file(file_path.to_str().expect("getting str for file failed"));
        assert!(result.is_ok());
        assert!(file_path.exists());
        assert!(NATIVE_FS.exists(file_path.to_str().unwrap()).unwrap());
        assert!(NATIVE_FS.is_file(file_path.to_str().unwrap()).unwrap());
    }

    #[test]
    fn test_basic_native_fs_remove_file() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        NATIVE_FS
            .create_file(file_path.to_str().unwrap())
            .expect("creating file failed");
        assert!(NATIVE_FS.exists(file_path.to_str().unwrap()).unwrap());
        NATIVE_FS
            .remove_file(file_path.to_str().unwrap())
            .expect("removing file failed");
        assert!(!NATIVE_FS.exists(file_path.to_str().unwrap()).unwrap());
    }

    #[test]
    fn test_basic_native_fs_write() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        NATIVE_FS.create_file(file_path.to_str().unwrap()).unwrap();
        let write_data = "hello world\n";
        NATIVE_FS
            .write_data(file_path.to_str().unwrap(), 0, write_data.as_bytes())
            .expect("writing to file failed");
        let read_back = fs::read_to_string(&file_path).expect("reading back data failed");
        assert_eq!(read_back, write_data);
        assert_eq!(
            NATIVE_FS.file_size(file_path.to_str().unwrap()).unwrap(),
            write_data.len() as u64
        );
    }

    #[test]
    fn test_native_write_out_of_order() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        let path = file_path.to_str().unwrap();
        NATIVE_FS.create_file(path).unwrap();
        NATIVE_FS.write_data(path, 4, &[5, 6]).unwrap();
        NATIVE_FS.write_data(path, 0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(fs::read(&file_path).unwrap(), [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_truncate_file() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        NATIVE_FS
            .create_file(file_path.to_str().unwrap())
            .expect("creating file failed");
        fs::write(&file_path, [1, 2, 3, 4]).unwrap();
        NATIVE_FS
            .truncate_file(file_path.to_str().unwrap())
            .unwrap();
        assert_eq!(fs::read(&file_path).unwrap(), []);
    }

    #[test]
    fn test_read_file() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        NATIVE_FS
            .create_file(file_path.to_str().unwrap())
            .expect("creating file failed");
        fs::write(&file_path, [1, 2, 3, 4]).unwrap();
        let read_buf: &mut [u8] = &mut [0; 4];
        NATIVE_FS
            .read_data(file_path.to_str().unwrap(), 0, 4, read_buf)
            .unwrap();
        assert_eq!([1, 2, 3, 4], read_buf);
        NATIVE_FS
            .write_data(file_path.to_str().unwrap(), 4, &[5, 6, 7, 8])
            .expect("writing to file failed");
        NATIVE_FS
            .read_data(file_path.to_str().unwrap(), 2, 4, read_buf)
            .unwrap();
        assert_eq!([3, 4, 5, 6], read_buf);
    }

    #[test]
    fn test_read_which_does_not_exist() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        let result = NATIVE_FS.read_data(file_path.to_str().unwrap(), 0, 4, &mut [0; 4]);
        let error = result.unwrap_err();
        assert!(matches!(error, FilestoreError::FileDoesNotExist));
        assert_eq!(error.to_string(), "file does not exist");
    }

    #[test]
    fn test_file_already_exists() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        assert!(NATIVE_FS.create_file(file_path.to_str().unwrap()).is_ok());
        let error = NATIVE_FS
            .create_file(file_path.to_str().unwrap())
            .unwrap_err();
        assert!(matches!(error, FilestoreError::FileAlreadyExists));
        assert_eq!(error.to_string(), "file already exists");
    }

    #[test]
    fn test_remove_dir_with_file_api() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let dir_path = tmpdir.path().join("test");
        fs::create_dir(&dir_path).unwrap();
        let error = NATIVE_FS
            .remove_file(dir_path.to_str().unwrap())
            .unwrap_err();
        assert!(matches!(error, FilestoreError::IsNotFile));
        assert_eq!(error.to_string(), "is not a file");
    }

    #[test]
    fn test_buffer_too_small_when_reading() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        NATIVE_FS.create_file(file_path.to_str().unwrap()).unwrap();
        let error = NATIVE_FS
            .read_data(file_path.to_str().unwrap(), 0, 2, &mut [])
            .unwrap_err();
        assert!(matches!(
            error,
            FilestoreError::BufferTooSmall {
                found: 0,
                expected: 2
            }
        ));
    }

    #[test]
    fn test_write_file_non_existing() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        let result = NATIVE_FS.write_data(file_path.to_str().unwrap(), 0, &[]);
        assert!(matches!(result, Err(FilestoreError::FileDoesNotExist)));
    }

    #[test]
    fn test_modular_checksum() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("mod-crc.bin");
        fs::write(file_path.as_path(), EXAMPLE_DATA_CFDP).expect("writing test file failed");
        let expected = reference_modular_checksum(&EXAMPLE_DATA_CFDP);
        // Odd verification buffer size so the words are split across reads.
        let mut verif_buf: [u8; 3] = [0; 3];
        let result = NATIVE_FS.checksum_verify(
            expected,
            file_path.to_str().unwrap(),
            ChecksumType::Modular,
            EXAMPLE_DATA_CFDP.len() as u64,
            &mut verif_buf,
        );
        assert!(result.unwrap());
    }

    #[test]
    fn test_modular_checksum_incremental() {
        let mut checksum = ModularChecksum::default();
        checksum.update(&[0x01]);
        checksum.update(&[0x02, 0x03, 0x04, 0x05]);
        assert_eq!(checksum.finalize(), 0x0102_0304 + 0x0500_0000);
    }

    #[test]
    fn test_crc32_checksum() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("crc.bin");
        fs::write(file_path.as_path(), b"123456789").unwrap();
        let mut verif_buf = [0; 4];
        assert_eq!(
            NATIVE_FS
                .calculate_checksum(
                    file_path.to_str().unwrap(),
                    ChecksumType::Crc32,
                    9,
                    &mut verif_buf
                )
                .unwrap(),
            0xCBF4_3926
        );
        assert_eq!(
            NATIVE_FS
                .calculate_checksum(
                    file_path.to_str().unwrap(),
                    ChecksumType::Crc32C,
                    9,
                    &mut verif_buf
                )
                .unwrap(),
            0xE306_9283
        );
        // Checksum over a prefix of the file.
        assert_eq!(
            NATIVE_FS
                .calculate_checksum(
                    file_path.to_str().unwrap(),
                    ChecksumType::Crc32,
                    4,
                    &mut verif_buf
                )
                .unwrap(),
            CRC_32.checksum(b"1234")
        );
    }

    #[test]
    fn test_null_checksum_impl() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("mod-crc.bin");
        // The file to check does not even need to exist, and the verification buffer can be
        // empty: the null checksum always yields the same result.
        let result = NATIVE_FS.checksum_verify(
            0,
            file_path.to_str().unwrap(),
            ChecksumType::NullChecksum,
            0,
            &mut [],
        );
        assert!(result.unwrap());
    }

    #[test]
    fn test_checksum_not_implemented() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("mod-crc.bin");
        let error = NATIVE_FS
            .checksum_verify(
                0,
                file_path.to_str().unwrap(),
                ChecksumType::Crc32Proximity1,
                0,
                &mut [],
            )
            .unwrap_err();
        assert!(matches!(
            error,
            FilestoreError::ChecksumTypeNotImplemented(ChecksumType::Crc32Proximity1)
        ));
        assert_eq!(
            error.to_string(),
            "checksum type not implemented: Crc32Proximity1"
        );
    }

    #[test]
    fn test_in_memory_filestore() {
        let filestore = InMemoryFilestore::default();
        let shared = filestore.clone();
        assert!(!filestore.exists("test.bin").unwrap());
        filestore.create_file("test.bin").unwrap();
        assert!(matches!(
            filestore.create_file("test.bin"),
            Err(FilestoreError::FileAlreadyExists)
        ));
        filestore.write_data("test.bin", 2, &[3, 4]).unwrap();
        filestore.write_data("test.bin", 0, &[1, 2]).unwrap();
        assert_eq!(shared.file_data("test.bin").unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(filestore.file_size("test.bin").unwrap(), 4);
        let mut buf = [0; 2];
        filestore.read_data("test.bin", 1, 2, &mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
        assert!(matches!(
            filestore.read_data("test.bin", 3, 2, &mut buf),
            Err(FilestoreError::Io(_))
        ));
        filestore.truncate_file("test.bin").unwrap();
        assert_eq!(filestore.file_size("test.bin").unwrap(), 0);
        filestore.remove_file("test.bin").unwrap();
        assert!(shared.file_data("test.bin").is_none());
        assert!(matches!(
            filestore.remove_file("test.bin"),
            Err(FilestoreError::FileDoesNotExist)
        ));
    }

    #[test]
    fn test_in_memory_unaddressable_offsets() {
        let filestore = InMemoryFilestore::default();
        filestore.insert_file("test.bin", &[1, 2, 3, 4]).unwrap();
        assert!(matches!(
            filestore.write_data("test.bin", u64::MAX - 1, &[1, 2, 3, 4]),
            Err(FilestoreError::Io(_))
        ));
        let mut buf = [0; 4];
        assert!(matches!(
            filestore.read_data("test.bin", u64::MAX, 4, &mut buf),
            Err(FilestoreError::Io(_))
        ));
        assert_eq!(filestore.file_data("test.bin").unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_in_memory_checksums_match_native() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("data.bin");
        fs::write(&file_path, EXAMPLE_DATA_CFDP).unwrap();
        let in_mem = InMemoryFilestore::default();
        in_mem.insert_file("data.bin", &EXAMPLE_DATA_CFDP).unwrap();
        let mut buf = [0; 8];
        for checksum_type in [
            ChecksumType::Modular,
            ChecksumType::Crc32,
            ChecksumType::Crc32C,
            ChecksumType::NullChecksum,
        ] {
            assert_eq!(
                in_mem
                    .calculate_checksum("data.bin", checksum_type, 15, &mut buf)
                    .unwrap(),
                NATIVE_FS
                    .calculate_checksum(file_path.to_str().unwrap(), checksum_type, 15, &mut buf)
                    .unwrap()
            );
        }
    }
}
