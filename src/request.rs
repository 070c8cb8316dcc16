//! Put requests which start a new outgoing file transfer.
use crate::pdu::{TransmissionMode, UnsignedByteField};

/// File names are transferred as LV fields, so they can not be longer than 255 bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[error("file path with length {0} is too large")]
pub struct FilePathTooLarge(pub usize);

/// This trait is an abstraction for different Put Request structures which can be used
/// by Put Request consumers.
pub trait ReadablePutRequest {
    fn destination_id(&self) -> UnsignedByteField;
    fn source_file(&self) -> &str;
    fn dest_file(&self) -> &str;
    /// Falls back to the default transmission mode of the remote entity configuration if
    /// [None].
    fn trans_mode(&self) -> Option<TransmissionMode>;
    /// Falls back to the closure requested default of the remote entity configuration if
    /// [None].
    fn closure_requested(&self) -> Option<bool>;
}

pub fn generic_path_checks(source_file: &str, dest_file: &str) -> Result<(), FilePathTooLarge> {
    for path in [source_file, dest_file] {
        if path.len() > u8::MAX as usize {
            return Err(FilePathTooLarge(path.len()));
        }
    }
    Ok(())
}

/// Owned put request which requests the transfer of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PutRequest {
    pub destination_id: UnsignedByteField,
    source_file: String,
    dest_file: String,
    pub trans_mode: Option<TransmissionMode>,
    pub closure_requested: Option<bool>,
}

impl PutRequest {
    pub fn new_regular_request(
        dest_id: UnsignedByteField,
        source_file: &str,
        dest_file: &str,
        trans_mode: Option<TransmissionMode>,
        closure_requested: Option<bool>,
    ) -> Result<Self, FilePathTooLarge> {
        generic_path_checks(source_file, dest_file)?;
        Ok(Self {
            destination_id: dest_id,
            source_file: String::from(source_file),
            dest_file: String::from(dest_file),
            trans_mode,
            closure_requested,
        })
    }
}

impl ReadablePutRequest for PutRequest {
    fn destination_id(&self) -> UnsignedByteField {
        self.destination_id
    }

    fn source_file(&self) -> &str {
        &self.source_file
    }

    fn dest_file(&self) -> &str {
        &self.dest_file
    }

    fn trans_mode(&self) -> Option<TransmissionMode> {
        self.trans_mode
    }

    fn closure_requested(&self) -> Option<bool> {
        self.closure_requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEST_ID: UnsignedByteField = UnsignedByteField::new_u16(5);

    #[test]
    fn test_put_request_basic() {
        let put_request = PutRequest::new_regular_request(
            DEST_ID,
            "/tmp/hello.txt",
            "/tmp/hello2.txt",
            Some(TransmissionMode::Unacknowledged),
            Some(true),
        )
        .unwrap();
        assert_eq!(put_request.destination_id(), DEST_ID);
        assert_eq!(put_request.source_file(), "/tmp/hello.txt");
        assert_eq!(put_request.dest_file(), "/tmp/hello2.txt");
        assert_eq!(
            put_request.trans_mode(),
            Some(TransmissionMode::Unacknowledged)
        );
        assert_eq!(put_request.closure_requested(), Some(true));
    }

    #[test]
    fn test_put_request_defaults_left_open() {
        let put_request =
            PutRequest::new_regular_request(DEST_ID, "hello.txt", "hello2.txt", None, None)
                .unwrap();
        assert!(put_request.trans_mode().is_none());
        assert!(put_request.closure_requested().is_none());
    }

    #[test]
    fn test_put_request_path_checks_source_too_long() {
        let invalid_path: String = "a".repeat(u8::MAX as usize + 1);
        let error =
            PutRequest::new_regular_request(DEST_ID, &invalid_path, "target.txt", None, None)
                .unwrap_err();
        assert_eq!(error, FilePathTooLarge(u8::MAX as usize + 1));
        assert_eq!(error.to_string(), "file path with length 256 is too large");
    }

    #[test]
    fn test_put_request_path_checks_dest_file_too_long() {
        let invalid_path: String = "a".repeat(u8::MAX as usize + 1);
        let error =
            PutRequest::new_regular_request(DEST_ID, "source.txt", &invalid_path, None, None)
                .unwrap_err();
        assert_eq!(error, FilePathTooLarge(u8::MAX as usize + 1));
    }

    #[test]
    fn test_put_request_max_path_len() {
        let path: String = "a".repeat(u8::MAX as usize);
        assert!(PutRequest::new_regular_request(DEST_ID, &path, &path, None, None).is_ok());
    }
}
