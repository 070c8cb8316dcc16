use smallvec::SmallVec;

use super::{
    read_fss_field, write_fss_field, ChecksumType, ConditionCode, DeliveryCode, FileDirectiveType,
    FileStatus, LargeFileFlag, PduError, PduHeader, PduType, PromptResponse,
    RecordContinuationState, SegmentMetadataFlag, TransactionStatus, UnsignedByteField,
    TLV_TYPE_ENTITY_ID,
};

/// Segment requests of a NAK PDU as (start offset, end offset) pairs. Most NAKs only carry a
/// few gaps, so these are stored inline.
pub type SegmentRequests = SmallVec<[(u64, u64); 4]>;

fn condition_code_from_raw(raw: u8) -> Result<ConditionCode, PduError> {
    ConditionCode::try_from(raw).map_err(|_| PduError::InvalidConditionCode(raw))
}

fn write_lv_str(buf: &mut [u8], value: &str) -> Result<usize, PduError> {
    if value.len() > u8::MAX as usize {
        return Err(PduError::StringTooLong(value.len()));
    }
    buf[0] = value.len() as u8;
    buf[1..1 + value.len()].copy_from_slice(value.as_bytes());
    Ok(1 + value.len())
}

fn read_lv_str(buf: &[u8]) -> Result<(String, usize), PduError> {
    if buf.is_empty() {
        return Err(PduError::MalformedBody(FileDirectiveType::MetadataPdu));
    }
    let len = buf[0] as usize;
    if buf.len() < 1 + len {
        return Err(PduError::MalformedBody(FileDirectiveType::MetadataPdu));
    }
    let value = core::str::from_utf8(&buf[1..1 + len]).map_err(|_| PduError::InvalidFileName)?;
    Ok((String::from(value), 1 + len))
}

fn fault_location_len(fault_location: &Option<UnsignedByteField>) -> usize {
    fault_location.map(|id| 2 + id.size()).unwrap_or(0)
}

fn write_fault_location(
    buf: &mut [u8],
    fault_location: &Option<UnsignedByteField>,
) -> Result<usize, PduError> {
    match fault_location {
        Some(entity_id) => {
            buf[0] = TLV_TYPE_ENTITY_ID;
            buf[1] = entity_id.size() as u8;
            Ok(2 + entity_id.write_to_be_bytes(&mut buf[2..])?)
        }
        None => Ok(0),
    }
}

/// Parses the trailing TLVs of EOF and Finished PDUs. Only the fault location is retained,
/// other TLVs like filestore responses are skipped.
fn read_fault_location(
    buf: &[u8],
    directive: FileDirectiveType,
) -> Result<Option<UnsignedByteField>, PduError> {
    let mut fault_location = None;
    let mut current_idx = 0;
    while current_idx < buf.len() {
        if buf.len() < current_idx + 2 {
            return Err(PduError::MalformedBody(directive));
        }
        let tlv_type = buf[current_idx];
        let tlv_len = buf[current_idx + 1] as usize;
        current_idx += 2;
        if buf.len() < current_idx + tlv_len {
            return Err(PduError::MalformedBody(directive));
        }
        if tlv_type == TLV_TYPE_ENTITY_ID {
            fault_location = Some(UnsignedByteField::from_be_bytes(
                tlv_len,
                &buf[current_idx..current_idx + tlv_len],
            )?);
        }
        current_idx += tlv_len;
    }
    Ok(fault_location)
}

/// Metadata PDU, see 5.2.5 of the standard. Options are kept as raw TLV bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPdu {
    pub closure_requested: bool,
    pub checksum_type: ChecksumType,
    pub file_size: u64,
    pub src_file_name: String,
    pub dest_file_name: String,
    pub options: Vec<u8>,
}

impl MetadataPdu {
    pub fn new(
        closure_requested: bool,
        checksum_type: ChecksumType,
        file_size: u64,
        src_file_name: &str,
        dest_file_name: &str,
    ) -> Self {
        Self {
            closure_requested,
            checksum_type,
            file_size,
            src_file_name: String::from(src_file_name),
            dest_file_name: String::from(dest_file_name),
            options: Vec::new(),
        }
    }

    fn len_written(&self, file_flag: LargeFileFlag) -> usize {
        1 + file_flag.fss_len()
            + 1
            + self.src_file_name.len()
            + 1
            + self.dest_file_name.len()
            + self.options.len()
    }

    fn write_to_bytes(&self, buf: &mut [u8], file_flag: LargeFileFlag) -> Result<usize, PduError> {
        buf[0] = ((self.closure_requested as u8) << 6) | (self.checksum_type as u8);
        let mut current_idx = 1;
        current_idx += write_fss_field(file_flag, self.file_size, &mut buf[current_idx..])?;
        current_idx += write_lv_str(&mut buf[current_idx..], &self.src_file_name)?;
        current_idx += write_lv_str(&mut buf[current_idx..], &self.dest_file_name)?;
        buf[current_idx..current_idx + self.options.len()].copy_from_slice(&self.options);
        Ok(current_idx + self.options.len())
    }

    fn from_bytes(buf: &[u8], file_flag: LargeFileFlag) -> Result<Self, PduError> {
        if buf.is_empty() {
            return Err(PduError::MalformedBody(FileDirectiveType::MetadataPdu));
        }
        let closure_requested = ((buf[0] >> 6) & 0b1) == 1;
        let raw_checksum_type = buf[0] & 0b1111;
        let checksum_type = ChecksumType::try_from(raw_checksum_type)
            .map_err(|_| PduError::InvalidChecksumType(raw_checksum_type))?;
        let mut current_idx = 1;
        let (file_size, fss_len) = read_fss_field(file_flag, &buf[current_idx..])
            .ok_or(PduError::MalformedBody(FileDirectiveType::MetadataPdu))?;
        current_idx += fss_len;
        let (src_file_name, lv_len) = read_lv_str(&buf[current_idx..])?;
        current_idx += lv_len;
        let (dest_file_name, lv_len) = read_lv_str(&buf[current_idx..])?;
        current_idx += lv_len;
        Ok(Self {
            closure_requested,
            checksum_type,
            file_size,
            src_file_name,
            dest_file_name,
            options: buf[current_idx..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMetadata {
    pub record_continuation_state: RecordContinuationState,
    pub metadata: Vec<u8>,
}

/// File Data PDU, see 5.3 of the standard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDataPdu {
    pub segment_metadata: Option<SegmentMetadata>,
    pub offset: u64,
    pub file_data: Vec<u8>,
}

impl FileDataPdu {
    pub fn new(offset: u64, file_data: &[u8]) -> Self {
        Self {
            segment_metadata: None,
            offset,
            file_data: file_data.to_vec(),
        }
    }

    pub fn new_with_seg_metadata(
        offset: u64,
        record_continuation_state: RecordContinuationState,
        metadata: &[u8],
        file_data: &[u8],
    ) -> Result<Self, PduError> {
        if metadata.len() > 63 {
            return Err(PduError::SegmentMetadataTooLarge(metadata.len()));
        }
        Ok(Self {
            segment_metadata: Some(SegmentMetadata {
                record_continuation_state,
                metadata: metadata.to_vec(),
            }),
            offset,
            file_data: file_data.to_vec(),
        })
    }

    /// Exclusive end offset of the contained file segment, or [None] if it does not fit into
    /// a 64-bit offset.
    #[inline]
    pub fn end_offset(&self) -> Option<u64> {
        self.offset.checked_add(self.file_data.len() as u64)
    }

    fn len_written(&self, file_flag: LargeFileFlag) -> usize {
        let seg_metadata_len = self
            .segment_metadata
            .as_ref()
            .map(|seg_meta| 1 + seg_meta.metadata.len())
            .unwrap_or(0);
        seg_metadata_len + file_flag.fss_len() + self.file_data.len()
    }

    fn write_to_bytes(&self, buf: &mut [u8], file_flag: LargeFileFlag) -> Result<usize, PduError> {
        let mut current_idx = 0;
        if let Some(seg_meta) = &self.segment_metadata {
            if seg_meta.metadata.len() > 63 {
                return Err(PduError::SegmentMetadataTooLarge(seg_meta.metadata.len()));
            }
            buf[0] =
                ((seg_meta.record_continuation_state as u8) << 6) | seg_meta.metadata.len() as u8;
            buf[1..1 + seg_meta.metadata.len()].copy_from_slice(&seg_meta.metadata);
            current_idx += 1 + seg_meta.metadata.len();
        }
        current_idx += write_fss_field(file_flag, self.offset, &mut buf[current_idx..])?;
        buf[current_idx..current_idx + self.file_data.len()].copy_from_slice(&self.file_data);
        Ok(current_idx + self.file_data.len())
    }

    fn from_bytes(
        buf: &[u8],
        seg_metadata_flag: SegmentMetadataFlag,
        file_flag: LargeFileFlag,
    ) -> Result<Self, PduError> {
        let mut current_idx = 0;
        let mut segment_metadata = None;
        if seg_metadata_flag == SegmentMetadataFlag::Present {
            if buf.is_empty() {
                return Err(PduError::MalformedFileData);
            }
            let record_continuation_state = RecordContinuationState::try_from(buf[0] >> 6)
                .map_err(|_| PduError::MalformedFileData)?;
            let seg_metadata_len = (buf[0] & 0b11_1111) as usize;
            if buf.len() < 1 + seg_metadata_len {
                return Err(PduError::MalformedFileData);
            }
            segment_metadata = Some(SegmentMetadata {
                record_continuation_state,
                metadata: buf[1..1 + seg_metadata_len].to_vec(),
            });
            current_idx += 1 + seg_metadata_len;
        }
        let (offset, fss_len) =
            read_fss_field(file_flag, &buf[current_idx..]).ok_or(PduError::MalformedFileData)?;
        current_idx += fss_len;
        Ok(Self {
            segment_metadata,
            offset,
            file_data: buf[current_idx..].to_vec(),
        })
    }
}

/// End-of-File PDU, see 5.2.2 of the standard.
#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_new::new)]
pub struct EofPdu {
    pub condition_code: ConditionCode,
    pub file_checksum: u32,
    pub file_size: u64,
    pub fault_location: Option<UnsignedByteField>,
}

impl EofPdu {
    pub fn new_no_error(file_checksum: u32, file_size: u64) -> Self {
        Self::new(ConditionCode::NoError, file_checksum, file_size, None)
    }

    fn len_written(&self, file_flag: LargeFileFlag) -> usize {
        1 + 4 + file_flag.fss_len() + fault_location_len(&self.fault_location)
    }

    fn write_to_bytes(&self, buf: &mut [u8], file_flag: LargeFileFlag) -> Result<usize, PduError> {
        buf[0] = (self.condition_code as u8) << 4;
        buf[1..5].copy_from_slice(&self.file_checksum.to_be_bytes());
        let mut current_idx = 5;
        current_idx += write_fss_field(file_flag, self.file_size, &mut buf[current_idx..])?;
        current_idx += write_fault_location(&mut buf[current_idx..], &self.fault_location)?;
        Ok(current_idx)
    }

    fn from_bytes(buf: &[u8], file_flag: LargeFileFlag) -> Result<Self, PduError> {
        if buf.len() < 5 {
            return Err(PduError::MalformedBody(FileDirectiveType::EofPdu));
        }
        let condition_code = condition_code_from_raw(buf[0] >> 4)?;
        let file_checksum = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let (file_size, fss_len) = read_fss_field(file_flag, &buf[5..])
            .ok_or(PduError::MalformedBody(FileDirectiveType::EofPdu))?;
        let fault_location = read_fault_location(&buf[5 + fss_len..], FileDirectiveType::EofPdu)?;
        Ok(Self {
            condition_code,
            file_checksum,
            file_size,
            fault_location,
        })
    }
}

/// Finished PDU, see 5.2.3 of the standard. Filestore responses are not retained.
#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_new::new)]
pub struct FinishedPdu {
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
    pub fault_location: Option<UnsignedByteField>,
}

impl FinishedPdu {
    pub fn new_no_error(delivery_code: DeliveryCode, file_status: FileStatus) -> Self {
        Self::new(ConditionCode::NoError, delivery_code, file_status, None)
    }

    fn len_written(&self) -> usize {
        1 + fault_location_len(&self.fault_location)
    }

    fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        buf[0] = ((self.condition_code as u8) << 4)
            | ((self.delivery_code as u8) << 2)
            | (self.file_status as u8);
        Ok(1 + write_fault_location(&mut buf[1..], &self.fault_location)?)
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        if buf.is_empty() {
            return Err(PduError::MalformedBody(FileDirectiveType::FinishedPdu));
        }
        let condition_code = condition_code_from_raw(buf[0] >> 4)?;
        let delivery_code = DeliveryCode::try_from((buf[0] >> 2) & 0b1)
            .map_err(|_| PduError::MalformedBody(FileDirectiveType::FinishedPdu))?;
        let file_status = FileStatus::try_from(buf[0] & 0b11)
            .map_err(|_| PduError::MalformedBody(FileDirectiveType::FinishedPdu))?;
        let fault_location = read_fault_location(&buf[1..], FileDirectiveType::FinishedPdu)?;
        Ok(Self {
            condition_code,
            delivery_code,
            file_status,
            fault_location,
        })
    }
}

/// ACK PDU, see 5.2.4 of the standard. Only EOF and Finished PDUs can be acknowledged.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AckPdu {
    directive_code_of_acked_pdu: FileDirectiveType,
    pub condition_code: ConditionCode,
    pub transaction_status: TransactionStatus,
}

impl AckPdu {
    pub fn new(
        directive_code_of_acked_pdu: FileDirectiveType,
        condition_code: ConditionCode,
        transaction_status: TransactionStatus,
    ) -> Result<Self, PduError> {
        if directive_code_of_acked_pdu != FileDirectiveType::EofPdu
            && directive_code_of_acked_pdu != FileDirectiveType::FinishedPdu
        {
            return Err(PduError::InvalidAckedDirective(
                directive_code_of_acked_pdu as u8,
            ));
        }
        Ok(Self {
            directive_code_of_acked_pdu,
            condition_code,
            transaction_status,
        })
    }

    pub fn new_for_eof(condition_code: ConditionCode, transaction_status: TransactionStatus) -> Self {
        Self {
            directive_code_of_acked_pdu: FileDirectiveType::EofPdu,
            condition_code,
            transaction_status,
        }
    }

    pub fn new_for_finished(
        condition_code: ConditionCode,
        transaction_status: TransactionStatus,
    ) -> Self {
        Self {
            directive_code_of_acked_pdu: FileDirectiveType::FinishedPdu,
            condition_code,
            transaction_status,
        }
    }

    #[inline]
    pub fn directive_code_of_acked_pdu(&self) -> FileDirectiveType {
        self.directive_code_of_acked_pdu
    }

    fn write_to_bytes(&self, buf: &mut [u8]) -> usize {
        let subtype = match self.directive_code_of_acked_pdu {
            FileDirectiveType::FinishedPdu => 0b0001,
            _ => 0b0000,
        };
        buf[0] = ((self.directive_code_of_acked_pdu as u8) << 4) | subtype;
        buf[1] = ((self.condition_code as u8) << 4) | (self.transaction_status as u8);
        2
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        if buf.len() != 2 {
            return Err(PduError::MalformedBody(FileDirectiveType::AckPdu));
        }
        let raw_acked = buf[0] >> 4;
        let acked = FileDirectiveType::try_from(raw_acked)
            .map_err(|_| PduError::InvalidAckedDirective(raw_acked))?;
        let condition_code = condition_code_from_raw(buf[1] >> 4)?;
        let transaction_status = TransactionStatus::try_from(buf[1] & 0b11)
            .map_err(|_| PduError::MalformedBody(FileDirectiveType::AckPdu))?;
        Self::new(acked, condition_code, transaction_status)
    }
}

/// NAK PDU, see 5.2.6 of the standard. A segment request of (0, 0) requests the Metadata PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakPdu {
    pub start_of_scope: u64,
    pub end_of_scope: u64,
    pub segment_requests: SegmentRequests,
}

impl NakPdu {
    pub fn new(start_of_scope: u64, end_of_scope: u64, segment_requests: &[(u64, u64)]) -> Self {
        Self {
            start_of_scope,
            end_of_scope,
            segment_requests: SmallVec::from_slice(segment_requests),
        }
    }

    fn len_written(&self, file_flag: LargeFileFlag) -> usize {
        (2 + 2 * self.segment_requests.len()) * file_flag.fss_len()
    }

    fn write_to_bytes(&self, buf: &mut [u8], file_flag: LargeFileFlag) -> Result<usize, PduError> {
        let mut current_idx = write_fss_field(file_flag, self.start_of_scope, buf)?;
        current_idx += write_fss_field(file_flag, self.end_of_scope, &mut buf[current_idx..])?;
        for (start, end) in &self.segment_requests {
            current_idx += write_fss_field(file_flag, *start, &mut buf[current_idx..])?;
            current_idx += write_fss_field(file_flag, *end, &mut buf[current_idx..])?;
        }
        Ok(current_idx)
    }

    fn from_bytes(buf: &[u8], file_flag: LargeFileFlag) -> Result<Self, PduError> {
        let fss_len = file_flag.fss_len();
        if buf.len() < 2 * fss_len || buf.len() % (2 * fss_len) != 0 {
            return Err(PduError::MalformedBody(FileDirectiveType::NakPdu));
        }
        let read = |idx: usize| {
            read_fss_field(file_flag, &buf[idx..])
                .map(|(value, _)| value)
                .ok_or(PduError::MalformedBody(FileDirectiveType::NakPdu))
        };
        let start_of_scope = read(0)?;
        let end_of_scope = read(fss_len)?;
        let mut segment_requests = SegmentRequests::new();
        let mut current_idx = 2 * fss_len;
        while current_idx < buf.len() {
            segment_requests.push((read(current_idx)?, read(current_idx + fss_len)?));
            current_idx += 2 * fss_len;
        }
        Ok(Self {
            start_of_scope,
            end_of_scope,
            segment_requests,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_new::new)]
pub struct KeepAlivePdu {
    pub progress: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_new::new)]
pub struct PromptPdu {
    pub response_required: PromptResponse,
}

/// Typed PDU body. File directive bodies are written with their directive code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduBody {
    Metadata(MetadataPdu),
    FileData(FileDataPdu),
    Eof(EofPdu),
    Ack(AckPdu),
    Nak(NakPdu),
    Finished(FinishedPdu),
    KeepAlive(KeepAlivePdu),
    Prompt(PromptPdu),
}

impl PduBody {
    pub fn pdu_type(&self) -> PduType {
        match self {
            PduBody::FileData(_) => PduType::FileData,
            _ => PduType::FileDirective,
        }
    }

    pub fn directive_type(&self) -> Option<FileDirectiveType> {
        Some(match self {
            PduBody::FileData(_) => return None,
            PduBody::Metadata(_) => FileDirectiveType::MetadataPdu,
            PduBody::Eof(_) => FileDirectiveType::EofPdu,
            PduBody::Ack(_) => FileDirectiveType::AckPdu,
            PduBody::Nak(_) => FileDirectiveType::NakPdu,
            PduBody::Finished(_) => FileDirectiveType::FinishedPdu,
            PduBody::KeepAlive(_) => FileDirectiveType::KeepAlivePdu,
            PduBody::Prompt(_) => FileDirectiveType::PromptPdu,
        })
    }

    /// Length of the body including the directive code for file directive PDUs.
    pub fn len_written(&self, file_flag: LargeFileFlag) -> usize {
        let directive_len = 1;
        match self {
            PduBody::FileData(fd) => fd.len_written(file_flag),
            PduBody::Metadata(md) => directive_len + md.len_written(file_flag),
            PduBody::Eof(eof) => directive_len + eof.len_written(file_flag),
            PduBody::Ack(_) => directive_len + 2,
            PduBody::Nak(nak) => directive_len + nak.len_written(file_flag),
            PduBody::Finished(finished) => directive_len + finished.len_written(),
            PduBody::KeepAlive(_) => directive_len + file_flag.fss_len(),
            PduBody::Prompt(_) => directive_len + 1,
        }
    }

    pub fn write_to_bytes(
        &self,
        buf: &mut [u8],
        file_flag: LargeFileFlag,
    ) -> Result<usize, PduError> {
        let expected = self.len_written(file_flag);
        if buf.len() < expected {
            return Err(PduError::ToSliceTooSmall {
                found: buf.len(),
                expected,
            });
        }
        let directive = match self.directive_type() {
            Some(directive) => directive,
            None => {
                if let PduBody::FileData(fd) = self {
                    return fd.write_to_bytes(buf, file_flag);
                }
                return Err(PduError::MalformedFileData);
            }
        };
        buf[0] = directive as u8;
        let body_buf = &mut buf[1..];
        let body_len = match self {
            PduBody::Metadata(md) => md.write_to_bytes(body_buf, file_flag)?,
            PduBody::Eof(eof) => eof.write_to_bytes(body_buf, file_flag)?,
            PduBody::Ack(ack) => ack.write_to_bytes(body_buf),
            PduBody::Nak(nak) => nak.write_to_bytes(body_buf, file_flag)?,
            PduBody::Finished(finished) => finished.write_to_bytes(body_buf)?,
            PduBody::KeepAlive(keep_alive) => {
                write_fss_field(file_flag, keep_alive.progress, body_buf)?
            }
            PduBody::Prompt(prompt) => {
                body_buf[0] = (prompt.response_required as u8) << 7;
                1
            }
            PduBody::FileData(_) => 0,
        };
        Ok(1 + body_len)
    }

    /// Reads the body from the PDU data field, excluding the optional CRC.
    pub fn from_bytes(header: &PduHeader, buf: &[u8]) -> Result<Self, PduError> {
        let file_flag = header.common_pdu_conf().file_flag;
        if header.pdu_type() == PduType::FileData {
            return Ok(PduBody::FileData(FileDataPdu::from_bytes(
                buf,
                header.seg_metadata_flag(),
                file_flag,
            )?));
        }
        if buf.is_empty() {
            return Err(PduError::FromSliceTooSmall {
                found: 0,
                expected: 1,
            });
        }
        let directive =
            FileDirectiveType::try_from(buf[0]).map_err(|_| PduError::InvalidDirectiveType(buf[0]))?;
        let body_buf = &buf[1..];
        Ok(match directive {
            FileDirectiveType::MetadataPdu => {
                PduBody::Metadata(MetadataPdu::from_bytes(body_buf, file_flag)?)
            }
            FileDirectiveType::EofPdu => PduBody::Eof(EofPdu::from_bytes(body_buf, file_flag)?),
            FileDirectiveType::AckPdu => PduBody::Ack(AckPdu::from_bytes(body_buf)?),
            FileDirectiveType::NakPdu => PduBody::Nak(NakPdu::from_bytes(body_buf, file_flag)?),
            FileDirectiveType::FinishedPdu => {
                PduBody::Finished(FinishedPdu::from_bytes(body_buf)?)
            }
            FileDirectiveType::KeepAlivePdu => {
                if body_buf.len() != file_flag.fss_len() {
                    return Err(PduError::MalformedBody(directive));
                }
                let (progress, _) = read_fss_field(file_flag, body_buf)
                    .ok_or(PduError::MalformedBody(directive))?;
                PduBody::KeepAlive(KeepAlivePdu::new(progress))
            }
            FileDirectiveType::PromptPdu => {
                if body_buf.len() != 1 {
                    return Err(PduError::MalformedBody(directive));
                }
                let response_required = if (body_buf[0] >> 7) == 0 {
                    PromptResponse::Nak
                } else {
                    PromptResponse::KeepAlive
                };
                PduBody::Prompt(PromptPdu::new(response_required))
            }
        })
    }
}
