//! # CFDP Destination Transaction Module
//!
//! A [DestinationTransaction] receives one file from a remote CFDP source entity. It is created
//! by the [crate::entity::Entity] when the first PDU of an unknown transaction arrives: a
//! Metadata PDU in both transmission modes, or a File Data or EOF PDU in unacknowledged mode.
//! In the latter case the received PDUs are buffered until the Metadata PDU arrives.
//!
//! The transaction goes through the following steps:
//!
//! 1. The Metadata PDU creates (or truncates) the destination file.
//! 2. All File Data PDUs are written at their offset and recorded in a [ReceivedSegments] set.
//! 3. The EOF PDU is received. It is acknowledged in acknowledged mode. Missing file data is
//!    requested with NAK PDUs in acknowledged mode, while the unacknowledged mode waits for
//!    out-of-order data guarded by the check timer.
//! 4. Once the file is complete, its checksum is verified.
//!
//! If this is an unacknowledged transfer with no transaction closure, the transaction is done
//! after these steps. Otherwise, a Finished PDU is sent to the source entity. In acknowledged
//! mode, the Finished PDU is subject to the positive acknowledgement procedure.
use std::path::Path;

use crate::{
    entity::{IgnoreReason, PduOutcome, TransactionContext},
    filestore::FilestoreError,
    pdu::{
        AckPdu, ChecksumType, CommonPduConfig, ConditionCode, CrcFlag, DeliveryCode, Direction,
        EofPdu, FaultHandlerCode, FileDataPdu, FileDirectiveType, FileStatus, FinishedPdu,
        KeepAlivePdu, MetadataPdu, NakPdu, Pdu, PduBody, PduHeader, PduType, PromptPdu,
        PromptResponse, SegmentMetadataFlag, SegmentationControl, TransactionStatus,
        TransmissionMode,
    },
    segments::ReceivedSegments,
    time::Countdown,
    user::{Indication, MetadataReceivedParams, TransactionFinishedParams},
    FaultInfo, RemoteEntityConfig, TransactionId, UserFaultHookProvider,
};

const CHECKSUM_BUF_LEN: usize = 2048;
/// Upper bound for File Data PDUs buffered while the Metadata PDU is missing.
pub const MAX_DEFERRED_FILE_DATA_PDUS: usize = 64;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DestState {
    AwaitingMetadata,
    Receiving,
    /// The Finished PDU is due. It is sent right away unless the transaction is suspended.
    SendingFinished,
    WaitingForFinishedAck,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileProperties {
    dest_path: String,
    file_size: u64,
    checksum_type: ChecksumType,
    closure_requested: bool,
}

pub struct DestinationTransaction {
    id: TransactionId,
    // Header configuration for all PDUs sent back to the source entity.
    reply_conf: CommonPduConfig,
    remote_cfg: RemoteEntityConfig,
    state: DestState,
    suspended: bool,
    cancelling: bool,
    file: Option<FileProperties>,
    received: ReceivedSegments,
    eof: Option<EofPdu>,
    deferred_file_data: Vec<FileDataPdu>,
    deferred_eof: Option<EofPdu>,
    condition_code: ConditionCode,
    delivery_code: DeliveryCode,
    file_status: FileStatus,
    inactivity_timer: Countdown,
    nak_timer: Countdown,
    nak_counter: u32,
    check_timer: Countdown,
    check_counter: u32,
    keep_alive_timer: Option<Countdown>,
    positive_ack_timer: Countdown,
    positive_ack_counter: u32,
    buf: Vec<u8>,
}

impl DestinationTransaction {
    /// Create a new transaction for the transaction ID contained in the passed header. The
    /// remote configuration is the one of the source entity.
    pub fn new(header: &PduHeader, remote_cfg: RemoteEntityConfig, now: core::time::Duration) -> Self {
        let mut reply_conf = *header.common_pdu_conf();
        reply_conf.direction = Direction::TowardsSender;
        reply_conf.crc_flag = remote_cfg.crc_flag();
        let mut inactivity_timer = Countdown::new(remote_cfg.inactivity_timeout);
        inactivity_timer.start(now);
        Self {
            id: reply_conf.transaction_id(),
            reply_conf,
            state: DestState::AwaitingMetadata,
            suspended: false,
            cancelling: false,
            file: None,
            received: ReceivedSegments::default(),
            eof: None,
            deferred_file_data: Vec::new(),
            deferred_eof: None,
            condition_code: ConditionCode::NoError,
            delivery_code: DeliveryCode::Incomplete,
            file_status: FileStatus::Unreported,
            inactivity_timer,
            nak_timer: Countdown::new(remote_cfg.nak_timer_interval),
            nak_counter: 0,
            check_timer: Countdown::new(remote_cfg.check_timer_interval),
            check_counter: 0,
            keep_alive_timer: remote_cfg.keep_alive_interval.map(Countdown::new),
            positive_ack_timer: Countdown::new(remote_cfg.positive_ack_timer_interval),
            positive_ack_counter: 0,
            remote_cfg,
            buf: Vec::new(),
        }
    }

    #[inline]
    pub fn transaction_id(&self) -> TransactionId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> DestState {
        self.state
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.state == DestState::Terminated
    }

    #[inline]
    pub fn transmission_mode(&self) -> TransmissionMode {
        self.reply_conf.trans_mode
    }

    /// Path of the destination file, known once the Metadata PDU was received.
    pub fn dest_path(&self) -> Option<&str> {
        self.file.as_ref().map(|file| file.dest_path.as_str())
    }

    /// File size announced by the Metadata PDU.
    pub fn file_size(&self) -> Option<u64> {
        self.file.as_ref().map(|file| file.file_size)
    }

    #[inline]
    pub fn received_segments(&self) -> &ReceivedSegments {
        &self.received
    }

    /// End of the highest received file segment.
    #[inline]
    pub fn progress(&self) -> u64 {
        self.received.progress()
    }

    fn closure_requested(&self) -> bool {
        self.file
            .as_ref()
            .map(|file| file.closure_requested)
            .unwrap_or(false)
    }

    pub fn tick<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) {
        if self.suspended {
            return;
        }
        match self.state {
            DestState::AwaitingMetadata | DestState::Receiving => self.handle_timers(ctx),
            DestState::SendingFinished => self.send_finished(ctx),
            DestState::WaitingForFinishedAck => self.handle_positive_ack_procedures(ctx),
            DestState::Terminated => (),
        }
    }

    /// Handle a PDU which is routed to the destination side of this transaction.
    pub fn on_pdu<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        pdu: &Pdu,
    ) -> PduOutcome {
        if self.state == DestState::Terminated {
            return PduOutcome::Ignored(IgnoreReason::TransactionTerminated);
        }
        match pdu.body() {
            PduBody::Metadata(metadata) => {
                self.handle_metadata_pdu(ctx, pdu.header().common_pdu_conf(), metadata)
            }
            PduBody::FileData(file_data) => self.handle_file_data_pdu(ctx, file_data),
            PduBody::Eof(eof) => self.handle_eof_pdu(ctx, eof),
            PduBody::Ack(ack) => self.handle_ack_pdu(ctx, ack),
            PduBody::Prompt(prompt) => self.handle_prompt_pdu(ctx, prompt),
            PduBody::Nak(_) | PduBody::Finished(_) | PduBody::KeepAlive(_) => {
                PduOutcome::unexpected(pdu)
            }
        }
    }

    /// Cancel the transaction on request of the user. Returns [false] if the transaction is
    /// already terminated or cancelling.
    pub fn cancel<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) -> bool {
        if self.state == DestState::Terminated || self.cancelling {
            return false;
        }
        self.notice_of_cancellation(ctx, ConditionCode::CancelRequestReceived);
        true
    }

    pub fn suspend<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) -> bool {
        if self.state == DestState::Terminated || self.suspended {
            return false;
        }
        self.notice_of_suspension(ctx, ConditionCode::SuspendRequestReceived);
        true
    }

    pub fn resume<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) -> bool {
        if self.state == DestState::Terminated || !self.suspended {
            return false;
        }
        self.suspended = false;
        let now = ctx.now;
        self.inactivity_timer.restart_if_running(now);
        self.nak_timer.restart_if_running(now);
        self.check_timer.restart_if_running(now);
        self.positive_ack_timer.restart_if_running(now);
        if let Some(timer) = self.keep_alive_timer.as_mut() {
            timer.restart_if_running(now);
        }
        log::info!("transaction {} resumed", self.id);
        ctx.indications.push(Indication::Resumed {
            id: self.id,
            progress: self.progress(),
        });
        true
    }

    fn send_directive<H: UserFaultHookProvider>(
        &self,
        ctx: &TransactionContext<'_, H>,
        body: PduBody,
    ) {
        ctx.send_pdu(self.reply_conf.source_id(), &Pdu::new(self.reply_conf, body));
    }

    fn local_id(&self) -> crate::pdu::UnsignedByteField {
        self.reply_conf.dest_id()
    }

    fn handle_metadata_pdu<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        pdu_conf: &CommonPduConfig,
        metadata: &MetadataPdu,
    ) -> PduOutcome {
        if self.file.is_some() {
            return PduOutcome::Ignored(IgnoreReason::DuplicateMetadata);
        }
        let dest_path = resolve_dest_path(ctx, &metadata.src_file_name, &metadata.dest_file_name);
        self.file = Some(FileProperties {
            dest_path: dest_path.clone(),
            file_size: metadata.file_size,
            checksum_type: metadata.checksum_type,
            closure_requested: metadata.closure_requested,
        });
        self.state = DestState::Receiving;
        self.inactivity_timer.start(ctx.now);
        if self.transmission_mode() == TransmissionMode::Acknowledged {
            if let Some(timer) = self.keep_alive_timer.as_mut() {
                timer.start(ctx.now);
            }
        }
        log::info!(
            "transaction {}: receiving {} ({} bytes) into {dest_path}",
            self.id,
            metadata.src_file_name,
            metadata.file_size
        );
        ctx.indications
            .push(Indication::MetadataReceived(MetadataReceivedParams {
                id: self.id,
                source_id: pdu_conf.source_id().value(),
                file_size: metadata.file_size,
                checksum_type: metadata.checksum_type,
                src_file_name: metadata.src_file_name.clone(),
                dest_file_name: dest_path.clone(),
            }));

        let open_result = match ctx.vfs.exists(&dest_path) {
            Ok(true) => ctx.vfs.truncate_file(&dest_path),
            Ok(false) => ctx.vfs.create_file(&dest_path),
            Err(e) => Err(e),
        };
        match open_result {
            Ok(()) => self.file_status = FileStatus::Retained,
            Err(e) => {
                log::warn!("transaction {}: opening {dest_path} failed: {e}", self.id);
                self.file_status = FileStatus::DiscardedFsRejection;
                self.declare_fault(ctx, ConditionCode::FilestoreRejection);
                return PduOutcome::Accepted;
            }
        }

        for file_data in core::mem::take(&mut self.deferred_file_data) {
            if self.state != DestState::Receiving {
                break;
            }
            self.handle_file_data_pdu(ctx, &file_data);
        }
        if let Some(eof) = self.deferred_eof.take() {
            if self.state == DestState::Receiving {
                self.handle_eof_pdu(ctx, &eof);
            }
        }
        PduOutcome::Accepted
    }

    fn handle_file_data_pdu<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        file_data: &FileDataPdu,
    ) -> PduOutcome {
        match self.state {
            DestState::AwaitingMetadata => {
                self.inactivity_timer.restart_if_running(ctx.now);
                if self.deferred_file_data.len() >= MAX_DEFERRED_FILE_DATA_PDUS {
                    log::warn!(
                        "transaction {}: deferred file data buffer full, dropping segment at {}",
                        self.id,
                        file_data.offset
                    );
                    return PduOutcome::Ignored(IgnoreReason::DeferredBufferFull);
                }
                self.deferred_file_data.push(file_data.clone());
                return PduOutcome::Accepted;
            }
            DestState::Receiving => (),
            _ => return PduOutcome::unexpected_pdu_type(PduType::FileData, None),
        }
        self.inactivity_timer.restart_if_running(ctx.now);
        // The EOF file size replaces the one announced in the metadata once it is known.
        let file_size = match (self.eof, self.file_size()) {
            (Some(eof), _) => eof.file_size,
            (None, Some(file_size)) => file_size,
            (None, None) => return PduOutcome::unexpected_pdu_type(PduType::FileData, None),
        };
        if file_data.end_offset().map_or(true, |end| end > file_size) {
            log::warn!(
                "transaction {}: file data of {} bytes at offset {} exceeds file size {}",
                self.id,
                file_data.file_data.len(),
                file_data.offset,
                file_size
            );
            self.declare_fault(ctx, ConditionCode::FileSizeError);
            return PduOutcome::Accepted;
        }
        let Some(dest_path) = self.dest_path().map(String::from) else {
            return PduOutcome::unexpected_pdu_type(PduType::FileData, None);
        };
        if let Err(e) = ctx
            .vfs
            .write_data(&dest_path, file_data.offset, &file_data.file_data)
        {
            log::warn!("transaction {}: writing file data failed: {e}", self.id);
            self.file_status = FileStatus::DiscardedFsRejection;
            self.declare_fault(ctx, ConditionCode::FilestoreRejection);
            return PduOutcome::Accepted;
        }
        let previous_progress = self.received.progress();
        let length = file_data.file_data.len() as u64;
        self.received.record(file_data.offset, length);
        ctx.indications.push(Indication::FileSegmentReceived {
            id: self.id,
            offset: file_data.offset,
            length,
        });

        match self.eof {
            Some(eof) => {
                if self.received.is_complete(eof.file_size) {
                    self.complete_transfer(ctx);
                }
            }
            None => {
                if self.transmission_mode() == TransmissionMode::Acknowledged
                    && self.remote_cfg.immediate_nak_mode
                    && file_data.offset > previous_progress
                {
                    log::debug!(
                        "transaction {}: gap detected before offset {}",
                        self.id,
                        file_data.offset
                    );
                    self.send_nak_sequence(ctx, file_data.offset);
                }
            }
        }
        PduOutcome::Accepted
    }

    fn handle_eof_pdu<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        eof: &EofPdu,
    ) -> PduOutcome {
        if self.transmission_mode() == TransmissionMode::Acknowledged {
            self.send_directive(
                ctx,
                PduBody::Ack(AckPdu::new_for_eof(
                    eof.condition_code,
                    TransactionStatus::Active,
                )),
            );
        }
        match self.state {
            DestState::AwaitingMetadata => {
                self.inactivity_timer.restart_if_running(ctx.now);
                self.deferred_eof = Some(*eof);
                return PduOutcome::Accepted;
            }
            DestState::Receiving if self.eof.is_none() => (),
            // Retransmitted EOF, which was acknowledged again above.
            _ => return PduOutcome::Accepted,
        }
        self.inactivity_timer.restart_if_running(ctx.now);
        ctx.indications.push(Indication::EofReceived(self.id));
        if eof.condition_code != ConditionCode::NoError {
            self.handle_eof_cancel(ctx, eof);
            return PduOutcome::Accepted;
        }
        self.eof = Some(*eof);
        if self.received.progress() > eof.file_size {
            log::warn!(
                "transaction {}: received {} bytes, but EOF file size is {}",
                self.id,
                self.received.progress(),
                eof.file_size
            );
            self.declare_fault(ctx, ConditionCode::FileSizeError);
            return PduOutcome::Accepted;
        }
        if self.received.is_complete(eof.file_size) {
            self.complete_transfer(ctx);
            return PduOutcome::Accepted;
        }
        match self.transmission_mode() {
            TransmissionMode::Acknowledged => {
                self.send_nak_sequence(ctx, eof.file_size);
                self.nak_counter = 0;
                self.nak_timer.start(ctx.now);
            }
            TransmissionMode::Unacknowledged => {
                self.check_counter = 0;
                self.check_timer.start(ctx.now);
            }
        }
        PduOutcome::Accepted
    }

    /// The source entity cancelled the transaction.
    fn handle_eof_cancel<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        eof: &EofPdu,
    ) {
        log::info!(
            "transaction {}: cancelled by source with condition code {:?}",
            self.id,
            eof.condition_code
        );
        self.stop_receive_timers();
        if self.received.is_complete(eof.file_size) {
            self.delivery_code = DeliveryCode::Complete;
        }
        self.apply_disposition();
        self.notice_of_completion(ctx, eof.condition_code, self.delivery_code, self.file_status);
    }

    fn handle_ack_pdu<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        ack: &AckPdu,
    ) -> PduOutcome {
        if ack.directive_code_of_acked_pdu() != FileDirectiveType::FinishedPdu {
            return PduOutcome::Ignored(IgnoreReason::InvalidAckedDirective(
                ack.directive_code_of_acked_pdu(),
            ));
        }
        if self.state != DestState::WaitingForFinishedAck {
            return PduOutcome::unexpected_directive(FileDirectiveType::AckPdu);
        }
        self.notice_of_completion(
            ctx,
            self.condition_code,
            self.delivery_code,
            self.file_status,
        );
        PduOutcome::Accepted
    }

    fn handle_prompt_pdu<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        prompt: &PromptPdu,
    ) -> PduOutcome {
        if self.transmission_mode() == TransmissionMode::Unacknowledged
            || self.state != DestState::Receiving
        {
            return PduOutcome::unexpected_directive(FileDirectiveType::PromptPdu);
        }
        self.inactivity_timer.restart_if_running(ctx.now);
        match prompt.response_required {
            PromptResponse::Nak => {
                let scope_end = match self.eof {
                    Some(eof) => eof.file_size,
                    None => self.received.progress(),
                };
                self.send_nak_sequence(ctx, scope_end);
            }
            PromptResponse::KeepAlive => self.send_keep_alive(ctx),
        }
        PduOutcome::Accepted
    }

    /// Maximum number of segment requests which fit into one NAK PDU.
    fn max_segment_requests_per_nak(&self) -> usize {
        let header_len = PduHeader::new(
            self.reply_conf,
            PduType::FileDirective,
            SegmentationControl::NoRecordBoundaryPreservation,
            SegmentMetadataFlag::NotPresent,
        )
        .header_len();
        let fss_len = self.reply_conf.file_flag.fss_len();
        let crc_len = match self.reply_conf.crc_flag {
            CrcFlag::WithCrc => 2,
            CrcFlag::NoCrc => 0,
        };
        let overhead = header_len + 1 + 2 * fss_len + crc_len;
        (self.remote_cfg.max_packet_len.saturating_sub(overhead) / (2 * fss_len)).max(1)
    }

    /// Request all gaps in `[0, scope_end)`. Gap lists which do not fit into a single NAK PDU
    /// are split into multiple PDUs with consecutive scopes.
    fn send_nak_sequence<H: UserFaultHookProvider>(
        &self,
        ctx: &TransactionContext<'_, H>,
        scope_end: u64,
    ) {
        let gaps = self.received.gaps(scope_end);
        if gaps.is_empty() {
            return;
        }
        log::debug!(
            "transaction {}: requesting {} missing segments",
            self.id,
            gaps.len()
        );
        let chunks: Vec<&[(u64, u64)]> = gaps.chunks(self.max_segment_requests_per_nak()).collect();
        let mut start_of_scope = 0;
        for (idx, chunk) in chunks.iter().enumerate() {
            let end_of_scope = if idx == chunks.len() - 1 {
                scope_end
            } else {
                chunk[chunk.len() - 1].1
            };
            self.send_directive(
                ctx,
                PduBody::Nak(NakPdu::new(start_of_scope, end_of_scope, chunk)),
            );
            start_of_scope = end_of_scope;
        }
    }

    fn send_keep_alive<H: UserFaultHookProvider>(&self, ctx: &TransactionContext<'_, H>) {
        self.send_directive(
            ctx,
            PduBody::KeepAlive(KeepAlivePdu::new(self.received.progress())),
        );
    }

    fn handle_timers<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) {
        let now = ctx.now;
        if self.inactivity_timer.has_expired(now) {
            self.inactivity_timer.start(now);
            self.declare_fault(ctx, ConditionCode::InactivityDetected);
            return;
        }
        if self.nak_timer.has_expired(now) {
            self.nak_timer.start(now);
            if self.nak_counter + 1 >= self.remote_cfg.nak_timer_expiration_limit {
                self.nak_counter = 0;
                self.declare_fault(ctx, ConditionCode::NakLimitReached);
                return;
            }
            self.nak_counter += 1;
            if let Some(eof) = self.eof {
                self.send_nak_sequence(ctx, eof.file_size);
            }
        }
        if self.check_timer.has_expired(now) {
            self.check_timer.start(now);
            if self.check_counter + 1 >= self.remote_cfg.check_limit {
                self.check_counter = 0;
                self.declare_fault(ctx, ConditionCode::CheckLimitReached);
                return;
            }
            self.check_counter += 1;
        }
        let keep_alive_due = self
            .keep_alive_timer
            .as_mut()
            .map(|timer| {
                let expired = timer.has_expired(now);
                if expired {
                    timer.start(now);
                }
                expired
            })
            .unwrap_or(false);
        if keep_alive_due {
            self.send_keep_alive(ctx);
        }
    }

    fn handle_positive_ack_procedures<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
    ) {
        if !self.positive_ack_timer.has_expired(ctx.now) {
            return;
        }
        self.positive_ack_timer.start(ctx.now);
        if self.positive_ack_counter + 1 >= self.remote_cfg.positive_ack_timer_expiration_limit {
            self.positive_ack_counter = 0;
            self.declare_fault(ctx, ConditionCode::CheckLimitReached);
            return;
        }
        self.positive_ack_counter += 1;
        log::debug!(
            "transaction {}: positive ACK timer expired, re-sending Finished ({})",
            self.id,
            self.positive_ack_counter
        );
        self.send_finished_pdu(ctx);
    }

    /// Verify the checksum of the complete file and start the transaction closure.
    fn complete_transfer<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) {
        self.stop_receive_timers();
        let (Some(eof), Some(file)) = (self.eof, self.file.clone()) else {
            return;
        };
        self.buf.resize(CHECKSUM_BUF_LEN, 0);
        let verify_result = ctx.vfs.checksum_verify(
            eof.file_checksum,
            &file.dest_path,
            file.checksum_type,
            eof.file_size,
            &mut self.buf,
        );
        let (fault, condition_code, delivery_code) = match verify_result {
            Ok(true) => (None, ConditionCode::NoError, DeliveryCode::Complete),
            Ok(false) => {
                log::warn!(
                    "transaction {}: checksum mismatch for {}",
                    self.id,
                    file.dest_path
                );
                (
                    Some(ConditionCode::FileChecksumFailure),
                    ConditionCode::FileChecksumFailure,
                    DeliveryCode::Incomplete,
                )
            }
            Err(FilestoreError::ChecksumTypeNotImplemented(checksum_type)) => {
                log::warn!(
                    "transaction {}: checksum type {checksum_type:?} not supported",
                    self.id
                );
                (
                    Some(ConditionCode::UnsupportedChecksumType),
                    ConditionCode::NoError,
                    DeliveryCode::Complete,
                )
            }
            Err(e) => {
                log::warn!("transaction {}: checksum calculation failed: {e}", self.id);
                (
                    Some(ConditionCode::FilestoreRejection),
                    ConditionCode::FilestoreRejection,
                    DeliveryCode::Incomplete,
                )
            }
        };
        self.delivery_code = delivery_code;
        if let Some(fault) = fault {
            self.declare_fault(ctx, fault);
            // The fault handler cancelled or abandoned the transaction.
            if self.cancelling || self.state == DestState::Terminated {
                return;
            }
        }
        self.condition_code = condition_code;
        log::debug!(
            "transaction {}: file {} received with {condition_code:?}",
            self.id,
            file.dest_path
        );
        self.start_transaction_closure(ctx);
    }

    fn start_transaction_closure<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
    ) {
        self.stop_receive_timers();
        if self.transmission_mode() == TransmissionMode::Acknowledged || self.closure_requested() {
            self.state = DestState::SendingFinished;
            if !self.suspended {
                self.send_finished(ctx);
            }
            return;
        }
        self.notice_of_completion(
            ctx,
            self.condition_code,
            self.delivery_code,
            self.file_status,
        );
    }

    fn send_finished_pdu<H: UserFaultHookProvider>(&self, ctx: &TransactionContext<'_, H>) {
        let fault_location = if self.condition_code == ConditionCode::NoError {
            None
        } else {
            Some(self.local_id())
        };
        self.send_directive(
            ctx,
            PduBody::Finished(FinishedPdu::new(
                self.condition_code,
                self.delivery_code,
                self.file_status,
                fault_location,
            )),
        );
    }

    fn send_finished<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) {
        self.send_finished_pdu(ctx);
        match self.transmission_mode() {
            TransmissionMode::Acknowledged => {
                self.positive_ack_counter = 0;
                self.positive_ack_timer.start(ctx.now);
                self.state = DestState::WaitingForFinishedAck;
            }
            TransmissionMode::Unacknowledged => self.notice_of_completion(
                ctx,
                self.condition_code,
                self.delivery_code,
                self.file_status,
            ),
        }
    }

    fn stop_receive_timers(&mut self) {
        self.inactivity_timer.stop();
        self.nak_timer.stop();
        self.check_timer.stop();
        if let Some(timer) = self.keep_alive_timer.as_mut() {
            timer.stop();
        }
    }

    /// Delete an incompletely received file if the remote configuration requests it.
    fn apply_disposition(&mut self) {
        if self.delivery_code == DeliveryCode::Complete
            || !self.remote_cfg.disposition_on_cancellation
            || self.file_status != FileStatus::Retained
        {
            return;
        }
        self.file_status = FileStatus::DiscardDeliberately;
    }

    fn notice_of_completion<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        condition_code: ConditionCode,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
    ) {
        if file_status == FileStatus::DiscardDeliberately {
            if let Some(dest_path) = self.dest_path() {
                if let Err(e) = ctx.vfs.remove_file(dest_path) {
                    log::warn!("transaction {}: discarding {dest_path} failed: {e}", self.id);
                }
            }
        }
        self.state = DestState::Terminated;
        self.stop_receive_timers();
        self.positive_ack_timer.stop();
        self.deferred_file_data.clear();
        ctx.indications
            .transaction_finished(TransactionFinishedParams {
                id: self.id,
                condition_code,
                delivery_code,
                file_status,
            });
    }

    fn notice_of_cancellation<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        condition_code: ConditionCode,
    ) {
        log::info!(
            "transaction {}: cancelled with condition code {condition_code:?}",
            self.id
        );
        self.cancelling = true;
        self.condition_code = condition_code;
        if self.state == DestState::AwaitingMetadata {
            // Without metadata, the source entity does not expect any reply.
            self.notice_of_completion(
                ctx,
                condition_code,
                DeliveryCode::Incomplete,
                FileStatus::Unreported,
            );
            return;
        }
        self.apply_disposition();
        self.start_transaction_closure(ctx);
    }

    fn notice_of_suspension<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        condition_code: ConditionCode,
    ) {
        self.suspended = true;
        log::info!("transaction {} suspended", self.id);
        ctx.indications.push(Indication::Suspended {
            id: self.id,
            condition_code,
        });
    }

    fn abandon_transaction<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        condition_code: ConditionCode,
    ) {
        log::warn!(
            "transaction {} abandoned with condition code {condition_code:?}",
            self.id
        );
        ctx.indications.push(Indication::Abandoned {
            id: self.id,
            condition_code,
            progress: self.progress(),
        });
        self.notice_of_completion(ctx, condition_code, self.delivery_code, self.file_status);
    }

    fn declare_fault<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        condition_code: ConditionCode,
    ) {
        let mut fh = ctx.local_cfg.fault_handler.get_fault_handler(condition_code);
        // A fault during the transaction closure or a cancellation can not be handled by
        // another cancellation.
        if self.cancelling
            || matches!(
                self.state,
                DestState::SendingFinished | DestState::WaitingForFinishedAck
            )
        {
            fh = FaultHandlerCode::AbandonTransaction;
        }
        log::warn!(
            "transaction {}: fault {condition_code:?} declared, handler {fh:?}",
            self.id
        );
        match fh {
            FaultHandlerCode::NoticeOfCancellation => {
                self.notice_of_cancellation(ctx, condition_code)
            }
            FaultHandlerCode::NoticeOfSuspension => {
                self.notice_of_suspension(ctx, condition_code)
            }
            FaultHandlerCode::IgnoreError => ctx.indications.push(Indication::Fault {
                id: self.id,
                condition_code,
                progress: self.progress(),
            }),
            FaultHandlerCode::AbandonTransaction => {
                self.abandon_transaction(ctx, condition_code)
            }
        }
        ctx.local_cfg.fault_handler.report_fault(
            fh,
            FaultInfo::new(self.id, condition_code, self.progress()),
        );
    }
}

/// A destination path which is an existing directory receives the file under the name of the
/// source file.
fn resolve_dest_path<H: UserFaultHookProvider>(
    ctx: &TransactionContext<'_, H>,
    src_file_name: &str,
    dest_file_name: &str,
) -> String {
    let is_dir = matches!(ctx.vfs.exists(dest_file_name), Ok(true))
        && matches!(ctx.vfs.is_file(dest_file_name), Ok(false));
    if !is_dir {
        return String::from(dest_file_name);
    }
    match Path::new(src_file_name).file_name() {
        Some(name) => Path::new(dest_file_name)
            .join(name)
            .to_string_lossy()
            .into_owned(),
        None => String::from(dest_file_name),
    }
}
