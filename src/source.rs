//! # CFDP Source Transaction Module
//!
//! A [SourceTransaction] converts one put request into all packet data units (PDUs) which need
//! to be sent to a remote CFDP entity to perform a File Copy operation. It is created and owned
//! by the [crate::entity::Entity], which drives it with
//! [SourceTransaction::tick] and forwards all PDUs routed to the source side with
//! [SourceTransaction::on_pdu].
//!
//! Each tick generates at most one file data PDU, which allows flow control by the user of the
//! entity. A transaction goes through the following steps:
//!
//! 1. The Metadata PDU is sent and the transaction moves to [SourceState::Sending].
//! 2. All File Data PDUs are sent, one per tick.
//! 3. The EOF PDU is sent with the checksum of the whole file.
//!
//! If this is an unacknowledged transfer with no transaction closure, the transaction is done
//! after these steps.
//!
//! ### Unacknowledged transfer with requested closure
//!
//! 4. A Finished PDU is awaited, guarded by the check timer.
//!
//! ### Acknowledged transfer
//!
//! 4. The ACK for the EOF PDU is awaited. The EOF PDU is re-sent each time the positive ACK
//!    timer expires. NAK PDUs received in the meantime are served by re-sending the requested
//!    file segments.
//! 5. A Finished PDU is awaited, guarded by the inactivity timer.
//! 6. The Finished PDU is acknowledged with an ACK PDU.
use std::collections::VecDeque;

use crate::{
    entity::{IgnoreReason, PduOutcome, TransactionContext},
    filestore::FilestoreError,
    pdu::{
        AckPdu, ChecksumType, CommonPduConfig, ConditionCode, DeliveryCode, EofPdu,
        FaultHandlerCode, FileDataPdu, FileDirectiveType, FileStatus, FinishedPdu, KeepAlivePdu,
        LargeFileFlag, MetadataPdu, NakPdu, Pdu, PduBody, PduHeader, PduType,
        SegmentMetadataFlag, SegmentationControl, TransactionStatus, TransmissionMode,
    },
    segments::{FileSegment, Segmenter},
    time::Countdown,
    user::{Indication, TransactionFinishedParams},
    FaultInfo, RemoteEntityConfig, TransactionId, UserFaultHookProvider,
};

const CHECKSUM_BUF_LEN: usize = 2048;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SourceState {
    /// The Metadata PDU was not sent yet.
    Idle,
    Sending,
    WaitingForEofAck,
    WaitingForFinished,
    Terminated,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SourceError {
    #[error("maximum packet length {0} leaves no room for file data")]
    SegmentLengthTooSmall(usize),
}

/// File related parameters of a new source transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFileParams {
    pub source_file: String,
    pub dest_file: String,
    pub file_size: u64,
    pub closure_requested: bool,
}

pub struct SourceTransaction {
    id: TransactionId,
    pdu_conf: CommonPduConfig,
    remote_cfg: RemoteEntityConfig,
    file: SourceFileParams,
    checksum_type: ChecksumType,
    segmenter: Segmenter,
    state: SourceState,
    suspended: bool,
    // Set once the EOF (cancel) PDU was sent. Any fault afterwards abandons the transaction.
    cancelling: bool,
    eof_condition: ConditionCode,
    eof_checksum: u32,
    eof_progress: u64,
    metadata_requested: bool,
    retransmissions: VecDeque<FileSegment>,
    positive_ack_timer: Countdown,
    positive_ack_counter: u32,
    inactivity_timer: Countdown,
    check_timer: Countdown,
    check_counter: u32,
    peer_progress: u64,
    buf: Vec<u8>,
}

impl SourceTransaction {
    /// Create a new transaction. The transaction ID is taken from the PDU configuration, and the
    /// large file flag is set automatically depending on the file size.
    pub fn new(
        mut pdu_conf: CommonPduConfig,
        remote_cfg: RemoteEntityConfig,
        file: SourceFileParams,
    ) -> Result<Self, SourceError> {
        pdu_conf.file_flag = if file.file_size > u32::MAX as u64 {
            LargeFileFlag::Large
        } else {
            LargeFileFlag::Normal
        };
        pdu_conf.crc_flag = remote_cfg.crc_flag();
        let header_len = PduHeader::new(
            pdu_conf,
            PduType::FileData,
            SegmentationControl::NoRecordBoundaryPreservation,
            SegmentMetadataFlag::NotPresent,
        )
        .header_len();
        let segment_len = remote_cfg.max_file_segment_len_for_header(header_len, pdu_conf.file_flag);
        if segment_len == 0 {
            return Err(SourceError::SegmentLengthTooSmall(remote_cfg.max_packet_len));
        }
        Ok(Self {
            id: pdu_conf.transaction_id(),
            pdu_conf,
            checksum_type: remote_cfg.default_crc_type,
            segmenter: Segmenter::new(file.file_size, segment_len as u64),
            remote_cfg,
            file,
            state: SourceState::Idle,
            suspended: false,
            cancelling: false,
            eof_condition: ConditionCode::NoError,
            eof_checksum: 0,
            eof_progress: 0,
            metadata_requested: false,
            retransmissions: VecDeque::new(),
            positive_ack_timer: Countdown::new(remote_cfg.positive_ack_timer_interval),
            positive_ack_counter: 0,
            inactivity_timer: Countdown::new(remote_cfg.inactivity_timeout),
            check_timer: Countdown::new(remote_cfg.check_timer_interval),
            check_counter: 0,
            peer_progress: 0,
            buf: Vec::new(),
        })
    }

    #[inline]
    pub fn transaction_id(&self) -> TransactionId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> SourceState {
        self.state
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.state == SourceState::Terminated
    }

    #[inline]
    pub fn transmission_mode(&self) -> TransmissionMode {
        self.pdu_conf.trans_mode
    }

    /// Number of bytes of the file which were sent so far.
    #[inline]
    pub fn progress(&self) -> u64 {
        self.segmenter.cursor()
    }

    #[inline]
    pub fn segment_len(&self) -> u64 {
        self.segmenter.segment_len()
    }

    #[inline]
    pub fn remote_cfg(&self) -> &RemoteEntityConfig {
        &self.remote_cfg
    }

    /// Advance the state machine. Each call sends at most one file data PDU.
    pub fn tick<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) {
        if self.suspended {
            return;
        }
        match self.state {
            SourceState::Idle => {
                self.send_metadata(ctx);
                self.state = SourceState::Sending;
                log::debug!("transaction {}: metadata sent", self.id);
                // An empty file does not require any file data PDU.
                if self.segmenter.is_finished() {
                    self.send_eof_and_advance(ctx);
                }
            }
            SourceState::Sending => {
                if self.serve_retransmission(ctx) {
                    return;
                }
                match self.segmenter.next_segment() {
                    Some(segment) => {
                        if let Err(e) = self.send_file_segment(ctx, segment) {
                            log::warn!("transaction {}: reading file data failed: {e}", self.id);
                            self.declare_fault(ctx, ConditionCode::FilestoreRejection);
                        }
                    }
                    None => self.send_eof_and_advance(ctx),
                }
            }
            SourceState::WaitingForEofAck => {
                self.serve_retransmission(ctx);
                self.handle_positive_ack_procedures(ctx);
            }
            SourceState::WaitingForFinished => {
                self.serve_retransmission(ctx);
                self.handle_waiting_for_finished(ctx);
            }
            SourceState::Terminated => (),
        }
    }

    /// Handle a PDU which is routed to the source side of this transaction.
    pub fn on_pdu<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        pdu: &Pdu,
    ) -> PduOutcome {
        if self.state == SourceState::Terminated {
            return PduOutcome::Ignored(IgnoreReason::TransactionTerminated);
        }
        match pdu.body() {
            PduBody::Ack(ack) => self.handle_ack_pdu(ctx, ack),
            PduBody::Nak(nak) => self.handle_nak_pdu(ctx, nak),
            PduBody::Finished(finished) => self.handle_finished_pdu(ctx, finished),
            PduBody::KeepAlive(keep_alive) => self.handle_keep_alive_pdu(ctx, keep_alive),
            PduBody::Metadata(_)
            | PduBody::FileData(_)
            | PduBody::Eof(_)
            | PduBody::Prompt(_) => PduOutcome::unexpected(pdu),
        }
    }

    /// Cancel the transaction on request of the user. Returns [false] if the transaction is
    /// already terminated or cancelling.
    pub fn cancel<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) -> bool {
        if self.state == SourceState::Terminated || self.cancelling {
            return false;
        }
        self.notice_of_cancellation(ctx, ConditionCode::CancelRequestReceived);
        true
    }

    pub fn suspend<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) -> bool {
        if self.state == SourceState::Terminated || self.suspended {
            return false;
        }
        self.notice_of_suspension(ctx, ConditionCode::SuspendRequestReceived);
        true
    }

    pub fn resume<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) -> bool {
        if self.state == SourceState::Terminated || !self.suspended {
            return false;
        }
        self.suspended = false;
        self.positive_ack_timer.restart_if_running(ctx.now);
        self.inactivity_timer.restart_if_running(ctx.now);
        self.check_timer.restart_if_running(ctx.now);
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
        ctx.send_pdu(self.pdu_conf.dest_id(), &Pdu::new(self.pdu_conf, body));
    }

    fn send_metadata<H: UserFaultHookProvider>(&self, ctx: &TransactionContext<'_, H>) {
        self.send_directive(
            ctx,
            PduBody::Metadata(MetadataPdu::new(
                self.file.closure_requested,
                self.checksum_type,
                self.file.file_size,
                &self.file.source_file,
                &self.file.dest_file,
            )),
        );
    }

    fn send_file_segment<H: UserFaultHookProvider>(
        &mut self,
        ctx: &TransactionContext<'_, H>,
        segment: FileSegment,
    ) -> Result<(), FilestoreError> {
        self.buf.resize(segment.len as usize, 0);
        ctx.vfs.read_data(
            &self.file.source_file,
            segment.offset,
            segment.len,
            &mut self.buf,
        )?;
        let pdu = Pdu::new(
            self.pdu_conf,
            PduBody::FileData(FileDataPdu::new(segment.offset, &self.buf)),
        );
        ctx.send_pdu(self.pdu_conf.dest_id(), &pdu);
        Ok(())
    }

    /// Send one queued retransmission. Returns [true] if a PDU was sent.
    fn serve_retransmission<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
    ) -> bool {
        if self.metadata_requested {
            self.metadata_requested = false;
            self.send_metadata(ctx);
            return true;
        }
        match self.retransmissions.pop_front() {
            Some(segment) => {
                if let Err(e) = self.send_file_segment(ctx, segment) {
                    log::warn!("transaction {}: reading file data failed: {e}", self.id);
                    self.declare_fault(ctx, ConditionCode::FilestoreRejection);
                }
                true
            }
            None => false,
        }
    }

    fn calculate_checksum<H: UserFaultHookProvider>(
        &mut self,
        ctx: &TransactionContext<'_, H>,
        size: u64,
    ) -> Result<u32, FilestoreError> {
        self.buf.resize(CHECKSUM_BUF_LEN, 0);
        match ctx.vfs.calculate_checksum(
            &self.file.source_file,
            self.checksum_type,
            size,
            &mut self.buf,
        ) {
            Err(FilestoreError::ChecksumTypeNotImplemented(checksum_type)) => {
                // The receiver detects the unsupported checksum type on its own.
                log::warn!(
                    "transaction {}: checksum type {checksum_type:?} not supported, sending 0",
                    self.id
                );
                Ok(0)
            }
            result => result,
        }
    }

    fn send_eof<H: UserFaultHookProvider>(&self, ctx: &mut TransactionContext<'_, H>) {
        let fault_location = if self.eof_condition == ConditionCode::NoError {
            None
        } else {
            Some(self.pdu_conf.source_id())
        };
        self.send_directive(
            ctx,
            PduBody::Eof(EofPdu::new(
                self.eof_condition,
                self.eof_checksum,
                self.eof_progress,
                fault_location,
            )),
        );
        ctx.indications.push(Indication::EofSent(self.id));
    }

    fn send_eof_and_advance<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) {
        self.eof_checksum = match self.calculate_checksum(ctx, self.file.file_size) {
            Ok(checksum) => checksum,
            Err(e) => {
                log::warn!("transaction {}: checksum calculation failed: {e}", self.id);
                self.declare_fault(ctx, ConditionCode::FilestoreRejection);
                return;
            }
        };
        self.eof_condition = ConditionCode::NoError;
        self.eof_progress = self.file.file_size;
        self.send_eof(ctx);
        log::debug!("transaction {}: EOF sent", self.id);
        match self.transmission_mode() {
            TransmissionMode::Acknowledged => self.start_positive_ack_procedure(ctx),
            TransmissionMode::Unacknowledged => {
                if self.file.closure_requested {
                    self.check_counter = 0;
                    self.check_timer.start(ctx.now);
                    self.state = SourceState::WaitingForFinished;
                } else {
                    self.notice_of_completion(
                        ctx,
                        ConditionCode::NoError,
                        DeliveryCode::Complete,
                        FileStatus::Unreported,
                    );
                }
            }
        }
    }

    fn start_positive_ack_procedure<H: UserFaultHookProvider>(
        &mut self,
        ctx: &TransactionContext<'_, H>,
    ) {
        self.positive_ack_counter = 0;
        self.positive_ack_timer.start(ctx.now);
        self.state = SourceState::WaitingForEofAck;
    }

    fn handle_positive_ack_procedures<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
    ) {
        if !self.positive_ack_timer.has_expired(ctx.now) {
            return;
        }
        if self.positive_ack_counter + 1 >= self.remote_cfg.positive_ack_timer_expiration_limit {
            self.positive_ack_counter = 0;
            self.positive_ack_timer.start(ctx.now);
            self.declare_fault(ctx, ConditionCode::PositiveAckLimitReached);
            return;
        }
        self.positive_ack_counter += 1;
        self.positive_ack_timer.start(ctx.now);
        log::debug!(
            "transaction {}: positive ACK timer expired, re-sending EOF ({})",
            self.id,
            self.positive_ack_counter
        );
        self.send_eof(ctx);
    }

    fn handle_waiting_for_finished<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
    ) {
        if self.inactivity_timer.has_expired(ctx.now) {
            self.inactivity_timer.start(ctx.now);
            self.declare_fault(ctx, ConditionCode::InactivityDetected);
            return;
        }
        if self.check_timer.has_expired(ctx.now) {
            self.check_timer.start(ctx.now);
            if self.check_counter + 1 >= self.remote_cfg.check_limit {
                self.check_counter = 0;
                self.declare_fault(ctx, ConditionCode::CheckLimitReached);
            } else {
                self.check_counter += 1;
            }
        }
    }

    fn handle_ack_pdu<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        ack: &AckPdu,
    ) -> PduOutcome {
        if ack.directive_code_of_acked_pdu() != FileDirectiveType::EofPdu {
            return PduOutcome::Ignored(IgnoreReason::InvalidAckedDirective(
                ack.directive_code_of_acked_pdu(),
            ));
        }
        if self.state != SourceState::WaitingForEofAck {
            return PduOutcome::unexpected_directive(FileDirectiveType::AckPdu);
        }
        self.positive_ack_timer.stop();
        if self.cancelling {
            self.notice_of_completion(
                ctx,
                self.eof_condition,
                DeliveryCode::Incomplete,
                FileStatus::Unreported,
            );
            return PduOutcome::Accepted;
        }
        self.state = SourceState::WaitingForFinished;
        self.inactivity_timer.start(ctx.now);
        log::debug!("transaction {}: EOF acknowledged", self.id);
        PduOutcome::Accepted
    }

    fn handle_nak_pdu<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        nak: &NakPdu,
    ) -> PduOutcome {
        if self.transmission_mode() == TransmissionMode::Unacknowledged {
            return PduOutcome::Ignored(IgnoreReason::NakInUnacknowledgedMode);
        }
        if self.state == SourceState::Idle || self.cancelling {
            return PduOutcome::unexpected_directive(FileDirectiveType::NakPdu);
        }
        // Validate the whole PDU before queueing anything.
        for &(start, end) in &nak.segment_requests {
            if end < start || end > self.progress() {
                return PduOutcome::Ignored(IgnoreReason::InvalidNakSegment { start, end });
            }
        }
        for &(start, end) in &nak.segment_requests {
            if start == 0 && end == 0 {
                self.metadata_requested = true;
                continue;
            }
            let mut offset = start;
            while offset < end {
                let len = self.segment_len().min(end - offset);
                self.retransmissions.push_back(FileSegment { offset, len });
                offset += len;
            }
        }
        self.inactivity_timer.restart_if_running(ctx.now);
        log::debug!(
            "transaction {}: NAK received with {} segment requests",
            self.id,
            nak.segment_requests.len()
        );
        PduOutcome::Accepted
    }

    fn handle_finished_pdu<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        finished: &FinishedPdu,
    ) -> PduOutcome {
        let implicit_eof_ack = self.state == SourceState::WaitingForEofAck
            && self.transmission_mode() == TransmissionMode::Acknowledged;
        // The receiver cancelled the transaction while the file is still being sent.
        let remote_cancel = self.state == SourceState::Sending
            && finished.condition_code != ConditionCode::NoError;
        if self.state != SourceState::WaitingForFinished && !implicit_eof_ack && !remote_cancel {
            return PduOutcome::unexpected_directive(FileDirectiveType::FinishedPdu);
        }
        if self.transmission_mode() == TransmissionMode::Acknowledged {
            self.send_directive(
                ctx,
                PduBody::Ack(AckPdu::new_for_finished(
                    finished.condition_code,
                    TransactionStatus::Terminated,
                )),
            );
        }
        self.notice_of_completion(
            ctx,
            finished.condition_code,
            finished.delivery_code,
            finished.file_status,
        );
        PduOutcome::Accepted
    }

    fn handle_keep_alive_pdu<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        keep_alive: &KeepAlivePdu,
    ) -> PduOutcome {
        if self.transmission_mode() == TransmissionMode::Unacknowledged {
            return PduOutcome::unexpected_directive(FileDirectiveType::KeepAlivePdu);
        }
        self.peer_progress = keep_alive.progress;
        self.inactivity_timer.restart_if_running(ctx.now);
        if self.progress().saturating_sub(self.peer_progress)
            > self.remote_cfg.keep_alive_discrepancy_limit
        {
            self.declare_fault(ctx, ConditionCode::KeepAliveLimitReached);
        }
        PduOutcome::Accepted
    }

    fn notice_of_completion<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        condition_code: ConditionCode,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
    ) {
        self.state = SourceState::Terminated;
        self.positive_ack_timer.stop();
        self.inactivity_timer.stop();
        self.check_timer.stop();
        self.retransmissions.clear();
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
        if self.state == SourceState::Idle {
            // Nothing was sent yet, so there is no remote transaction to notify.
            self.notice_of_completion(
                ctx,
                condition_code,
                DeliveryCode::Incomplete,
                FileStatus::Unreported,
            );
            return;
        }
        self.cancelling = true;
        self.retransmissions.clear();
        self.metadata_requested = false;
        self.eof_condition = condition_code;
        self.eof_progress = self.progress();
        // As specified in 4.11.2.2, the EOF (cancel) PDU carries the checksum of the data sent
        // so far.
        self.eof_checksum = self
            .calculate_checksum(ctx, self.eof_progress)
            .unwrap_or_else(|e| {
                log::warn!("transaction {}: checksum calculation failed: {e}", self.id);
                0
            });
        self.send_eof(ctx);
        match self.transmission_mode() {
            TransmissionMode::Unacknowledged => self.notice_of_completion(
                ctx,
                condition_code,
                DeliveryCode::Incomplete,
                FileStatus::Unreported,
            ),
            TransmissionMode::Acknowledged => self.start_positive_ack_procedure(ctx),
        }
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
        self.notice_of_completion(
            ctx,
            condition_code,
            DeliveryCode::Incomplete,
            FileStatus::Unreported,
        );
    }

    fn declare_fault<H: UserFaultHookProvider>(
        &mut self,
        ctx: &mut TransactionContext<'_, H>,
        condition_code: ConditionCode,
    ) {
        let mut fh = ctx.local_cfg.fault_handler.get_fault_handler(condition_code);
        // CFDP standard 4.11.2.2.3: Any fault declared in the course of transferring
        // the EOF (cancel) PDU must result in abandonment of the transaction.
        if self.cancelling {
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
