//! # CFDP Entity
//!
//! The [Entity] is the single entry point for the host application. It owns the MIB, the
//! collaborators and a table of all live transactions keyed by [TransactionId].
//!
//! - [Entity::put] starts a new outgoing transfer.
//! - [Entity::on_pdu_received] decodes and routes a raw PDU. PDUs for unknown transactions
//!   spawn a new [DestinationTransaction] if they are allowed to start one.
//! - [Entity::tick] advances all transactions in ascending transaction ID order and removes
//!   the terminated ones.
//!
//! Every PDU handling step returns a [PduOutcome], so the host can log or count ignored and
//! dropped PDUs. The entity also keeps its own counters in an [AnomalyTracker].
use core::time::Duration;
use std::collections::BTreeMap;

use crate::{
    dest::DestinationTransaction,
    determine_packet_target,
    filestore::{FilestoreError, VirtualFilestore},
    pdu::{
        CommonPduConfig, FileDirectiveType, Pdu, PduBody, PduError, PduType, TransmissionMode,
        UnsignedByteField,
    },
    request::{generic_path_checks, FilePathTooLarge, ReadablePutRequest},
    seq_count::SequenceCountProvider,
    source::{SourceError, SourceFileParams, SourceTransaction},
    user::{Indication, IndicationSink, TransactionFinishedParams},
    GenericReceiveError, LocalEntityConfig, PacketTarget, PduReceiveProvider, PduSendProvider,
    RemoteEntityConfigProvider, TransactionId, UserFaultHookProvider,
};

/// Everything a transaction needs from its entity while it handles a PDU or a tick.
pub struct TransactionContext<'a, UserFaultHook: UserFaultHookProvider> {
    pub local_cfg: &'a LocalEntityConfig<UserFaultHook>,
    pub vfs: &'a dyn VirtualFilestore,
    pub sender: &'a dyn PduSendProvider,
    pub indications: &'a mut IndicationSink,
    /// Current time, which is the time of the last tick while a PDU is handled.
    pub now: Duration,
}

impl<UserFaultHook: UserFaultHookProvider> TransactionContext<'_, UserFaultHook> {
    /// Serialize and send a PDU. The transport is best-effort, so failures are only logged and
    /// left to the protocol timers.
    pub fn send_pdu(&self, remote_id: UnsignedByteField, pdu: &Pdu) {
        let raw_pdu = match pdu.to_vec() {
            Ok(raw_pdu) => raw_pdu,
            Err(e) => {
                log::error!("serializing {:?} PDU failed: {e}", pdu.directive_type());
                return;
            }
        };
        if let Err(e) =
            self.sender
                .send_pdu(remote_id, pdu.pdu_type(), pdu.directive_type(), &raw_pdu)
        {
            log::warn!(
                "sending PDU to entity {} failed: {e}",
                remote_id.value()
            );
        }
    }
}

/// Reason why a structurally valid PDU had no effect on its transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IgnoreReason {
    UnexpectedPdu {
        pdu_type: PduType,
        directive_type: Option<FileDirectiveType>,
    },
    NakInUnacknowledgedMode,
    InvalidNakSegment {
        start: u64,
        end: u64,
    },
    InvalidAckedDirective(FileDirectiveType),
    DuplicateMetadata,
    DeferredBufferFull,
    TransactionTerminated,
}

/// Reason why a PDU never reached a transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DropReason {
    Malformed(PduError),
    NotAddressedToEntity,
    NoMatchingTransaction,
    /// No remote entity configuration exists for the source entity of a new transaction.
    NoRemoteConfig(u64),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PduOutcome {
    Accepted,
    Ignored(IgnoreReason),
    Dropped(DropReason),
}

impl PduOutcome {
    pub(crate) fn unexpected(pdu: &Pdu) -> Self {
        Self::unexpected_pdu_type(pdu.pdu_type(), pdu.directive_type())
    }

    pub(crate) fn unexpected_directive(directive_type: FileDirectiveType) -> Self {
        Self::unexpected_pdu_type(PduType::FileDirective, Some(directive_type))
    }

    pub(crate) fn unexpected_pdu_type(
        pdu_type: PduType,
        directive_type: Option<FileDirectiveType>,
    ) -> Self {
        Self::Ignored(IgnoreReason::UnexpectedPdu {
            pdu_type,
            directive_type,
        })
    }
}

/// Counters for PDUs which did not have any effect.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyTracker {
    malformed_pdus: u32,
    not_addressed_pdus: u32,
    no_matching_transaction: u32,
    ignored_pdus: u32,
}

impl AnomalyTracker {
    #[inline]
    pub fn malformed_pdus(&self) -> u32 {
        self.malformed_pdus
    }

    #[inline]
    pub fn not_addressed_pdus(&self) -> u32 {
        self.not_addressed_pdus
    }

    #[inline]
    pub fn no_matching_transaction(&self) -> u32 {
        self.no_matching_transaction
    }

    #[inline]
    pub fn ignored_pdus(&self) -> u32 {
        self.ignored_pdus
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn record(&mut self, outcome: &PduOutcome) {
        let counter = match outcome {
            PduOutcome::Accepted => return,
            PduOutcome::Ignored(_) => &mut self.ignored_pdus,
            PduOutcome::Dropped(DropReason::Malformed(_)) => &mut self.malformed_pdus,
            PduOutcome::Dropped(DropReason::NotAddressedToEntity) => &mut self.not_addressed_pdus,
            PduOutcome::Dropped(DropReason::NoMatchingTransaction)
            | PduOutcome::Dropped(DropReason::NoRemoteConfig(_)) => {
                &mut self.no_matching_transaction
            }
        };
        *counter = counter.wrapping_add(1);
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PutRequestError {
    #[error("no remote entity configuration found for {0:?}")]
    NoRemoteCfgFound(UnsignedByteField),
    #[error("transfers to the local entity are not supported")]
    LoopbackNotSupported,
    #[error(transparent)]
    FilePathTooLarge(#[from] FilePathTooLarge),
    #[error("source file does not exist")]
    FileDoesNotExist,
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
    #[error("error related to PDU creation: {0}")]
    Pdu(#[from] PduError),
    #[error("all sequence numbers are used by live transactions")]
    NoFreeSequenceNumber,
    #[error(transparent)]
    Source(#[from] SourceError),
}

pub enum Transaction {
    Source(SourceTransaction),
    Destination(DestinationTransaction),
}

impl Transaction {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            Transaction::Source(source) => source.transaction_id(),
            Transaction::Destination(dest) => dest.transaction_id(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        match self {
            Transaction::Source(source) => source.is_terminated(),
            Transaction::Destination(dest) => dest.is_terminated(),
        }
    }

    pub fn is_suspended(&self) -> bool {
        match self {
            Transaction::Source(source) => source.is_suspended(),
            Transaction::Destination(dest) => dest.is_suspended(),
        }
    }

    pub fn transmission_mode(&self) -> TransmissionMode {
        match self {
            Transaction::Source(source) => source.transmission_mode(),
            Transaction::Destination(dest) => dest.transmission_mode(),
        }
    }

    fn tick<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) {
        match self {
            Transaction::Source(source) => source.tick(ctx),
            Transaction::Destination(dest) => dest.tick(ctx),
        }
    }

    fn cancel<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) -> bool {
        match self {
            Transaction::Source(source) => source.cancel(ctx),
            Transaction::Destination(dest) => dest.cancel(ctx),
        }
    }

    fn suspend<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) -> bool {
        match self {
            Transaction::Source(source) => source.suspend(ctx),
            Transaction::Destination(dest) => dest.suspend(ctx),
        }
    }

    fn resume<H: UserFaultHookProvider>(&mut self, ctx: &mut TransactionContext<'_, H>) -> bool {
        match self {
            Transaction::Source(source) => source.resume(ctx),
            Transaction::Destination(dest) => dest.resume(ctx),
        }
    }
}

/// A CFDP entity which can act as the sender and the receiver of any number of concurrent
/// file transfers.
///
/// The entity does not read a clock on its own. The time passed to [Self::tick] is the only
/// time input, and PDUs are handled with the time of the last tick.
pub struct Entity<
    Vfs: VirtualFilestore,
    Sender: PduSendProvider,
    UserFaultHook: UserFaultHookProvider,
    RemoteCfgTable: RemoteEntityConfigProvider,
    SeqCounter: SequenceCountProvider,
> {
    local_cfg: LocalEntityConfig<UserFaultHook>,
    remote_cfg_table: RemoteCfgTable,
    vfs: Vfs,
    sender: Sender,
    seq_counter: SeqCounter,
    transactions: BTreeMap<TransactionId, Transaction>,
    indications: IndicationSink,
    anomalies: AnomalyTracker,
    last_tick: Duration,
}

impl<
        Vfs: VirtualFilestore,
        Sender: PduSendProvider,
        UserFaultHook: UserFaultHookProvider,
        RemoteCfgTable: RemoteEntityConfigProvider,
        SeqCounter: SequenceCountProvider,
    > Entity<Vfs, Sender, UserFaultHook, RemoteCfgTable, SeqCounter>
{
    /// Creates a new entity.
    ///
    /// # Arguments
    ///
    /// * `local_cfg` - The local entity configuration, including the fault handler table.
    /// * `remote_cfg_table` - The [RemoteEntityConfigProvider] used to look up remote entities.
    ///   A transaction takes a copy of the configuration of its remote entity.
    /// * `vfs` - [VirtualFilestore] used to read sent files and write received files.
    /// * `sender` - [PduSendProvider] used to send all generated PDUs.
    /// * `seq_counter` - [SequenceCountProvider] for the sequence numbers of new transactions.
    pub fn new(
        local_cfg: LocalEntityConfig<UserFaultHook>,
        remote_cfg_table: RemoteCfgTable,
        vfs: Vfs,
        sender: Sender,
        seq_counter: SeqCounter,
    ) -> Self {
        Self {
            indications: IndicationSink::new(local_cfg.indication_cfg),
            local_cfg,
            remote_cfg_table,
            vfs,
            sender,
            seq_counter,
            transactions: BTreeMap::new(),
            anomalies: AnomalyTracker::default(),
            last_tick: Duration::ZERO,
        }
    }

    #[inline]
    pub fn id(&self) -> UnsignedByteField {
        self.local_cfg.id
    }

    #[inline]
    pub fn local_cfg(&self) -> &LocalEntityConfig<UserFaultHook> {
        &self.local_cfg
    }

    #[inline]
    pub fn local_cfg_mut(&mut self) -> &mut LocalEntityConfig<UserFaultHook> {
        &mut self.local_cfg
    }

    #[inline]
    pub fn remote_cfg_table(&self) -> &RemoteCfgTable {
        &self.remote_cfg_table
    }

    #[inline]
    pub fn remote_cfg_table_mut(&mut self) -> &mut RemoteCfgTable {
        &mut self.remote_cfg_table
    }

    #[inline]
    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    #[inline]
    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    #[inline]
    pub fn anomalies(&self) -> &AnomalyTracker {
        &self.anomalies
    }

    pub fn transaction(&self, id: &TransactionId) -> Option<&Transaction> {
        self.transactions.get(id)
    }

    /// IDs of all live transactions in ascending order.
    pub fn transaction_ids(&self) -> impl Iterator<Item = &TransactionId> {
        self.transactions.keys()
    }

    #[inline]
    pub fn num_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Drain all pending indications.
    pub fn indications(&mut self) -> impl Iterator<Item = Indication> + '_ {
        self.indications.drain_indications()
    }

    #[inline]
    pub fn pending_indications(&self) -> usize {
        self.indications.pending_indications()
    }

    /// Drain all pending completion indications. Exactly one is generated per transaction.
    pub fn completion_indications(
        &mut self,
    ) -> impl Iterator<Item = TransactionFinishedParams> + '_ {
        self.indications.drain_completions()
    }

    fn split(
        &mut self,
    ) -> (
        TransactionContext<'_, UserFaultHook>,
        &mut BTreeMap<TransactionId, Transaction>,
    ) {
        (
            TransactionContext {
                local_cfg: &self.local_cfg,
                vfs: &self.vfs,
                sender: &self.sender,
                indications: &mut self.indications,
                now: self.last_tick,
            },
            &mut self.transactions,
        )
    }

    /// Start a new Copy File procedure. The transfer itself is performed by [Self::tick].
    ///
    /// The request is rejected before any transaction is created if no remote configuration
    /// exists for the destination or if the source file can not be read.
    pub fn put(
        &mut self,
        put_request: &impl ReadablePutRequest,
    ) -> Result<TransactionId, PutRequestError> {
        let dest_id = put_request.destination_id();
        let remote_cfg = *self
            .remote_cfg_table
            .get(dest_id.value())
            .ok_or(PutRequestError::NoRemoteCfgFound(dest_id))?;
        if dest_id.value() == self.local_cfg.id.value() {
            return Err(PutRequestError::LoopbackNotSupported);
        }
        generic_path_checks(put_request.source_file(), put_request.dest_file())?;
        if !self.vfs.exists(put_request.source_file())?
            || !self.vfs.is_file(put_request.source_file())?
        {
            return Err(PutRequestError::FileDoesNotExist);
        }
        let file_size = self.vfs.file_size(put_request.source_file())?;
        let trans_mode = put_request
            .trans_mode()
            .unwrap_or(remote_cfg.default_transmission_mode);
        let closure_requested = put_request
            .closure_requested()
            .unwrap_or(remote_cfg.closure_requested_by_default);

        // Both the source entity and destination entity ID field must have the same size.
        // The larger of both widths is used.
        let id_width = core::cmp::max(self.local_cfg.id.size(), dest_id.size());
        let source_id = self.local_cfg.id.with_width(id_width)?;
        let dest_id = dest_id.with_width(id_width)?;
        let seq_num = self.next_free_seq_num(source_id)?;
        let pdu_conf = CommonPduConfig::new(source_id, dest_id, seq_num, trans_mode)?;
        let transaction = SourceTransaction::new(
            pdu_conf,
            remote_cfg,
            SourceFileParams {
                source_file: String::from(put_request.source_file()),
                dest_file: String::from(put_request.dest_file()),
                file_size,
                closure_requested,
            },
        )?;
        let id = transaction.transaction_id();
        log::info!(
            "transaction {id}: sending {} ({file_size} bytes) to entity {} in {trans_mode:?} mode",
            put_request.source_file(),
            dest_id.value()
        );
        self.transactions.insert(id, Transaction::Source(transaction));
        self.indications.push(Indication::TransactionStarted(id));
        Ok(id)
    }

    /// Sequence numbers of live transactions are skipped. Checking one more number than there
    /// are live transactions is enough unless the sequence number space itself is exhausted.
    fn next_free_seq_num(
        &mut self,
        source_id: UnsignedByteField,
    ) -> Result<UnsignedByteField, PutRequestError> {
        for _ in 0..=self.transactions.len() {
            let seq_num = self.seq_counter.get_and_increment();
            if !self
                .transactions
                .contains_key(&TransactionId::new(source_id, seq_num))
            {
                return Ok(seq_num);
            }
            log::debug!(
                "sequence number {} is used by a live transaction",
                seq_num.value()
            );
        }
        Err(PutRequestError::NoFreeSequenceNumber)
    }

    /// Cancel a live transaction. Returns [false] if no such transaction exists or if it is
    /// already being cancelled.
    pub fn cancel(&mut self, id: &TransactionId) -> bool {
        let (mut ctx, transactions) = self.split();
        transactions
            .get_mut(id)
            .map(|transaction| transaction.cancel(&mut ctx))
            .unwrap_or(false)
    }

    /// Suspend a live transaction. A suspended transaction does not send any PDUs and its
    /// timers are frozen, but received PDUs are still processed.
    pub fn suspend(&mut self, id: &TransactionId) -> bool {
        let (mut ctx, transactions) = self.split();
        transactions
            .get_mut(id)
            .map(|transaction| transaction.suspend(&mut ctx))
            .unwrap_or(false)
    }

    pub fn resume(&mut self, id: &TransactionId) -> bool {
        let (mut ctx, transactions) = self.split();
        transactions
            .get_mut(id)
            .map(|transaction| transaction.resume(&mut ctx))
            .unwrap_or(false)
    }

    /// Advance all live transactions in ascending transaction ID order and remove the
    /// terminated ones. Returns the number of remaining live transactions.
    pub fn tick(&mut self, now: Duration) -> usize {
        self.last_tick = now;
        let (mut ctx, transactions) = self.split();
        for transaction in transactions.values_mut() {
            transaction.tick(&mut ctx);
        }
        transactions.retain(|id, transaction| {
            if transaction.is_terminated() {
                log::debug!("transaction {id} removed");
                return false;
            }
            true
        });
        transactions.len()
    }

    /// Decode a raw PDU and route it to its transaction.
    pub fn on_pdu_received(&mut self, raw_pdu: &[u8]) -> PduOutcome {
        match Pdu::from_bytes(raw_pdu) {
            Ok(pdu) => self.on_pdu(&pdu),
            Err(e) => {
                log::warn!("dropping malformed PDU: {e}");
                let outcome = PduOutcome::Dropped(DropReason::Malformed(e));
                self.anomalies.record(&outcome);
                outcome
            }
        }
    }

    /// Route a decoded PDU to its transaction.
    pub fn on_pdu(&mut self, pdu: &Pdu) -> PduOutcome {
        let outcome = self.route_pdu(pdu);
        match outcome {
            PduOutcome::Accepted => (),
            PduOutcome::Ignored(reason) => log::debug!(
                "transaction {}: {:?} PDU ignored: {reason:?}",
                pdu.transaction_id(),
                pdu.directive_type()
            ),
            PduOutcome::Dropped(reason) => log::info!(
                "transaction {}: {:?} PDU dropped: {reason:?}",
                pdu.transaction_id(),
                pdu.directive_type()
            ),
        }
        self.anomalies.record(&outcome);
        outcome
    }

    fn route_pdu(&mut self, pdu: &Pdu) -> PduOutcome {
        let pdu_conf = pdu.header().common_pdu_conf();
        let target = determine_packet_target(pdu);
        let local_id = self.local_cfg.id.value();
        let addressed_to_us = match target {
            PacketTarget::DestEntity => pdu_conf.dest_id().value() == local_id,
            PacketTarget::SourceEntity => pdu_conf.source_id().value() == local_id,
        };
        if !addressed_to_us {
            return PduOutcome::Dropped(DropReason::NotAddressedToEntity);
        }
        let id = pdu.transaction_id();
        if !self.transactions.contains_key(&id) {
            if !Self::starts_transaction(pdu, target) {
                return PduOutcome::Dropped(DropReason::NoMatchingTransaction);
            }
            let source_id = pdu_conf.source_id().value();
            let Some(remote_cfg) = self.remote_cfg_table.get(source_id) else {
                return PduOutcome::Dropped(DropReason::NoRemoteConfig(source_id));
            };
            let transaction = DestinationTransaction::new(pdu.header(), *remote_cfg, self.last_tick);
            log::info!("transaction {id}: new incoming transaction");
            self.transactions
                .insert(id, Transaction::Destination(transaction));
        }
        let (mut ctx, transactions) = self.split();
        match (transactions.get_mut(&id), target) {
            (Some(Transaction::Source(source)), PacketTarget::SourceEntity) => {
                source.on_pdu(&mut ctx, pdu)
            }
            (Some(Transaction::Destination(dest)), PacketTarget::DestEntity) => {
                dest.on_pdu(&mut ctx, pdu)
            }
            _ => PduOutcome::Dropped(DropReason::NoMatchingTransaction),
        }
    }

    /// A Metadata PDU always starts a transaction. In unacknowledged mode, File Data and EOF
    /// PDUs may overtake the Metadata PDU and start a transaction with deferred metadata.
    fn starts_transaction(pdu: &Pdu, target: PacketTarget) -> bool {
        if target != PacketTarget::DestEntity {
            return false;
        }
        match pdu.body() {
            PduBody::Metadata(_) => true,
            PduBody::FileData(_) | PduBody::Eof(_) => {
                pdu.header().common_pdu_conf().trans_mode == TransmissionMode::Unacknowledged
            }
            _ => false,
        }
    }

    /// Drain a non-blocking receiver and handle all received PDUs. Returns the number of
    /// handled PDUs.
    pub fn poll_receiver(
        &mut self,
        receiver: &impl PduReceiveProvider,
    ) -> Result<usize, GenericReceiveError> {
        let mut handled = 0;
        while let Some(pdu_with_info) = receiver.try_recv_pdu()? {
            self.on_pdu_received(pdu_with_info.raw_pdu());
            handled += 1;
        }
        Ok(handled)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::{
        filestore::InMemoryFilestore,
        pdu::{ChecksumType, ConditionCode, EofPdu, FileDataPdu, MetadataPdu, NakPdu},
        request::PutRequest,
        seq_count::SeqCountProviderSimple,
        tests::{
            basic_remote_cfg_table, TestCfdpSender, TestFaultHandler, LOCAL_ID, REMOTE_ID,
        },
        IndicationConfig, PduOwnedWithInfo, StdRemoteEntityConfigProvider,
    };

    type TestEntity = Entity<
        InMemoryFilestore,
        TestCfdpSender,
        TestFaultHandler,
        StdRemoteEntityConfigProvider,
        SeqCountProviderSimple,
    >;

    const SRC_FILE: &str = "/tmp/hello.txt";

    fn test_entity(trans_mode: TransmissionMode) -> TestEntity {
        let vfs = InMemoryFilestore::default();
        vfs.insert_file(SRC_FILE, b"Hello World!").unwrap();
        Entity::new(
            LocalEntityConfig::new(
                LOCAL_ID,
                IndicationConfig::default(),
                TestFaultHandler::default(),
            ),
            basic_remote_cfg_table(REMOTE_ID, trans_mode, false),
            vfs,
            TestCfdpSender::default(),
            SeqCountProviderSimple::default(),
        )
    }

    fn put_request() -> PutRequest {
        PutRequest::new_regular_request(REMOTE_ID, SRC_FILE, "/tmp/hello2.txt", None, None)
            .unwrap()
    }

    // PDU sent by the remote entity towards the local entity.
    fn incoming_pdu(trans_mode: TransmissionMode, seq_num: u16, body: PduBody) -> Vec<u8> {
        let pdu_conf = CommonPduConfig::new(
            REMOTE_ID,
            LOCAL_ID,
            UnsignedByteField::new_u16(seq_num),
            trans_mode,
        )
        .unwrap();
        Pdu::new(pdu_conf, body).to_vec().unwrap()
    }

    fn metadata(file_size: u64) -> PduBody {
        PduBody::Metadata(MetadataPdu::new(
            false,
            ChecksumType::Crc32,
            file_size,
            "/tmp/remote.txt",
            "/tmp/local.txt",
        ))
    }

    #[test]
    fn test_put_creates_source_transaction() {
        let mut entity = test_entity(TransmissionMode::Unacknowledged);
        let id = entity.put(&put_request()).unwrap();
        assert_eq!(id.source_id().value(), LOCAL_ID.value());
        assert_eq!(entity.num_transactions(), 1);
        assert!(matches!(
            entity.transaction(&id),
            Some(Transaction::Source(_))
        ));
        assert_eq!(
            entity.indications().next(),
            Some(Indication::TransactionStarted(id))
        );
        // Nothing is sent before the first tick.
        assert!(entity.sender().queue_empty());
        entity.tick(Duration::ZERO);
        let metadata = entity.sender().retrieve_next_pdu().unwrap();
        assert_eq!(metadata.remote_id, REMOTE_ID);
        assert_eq!(metadata.file_directive_type, Some(FileDirectiveType::MetadataPdu));
    }

    #[test]
    fn test_put_no_remote_cfg() {
        let mut entity = test_entity(TransmissionMode::Unacknowledged);
        let request = PutRequest::new_regular_request(
            UnsignedByteField::new_u16(5),
            SRC_FILE,
            "dest.txt",
            None,
            None,
        )
        .unwrap();
        let error = entity.put(&request).unwrap_err();
        if let PutRequestError::NoRemoteCfgFound(id) = error {
            assert_eq!(id.value(), 5);
        } else {
            panic!("unexpected error {error:?}");
        }
        assert_eq!(entity.num_transactions(), 0);
    }

    #[test]
    fn test_put_missing_file() {
        let mut entity = test_entity(TransmissionMode::Unacknowledged);
        let request =
            PutRequest::new_regular_request(REMOTE_ID, "/tmp/missing.txt", "dest.txt", None, None)
                .unwrap();
        assert!(matches!(
            entity.put(&request),
            Err(PutRequestError::FileDoesNotExist)
        ));
        assert_eq!(entity.num_transactions(), 0);
        assert_eq!(entity.indications().count(), 0);
    }

    #[test]
    fn test_sequence_numbers_increment() {
        let mut entity = test_entity(TransmissionMode::Unacknowledged);
        let id_0 = entity.put(&put_request()).unwrap();
        let id_1 = entity.put(&put_request()).unwrap();
        assert_eq!(id_0.seq_num().value() + 1, id_1.seq_num().value());
        let ids: Vec<_> = entity.transaction_ids().copied().collect();
        assert_eq!(ids, vec![id_0, id_1]);
    }

    #[test]
    fn test_live_sequence_number_skipped() {
        let mut entity = test_entity(TransmissionMode::Unacknowledged);
        entity.seq_counter = SeqCountProviderSimple::new(1).unwrap();
        let id_0 = entity.put(&put_request()).unwrap();
        for _ in 0..255 {
            entity.seq_counter.increment();
        }
        // The counter wrapped around to the sequence number of the live transaction.
        let id_1 = entity.put(&put_request()).unwrap();
        assert_eq!(id_0.seq_num().value(), 0);
        assert_eq!(id_1.seq_num().value(), 1);
    }

    #[test]
    fn test_malformed_pdu_dropped() {
        let mut entity = test_entity(TransmissionMode::Unacknowledged);
        let mut raw = incoming_pdu(TransmissionMode::Unacknowledged, 0, metadata(4));
        raw.push(0);
        let outcome = entity.on_pdu_received(&raw);
        assert!(matches!(
            outcome,
            PduOutcome::Dropped(DropReason::Malformed(_))
        ));
        assert_eq!(entity.num_transactions(), 0);
        assert_eq!(entity.anomalies().malformed_pdus(), 1);
    }

    #[test]
    fn test_pdu_not_addressed_to_entity() {
        let mut entity = test_entity(TransmissionMode::Unacknowledged);
        let pdu_conf = CommonPduConfig::new(
            REMOTE_ID,
            UnsignedByteField::new_u16(3),
            UnsignedByteField::new_u16(0),
            TransmissionMode::Unacknowledged,
        )
        .unwrap();
        let raw = Pdu::new(pdu_conf, metadata(4)).to_vec().unwrap();
        assert_eq!(
            entity.on_pdu_received(&raw),
            PduOutcome::Dropped(DropReason::NotAddressedToEntity)
        );
        assert_eq!(entity.anomalies().not_addressed_pdus(), 1);
    }

    #[test]
    fn test_metadata_spawns_destination() {
        let mut entity = test_entity(TransmissionMode::Acknowledged);
        let raw = incoming_pdu(TransmissionMode::Acknowledged, 3, metadata(4));
        assert_eq!(entity.on_pdu_received(&raw), PduOutcome::Accepted);
        let id = TransactionId::new(REMOTE_ID, UnsignedByteField::new_u16(3));
        assert!(matches!(
            entity.transaction(&id),
            Some(Transaction::Destination(_))
        ));
        assert!(entity.vfs().file_data("/tmp/local.txt").is_some());
    }

    #[test]
    fn test_acked_file_data_without_transaction_dropped() {
        let mut entity = test_entity(TransmissionMode::Acknowledged);
        let raw = incoming_pdu(
            TransmissionMode::Acknowledged,
            0,
            PduBody::FileData(FileDataPdu::new(0, &[1, 2])),
        );
        assert_eq!(
            entity.on_pdu_received(&raw),
            PduOutcome::Dropped(DropReason::NoMatchingTransaction)
        );
        assert_eq!(entity.num_transactions(), 0);
        assert_eq!(entity.anomalies().no_matching_transaction(), 1);
    }

    #[test]
    fn test_unacked_file_data_spawns_deferred_destination() {
        let mut entity = test_entity(TransmissionMode::Unacknowledged);
        let raw = incoming_pdu(
            TransmissionMode::Unacknowledged,
            0,
            PduBody::FileData(FileDataPdu::new(0, &[1, 2])),
        );
        assert_eq!(entity.on_pdu_received(&raw), PduOutcome::Accepted);
        assert_eq!(entity.num_transactions(), 1);
        let raw = incoming_pdu(
            TransmissionMode::Unacknowledged,
            0,
            PduBody::Eof(EofPdu::new_no_error(crate::CRC_32.checksum(&[1, 2]), 2)),
        );
        assert_eq!(entity.on_pdu_received(&raw), PduOutcome::Accepted);
        let raw = incoming_pdu(TransmissionMode::Unacknowledged, 0, metadata(2));
        assert_eq!(entity.on_pdu_received(&raw), PduOutcome::Accepted);
        assert_eq!(entity.tick(Duration::ZERO), 0);
        assert_eq!(entity.vfs().file_data("/tmp/local.txt").unwrap(), vec![1, 2]);
        let completion = entity.completion_indications().next().unwrap();
        assert_eq!(completion.condition_code, ConditionCode::NoError);
    }

    #[test]
    fn test_unknown_source_entity() {
        let mut entity = test_entity(TransmissionMode::Unacknowledged);
        let pdu_conf = CommonPduConfig::new(
            UnsignedByteField::new_u16(9),
            LOCAL_ID,
            UnsignedByteField::new_u16(0),
            TransmissionMode::Unacknowledged,
        )
        .unwrap();
        let raw = Pdu::new(pdu_conf, metadata(4)).to_vec().unwrap();
        assert_eq!(
            entity.on_pdu_received(&raw),
            PduOutcome::Dropped(DropReason::NoRemoteConfig(9))
        );
    }

    #[test]
    fn test_ignored_pdu_counted() {
        let mut entity = test_entity(TransmissionMode::Unacknowledged);
        let id = entity.put(&put_request()).unwrap();
        entity.tick(Duration::ZERO);
        let pdu_conf = CommonPduConfig::new(
            LOCAL_ID,
            REMOTE_ID,
            *id.seq_num(),
            TransmissionMode::Unacknowledged,
        )
        .unwrap();
        let raw = Pdu::new(pdu_conf, PduBody::Nak(NakPdu::new(0, 4, &[(0, 4)])))
            .to_vec()
            .unwrap();
        assert_eq!(
            entity.on_pdu_received(&raw),
            PduOutcome::Ignored(IgnoreReason::NakInUnacknowledgedMode)
        );
        assert_eq!(entity.anomalies().ignored_pdus(), 1);
    }

    #[test]
    fn test_cancel_suspend_resume_unknown() {
        let mut entity = test_entity(TransmissionMode::Unacknowledged);
        let id = TransactionId::new(LOCAL_ID, UnsignedByteField::new_u16(20));
        assert!(!entity.cancel(&id));
        assert!(!entity.suspend(&id));
        assert!(!entity.resume(&id));
    }

    #[test]
    fn test_cancel_before_first_tick() {
        let mut entity = test_entity(TransmissionMode::Acknowledged);
        let id = entity.put(&put_request()).unwrap();
        assert!(entity.cancel(&id));
        assert_eq!(entity.tick(Duration::ZERO), 0);
        assert!(entity.sender().queue_empty());
        let completion = entity.completion_indications().next().unwrap();
        assert_eq!(completion.condition_code, ConditionCode::CancelRequestReceived);
    }

    #[test]
    fn test_suspended_transaction_not_ticked() {
        let mut entity = test_entity(TransmissionMode::Unacknowledged);
        let id = entity.put(&put_request()).unwrap();
        assert!(entity.suspend(&id));
        assert!(entity.transaction(&id).unwrap().is_suspended());
        entity.tick(Duration::ZERO);
        assert!(entity.sender().queue_empty());
        assert!(entity.resume(&id));
        entity.tick(Duration::ZERO);
        assert_eq!(entity.sender().queue_len(), 1);
    }

    #[test]
    fn test_poll_receiver() {
        let mut entity = test_entity(TransmissionMode::Unacknowledged);
        let (tx, rx) = mpsc::channel();
        let raw = incoming_pdu(TransmissionMode::Unacknowledged, 1, metadata(0));
        tx.send(PduOwnedWithInfo::new_from_raw_packet(&raw).unwrap())
            .unwrap();
        tx.send(PduOwnedWithInfo::new(PduType::FileData, None, vec![0; 3]))
            .unwrap();
        assert_eq!(entity.poll_receiver(&rx), Ok(2));
        assert_eq!(entity.num_transactions(), 1);
        assert_eq!(entity.anomalies().malformed_pdus(), 1);
        drop(tx);
        assert_eq!(
            entity.poll_receiver(&rx),
            Err(GenericReceiveError::TxDisconnected)
        );
    }
}
