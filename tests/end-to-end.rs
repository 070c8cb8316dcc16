//! End-to-end integration tests which connect two entities with in-memory links.
//!
//! Most tests drive both entities with simulated time, so timer related behaviour can be tested
//! without sleeping. The threaded test at the end runs two entities on the native filestore in
//! real time.
use std::{
    fs::OpenOptions,
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

use cfdp::{
    entity::{DropReason, Entity, PduOutcome},
    filestore::{InMemoryFilestore, NativeFilestore, VirtualFilestore},
    pdu::{
        ChecksumType, ConditionCode, DeliveryCode, FaultHandlerCode, FileDirectiveType,
        FileStatus, Pdu, PduBody, PduError, TransmissionMode, UnsignedByteField,
    },
    request::PutRequest,
    seq_count::SeqCountProviderSimple,
    time::{Clock, StdClock},
    user::TransactionFinishedParams,
    FaultInfo, IndicationConfig, LocalEntityConfig, PduOwnedWithInfo, RemoteEntityConfig,
    RemoteEntityConfigProvider, StdRemoteEntityConfigProvider, UserFaultHookProvider,
};

const SOURCE_ID: UnsignedByteField = UnsignedByteField::new_u16(1);
const DEST_ID: UnsignedByteField = UnsignedByteField::new_u16(2);

const SRC_FILE: &str = "/src/data.bin";
const DEST_FILE: &str = "/dst/data.bin";
const FILE_DATA: &[u8] = b"0123456789";

const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct RecordingFaultHook {
    faults: Vec<(FaultHandlerCode, FaultInfo)>,
}

impl UserFaultHookProvider for RecordingFaultHook {
    fn notice_of_suspension_cb(&mut self, fault_info: FaultInfo) {
        self.faults
            .push((FaultHandlerCode::NoticeOfSuspension, fault_info));
    }

    fn notice_of_cancellation_cb(&mut self, fault_info: FaultInfo) {
        self.faults
            .push((FaultHandlerCode::NoticeOfCancellation, fault_info));
    }

    fn abandoned_cb(&mut self, fault_info: FaultInfo) {
        self.faults
            .push((FaultHandlerCode::AbandonTransaction, fault_info));
    }

    fn ignore_cb(&mut self, fault_info: FaultInfo) {
        self.faults.push((FaultHandlerCode::IgnoreError, fault_info));
    }
}

type TestEntity = Entity<
    InMemoryFilestore,
    mpsc::Sender<PduOwnedWithInfo>,
    RecordingFaultHook,
    StdRemoteEntityConfigProvider,
    SeqCountProviderSimple,
>;

/// Returns [false] to drop the PDU. The PDU may also be modified in place.
type LinkFilter = Box<dyn FnMut(&mut Pdu) -> bool>;

fn remote_cfg(id: UnsignedByteField, trans_mode: TransmissionMode) -> RemoteEntityConfig {
    let mut cfg = RemoteEntityConfig::new_with_default_values(
        id,
        1024,
        false,
        true,
        trans_mode,
        ChecksumType::Crc32,
    );
    cfg.max_file_segment_len = Some(4);
    cfg
}

fn new_entity(
    id: UnsignedByteField,
    remote_id: UnsignedByteField,
    trans_mode: TransmissionMode,
    sender: mpsc::Sender<PduOwnedWithInfo>,
) -> TestEntity {
    let mut remote_cfgs = StdRemoteEntityConfigProvider::default();
    remote_cfgs.add_config(&remote_cfg(remote_id, trans_mode));
    Entity::new(
        LocalEntityConfig::new(id, IndicationConfig::default(), RecordingFaultHook::default()),
        remote_cfgs,
        InMemoryFilestore::default(),
        sender,
        SeqCountProviderSimple::default(),
    )
}

/// Two entities connected by a lossless link, unless a filter is installed.
struct Testbench {
    source: TestEntity,
    dest: TestEntity,
    from_source: mpsc::Receiver<PduOwnedWithInfo>,
    from_dest: mpsc::Receiver<PduOwnedWithInfo>,
    to_dest_filter: LinkFilter,
    to_source_filter: LinkFilter,
    /// PDUs delivered to the destination entity.
    delivered_to_dest: Vec<Pdu>,
    /// PDUs delivered to the source entity.
    delivered_to_source: Vec<Pdu>,
    source_completions: Vec<TransactionFinishedParams>,
    dest_completions: Vec<TransactionFinishedParams>,
    now: Duration,
}

impl Testbench {
    fn new(trans_mode: TransmissionMode) -> Self {
        let (source_tx, from_source) = mpsc::channel();
        let (dest_tx, from_dest) = mpsc::channel();
        let source = new_entity(SOURCE_ID, DEST_ID, trans_mode, source_tx);
        source
            .vfs()
            .insert_file(SRC_FILE, FILE_DATA)
            .expect("inserting source file failed");
        Self {
            source,
            dest: new_entity(DEST_ID, SOURCE_ID, trans_mode, dest_tx),
            from_source,
            from_dest,
            to_dest_filter: Box::new(|_| true),
            to_source_filter: Box::new(|_| true),
            delivered_to_dest: Vec::new(),
            delivered_to_source: Vec::new(),
            source_completions: Vec::new(),
            dest_completions: Vec::new(),
            now: Duration::ZERO,
        }
    }

    fn put(&mut self) {
        let request = PutRequest::new_regular_request(DEST_ID, SRC_FILE, DEST_FILE, None, None)
            .expect("creating put request failed");
        self.source.put(&request).expect("put request failed");
    }

    fn forward(
        rx: &mpsc::Receiver<PduOwnedWithInfo>,
        filter: &mut LinkFilter,
        receiver: &mut TestEntity,
        delivered: &mut Vec<Pdu>,
    ) {
        while let Ok(pdu_with_info) = rx.try_recv() {
            let mut pdu = Pdu::from_bytes(pdu_with_info.raw_pdu()).expect("invalid PDU sent");
            if !filter(&mut pdu) {
                continue;
            }
            let raw = pdu.to_vec().expect("encoding PDU failed");
            receiver.on_pdu_received(&raw);
            delivered.push(pdu);
        }
    }

    fn step(&mut self) {
        self.source.tick(self.now);
        self.dest.tick(self.now);
        Self::forward(
            &self.from_source,
            &mut self.to_dest_filter,
            &mut self.dest,
            &mut self.delivered_to_dest,
        );
        Self::forward(
            &self.from_dest,
            &mut self.to_source_filter,
            &mut self.source,
            &mut self.delivered_to_source,
        );
        self.source_completions
            .extend(self.source.completion_indications());
        self.dest_completions
            .extend(self.dest.completion_indications());
        self.now += TICK_INTERVAL;
    }

    /// Step until both entities have finished all transactions.
    fn run_to_completion(&mut self, timeout: Duration) {
        let end = self.now + timeout;
        self.step();
        while self.source.num_transactions() > 0 || self.dest.num_transactions() > 0 {
            assert!(self.now < end, "transfer not finished at {:?}", self.now);
            self.step();
        }
        // Reap transactions which terminated while handling the last PDUs.
        self.step();
    }

    fn dest_pdus_of_type(&self, directive: FileDirectiveType) -> Vec<&Pdu> {
        self.delivered_to_source
            .iter()
            .filter(|pdu| pdu.directive_type() == Some(directive))
            .collect()
    }

    fn source_faults(&self) -> Vec<(FaultHandlerCode, FaultInfo)> {
        self.source.local_cfg().user_fault_hook().borrow().faults.clone()
    }

    fn dest_faults(&self) -> Vec<(FaultHandlerCode, FaultInfo)> {
        self.dest.local_cfg().user_fault_hook().borrow().faults.clone()
    }
}

fn file_data_range(pdu: &Pdu) -> Option<(u64, usize)> {
    match pdu.body() {
        PduBody::FileData(fd) => Some((fd.offset, fd.file_data.len())),
        _ => None,
    }
}

#[test]
fn test_unacked_transfer() {
    let mut tb = Testbench::new(TransmissionMode::Unacknowledged);
    tb.put();
    tb.run_to_completion(Duration::from_secs(5));

    let directives: Vec<_> = tb
        .delivered_to_dest
        .iter()
        .map(|pdu| pdu.directive_type())
        .collect();
    assert_eq!(
        directives,
        vec![
            Some(FileDirectiveType::MetadataPdu),
            None,
            None,
            None,
            Some(FileDirectiveType::EofPdu)
        ]
    );
    let segments: Vec<_> = tb
        .delivered_to_dest
        .iter()
        .filter_map(file_data_range)
        .collect();
    assert_eq!(segments, vec![(0, 4), (4, 4), (8, 2)]);
    // No Finished PDU without closure.
    assert!(tb.delivered_to_source.is_empty());

    assert_eq!(tb.dest.vfs().file_data(DEST_FILE).unwrap(), FILE_DATA);
    assert_eq!(tb.dest_completions.len(), 1);
    let completion = tb.dest_completions[0];
    assert_eq!(completion.condition_code, ConditionCode::NoError);
    assert_eq!(completion.delivery_code, DeliveryCode::Complete);
    assert_eq!(completion.file_status, FileStatus::Retained);
    assert_eq!(tb.source_completions.len(), 1);
    assert_eq!(tb.source_completions[0].condition_code, ConditionCode::NoError);
    assert_eq!(tb.source_completions[0].id, completion.id);
    assert!(tb.source_faults().is_empty());
    assert!(tb.dest_faults().is_empty());
}

#[test]
fn test_unacked_transfer_with_closure() {
    let mut tb = Testbench::new(TransmissionMode::Unacknowledged);
    let request =
        PutRequest::new_regular_request(DEST_ID, SRC_FILE, DEST_FILE, None, Some(true)).unwrap();
    tb.source.put(&request).unwrap();
    tb.run_to_completion(Duration::from_secs(5));
    let finished = tb.dest_pdus_of_type(FileDirectiveType::FinishedPdu);
    assert_eq!(finished.len(), 1);
    if let PduBody::Finished(finished) = finished[0].body() {
        assert_eq!(finished.condition_code, ConditionCode::NoError);
        assert_eq!(finished.delivery_code, DeliveryCode::Complete);
    } else {
        panic!("unexpected PDU body");
    }
    assert_eq!(tb.source_completions.len(), 1);
    assert_eq!(tb.source_completions[0].delivery_code, DeliveryCode::Complete);
    assert_eq!(tb.dest.vfs().file_data(DEST_FILE).unwrap(), FILE_DATA);
}

#[test]
fn test_acked_transfer_with_lost_segment() {
    let mut tb = Testbench::new(TransmissionMode::Acknowledged);
    let mut dropped = false;
    tb.to_dest_filter = Box::new(move |pdu| {
        if !dropped && file_data_range(pdu) == Some((4, 4)) {
            dropped = true;
            return false;
        }
        true
    });
    tb.put();
    tb.run_to_completion(Duration::from_secs(5));

    let naks = tb.dest_pdus_of_type(FileDirectiveType::NakPdu);
    assert_eq!(naks.len(), 1);
    if let PduBody::Nak(nak) = naks[0].body() {
        assert_eq!(nak.segment_requests.as_slice(), &[(4, 8)]);
    } else {
        panic!("unexpected PDU body");
    }
    // The lost segment was sent twice, the others once.
    let segments: Vec<_> = tb
        .delivered_to_dest
        .iter()
        .filter_map(file_data_range)
        .collect();
    assert_eq!(segments, vec![(0, 4), (8, 2), (4, 4)]);
    assert_eq!(tb.dest_pdus_of_type(FileDirectiveType::AckPdu).len(), 1);
    assert_eq!(tb.dest_pdus_of_type(FileDirectiveType::FinishedPdu).len(), 1);

    assert_eq!(tb.dest.vfs().file_data(DEST_FILE).unwrap(), FILE_DATA);
    assert_eq!(tb.dest_completions.len(), 1);
    assert_eq!(tb.dest_completions[0].condition_code, ConditionCode::NoError);
    assert_eq!(tb.dest_completions[0].delivery_code, DeliveryCode::Complete);
    assert_eq!(tb.source_completions.len(), 1);
    assert_eq!(tb.source_completions[0].condition_code, ConditionCode::NoError);
    assert!(tb.source_faults().is_empty());
    assert!(tb.dest_faults().is_empty());
}

#[test]
fn test_acked_source_inactivity() {
    let mut tb = Testbench::new(TransmissionMode::Acknowledged);
    // All Finished PDUs of the destination are lost.
    tb.to_source_filter =
        Box::new(|pdu| pdu.directive_type() != Some(FileDirectiveType::FinishedPdu));
    tb.put();
    let mut source_done_at = None;
    while tb.now < Duration::from_secs(60) {
        tb.step();
        if source_done_at.is_none() && tb.source.num_transactions() == 0 {
            source_done_at = Some(tb.delivered_to_dest.len());
        }
    }
    let sent_before_abandon = source_done_at.expect("source transaction did not terminate");
    // Nothing is sent after the transaction was abandoned.
    assert_eq!(tb.delivered_to_dest.len(), sent_before_abandon);

    let faults = tb.source_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].0, FaultHandlerCode::AbandonTransaction);
    assert_eq!(
        faults[0].1.condition_code,
        ConditionCode::InactivityDetected
    );
    assert_eq!(tb.source_completions.len(), 1);
    assert_eq!(
        tb.source_completions[0].condition_code,
        ConditionCode::InactivityDetected
    );
    // The destination gave up on the Finished PDU acknowledgement as well.
    assert_eq!(tb.dest.num_transactions(), 0);
    assert_eq!(tb.dest_completions.len(), 1);
}

#[test]
fn test_checksum_failure() {
    let mut tb = Testbench::new(TransmissionMode::Unacknowledged);
    tb.to_dest_filter = Box::new(|pdu| {
        if let PduBody::Eof(eof) = pdu.body() {
            let mut eof = *eof;
            eof.file_checksum ^= 0xFFFF;
            *pdu = Pdu::new(*pdu.header().common_pdu_conf(), PduBody::Eof(eof));
        }
        true
    });
    tb.put();
    tb.run_to_completion(Duration::from_secs(5));

    let faults = tb.dest_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].0, FaultHandlerCode::NoticeOfCancellation);
    assert_eq!(faults[0].1.condition_code, ConditionCode::FileChecksumFailure);
    assert_eq!(tb.dest_completions.len(), 1);
    let completion = tb.dest_completions[0];
    assert_eq!(completion.condition_code, ConditionCode::FileChecksumFailure);
    assert_eq!(completion.delivery_code, DeliveryCode::Incomplete);
    assert_eq!(tb.dest.num_transactions(), 0);
}

#[test]
fn test_checksum_failure_ignored() {
    let mut tb = Testbench::new(TransmissionMode::Unacknowledged);
    tb.dest
        .local_cfg_mut()
        .fault_handler
        .set_fault_handler(ConditionCode::FileChecksumFailure, FaultHandlerCode::IgnoreError);
    tb.to_dest_filter = Box::new(|pdu| {
        if let PduBody::FileData(fd) = pdu.body() {
            let mut fd = fd.clone();
            fd.file_data[0] ^= 0xFF;
            *pdu = Pdu::new(*pdu.header().common_pdu_conf(), PduBody::FileData(fd));
        }
        true
    });
    tb.put();
    tb.run_to_completion(Duration::from_secs(5));
    let faults = tb.dest_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].0, FaultHandlerCode::IgnoreError);
    assert_eq!(faults[0].1.condition_code, ConditionCode::FileChecksumFailure);
    let completion = tb.dest_completions[0];
    assert_eq!(completion.condition_code, ConditionCode::FileChecksumFailure);
    assert_eq!(completion.delivery_code, DeliveryCode::Incomplete);
    assert_eq!(completion.file_status, FileStatus::Retained);
}

#[test]
fn test_malformed_pdus_are_counted() {
    let mut tb = Testbench::new(TransmissionMode::Unacknowledged);
    tb.put();
    tb.step();
    let mut raw = tb.delivered_to_dest[0].to_vec().unwrap();
    raw.truncate(raw.len() - 1);
    let outcome = tb.dest.on_pdu_received(&raw);
    assert!(matches!(
        outcome,
        PduOutcome::Dropped(DropReason::Malformed(PduError::LengthMismatch { .. }))
    ));
    assert_eq!(tb.dest.anomalies().malformed_pdus(), 1);
    // The transfer is not affected.
    tb.run_to_completion(Duration::from_secs(5));
    assert_eq!(tb.dest.vfs().file_data(DEST_FILE).unwrap(), FILE_DATA);
}

#[test]
fn test_concurrent_transfers() {
    let mut tb = Testbench::new(TransmissionMode::Acknowledged);
    tb.source
        .vfs()
        .insert_file("/src/other.bin", b"another file")
        .unwrap();
    tb.put();
    let request =
        PutRequest::new_regular_request(DEST_ID, "/src/other.bin", "/dst/other.bin", None, None)
            .unwrap();
    tb.source.put(&request).unwrap();
    assert_eq!(tb.source.num_transactions(), 2);
    tb.run_to_completion(Duration::from_secs(5));
    assert_eq!(tb.dest.vfs().file_data(DEST_FILE).unwrap(), FILE_DATA);
    assert_eq!(
        tb.dest.vfs().file_data("/dst/other.bin").unwrap(),
        b"another file"
    );
    assert_eq!(tb.source_completions.len(), 2);
    assert_eq!(tb.dest_completions.len(), 2);
    assert!(tb
        .dest_completions
        .iter()
        .all(|params| params.condition_code == ConditionCode::NoError));
}

#[test]
fn test_indication_queue_bounded_without_draining() {
    let mut tb = Testbench::new(TransmissionMode::Unacknowledged);
    let limit = IndicationConfig::default().max_pending_indications;
    // Each transfer generates several indications per entity, most of them per segment.
    let transfers = limit / 4;
    for _ in 0..transfers {
        tb.put();
        tb.run_to_completion(Duration::from_secs(5));
        assert!(tb.source.pending_indications() <= limit);
        assert!(tb.dest.pending_indications() <= limit);
    }
    assert_eq!(tb.source_completions.len(), transfers);
    assert_eq!(tb.dest_completions.len(), transfers);
    assert_eq!(tb.dest.pending_indications(), limit);
    assert_eq!(tb.dest.indications().count(), limit);
    assert_eq!(tb.dest.pending_indications(), 0);
}

#[test]
fn test_remote_config_lookup() {
    let tb = Testbench::new(TransmissionMode::Acknowledged);
    let cfg = tb.source.remote_cfg_table().get(DEST_ID.value()).unwrap();
    assert_eq!(cfg.default_transmission_mode, TransmissionMode::Acknowledged);
    assert!(tb.source.remote_cfg_table().get(5).is_none());
}

type NativeEntity = Entity<
    NativeFilestore,
    mpsc::Sender<PduOwnedWithInfo>,
    RecordingFaultHook,
    StdRemoteEntityConfigProvider,
    SeqCountProviderSimple,
>;

fn run_entity(
    mut entity: NativeEntity,
    rx: mpsc::Receiver<PduOwnedWithInfo>,
    stop_signal: Arc<AtomicBool>,
    completion_signal: Arc<AtomicBool>,
) {
    let clock = StdClock::new();
    while !stop_signal.load(Ordering::Relaxed) {
        // The peer thread may already be gone after the transfer finished.
        let _ = entity.poll_receiver(&rx);
        entity.tick(clock.now());
        for completion in entity.completion_indications() {
            assert_eq!(completion.condition_code, ConditionCode::NoError);
            completion_signal.store(true, Ordering::Relaxed);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn threaded_transfer(trans_mode: TransmissionMode) {
    let stop_signal = Arc::new(AtomicBool::new(false));
    let source_done = Arc::new(AtomicBool::new(false));
    let dest_done = Arc::new(AtomicBool::new(false));

    let srcfile = tempfile::NamedTempFile::new().unwrap().into_temp_path();
    let mut file = OpenOptions::new()
        .write(true)
        .open(&srcfile)
        .expect("opening file failed");
    let file_data: Vec<u8> = (0..2000).map(|_| rand::random::<u8>()).collect();
    file.write_all(&file_data)
        .expect("writing file content failed");
    let destdir = tempfile::tempdir().expect("creating temp directory failed");
    let destfile = destdir.path().join("test.bin");

    let (source_tx, dest_rx) = mpsc::channel();
    let (dest_tx, source_rx) = mpsc::channel();
    let mut source_remote_cfgs = StdRemoteEntityConfigProvider::default();
    source_remote_cfgs.add_config(&remote_cfg(DEST_ID, trans_mode));
    let mut source = NativeEntity::new(
        LocalEntityConfig::new(
            SOURCE_ID,
            IndicationConfig::default(),
            RecordingFaultHook::default(),
        ),
        source_remote_cfgs,
        NativeFilestore::default(),
        source_tx,
        SeqCountProviderSimple::default(),
    );
    let mut dest_remote_cfgs = StdRemoteEntityConfigProvider::default();
    dest_remote_cfgs.add_config(&remote_cfg(SOURCE_ID, trans_mode));
    let dest = NativeEntity::new(
        LocalEntityConfig::new(
            DEST_ID,
            IndicationConfig::default(),
            RecordingFaultHook::default(),
        ),
        dest_remote_cfgs,
        NativeFilestore::default(),
        dest_tx,
        SeqCountProviderSimple::default(),
    );
    let request = PutRequest::new_regular_request(
        DEST_ID,
        srcfile.to_str().expect("invalid path string"),
        destfile.to_str().expect("invalid path string"),
        None,
        None,
    )
    .expect("put request creation failed");
    source.put(&request).expect("put request failed");

    let (stop, done) = (stop_signal.clone(), source_done.clone());
    let jh_source = thread::spawn(move || run_entity(source, source_rx, stop, done));
    let (stop, done) = (stop_signal.clone(), dest_done.clone());
    let jh_dest = thread::spawn(move || run_entity(dest, dest_rx, stop, done));

    let start = std::time::Instant::now();
    while !(source_done.load(Ordering::Relaxed) && dest_done.load(Ordering::Relaxed)) {
        if start.elapsed() > Duration::from_secs(10) {
            stop_signal.store(true, Ordering::Relaxed);
            panic!("file transfer not finished in 10 seconds");
        }
        thread::sleep(Duration::from_millis(20));
    }
    stop_signal.store(true, Ordering::Relaxed);
    jh_source.join().unwrap();
    jh_dest.join().unwrap();

    let vfs = NativeFilestore::default();
    let dest_path = destfile.to_str().unwrap();
    assert_eq!(vfs.file_size(dest_path).unwrap(), file_data.len() as u64);
    assert_eq!(std::fs::read(&destfile).unwrap(), file_data);
}

#[test]
fn test_threaded_unacked_transfer() {
    threaded_transfer(TransmissionMode::Unacknowledged);
}

#[test]
fn test_threaded_acked_transfer() {
    threaded_transfer(TransmissionMode::Acknowledged);
}
