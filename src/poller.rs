//! CDC 폴링 루프
//!
//! 세션당 하나의 루프가 다음을 반복한다:
//! 1. `get` (블로킹, 서버 대기 시간 제한)
//! 2. 엔트리 디코딩 (실패는 엔트리 단위로 격리)
//! 3. 컨슈머 콜백 호출
//! 4. `ack`
//! 5. 대기 (빈 배치가 연속되면 지수적으로 증가)
//!
//! 전송 장애 시 세션을 재연결하고 마지막 ack 위치부터 다시 받는다.
//! 중지 요청은 루프 경계에서만 반영된다 (진행 중인 get/ack는 끝까지 수행).

use crate::consumer::BatchHandler;
use crate::decoder::EntryDecoder;
use crate::entry::BatchId;
use crate::error::Result;
use crate::filter::SubscriptionFilter;
use crate::session::{Session, SessionState};
use crate::transport::Transport;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// 폴링 루프 설정
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// 한 번에 요청할 최대 엔트리 수
    pub batch_size: usize,
    /// 배치 처리 후 대기 시간
    pub poll_interval: Duration,
    /// 빈 배치가 연속될 때 대기 시간 상한
    pub idle_backoff_max: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_multiplier: f64,
    /// 연속 재연결 실패 허용 횟수 (None = 무제한)
    pub max_reconnect_attempts: Option<u32>,
    /// 시작 시 마지막 ack 위치로 rollback
    pub rollback_on_start: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            batch_size: 1024,
            poll_interval: Duration::from_millis(300),
            idle_backoff_max: Duration::from_secs(5),
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_multiplier: 2.0,
            max_reconnect_attempts: None,
            rollback_on_start: true,
        }
    }
}

/// 폴링 통계
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollStats {
    pub batches: u64,
    pub entries: u64,
    pub row_changes: u64,
    pub decode_failures: u64,
    pub empty_polls: u64,
    pub reconnects: u64,
    pub handler_failures: u64,
}

/// `poll_once` 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// 새 데이터 없음 (ack하지 않음)
    Empty,
    /// 처리 및 ack 완료
    Processed {
        batch_id: BatchId,
        entries: usize,
        decode_failures: usize,
    },
    /// 핸들러 실패로 rollback됨
    RolledBack { batch_id: BatchId },
}

/// 폴링 루프 중지 요청 핸들
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// 다음 루프 경계에서 중지
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// CDC 폴링 루프
pub struct CdcPoller<T: Transport, H: BatchHandler> {
    session: Session<T>,
    handler: H,
    filter: SubscriptionFilter,
    config: PollerConfig,
    stats: PollStats,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl<T: Transport, H: BatchHandler> CdcPoller<T, H> {
    pub fn new(session: Session<T>, handler: H, filter: SubscriptionFilter, config: PollerConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        CdcPoller {
            session,
            handler,
            filter,
            config,
            stats: PollStats::default(),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    pub fn stats(&self) -> &PollStats {
        &self.stats
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_parts(self) -> (Session<T>, H) {
        (self.session, self.handler)
    }

    fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// 연결, 구독, (설정 시) 마지막 ack 위치로 rollback
    pub async fn start(&mut self) -> Result<()> {
        self.establish(self.config.rollback_on_start).await
    }

    async fn establish(&mut self, rollback: bool) -> Result<()> {
        self.session.connect().await?;
        if self.session.state() == SessionState::Connected {
            self.session.subscribe(self.filter.clone()).await?;
        }
        if rollback {
            self.session.rollback(BatchId::NONE).await?;
        }
        Ok(())
    }

    /// 배치 하나를 가져와 처리
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        let batch = self.session.get(self.config.batch_size).await?;
        if batch.is_empty() {
            self.stats.empty_polls += 1;
            return Ok(PollOutcome::Empty);
        }

        let decoded = EntryDecoder::decode_batch(&batch);
        let decode_failures = decoded.failure_count();
        let row_changes = decoded.row_changes().count();

        if let Err(e) = self.handler.on_batch(&decoded).await {
            // 다음 get에서 같은 배치를 다시 받는다
            warn!("Handler failed on batch {}: {}", batch.id, e);
            self.stats.handler_failures += 1;
            self.session.rollback(batch.id).await?;
            return Ok(PollOutcome::RolledBack { batch_id: batch.id });
        }

        // 디코딩 실패가 있어도 모든 엔트리를 시도했으므로 ack한다
        self.session.ack(batch.id).await?;

        self.stats.batches += 1;
        self.stats.entries += batch.len() as u64;
        self.stats.row_changes += row_changes as u64;
        self.stats.decode_failures += decode_failures as u64;

        if decode_failures > 0 {
            warn!(
                "Acked batch {} with {} undecodable entries",
                batch.id, decode_failures
            );
        } else {
            debug!("Acked batch {} ({} entries)", batch.id, batch.len());
        }

        Ok(PollOutcome::Processed {
            batch_id: batch.id,
            entries: batch.len(),
            decode_failures,
        })
    }

    /// 중지 요청 또는 복구 불가능한 에러까지 폴링
    pub async fn run(&mut self) -> Result<PollStats> {
        info!("Starting CDC poller for {}", self.session.endpoint());

        if let Err(e) = self.start().await {
            if !e.is_recoverable() {
                error!("Poller failed to start: {}", e);
                self.close().await;
                return Err(e);
            }
            warn!("Initial connect failed: {}", e);
            if let Err(e) = self.reconnect().await {
                self.close().await;
                return Err(e);
            }
        }

        let mut idle_delay = self.config.poll_interval;

        while !self.is_stopped() {
            match self.poll_once().await {
                Ok(PollOutcome::Empty) => {
                    self.pause(idle_delay).await;
                    idle_delay = idle_delay.mul_f64(2.0).min(self.config.idle_backoff_max);
                }
                Ok(PollOutcome::Processed { .. }) | Ok(PollOutcome::RolledBack { .. }) => {
                    idle_delay = self.config.poll_interval;
                    self.pause(self.config.poll_interval).await;
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Transport failure: {}", e);
                    if let Err(e) = self.reconnect().await {
                        self.close().await;
                        return Err(e);
                    }
                }
                Err(e) => {
                    error!("Poller aborted: {}", e);
                    self.close().await;
                    return Err(e);
                }
            }
        }

        info!("Stopping CDC poller");
        self.session.disconnect().await?;
        info!("CDC poller stopped: {:?}", self.stats);
        Ok(self.stats.clone())
    }

    /// 에러 경로에서 세션 종료. 종료 실패는 기록만 한다.
    async fn close(&mut self) {
        if let Err(e) = self.session.disconnect().await {
            warn!("Error while closing session: {}", e);
        }
    }

    /// 지수 백오프로 재연결. 중지 요청 시 즉시 반환한다.
    async fn reconnect(&mut self) -> Result<()> {
        let mut delay = self.config.reconnect_initial_delay;
        let mut attempts = 0u32;

        loop {
            if self.is_stopped() {
                return Ok(());
            }

            self.pause(delay).await;
            if self.is_stopped() {
                return Ok(());
            }

            attempts += 1;
            self.session.reset().await?;

            // ack되지 않은 배치는 마지막 ack 위치부터 다시 받는다
            match self.establish(true).await {
                Ok(()) => {
                    self.stats.reconnects += 1;
                    info!("Reconnected after {} attempt(s)", attempts);
                    return Ok(());
                }
                Err(e) if e.is_recoverable() => {
                    if let Some(max) = self.config.max_reconnect_attempts {
                        if attempts >= max {
                            error!("Giving up after {} reconnect attempts: {}", attempts, e);
                            return Err(e);
                        }
                    }
                    warn!("Reconnect attempt {} failed: {}", attempts, e);
                    delay = delay
                        .mul_f64(self.config.reconnect_multiplier)
                        .min(self.config.reconnect_max_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 중지 요청이 오면 즉시 깨어나는 대기
    async fn pause(&self, delay: Duration) {
        let mut stop = self.stop_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_stopped(&mut stop) => {}
        }
    }
}

async fn wait_stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::FnHandler;
    use crate::decoder::DecodedBatch;
    use crate::entry::{Column, Entry, EntryHeader, EventType, RowChange};
    use crate::error::CdcError;
    use crate::memory::{MemoryServer, MemoryTransport, ServerEvent};
    use crate::transport::{Credentials, Endpoint};

    fn fast_config() -> PollerConfig {
        PollerConfig {
            batch_size: 16,
            poll_interval: Duration::from_millis(1),
            idle_backoff_max: Duration::from_millis(4),
            reconnect_initial_delay: Duration::from_millis(1),
            reconnect_max_delay: Duration::from_millis(4),
            ..Default::default()
        }
    }

    fn header(offset: u64) -> EntryHeader {
        EntryHeader::new("mysql-bin.000001", offset).with_table("shop", "users")
    }

    fn update(offset: u64) -> Entry {
        let change = RowChange::new(EventType::Update).with_row(
            vec![Column::new("id", "1"), Column::new("name", "a")],
            vec![Column::new("id", "1"), Column::new("name", "b")],
        );
        Entry::row_mutation(header(offset), EntryDecoder::encode_row_change(&change).unwrap())
    }

    fn session(server: &MemoryServer) -> Session<MemoryTransport> {
        Session::new(server.transport(), Endpoint::default(), Credentials::default())
    }

    type Recorder = FnHandler<Box<dyn FnMut(&DecodedBatch) -> Result<()> + Send>>;

    fn recorder(sink: Arc<parking_lot::Mutex<Vec<DecodedBatch>>>) -> Recorder {
        FnHandler(Box::new(move |batch: &DecodedBatch| -> Result<()> {
            sink.lock().push(batch.clone());
            Ok(())
        }))
    }

    #[tokio::test]
    async fn test_transaction_batch_is_processed_and_acked() {
        let server = MemoryServer::new();
        server.append_all(vec![
            Entry::transaction_begin(EntryHeader::new("mysql-bin.000001", 4)),
            update(120),
            Entry::transaction_end(EntryHeader::new("mysql-bin.000001", 300)),
        ]);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut poller = CdcPoller::new(
            session(&server),
            recorder(seen.clone()),
            SubscriptionFilter::all(),
            fast_config(),
        );
        poller.start().await.unwrap();

        let outcome = poller.poll_once().await.unwrap();
        assert!(matches!(outcome, PollOutcome::Processed { entries: 3, decode_failures: 0, .. }));
        assert_eq!(server.acked_position(), 3);

        let batches = seen.lock();
        let changes: Vec<_> = batches[0].row_changes().collect();
        assert_eq!(changes.len(), 1);
        let after = &changes[0].1.rows[0].after_columns;
        assert!(!after[0].changed);
        assert!(after[1].changed);
    }

    #[tokio::test]
    async fn test_corrupt_entry_still_acked() {
        let server = MemoryServer::new();
        let mut corrupt = update(50).payload.to_vec();
        corrupt.truncate(corrupt.len() / 2);
        server.append_all(vec![
            Entry::row_mutation(header(50), corrupt),
            update(120),
            Entry::transaction_end(EntryHeader::new("mysql-bin.000001", 300)),
        ]);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut poller = CdcPoller::new(
            session(&server),
            recorder(seen.clone()),
            SubscriptionFilter::all(),
            fast_config(),
        );
        poller.start().await.unwrap();

        let outcome = poller.poll_once().await.unwrap();
        match outcome {
            PollOutcome::Processed { batch_id, entries, decode_failures } => {
                assert_eq!(entries, 3);
                assert_eq!(decode_failures, 1);
                assert_eq!(server.acks(), vec![batch_id]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let batches = seen.lock();
        assert_eq!(batches[0].failure_count(), 1);
        assert_eq!(batches[0].row_changes().count(), 1);
        assert_eq!(poller.stats().decode_failures, 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_acked() {
        let server = MemoryServer::new();
        let mut poller = CdcPoller::new(
            session(&server),
            FnHandler(|_: &DecodedBatch| -> Result<()> { Ok(()) }),
            SubscriptionFilter::all(),
            fast_config(),
        );
        poller.start().await.unwrap();

        assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::Empty);
        assert!(server.acks().is_empty());
        assert_eq!(poller.stats().empty_polls, 1);
    }

    #[tokio::test]
    async fn test_handler_failure_rolls_back() {
        let server = MemoryServer::new();
        server.append(update(120));

        let mut calls = 0;
        let mut poller = CdcPoller::new(
            session(&server),
            FnHandler(move |_: &DecodedBatch| -> Result<()> {
                calls += 1;
                if calls == 1 {
                    Err(CdcError::HandlerError("sink unavailable".to_string()))
                } else {
                    Ok(())
                }
            }),
            SubscriptionFilter::all(),
            fast_config(),
        );
        poller.start().await.unwrap();

        let first = poller.poll_once().await.unwrap();
        assert!(matches!(first, PollOutcome::RolledBack { .. }));
        assert!(server.acks().is_empty());

        // 같은 엔트리가 재전송된다
        let second = poller.poll_once().await.unwrap();
        assert!(matches!(second, PollOutcome::Processed { entries: 1, .. }));
        assert_eq!(server.acked_position(), 1);
        assert_eq!(poller.stats().handler_failures, 1);
    }

    #[tokio::test]
    async fn test_start_rolls_back_to_last_ack() {
        let server = MemoryServer::new();
        let mut poller = CdcPoller::new(
            session(&server),
            FnHandler(|_: &DecodedBatch| -> Result<()> { Ok(()) }),
            SubscriptionFilter::all(),
            fast_config(),
        );
        poller.start().await.unwrap();

        assert_eq!(
            server.history(),
            vec![
                ServerEvent::Connected,
                ServerEvent::Subscribed(String::new()),
                ServerEvent::Rollback(BatchId::NONE),
            ]
        );
    }

    #[tokio::test]
    async fn test_run_stops_after_draining() {
        let server = MemoryServer::new();
        server.append_all((1..=5).map(|i| update(i * 100)));

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut config = fast_config();
        config.batch_size = 2;

        let mut poller = CdcPoller::new(
            session(&server),
            recorder(seen.clone()),
            SubscriptionFilter::all(),
            config,
        );
        let stop = poller.stop_handle();

        let watcher = {
            let server = server.clone();
            tokio::spawn(async move {
                while server.acked_position() < 5 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                stop.stop();
            })
        };

        let stats = tokio::time::timeout(Duration::from_secs(5), poller.run())
            .await
            .expect("poller did not stop")
            .unwrap();
        watcher.await.unwrap();

        assert_eq!(stats.batches, 3);
        assert_eq!(stats.entries, 5);
        assert_eq!(stats.row_changes, 5);
        assert!(!server.is_connected());

        // 배치는 로그 순서대로 전달된다
        let offsets: Vec<u64> = seen
            .lock()
            .iter()
            .flat_map(|b| b.row_changes().map(|(h, _)| h.log_offset).collect::<Vec<_>>())
            .collect();
        assert_eq!(offsets, vec![100, 200, 300, 400, 500]);
    }

    #[tokio::test]
    async fn test_run_reconnects_after_get_failure() {
        let server = MemoryServer::new();
        server.append_all(vec![update(100), update(200)]);
        server.fail_next_gets(2);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut poller = CdcPoller::new(
            session(&server),
            recorder(seen.clone()),
            SubscriptionFilter::all(),
            fast_config(),
        );
        let stop = poller.stop_handle();

        let watcher = {
            let server = server.clone();
            tokio::spawn(async move {
                while server.acked_position() < 2 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                stop.stop();
            })
        };

        let stats = tokio::time::timeout(Duration::from_secs(5), poller.run())
            .await
            .expect("poller did not stop")
            .unwrap();
        watcher.await.unwrap();

        assert_eq!(stats.reconnects, 2);
        assert_eq!(stats.entries, 2);
    }

    #[tokio::test]
    async fn test_redelivery_after_lost_ack() {
        let server = MemoryServer::new();
        server.append(update(100));
        server.fail_next_acks(1);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut poller = CdcPoller::new(
            session(&server),
            recorder(seen.clone()),
            SubscriptionFilter::all(),
            fast_config(),
        );
        let stop = poller.stop_handle();

        let watcher = {
            let server = server.clone();
            tokio::spawn(async move {
                while server.acked_position() < 1 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                stop.stop();
            })
        };

        tokio::time::timeout(Duration::from_secs(5), poller.run())
            .await
            .expect("poller did not stop")
            .unwrap();
        watcher.await.unwrap();

        // at-least-once: 같은 배치가 두 번 전달된다
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].entries, seen[1].entries);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up() {
        let server = MemoryServer::new();
        server.fail_next_connects(10);

        let mut config = fast_config();
        config.max_reconnect_attempts = Some(3);

        let mut poller = CdcPoller::new(
            session(&server),
            FnHandler(|_: &DecodedBatch| -> Result<()> { Ok(()) }),
            SubscriptionFilter::all(),
            config,
        );

        let err = poller.run().await.unwrap_err();
        assert!(matches!(err, CdcError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn test_fatal_start_error_closes_session() {
        let server = MemoryServer::new();
        server.fail_next_subscribes(1);

        let mut poller = CdcPoller::new(
            session(&server),
            FnHandler(|_: &DecodedBatch| -> Result<()> { Ok(()) }),
            SubscriptionFilter::all(),
            fast_config(),
        );

        let err = poller.run().await.unwrap_err();
        assert!(matches!(err, CdcError::ProtocolError(_)));
        assert_eq!(poller.session().state(), SessionState::Closed);
        assert!(!server.is_connected());
        assert_eq!(server.history().last(), Some(&ServerEvent::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_backoff_doubles_and_resets() {
        let server = MemoryServer::new();
        let config = PollerConfig {
            batch_size: 16,
            poll_interval: Duration::from_millis(100),
            idle_backoff_max: Duration::from_millis(400),
            ..Default::default()
        };
        let mut poller = CdcPoller::new(
            session(&server),
            FnHandler(|_: &DecodedBatch| -> Result<()> { Ok(()) }),
            SubscriptionFilter::all(),
            config,
        );
        let stop = poller.stop_handle();

        let feeder = {
            let server = server.clone();
            tokio::spawn(async move {
                while server.get_times().len() < 5 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                server.append(update(100));
                while server.get_times().len() < 8 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                stop.stop();
            })
        };

        let stats = tokio::time::timeout(Duration::from_secs(60), poller.run())
            .await
            .expect("poller did not stop")
            .unwrap();
        feeder.await.unwrap();
        assert_eq!(stats.batches, 1);

        let times = server.get_times();
        let gaps: Vec<u128> = times
            .windows(2)
            .take(7)
            .map(|w| (w[1] - w[0]).as_millis())
            .collect();
        // 빈 배치가 이어지면 두 배씩 늘어 상한에서 멈추고,
        // 여섯 번째 get이 배치를 처리한 뒤에는 poll_interval로 돌아간다
        assert_eq!(gaps, vec![100, 200, 400, 400, 400, 100, 100]);
    }

    #[tokio::test]
    async fn test_stop_before_run() {
        let server = MemoryServer::new();
        server.append(update(100));

        let mut poller = CdcPoller::new(
            session(&server),
            FnHandler(|_: &DecodedBatch| -> Result<()> { Ok(()) }),
            SubscriptionFilter::all(),
            fast_config(),
        );
        let stop = poller.stop_handle();
        stop.stop();
        assert!(stop.is_stopped());

        let stats = poller.run().await.unwrap();
        assert_eq!(stats, PollStats::default());
        assert!(server.acks().is_empty());
    }
}
