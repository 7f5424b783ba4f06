/// Canal CDC 클라이언트
///
/// Canal 서버의 변경 데이터를 가져와 로그로 출력합니다.
/// `CANAL_CONFIG`가 지정되면 JSON 설정 파일을, 아니면 `CANAL_*` 환경 변수를 사용합니다.
use rust_canal::{CdcPoller, ClientConfig, LoggingHandler, Session, TcpConnector};
use std::env;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match env::var("CANAL_CONFIG") {
        Ok(path) => ClientConfig::from_json_file(path)?,
        Err(_) => ClientConfig::from_env()?,
    };

    let endpoint = config.endpoint();
    let filter = config.subscription_filter()?;

    info!("Starting Canal CDC client");
    info!("Connecting to {} (filter: {})", endpoint, filter);

    let connector = TcpConnector::new(config.connector_config());
    let session = Session::new(connector, endpoint, config.credentials())
        .with_fetch_timeout(config.fetch_timeout());
    let handler = LoggingHandler::new(config.output_format());

    let mut poller = CdcPoller::new(session, handler, filter, config.poller_config());

    // Ctrl-C 시 현재 배치를 마치고 종료
    let stop = poller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            stop.stop();
        }
    });

    match poller.run().await {
        Ok(stats) => {
            info!(
                "Stopped: {} batches, {} entries, {} row changes, {} decode failures, {} reconnects",
                stats.batches, stats.entries, stats.row_changes, stats.decode_failures, stats.reconnects
            );
            Ok(())
        }
        Err(e) => {
            error!("CDC client failed: {}", e);
            Err(e.into())
        }
    }
}
