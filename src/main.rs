//! Vesta - 消防安全遥测平台核心
//!
//! 设备接入、流式规则评估、告警分发与历史归档

use actix_web::{web, App, HttpServer};
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vesta::{
    config::Settings,
    db::{PostgresPool, RedisPool},
    distribution::DistributionService,
    models::{AlarmEvent, SensorData, SensorType},
    queue::{
        PartitionedTopic, TopicProducer, GROUP_ALARM, GROUP_BACKPRESSURE, GROUP_EVALUATOR,
        TOPIC_ALARM_EVENTS, TOPIC_SENSOR_DATA,
    },
    repositories::DeviceRepository,
    services::{
        AlarmConsumerService, AlarmProducerService, CacheService, DedupService, DeviceService,
        EvaluatorService, HistoryService, RuleService, SuppressionService, SyncService,
        TokenService,
    },
    transport::{self, PreFilter, SessionContext, SessionRegistry},
    utils::IdAllocator,
    websocket::{self, WsHub},
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // 加载环境变量
    dotenvy::dotenv().ok();

    // 初始化日志
    init_tracing();

    info!("🔥 Vesta 服务启动中...");

    // 加载配置
    let settings = match Settings::load() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ 配置加载失败: {}", e);
            std::process::exit(1);
        }
    };
    info!("✅ 配置加载完成");

    // 连接设备注册库（建池时一并应用迁移）
    let pg_pool = match PostgresPool::connect(&settings.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("❌ 设备注册库连接失败: {}", e);
            std::process::exit(1);
        }
    };
    info!("✅ 设备注册库连接成功");

    // 连接 Redis
    let redis_pool = Arc::new(match RedisPool::new(&settings).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("❌ Redis 连接失败: {}", e);
            std::process::exit(1);
        }
    });
    info!("✅ Redis 连接成功");

    // ID 分配器
    let allocator = Arc::new(IdAllocator::new(settings.id.node_id));

    // 分区主题（消费组必须先于生产注册）
    let sensor_topic: Arc<PartitionedTopic<SensorData>> =
        PartitionedTopic::new(TOPIC_SENSOR_DATA, &settings.queue);
    let alarm_topic: Arc<PartitionedTopic<AlarmEvent>> =
        PartitionedTopic::new(TOPIC_ALARM_EVENTS, &settings.queue);

    let evaluator_consumers = sensor_topic.subscribe(GROUP_EVALUATOR);
    let backpressure_consumers = sensor_topic.subscribe(GROUP_BACKPRESSURE);
    let alarm_consumers = alarm_topic.subscribe(GROUP_ALARM);

    let sensor_producer = Arc::new(TopicProducer::new(sensor_topic.clone(), &settings.queue));
    let alarm_event_producer = Arc::new(TopicProducer::new(alarm_topic.clone(), &settings.queue));

    // 仓库与基础服务
    let device_repo = Arc::new(DeviceRepository::new(pg_pool.clone()));
    let cache_service = Arc::new(CacheService::new(redis_pool.clone()));
    let token_service = Arc::new(TokenService::new(
        redis_pool.clone(),
        device_repo.clone(),
        cache_service.clone(),
        settings.token.clone(),
    ));

    // 规则引擎
    let rule_service = Arc::new(RuleService::new(
        redis_pool.clone(),
        settings.rule.clone(),
    ));
    match rule_service.load_all().await {
        Ok(count) => info!("✅ 规则引擎已加载 {} 条规则", count),
        Err(e) => {
            eprintln!("❌ 规则加载失败: {}", e);
            std::process::exit(1);
        }
    }

    // 告警流水线
    let dedup_service = Arc::new(DedupService::new(
        redis_pool.clone(),
        settings.dedup.clone(),
    ));
    let alarm_producer_service = Arc::new(AlarmProducerService::new(
        allocator.clone(),
        alarm_event_producer,
    ));
    let evaluator = Arc::new(EvaluatorService::new(
        rule_service.subscribe(),
        dedup_service.clone(),
        alarm_producer_service,
        settings.queue.normal_concurrency,
    ));

    // 分发与历史
    let hub = Arc::new(WsHub::new());
    let history_service = Arc::new(HistoryService::new(
        redis_pool.clone(),
        settings.history.clone(),
    ));
    let sync_service = Arc::new(SyncService::new(
        history_service.clone(),
        redis_pool.clone(),
        hub.clone(),
        settings.sync.clone(),
    ));
    let distribution_service = Arc::new(DistributionService::new(
        &settings.distributor,
        history_service.clone(),
        hub.clone(),
        redis_pool.clone(),
        sync_service.clone(),
    ));

    // 消防抑制
    let suppression_service = Arc::new(SuppressionService::new(
        redis_pool.clone(),
        device_repo.clone(),
        cache_service.clone(),
        settings.suppression.clone(),
    ));
    let alarm_consumer_service = Arc::new(AlarmConsumerService::new(
        suppression_service,
        distribution_service,
    ));

    // 设备接入
    let registry = Arc::new(SessionRegistry::new());
    let prefilter = Arc::new(PreFilter::new(settings.prefilter.clone()));
    let device_service = Arc::new(DeviceService::new(
        device_repo.clone(),
        token_service.clone(),
        cache_service.clone(),
        registry.clone(),
    ));

    info!("✅ 服务初始化完成");

    // 后台任务
    let shutdown = CancellationToken::new();
    let mut background = Vec::new();

    // 评估器消费循环（每分区一个）
    for consumer in evaluator_consumers {
        background.push(tokio::spawn(
            evaluator.clone().run_partition(consumer, shutdown.clone()),
        ));
    }

    // 背压消费循环（批量写最新读数缓存，低并发）
    let batch_size = settings.queue.backpressure_batch_size;
    let linger = Duration::from_millis(settings.queue.backpressure_linger_ms);
    let backpressure_permits = Arc::new(tokio::sync::Semaphore::new(
        settings.queue.backpressure_concurrency.max(1),
    ));
    for consumer in backpressure_consumers {
        let cache = cache_service.clone();
        let shutdown = shutdown.clone();
        let permits = backpressure_permits.clone();
        background.push(tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    batch = consumer.poll_batch(batch_size, linger) => batch,
                };
                let Ok(_permit) = permits.acquire().await else {
                    break;
                };
                let Some(last) = batch.last() else { continue };
                let last_offset = last.offset;

                // 批内按 (设备, 传感器) 聚合，只写每组最后一条
                let mut latest: HashMap<(String, SensorType), SensorData> = HashMap::new();
                for delivered in &batch {
                    latest.insert(
                        (
                            delivered.value.device_id.clone(),
                            delivered.value.sensor_type,
                        ),
                        delivered.value.clone(),
                    );
                }

                let mut failed = false;
                for reading in latest.values() {
                    if let Err(e) = cache.set_latest_reading(reading).await {
                        tracing::warn!(error = %e, "最新读数缓存写入失败，等待重投");
                        failed = true;
                        break;
                    }
                }

                if failed {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                } else {
                    consumer.commit(last_offset);
                }
            }
        }));
    }

    // 告警消费循环（每分区一个）
    for consumer in alarm_consumers {
        background.push(tokio::spawn(
            alarm_consumer_service
                .clone()
                .run_partition(consumer, shutdown.clone()),
        ));
    }

    // 历史过期清理调度
    {
        let history = history_service.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(settings.history.sweep_interval_seconds);
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = history.sweep().await {
                            tracing::error!(error = %e, "历史过期清理失败");
                        }
                        if history.probe().await == vesta::services::StoreHealth::Down {
                            tracing::warn!("历史后端可用性探测: DOWN");
                        }
                    }
                }
            }
        }));
    }

    // 周期性快照广播调度
    {
        let sync = sync_service.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(settings.sync.broadcast_interval_seconds);
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = sync.broadcast_snapshot().await {
                            tracing::error!(error = %e, "快照广播失败");
                        }
                    }
                }
            }
        }));
    }

    // 设备 TCP 接入服务器
    let tcp_addr = settings.tcp_addr();
    let grace = Duration::from_secs(settings.shutdown.grace_seconds);
    let session_ctx = Arc::new(SessionContext {
        settings: settings.session.clone(),
        token_service: token_service.clone(),
        cache: cache_service.clone(),
        device_repo: device_repo.clone(),
        prefilter: prefilter.clone(),
        producer: sensor_producer,
        allocator,
        registry,
        protocol_errors: AtomicU64::new(0),
    });
    {
        let shutdown = shutdown.clone();
        background.push(tokio::spawn(async move {
            if let Err(e) = transport::run_device_server(&tcp_addr, session_ctx, shutdown, grace).await
            {
                tracing::error!(error = %e, "设备接入服务器异常退出");
            }
        }));
    }

    // HTTP / WebSocket 服务器
    let server_addr = settings.server_addr();
    let workers = if settings.server.workers == 0 {
        num_cpus::get()
    } else {
        settings.server.workers
    };

    info!("🚀 服务启动在 http://{}", server_addr);
    info!("📊 工作线程数: {}", workers);

    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(hub.clone()))
            .app_data(web::Data::new(sync_service.clone()))
            .app_data(web::Data::new(device_service.clone()))
            .app_data(web::Data::new(rule_service.clone()))
            .app_data(web::Data::new(alarm_consumer_service.clone()))
            .configure(websocket::configure_ws_routes)
    })
    .workers(workers)
    .bind(&server_addr)?
    .run();

    let server_handle = http_server.handle();
    let server_task = tokio::spawn(http_server);

    // 两阶段停机：收到信号后先停止接收新工作，再等待在途工作
    tokio::signal::ctrl_c().await?;
    info!("收到停机信号，开始优雅停机");

    shutdown.cancel();
    server_handle.stop(true).await;

    let drained = tokio::time::timeout(grace, futures::future::join_all(background)).await;
    if drained.is_err() {
        tracing::warn!("宽限期结束，强制终止剩余后台任务");
    }

    let _ = server_task.await;
    info!("👋 Vesta 已停止");
    Ok(())
}

/// 初始化日志系统
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,vesta=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
