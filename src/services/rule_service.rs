//! 告警规则服务
//!
//! 规则存储在 Redis（规则对象 + 反规范化的热路径阈值键），
//! 进程内维护一份不可变快照。任何变更先写热路径阈值、再发布
//! 变更通知（watch 快照交换），评估器在一个评估周期内感知。

use crate::config::RuleSettings;
use crate::db::RedisPool;
use crate::errors::AppError;
use crate::models::{AlarmRule, CreateRuleRequest, SensorType, UpdateRuleRequest};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use uuid::Uuid;
use validator::Validate;

/// 规则缓存键前缀
mod rule_keys {
    pub const RULE: &str = "vesta:alarm:rule";
    pub const THRESHOLD: &str = "vesta:alarm:threshold";
    pub const REGISTRY: &str = "vesta:alarm:rule:ids";
}

/// 编译后的规则（评估器使用的形态）
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: AlarmRule,
    /// `==` / `!=` 的容差，取自规则 metadata 的 `epsilon` 字段
    pub epsilon: Option<f64>,
}

/// 不可变规则快照
///
/// 写者构造新快照后整体交换，读者永不阻塞写者。
#[derive(Default)]
pub struct RuleSnapshot {
    by_key: HashMap<(String, SensorType), Vec<Arc<CompiledRule>>>,
    version: u64,
    rule_count: usize,
}

impl RuleSnapshot {
    /// 从规则集合编译快照
    ///
    /// 未启用的规则被跳过；编译失败的规则被隔离，
    /// 其 (规则 ID, 原因) 随快照一并返回，其余规则不受影响。
    pub fn compile<'a, I>(rules: I, version: u64) -> (Self, HashMap<String, String>)
    where
        I: IntoIterator<Item = &'a AlarmRule>,
    {
        let mut by_key: HashMap<(String, SensorType), Vec<Arc<CompiledRule>>> = HashMap::new();
        let mut failures = HashMap::new();
        let mut rule_count = 0;

        for rule in rules {
            if !rule.enabled {
                continue;
            }

            match compile_rule(rule) {
                Ok(compiled) => {
                    rule_count += 1;
                    by_key
                        .entry((rule.device_id.clone(), rule.sensor_type))
                        .or_default()
                        .push(Arc::new(compiled));
                }
                Err(AppError::RuleCompileError { rule_id, cause }) => {
                    failures.insert(rule_id, cause);
                }
                Err(e) => {
                    failures.insert(rule.id.clone(), e.to_string());
                }
            }
        }

        (
            Self {
                by_key,
                version,
                rule_count,
            },
            failures,
        )
    }

    /// 查找匹配 (设备, 传感器) 的全部已启用规则
    pub fn matching(&self, device_id: &str, sensor_type: SensorType) -> &[Arc<CompiledRule>] {
        self.by_key
            .get(&(device_id.to_string(), sensor_type))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn rule_count(&self) -> usize {
        self.rule_count
    }
}

/// 告警规则服务
pub struct RuleService {
    redis_pool: Arc<RedisPool>,
    settings: RuleSettings,
    /// 本地规则缓存（规则全集，含未启用规则）
    rules: RwLock<HashMap<String, AlarmRule>>,
    /// 编译失败而被隔离的规则及原因
    unhealthy: Mutex<HashMap<String, String>>,
    snapshot_tx: watch::Sender<Arc<RuleSnapshot>>,
}

impl RuleService {
    pub fn new(redis_pool: Arc<RedisPool>, settings: RuleSettings) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(RuleSnapshot::default()));
        Self {
            redis_pool,
            settings,
            rules: RwLock::new(HashMap::new()),
            unhealthy: Mutex::new(HashMap::new()),
            snapshot_tx,
        }
    }

    /// 订阅规则快照（评估器调用）
    pub fn subscribe(&self) -> watch::Receiver<Arc<RuleSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// 启动时从 Redis 加载全部规则
    pub async fn load_all(&self) -> Result<usize, AppError> {
        let ids = self.redis_pool.smembers(rule_keys::REGISTRY).await?;
        let mut loaded = HashMap::new();

        for id in ids {
            let key = format!("{}:{}", rule_keys::RULE, id);
            match self.redis_pool.get::<AlarmRule>(&key).await {
                Ok(Some(rule)) => {
                    loaded.insert(id, rule);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(rule_id = %id, error = %e, "规则加载失败");
                }
            }
        }

        let count = loaded.len();
        *self.rules.write().expect("规则缓存锁中毒") = loaded;
        self.publish_snapshot();

        tracing::info!(count, "规则引擎已加载规则");
        Ok(count)
    }

    /// 创建规则
    pub async fn create(&self, request: CreateRuleRequest) -> Result<AlarmRule, AppError> {
        request
            .validate()
            .map_err(|e| AppError::ValidationError(e.to_string()))?;

        let rule = AlarmRule {
            id: Uuid::new_v4().to_string(),
            name: request.name,
            device_id: request.device_id,
            sensor_type: request.sensor_type,
            operator: request.operator,
            threshold: request.threshold,
            window_seconds: request.window_seconds,
            severity: request.severity,
            alarm_type: request.alarm_type,
            building_id: request.building_id,
            floor_id: request.floor_id,
            room_id: request.room_id,
            zone_id: request.zone_id,
            enabled: request.enabled,
            metadata: request.metadata,
        };

        self.save(rule.clone()).await?;
        tracing::info!(rule_id = %rule.id, name = %rule.name, "规则已创建");
        Ok(rule)
    }

    /// 更新规则
    pub async fn update(
        &self,
        rule_id: &str,
        request: UpdateRuleRequest,
    ) -> Result<AlarmRule, AppError> {
        request
            .validate()
            .map_err(|e| AppError::ValidationError(e.to_string()))?;

        let mut rule = self
            .get(rule_id)
            .ok_or_else(|| AppError::NotFound(format!("规则不存在: {}", rule_id)))?;

        if let Some(name) = request.name {
            rule.name = name;
        }
        if let Some(operator) = request.operator {
            rule.operator = operator;
        }
        if let Some(threshold) = request.threshold {
            rule.threshold = threshold;
        }
        if let Some(window_seconds) = request.window_seconds {
            rule.window_seconds = window_seconds;
        }
        if let Some(severity) = request.severity {
            rule.severity = severity;
        }
        if let Some(alarm_type) = request.alarm_type {
            rule.alarm_type = alarm_type;
        }
        if let Some(enabled) = request.enabled {
            rule.enabled = enabled;
        }
        if let Some(metadata) = request.metadata {
            rule.metadata = Some(metadata);
        }

        self.save(rule.clone()).await?;
        tracing::info!(rule_id, "规则已更新");
        Ok(rule)
    }

    /// 删除规则
    pub async fn delete(&self, rule_id: &str) -> Result<(), AppError> {
        let removed = self
            .rules
            .write()
            .expect("规则缓存锁中毒")
            .remove(rule_id);

        if removed.is_none() {
            return Err(AppError::NotFound(format!("规则不存在: {}", rule_id)));
        }

        let key = format!("{}:{}", rule_keys::RULE, rule_id);
        self.redis_pool.del(&key).await?;
        self.unhealthy
            .lock()
            .expect("规则健康表锁中毒")
            .remove(rule_id);

        self.publish_snapshot();
        tracing::info!(rule_id, "规则已删除");
        Ok(())
    }

    /// 获取规则
    pub fn get(&self, rule_id: &str) -> Option<AlarmRule> {
        self.rules
            .read()
            .expect("规则缓存锁中毒")
            .get(rule_id)
            .cloned()
    }

    /// 列出全部规则
    pub fn list(&self) -> Vec<AlarmRule> {
        self.rules
            .read()
            .expect("规则缓存锁中毒")
            .values()
            .cloned()
            .collect()
    }

    /// 快速阈值更新：同 (设备, 传感器) 的全部规则阈值一并更新
    ///
    /// 端到端目标 200ms（95 分位）。热路径阈值先落盘，变更通知随后发布。
    pub async fn update_threshold(
        &self,
        device_id: &str,
        sensor_type: SensorType,
        threshold: f64,
    ) -> Result<(), AppError> {
        let started = std::time::Instant::now();

        // 热路径阈值必须先于变更通知写入
        let hot_key = format!("{}:{}:{}", rule_keys::THRESHOLD, device_id, sensor_type);
        self.redis_pool.set(&hot_key, &threshold).await?;

        let affected: Vec<AlarmRule> = {
            let mut rules = self.rules.write().expect("规则缓存锁中毒");
            rules
                .values_mut()
                .filter(|rule| rule.device_id == device_id && rule.sensor_type == sensor_type)
                .map(|rule| {
                    rule.threshold = threshold;
                    rule.clone()
                })
                .collect()
        };

        for rule in &affected {
            let key = format!("{}:{}", rule_keys::RULE, rule.id);
            self.redis_pool.set(&key, rule).await?;
        }

        self.publish_snapshot();

        let elapsed = started.elapsed().as_millis() as u64;
        if elapsed > self.settings.update_p95_ms {
            tracing::warn!(
                device_id,
                sensor_type = %sensor_type,
                elapsed_ms = elapsed,
                target_ms = self.settings.update_p95_ms,
                "阈值更新超出时延目标"
            );
        }

        tracing::info!(
            device_id,
            sensor_type = %sensor_type,
            threshold,
            affected = affected.len(),
            elapsed_ms = elapsed,
            "阈值已更新"
        );
        Ok(())
    }

    /// 读取热路径阈值
    pub async fn get_threshold(
        &self,
        device_id: &str,
        sensor_type: SensorType,
    ) -> Result<Option<f64>, AppError> {
        let hot_key = format!("{}:{}:{}", rule_keys::THRESHOLD, device_id, sensor_type);
        self.redis_pool.get(&hot_key).await
    }

    /// 编译失败而被隔离的规则
    pub fn unhealthy_rules(&self) -> HashMap<String, String> {
        self.unhealthy.lock().expect("规则健康表锁中毒").clone()
    }

    async fn save(&self, rule: AlarmRule) -> Result<(), AppError> {
        // 热路径阈值先写
        let hot_key = format!(
            "{}:{}:{}",
            rule_keys::THRESHOLD,
            rule.device_id,
            rule.sensor_type
        );
        self.redis_pool.set(&hot_key, &rule.threshold).await?;

        let key = format!("{}:{}", rule_keys::RULE, rule.id);
        self.redis_pool.set(&key, &rule).await?;
        self.redis_pool.sadd(rule_keys::REGISTRY, &rule.id).await?;

        self.rules
            .write()
            .expect("规则缓存锁中毒")
            .insert(rule.id.clone(), rule);

        self.publish_snapshot();
        Ok(())
    }

    /// 从本地缓存重建快照并交换。编译失败的规则被隔离，其余不受影响
    fn publish_snapshot(&self) {
        let version = self.snapshot_tx.borrow().version() + 1;

        let (snapshot, failures) = {
            let rules = self.rules.read().expect("规则缓存锁中毒");
            RuleSnapshot::compile(rules.values(), version)
        };

        for (rule_id, cause) in &failures {
            tracing::error!(rule_id = %rule_id, cause = %cause, "规则编译失败，已隔离");
        }
        *self.unhealthy.lock().expect("规则健康表锁中毒") = failures;

        // 没有订阅者也要交换快照（send 返回的错误仅表示无人订阅）
        let _ = self.snapshot_tx.send(Arc::new(snapshot));
    }
}

/// 编译单条规则：校验阈值并解析 epsilon 元数据
fn compile_rule(rule: &AlarmRule) -> Result<CompiledRule, AppError> {
    if !rule.threshold.is_finite() {
        return Err(AppError::RuleCompileError {
            rule_id: rule.id.clone(),
            cause: "阈值不是有限数".to_string(),
        });
    }

    let epsilon = match &rule.metadata {
        Some(metadata) => match serde_json::from_str::<serde_json::Value>(metadata) {
            Ok(value) => match value.get("epsilon") {
                None => None,
                Some(eps) => {
                    let eps = eps.as_f64().ok_or_else(|| AppError::RuleCompileError {
                        rule_id: rule.id.clone(),
                        cause: "epsilon 不是数值".to_string(),
                    })?;
                    if !eps.is_finite() || eps < 0.0 {
                        return Err(AppError::RuleCompileError {
                            rule_id: rule.id.clone(),
                            cause: "epsilon 必须是非负有限数".to_string(),
                        });
                    }
                    Some(eps)
                }
            },
            // metadata 不是 JSON 时忽略（元数据本身是自由文本）
            Err(_) => None,
        },
        None => None,
    };

    Ok(CompiledRule {
        rule: rule.clone(),
        epsilon,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlarmSeverity, RuleOperator};

    fn rule(id: &str, metadata: Option<&str>) -> AlarmRule {
        AlarmRule {
            id: id.to_string(),
            name: "测试规则".to_string(),
            device_id: "d1".to_string(),
            sensor_type: SensorType::Smoke,
            operator: RuleOperator::Gt,
            threshold: 50.0,
            window_seconds: 0,
            severity: AlarmSeverity::High,
            alarm_type: "SMOKE".to_string(),
            building_id: None,
            floor_id: None,
            room_id: None,
            zone_id: None,
            enabled: true,
            metadata: metadata.map(str::to_string),
        }
    }

    #[test]
    fn test_compile_plain_rule() {
        let compiled = compile_rule(&rule("r1", None)).unwrap();
        assert!(compiled.epsilon.is_none());
    }

    #[test]
    fn test_compile_epsilon_from_metadata() {
        let compiled = compile_rule(&rule("r1", Some(r#"{"epsilon":0.001}"#))).unwrap();
        assert_eq!(compiled.epsilon, Some(0.001));
    }

    #[test]
    fn test_compile_rejects_bad_epsilon() {
        let result = compile_rule(&rule("r1", Some(r#"{"epsilon":"many"}"#)));
        assert!(matches!(
            result,
            Err(AppError::RuleCompileError { .. })
        ));
    }

    #[test]
    fn test_compile_rejects_nonfinite_threshold() {
        let mut bad = rule("r1", None);
        bad.threshold = f64::NAN;
        assert!(matches!(
            compile_rule(&bad),
            Err(AppError::RuleCompileError { .. })
        ));
    }

    #[test]
    fn test_compile_ignores_free_text_metadata() {
        let compiled = compile_rule(&rule("r1", Some("机房东侧"))).unwrap();
        assert!(compiled.epsilon.is_none());
    }
}
