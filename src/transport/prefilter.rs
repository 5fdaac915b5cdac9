//! 数据预过滤
//!
//! 在读数进入流水线之前丢弃无效或平凡变化的数据，减少下游压力。
//! 每 (设备, 传感器) 的上次读数缓存按设备分片加锁。

use crate::config::PrefilterSettings;
use crate::models::SensorType;
use crate::transport::messages::DataMessage;
use crate::utils;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// 上次读数缓存的分片数
const STRIPE_COUNT: usize = 16;

/// 过滤结论
#[derive(Debug, Clone)]
pub enum FilterDecision {
    /// 通过，携带富化后的消息（打上预处理时间戳）
    Forward(DataMessage),
    /// 所有读数均为平凡变化
    DropTrivial,
    /// 消息无效（读数越界 / 时间戳回退 / 空读数）
    DropInvalid,
}

/// 过滤统计
#[derive(Debug, Clone, serde::Serialize)]
pub struct PreFilterStats {
    pub total: u64,
    pub forwarded: u64,
    pub dropped_invalid: u64,
    pub dropped_trivial: u64,
    /// 丢弃占比（0-100）
    pub drop_rate: f64,
}

struct LastSample {
    value: f64,
    timestamp_ms: i64,
}

/// 数据预过滤器
pub struct PreFilter {
    settings: PrefilterSettings,
    stripes: Vec<Mutex<HashMap<(String, SensorType), LastSample>>>,
    total: AtomicU64,
    dropped_invalid: AtomicU64,
    dropped_trivial: AtomicU64,
}

impl PreFilter {
    pub fn new(settings: PrefilterSettings) -> Self {
        Self {
            settings,
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            total: AtomicU64::new(0),
            dropped_invalid: AtomicU64::new(0),
            dropped_trivial: AtomicU64::new(0),
        }
    }

    /// 处理一条数据消息
    ///
    /// 全部读数无效或平凡时整条丢弃；只要有一条读数有意义，
    /// 整条消息富化后放行。只有放行消息中的有效读数才更新缓存，
    /// 保证相邻两条放行读数的差值不小于声明阈值。
    pub fn process(&self, device_id: &str, message: &DataMessage) -> FilterDecision {
        self.total.fetch_add(1, Ordering::Relaxed);

        if message.readings.is_empty() {
            self.dropped_invalid.fetch_add(1, Ordering::Relaxed);
            return FilterDecision::DropInvalid;
        }

        let stripe = &self.stripes[stripe_index(device_id)];
        let mut cache = stripe.lock().expect("预过滤缓存锁中毒");

        let mut any_meaningful = false;
        let mut any_valid = false;

        for reading in &message.readings {
            if !self.is_valid(reading.sensor_type, reading.value, device_id, message.timestamp, &cache) {
                continue;
            }
            any_valid = true;

            let key = (device_id.to_string(), reading.sensor_type);
            let trivial = match cache.get(&key) {
                // 首条读数不算平凡变化
                None => false,
                Some(last) => self.is_trivial(reading.sensor_type, reading.value, last.value),
            };

            if !trivial {
                any_meaningful = true;
            }
        }

        if !any_valid {
            drop(cache);
            self.dropped_invalid.fetch_add(1, Ordering::Relaxed);
            return FilterDecision::DropInvalid;
        }

        if !any_meaningful {
            drop(cache);
            self.dropped_trivial.fetch_add(1, Ordering::Relaxed);
            return FilterDecision::DropTrivial;
        }

        // 放行：有效读数更新上次读数缓存
        for reading in &message.readings {
            if !self.in_physical_range(reading.sensor_type, reading.value) {
                continue;
            }
            cache.insert(
                (device_id.to_string(), reading.sensor_type),
                LastSample {
                    value: reading.value,
                    timestamp_ms: message.timestamp,
                },
            );
        }
        drop(cache);

        let mut enriched = message.clone();
        enriched.preprocessed_at = Some(utils::now_millis());
        FilterDecision::Forward(enriched)
    }

    fn in_physical_range(&self, sensor_type: SensorType, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        let (lo, hi) = sensor_type.valid_range();
        value >= lo && value <= hi
    }

    fn is_valid(
        &self,
        sensor_type: SensorType,
        value: f64,
        device_id: &str,
        timestamp_ms: i64,
        cache: &HashMap<(String, SensorType), LastSample>,
    ) -> bool {
        if !self.in_physical_range(sensor_type, value) {
            return false;
        }

        // 同一 (设备, 传感器) 的时间戳必须单调不减
        if let Some(last) = cache.get(&(device_id.to_string(), sensor_type)) {
            if timestamp_ms < last.timestamp_ms {
                return false;
            }
        }

        true
    }

    fn is_trivial(&self, sensor_type: SensorType, value: f64, last: f64) -> bool {
        if sensor_type.is_accumulative() {
            // 累积型传感器：两侧都低于告警下限才算平凡
            let floor = match sensor_type {
                SensorType::Smoke => self.settings.smoke_threshold,
                _ => self.settings.co_threshold,
            };
            value < floor && last < floor
        } else {
            let threshold = match sensor_type {
                SensorType::Temperature => self.settings.temperature_threshold,
                _ => self.settings.humidity_threshold,
            };
            (value - last).abs() < threshold
        }
    }

    /// 过滤统计
    pub fn stats(&self) -> PreFilterStats {
        let total = self.total.load(Ordering::Relaxed);
        let dropped_invalid = self.dropped_invalid.load(Ordering::Relaxed);
        let dropped_trivial = self.dropped_trivial.load(Ordering::Relaxed);
        let dropped = dropped_invalid + dropped_trivial;

        PreFilterStats {
            total,
            forwarded: total - dropped,
            dropped_invalid,
            dropped_trivial,
            drop_rate: if total > 0 {
                dropped as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }
}

fn stripe_index(device_id: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    device_id.hash(&mut hasher);
    (hasher.finish() as usize) % STRIPE_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::messages::WireReading;

    fn settings() -> PrefilterSettings {
        PrefilterSettings {
            temperature_threshold: 0.5,
            humidity_threshold: 1.0,
            smoke_threshold: 5.0,
            co_threshold: 5.0,
        }
    }

    fn data(readings: Vec<(SensorType, f64)>, timestamp: i64) -> DataMessage {
        DataMessage {
            readings: readings
                .into_iter()
                .map(|(sensor_type, value)| WireReading {
                    sensor_type,
                    value,
                    unit: "u".to_string(),
                })
                .collect(),
            timestamp,
            preprocessed_at: None,
        }
    }

    #[test]
    fn test_first_reading_forwarded() {
        let filter = PreFilter::new(settings());
        let decision = filter.process("d1", &data(vec![(SensorType::Temperature, 25.0)], 1000));
        assert!(matches!(decision, FilterDecision::Forward(_)));
    }

    #[test]
    fn test_unchanged_temperature_dropped() {
        let filter = PreFilter::new(settings());
        filter.process("d1", &data(vec![(SensorType::Temperature, 25.0)], 1000));

        // 变化 0 < 0.5，平凡
        let decision = filter.process("d1", &data(vec![(SensorType::Temperature, 25.0)], 3000));
        assert!(matches!(decision, FilterDecision::DropTrivial));
    }

    #[test]
    fn test_forwarded_readings_separated_by_threshold() {
        let filter = PreFilter::new(settings());
        filter.process("d1", &data(vec![(SensorType::Temperature, 25.0)], 1000));

        // 被丢弃的平凡读数不更新缓存
        assert!(matches!(
            filter.process("d1", &data(vec![(SensorType::Temperature, 24.6)], 2000)),
            FilterDecision::DropTrivial
        ));
        // 相对最近一次放行值 25.0 的变化只有 0.1，仍然平凡
        assert!(matches!(
            filter.process("d1", &data(vec![(SensorType::Temperature, 25.1)], 3000)),
            FilterDecision::DropTrivial
        ));
        // 变化 0.5 >= 0.5，放行
        assert!(matches!(
            filter.process("d1", &data(vec![(SensorType::Temperature, 25.5)], 4000)),
            FilterDecision::Forward(_)
        ));
    }

    #[test]
    fn test_out_of_range_dropped() {
        let filter = PreFilter::new(settings());

        assert!(matches!(
            filter.process("d1", &data(vec![(SensorType::Temperature, 150.0)], 1000)),
            FilterDecision::DropInvalid
        ));
        assert!(matches!(
            filter.process("d1", &data(vec![(SensorType::Humidity, -1.0)], 1000)),
            FilterDecision::DropInvalid
        ));
        assert!(matches!(
            filter.process("d1", &data(vec![(SensorType::Smoke, -0.1)], 1000)),
            FilterDecision::DropInvalid
        ));
    }

    #[test]
    fn test_accumulative_sensor_floor() {
        let filter = PreFilter::new(settings());
        filter.process("d1", &data(vec![(SensorType::Smoke, 1.0)], 1000));

        // 两侧都低于 5.0 的告警下限，平凡
        assert!(matches!(
            filter.process("d1", &data(vec![(SensorType::Smoke, 1.2)], 2000)),
            FilterDecision::DropTrivial
        ));
        // 越过下限即有意义，与差值无关
        assert!(matches!(
            filter.process("d1", &data(vec![(SensorType::Smoke, 6.0)], 3000)),
            FilterDecision::Forward(_)
        ));
        // 高位小幅波动也有意义（持续高浓度不能被过滤掉）
        assert!(matches!(
            filter.process("d1", &data(vec![(SensorType::Smoke, 6.1)], 4000)),
            FilterDecision::Forward(_)
        ));
    }

    #[test]
    fn test_timestamp_regression_invalid() {
        let filter = PreFilter::new(settings());
        filter.process("d1", &data(vec![(SensorType::Temperature, 25.0)], 5000));

        let decision = filter.process("d1", &data(vec![(SensorType::Temperature, 30.0)], 4000));
        assert!(matches!(decision, FilterDecision::DropInvalid));
    }

    #[test]
    fn test_mixed_message_forwarded_when_any_meaningful() {
        let filter = PreFilter::new(settings());
        filter.process(
            "d1",
            &data(
                vec![(SensorType::Temperature, 25.0), (SensorType::Humidity, 50.0)],
                1000,
            ),
        );

        // 温度平凡但湿度变化 2.0 >= 1.0，整条放行
        let decision = filter.process(
            "d1",
            &data(
                vec![(SensorType::Temperature, 25.1), (SensorType::Humidity, 52.0)],
                2000,
            ),
        );
        assert!(matches!(decision, FilterDecision::Forward(_)));
    }

    #[test]
    fn test_empty_readings_invalid() {
        let filter = PreFilter::new(settings());
        assert!(matches!(
            filter.process("d1", &data(vec![], 1000)),
            FilterDecision::DropInvalid
        ));
    }

    #[test]
    fn test_devices_isolated() {
        let filter = PreFilter::new(settings());
        filter.process("d1", &data(vec![(SensorType::Temperature, 25.0)], 1000));

        // 不同设备的首条读数互不影响
        let decision = filter.process("d2", &data(vec![(SensorType::Temperature, 25.0)], 1000));
        assert!(matches!(decision, FilterDecision::Forward(_)));
    }

    #[test]
    fn test_enrichment_sets_preprocessed_at() {
        let filter = PreFilter::new(settings());
        match filter.process("d1", &data(vec![(SensorType::Temperature, 25.0)], 1000)) {
            FilterDecision::Forward(enriched) => assert!(enriched.preprocessed_at.is_some()),
            other => panic!("意外的结论: {:?}", other),
        }
    }

    #[test]
    fn test_stats_counting() {
        let filter = PreFilter::new(settings());
        filter.process("d1", &data(vec![(SensorType::Temperature, 25.0)], 1000));
        filter.process("d1", &data(vec![(SensorType::Temperature, 25.0)], 2000));
        filter.process("d1", &data(vec![(SensorType::Temperature, 500.0)], 3000));

        let stats = filter.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.dropped_trivial, 1);
        assert_eq!(stats.dropped_invalid, 1);
        assert!(stats.drop_rate > 60.0);
    }
}
