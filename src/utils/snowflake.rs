//! 64 位有序 ID 分配器
//!
//! ID 结构：41 位毫秒时间戳（自定义纪元）| 10 位节点 | 5 位类型 | 8 位序列。
//! 同一毫秒内序列递增，溢出时自旋等待下一毫秒；时钟回拨期间拒绝分配。

use crate::errors::AppError;
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Mutex;

/// 纪元：2023-01-01 00:00:00 UTC
const EPOCH_MS: i64 = 1_672_531_200_000;

const TIMESTAMP_BITS: u32 = 41;
const NODE_ID_BITS: u32 = 10;
const TYPE_ID_BITS: u32 = 5;
const SEQUENCE_BITS: u32 = 8;

const MAX_NODE_ID: i64 = (1 << NODE_ID_BITS) - 1;
const MAX_TYPE_ID: i64 = (1 << TYPE_ID_BITS) - 1;
const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;

const NODE_ID_SHIFT: u32 = TYPE_ID_BITS + SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = NODE_ID_BITS + TYPE_ID_BITS + SEQUENCE_BITS;
const TYPE_ID_SHIFT: u32 = SEQUENCE_BITS;

/// 传感器读数 ID 类型
pub const TYPE_READING: u8 = 1;
/// 告警事件 ID 类型
pub const TYPE_ALARM: u8 = 2;

/// ID 的各组成部分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    /// 毫秒时间戳（Unix 纪元）
    pub timestamp_ms: i64,
    pub node_id: u16,
    pub type_id: u8,
    pub sequence: u16,
}

/// ID 分配器
pub struct IdAllocator {
    node_id: i64,
    state: Mutex<AllocatorState>,
}

struct AllocatorState {
    last_timestamp: i64,
    sequence: i64,
}

impl IdAllocator {
    /// 创建分配器。`node_id` 未配置时从网卡硬件地址推导，失败则随机
    pub fn new(node_id: Option<u16>) -> Self {
        let node_id = match node_id {
            Some(id) => i64::from(id) & MAX_NODE_ID,
            None => derive_node_id(),
        };

        tracing::info!(node_id, "ID 分配器已初始化");

        Self {
            node_id,
            state: Mutex::new(AllocatorState {
                last_timestamp: -1,
                sequence: 0,
            }),
        }
    }

    /// 当前节点 ID
    pub fn node_id(&self) -> u16 {
        self.node_id as u16
    }

    /// 分配下一个 ID
    ///
    /// 时钟回拨时返回错误，直到系统时钟重新越过上次分配的毫秒。
    pub fn next(&self, type_id: u8) -> Result<i64, AppError> {
        if i64::from(type_id) > MAX_TYPE_ID {
            return Err(AppError::ValidationError(format!(
                "类型 ID 必须在 0-{} 之间",
                MAX_TYPE_ID
            )));
        }

        let mut state = self.state.lock().expect("ID 分配器锁中毒");
        let mut now = current_millis();

        if now < state.last_timestamp {
            return Err(AppError::InternalError(format!(
                "时钟回拨 {} 毫秒，拒绝分配 ID",
                state.last_timestamp - now
            )));
        }

        if now == state.last_timestamp {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            // 同一毫秒内序列耗尽，自旋等待下一毫秒
            if state.sequence == 0 {
                now = wait_next_millis(now);
            }
        } else {
            state.sequence = 0;
        }

        state.last_timestamp = now;

        Ok(((now - EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.node_id << NODE_ID_SHIFT)
            | (i64::from(type_id) << TYPE_ID_SHIFT)
            | state.sequence)
    }

    /// 拆解 ID 的组成部分
    pub fn unpack(id: i64) -> IdParts {
        IdParts {
            timestamp_ms: (id >> TIMESTAMP_SHIFT) + EPOCH_MS,
            node_id: ((id >> NODE_ID_SHIFT) & MAX_NODE_ID) as u16,
            type_id: ((id >> TYPE_ID_SHIFT) & MAX_TYPE_ID) as u8,
            sequence: (id & MAX_SEQUENCE) as u16,
        }
    }
}

fn current_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn wait_next_millis(last: i64) -> i64 {
    let mut now = current_millis();
    while now <= last {
        std::hint::spin_loop();
        now = current_millis();
    }
    now
}

/// 从主网卡硬件地址的低 10 位推导节点 ID，失败时退化为随机值
fn derive_node_id() -> i64 {
    if let Some(id) = node_id_from_mac() {
        return id;
    }

    tracing::warn!("无法从网卡硬件地址推导节点 ID，使用随机值");
    let rng = SystemRandom::new();
    let mut buf = [0u8; 2];
    if rng.fill(&mut buf).is_ok() {
        (i64::from(u16::from_be_bytes(buf))) & MAX_NODE_ID
    } else {
        0
    }
}

fn node_id_from_mac() -> Option<i64> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;

    for entry in entries.flatten() {
        let name = entry.file_name();
        if name == "lo" {
            continue;
        }

        let address = std::fs::read_to_string(entry.path().join("address")).ok()?;
        let octets: Vec<u8> = address
            .trim()
            .split(':')
            .filter_map(|part| u8::from_str_radix(part, 16).ok())
            .collect();

        if octets.len() == 6 && octets.iter().any(|b| *b != 0) {
            let id = (i64::from(octets[4]) << 8) | i64::from(octets[5]);
            return Some(id & MAX_NODE_ID);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_strictly_increasing() {
        let allocator = IdAllocator::new(Some(1));
        let mut last = 0;
        for _ in 0..1000 {
            let id = allocator.next(TYPE_READING).unwrap();
            assert!(id > last, "ID 必须严格递增");
            last = id;
        }
    }

    #[test]
    fn test_unpack_roundtrip() {
        let allocator = IdAllocator::new(Some(42));
        let before = chrono::Utc::now().timestamp_millis();
        let id = allocator.next(TYPE_ALARM).unwrap();
        let after = chrono::Utc::now().timestamp_millis();

        let parts = IdAllocator::unpack(id);
        assert_eq!(parts.node_id, 42);
        assert_eq!(parts.type_id, TYPE_ALARM);
        assert!(parts.timestamp_ms >= before && parts.timestamp_ms <= after);
    }

    #[test]
    fn test_type_id_range_enforced() {
        let allocator = IdAllocator::new(Some(1));
        assert!(allocator.next(31).is_ok());
        assert!(allocator.next(32).is_err());
    }

    #[test]
    fn test_node_id_masked_to_ten_bits() {
        let allocator = IdAllocator::new(Some(1023));
        let id = allocator.next(TYPE_READING).unwrap();
        assert_eq!(IdAllocator::unpack(id).node_id, 1023);
    }

    #[test]
    fn test_sequence_within_same_millisecond() {
        let allocator = IdAllocator::new(Some(7));
        // 连续分配中同毫秒的 ID 序列号单调递增
        let ids: Vec<i64> = (0..50)
            .map(|_| allocator.next(TYPE_READING).unwrap())
            .collect();
        for pair in ids.windows(2) {
            let a = IdAllocator::unpack(pair[0]);
            let b = IdAllocator::unpack(pair[1]);
            if a.timestamp_ms == b.timestamp_ms {
                assert_eq!(u32::from(b.sequence), u32::from(a.sequence) + 1);
            } else {
                assert_eq!(b.sequence, 0);
            }
        }
    }

    #[test]
    fn test_concurrent_allocation_unique() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let allocator = Arc::new(IdAllocator::new(Some(3)));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let allocator = allocator.clone();
            handles.push(std::thread::spawn(move || {
                (0..500)
                    .map(|_| allocator.next(TYPE_READING).unwrap())
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "ID 不允许重复");
            }
        }
    }
}
