//! 任务位池管理模块
//!
//! 每台服务器一个池，槽位数就是该服务器允许同时下载的文件数。
//! 叶子任务被调度时占用一个槽位，进入终态（完成/停止/暂停/出错）时释放，
//! 每个任务只会释放一次。

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 任务位
#[derive(Debug, Clone)]
pub struct TaskSlot {
    /// 槽位ID
    pub id: usize,
    /// 占用此位的任务ID
    pub task_id: Option<String>,
}

impl TaskSlot {
    fn new(id: usize) -> Self {
        Self { id, task_id: None }
    }

    /// 检查槽位是否空闲
    pub fn is_free(&self) -> bool {
        self.task_id.is_none()
    }
}

/// 任务位池管理器
#[derive(Debug)]
pub struct TaskSlotPool {
    /// 最大槽位数（支持动态调整）
    max_slots: AtomicUsize,
    /// 槽位列表
    slots: RwLock<Vec<TaskSlot>>,
}

impl TaskSlotPool {
    /// 创建新的任务位池
    pub fn new(max_slots: usize) -> Self {
        let slots = (0..max_slots).map(TaskSlot::new).collect();

        debug!("创建任务位池，最大槽位数: {}", max_slots);

        Self {
            max_slots: AtomicUsize::new(max_slots),
            slots: RwLock::new(slots),
        }
    }

    /// 获取最大槽位数
    pub fn max_slots(&self) -> usize {
        self.max_slots.load(Ordering::SeqCst)
    }

    /// 动态调整槽位池容量
    ///
    /// # 扩容策略
    /// - 追加新的空闲槽位
    ///
    /// # 缩容策略
    /// - 不中断已占用的槽位，超出新上限的任务继续运行到完成，释放时再回收该槽位
    /// - 占用数回落到新上限以下之前不会再分配
    pub async fn resize(&self, new_max: usize) {
        let old_max = self.max_slots.load(Ordering::SeqCst);

        if new_max == old_max {
            debug!("任务位池容量无需调整: {}", old_max);
            return;
        }

        let mut slots = self.slots.write().await;

        if new_max > old_max {
            for id in 0..new_max {
                if !slots.iter().any(|s| s.id == id) {
                    slots.push(TaskSlot::new(id));
                }
            }
            slots.sort_by_key(|s| s.id);
            info!("✅ 任务位池扩容: {} -> {}", old_max, new_max);
        } else {
            let occupied_beyond_limit = slots
                .iter()
                .filter(|s| s.id >= new_max && !s.is_free())
                .count();
            slots.retain(|s| s.id < new_max || !s.is_free());

            if occupied_beyond_limit > 0 {
                warn!(
                    "⚠️ 任务位池缩容: {} -> {} (有 {} 个超出新上限的槽位仍被占用，将继续运行)",
                    old_max, new_max, occupied_beyond_limit
                );
            } else {
                info!("✅ 任务位池缩容: {} -> {}", old_max, new_max);
            }
        }

        self.max_slots.store(new_max, Ordering::SeqCst);
    }

    /// 尝试为任务分配槽位
    ///
    /// 同一任务重复分配返回已有槽位；占用数达到上限时返回 None
    pub async fn allocate(&self, task_id: &str) -> Option<usize> {
        let max_slots = self.max_slots.load(Ordering::SeqCst);
        let mut slots = self.slots.write().await;

        if let Some(slot) = slots.iter().find(|s| s.task_id.as_deref() == Some(task_id)) {
            return Some(slot.id);
        }

        let used = slots.iter().filter(|s| !s.is_free()).count();
        if used >= max_slots {
            debug!("无可用任务位: task_id={}, used={}/{}", task_id, used, max_slots);
            return None;
        }

        let slot = slots.iter_mut().find(|s| s.id < max_slots && s.is_free())?;
        slot.task_id = Some(task_id.to_string());
        debug!("分配任务位: slot_id={}, task_id={}", slot.id, task_id);
        Some(slot.id)
    }

    /// 释放任务占用的槽位
    ///
    /// 返回是否真的释放了槽位；任务未占用槽位时返回 false，不会重复释放
    pub async fn release(&self, task_id: &str) -> bool {
        let max_slots = self.max_slots.load(Ordering::SeqCst);
        let mut slots = self.slots.write().await;

        let Some(pos) = slots
            .iter()
            .position(|s| s.task_id.as_deref() == Some(task_id))
        else {
            return false;
        };

        let slot_id = slots[pos].id;
        if slot_id >= max_slots {
            // 缩容后遗留的槽位，释放即回收
            slots.remove(pos);
        } else {
            slots[pos].task_id = None;
        }
        debug!("释放任务位: slot_id={}, task_id={}", slot_id, task_id);
        true
    }

    /// 获取当前已使用槽位数（包括缩容后仍在运行的槽位）
    pub async fn used_slots(&self) -> usize {
        let slots = self.slots.read().await;
        slots.iter().filter(|s| !s.is_free()).count()
    }
}
