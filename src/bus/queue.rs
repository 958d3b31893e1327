//! 单频道优先级队列
//!
//! 排序键 = (优先级降序, 时间戳升序, 入队序号升序)；序号保证同优先级同时间戳时按到达顺序。

use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::bus::{BusMessage, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    priority: Reverse<Priority>,
    timestamp: i64,
    seq: u64,
}

#[derive(Debug)]
pub(crate) struct ChannelQueue {
    entries: BTreeMap<OrderKey, BusMessage>,
    capacity: usize,
    next_seq: u64,
}

impl ChannelQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
            next_seq: 0,
        }
    }

    /// 已满时原样退回消息
    pub(crate) fn push(&mut self, message: BusMessage) -> Result<(), BusMessage> {
        if self.entries.len() >= self.capacity {
            return Err(message);
        }
        let key = OrderKey {
            priority: Reverse(message.priority),
            timestamp: message.timestamp,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, message);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<BusMessage> {
        self.entries.pop_first().map(|(_, m)| m)
    }

    /// 取出排序最靠前且满足 filter 的消息；其余消息位置不变
    pub(crate) fn take_first_matching(
        &mut self,
        filter: &(dyn Fn(&BusMessage) -> bool + Send + Sync),
    ) -> Option<BusMessage> {
        let key = self
            .entries
            .iter()
            .find(|(_, m)| filter(m))
            .map(|(k, _)| *k)?;
        self.entries.remove(&key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
