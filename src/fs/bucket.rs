//! 哈希桶：缓冲块索引的一个分片
//!
//! 每个桶是一条带哨兵的循环双向链表，链接以缓冲块下标表示，哨兵的下标为 `NBUF`。
//! 链表按最近使用排序：新近访问的缓冲块插入头部，尾部是本桶中最久未使用的。
//! 桶只保存下标与控制信息，缓冲块本身由 [`Bcache`](super::Bcache) 持有。

use super::BioError;

/// 前驱与后继的下标，`NBUF` 表示哨兵。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Link {
    prev: usize,
    next: usize,
}

/// 缓冲块控制信息，只在该缓冲块位于本桶链表中时有意义。
#[derive(Clone, Copy, Debug)]
pub(super) struct BufCtrl {
    /// 缓冲块当前缓存的 `(dev, blockno)`，从未分配过时为 `None`。
    pub key: Option<(u32, u32)>,
    /// 持有者与钉住（pin）的总数，为 0 时可被淘汰。
    pub refcnt: usize,
    /// 最近一次获取或释放的时间戳，只作为淘汰提示。
    pub timestamp: u64,
    /// 在本桶链表中的位置；不在本桶时为 `None`。
    link: Option<Link>,
}

impl BufCtrl {
    const UNLINKED: Self = Self {
        key: None,
        refcnt: 0,
        timestamp: 0,
        link: None,
    };
}

/// 一个哈希桶。调用者必须持有桶的自旋锁才能遍历或修改链表。
pub(super) struct Bucket<const NBUF: usize> {
    /// 桶在哈希表中的编号
    id: usize,
    /// 哨兵：`head.next` 最新，`head.prev` 最旧
    head: Link,
    /// 以缓冲块下标为索引的控制信息
    nodes: [BufCtrl; NBUF],
}

impl<const NBUF: usize> Bucket<NBUF> {
    const HEAD: usize = NBUF;

    /// 创建空桶：哨兵自环。
    pub fn new(id: usize) -> Self {
        Self {
            id,
            head: Link { prev: Self::HEAD, next: Self::HEAD },
            nodes: [BufCtrl::UNLINKED; NBUF],
        }
    }

    /// 桶在哈希表中的编号。
    pub fn id(&self) -> usize {
        self.id
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.head.next == Self::HEAD
    }

    /// 缓冲块是否链接在本桶中。
    ///
    /// 每个缓冲块恰好属于一个桶，其他桶中同一下标的控制信息都是未链接的。
    pub fn contains(&self, index: usize) -> bool {
        self.nodes[index].link.is_some()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// 本桶中的缓冲块控制信息。
    ///
    /// # Panics
    /// 缓冲块不在本桶中时 panic，说明索引已被破坏。
    pub fn ctrl(&self, index: usize) -> &BufCtrl {
        if !self.contains(index) {
            self.corrupted();
        }
        &self.nodes[index]
    }

    /// 同 [`Bucket::ctrl`]，返回可变引用。
    pub fn ctrl_mut(&mut self, index: usize) -> &mut BufCtrl {
        if !self.contains(index) {
            self.corrupted();
        }
        &mut self.nodes[index]
    }

    /// 查找缓存了 `(dev, blockno)` 的缓冲块。
    pub fn find(&self, dev: u32, blockno: u32) -> Option<usize> {
        self.iter().find(|&i| self.nodes[i].key == Some((dev, blockno)))
    }

    /// 将缓冲块插入链表头部。
    ///
    /// # Panics
    /// 缓冲块已经在本桶中时 panic。
    pub fn push_front(&mut self, index: usize) {
        self.insert_after(Self::HEAD, index);
    }

    /// 将缓冲块从链表中摘除，返回摘除前的控制信息。
    ///
    /// # Panics
    /// 缓冲块不在本桶中，或前后节点不指向它时 panic。
    pub fn remove(&mut self, index: usize) -> BufCtrl {
        let ctrl = *self.ctrl(index);
        let Link { prev, next } = self.link(index);
        if self.link(prev).next != index || self.link(next).prev != index {
            self.corrupted();
        }
        self.link_mut(prev).next = next;
        self.link_mut(next).prev = prev;
        self.nodes[index].link = None;
        ctrl
    }

    /// 将缓冲块移到链表头部（最近使用）。
    pub fn move_to_front(&mut self, index: usize) {
        if self.head.next != index {
            self.remove(index);
            self.push_front(index);
        }
    }

    /// 把本桶中的缓冲块重新分配给 `(dev, blockno)`，引用计数置为 1。
    pub fn claim(&mut self, index: usize, dev: u32, blockno: u32, timestamp: u64) {
        let ctrl = self.ctrl_mut(index);
        ctrl.key = Some((dev, blockno));
        ctrl.refcnt = 1;
        ctrl.timestamp = timestamp;
    }

    /// 从尾部（最旧）向头部扫描，寻找引用计数为 0 且时间戳小于 `than` 的最旧缓冲块。
    ///
    /// 链表按时间戳近似有序，一旦遇到比当前最优者更新的节点就停止扫描。
    /// 返回本桶中找到的最优者及其时间戳；`than` 为 `None` 表示尚无候选。
    pub fn least_recent(&self, than: Option<u64>) -> Option<(usize, u64)> {
        let mut least = than;
        let mut found = None;
        for index in self.iter_rev() {
            let ctrl = &self.nodes[index];
            if ctrl.refcnt == 0 && least.map_or(true, |ts| ctrl.timestamp < ts) {
                found = Some((index, ctrl.timestamp));
                least = Some(ctrl.timestamp);
            }
            if least.map_or(false, |ts| ctrl.timestamp > ts) {
                break;
            }
        }
        found
    }

    /// 从头部（最新）到尾部遍历缓冲块下标。
    pub fn iter(&self) -> Walk<'_, NBUF> {
        Walk { bucket: self, cur: Self::HEAD, forward: true, steps: 0 }
    }

    /// 从尾部（最旧）到头部遍历缓冲块下标。
    pub fn iter_rev(&self) -> Walk<'_, NBUF> {
        Walk { bucket: self, cur: Self::HEAD, forward: false, steps: 0 }
    }

    /// 检查链表结构：正向与反向遍历都回到哨兵、步数相等、相邻节点互相指向，
    /// 并且声明属于本桶的节点都能遍历到。返回链表长度。
    pub fn check(&self) -> Result<usize, BioError> {
        let err = BioError::CorruptIndex { bucket: self.id };

        let mut forward = 0;
        let mut cur = Self::HEAD;
        loop {
            let next = self.try_link(cur).ok_or(err)?.next;
            if self.try_link(next).ok_or(err)?.prev != cur {
                return Err(err);
            }
            if next == Self::HEAD {
                break;
            }
            forward += 1;
            if forward > NBUF {
                return Err(err);
            }
            cur = next;
        }

        let mut backward = 0;
        let mut cur = self.head.prev;
        while cur != Self::HEAD {
            backward += 1;
            if backward > NBUF {
                return Err(err);
            }
            cur = self.try_link(cur).ok_or(err)?.prev;
        }

        let linked = self.nodes.iter().filter(|n| n.link.is_some()).count();
        if forward != backward || forward != linked {
            return Err(err);
        }
        Ok(forward)
    }

    /// 将缓冲块插入到 `at`（可以是哨兵）之后。
    ///
    /// # 流程解释
    /// 1. 确认缓冲块尚未链接，重复插入会破坏链表；
    /// 2. 新节点的前驱为 `at`、后继为 `at` 原来的后继；
    /// 3. 依次改写后继的 `prev` 与 `at` 的 `next`。
    fn insert_after(&mut self, at: usize, index: usize) {
        if self.contains(index) {
            self.corrupted();
        }
        let next = self.link(at).next;
        self.nodes[index].link = Some(Link { prev: at, next });
        self.link_mut(next).prev = index;
        self.link_mut(at).next = index;
    }

    /// 哨兵或节点的链接，节点未链接或下标越界时返回 `None`。
    fn try_link(&self, index: usize) -> Option<Link> {
        if index == Self::HEAD {
            Some(self.head)
        } else {
            self.nodes.get(index)?.link
        }
    }

    /// 同 `try_link`，找不到链接说明结构已被破坏，直接 panic。
    fn link(&self, index: usize) -> Link {
        match self.try_link(index) {
            Some(link) => link,
            None => self.corrupted(),
        }
    }

    fn link_mut(&mut self, index: usize) -> &mut Link {
        if index == Self::HEAD {
            return &mut self.head;
        }
        let bucket = self.id;
        match self.nodes.get_mut(index).and_then(|n| n.link.as_mut()) {
            Some(link) => link,
            None => panic!("{}", BioError::CorruptIndex { bucket }),
        }
    }

    /// 以 `CorruptIndex` panic：链表结构被破坏后无法继续安全运行。
    fn corrupted(&self) -> ! {
        panic!("{}", BioError::CorruptIndex { bucket: self.id })
    }
}

/// 沿链表遍历缓冲块下标的迭代器。
pub(super) struct Walk<'a, const NBUF: usize> {
    bucket: &'a Bucket<NBUF>,
    cur: usize,
    forward: bool,
    steps: usize,
}

impl<'a, const NBUF: usize> Iterator for Walk<'a, NBUF> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let link = self.bucket.link(self.cur);
        let next = if self.forward { link.next } else { link.prev };
        if next == Bucket::<NBUF>::HEAD {
            return None;
        }
        self.steps += 1;
        if self.steps > NBUF {
            // 没有回到哨兵：链表成环或断裂
            self.bucket.corrupted();
        }
        self.cur = next;
        Some(next)
    }
}
