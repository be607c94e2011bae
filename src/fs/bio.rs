//! 缓存层
//!
//! 固定数量的缓冲块缓存磁盘块内容，按 `(dev + blockno) % NBUCKET` 分布在多个哈希桶中。
//! 命中只需要目标桶的自旋锁；未命中时在全局分配锁下扫描所有桶，
//! 选出时间戳最旧的空闲缓冲块，改写其身份后迁移到目标桶。
//!
//! 锁的层次：
//! * 分配锁 `lock`：同一时刻只有一个线程执行淘汰扫描；
//! * 桶锁：保护桶内链表与控制信息，扫描时最多同时持有两把；
//! * 缓冲块睡眠锁：保护块内容与磁盘 I/O，只在释放全部自旋锁之后获取。

use core::array;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::clock::{Clock, Ticks};
use crate::consts::fs::{self, BSIZE};
use crate::driver::BlockDevice;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::{SpinLock, SpinLockGuard};
use super::bucket::Bucket;
use super::BioError;

bitflags! {
    /// 缓冲块状态位。
    pub struct BufFlags: u8 {
        /// 块内容已从磁盘读入。
        const VALID = 1 << 0;
        /// 磁盘正在使用该缓冲块的数据。
        const DISK = 1 << 1;
    }
}

/// 全局缓冲区缓存（Buffer Cache）结构体，用于块设备的读写缓存。
///
/// `Bcache` 提供了一个固定大小的内存缓冲区池，用于缓存磁盘块数据，
/// 以减少重复的磁盘访问并提升 I/O 性能。它在每个哈希桶内维护按最近使用排序的链表，
/// 淘汰时跨桶选择时间戳最旧的空闲缓冲块，近似全局 LRU。
///
/// 该结构在内核初始化阶段构造一次，以共享引用传给所有使用者，生命周期贯穿内核运行期间。
///
/// # 类型参数
/// - `D`: 块设备
/// - `C`: 时间戳来源，默认是时钟中断计数
/// - `NBUF`: 缓冲块数量
/// - `NBUCKET`: 哈希桶数量
pub struct Bcache<
    D,
    C = Ticks,
    const NBUF: usize = { fs::NBUF },
    const NBUCKET: usize = { fs::NBUCKET },
> {
    /// 全局分配锁。
    ///
    /// 串行化未命中时的分配，保证同一个 `(dev, blockno)` 不会被分配到两个缓冲块。
    lock: SpinLock<()>,

    /// 哈希桶，每个桶有自己的自旋锁。
    buckets: [SpinLock<Bucket<NBUF>>; NBUCKET],

    /// 缓冲块数组，下标与桶中控制信息的下标一一对应。
    bufs: [BufInner; NBUF],

    disk: D,
    clock: C,
    stat: Counters,
}

impl<D: BlockDevice, C: Clock, const NBUF: usize, const NBUCKET: usize> Bcache<D, C, NBUF, NBUCKET> {
    /// 创建缓冲区缓存。
    ///
    /// # 功能说明
    /// 所有桶初始化为空的循环链表（哨兵自环），然后把全部缓冲块插入 0 号桶，
    /// 使“每个缓冲块恰好属于一个桶”从一开始就成立。
    ///
    /// # Panics
    /// `NBUF` 或 `NBUCKET` 为 0 时 panic。
    pub fn new(disk: D, clock: C) -> Self {
        if NBUF == 0 || NBUCKET == 0 {
            panic!("binit: empty buffer cache");
        }

        let bcache = Self {
            lock: SpinLock::new((), "bcache"),
            buckets: array::from_fn(|i| SpinLock::new(Bucket::new(i), "bcache.bucket")),
            bufs: array::from_fn(|_| BufInner::new()),
            disk,
            clock,
            stat: Counters::new(),
        };

        {
            let mut first = bcache.buckets[0].lock();
            for i in 0..NBUF {
                first.push_front(i);
            }
        }

        #[cfg(feature = "verbose_init_info")]
        println!("bcache: {} buffers in {} buckets, block size {}", NBUF, NBUCKET, BSIZE);

        bcache
    }

    /// `(dev, blockno)` 所属的哈希桶编号。
    ///
    /// 求和在 `u64` 中进行，32 位目标上也不会溢出。
    pub fn bucket_of(dev: u32, blockno: u32) -> usize {
        ((dev as u64 + blockno as u64) % NBUCKET as u64) as usize
    }

    /// 从缓冲区缓存中读取指定设备与块号对应的数据。
    ///
    /// # 功能说明
    /// 返回的 `Buf` 持有缓冲块的睡眠锁，内容保证有效：
    /// 若缓冲块未被标记为有效，则在返回前从磁盘读入。
    ///
    /// # 参数
    /// - `dev`: 设备号，标识请求的块所属的块设备；
    /// - `blockno`: 块号，标识请求的块在设备上的逻辑位置。
    ///
    /// # Panics
    /// 所有缓冲块都在使用中（引用计数大于 0）时 panic：
    /// 缓存没有等待空闲缓冲块的机制，这是不可恢复的容量耗尽。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_, D, C, NBUF, NBUCKET> {
        match self.try_bread(dev, blockno) {
            Ok(b) => b,
            Err(err) => panic!("bget: {}", err),
        }
    }

    /// 与 [`Bcache::bread`] 相同，但容量耗尽时返回 `Err(BioError::CapacityExhausted)`。
    pub fn try_bread(&self, dev: u32, blockno: u32) -> Result<Buf<'_, D, C, NBUF, NBUCKET>, BioError> {
        let mut b = match self.bget(dev, blockno) {
            Ok(b) => b,
            Err(err) => {
                #[cfg(feature = "kernel_warning")]
                println!("kernel warning: bget({}, {}): {}", dev, blockno, err);
                return Err(err);
            }
        };
        if !b.flags().contains(BufFlags::VALID) {
            b.load();
        }
        Ok(b)
    }

    /// 获取指定设备与块号对应的缓冲块，持有其睡眠锁返回，不读磁盘。
    ///
    /// 先走只锁目标桶的快速路径，未命中再进入全局串行的分配路径。
    /// 两条路径返回时引用计数都已加一，之后才在不持有任何自旋锁的情况下获取睡眠锁。
    fn bget(&self, dev: u32, blockno: u32) -> Result<Buf<'_, D, C, NBUF, NBUCKET>, BioError> {
        let index = match self.find_cached(dev, blockno) {
            Some(index) => index,
            None => self.allocate(dev, blockno)?,
        };
        Ok(Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: ManuallyDrop::new(self.bufs[index].data.lock()),
            _not_send: PhantomData,
        })
    }

    /// 快速路径：只持有目标桶的锁查找已缓存的块。
    ///
    /// 命中时引用计数加一并刷新时间戳，返回缓冲块下标；不会访问其他桶，也不会阻塞。
    fn find_cached(&self, dev: u32, blockno: u32) -> Option<usize> {
        let mut bucket = self.buckets[Self::bucket_of(dev, blockno)].lock();
        let index = bucket.find(dev, blockno)?;
        let timestamp = self.clock.now();
        let ctrl = bucket.ctrl_mut(index);
        ctrl.refcnt += 1;
        ctrl.timestamp = timestamp;

        #[cfg(feature = "trace_bio")]
        println!("bio: hit {} in bucket {}: dev={} blockno={} refcnt={}",
            index, bucket.id(), dev, blockno, bucket.ctrl(index).refcnt);

        drop(bucket);
        self.stat.hits.fetch_add(1, Ordering::Relaxed);
        Some(index)
    }

    /// 慢速路径：在全局分配锁下为 `(dev, blockno)` 分配一个缓冲块。
    ///
    /// # 流程解释
    /// 1. 获取分配锁后重新查找目标桶：快速路径未命中之后、拿到分配锁之前，
    ///    其他线程可能已经为同一块完成了分配；
    /// 2. 按桶编号递增的顺序逐个加锁扫描，保留当前最优候选所在桶的锁，
    ///    找到更优候选时再释放上一个候选桶的锁，因此最多同时持有两把桶锁；
    /// 3. 候选不在目标桶时，先从原桶摘除并释放原桶锁，再锁目标桶插入头部；
    ///    候选已在目标桶时原地改写，不重复加锁；
    /// 4. 改写后的引用计数为 1，释放分配锁后任何扫描都不会再选中它。
    ///
    /// # 可能的错误
    /// 所有缓冲块的引用计数都大于 0 时返回 `BioError::CapacityExhausted`。
    fn allocate(&self, dev: u32, blockno: u32) -> Result<usize, BioError> {
        let alloc = self.lock.lock();

        if let Some(index) = self.find_cached(dev, blockno) {
            #[cfg(feature = "kernel_warning")]
            println!("kernel warning: bget({}, {}): cached while waiting for allocation", dev, blockno);
            drop(alloc);
            return Ok(index);
        }

        let mut best: Option<Candidate<'_, NBUF>> = None;
        for (id, bucket) in self.buckets.iter().enumerate() {
            let guard = bucket.lock();
            let than = best.as_ref().map(|c| c.timestamp);
            let found = guard.least_recent(than);
            match found {
                // 覆盖旧候选时释放它所在桶的锁
                Some((index, timestamp)) => best = Some(Candidate { bucket: id, index, timestamp, guard }),
                None => drop(guard),
            }
        }

        let Some(Candidate { bucket, index, mut guard, .. }) = best else {
            drop(alloc);
            return Err(BioError::CapacityExhausted);
        };

        // 旧身份在摘除前仍可被快速路径找到，必须在持有其桶锁时清除有效位
        let evicted = guard.ctrl(index).key;
        self.bufs[index].clear(BufFlags::VALID);

        let target = Self::bucket_of(dev, blockno);
        let timestamp = self.clock.now();
        if bucket == target {
            guard.claim(index, dev, blockno, timestamp);
            drop(guard);
        } else {
            guard.remove(index);
            drop(guard);
            let mut target_bucket = self.buckets[target].lock();
            target_bucket.push_front(index);
            target_bucket.claim(index, dev, blockno, timestamp);
            drop(target_bucket);
        }

        #[cfg(feature = "trace_bio")]
        println!("bio: allocated {} from bucket {} to bucket {}: dev={} blockno={} evicted={:?}",
            index, bucket, target, dev, blockno, evicted);

        self.stat.misses.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.stat.evictions.fetch_add(1, Ordering::Relaxed);
        }
        drop(alloc);
        Ok(index)
    }

    /// 释放缓冲块的引用。
    ///
    /// 调用前睡眠锁已经释放。引用计数减一并刷新时间戳；
    /// 计数归零时移到所在桶的链表头部，内容保留以便之后命中。
    fn brelse(&self, index: usize, dev: u32, blockno: u32) {
        let mut bucket = self.member(index, dev, blockno);
        let timestamp = self.clock.now();
        let ctrl = bucket.ctrl_mut(index);
        ctrl.refcnt -= 1;
        ctrl.timestamp = timestamp;

        #[cfg(feature = "trace_bio")]
        println!("bio: released {}: dev={} blockno={} refcnt={}", index, dev, blockno, ctrl.refcnt);

        if ctrl.refcnt == 0 {
            bucket.move_to_front(index);
        }
    }

    /// 在桶锁下将引用计数加一，供 [`Buf::pin`] 使用。
    ///
    /// # 参数
    /// - `index`: 缓冲块下标，调用者持有该缓冲块的引用，所以身份不会改变；
    /// - `dev`, `blockno`: 缓冲块当前的身份，用于定位所在的桶。
    fn bpin(&self, index: usize, dev: u32, blockno: u32) {
        let mut bucket = self.member(index, dev, blockno);
        let ctrl = bucket.ctrl_mut(index);
        ctrl.refcnt += 1;

        #[cfg(feature = "trace_bio")]
        println!("bio: pin {}: dev={} blockno={} refcnt={}", index, dev, blockno, ctrl.refcnt);
    }

    /// 在桶锁下将引用计数减一，供 [`Buf::unpin`] 使用。
    ///
    /// # 流程解释
    /// 调用者自身的 `Buf` 占一次引用，计数不大于 1 说明没有可撤销的 pin；
    /// 此时减一会让仍被持有的缓冲块变得可淘汰，因此直接 panic。
    ///
    /// # Panics
    /// 引用计数不大于 1 时以 `LockMisuse` panic。
    fn bunpin(&self, index: usize, dev: u32, blockno: u32) {
        let mut bucket = self.member(index, dev, blockno);
        let ctrl = bucket.ctrl_mut(index);
        if ctrl.refcnt <= 1 {
            panic!("{}", BioError::LockMisuse("bunpin: buffer not pinned"));
        }
        ctrl.refcnt -= 1;

        #[cfg(feature = "trace_bio")]
        println!("bio: unpin {}: dev={} blockno={} refcnt={}", index, dev, blockno, ctrl.refcnt);
    }

    /// 锁住 `(dev, blockno)` 所属的桶，并确认缓冲块确实以该身份位于桶中。
    ///
    /// 持有引用期间缓冲块的身份不会改变，所以由身份重新计算出的桶就是它当前所在的桶。
    fn member(&self, index: usize, dev: u32, blockno: u32) -> SpinLockGuard<'_, Bucket<NBUF>> {
        let bucket = self.buckets[Self::bucket_of(dev, blockno)].lock();
        if !bucket.contains(index) || bucket.ctrl(index).key != Some((dev, blockno)) {
            panic!("{}", BioError::CorruptIndex { bucket: bucket.id() });
        }
        bucket
    }

    /// 已缓存的 `(dev, blockno)` 当前的引用计数，未缓存时返回 `None`。
    pub fn refcnt(&self, dev: u32, blockno: u32) -> Option<usize> {
        let bucket = self.buckets[Self::bucket_of(dev, blockno)].lock();
        bucket.find(dev, blockno).map(|index| bucket.ctrl(index).refcnt)
    }

    /// 检查整个索引。
    ///
    /// # 功能说明
    /// 持有分配锁（桶之间的迁移因此暂停），逐个检查：
    /// - 每个桶的链表正反向遍历一致；
    /// - 已分配的缓冲块位于其身份对应的桶中，同一身份不出现两次；
    /// - 每个缓冲块恰好属于一个桶。
    pub fn check_index(&self) -> Result<(), BioError> {
        let alloc = self.lock.lock();
        let mut seen = [0usize; NBUF];

        for bucket in self.buckets.iter() {
            let bucket = bucket.lock();
            bucket.check()?;
            let err = BioError::CorruptIndex { bucket: bucket.id() };
            for index in bucket.iter() {
                seen[index] += 1;
                let Some((dev, blockno)) = bucket.ctrl(index).key else {
                    continue;
                };
                if Self::bucket_of(dev, blockno) != bucket.id() {
                    return Err(err);
                }
                if bucket.iter().filter(|&i| bucket.ctrl(i).key == Some((dev, blockno))).count() > 1 {
                    return Err(err);
                }
            }
        }
        drop(alloc);

        match seen.iter().position(|&n| n != 1) {
            Some(index) => Err(BioError::LostBuffer { index }),
            None => Ok(()),
        }
    }

    /// 统计信息快照。
    pub fn stat(&self) -> BcacheStat {
        self.stat.snapshot()
    }

    /// 底层块设备。
    pub fn disk(&self) -> &D {
        &self.disk
    }
}

/// 淘汰扫描的当前最优候选，持有其所在桶的锁。
struct Candidate<'a, const NBUF: usize> {
    bucket: usize,
    index: usize,
    timestamp: u64,
    guard: SpinLockGuard<'a, Bucket<NBUF>>,
}

/// 缓冲块数据的包装结构，表示一个已分配的磁盘块缓存实体。
///
/// `Buf` 持有缓冲块的睡眠锁，块内容只能经由它访问，
/// 因此读写磁盘（[`Buf::bwrite`]）在类型上就要求持有该锁。
/// 生命周期结束时先释放睡眠锁，再减少引用计数，相当于 `brelse`。
pub struct Buf<'a, D: BlockDevice, C: Clock, const NBUF: usize, const NBUCKET: usize> {
    cache: &'a Bcache<D, C, NBUF, NBUCKET>,

    /// 缓冲块在缓冲数组中的下标。
    index: usize,

    dev: u32,
    blockno: u32,

    /// 睡眠锁守卫，只在 `Drop` 中先于 `brelse` 释放。
    data: ManuallyDrop<SleepLockGuard<'a, BufData>>,

    /// 睡眠锁记录了持有者，`Buf` 不能交给其他线程释放。
    _not_send: PhantomData<*const ()>,
}

impl<'a, D: BlockDevice, C: Clock, const NBUF: usize, const NBUCKET: usize> Buf<'a, D, C, NBUF, NBUCKET> {
    /// 缓冲块所缓存的设备号。
    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// 缓冲块所缓存的块号。
    ///
    /// 持有 `Buf` 期间引用计数大于 0，缓冲块不会被淘汰，块号保持不变。
    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }

    /// 缓冲块在缓冲数组中的下标。
    pub fn index(&self) -> usize {
        self.index
    }

    /// 缓冲块当前的状态位。
    ///
    /// 经由 [`Bcache::bread`] 得到的 `Buf` 总是带有 `VALID`；
    /// `DISK` 只在块设备传输期间置位。
    pub fn flags(&self) -> BufFlags {
        self.cache.bufs[self.index].flags()
    }

    /// 块内容的只读视图。
    pub fn data(&self) -> &BufData {
        &self.data
    }

    /// 块内容的可写视图。
    ///
    /// 修改只存在于缓存中，调用 [`Buf::bwrite`] 才会写回磁盘。
    pub fn data_mut(&mut self) -> &mut BufData {
        &mut self.data
    }

    /// 将缓冲块内容写回磁盘。
    ///
    /// # Panics
    /// 当前线程没有持有缓冲块的睡眠锁时 panic。
    pub fn bwrite(&mut self) {
        if !self.data.holding() {
            panic!("{}", BioError::LockMisuse("bwrite: buffer lock not held"));
        }
        self.rw(true);
        self.cache.stat.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// 释放缓冲块，之后不能再使用它。等价于丢弃 `Buf`。
    pub fn brelse(self) {
        drop(self);
    }

    /// 将缓冲块的引用计数加一，使其在 `Buf` 释放后仍不会被淘汰。
    ///
    /// 日志层用它把已写入事务的块留在缓存中，直到事务安装完成，须与 `unpin` 配对使用。
    pub fn pin(&self) {
        self.cache.bpin(self.index, self.dev, self.blockno);
    }

    /// 撤销一次 `pin`。
    ///
    /// # Panics
    /// 引用计数只剩当前 `Buf` 自身的一次时 panic（`unpin` 与 `pin` 不匹配）。
    pub fn unpin(&self) {
        self.cache.bunpin(self.index, self.dev, self.blockno);
    }

    /// 从磁盘读入块内容并标记为有效。
    fn load(&mut self) {
        self.rw(false);
        self.cache.bufs[self.index].set(BufFlags::VALID);
        self.cache.stat.reads.fetch_add(1, Ordering::Relaxed);
    }

    /// 调用块设备完成一次传输，期间标记 `DISK`。
    fn rw(&mut self, writing: bool) {
        let cache = self.cache;
        let inner = &cache.bufs[self.index];
        inner.set(BufFlags::DISK);
        cache.disk.rw(&mut self.data, self.dev, self.blockno, writing);
        inner.clear(BufFlags::DISK);
    }
}

impl<'a, D: BlockDevice, C: Clock, const NBUF: usize, const NBUCKET: usize> Drop for Buf<'a, D, C, NBUF, NBUCKET> {
    fn drop(&mut self) {
        // 先释放睡眠锁，再在桶锁下减少引用计数
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.brelse(self.index, self.dev, self.blockno);
    }
}

/// 缓冲块的数据部分，包含实际的磁盘块内容及其状态位。
///
/// 状态位由 `AtomicU8` 表示：`VALID` 在分配时（持有桶锁）清除、在读盘后（持有睡眠锁）设置。
struct BufInner {
    flags: AtomicU8,
    data: SleepLock<BufData>,
}

impl BufInner {
    fn new() -> Self {
        Self {
            flags: AtomicU8::new(0),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }

    fn flags(&self) -> BufFlags {
        BufFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set(&self, flags: BufFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn clear(&self, flags: BufFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Deref for BufData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// 缓存统计信息快照。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BcacheStat {
    /// 已缓存的块被再次获取的次数
    pub hits: usize,
    /// 需要分配缓冲块的次数
    pub misses: usize,
    /// 分配时替换掉另一个块的次数
    pub evictions: usize,
    /// 读盘次数
    pub reads: usize,
    /// 写盘次数
    pub writes: usize,
}

struct Counters {
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl Counters {
    const fn new() -> Self {
        Self {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    fn snapshot(&self) -> BcacheStat {
        BcacheStat {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::LogicalClock;
    use crate::driver::ramdisk::RamDisk;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Barrier;
    use std::thread;
    use std::vec::Vec;

    /// 3 个缓冲块、2 个桶，淘汰顺序可以手工推算。
    type Small = Bcache<RamDisk, LogicalClock, 3, 2>;
    type Kernel = Bcache<RamDisk>;

    fn small() -> Small {
        Bcache::new(RamDisk::new(16), LogicalClock::new())
    }

    fn read_u32(b: &Buf<'_, RamDisk, LogicalClock, 8, 3>) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&b.data()[..4]);
        u32::from_le_bytes(bytes)
    }

    #[test]
    fn new_cache_puts_every_buffer_in_one_bucket() {
        let cache = small();
        assert_eq!(cache.check_index(), Ok(()));
        assert_eq!(cache.buckets[0].lock().len(), 3);
        assert!(cache.buckets[1].lock().is_empty());
        assert_eq!(cache.stat(), BcacheStat::default());
    }

    #[test]
    fn bucket_of_hashes_dev_plus_blockno() {
        assert_eq!(Small::bucket_of(1, 4), 1);
        assert_eq!(Small::bucket_of(1, 5), 0);
        assert_eq!(Kernel::bucket_of(1, 12), 0);
        assert_eq!(Kernel::bucket_of(2, 20), 9);
        // (2^32 - 1) * 2 = 8589934590 ≡ 3 (mod 13)
        assert_eq!(Kernel::bucket_of(u32::MAX, u32::MAX), 3);
        assert_eq!(Small::bucket_of(u32::MAX, 1), 0);
    }

    #[test]
    fn bread_loads_once_then_hits() {
        let cache = small();
        let b = cache.bread(1, 7);
        assert_eq!(b.dev(), 1);
        assert_eq!(b.read_blockno(), 7);
        assert!(b.flags().contains(BufFlags::VALID));
        assert!(!b.flags().contains(BufFlags::DISK));
        assert_eq!(cache.refcnt(1, 7), Some(1));
        let index = b.index();
        drop(b);
        assert_eq!(cache.refcnt(1, 7), Some(0));

        let b = cache.bread(1, 7);
        assert_eq!(b.index(), index);
        b.brelse();

        assert_eq!(cache.disk().reads(), 1);
        let stat = cache.stat();
        assert_eq!((stat.hits, stat.misses, stat.reads), (1, 1, 1));
    }

    #[test]
    fn evicts_least_recently_released_across_buckets() {
        let cache = small();
        let b1 = cache.bread(1, 1);
        let b2 = cache.bread(1, 2);
        let b3 = cache.bread(1, 3);
        let oldest = b1.index();
        drop(b1);
        drop(b2);
        drop(b3);

        // (1,4) 属于 1 号桶，被淘汰的 (1,1) 位于 0 号桶
        let b4 = cache.bread(1, 4);
        assert_eq!(b4.index(), oldest);
        assert!(b4.flags().contains(BufFlags::VALID));
        drop(b4);

        assert_eq!(cache.refcnt(1, 1), None);
        assert_eq!(cache.refcnt(1, 4), Some(0));
        assert_eq!(cache.disk().reads(), 4);
        assert_eq!(cache.stat().evictions, 1);
        assert_eq!(cache.check_index(), Ok(()));

        // 没有被淘汰的块直接命中
        let b2 = cache.bread(1, 2);
        drop(b2);
        assert_eq!(cache.disk().reads(), 4);
    }

    #[test]
    fn allocation_hands_out_an_unloaded_buffer() {
        let cache = small();
        let oldest = cache.bread(1, 1).index();
        for blockno in 2..=3 {
            cache.bread(1, blockno).brelse();
        }

        // 分配完成、尚未读盘：身份已经改写，内容还无效
        let mut b = cache.bget(1, 4).unwrap();
        assert_eq!(b.index(), oldest);
        assert_eq!((b.dev(), b.read_blockno()), (1, 4));
        assert!(!b.flags().contains(BufFlags::VALID));
        assert_eq!(cache.refcnt(1, 4), Some(1));
        assert_eq!(cache.refcnt(1, 1), None);
        assert_eq!(cache.disk().reads(), 3);

        b.load();
        assert!(b.flags().contains(BufFlags::VALID));
        assert_eq!(cache.disk().reads(), 4);
        drop(b);
        assert_eq!(cache.refcnt(1, 4), Some(0));
        assert_eq!(cache.check_index(), Ok(()));
    }

    #[test]
    fn recent_access_protects_a_block() {
        let cache = small();
        for blockno in 1..=3 {
            cache.bread(1, blockno).brelse();
        }
        cache.bread(1, 1).brelse();

        cache.bread(1, 4).brelse();
        assert_eq!(cache.refcnt(1, 2), None);
        assert_eq!(cache.refcnt(1, 1), Some(0));
        assert_eq!(cache.refcnt(1, 3), Some(0));
        assert_eq!(cache.check_index(), Ok(()));
    }

    #[test]
    fn working_set_within_capacity_never_evicts() {
        let cache = small();
        for _ in 0..10 {
            for blockno in 1..=3 {
                cache.bread(1, blockno).brelse();
            }
        }
        let stat = cache.stat();
        assert_eq!(stat.evictions, 0);
        assert_eq!(stat.misses, 3);
        assert_eq!(stat.hits, 27);
        assert_eq!(cache.disk().reads(), 3);
    }

    #[test]
    fn same_block_on_another_device_is_distinct() {
        let cache = small();
        let a = cache.bread(1, 3);
        let b = cache.bread(2, 3);
        assert_ne!(a.index(), b.index());
        drop(a);
        drop(b);
        assert_eq!(cache.disk().reads(), 2);
    }

    #[test]
    fn try_bread_reports_capacity_exhausted() {
        let cache = small();
        let held: Vec<_> = (1..=3).map(|blockno| cache.bread(1, blockno)).collect();
        assert_eq!(cache.try_bread(1, 4).err(), Some(BioError::CapacityExhausted));
        // 失败的分配不留下任何索引项
        assert_eq!(cache.refcnt(1, 4), None);
        drop(held);
        assert!(cache.try_bread(1, 4).is_ok());
        assert_eq!(cache.check_index(), Ok(()));
    }

    #[test]
    #[should_panic(expected = "bget: no usable buffer")]
    fn bread_panics_when_every_buffer_is_in_use() {
        let cache = small();
        let _held: Vec<_> = (1..=3).map(|blockno| cache.bread(1, blockno)).collect();
        cache.bread(1, 4);
    }

    #[test]
    fn bwrite_persists_across_eviction() {
        let cache = small();
        let mut b = cache.bread(1, 1);
        b.data_mut()[0] = 7;
        b.data_mut()[BSIZE - 1] = 9;
        b.bwrite();
        drop(b);

        let mut on_disk = [0u8; BSIZE];
        cache.disk().copy_block(1, 1, &mut on_disk);
        assert_eq!((on_disk[0], on_disk[BSIZE - 1]), (7, 9));
        assert_eq!(cache.disk().writes(), 1);

        for blockno in 2..=4 {
            cache.bread(1, blockno).brelse();
        }
        assert_eq!(cache.refcnt(1, 1), None);

        let b = cache.bread(1, 1);
        assert_eq!((b.data()[0], b.data()[BSIZE - 1]), (7, 9));
        drop(b);
        assert_eq!(cache.stat().writes, 1);
        assert_eq!(cache.disk().reads(), 5);
    }

    #[test]
    fn pinned_block_stays_resident() {
        let cache = small();
        let b = cache.bread(1, 1);
        b.pin();
        drop(b);
        assert_eq!(cache.refcnt(1, 1), Some(1));

        for blockno in 2..=6 {
            cache.bread(1, blockno).brelse();
        }
        assert_eq!(cache.refcnt(1, 1), Some(1));

        // 钉住的块不算空闲缓冲块
        let held: Vec<_> = (2..=3).map(|blockno| cache.bread(1, blockno)).collect();
        assert_eq!(cache.try_bread(1, 9).err(), Some(BioError::CapacityExhausted));
        drop(held);

        let reads = cache.disk().reads();
        let b = cache.bread(1, 1);
        assert_eq!(cache.disk().reads(), reads);
        b.unpin();
        drop(b);
        assert_eq!(cache.refcnt(1, 1), Some(0));
        assert_eq!(cache.check_index(), Ok(()));
    }

    #[test]
    #[should_panic(expected = "bunpin: buffer not pinned")]
    fn unpin_without_pin_panics() {
        let cache = small();
        let b = cache.bread(1, 1);
        b.unpin();
    }

    #[test]
    fn waiter_shares_buffer_with_holder() {
        let cache = small();
        let mut b = cache.bread(1, 5);
        let index = b.index();

        thread::scope(|s| {
            let waiter = s.spawn(|| {
                let b = cache.bread(1, 5);
                (b.index(), b.data()[0])
            });

            // 等待者已经拿到引用，正阻塞在睡眠锁上
            while cache.refcnt(1, 5) != Some(2) {
                thread::yield_now();
            }
            b.data_mut()[0] = 42;
            drop(b);

            assert_eq!(waiter.join().unwrap(), (index, 42));
        });

        assert_eq!(cache.refcnt(1, 5), Some(0));
        assert_eq!(cache.disk().reads(), 1);
    }

    #[test]
    fn racing_misses_read_the_disk_once() {
        let cache: Small = Bcache::new(RamDisk::new(16).with_latency(200), LogicalClock::new());
        let barrier = Barrier::new(2);

        let indexes: Vec<usize> = thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let (cache, barrier) = (&cache, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        cache.bread(1, 5).index()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(indexes[0], indexes[1]);
        assert_eq!(cache.disk().reads(), 1);
        assert_eq!(cache.refcnt(1, 5), Some(0));
        assert_eq!(cache.check_index(), Ok(()));
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        const THREADS: u64 = 4;
        const ROUNDS: usize = 200;
        const BLOCKS: u32 = 16;

        let cache: Bcache<RamDisk, LogicalClock, 8, 3> =
            Bcache::new(RamDisk::new(BLOCKS).with_latency(2), LogicalClock::new());

        let counts: Vec<Vec<u32>> = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|seed| {
                    let cache = &cache;
                    s.spawn(move || {
                        let mut rng = StdRng::seed_from_u64(seed);
                        let mut counts = std::vec![0u32; BLOCKS as usize];
                        for _ in 0..ROUNDS {
                            let blockno = rng.gen_range(0..BLOCKS);
                            let mut b = cache.bread(1, blockno);
                            let n = read_u32(&b) + 1;
                            b.data_mut()[..4].copy_from_slice(&n.to_le_bytes());
                            b.bwrite();
                            drop(b);
                            counts[blockno as usize] += 1;
                        }
                        counts
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut total = 0;
        for blockno in 0..BLOCKS {
            let expected: u32 = counts.iter().map(|c| c[blockno as usize]).sum();
            let mut on_disk = [0u8; BSIZE];
            cache.disk().copy_block(1, blockno, &mut on_disk);
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&on_disk[..4]);
            assert_eq!(u32::from_le_bytes(bytes), expected, "block {}", blockno);
            total += expected;
        }
        assert_eq!(total as usize, THREADS as usize * ROUNDS);
        assert_eq!(cache.stat().writes, THREADS as usize * ROUNDS);
        assert_eq!(cache.check_index(), Ok(()));
        for blockno in 0..BLOCKS {
            assert!(matches!(cache.refcnt(1, blockno), None | Some(0)));
        }
    }
}
