//! Communication substrate interface.
//!
//! The engine consumes a small set of reliable, ordered-per-communicator
//! primitives: point-to-point send/receive plus the collectives built from
//! them (broadcast, all-gather, reduce-scatter, all-to-all). [`Comm`] names
//! exactly that contract; distributed entities are generic over it so the
//! substrate stays swappable.
//!
//! Two backends are provided: [`SelfComm`], the trivial single-rank
//! communicator, and [`ThreadComm`], an in-process multi-rank backend that
//! runs one rank per thread over shared mailboxes. The latter is what the
//! test suite uses to stand up real 2x2 and 2x3 grids inside one process.
//!
//! All collective calls block until the caller's local role completes, and
//! all ranks of a communicator must issue collectives in the same program
//! order; a mismatched collective deadlocks the group, which is treated as a
//! programming error rather than a runtime condition.

use std::collections::{HashMap, VecDeque};
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Bound for values that can cross a communicator.
pub trait Wire: Serialize + DeserializeOwned + Send + 'static {}
impl<T: Serialize + DeserializeOwned + Send + 'static> Wire for T {}

fn encode<T: Wire>(buf: &[T]) -> Vec<u8> {
    bincode::serialize(buf).expect("bincode serialization cannot fail for wire types")
}

fn decode<T: Wire>(bytes: &[u8]) -> Vec<T> {
    bincode::deserialize(bytes).expect("received malformed message")
}

/// A communicator: a fixed, ordered group of cooperating processes.
///
/// The collectives all have default implementations in terms of buffered
/// `send`/`recv`, so a backend only has to supply the point-to-point layer,
/// its own identity, and `split`.
pub trait Comm: Send + Sized + 'static {
    /// This process's rank within the communicator, in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of processes in the communicator.
    fn size(&self) -> usize;

    /// Collectively partition the communicator: callers with equal `color`
    /// form a new communicator, ranked by `(key, old rank)`.
    fn split(&self, color: usize, key: usize) -> Self;

    /// Buffered send; never blocks on the receiver.
    fn send<T: Wire>(&self, dst: usize, buf: &[T]);

    /// Receive the next message from `src`, blocking until it arrives.
    fn recv<T: Wire>(&self, src: usize) -> Vec<T>;

    /// Block until every rank has entered the barrier.
    fn barrier(&self) {
        let me = self.rank();
        if self.size() == 1 {
            return;
        }
        if me == 0 {
            for p in 1..self.size() {
                let _: Vec<u8> = self.recv(p);
            }
            for p in 1..self.size() {
                self.send::<u8>(p, &[]);
            }
        } else {
            self.send::<u8>(0, &[]);
            let _: Vec<u8> = self.recv(0);
        }
    }

    /// Simultaneous exchange with one partner. The send and receive sizes may
    /// differ; each side posts its send before blocking on the receive.
    fn send_recv<T: Wire>(&self, partner: usize, buf: &[T]) -> Vec<T> {
        if partner == self.rank() {
            return decode(&encode(buf));
        }
        self.send(partner, buf);
        self.recv(partner)
    }

    /// Root's buffer delivered to every rank; non-roots pass anything.
    fn broadcast<T: Wire>(&self, root: usize, buf: &[T]) -> Vec<T> {
        if self.rank() == root {
            for p in 0..self.size() {
                if p != root {
                    self.send(p, buf);
                }
            }
            decode(&encode(buf))
        } else {
            self.recv(root)
        }
    }

    /// Every rank's buffer gathered everywhere, indexed by rank.
    fn all_gather<T: Wire>(&self, local: &[T]) -> Vec<Vec<T>> {
        let me = self.rank();
        for p in 0..self.size() {
            if p != me {
                self.send(p, local);
            }
        }
        let mut out = Vec::with_capacity(self.size());
        for p in 0..self.size() {
            if p == me {
                out.push(decode(&encode(local)));
            } else {
                out.push(self.recv(p));
            }
        }
        out
    }

    /// Element-wise sum of per-destination blocks: rank `p` receives the sum
    /// over all ranks of their `blocks[p]`. Every rank's block for a given
    /// destination must have the same length.
    fn reduce_scatter<T: Wire + Add<Output = T> + Copy>(&self, blocks: Vec<Vec<T>>) -> Vec<T> {
        let me = self.rank();
        assert_eq!(blocks.len(), self.size(), "one block per destination rank");
        let mut blocks = blocks;
        for (p, block) in blocks.iter().enumerate() {
            if p != me {
                self.send(p, block);
            }
        }
        let mut acc = std::mem::take(&mut blocks[me]);
        for p in 0..self.size() {
            if p == me {
                continue;
            }
            let part: Vec<T> = self.recv(p);
            assert_eq!(part.len(), acc.len(), "mismatched reduce-scatter block");
            for (a, b) in acc.iter_mut().zip(part) {
                *a = *a + b;
            }
        }
        acc
    }

    /// Personalized exchange: rank `p` receives every rank's `bufs[p]`,
    /// indexed by source rank.
    fn all_to_all<T: Wire>(&self, bufs: Vec<Vec<T>>) -> Vec<Vec<T>> {
        let me = self.rank();
        assert_eq!(bufs.len(), self.size(), "one buffer per destination rank");
        let mut bufs = bufs;
        for (p, buf) in bufs.iter().enumerate() {
            if p != me {
                self.send(p, buf);
            }
        }
        let mut out = Vec::with_capacity(self.size());
        for p in 0..self.size() {
            if p == me {
                out.push(std::mem::take(&mut bufs[me]));
            } else {
                out.push(self.recv(p));
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Single-rank communicator
// ---------------------------------------------------------------------------

/// The trivial communicator: one rank, all exchanges are local.
pub struct SelfComm {
    loopback: Mutex<VecDeque<Vec<u8>>>,
}

impl SelfComm {
    pub fn new() -> Self {
        SelfComm {
            loopback: Mutex::new(VecDeque::new()),
        }
    }
}

impl Default for SelfComm {
    fn default() -> Self {
        Self::new()
    }
}

impl Comm for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn split(&self, _color: usize, _key: usize) -> Self {
        SelfComm::new()
    }

    fn send<T: Wire>(&self, dst: usize, buf: &[T]) {
        assert_eq!(dst, 0, "single-rank communicator");
        self.loopback.lock().push_back(encode(buf));
    }

    fn recv<T: Wire>(&self, src: usize) -> Vec<T> {
        assert_eq!(src, 0, "single-rank communicator");
        let bytes = self
            .loopback
            .lock()
            .pop_front()
            .expect("receive posted with no matching send");
        decode(&bytes)
    }
}

// ---------------------------------------------------------------------------
// In-process multi-rank communicator
// ---------------------------------------------------------------------------

struct Mailbox {
    slots: Mutex<HashMap<(usize, u64), Vec<u8>>>,
    arrival: Condvar,
}

impl Mailbox {
    fn new() -> Self {
        Mailbox {
            slots: Mutex::new(HashMap::new()),
            arrival: Condvar::new(),
        }
    }
}

struct SplitSlot {
    entries: Vec<Option<(usize, usize)>>,
    arrived: usize,
    taken: usize,
    results: Vec<Option<(Arc<CommCore>, usize)>>,
}

struct CommCore {
    size: usize,
    boxes: Vec<Mailbox>,
    splits: Mutex<HashMap<u64, SplitSlot>>,
    split_done: Condvar,
}

impl CommCore {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(CommCore {
            size,
            boxes: (0..size).map(|_| Mailbox::new()).collect(),
            splits: Mutex::new(HashMap::new()),
            split_done: Condvar::new(),
        })
    }
}

/// One rank's handle on an in-process communicator.
///
/// Messages are bincode-encoded into per-destination mailboxes; a per-pair
/// sequence number keyed into the mailbox preserves FIFO order per source, so
/// collectives issued in the same program order by all ranks match up without
/// tags.
pub struct ThreadComm {
    rank: usize,
    core: Arc<CommCore>,
    send_seq: Vec<AtomicU64>,
    recv_seq: Vec<AtomicU64>,
    split_seq: AtomicU64,
}

impl ThreadComm {
    fn from_core(core: Arc<CommCore>, rank: usize) -> Self {
        let size = core.size;
        ThreadComm {
            rank,
            core,
            send_seq: (0..size).map(|_| AtomicU64::new(0)).collect(),
            recv_seq: (0..size).map(|_| AtomicU64::new(0)).collect(),
            split_seq: AtomicU64::new(0),
        }
    }

    /// Create the handles for a world of `size` ranks, indexed by rank.
    pub fn world(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "world needs at least one rank");
        let core = CommCore::new(size);
        (0..size)
            .map(|rank| ThreadComm::from_core(Arc::clone(&core), rank))
            .collect()
    }
}

impl Comm for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.core.size
    }

    fn send<T: Wire>(&self, dst: usize, buf: &[T]) {
        let seq = self.send_seq[dst].fetch_add(1, Ordering::Relaxed);
        let mailbox = &self.core.boxes[dst];
        mailbox.slots.lock().insert((self.rank, seq), encode(buf));
        mailbox.arrival.notify_all();
    }

    fn recv<T: Wire>(&self, src: usize) -> Vec<T> {
        let seq = self.recv_seq[src].fetch_add(1, Ordering::Relaxed);
        let mailbox = &self.core.boxes[self.rank];
        let mut slots = mailbox.slots.lock();
        loop {
            if let Some(bytes) = slots.remove(&(src, seq)) {
                return decode(&bytes);
            }
            mailbox.arrival.wait(&mut slots);
        }
    }

    fn split(&self, color: usize, key: usize) -> Self {
        let id = self.split_seq.fetch_add(1, Ordering::Relaxed);
        let size = self.core.size;
        let mut table = self.core.splits.lock();
        {
            let slot = table.entry(id).or_insert_with(|| SplitSlot {
                entries: vec![None; size],
                arrived: 0,
                taken: 0,
                results: (0..size).map(|_| None).collect(),
            });
            slot.entries[self.rank] = Some((color, key));
            slot.arrived += 1;
            if slot.arrived == size {
                // Last arrival forms the groups and allocates their cores.
                let mut by_color: HashMap<usize, Vec<(usize, usize)>> = HashMap::new();
                for (rank, entry) in slot.entries.iter().enumerate() {
                    let (color, key) = entry.expect("all ranks arrived");
                    by_color.entry(color).or_default().push((key, rank));
                }
                for members in by_color.values_mut() {
                    members.sort();
                    let core = CommCore::new(members.len());
                    for (new_rank, &(_, old_rank)) in members.iter().enumerate() {
                        slot.results[old_rank] = Some((Arc::clone(&core), new_rank));
                    }
                }
                self.core.split_done.notify_all();
            }
        }
        loop {
            if table
                .get(&id)
                .map(|slot| slot.results[self.rank].is_some())
                .unwrap_or(false)
            {
                break;
            }
            self.core.split_done.wait(&mut table);
        }
        let slot = table.get_mut(&id).expect("split slot present until taken");
        let (core, new_rank) = slot.results[self.rank].take().expect("result computed");
        slot.taken += 1;
        if slot.taken == size {
            table.remove(&id);
        }
        drop(table);
        ThreadComm::from_core(core, new_rank)
    }
}

/// Run `body` once per rank of a fresh in-process world, one thread per rank,
/// and propagate any panic after all threads have been joined.
pub fn run_threaded<F>(size: usize, body: F)
where
    F: Fn(ThreadComm) + Send + Sync,
{
    let handles = ThreadComm::world(size);
    std::thread::scope(|scope| {
        let body = &body;
        for comm in handles {
            scope.spawn(move || body(comm));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_recv_roundtrip() {
        run_threaded(2, |comm| {
            if comm.rank() == 0 {
                comm.send(1, &[1.0f64, 2.0, 3.0]);
            } else {
                let got: Vec<f64> = comm.recv(0);
                assert_eq!(got, vec![1.0, 2.0, 3.0]);
            }
        });
    }

    #[test]
    fn messages_keep_per_source_order() {
        run_threaded(2, |comm| {
            if comm.rank() == 0 {
                comm.send(1, &[10u64]);
                comm.send(1, &[20u64]);
                comm.send(1, &[30u64]);
            } else {
                assert_eq!(comm.recv::<u64>(0), vec![10]);
                assert_eq!(comm.recv::<u64>(0), vec![20]);
                assert_eq!(comm.recv::<u64>(0), vec![30]);
            }
        });
    }

    #[test]
    fn broadcast_delivers_root_buffer() {
        run_threaded(3, |comm| {
            let mine = if comm.rank() == 1 {
                vec![4u32, 5, 6]
            } else {
                Vec::new()
            };
            assert_eq!(comm.broadcast(1, &mine), vec![4, 5, 6]);
        });
    }

    #[test]
    fn all_gather_collects_in_rank_order() {
        run_threaded(4, |comm| {
            let me = comm.rank();
            let gathered = comm.all_gather(&[me, me * 10]);
            for p in 0..4 {
                assert_eq!(gathered[p], vec![p, p * 10]);
            }
        });
    }

    #[test]
    fn reduce_scatter_sums_per_destination() {
        run_threaded(3, |comm| {
            let me = comm.rank() as i64;
            // Rank s sends block [s + p, s - p] to destination p.
            let blocks: Vec<Vec<i64>> = (0..3).map(|p| vec![me + p, me - p]).collect();
            let got = comm.reduce_scatter(blocks);
            let p = comm.rank() as i64;
            // Sum over s of [s + p, s - p] for s in 0..3.
            assert_eq!(got, vec![3 + 3 * p, 3 - 3 * p]);
        });
    }

    #[test]
    fn all_to_all_is_personalized() {
        run_threaded(3, |comm| {
            let me = comm.rank();
            let bufs: Vec<Vec<usize>> = (0..3).map(|p| vec![me * 100 + p]).collect();
            let got = comm.all_to_all(bufs);
            for s in 0..3 {
                assert_eq!(got[s], vec![s * 100 + me]);
            }
        });
    }

    #[test]
    fn send_recv_pair_with_unequal_sizes() {
        run_threaded(2, |comm| {
            let me = comm.rank();
            let mine: Vec<u32> = (0..(me + 1) * 2).map(|x| x as u32).collect();
            let theirs = comm.send_recv(1 - me, &mine);
            assert_eq!(theirs.len(), (2 - me) * 2);
        });
    }

    #[test]
    fn split_forms_row_groups() {
        run_threaded(6, |comm| {
            // 2x3 grid in column-major rank order: row = rank % 2, col = rank / 2.
            let row = comm.rank() % 2;
            let col = comm.rank() / 2;
            let row_comm = comm.split(row, col);
            assert_eq!(row_comm.size(), 3);
            assert_eq!(row_comm.rank(), col);
            let gathered = row_comm.all_gather(&[comm.rank()]);
            let expect: Vec<Vec<usize>> = (0..3).map(|c| vec![row + 2 * c]).collect();
            assert_eq!(gathered, expect);
        });
    }

    #[test]
    fn self_comm_collectives_are_local() {
        let comm = SelfComm::new();
        assert_eq!(comm.all_gather(&[7u8]), vec![vec![7u8]]);
        assert_eq!(comm.all_to_all(vec![vec![1i32, 2]]), vec![vec![1, 2]]);
        assert_eq!(comm.reduce_scatter(vec![vec![5.0f64]]), vec![5.0]);
        comm.barrier();
    }

    #[test]
    fn barrier_synchronizes() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let counter = AtomicUsize::new(0);
        run_threaded(4, |comm| {
            counter.fetch_add(1, Ordering::SeqCst);
            comm.barrier();
            assert_eq!(counter.load(Ordering::SeqCst), 4);
        });
    }
}
