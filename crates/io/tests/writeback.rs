//! Randomized interleaving of writes and reads against a model buffer.
//!
//! Reads race the writes that produced the bytes; the write-back cache must
//! serve any byte that has been submitted, whether or not it has landed on
//! the device yet.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use triedb_io::{
    make_buffers_for_segregated_read_write, AsyncIo, ChunkKind, StoragePool, READ_BUFFER_SIZE,
    WRITE_BUFFER_SIZE,
};
use triedb_types::ChunkOffset;

const PAGE: usize = 512;
const FILE_PAGES: usize = 512; // 256 KiB of model state
const MAX_CONCURRENCY: usize = 4;

#[test]
fn writeback_cache_random_interleaving() {
    let pool = StoragePool::anonymous(1, (FILE_PAGES * PAGE) as u64).unwrap();
    pool.activate_chunk(ChunkKind::Seq, 0);
    let buffers = make_buffers_for_segregated_read_write(
        MAX_CONCURRENCY,
        MAX_CONCURRENCY,
        READ_BUFFER_SIZE,
        WRITE_BUFFER_SIZE,
    );
    let io = AsyncIo::new(pool, buffers).unwrap();

    let mut rng = StdRng::seed_from_u64(0xcafe_f00d);
    let mut model = vec![0u8; FILE_PAGES * PAGE];
    let mut written_pages = 0usize;

    while written_pages < FILE_PAGES {
        // Write a burst of 1..4 pages of fresh random bytes.
        let burst = rng.gen_range(1..=4).min(FILE_PAGES - written_pages);
        for _ in 0..burst {
            let at = written_pages * PAGE;
            for b in &mut model[at..at + PAGE] {
                *b = rng.gen();
            }
            io.write(ChunkOffset::new(0, at as u32), &model[at..at + PAGE], None).unwrap();
            written_pages += 1;
        }
        // Immediately read random already-written ranges; some overlap the
        // in-flight burst and must come from the cache.
        for _ in 0..MAX_CONCURRENCY {
            let start_page = rng.gen_range(0..written_pages);
            let max_pages = (written_pages - start_page).min(8);
            let pages = rng.gen_range(1..=max_pages);
            let at = start_page * PAGE;
            let len = pages * PAGE;
            let got = io.read_blocking(ChunkOffset::new(0, at as u32), len).unwrap();
            assert_eq!(got, &model[at..at + len], "mismatch at page {start_page}");
        }
    }
    io.wait_until_done();

    // Everything is durable now; spot-check straight off the device path.
    for _ in 0..64 {
        let start_page = rng.gen_range(0..FILE_PAGES);
        let at = start_page * PAGE;
        let got = io.read_blocking(ChunkOffset::new(0, at as u32), PAGE).unwrap();
        assert_eq!(got, &model[at..at + PAGE]);
    }
}
