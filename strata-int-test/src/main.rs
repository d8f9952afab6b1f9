use std::thread;
use strata::StrataResult;
use strata_int_test::test_util::{cleanup, create_test_context, random_cloud};

fn main() -> StrataResult<()> {
    println!("Starting stress test...");
    let ctx = create_test_context()?;
    let tree = ctx.tree();

    let threads = 4;
    let per_thread = 250_000;

    let start = std::time::Instant::now();
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let tree = tree.clone();
            thread::spawn(move || {
                let buffer = random_cloud(tree.schema(), tree.bounds(), per_thread, t);
                tree.insert(&buffer, t)
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap()?;
    }
    let stats = tree.stats();
    println!(
        "Inserted {} points ({} placed, {} exhausted) in {:?}",
        stats.num_points,
        stats.num_placed,
        stats.exhausted,
        start.elapsed()
    );
    println!(
        "Chunk cache: {:.1}% hits, {} reads, {} writes",
        stats.chunks.hit_rate() * 100.0,
        stats.chunks.chunk_reads,
        stats.chunks.chunk_writes
    );

    let start = std::time::Instant::now();
    tree.save()?;
    println!("Saved in {:?}", start.elapsed());

    let start = std::time::Instant::now();
    let coarse = tree.get_points(0, 4)?;
    println!("Queried {} coarse points in {:?}", coarse.len(), start.elapsed());

    let start = std::time::Instant::now();
    let all = tree.get_points(0, tree.config().depths.disk)?;
    println!("Queried all {} points in {:?}", all.len(), start.elapsed());

    drop(tree);
    cleanup(ctx)
}
