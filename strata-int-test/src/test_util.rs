use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::backtrace::Backtrace;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{env, fs, thread};
use strata::{BBox, PointBuffer, Schema, StrataResult, Tree};

/// Runs a test with retry logic and error handling.
/// Tests run on the current thread to avoid thread exhaustion when running many tests in parallel.
pub fn run_test<T, B, A>(before: B, test: T, after: A)
where
    T: Fn(TestContext) -> StrataResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    B: Fn() -> StrataResult<TestContext> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    A: Fn(TestContext) -> StrataResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
{
    const MAX_RETRIES: u32 = 3;
    let mut last_error: Option<String> = None;
    let mut last_backtrace: Option<String> = None;

    for attempt in 1..=MAX_RETRIES {
        let start_time = Instant::now();

        let result = std::panic::catch_unwind(|| {
            let backtrace = Backtrace::capture();
            match before() {
                Ok(ctx) => match test(ctx.clone()) {
                    Ok(_) => match after(ctx) {
                        Ok(_) => Ok(()),
                        Err(e) => Err((
                            format!("After run failed: {:?}", e),
                            backtrace.to_string(),
                        )),
                    },
                    Err(e) => {
                        let _ = after(ctx);
                        Err((format!("Test failed: {:?}", e), backtrace.to_string()))
                    }
                },
                Err(e) => Err((format!("Before run failed: {:?}", e), backtrace.to_string())),
            }
        });

        let elapsed = start_time.elapsed();

        match result {
            Ok(Ok(_)) => return,
            Ok(Err((e, bt))) => {
                last_error = Some(e.clone());
                last_backtrace = Some(bt);
                if attempt < MAX_RETRIES {
                    eprintln!(
                        "\n========== Test Attempt {}/{} Failed (took {:?}) ==========",
                        attempt, MAX_RETRIES, elapsed
                    );
                    eprintln!("Error: {}", e);
                    eprintln!("Retrying in {}ms...\n", 100 * attempt);
                    thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
            }
            Err(panic_err) => {
                let err_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };

                last_error = Some(format!("Panic: {}", err_msg));
                last_backtrace = Some(Backtrace::capture().to_string());

                if attempt < MAX_RETRIES {
                    eprintln!(
                        "\n========== Test Attempt {}/{} Panicked (took {:?}) ==========",
                        attempt, MAX_RETRIES, elapsed
                    );
                    eprintln!("Panic: {}", err_msg);
                    eprintln!("Retrying in {}ms...\n", 100 * attempt);
                    thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
            }
        }
    }

    eprintln!("\n==================== TEST FAILED ====================");
    eprintln!("Failed after {} attempts", MAX_RETRIES);
    eprintln!("Last error: {}", last_error.as_deref().unwrap_or("Unknown"));
    if let Some(bt) = &last_backtrace {
        if !bt.is_empty() && !bt.contains("disabled") {
            eprintln!("\nBacktrace:\n{}", bt);
        }
    }
    eprintln!("=====================================================\n");

    panic!(
        "Test failed after {} attempts. Last error: {}",
        MAX_RETRIES,
        last_error.unwrap_or_default()
    );
}

#[derive(Clone)]
pub struct TestContext {
    path: String,
    tree: Tree,
}

impl TestContext {
    pub fn new(path: String, tree: Tree) -> Self {
        Self { path, tree }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tree(&self) -> Tree {
        self.tree.clone()
    }
}

pub fn random_path() -> String {
    let id = uuid::Uuid::new_v4();
    let temp_dir = env::temp_dir();
    temp_dir.join(id.to_string()).to_str().unwrap().to_string()
}

/// Octree over a 1000 x 1000 x 100 box, depths (2, 4, 8).
pub fn create_test_context() -> StrataResult<TestContext> {
    let path = random_path();
    // Use low_memory_preset for tests so paged chunks get evicted and reloaded
    let tree = Tree::builder()
        .dir(&path)
        .bounds(BBox::new_3d(0.0, 0.0, 0.0, 1000.0, 1000.0, 100.0))
        .schema(Schema::xyz())
        .depths(2, 4, 8)
        .low_memory_preset()
        .chunk_points(64)
        .cache_chunks(8)
        .create()?;
    Ok(TestContext::new(path, tree))
}

/// Quadtree over a 100 x 100 square with one branch per tier: depths
/// [0, 1), [1, 2) and [2, 4).
pub fn create_quadtree_context() -> StrataResult<TestContext> {
    let path = random_path();
    let tree = Tree::builder()
        .dir(&path)
        .bounds(BBox::new_2d(0.0, 0.0, 100.0, 100.0))
        .schema(Schema::xyz())
        .depths(0, 2, 4)
        .low_memory_preset()
        .chunk_points(16)
        .cache_chunks(2)
        .create()?;
    Ok(TestContext::new(path, tree))
}

/// Uniformly random samples inside `bounds`.
pub fn random_cloud(schema: &Arc<Schema>, bounds: &BBox, size: usize, seed: u64) -> PointBuffer {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buffer = PointBuffer::new(Arc::clone(schema));
    let (min, max) = (bounds.min(), bounds.max());
    for _ in 0..size {
        let x = rng.gen_range(min.x..=max.x);
        let y = rng.gen_range(min.y..=max.y);
        let z = if max.z > min.z {
            rng.gen_range(min.z..=max.z)
        } else {
            min.z
        };
        buffer.push(&[x, y, z]).unwrap();
    }
    buffer
}

/// Packs explicit `(x, y, z)` samples.
pub fn cloud_of(schema: &Arc<Schema>, points: &[(f64, f64, f64)]) -> PointBuffer {
    let mut buffer = PointBuffer::new(Arc::clone(schema));
    for (x, y, z) in points {
        buffer.push(&[*x, *y, *z]).unwrap();
    }
    buffer
}

pub fn cleanup(ctx: TestContext) -> StrataResult<()> {
    let path = ctx.path().to_string();
    // Release mapped files and chunk handles before removing the directory
    drop(ctx);

    let max_retries = 5;
    for retry in 0..max_retries {
        if !Path::new(&path).exists() {
            return Ok(());
        }
        match fs::remove_dir_all(&path) {
            Ok(_) => return Ok(()),
            Err(e) if retry < max_retries - 1 => {
                eprintln!(
                    "Warning: Failed to remove {} (attempt {}): {:?}",
                    path,
                    retry + 1,
                    e
                );
                thread::sleep(Duration::from_millis(50 * (retry as u64 + 1)));
            }
            Err(e) => {
                eprintln!("Warning: Giving up on removing {}: {:?}", path, e);
            }
        }
    }
    Ok(())
}
