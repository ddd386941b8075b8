//! Example: One locked writer and many concurrent readers on a shared dataset
//!
//! Run with: cargo run --example concurrent_sessions

use anyhow::Result;
use futures::future::try_join_all;
use idxstore::types::{DType, DataType};
use idxstore::{AccessConfig, AccessMode, Dataset, Descriptor, Field, IdxError, LogicBox, ReadRequest};
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    println!("idxstore: concurrent sessions");
    println!("=============================\n");

    let temp_dir = tempfile::tempdir()?;
    let url = temp_dir.path().to_string_lossy().to_string();

    let full = LogicBox::from_dims(&[512, 512])?;
    let descriptor = Descriptor::create(
        full.clone(),
        vec![Field::new("height", DType::scalar(DataType::U16))],
        &[64, 64],
    )?;
    let dataset = Dataset::create(&url, descriptor, AccessConfig::default()).await?;

    // a writer holds the dataset lock for its lifetime
    let mut writer = dataset.access(AccessMode::Write).await?;
    println!("writer exclusive: {}", writer.is_exclusive());

    let other = Dataset::open(&url, AccessConfig::default()).await?;
    match other.access(AccessMode::Write).await {
        Err(IdxError::AlreadyLocked(lock)) => println!("second writer refused: {} is held", lock),
        Err(e) => return Err(e.into()),
        Ok(_) => println!("second writer unexpectedly got the lock"),
    }

    let mut rows = Vec::with_capacity(512 * 512 * 2);
    for y in 0..512u32 {
        for x in 0..512u32 {
            rows.extend_from_slice(&(((x * x + y * y) / 64) as u16).to_le_bytes());
        }
    }
    dataset.write_with(&writer, &full, &rows, None, 0).await?;
    writer.close()?;
    println!("writer closed, lock released\n");

    // readers share nothing but the handle; each task has its own session
    let start = Instant::now();
    let tasks = (0..8i64).map(|i| {
        let dataset = other.clone();
        tokio::spawn(async move {
            let region = LogicBox::new(vec![i * 64, 0], vec![i * 64 + 64, 512])?;
            let result = dataset
                .read(ReadRequest::new().with_region(region).with_max_samples(2048))
                .await?;
            Ok::<_, IdxError>((i, result.level, result.dims))
        })
    });
    for joined in try_join_all(tasks).await? {
        let (i, level, dims) = joined?;
        println!("reader {}: level {} dims {:?}", i, level, dims);
    }
    println!("\n8 readers finished in {:.1?}", start.elapsed());

    Ok(())
}
