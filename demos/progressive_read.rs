//! Example: Write a 3D field, read it back coarse-to-fine and recompress it
//!
//! Run with: cargo run --example progressive_read

use anyhow::Result;
use futures::TryStreamExt;
use idxstore::types::{samples_to_bytes, DType, DataType};
use idxstore::utils::format_bytes;
use idxstore::{
    AccessConfig, AccessMode, CodecSpec, Dataset, Descriptor, Field, LogicBox, QuantizeMode,
    QueryOptions,
};
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    println!("idxstore: progressive read");
    println!("==========================\n");

    let temp_dir = tempfile::tempdir()?;
    let url = format!("file://{}", temp_dir.path().display());

    let n = 128i64;
    let full = LogicBox::from_dims(&[n, n, n])?;
    let descriptor = Descriptor::create(
        full.clone(),
        vec![Field::new("pressure", DType::scalar(DataType::F32))
            .with_codec(CodecSpec::zstd())
            .with_description("synthetic smooth field")],
        &[32, 32, 32],
    )?
    .with_metadata("source", "progressive_read demo");

    let dataset = Dataset::create(&url, descriptor, AccessConfig::from_env()).await?;
    println!("{}", dataset.stats().summary());
    println!("bitmask {}\n", dataset.descriptor().bitmask);

    let mut values = Vec::with_capacity((n * n * n) as usize);
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                let (fx, fy, fz) = (x as f32 / 16.0, y as f32 / 16.0, z as f32 / 32.0);
                values.push(fx.sin() * fy.cos() * 100.0 + fz);
            }
        }
    }
    let start = Instant::now();
    let summary = dataset.write(&full, &samples_to_bytes(&values), None, 0).await?;
    println!(
        "Wrote {} blocks in {:.1?}\n",
        summary.blocks_written + summary.blocks_merged,
        start.elapsed()
    );

    // coarse-to-fine over a sub-box
    let region = LogicBox::new(vec![10, 20, 30], vec![100, 90, 80])?;
    let session = dataset.access(AccessMode::Read).await?;
    let query = dataset.create_box_query(
        None,
        0,
        region.clone(),
        QueryOptions::default().with_num_refinements(4),
    )?;

    println!("Refining {}:", region);
    let mut snapshots = Box::pin(query.stream(&session));
    while let Some(snapshot) = snapshots.try_next().await? {
        let p = &snapshot.progress;
        println!(
            "  level {:2}  dims {:?}  blocks {:3} read, {:3} missing  ({})",
            p.level,
            p.dims,
            p.blocks_read,
            p.blocks_missing,
            format_bytes(snapshot.buffer.len() as u64)
        );
    }
    let stats = session.cache_stats();
    println!(
        "Cache: {} hits, {} misses, {}\n",
        stats.hits,
        stats.misses,
        format_bytes(stats.memory_bytes)
    );
    drop(snapshots);
    drop(session);

    // offline recompression with a bounded error
    let codec = CodecSpec::Quantize(QuantizeMode::Accuracy(0.05));
    let report = dataset.compress_field("pressure", codec).await?;
    println!(
        "Recompressed '{}' with {}: {} blocks, {} -> {} ({:.2}x)",
        report.field,
        report.codec,
        report.blocks,
        format_bytes(report.stored_bytes_before),
        format_bytes(report.stored_bytes_after),
        report.ratio()
    );

    Ok(())
}
