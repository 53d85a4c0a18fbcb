//! Offline index builder: embedded chunks in, published index/metadata pair
//! out. Shares data types with the server but never its process state.

use archivist::{
    artifacts::ArtifactStore,
    chunk,
    cli::{self, IndexCli},
    data_dir::DataDir,
    error,
    index,
};
use clap::Parser;
use serde::Serialize;

#[derive(Serialize)]
struct BuildSummary {
    generation: String,
    vectors: usize,
    dimension: usize,
    index: String,
    metadata: String,
}

fn main() -> error::Result<()> {
    let cli = IndexCli::parse();
    cli::init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let store = ArtifactStore::new(data_dir.index_dir()?);

    let chunks = chunk::read_embedded_chunks(&cli.input)?;
    tracing::info!(chunks = chunks.len(), input = %cli.input.display(), "read embedded chunks");

    let (index, metadata) = index::build(chunks)?;
    let paths = store.publish(&index, &metadata, cli.keep as usize)?;

    let summary = BuildSummary {
        generation: paths.generation,
        vectors: index.len(),
        dimension: index.dimension(),
        index: paths.index.display().to_string(),
        metadata: paths.metadata.display().to_string(),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Published {} ({} vectors, dimension {})",
            summary.generation, summary.vectors, summary.dimension
        );
    }
    Ok(())
}
