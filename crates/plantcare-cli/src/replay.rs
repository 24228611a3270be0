//! Offline replay of a captured reply body through the segmenter.

use std::io::Write;
use std::path::Path;

use anyhow::Context as _;
use plantcare_chat::segmenter::{FinalState, SegmentDelta, StreamSegmenter};

use crate::render::write_plants;

/// Feeds `body` to a fresh segmenter in `chunk_size` pieces and prints every delta.
pub fn replay(body: &[u8], chunk_size: usize, out: &mut dyn Write) -> anyhow::Result<FinalState> {
    anyhow::ensure!(chunk_size > 0, "chunk size must be greater than 0");

    let mut segmenter = StreamSegmenter::new();
    let mut seq = 0_u64;
    for chunk in body.chunks(chunk_size) {
        for delta in segmenter.feed(chunk) {
            print_delta(seq, &delta, out)?;
            seq += 1;
        }
    }
    let state = segmenter.finish();
    for delta in &state.flushed {
        print_delta(seq, delta, out)?;
        seq += 1;
    }

    writeln!(out, "--")?;
    writeln!(out, "phase: {:?}", state.phase)?;
    writeln!(
        out,
        "plants: {}",
        state
            .plants
            .as_ref()
            .map_or_else(|| "none".to_string(), |p| p.len().to_string())
    )?;
    match &state.degradation {
        Some(degradation) => writeln!(out, "degraded: {degradation}")?,
        None => writeln!(out, "degraded: no")?,
    }
    Ok(state)
}

pub async fn replay_file(
    path: &Path,
    chunk_size: usize,
    out: &mut dyn Write,
) -> anyhow::Result<FinalState> {
    let body = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    replay(&body, chunk_size, out)
}

fn print_delta(seq: u64, delta: &SegmentDelta, out: &mut dyn Write) -> anyhow::Result<()> {
    match delta {
        SegmentDelta::Intro(text) => writeln!(out, "#{seq} intro {text:?}")?,
        SegmentDelta::JsonOpened => writeln!(out, "#{seq} json opened")?,
        SegmentDelta::Plants(plants) => {
            write!(out, "#{seq} plants")?;
            write_plants(plants, out)?;
        }
        SegmentDelta::Summary(text) => writeln!(out, "#{seq} summary {text:?}")?,
    }
    Ok(())
}
