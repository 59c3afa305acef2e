//! Common helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use tidemerge::{
    backend::mem::MemBackend, EngineOption, Point, ReadSession, Tags, Window,
};

/// Tag set `{key: value}`.
pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Drain `window` with repeated `limit`-sized reads, returning every chunk.
pub async fn drain(
    session: &mut ReadSession<MemBackend>,
    window: Window,
    limit: usize,
) -> Vec<Vec<Point>> {
    let mut chunks = Vec::new();
    loop {
        let chunk = session.read(window, limit).await.expect("read chunk");
        assert!(chunk.points.len() <= limit, "chunk exceeds limit");
        let done = chunk.is_final();
        chunks.push(chunk.points);
        if done {
            return chunks;
        }
    }
}

/// Read session over `backend` with `option`.
pub fn session(backend: &Arc<MemBackend>, option: EngineOption) -> ReadSession<MemBackend> {
    ReadSession::new(Arc::clone(backend), option).expect("read session")
}

/// `(time, value)` pairs of `points`.
pub fn samples(points: &[Point]) -> Vec<(i64, f64)> {
    points
        .iter()
        .map(|point| (point.time.get(), point.value))
        .collect()
}
