use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pipeline_core::{
    DataDecoding, DataLoading, Image, LoadingError, Pipeline, PipelineCollaborators,
    PipelineConfig, ProgressSink, Request, ResponseMetadata,
};
use tokio_util::sync::CancellationToken;

// Trivial loader backed by an in-memory table, standing in for whatever
// network client a real caller would supply.
struct StaticLoader {
    bytes_by_url: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl DataLoading for StaticLoader {
    async fn load(
        &self,
        request: &Request,
        progress: ProgressSink,
        _cancel: CancellationToken,
    ) -> Result<(Vec<u8>, ResponseMetadata), LoadingError> {
        let bytes = self
            .bytes_by_url
            .get(&request.url)
            .cloned()
            .ok_or_else(|| LoadingError::from_message(format!("no such url: {}", request.url)))?;
        progress.tick(bytes.len() as u64, bytes.len() as u64);
        Ok((bytes, ResponseMetadata { content_type: Some("image/raw".into()), byte_len: Some(bytes.len() as u64) }))
    }
}

// Decoder that treats every byte as a single greyscale pixel in a square
// image, just enough structure to exercise the pipeline end to end.
struct SquareDecoder;

#[async_trait]
impl DataDecoding for SquareDecoder {
    async fn decode(&self, bytes: &[u8], _response: &ResponseMetadata) -> Option<Image> {
        let side = (bytes.len() as f64).sqrt() as u32;
        if side == 0 {
            return None;
        }
        Some(Image::new(side, side, side, bytes.to_vec()))
    }
}

#[tokio::main]
async fn main() {
    let mut bytes_by_url = HashMap::new();
    bytes_by_url.insert("https://example.com/odyssey.raw".to_owned(), vec![1u8; 64]);
    bytes_by_url.insert("https://example.com/samurai.raw".to_owned(), vec![2u8; 16]);

    let pipeline = Pipeline::new(
        PipelineCollaborators {
            data_loader: Arc::new(StaticLoader { bytes_by_url }),
            decoder: Arc::new(SquareDecoder),
            disk_cache: None,
        },
        PipelineConfig::default(),
    );

    let result = Arc::new(Mutex::new(None));
    let result_for_completion = result.clone();
    let task = pipeline.manager.make_task(
        Request::new("https://example.com/samurai.raw"),
        None,
        Some(Box::new(move |outcome| {
            *result_for_completion.lock().unwrap() = Some(outcome);
        })),
    );

    task.resume();
    while result.lock().unwrap().is_none() {
        tokio::task::yield_now().await;
    }

    match result.lock().unwrap().take().unwrap() {
        Ok(image) => println!("decoded a {}x{} image", image.width(), image.height()),
        Err(err) => println!("load failed: {err}"),
    }

    // A request for a URL never registered with the loader fails cleanly
    // rather than panicking.
    let missing = Arc::new(Mutex::new(None));
    let missing_for_completion = missing.clone();
    let missing_task = pipeline.manager.make_task(
        Request::new("https://example.com/missing.raw"),
        None,
        Some(Box::new(move |outcome| {
            *missing_for_completion.lock().unwrap() = Some(outcome);
        })),
    );
    missing_task.resume();
    while missing.lock().unwrap().is_none() {
        tokio::task::yield_now().await;
    }
    assert!(missing.lock().unwrap().as_ref().unwrap().is_err());
}
