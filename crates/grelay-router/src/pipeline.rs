//! Streaming pipeline: upstream body chunks → JSON records → SSE frames.

use bytes::Bytes;
use tokio::sync::mpsc;

use grelay_protocol::sse;
use grelay_translate::stream::{JsonObjectDecoder, StreamFrame, StreamTranslator};

const OUT_CHANNEL_CAPACITY: usize = 32;

/// Drives the chunker and the stream translator over the upstream body and
/// closes the output with exactly one `[DONE]` frame, whether the upstream
/// ended cleanly or not. Dropping the returned receiver stops the pipeline
/// and releases the upstream body.
pub fn spawn_stream_pipeline(
    mut upstream: mpsc::Receiver<Bytes>,
    model: String,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(OUT_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut decoder = JsonObjectDecoder::new();
        let mut translator = StreamTranslator::new(model);

        'outer: while let Some(chunk) = upstream.recv().await {
            for record in decoder.push(&chunk) {
                for frame in translator.translate_record(&record) {
                    if tx.send(frame_bytes(frame)).await.is_err() {
                        break 'outer;
                    }
                }
            }
        }
        decoder.finish();

        let _ = tx.send(sse::done_frame()).await;
    });

    rx
}

fn frame_bytes(frame: StreamFrame) -> Bytes {
    match frame {
        StreamFrame::Chunk(chunk) => {
            sse::json_frame(&*chunk).unwrap_or_else(|| sse::raw_frame(b"{}"))
        }
        StreamFrame::Passthrough(raw) => sse::raw_frame(raw.as_bytes()),
    }
}
