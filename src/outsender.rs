use bytes::Bytes;
use tokio::sync::mpsc::Sender;

use crate::error::OutputError;

/// Chunk size handed to the output channels.
const CHUNK: usize = 64 * 1024;

pub struct OutputStreamSender {
    pub reliable: bool,
    pub tx: Sender<Bytes>,
}

/// copies
/// from: one track body
///   to: channels of Bytes in txbufs
pub async fn send_track(track: Bytes, txbufs: &mut [OutputStreamSender]) -> Result<(), OutputError> {
    let mut offset = 0;
    while offset < track.len() {
        let end = (offset + CHUNK).min(track.len());
        let chunk = track.slice(offset..end);
        offset = end;

        for out in txbufs.iter_mut() {
            if out.reliable {
                out.tx
                    .send(chunk.clone())
                    .await
                    .map_err(|_| OutputError::TrackSend)?;
            } else {
                // non-blocking
                let _r = out.tx.try_send(chunk.clone());
            }
        }
    }
    Ok(())
}
