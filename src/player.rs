use std::{cell::RefCell, rc::Rc, time::Duration};

use bytes::Bytes;
use tracing::{info, warn};

use crate::{
    outsender::{send_track, OutputStreamSender},
    sequencer::{PlaybackSequencer, PlaybackState, TrackSource},
};

/// How long to wait on a fetching track before logging again.
const TRACK_WAIT: Duration = Duration::from_millis(4000);

async fn track_body(
    client: &reqwest::Client,
    seq: &PlaybackSequencer,
    source: &TrackSource,
) -> Result<Bytes, anyhow::Error> {
    match source {
        TrackSource::Blob(url) => seq
            .blobs()
            .get(url)
            .map(|blob| blob.bytes)
            .ok_or_else(|| anyhow::anyhow!("blob {} is gone", url)),
        TrackSource::Provided(url) => {
            let res = client.get(url).send().await?.error_for_status()?;
            Ok(res.bytes().await?)
        }
    }
}

/// Writes tracks to the outputs in queue order, advancing the sequencer
/// after each one. Ends when an output closes, after `limit` tracks, or
/// when every track in the list has failed in a row.
pub async fn ordered_playback(
    client: &reqwest::Client,
    seq: &mut PlaybackSequencer,
    txbufs: &mut [OutputStreamSender],
    copy_ended: Rc<RefCell<bool>>,
    limit: Option<u32>,
) -> Result<u32, anyhow::Error> {
    let mut played: u32 = 0;
    let mut failed_in_row = 0;
    let mut state = seq.play();

    while !*copy_ended.borrow() {
        match state {
            PlaybackState::Playing { index, source } => {
                failed_in_row = 0;
                let body = track_body(client, seq, &source).await?;
                info!(asset = %seq.asset_id(), index, bytes = body.len(), "writing track");
                send_track(body, txbufs).await?;

                played += 1;
                if limit.is_some_and(|limit| played >= limit) {
                    break;
                }
                state = seq.track_finished();
            }
            PlaybackState::Waiting { index } => {
                if tokio::time::timeout(TRACK_WAIT, seq.wait_settled(index))
                    .await
                    .is_err()
                {
                    info!(index, "still waiting for track");
                }
                state = seq.play();
            }
            PlaybackState::Failed { index, message } => {
                warn!(index, "skipping track: {}", message);
                failed_in_row += 1;
                if failed_in_row >= seq.len() {
                    anyhow::bail!("no playable track: {}", message);
                }
                seq.dismiss_error();
                state = seq.track_finished();
            }
            PlaybackState::Stopped => break,
        }
    }

    Ok(played)
}
