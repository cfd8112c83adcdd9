use std::{cell::RefCell, rc::Rc};

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use marshalplay::{
    args::{Command, MarshalplayArgs},
    ffplay::FFplayLocation,
    outsender::send_track,
    outwriter::{make_out_writers, make_outs},
    player::ordered_playback,
    CredentialBroker, FetchedAsset, GatedTrackSource, KeypairSigner, MarshalClient, MarshalConfig,
    MemoryBlobStore, PlaybackSequencer, PreaccessSource, SignatureCache, StreamRequestDescriptor,
    SystemClock, WalletSigner,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_tracing();
    let args = MarshalplayArgs::parse();
    let config = MarshalConfig::from_args(&args)?;

    let client = config.http_client()?;
    let marshal = MarshalClient::from_config(client.clone(), &config);

    let signer: Option<Rc<dyn WalletSigner>> = match &args.keypair {
        Some(path) => {
            let signer = KeypairSigner::from_file(path).await?;
            info!("wallet: {}", signer.address());
            Some(Rc::new(signer) as Rc<dyn WalletSigner>)
        }
        None => None,
    };
    let broker = Rc::new(CredentialBroker::new(
        SignatureCache::shared(config.credential_validity),
        Rc::new(marshal.clone()),
        signer,
        Rc::new(SystemClock),
    ));
    let ffplay_location = Rc::new(RefCell::new(FFplayLocation::NotChecked));

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            match args.command {
                Command::Preaccess => {
                    let nonce = marshal.preaccess().await?;
                    println!("{}", nonce);
                }
                Command::Fetch {
                    asset,
                    nested,
                    fwd_headers,
                    cache_seconds,
                    inline,
                    out,
                } => {
                    let mut descriptor =
                        StreamRequestDescriptor::new(asset.clone()).forward_headers(fwd_headers);
                    if let Some(idx) = nested {
                        descriptor = descriptor.nested(idx);
                    }
                    if let Some(secs) = cache_seconds {
                        descriptor = descriptor.cache_for(secs);
                    }
                    if inline {
                        descriptor = descriptor.inline();
                    }

                    let source = GatedTrackSource::new(broker.clone(), marshal.clone());
                    let asset_body = source.fetch(&descriptor, &CancellationToken::new()).await?;
                    match asset_body {
                        FetchedAsset::Json(value) => {
                            println!("{}", serde_json::to_string_pretty(&value)?);
                        }
                        FetchedAsset::Stream { content_type, mut stream } => {
                            info!("streaming {} ({:?})", asset, content_type);
                            let out_names = out.unwrap_or_else(|| vec!["out".into()]);
                            let copy_ended = Rc::new(RefCell::new(false));
                            let outs =
                                make_outs(&out_names, copy_ended.clone(), &asset, ffplay_location)
                                    .await?;
                            let (mut txbufs, copy_tasks) = make_out_writers(outs, copy_ended);

                            while let Some(chunk) = stream.next().await {
                                send_track(chunk?, &mut txbufs).await?;
                            }
                            drop(txbufs);
                            for task in copy_tasks {
                                let _ = task.await;
                            }
                        }
                    }
                }
                Command::Play {
                    asset,
                    tracks,
                    start,
                    limit,
                    out,
                } => {
                    // one wallet prompt up front, before the prefetch fan-out
                    broker
                        .get_or_refresh(false)
                        .await
                        .context("acquiring access credential")?;

                    let source = Rc::new(GatedTrackSource::new(broker.clone(), marshal.clone()));
                    let mut seq = PlaybackSequencer::new(
                        source,
                        Rc::new(MemoryBlobStore::new()),
                        config.prefetch_limit,
                    );
                    seq.load(&asset, tracks as usize, start as usize, None)?;

                    let out_names = out.unwrap_or_else(|| vec!["ffplay".into()]);
                    let copy_ended = Rc::new(RefCell::new(false));
                    let outs =
                        make_outs(&out_names, copy_ended.clone(), &asset, ffplay_location).await?;
                    let (mut txbufs, copy_tasks) = make_out_writers(outs, copy_ended.clone());

                    tokio::select! {
                        played = ordered_playback(&client, &mut seq, &mut txbufs, copy_ended, limit) => {
                            info!("played {} tracks", played?);
                        }
                        _ = tokio::signal::ctrl_c() => {
                            info!("interrupted");
                        }
                    }
                    seq.clear();
                    drop(txbufs);
                    for task in copy_tasks {
                        let _ = task.await;
                    }
                }
            }
            Ok::<(), anyhow::Error>(())
        })
        .await?;

    Ok(())
}
