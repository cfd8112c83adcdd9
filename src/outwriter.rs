use std::{cell::RefCell, rc::Rc};

use bytes::Bytes;
use tokio::{
    fs::File,
    io::{self, AsyncWrite, AsyncWriteExt},
    sync::mpsc::{self, Receiver},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    error::OutputError,
    ffplay::{spawn_ffplay, FFplayLocation},
    outsender::OutputStreamSender,
};

async fn copy_channel_to_out(
    mut rxbuf: Receiver<Bytes>,
    out: &mut AsyncOutput,
) -> Result<(), anyhow::Error> {
    loop {
        let msg = rxbuf.recv().await;
        match msg {
            Some(bytes) => {
                out.writer.write_all(&bytes).await?;
            }
            // channel closed
            None => {
                break;
            }
        }
        while let Ok(msg) = rxbuf.try_recv() {
            out.writer.write_all(&msg).await?;
        }
        out.writer.flush().await?;
    }
    Ok(())
}

/// Opens every named output: 'ffplay', 'out'/'stdout', 'stderr',
/// 'tcp:host:port', 'unix:/path' or a file path.
pub async fn make_outs(
    out_names: &[String],
    copy_ended: Rc<RefCell<bool>>,
    title: &str,
    ffplay_location: Rc<RefCell<FFplayLocation>>,
) -> Result<Vec<AsyncOutput>, anyhow::Error> {
    let mut outs: Vec<AsyncOutput> = Vec::new();

    for out_name in out_names {
        match out_name.as_str() {
            "ffplay" => {
                let stdin = spawn_ffplay(copy_ended.clone(), title, ffplay_location.clone())
                    .await?;
                outs.push(AsyncOutput::new_unreliable(Box::new(stdin)));
            }
            "out" | "stdout" => {
                outs.push(AsyncOutput::new(Box::new(io::stdout())));
            }
            "stderr" => {
                outs.push(AsyncOutput::new(Box::new(io::stderr())));
            }
            other_out => {
                const TCP_O: &str = "tcp:";
                const UNIX_O: &str = "unix:";
                if let Some(addr) = other_out.strip_prefix(TCP_O) {
                    use tokio::net::TcpStream;
                    let stream = TcpStream::connect(addr)
                        .await
                        .map_err(OutputError::TCPConnect)?;
                    outs.push(AsyncOutput::new(Box::new(stream)));
                } else if let Some(addr) = other_out.strip_prefix(UNIX_O) {
                    #[cfg(target_os = "linux")]
                    {
                        use tokio::net::UnixStream;

                        let stream = UnixStream::connect(addr)
                            .await
                            .map_err(OutputError::UnixConnect)?;
                        outs.push(AsyncOutput::new(Box::new(stream)));
                    }
                    #[cfg(not(target_os = "linux"))]
                    {
                        let _ = addr;
                        return Err(OutputError::NoUnixSocket.into());
                    }
                } else {
                    let file = File::create(other_out)
                        .await
                        .map_err(OutputError::FileCreate)?;
                    outs.push(AsyncOutput::new(Box::new(file)));
                }
            }
        }
    }

    Ok(outs)
}

pub struct AsyncOutput {
    writer: Box<dyn AsyncWrite + Unpin>,
    // unreliable outputs drop chunks instead of stalling playback
    pub reliable: bool,
}

impl AsyncOutput {
    pub fn new(writer: Box<dyn AsyncWrite + Unpin>) -> Self {
        Self {
            writer,
            reliable: true,
        }
    }
    pub fn new_unreliable(writer: Box<dyn AsyncWrite + Unpin>) -> Self {
        Self {
            writer,
            reliable: false,
        }
    }
}

/// Spawns one local copy task per output; `copy_ended` is flagged when any
/// output goes away. The copy tasks finish once their
/// sender is dropped and the channel drained.
pub fn make_out_writers(
    outs: Vec<AsyncOutput>,
    copy_ended: Rc<RefCell<bool>>,
) -> (Vec<OutputStreamSender>, Vec<JoinHandle<()>>) {
    let mut txbufs = Vec::new();
    let mut copy_tasks = Vec::new();
    for mut out in outs {
        let channel_size = 256;
        let (txbuf, rxbuf) = mpsc::channel::<Bytes>(channel_size);
        let copy_endedc = copy_ended.clone();

        txbufs.push(OutputStreamSender {
            tx: txbuf,
            reliable: out.reliable,
        });
        let task = tokio::task::spawn_local(async move {
            let res = copy_channel_to_out(rxbuf, &mut out).await;
            if let Err(err) = res {
                warn!("copy_channel_to_out err: {}", err);
            }

            debug!("copy_channel_to_out ending (flagging copy_ended)");
            *copy_endedc.borrow_mut() = true;
        });
        copy_tasks.push(task);
    }
    (txbufs, copy_tasks)
}
